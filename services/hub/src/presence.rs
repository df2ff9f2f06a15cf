//! Presence side effects: debounced, batched last-seen writes and the
//! TTL-cached user-existence check used for types that do not require the
//! target to be online.
//!
//! A single flusher task drains the bounded queue into a pending set and
//! writes one `update_last_seen_batch` per flush, through the circuit
//! breaker.  An open breaker skips the flush (recorded, dropped) rather
//! than queueing unbounded work behind a failing database.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::breaker::{BreakerError, CircuitBreaker};
use crate::errors::HubError;
use crate::repo::users::UserRepository;

const FLUSH_INTERVAL: Duration = Duration::from_secs(5);

struct ExistsEntry {
    exists: bool,
    cached_at: Instant,
}

pub struct PresenceService {
    users: Arc<dyn UserRepository>,
    flush_breaker: Arc<CircuitBreaker>,
    lookup_breaker: Arc<CircuitBreaker>,
    update_interval: Duration,
    debounce: Mutex<HashMap<String, Instant>>,
    queue_tx: mpsc::Sender<String>,
    exists_cache: Mutex<HashMap<String, ExistsEntry>>,
    exists_ttl: Duration,
}

impl PresenceService {
    /// Builds the service and starts its flusher task.
    pub fn start(
        users: Arc<dyn UserRepository>,
        flush_breaker: Arc<CircuitBreaker>,
        lookup_breaker: Arc<CircuitBreaker>,
        update_interval: Duration,
        batch_size: usize,
        queue_size: usize,
        exists_ttl: Duration,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let (queue_tx, queue_rx) = mpsc::channel(queue_size);
        let service = Arc::new(Self {
            users,
            flush_breaker,
            lookup_breaker,
            update_interval,
            debounce: Mutex::new(HashMap::new()),
            queue_tx,
            exists_cache: Mutex::new(HashMap::new()),
            exists_ttl,
        });
        tokio::spawn(Self::run_flusher(
            Arc::clone(&service),
            queue_rx,
            batch_size,
            cancel,
        ));
        service
    }

    /// Non-blocking; duplicate activity inside the debounce window is
    /// dropped before it reaches the queue.
    pub fn update_last_seen_debounced(&self, user_id: &str) {
        let now = Instant::now();
        {
            let mut debounce = self.debounce.lock().expect("presence lock");
            if let Some(last) = debounce.get(user_id) {
                if now.duration_since(*last) < self.update_interval {
                    return;
                }
            }
            debounce.insert(user_id.to_owned(), now);
        }
        if self.queue_tx.try_send(user_id.to_owned()).is_err() {
            debug!(user_id, "presence queue full, dropping last-seen update");
        }
    }

    /// TTL-cached existence check backed by the user repository.
    pub async fn check_user_exists(&self, user_id: &str) -> Result<bool, HubError> {
        {
            let cache = self.exists_cache.lock().expect("presence lock");
            if let Some(entry) = cache.get(user_id) {
                if Instant::now().duration_since(entry.cached_at) < self.exists_ttl {
                    return Ok(entry.exists);
                }
            }
        }

        let exists = match self
            .lookup_breaker
            .call(|| self.users.find_by_id(user_id))
            .await
        {
            Ok(_) => true,
            Err(BreakerError::Repo(e)) if e.is_not_found() => false,
            Err(BreakerError::Open(name)) => return Err(HubError::CircuitOpen(name.to_owned())),
            Err(e) => return Err(HubError::Internal(e.to_string())),
        };

        let mut cache = self.exists_cache.lock().expect("presence lock");
        cache.insert(
            user_id.to_owned(),
            ExistsEntry {
                exists,
                cached_at: Instant::now(),
            },
        );
        Ok(exists)
    }

    async fn run_flusher(
        service: Arc<Self>,
        mut queue_rx: mpsc::Receiver<String>,
        batch_size: usize,
        cancel: CancellationToken,
    ) {
        let mut pending: HashSet<String> = HashSet::new();
        let mut ticker = tokio::time::interval(FLUSH_INTERVAL);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    // Shutdown: take whatever is still queued along.
                    while let Ok(id) = queue_rx.try_recv() {
                        pending.insert(id);
                    }
                    service.flush(&mut pending).await;
                    break;
                }
                maybe = queue_rx.recv() => {
                    match maybe {
                        Some(id) => {
                            pending.insert(id);
                            if pending.len() >= batch_size {
                                service.flush(&mut pending).await;
                            }
                        }
                        None => {
                            service.flush(&mut pending).await;
                            break;
                        }
                    }
                }
                _ = ticker.tick() => {
                    service.flush(&mut pending).await;
                }
            }
        }
    }

    async fn flush(&self, pending: &mut HashSet<String>) {
        if pending.is_empty() {
            return;
        }
        let ids: Vec<String> = pending.drain().collect();
        let count = ids.len();
        let result = self
            .flush_breaker
            .call_or_else(
                || self.users.update_last_seen_batch(&ids),
                // Open breaker: record and drop the batch.
                || debug!(count, "last-seen batch dropped, circuit open"),
            )
            .await;
        match result {
            Ok(()) => debug!(count, "flushed last-seen batch"),
            Err(e) => warn!(error = %e, count, "last-seen batch failed"),
        }
    }
}
