//! Duplicate-suppression over a sliding TTL.
//!
//! Operations are keyed by a sha-256 fingerprint; the cache stores only the
//! outcome, never the payload.  Retrying an unexpired key replays the stored
//! outcome without re-running the operation (at-most-once forwarding).

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use sha2::{Digest, Sha256};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::errors::HubError;
use crate::metrics::Metrics;

enum Entry {
    /// First execution still running; concurrent duplicates are dropped.
    Pending { expires_at: Instant },
    Done {
        outcome: Result<(), HubError>,
        expires_at: Instant,
    },
}

impl Entry {
    fn expires_at(&self) -> Instant {
        match self {
            Self::Pending { expires_at } | Self::Done { expires_at, .. } => *expires_at,
        }
    }
}

pub struct IdempotencyTracker {
    entries: Mutex<HashMap<String, Entry>>,
    ttl: Duration,
    metrics: Arc<Metrics>,
}

impl IdempotencyTracker {
    pub fn new(ttl: Duration, metrics: Arc<Metrics>) -> Arc<Self> {
        Arc::new(Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
            metrics,
        })
    }

    /// General fingerprint: `sha256(user_id ∥ msg_type ∥ payload)`.
    pub fn key_general(user_id: &str, msg_type: &str, payload: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(user_id.as_bytes());
        hasher.update(msg_type.as_bytes());
        hasher.update(payload);
        hex::encode(hasher.finalize())
    }

    /// Message fingerprint: `sha256(user_id ∥ ':' ∥ message_id ∥ msg_type ∥ payload)`.
    pub fn key_message(
        user_id: &str,
        message_id: &str,
        msg_type: &str,
        payload: &[u8],
    ) -> String {
        let mut hasher = Sha256::new();
        hasher.update(user_id.as_bytes());
        hasher.update(b":");
        hasher.update(message_id.as_bytes());
        hasher.update(msg_type.as_bytes());
        hasher.update(payload);
        hex::encode(hasher.finalize())
    }

    /// Chunk fingerprint:
    /// `sha256(user_id ∥ ':' ∥ file_id ∥ ':' ∥ chunk_index ∥ msg_type ∥ payload)`.
    pub fn key_file_chunk(
        user_id: &str,
        file_id: &str,
        chunk_index: i32,
        msg_type: &str,
        payload: &[u8],
    ) -> String {
        let mut hasher = Sha256::new();
        hasher.update(user_id.as_bytes());
        hasher.update(b":");
        hasher.update(file_id.as_bytes());
        hasher.update(b":");
        hasher.update(chunk_index.to_string().as_bytes());
        hasher.update(msg_type.as_bytes());
        hasher.update(payload);
        hex::encode(hasher.finalize())
    }

    /// Runs `op` unless `op_id` has an unexpired entry, in which case the
    /// stored outcome is replayed and a duplicate metric recorded.  A
    /// duplicate arriving while the first execution is still in flight is
    /// dropped with `Ok(())` so parallel workers cannot double-deliver.
    pub async fn execute<F, Fut>(
        &self,
        op_id: String,
        kind: &'static str,
        op: F,
    ) -> Result<(), HubError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(), HubError>>,
    {
        {
            let now = Instant::now();
            let mut entries = self.entries.lock().expect("idempotency lock");
            match entries.get(&op_id) {
                Some(Entry::Pending { expires_at }) if *expires_at > now => {
                    self.metrics.duplicate_suppressed(kind);
                    debug!(kind, "duplicate of in-flight operation dropped");
                    return Ok(());
                }
                Some(Entry::Done {
                    outcome,
                    expires_at,
                }) if *expires_at > now => {
                    self.metrics.duplicate_suppressed(kind);
                    debug!(kind, "duplicate operation suppressed");
                    return outcome.clone();
                }
                _ => {
                    entries.insert(
                        op_id.clone(),
                        Entry::Pending {
                            expires_at: now + self.ttl,
                        },
                    );
                }
            }
        }

        let outcome = op().await;
        let mut entries = self.entries.lock().expect("idempotency lock");
        entries.insert(
            op_id,
            Entry::Done {
                outcome: outcome.clone(),
                expires_at: Instant::now() + self.ttl,
            },
        );
        outcome
    }

    fn evict_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock().expect("idempotency lock");
        let before = entries.len();
        entries.retain(|_, e| e.expires_at() > now);
        before - entries.len()
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.lock().expect("idempotency lock").len()
    }

    /// Background eviction at `ttl/2`.
    pub fn spawn_sweeper(self: Arc<Self>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let tracker = self;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(tracker.ttl / 2);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let evicted = tracker.evict_expired();
                        if evicted > 0 {
                            debug!(evicted, "idempotency entries expired");
                        }
                    }
                }
            }
        })
    }
}
