use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::auth::{RevokedTokenChecker, TokenVerifier};
use crate::breaker::CircuitBreaker;
use crate::config::HubConfig;
use crate::idempotency::IdempotencyTracker;
use crate::metrics::Metrics;
use crate::presence::PresenceService;
use crate::processor::Processor;
use crate::repo::identity::IdentityService;
use crate::repo::users::UserRepository;
use crate::router::MessageRouter;
use crate::sharded::ShardedHub;
use crate::transfer::{self, FileTransferService};
use crate::validator::MessageValidator;

/// External collaborators behind their seams; `main` wires Postgres
/// adapters, tests wire in-memory fakes.
pub struct Collaborators {
    pub users: Arc<dyn UserRepository>,
    pub verifier: Arc<dyn TokenVerifier>,
    pub revoked: Arc<dyn RevokedTokenChecker>,
    pub identity: Arc<dyn IdentityService>,
}

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<HubConfig>,
    pub hub: Arc<ShardedHub>,
    pub processor: Arc<Processor>,
    pub presence: Arc<PresenceService>,
    pub transfers: Arc<FileTransferService>,
    pub idempotency: Arc<IdempotencyTracker>,
    pub verifier: Arc<dyn TokenVerifier>,
    pub revoked: Arc<dyn RevokedTokenChecker>,
    pub identity: Arc<dyn IdentityService>,
    pub auth_breaker: Arc<CircuitBreaker>,
    pub metrics: Arc<Metrics>,
    pub cancel: CancellationToken,
}

impl AppState {
    /// Builds the full routing core and starts its background tasks (hub
    /// loops, processor workers, sweepers, presence flusher).  Must run
    /// inside a tokio runtime.
    pub fn new(config: HubConfig, collaborators: Collaborators) -> Self {
        let config = Arc::new(config);
        let metrics = Arc::new(Metrics::default());
        let cancel = CancellationToken::new();

        let breaker = |name: &'static str| {
            Arc::new(CircuitBreaker::new(
                name,
                config.circuit_breaker_threshold,
                config.circuit_breaker_timeout,
                config.circuit_breaker_reset,
                Arc::clone(&metrics),
            ))
        };

        let presence = PresenceService::start(
            collaborators.users,
            breaker("last_seen_update"),
            breaker("user_lookup"),
            config.last_seen_update_interval,
            config.last_seen_batch_size,
            config.presence_queue_size,
            config.user_exists_cache_ttl,
            cancel.clone(),
        );
        let transfers = FileTransferService::new(config.file_transfer_timeout);
        let hub = ShardedHub::new(
            config.effective_shards(),
            Arc::clone(&transfers),
            Arc::clone(&presence),
            Arc::clone(&metrics),
            config.send_timeout,
        );
        Arc::clone(&hub).start(&cancel);

        let idempotency = IdempotencyTracker::new(config.idempotency_ttl, Arc::clone(&metrics));
        Arc::clone(&idempotency).spawn_sweeper(cancel.clone());
        transfer::spawn_stale_sweeper(Arc::clone(&transfers), Arc::clone(&hub), cancel.clone());

        let router = MessageRouter::new(
            Arc::clone(&hub),
            MessageValidator::new(config.max_file_size, config.max_voice_size),
            Arc::clone(&transfers),
            Arc::clone(&presence),
            Arc::clone(&idempotency),
            Arc::clone(&metrics),
            config.debug_sample_rate,
        );
        let processor = Processor::start(
            router,
            config.processor_workers,
            config.processor_queue_size,
            config.processor_task_timeout,
            Arc::clone(&metrics),
            cancel.clone(),
        );

        let auth_breaker = breaker("token_revocation");

        Self {
            config,
            hub,
            processor,
            presence,
            transfers,
            idempotency,
            verifier: collaborators.verifier,
            revoked: collaborators.revoked,
            identity: collaborators.identity,
            auth_breaker,
            metrics,
            cancel,
        }
    }

    /// Graceful shutdown: closes the processor queue (workers drain what is
    /// left), stops background tasks (the presence flusher writes its final
    /// batch) and closes every send buffer, which cascades through the
    /// write pumps to the sockets.
    pub async fn shutdown(&self) {
        self.processor.shutdown();
        self.cancel.cancel();
        self.hub.shutdown().await;
    }
}
