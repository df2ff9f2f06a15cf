//! Deterministic fan-out over N hubs.
//!
//! The shard for a user is `hash(user_id) mod N`, stable for the process
//! lifetime, so every operation on a single user is intra-shard.  The
//! peer-disconnected broadcast is deliberately shard-local; global presence
//! questions go through `is_user_online`, which projects to the right shard.

use std::sync::Arc;
use std::time::Duration;

use chat_protocol::Envelope;
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::errors::HubError;
use crate::hub::{ClientHandle, Hub};
use crate::metrics::Metrics;
use crate::presence::PresenceService;
use crate::transfer::FileTransferService;

pub struct ShardedHub {
    hubs: Vec<Arc<Hub>>,
}

impl ShardedHub {
    pub fn new(
        shards: usize,
        transfers: Arc<FileTransferService>,
        presence: Arc<PresenceService>,
        metrics: Arc<Metrics>,
        send_timeout: Duration,
    ) -> Arc<Self> {
        let shards = shards.max(1);
        let hubs = (0..shards)
            .map(|shard_id| {
                Arc::new(Hub::new(
                    shard_id,
                    Arc::clone(&transfers),
                    Arc::clone(&presence),
                    Arc::clone(&metrics),
                    send_timeout,
                ))
            })
            .collect();
        Arc::new(Self { hubs })
    }

    /// Starts every hub's command loop.
    pub fn start(self: Arc<Self>, cancel: &CancellationToken) -> Vec<tokio::task::JoinHandle<()>> {
        self.hubs
            .iter()
            .map(|hub| {
                tokio::spawn(Arc::clone(hub).run(Arc::clone(&self), cancel.clone()))
            })
            .collect()
    }

    fn shard_for(&self, user_id: &str) -> &Arc<Hub> {
        let digest = Sha256::digest(user_id.as_bytes());
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&digest[..8]);
        let idx = (u64::from_be_bytes(prefix) % self.hubs.len() as u64) as usize;
        &self.hubs[idx]
    }

    pub async fn register(&self, handle: ClientHandle) {
        self.shard_for(&handle.user_id).register(handle).await;
    }

    pub async fn unregister(&self, conn_id: Uuid, user_id: &str) {
        self.shard_for(user_id).unregister(conn_id, user_id).await;
    }

    pub async fn is_user_online(&self, user_id: &str) -> bool {
        self.shard_for(user_id).is_user_online(user_id).await
    }

    pub async fn send_to_user(&self, user_id: &str, envelope: &Envelope) -> bool {
        self.shard_for(user_id).send_to_user(user_id, envelope).await
    }

    pub async fn send_to_user_with_timeout(
        &self,
        user_id: &str,
        envelope: &Envelope,
    ) -> Result<(), HubError> {
        self.shard_for(user_id)
            .send_to_user_with_timeout(user_id, envelope)
            .await
    }

    pub async fn connected_total(&self) -> usize {
        let mut total = 0;
        for hub in &self.hubs {
            total += hub.connected_count().await;
        }
        total
    }

    pub async fn shutdown(&self) {
        for hub in &self.hubs {
            hub.shutdown().await;
        }
    }

    pub fn shard_count(&self) -> usize {
        self.hubs.len()
    }

    #[cfg(test)]
    pub(crate) fn shard_index(&self, user_id: &str) -> usize {
        let digest = Sha256::digest(user_id.as_bytes());
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&digest[..8]);
        (u64::from_be_bytes(prefix) % self.hubs.len() as u64) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::CircuitBreaker;
    use tokio::sync::mpsc;

    fn test_presence(metrics: &Arc<Metrics>) -> Arc<PresenceService> {
        struct NoUsers;
        #[async_trait::async_trait]
        impl crate::repo::users::UserRepository for NoUsers {
            async fn find_by_id(
                &self,
                _user_id: &str,
            ) -> Result<crate::repo::users::User, crate::repo::RepoError> {
                Err(crate::repo::RepoError::NotFound)
            }
            async fn update_last_seen_batch(
                &self,
                _user_ids: &[String],
            ) -> Result<(), crate::repo::RepoError> {
                Ok(())
            }
        }
        let breaker = |name| {
            Arc::new(CircuitBreaker::new(
                name,
                5,
                Duration::from_secs(5),
                Duration::from_secs(30),
                Arc::clone(metrics),
            ))
        };
        PresenceService::start(
            Arc::new(NoUsers),
            breaker("last_seen_update"),
            breaker("user_lookup"),
            Duration::from_secs(60),
            100,
            64,
            Duration::from_secs(60),
            CancellationToken::new(),
        )
    }

    fn sharded(shards: usize) -> (Arc<ShardedHub>, CancellationToken) {
        let metrics = Arc::new(Metrics::default());
        let transfers = FileTransferService::new(Duration::from_secs(120));
        let presence = test_presence(&metrics);
        let hub = ShardedHub::new(
            shards,
            transfers,
            presence,
            metrics,
            Duration::from_millis(200),
        );
        let cancel = CancellationToken::new();
        Arc::clone(&hub).start(&cancel);
        (hub, cancel)
    }

    fn handle(user_id: &str, buf: usize) -> (ClientHandle, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(buf);
        (
            ClientHandle {
                conn_id: Uuid::new_v4(),
                user_id: user_id.to_owned(),
                username: "user".to_owned(),
                sender: tx,
                cancel: CancellationToken::new(),
            },
            rx,
        )
    }

    fn envelope(to: &str) -> Envelope {
        Envelope::new(
            chat_protocol::MessageType::Message,
            &chat_protocol::ChatMessage {
                to: to.to_owned(),
                from: Some("u-A".to_owned()),
                message_id: "m1".to_owned(),
                ciphertext: "c1".to_owned(),
                nonce: "n1".to_owned(),
                reply_to_message_id: None,
            },
        )
        .expect("envelope")
    }

    #[test]
    fn shard_projection_is_deterministic() {
        let metrics = Arc::new(Metrics::default());
        let transfers = FileTransferService::new(Duration::from_secs(120));
        // No runtime needed for pure projection.
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("rt");
        let _guard = rt.enter();
        let presence = test_presence(&metrics);
        let hub = ShardedHub::new(
            8,
            transfers,
            presence,
            metrics,
            Duration::from_millis(200),
        );
        for user in ["u-A", "u-B", "c9b1a2d4-5e6f-4a7b-8c9d-0e1f2a3b4c5d"] {
            let first = hub.shard_index(user);
            for _ in 0..10 {
                assert_eq!(hub.shard_index(user), first);
            }
            assert!(first < hub.shard_count());
        }
    }

    #[tokio::test]
    async fn register_then_send_delivers_to_buffer() {
        let (hub, cancel) = sharded(4);
        let (h, mut rx) = handle("u-B", 8);
        hub.register(h).await;
        assert!(hub.is_user_online("u-B").await);

        assert!(hub.send_to_user("u-B", &envelope("u-B")).await);
        let frame = rx.recv().await.expect("delivery");
        assert!(frame.contains(r#""message_id":"m1""#));
        cancel.cancel();
    }

    #[tokio::test]
    async fn second_registration_evicts_the_first_silently() {
        let (hub, cancel) = sharded(2);
        let (first, mut first_rx) = handle("u-A", 8);
        hub.register(first).await;

        // A bystander on the same shard must NOT see a peer_disconnected
        // for the evicted connection.
        let shard = hub.shard_index("u-A");
        let bystander_id = (0..)
            .map(|i| format!("bystander-{i}"))
            .find(|id| hub.shard_index(id) == shard)
            .expect("bystander on same shard");
        let (bystander, mut bystander_rx) = handle(&bystander_id, 8);
        hub.register(bystander).await;

        let (second, mut second_rx) = handle("u-A", 8);
        let second_conn = second.conn_id;
        hub.register(second).await;

        // First buffer is closed, map holds exactly the second connection.
        assert_eq!(first_rx.recv().await, None, "evicted buffer must close");
        assert_eq!(hub.connected_total().await, 2);

        assert!(hub.send_to_user("u-A", &envelope("u-A")).await);
        assert!(second_rx.recv().await.is_some());

        // The evicted connection's late unregister must not remove the
        // newcomer or broadcast anything.
        hub.unregister(Uuid::new_v4(), "u-A").await;
        assert!(hub.is_user_online("u-A").await);
        assert!(bystander_rx.try_recv().is_err());

        // A genuine unregister of the current connection does broadcast.
        hub.unregister(second_conn, "u-A").await;
        assert!(!hub.is_user_online("u-A").await);
        let frame = bystander_rx.recv().await.expect("peer_disconnected");
        assert!(frame.contains("peer_disconnected"), "got {frame}");
        cancel.cancel();
    }

    #[tokio::test]
    async fn concurrent_registrations_leave_one_winner() {
        let (hub, cancel) = sharded(4);
        let mut receivers = Vec::new();
        let mut tasks = Vec::new();
        for _ in 0..8 {
            let (h, rx) = handle("u-A", 8);
            receivers.push(rx);
            let hub = Arc::clone(&hub);
            tasks.push(tokio::spawn(async move { hub.register(h).await }));
        }
        for t in tasks {
            t.await.expect("register task");
        }
        assert_eq!(hub.connected_total().await, 1);

        // All but one buffer observed close.
        let mut closed = 0;
        let mut open = 0;
        for mut rx in receivers {
            match rx.try_recv() {
                Err(mpsc::error::TryRecvError::Disconnected) => closed += 1,
                _ => open += 1,
            }
        }
        assert_eq!(closed, 7);
        assert_eq!(open, 1);
        cancel.cancel();
    }

    #[tokio::test]
    async fn full_buffer_fails_try_send_and_times_out_bounded_send() {
        let (hub, cancel) = sharded(1);
        let (h, _rx) = handle("u-B", 1);
        hub.register(h).await;

        assert!(hub.send_to_user("u-B", &envelope("u-B")).await);
        // Buffer full now.
        assert!(!hub.send_to_user("u-B", &envelope("u-B")).await);
        let res = hub.send_to_user_with_timeout("u-B", &envelope("u-B")).await;
        assert_eq!(res, Err(HubError::SendTimeout("u-B".to_owned())));
        cancel.cancel();
    }

    #[tokio::test]
    async fn send_to_missing_user_reports_not_connected() {
        let (hub, cancel) = sharded(2);
        assert!(!hub.send_to_user("u-Z", &envelope("u-Z")).await);
        let res = hub.send_to_user_with_timeout("u-Z", &envelope("u-Z")).await;
        assert_eq!(res, Err(HubError::UserNotConnected("u-Z".to_owned())));
        cancel.cancel();
    }

    #[tokio::test]
    async fn shutdown_closes_every_buffer() {
        let (hub, cancel) = sharded(4);
        let (a, mut a_rx) = handle("u-A", 8);
        let (b, mut b_rx) = handle("u-B", 8);
        hub.register(a).await;
        hub.register(b).await;

        hub.shutdown().await;
        assert_eq!(hub.connected_total().await, 0);
        assert_eq!(a_rx.recv().await, None);
        assert_eq!(b_rx.recv().await, None);
        cancel.cancel();
    }
}
