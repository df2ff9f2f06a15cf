//! Single-shard client registry.
//!
//! One task per hub owns the register/unregister command loop, so those two
//! operations are serialized with respect to each other and the
//! evict-then-insert sequence on re-registration is atomic for observers.
//! Delivery (`send_to_user`) is a non-blocking try-send into the target's
//! bounded send buffer; a full or closed buffer is never allowed to block
//! unrelated recipients.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chat_protocol::{Envelope, MessageType, PeerRef};
use tokio::sync::mpsc::error::{SendTimeoutError, TrySendError};
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::errors::HubError;
use crate::metrics::Metrics;
use crate::presence::PresenceService;
use crate::sharded::ShardedHub;
use crate::transfer::{failed_complete_envelope, FileTransferService};

/// The hub-side view of one authenticated connection.
///
/// Holds the sole Sender of the client's send buffer: removing the handle
/// from the map closes the buffer, which makes the write pump exit and the
/// socket close.
#[derive(Debug)]
pub struct ClientHandle {
    pub conn_id: Uuid,
    pub user_id: String,
    pub username: String,
    pub sender: mpsc::Sender<String>,
    pub cancel: CancellationToken,
}

enum HubCommand {
    Register {
        handle: ClientHandle,
        done: oneshot::Sender<()>,
    },
    Unregister {
        conn_id: Uuid,
        user_id: String,
        done: oneshot::Sender<()>,
    },
}

pub struct Hub {
    shard_id: usize,
    clients: RwLock<HashMap<String, ClientHandle>>,
    cmd_tx: mpsc::Sender<HubCommand>,
    cmd_rx: std::sync::Mutex<Option<mpsc::Receiver<HubCommand>>>,
    transfers: Arc<FileTransferService>,
    presence: Arc<PresenceService>,
    metrics: Arc<Metrics>,
    send_timeout: Duration,
}

impl Hub {
    pub fn new(
        shard_id: usize,
        transfers: Arc<FileTransferService>,
        presence: Arc<PresenceService>,
        metrics: Arc<Metrics>,
        send_timeout: Duration,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        Self {
            shard_id,
            clients: RwLock::new(HashMap::new()),
            cmd_tx,
            cmd_rx: std::sync::Mutex::new(Some(cmd_rx)),
            transfers,
            presence,
            metrics,
            send_timeout,
        }
    }

    /// Registers an authenticated connection, evicting any prior connection
    /// for the same user.  Resolves once the registration is visible.
    pub async fn register(&self, handle: ClientHandle) {
        let (done, ack) = oneshot::channel();
        if self
            .cmd_tx
            .send(HubCommand::Register { handle, done })
            .await
            .is_err()
        {
            warn!(shard = self.shard_id, "hub loop gone, dropping registration");
            return;
        }
        let _ = ack.await;
    }

    /// Removes the connection iff it is still the registered one for this
    /// user (an evicted connection's late unregister is a no-op).
    pub async fn unregister(&self, conn_id: Uuid, user_id: &str) {
        let (done, ack) = oneshot::channel();
        if self
            .cmd_tx
            .send(HubCommand::Unregister {
                conn_id,
                user_id: user_id.to_owned(),
                done,
            })
            .await
            .is_err()
        {
            return;
        }
        let _ = ack.await;
    }

    /// The register/unregister loop.  `peers` is the sharded view used to
    /// reach transfer peers that live on other shards.
    pub async fn run(self: Arc<Self>, peers: Arc<ShardedHub>, cancel: CancellationToken) {
        let mut cmd_rx = self
            .cmd_rx
            .lock()
            .expect("hub lock")
            .take()
            .expect("hub run loop started twice");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.shutdown().await;
                    break;
                }
                maybe = cmd_rx.recv() => {
                    match maybe {
                        Some(HubCommand::Register { handle, done }) => {
                            self.handle_register(handle).await;
                            let _ = done.send(());
                        }
                        Some(HubCommand::Unregister { conn_id, user_id, done }) => {
                            self.handle_unregister(conn_id, &user_id, &peers).await;
                            let _ = done.send(());
                        }
                        None => break,
                    }
                }
            }
        }
    }

    async fn handle_register(&self, handle: ClientHandle) {
        let user_id = handle.user_id.clone();
        let evicted = {
            let mut clients = self.clients.write().await;
            clients.insert(user_id.clone(), handle)
        };
        match evicted {
            // Dropping the old handle closes its send buffer; the old
            // connection tears itself down and its unregister no-ops.
            Some(old) => {
                info!(shard = self.shard_id, user_id = %user_id, old_conn = %old.conn_id,
                    "evicting prior connection on re-register");
            }
            None => self.metrics.user_registered(),
        }
        self.presence.update_last_seen_debounced(&user_id);
    }

    async fn handle_unregister(&self, conn_id: Uuid, user_id: &str, peers: &Arc<ShardedHub>) {
        {
            let mut clients = self.clients.write().await;
            match clients.get(user_id) {
                Some(current) if current.conn_id == conn_id => {
                    clients.remove(user_id);
                }
                _ => return,
            }
        }
        self.metrics.user_unregistered();
        info!(shard = self.shard_id, user_id = %user_id, "client unregistered");

        self.broadcast_peer_disconnected(user_id).await;

        // Fail the user's in-flight transfers toward the surviving peers.
        for transfer in self.transfers.take_transfers_for_user(user_id) {
            let peer = transfer.peer_of(user_id).to_owned();
            let mut notice = transfer.clone();
            notice.to = peer.clone();
            match failed_complete_envelope(&notice) {
                Ok(env) => {
                    if !peers.send_to_user(&peer, &env).await {
                        debug!(file_id = %transfer.file_id, peer = %peer,
                            "transfer peer offline, failure notice dropped");
                    }
                }
                Err(e) => warn!(error = %e, "failed to build transfer-failure notice"),
            }
        }
    }

    async fn broadcast_peer_disconnected(&self, user_id: &str) {
        let env = match Envelope::new(
            MessageType::PeerDisconnected,
            &PeerRef {
                peer_id: user_id.to_owned(),
            },
        )
        .and_then(|e| e.to_json())
        {
            Ok(json) => json,
            Err(e) => {
                warn!(error = %e, "failed to marshal peer_disconnected");
                return;
            }
        };
        let clients = self.clients.read().await;
        for (peer_id, handle) in clients.iter() {
            if peer_id == user_id {
                continue;
            }
            if let Err(TrySendError::Full(_)) = handle.sender.try_send(env.clone()) {
                self.metrics.message_dropped();
            }
        }
    }

    pub async fn is_user_online(&self, user_id: &str) -> bool {
        self.clients.read().await.contains_key(user_id)
    }

    /// Non-blocking delivery; false when the user is not connected, the
    /// buffer is full, or the envelope does not marshal.
    pub async fn send_to_user(&self, user_id: &str, envelope: &Envelope) -> bool {
        let json = match envelope.to_json() {
            Ok(json) => json,
            Err(e) => {
                warn!(error = %e, "failed to marshal envelope");
                return false;
            }
        };
        let clients = self.clients.read().await;
        let Some(handle) = clients.get(user_id) else {
            return false;
        };
        match handle.sender.try_send(json) {
            Ok(()) => true,
            Err(_) => {
                self.metrics.message_dropped();
                false
            }
        }
    }

    /// Delivery observing the configured send timeout.
    pub async fn send_to_user_with_timeout(
        &self,
        user_id: &str,
        envelope: &Envelope,
    ) -> Result<(), HubError> {
        let json = envelope.to_json().map_err(HubError::from)?;
        let sender = {
            let clients = self.clients.read().await;
            clients.get(user_id).map(|h| h.sender.clone())
        };
        let Some(sender) = sender else {
            return Err(HubError::UserNotConnected(user_id.to_owned()));
        };
        match sender.send_timeout(json, self.send_timeout).await {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Timeout(_)) => {
                self.metrics.send_timeout();
                Err(HubError::SendTimeout(user_id.to_owned()))
            }
            // Buffer closed under us: the client was evicted or shut down.
            Err(SendTimeoutError::Closed(_)) => {
                Err(HubError::UserNotConnected(user_id.to_owned()))
            }
        }
    }

    pub async fn connected_count(&self) -> usize {
        self.clients.read().await.len()
    }

    /// Closes every send buffer and empties the map.
    pub async fn shutdown(&self) {
        let mut clients = self.clients.write().await;
        let drained = clients.drain().count();
        if drained > 0 {
            info!(shard = self.shard_id, count = drained, "hub shut down");
        }
    }
}
