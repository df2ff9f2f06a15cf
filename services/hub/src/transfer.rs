//! In-flight chunked-transfer tracking.
//!
//! One record per file id while chunks are moving.  Progress is monotonic;
//! a transfer with no chunk activity for `transfer_timeout` is stale and
//! gets swept, with the recipient told via a synthetic failed
//! `file_complete`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chat_protocol::{Envelope, FileComplete, MessageType};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::errors::HubError;
use crate::sharded::ShardedHub;

#[derive(Debug, Clone, PartialEq)]
pub struct FileTransfer {
    pub file_id: String,
    pub from: String,
    pub to: String,
    pub started_at: Instant,
    pub last_chunk_at: Instant,
    pub received_chunks: i32,
    pub total_chunks: i32,
}

impl FileTransfer {
    /// The endpoint that survives when `leaving` disconnects.
    pub fn peer_of(&self, leaving: &str) -> &str {
        if self.from == leaving {
            &self.to
        } else {
            &self.from
        }
    }
}

/// Request to begin tracking; taken from a validated `file_start`.
#[derive(Debug, Clone)]
pub struct TrackRequest {
    pub file_id: String,
    pub from: String,
    pub to: String,
    pub total_chunks: i32,
}

pub struct FileTransferService {
    transfers: Mutex<HashMap<String, FileTransfer>>,
    transfer_timeout: Duration,
}

impl FileTransferService {
    pub fn new(transfer_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            transfers: Mutex::new(HashMap::new()),
            transfer_timeout,
        })
    }

    pub fn track(&self, req: TrackRequest) -> Result<(), HubError> {
        let mut transfers = self.transfers.lock().expect("transfer lock");
        if transfers.contains_key(&req.file_id) {
            return Err(HubError::TransferAlreadyExists(req.file_id));
        }
        let now = Instant::now();
        transfers.insert(
            req.file_id.clone(),
            FileTransfer {
                file_id: req.file_id,
                from: req.from,
                to: req.to,
                started_at: now,
                last_chunk_at: now,
                received_chunks: 0,
                total_chunks: req.total_chunks,
            },
        );
        Ok(())
    }

    pub fn update_progress(&self, file_id: &str, chunk_index: i32) -> Result<(), HubError> {
        let mut transfers = self.transfers.lock().expect("transfer lock");
        let transfer = transfers
            .get_mut(file_id)
            .ok_or_else(|| HubError::TransferNotFound(file_id.to_owned()))?;
        if chunk_index < 0 || chunk_index >= transfer.total_chunks {
            return Err(HubError::InvalidChunkIndex {
                index: chunk_index,
                total: transfer.total_chunks,
            });
        }
        // Monotonic: a retransmitted earlier chunk never rolls progress back.
        transfer.received_chunks = transfer.received_chunks.max(chunk_index + 1);
        transfer.last_chunk_at = Instant::now();
        Ok(())
    }

    pub fn complete(&self, file_id: &str) -> Result<FileTransfer, HubError> {
        let mut transfers = self.transfers.lock().expect("transfer lock");
        transfers
            .remove(file_id)
            .ok_or_else(|| HubError::TransferNotFound(file_id.to_owned()))
    }

    pub fn transfers_for_user(&self, user_id: &str) -> Vec<FileTransfer> {
        let transfers = self.transfers.lock().expect("transfer lock");
        transfers
            .values()
            .filter(|t| t.from == user_id || t.to == user_id)
            .cloned()
            .collect()
    }

    /// Removes and returns every transfer the user participates in; called
    /// on disconnect so each can be reported to the surviving peer.
    pub fn take_transfers_for_user(&self, user_id: &str) -> Vec<FileTransfer> {
        let mut transfers = self.transfers.lock().expect("transfer lock");
        let ids: Vec<String> = transfers
            .values()
            .filter(|t| t.from == user_id || t.to == user_id)
            .map(|t| t.file_id.clone())
            .collect();
        ids.iter()
            .filter_map(|id| transfers.remove(id))
            .collect()
    }

    /// Removes and returns transfers with no chunk activity inside the
    /// timeout window.
    pub fn cleanup_stale(&self) -> Vec<FileTransfer> {
        let now = Instant::now();
        let mut transfers = self.transfers.lock().expect("transfer lock");
        let stale: Vec<String> = transfers
            .values()
            .filter(|t| now.duration_since(t.last_chunk_at) > self.transfer_timeout)
            .map(|t| t.file_id.clone())
            .collect();
        stale
            .iter()
            .filter_map(|id| transfers.remove(id))
            .collect()
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.transfers.lock().expect("transfer lock").len()
    }
}

/// Synthetic `file_complete` carrying the failure marker.
pub fn failed_complete_envelope(transfer: &FileTransfer) -> Result<Envelope, HubError> {
    Envelope::new(
        MessageType::FileComplete,
        &FileComplete {
            to: transfer.to.clone(),
            from: Some(transfer.from.clone()),
            file_id: transfer.file_id.clone(),
            failed: Some(true),
        },
    )
    .map_err(HubError::from)
}

/// Periodic staleness sweep; stale transfers are reported to their
/// recipients through the hub.
pub fn spawn_stale_sweeper(
    service: Arc<FileTransferService>,
    hub: Arc<ShardedHub>,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(service.transfer_timeout / 2);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let stale = service.cleanup_stale();
                    if stale.is_empty() {
                        continue;
                    }
                    info!(count = stale.len(), "removed stale file transfers");
                    for transfer in &stale {
                        match failed_complete_envelope(transfer) {
                            Ok(env) => {
                                if !hub.send_to_user(&transfer.to, &env).await {
                                    debug!(file_id = %transfer.file_id, "stale-transfer recipient offline");
                                }
                            }
                            Err(e) => warn!(error = %e, "failed to build stale-transfer notice"),
                        }
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> Arc<FileTransferService> {
        FileTransferService::new(Duration::from_secs(120))
    }

    fn req(file_id: &str) -> TrackRequest {
        TrackRequest {
            file_id: file_id.to_owned(),
            from: "u-A".to_owned(),
            to: "u-B".to_owned(),
            total_chunks: 3,
        }
    }

    #[tokio::test]
    async fn track_rejects_duplicate_file_id() {
        let s = service();
        s.track(req("f1")).expect("first track");
        assert_eq!(
            s.track(req("f1")),
            Err(HubError::TransferAlreadyExists("f1".to_owned()))
        );
    }

    #[tokio::test]
    async fn progress_is_monotonic_and_bounded() {
        let s = service();
        s.track(req("f1")).expect("track");

        s.update_progress("f1", 1).expect("chunk 1");
        let t = &s.transfers_for_user("u-A")[0];
        assert_eq!(t.received_chunks, 2);

        // Retransmit of chunk 0 must not roll back.
        s.update_progress("f1", 0).expect("chunk 0 retransmit");
        let t = &s.transfers_for_user("u-A")[0];
        assert_eq!(t.received_chunks, 2);

        assert_eq!(
            s.update_progress("f1", 3),
            Err(HubError::InvalidChunkIndex { index: 3, total: 3 })
        );
        assert_eq!(
            s.update_progress("f1", -1),
            Err(HubError::InvalidChunkIndex { index: -1, total: 3 })
        );
        assert_eq!(
            s.update_progress("f9", 0),
            Err(HubError::TransferNotFound("f9".to_owned()))
        );
    }

    #[tokio::test]
    async fn complete_removes_the_record() {
        let s = service();
        s.track(req("f1")).expect("track");
        s.complete("f1").expect("complete");
        assert!(s.transfers_for_user("u-A").is_empty());
        assert_eq!(
            s.complete("f1"),
            Err(HubError::TransferNotFound("f1".to_owned()))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn stale_transfers_are_swept_active_ones_kept() {
        let s = FileTransferService::new(Duration::from_secs(60));
        s.track(req("f1")).expect("track f1");

        tokio::time::advance(Duration::from_secs(45)).await;
        let mut fresh = req("f2");
        fresh.from = "u-C".to_owned();
        s.track(fresh).expect("track f2");

        tokio::time::advance(Duration::from_secs(20)).await;
        let stale = s.cleanup_stale();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].file_id, "f1");
        assert_eq!(s.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn chunk_activity_defers_staleness() {
        let s = FileTransferService::new(Duration::from_secs(60));
        s.track(req("f1")).expect("track");
        tokio::time::advance(Duration::from_secs(45)).await;
        s.update_progress("f1", 0).expect("chunk");
        tokio::time::advance(Duration::from_secs(45)).await;
        assert!(s.cleanup_stale().is_empty());
    }

    #[tokio::test]
    async fn disconnect_drain_returns_both_directions() {
        let s = service();
        s.track(req("f1")).expect("outgoing");
        let mut incoming = req("f2");
        incoming.from = "u-B".to_owned();
        incoming.to = "u-A".to_owned();
        s.track(incoming).expect("incoming");
        let mut unrelated = req("f3");
        unrelated.from = "u-C".to_owned();
        unrelated.to = "u-D".to_owned();
        s.track(unrelated).expect("unrelated");

        let drained = s.take_transfers_for_user("u-A");
        assert_eq!(drained.len(), 2);
        assert_eq!(s.len(), 1);
        for t in &drained {
            assert_eq!(t.peer_of("u-A"), "u-B");
        }
    }

    #[test]
    fn failed_complete_envelope_targets_recipient() {
        let transfer = FileTransfer {
            file_id: "f1".to_owned(),
            from: "u-A".to_owned(),
            to: "u-B".to_owned(),
            started_at: Instant::now(),
            last_chunk_at: Instant::now(),
            received_chunks: 1,
            total_chunks: 3,
        };
        let env = failed_complete_envelope(&transfer).expect("envelope");
        assert_eq!(env.message_type, MessageType::FileComplete);
        let body: FileComplete = env.decode_payload().expect("decode");
        assert_eq!(body.to, "u-B");
        assert_eq!(body.failed, Some(true));
    }
}
