//! Typed routing of inbound envelopes.
//!
//! The router owns the forward algorithm: decode the per-type record,
//! validate the target, stamp `from` with the sender's authenticated id,
//! run per-type side effects (validation, transfer tracking, idempotent
//! retry suppression) and hand the envelope to the hub.  Validation
//! failures answer the sender with an `error` envelope and keep the
//! connection open; an offline target answers with `peer_offline`.

use std::sync::Arc;

use chat_protocol::{
    is_valid_user_id, Ack, ChatMessage, Envelope, EphemeralKey, ErrorBody, FileChunk,
    FileComplete, FileStart, MessageDelete, MessageEdit, MessageRead, MessageType, PeerRef,
    Reaction, SessionEstablished, Typing,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use crate::errors::HubError;
use crate::idempotency::IdempotencyTracker;
use crate::metrics::Metrics;
use crate::presence::PresenceService;
use crate::sharded::ShardedHub;
use crate::transfer::{FileTransferService, TrackRequest};
use crate::validator::MessageValidator;

/// A payload that is forwarded with `from` stamped by the router.
trait RoutedPayload: DeserializeOwned + Serialize {
    fn target(&self) -> &str;
    fn set_from(&mut self, from: &str);
    /// Retry-suppression key; None opts the type out of idempotency.
    fn idempotency_key(&self, sender_id: &str, msg_type: &str, raw: &[u8]) -> Option<String> {
        Some(IdempotencyTracker::key_general(sender_id, msg_type, raw))
    }
}

macro_rules! routed_payload {
    ($ty:ty) => {
        impl RoutedPayload for $ty {
            fn target(&self) -> &str {
                &self.to
            }
            fn set_from(&mut self, from: &str) {
                self.from = Some(from.to_owned());
            }
        }
    };
}

routed_payload!(EphemeralKey);
routed_payload!(Reaction);
routed_payload!(MessageDelete);
routed_payload!(MessageEdit);
routed_payload!(MessageRead);
// The file types go through dedicated handlers for their tracker side
// effects, but share the same `from` stamping.
routed_payload!(FileStart);
routed_payload!(FileChunk);
routed_payload!(FileComplete);

impl RoutedPayload for ChatMessage {
    fn target(&self) -> &str {
        &self.to
    }
    fn set_from(&mut self, from: &str) {
        self.from = Some(from.to_owned());
    }
    fn idempotency_key(&self, sender_id: &str, msg_type: &str, raw: &[u8]) -> Option<String> {
        Some(IdempotencyTracker::key_message(
            sender_id,
            &self.message_id,
            msg_type,
            raw,
        ))
    }
}

impl RoutedPayload for Typing {
    fn target(&self) -> &str {
        &self.to
    }
    fn set_from(&mut self, from: &str) {
        self.from = Some(from.to_owned());
    }
    // Typing indicators repeat legitimately; never suppress them.
    fn idempotency_key(&self, _sender_id: &str, _msg_type: &str, _raw: &[u8]) -> Option<String> {
        None
    }
}

pub struct MessageRouter {
    hub: Arc<ShardedHub>,
    validator: MessageValidator,
    transfers: Arc<FileTransferService>,
    presence: Arc<PresenceService>,
    idempotency: Arc<IdempotencyTracker>,
    metrics: Arc<Metrics>,
    debug_sample_rate: f64,
}

impl MessageRouter {
    pub fn new(
        hub: Arc<ShardedHub>,
        validator: MessageValidator,
        transfers: Arc<FileTransferService>,
        presence: Arc<PresenceService>,
        idempotency: Arc<IdempotencyTracker>,
        metrics: Arc<Metrics>,
        debug_sample_rate: f64,
    ) -> Arc<Self> {
        Arc::new(Self {
            hub,
            validator,
            transfers,
            presence,
            idempotency,
            metrics,
            debug_sample_rate,
        })
    }

    /// Routes one envelope from an authenticated sender.  Validation-class
    /// failures are answered in-band; the error is still returned so the
    /// processor can record it.
    pub async fn route(&self, sender_id: &str, envelope: Envelope) -> Result<(), HubError> {
        if self.sampled() {
            debug!(sender = sender_id, message_type = %envelope.message_type, "routing envelope");
        }
        let result = self.dispatch(sender_id, envelope).await;
        if let Err(e) = &result {
            if matches!(e, HubError::InvalidPayload(_)) {
                self.metrics.invalid_payload();
            }
            if e.reportable() {
                self.send_error(sender_id, e).await;
            }
        }
        result
    }

    async fn dispatch(&self, sender_id: &str, envelope: Envelope) -> Result<(), HubError> {
        match envelope.message_type {
            MessageType::EphemeralKey => self.relay::<EphemeralKey>(sender_id, envelope).await,
            MessageType::Message => self.relay::<ChatMessage>(sender_id, envelope).await,
            MessageType::Typing => self.relay::<Typing>(sender_id, envelope).await,
            MessageType::Reaction => self.relay::<Reaction>(sender_id, envelope).await,
            MessageType::MessageDelete => self.relay::<MessageDelete>(sender_id, envelope).await,
            MessageType::MessageEdit => self.relay::<MessageEdit>(sender_id, envelope).await,
            MessageType::MessageRead => self.relay::<MessageRead>(sender_id, envelope).await,
            MessageType::SessionEstablished => {
                self.route_session_established(sender_id, envelope).await
            }
            MessageType::Ack => self.route_ack(sender_id, envelope).await,
            MessageType::FileStart => self.route_file_start(sender_id, envelope).await,
            MessageType::FileChunk => self.route_file_chunk(sender_id, envelope).await,
            MessageType::FileComplete => self.route_file_complete(sender_id, envelope).await,
            // Server-originated or unrecognized types are not routable.
            MessageType::Auth
            | MessageType::PeerOffline
            | MessageType::PeerDisconnected
            | MessageType::Error
            | MessageType::Unknown => Err(HubError::UnknownMessageType(
                envelope.message_type.as_str().to_owned(),
            )),
        }
    }

    /// The common path for types that only need `from` stamped.
    async fn relay<P: RoutedPayload>(
        &self,
        sender_id: &str,
        mut envelope: Envelope,
    ) -> Result<(), HubError> {
        let raw = serde_json::to_vec(&envelope.payload)?;
        let mut body: P = self.decode(&envelope)?;
        let Some(to) = self.resolve_target(sender_id, body.target())? else {
            return Ok(());
        };
        let msg_type = envelope.message_type;
        let key = body.idempotency_key(sender_id, msg_type.as_str(), &raw);
        body.set_from(sender_id);
        envelope.replace_payload(&body)?;
        match key {
            Some(key) => {
                self.idempotency
                    .execute(key, msg_type.as_str(), || {
                        self.deliver_online_required(sender_id, to, envelope)
                    })
                    .await
            }
            None => self.deliver_online_required(sender_id, to, envelope).await,
        }
    }

    /// Requires the target to exist (TTL-cached), not to be online; unknown
    /// targets are dropped silently, with no `from` mutation either way.
    async fn route_session_established(
        &self,
        sender_id: &str,
        envelope: Envelope,
    ) -> Result<(), HubError> {
        let body: SessionEstablished = self.decode(&envelope)?;
        let Some(to) = self.resolve_target(sender_id, &body.to)? else {
            return Ok(());
        };
        if !self.presence.check_user_exists(&to).await? {
            debug!(to = %to, "session_established target does not exist, dropped");
            self.metrics.message_dropped();
            return Ok(());
        }
        self.send_best_effort(&to, &envelope).await;
        Ok(())
    }

    /// Only the empty/self rules apply; delivery is best-effort.
    async fn route_ack(&self, sender_id: &str, envelope: Envelope) -> Result<(), HubError> {
        let body: Ack = self.decode(&envelope)?;
        let Some(to) = self.resolve_target(sender_id, &body.to)? else {
            return Ok(());
        };
        self.send_best_effort(&to, &envelope).await;
        Ok(())
    }

    async fn route_file_start(&self, sender_id: &str, envelope: Envelope) -> Result<(), HubError> {
        let raw = serde_json::to_vec(&envelope.payload)?;
        let mut body: FileStart = self.decode(&envelope)?;
        let Some(to) = self.resolve_target(sender_id, &body.to)? else {
            return Ok(());
        };
        self.validator.validate_file_start(&body)?;

        let key = IdempotencyTracker::key_general(sender_id, "file_start", &raw);
        body.set_from(sender_id);
        let req = TrackRequest {
            file_id: body.file_id.clone(),
            from: sender_id.to_owned(),
            to: to.clone(),
            total_chunks: body.total_chunks,
        };
        let mut out = envelope;
        out.replace_payload(&body)?;
        self.idempotency
            .execute(key, "file_start", || async move {
                if !self.hub.is_user_online(&to).await {
                    self.notify_peer_offline(sender_id, &to).await;
                    return Ok(());
                }
                self.transfers.track(req)?;
                self.send_routed(sender_id, &to, &out).await
            })
            .await
    }

    async fn route_file_chunk(&self, sender_id: &str, envelope: Envelope) -> Result<(), HubError> {
        let raw = serde_json::to_vec(&envelope.payload)?;
        let mut body: FileChunk = self.decode(&envelope)?;
        let Some(to) = self.resolve_target(sender_id, &body.to)? else {
            return Ok(());
        };
        let key = IdempotencyTracker::key_file_chunk(
            sender_id,
            &body.file_id,
            body.chunk_index,
            "file_chunk",
            &raw,
        );
        let file_id = body.file_id.clone();
        let chunk_index = body.chunk_index;
        body.set_from(sender_id);
        let mut out = envelope;
        out.replace_payload(&body)?;
        self.idempotency
            .execute(key, "file_chunk", || async move {
                if !self.hub.is_user_online(&to).await {
                    self.notify_peer_offline(sender_id, &to).await;
                    return Ok(());
                }
                self.transfers.update_progress(&file_id, chunk_index)?;
                self.send_routed(sender_id, &to, &out).await
            })
            .await
    }

    async fn route_file_complete(
        &self,
        sender_id: &str,
        envelope: Envelope,
    ) -> Result<(), HubError> {
        let raw = serde_json::to_vec(&envelope.payload)?;
        let mut body: FileComplete = self.decode(&envelope)?;
        let Some(to) = self.resolve_target(sender_id, &body.to)? else {
            return Ok(());
        };
        let key = IdempotencyTracker::key_general(sender_id, "file_complete", &raw);
        let file_id = body.file_id.clone();
        body.set_from(sender_id);
        let mut out = envelope;
        out.replace_payload(&body)?;
        self.idempotency
            .execute(key, "file_complete", || async move {
                if !self.hub.is_user_online(&to).await {
                    self.notify_peer_offline(sender_id, &to).await;
                    return Ok(());
                }
                self.transfers.complete(&file_id)?;
                self.send_routed(sender_id, &to, &out).await
            })
            .await
    }

    fn decode<P: DeserializeOwned>(&self, envelope: &Envelope) -> Result<P, HubError> {
        envelope
            .decode_payload()
            .map_err(|e| HubError::InvalidPayload(e.to_string()))
    }

    /// Empty and malformed targets are errors; a self-target is logged and
    /// dropped without an error envelope.
    fn resolve_target(&self, sender_id: &str, to: &str) -> Result<Option<String>, HubError> {
        if to.is_empty() {
            return Err(HubError::EmptyUserId);
        }
        if !is_valid_user_id(to) {
            return Err(HubError::InvalidUserId(to.to_owned()));
        }
        if to == sender_id {
            debug!(sender = sender_id, "self-targeted envelope dropped");
            self.metrics.message_dropped();
            return Ok(None);
        }
        Ok(Some(to.to_owned()))
    }

    async fn deliver_online_required(
        &self,
        sender_id: &str,
        to: String,
        envelope: Envelope,
    ) -> Result<(), HubError> {
        if !self.hub.is_user_online(&to).await {
            self.notify_peer_offline(sender_id, &to).await;
            return Ok(());
        }
        self.send_routed(sender_id, &to, &envelope).await
    }

    /// Final delivery.  A send timeout or a target that vanished between
    /// the online check and the send are drops, not errors back to the
    /// sender's peer.
    async fn send_routed(
        &self,
        sender_id: &str,
        to: &str,
        envelope: &Envelope,
    ) -> Result<(), HubError> {
        match self.hub.send_to_user_with_timeout(to, envelope).await {
            Ok(()) => {
                self.metrics.message_routed(envelope.message_type.as_str());
                Ok(())
            }
            Err(HubError::UserNotConnected(_)) => {
                self.notify_peer_offline(sender_id, to).await;
                Ok(())
            }
            Err(HubError::SendTimeout(_)) => {
                self.metrics.message_dropped();
                warn!(to, message_type = %envelope.message_type, "send timed out, envelope dropped");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn send_best_effort(&self, to: &str, envelope: &Envelope) {
        if self.hub.send_to_user(to, envelope).await {
            self.metrics.message_routed(envelope.message_type.as_str());
        } else {
            self.metrics.message_dropped();
        }
    }

    async fn notify_peer_offline(&self, sender_id: &str, peer_id: &str) {
        self.metrics.peer_offline_reply();
        let env = match Envelope::new(
            MessageType::PeerOffline,
            &PeerRef {
                peer_id: peer_id.to_owned(),
            },
        ) {
            Ok(env) => env,
            Err(e) => {
                warn!(error = %e, "failed to build peer_offline");
                return;
            }
        };
        if let Err(e) = self.hub.send_to_user_with_timeout(sender_id, &env).await {
            debug!(sender = sender_id, error = %e, "peer_offline not delivered");
        }
    }

    async fn send_error(&self, sender_id: &str, error: &HubError) {
        let env = match Envelope::new(
            MessageType::Error,
            &ErrorBody {
                code: error.code().to_owned(),
                message: error.to_string(),
            },
        ) {
            Ok(env) => env,
            Err(e) => {
                warn!(error = %e, "failed to build error envelope");
                return;
            }
        };
        if !self.hub.send_to_user(sender_id, &env).await {
            debug!(sender = sender_id, "error envelope not delivered");
        }
    }

    fn sampled(&self) -> bool {
        self.debug_sample_rate > 0.0 && rand::random::<f64>() < self.debug_sample_rate
    }
}
