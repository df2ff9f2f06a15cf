// chat-protocol: Chat delivery wire types and serialization.
//
// One JSON object per frame: `{"type": <message type>, "payload": {...}}`.
// Multiple frames may be concatenated with `\n` inside a single transport
// frame; the read side splits on newline before parsing.  Payloads are
// opaque to the hub until the router decodes the per-type record.

use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Message types
// ---------------------------------------------------------------------------

/// The frozen set of envelope types.
///
/// String-typed and case-sensitive on the wire.  A tag the peer does not
/// recognize deserializes to [`MessageType::Unknown`] so the router can
/// answer with `UNKNOWN_MESSAGE_TYPE` instead of tearing the socket down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Auth,
    EphemeralKey,
    Message,
    SessionEstablished,
    PeerOffline,
    PeerDisconnected,
    FileStart,
    FileChunk,
    FileComplete,
    Ack,
    Typing,
    Reaction,
    MessageDelete,
    MessageEdit,
    MessageRead,
    Error,
    #[serde(other)]
    Unknown,
}

impl MessageType {
    /// Wire spelling, also used as a metric label.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Auth => "auth",
            Self::EphemeralKey => "ephemeral_key",
            Self::Message => "message",
            Self::SessionEstablished => "session_established",
            Self::PeerOffline => "peer_offline",
            Self::PeerDisconnected => "peer_disconnected",
            Self::FileStart => "file_start",
            Self::FileChunk => "file_chunk",
            Self::FileComplete => "file_complete",
            Self::Ack => "ack",
            Self::Typing => "typing",
            Self::Reaction => "reaction",
            Self::MessageDelete => "message_delete",
            Self::MessageEdit => "message_edit",
            Self::MessageRead => "message_read",
            Self::Error => "error",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// One framed unit on the wire.
///
/// `payload` stays a raw JSON value until a specific record is decoded for
/// inspection, and is re-serialized after `from` mutation.  The hub never
/// interprets ciphertext or nonce fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub message_type: MessageType,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl Envelope {
    /// Builds an envelope from a typed payload record.
    pub fn new<P: Serialize>(
        message_type: MessageType,
        payload: &P,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            message_type,
            payload: serde_json::to_value(payload)?,
        })
    }

    /// Decodes the opaque payload into a per-type record.
    pub fn decode_payload<P: DeserializeOwned>(&self) -> Result<P, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }

    /// Replaces the payload with a re-serialized record (after `from` mutation).
    pub fn replace_payload<P: Serialize>(&mut self, payload: &P) -> Result<(), serde_json::Error> {
        self.payload = serde_json::to_value(payload)?;
        Ok(())
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

/// Checks that a target user id is well-formed (UUID text).
pub fn is_valid_user_id(id: &str) -> bool {
    Uuid::parse_str(id).is_ok()
}

// ---------------------------------------------------------------------------
// Client -> Hub payloads
// ---------------------------------------------------------------------------

/// First envelope on every connection.  Bearer prefix is accepted but not
/// required; the raw token is what the verifier hashes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthRequest {
    pub token: String,
}

/// Positive auth response.  Failure closes the socket with a policy reason
/// instead of answering in-band.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthResult {
    pub authenticated: bool,
}

/// Diffie–Hellman key material relayed between peers.  `public_key` and
/// `signature` are opaque base64 strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EphemeralKey {
    pub to: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    pub public_key: String,
    pub signature: String,
    pub message_id: String,
    pub requires_ack: bool,
}

/// An encrypted chat message.  Ciphertext and nonce are opaque base64.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub to: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    pub message_id: String,
    pub ciphertext: String,
    pub nonce: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to_message_id: Option<String>,
}

/// Signals that the sender has finished the key exchange with `to`.
/// Forwarded without `from` mutation; requires the target to exist but not
/// to be online.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionEstablished {
    pub to: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
}

/// Metadata opening a chunked file transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileStart {
    pub to: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    pub file_id: String,
    pub filename: String,
    pub mime_type: String,
    pub total_size: i64,
    pub total_chunks: i32,
    pub chunk_size: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_mode: Option<String>,
}

/// One encrypted chunk of an in-flight transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChunk {
    pub to: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    pub file_id: String,
    pub chunk_index: i32,
    pub total_chunks: i32,
    pub ciphertext: String,
    pub nonce: String,
}

/// Closes a transfer.  The hub synthesizes one with `failed: true` when a
/// transfer goes stale or an endpoint disconnects mid-flight.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileComplete {
    pub to: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    pub file_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed: Option<bool>,
}

/// Delivery acknowledgement, relayed opaque.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    pub to: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    pub message_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Typing {
    pub to: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    pub is_typing: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reaction {
    pub to: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    pub message_id: String,
    pub reaction: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageDelete {
    pub to: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    pub message_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageEdit {
    pub to: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    pub message_id: String,
    pub ciphertext: String,
    pub nonce: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRead {
    pub to: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    pub message_id: String,
}

// ---------------------------------------------------------------------------
// Hub -> Client payloads
// ---------------------------------------------------------------------------

/// Target of a just-attempted send is not connected (`peer_offline`), or a
/// connected peer on the same shard went away (`peer_disconnected`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRef {
    pub peer_id: String,
}

/// In-band error report.  Validation failures keep the connection open.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

// ---------------------------------------------------------------------------
// Error codes and close reasons
// ---------------------------------------------------------------------------

/// Frozen error codes, stable over the wire.
pub mod error_codes {
    pub const INVALID_PAYLOAD: &str = "INVALID_PAYLOAD";
    pub const INVALID_USER_ID: &str = "INVALID_USER_ID";
    pub const EMPTY_UUID: &str = "EMPTY_UUID";
    pub const FILE_SIZE_EXCEEDED: &str = "FILE_SIZE_EXCEEDED";
    pub const INVALID_FILE_SIZE: &str = "INVALID_FILE_SIZE";
    pub const INVALID_TOTAL_CHUNKS: &str = "INVALID_TOTAL_CHUNKS";
    pub const INVALID_MIME_TYPE: &str = "INVALID_MIME_TYPE";
    pub const MIME_TYPE_NOT_ALLOWED: &str = "MIME_TYPE_NOT_ALLOWED";
    pub const UNKNOWN_MESSAGE_TYPE: &str = "UNKNOWN_MESSAGE_TYPE";
    pub const USER_NOT_CONNECTED: &str = "USER_NOT_CONNECTED";
    pub const USER_NOT_FOUND: &str = "USER_NOT_FOUND";
    pub const TRANSFER_NOT_FOUND: &str = "TRANSFER_NOT_FOUND";
    pub const TRANSFER_ALREADY_EXISTS: &str = "TRANSFER_ALREADY_EXISTS";
    pub const INVALID_CHUNK_INDEX: &str = "INVALID_CHUNK_INDEX";
    pub const INVALID_TOKEN: &str = "INVALID_TOKEN";
    pub const INVALID_TOKEN_SIGNING_METHOD: &str = "INVALID_TOKEN_SIGNING_METHOD";
    pub const INVALID_TOKEN_CLAIMS: &str = "INVALID_TOKEN_CLAIMS";
    pub const MISSING_TOKEN_CLAIMS: &str = "MISSING_TOKEN_CLAIMS";
    pub const CIRCUIT_OPEN: &str = "CIRCUIT_OPEN";
    pub const SEND_TIMEOUT: &str = "SEND_TIMEOUT";
    pub const MARSHAL_ERROR: &str = "MARSHAL_ERROR";
    pub const INTERNAL_ERROR: &str = "INTERNAL_ERROR";
}

/// Close-frame reason texts applied with a policy-violation close code.
pub mod close_reasons {
    pub const AUTHENTICATION_REQUIRED: &str = "authentication required";
    pub const INVALID_TOKEN: &str = "invalid token";
    pub const TOKEN_REVOKED: &str = "token revoked";
    pub const INTERNAL_ERROR: &str = "internal error";
}
