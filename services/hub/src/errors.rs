use chat_protocol::error_codes;
use thiserror::Error;

/// Error categories, mirroring the wire taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Validation,
    NotFound,
    Conflict,
    Unauthorized,
    External,
    Internal,
}

/// Routing-layer errors.
///
/// Validation-class errors are reported to the sender as `error` envelopes
/// and the connection stays open.  `SendTimeout` and buffer-full are treated
/// as drop.  Clone is required because idempotent retries replay the stored
/// outcome.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HubError {
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
    #[error("invalid user id: {0}")]
    InvalidUserId(String),
    #[error("empty target user id")]
    EmptyUserId,
    #[error("file size exceeds the allowed maximum")]
    FileSizeExceeded,
    #[error("file size must be positive")]
    InvalidFileSize,
    #[error("total_chunks out of range")]
    InvalidTotalChunks,
    #[error("missing or malformed MIME type")]
    InvalidMimeType,
    #[error("MIME type is not allowed")]
    MimeTypeNotAllowed,
    #[error("unknown message type: {0}")]
    UnknownMessageType(String),
    #[error("user {0} is not connected")]
    UserNotConnected(String),
    #[error("user {0} does not exist")]
    UserNotFound(String),
    #[error("transfer {0} not found")]
    TransferNotFound(String),
    #[error("transfer {0} already exists")]
    TransferAlreadyExists(String),
    #[error("chunk index {index} out of range for {total} chunks")]
    InvalidChunkIndex { index: i32, total: i32 },
    #[error("circuit breaker {0} is open")]
    CircuitOpen(String),
    #[error("send to {0} timed out")]
    SendTimeout(String),
    #[error("marshal error: {0}")]
    Marshal(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl HubError {
    /// Stable wire code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidPayload(_) => error_codes::INVALID_PAYLOAD,
            Self::InvalidUserId(_) => error_codes::INVALID_USER_ID,
            Self::EmptyUserId => error_codes::EMPTY_UUID,
            Self::FileSizeExceeded => error_codes::FILE_SIZE_EXCEEDED,
            Self::InvalidFileSize => error_codes::INVALID_FILE_SIZE,
            Self::InvalidTotalChunks => error_codes::INVALID_TOTAL_CHUNKS,
            Self::InvalidMimeType => error_codes::INVALID_MIME_TYPE,
            Self::MimeTypeNotAllowed => error_codes::MIME_TYPE_NOT_ALLOWED,
            Self::UnknownMessageType(_) => error_codes::UNKNOWN_MESSAGE_TYPE,
            Self::UserNotConnected(_) => error_codes::USER_NOT_CONNECTED,
            Self::UserNotFound(_) => error_codes::USER_NOT_FOUND,
            Self::TransferNotFound(_) => error_codes::TRANSFER_NOT_FOUND,
            Self::TransferAlreadyExists(_) => error_codes::TRANSFER_ALREADY_EXISTS,
            Self::InvalidChunkIndex { .. } => error_codes::INVALID_CHUNK_INDEX,
            Self::CircuitOpen(_) => error_codes::CIRCUIT_OPEN,
            Self::SendTimeout(_) => error_codes::SEND_TIMEOUT,
            Self::Marshal(_) => error_codes::MARSHAL_ERROR,
            Self::Internal(_) => error_codes::INTERNAL_ERROR,
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::InvalidPayload(_)
            | Self::InvalidUserId(_)
            | Self::EmptyUserId
            | Self::FileSizeExceeded
            | Self::InvalidFileSize
            | Self::InvalidTotalChunks
            | Self::InvalidMimeType
            | Self::MimeTypeNotAllowed
            | Self::UnknownMessageType(_)
            | Self::TransferNotFound(_)
            | Self::InvalidChunkIndex { .. } => ErrorCategory::Validation,
            Self::TransferAlreadyExists(_) => ErrorCategory::Conflict,
            Self::UserNotConnected(_) | Self::UserNotFound(_) => ErrorCategory::NotFound,
            Self::CircuitOpen(_) | Self::SendTimeout(_) => ErrorCategory::External,
            Self::Marshal(_) | Self::Internal(_) => ErrorCategory::Internal,
        }
    }

    /// Whether the sender should get an in-band `error` envelope.
    pub fn reportable(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::Validation | ErrorCategory::Conflict
        )
    }
}

impl From<serde_json::Error> for HubError {
    fn from(e: serde_json::Error) -> Self {
        Self::Marshal(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_match_wire_taxonomy() {
        assert_eq!(HubError::EmptyUserId.code(), "EMPTY_UUID");
        assert_eq!(
            HubError::SendTimeout("u".to_owned()).code(),
            "SEND_TIMEOUT"
        );
        assert_eq!(
            HubError::InvalidChunkIndex { index: 9, total: 3 }.code(),
            "INVALID_CHUNK_INDEX"
        );
    }

    #[test]
    fn only_validation_and_conflict_are_reported_in_band() {
        assert!(HubError::InvalidPayload("x".to_owned()).reportable());
        assert!(HubError::TransferAlreadyExists("f".to_owned()).reportable());
        assert!(!HubError::UserNotConnected("u".to_owned()).reportable());
        assert!(!HubError::SendTimeout("u".to_owned()).reportable());
        assert!(!HubError::CircuitOpen("last_seen_update".to_owned()).reportable());
    }
}
