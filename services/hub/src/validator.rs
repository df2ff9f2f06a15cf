//! File-start metadata validation.

use chat_protocol::FileStart;

use crate::errors::HubError;

pub const MAX_TOTAL_CHUNKS: i32 = 1000;

/// Non-audio MIME types accepted for transfer, beyond the `image/` and
/// `text/` prefixes.
const ALLOWED_MIME_TYPES: &[&str] = &[
    "application/pdf",
    "application/msword",
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
    "application/vnd.ms-excel",
    "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
    "application/vnd.ms-powerpoint",
    "application/vnd.openxmlformats-officedocument.presentationml.presentation",
    "application/zip",
    "application/x-zip-compressed",
    "application/x-rar-compressed",
    "application/x-7z-compressed",
    "application/gzip",
    "application/x-tar",
    "application/octet-stream",
];

/// Recognized voice-note subtypes; an optional `;codecs=` suffix is ignored.
const ALLOWED_AUDIO_TYPES: &[&str] = &[
    "audio/webm",
    "audio/ogg",
    "audio/mp4",
    "audio/mpeg",
    "audio/wav",
    "audio/aac",
    "audio/x-m4a",
];

#[derive(Debug, Clone)]
pub struct MessageValidator {
    max_file_size: i64,
    max_voice_size: i64,
}

impl MessageValidator {
    pub fn new(max_file_size: i64, max_voice_size: i64) -> Self {
        Self {
            max_file_size,
            max_voice_size,
        }
    }

    /// All rules must hold; the first violated one names the rejection.
    pub fn validate_file_start(&self, payload: &FileStart) -> Result<(), HubError> {
        if payload.total_size <= 0 {
            return Err(HubError::InvalidFileSize);
        }
        let is_audio = payload.mime_type.starts_with("audio/");
        let limit = if is_audio {
            self.max_voice_size
        } else {
            self.max_file_size
        };
        if payload.total_size > limit {
            return Err(HubError::FileSizeExceeded);
        }
        if payload.total_chunks <= 0 || payload.total_chunks > MAX_TOTAL_CHUNKS {
            return Err(HubError::InvalidTotalChunks);
        }
        if payload.mime_type.is_empty() {
            return Err(HubError::InvalidMimeType);
        }
        if is_audio {
            let base = payload
                .mime_type
                .split(';')
                .next()
                .unwrap_or("")
                .trim();
            if !ALLOWED_AUDIO_TYPES.contains(&base) {
                return Err(HubError::MimeTypeNotAllowed);
            }
        } else if !mime_allowed(&payload.mime_type) {
            return Err(HubError::MimeTypeNotAllowed);
        }
        Ok(())
    }
}

fn mime_allowed(mime: &str) -> bool {
    mime.starts_with("image/")
        || mime.starts_with("text/")
        || ALLOWED_MIME_TYPES.contains(&mime)
}
