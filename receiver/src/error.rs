//! Error types shared across the verification pipeline and the store.
//!
//! Every failure that can reach a caller projects onto an [`ErrorKind`],
//! which is the stable, serializable reason reported in ingest decisions.

use serde::Serialize;
use thiserror::Error;

/// Stable reason codes reported to the transport layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    KeyFetchError,
    KeyCodecError,
    SignatureFormatError,
    TimestampExpired,
    SignatureInvalid,
    KeyUnavailable,
    StoreCapacityEviction,
    PersistenceWriteError,
    MalformedPayload,
    FormNotAllowed,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::KeyFetchError => "key_fetch_error",
            ErrorKind::KeyCodecError => "key_codec_error",
            ErrorKind::SignatureFormatError => "signature_format_error",
            ErrorKind::TimestampExpired => "timestamp_expired",
            ErrorKind::SignatureInvalid => "signature_invalid",
            ErrorKind::KeyUnavailable => "key_unavailable",
            ErrorKind::StoreCapacityEviction => "store_capacity_eviction",
            ErrorKind::PersistenceWriteError => "persistence_write_error",
            ErrorKind::MalformedPayload => "malformed_payload",
            ErrorKind::FormNotAllowed => "form_not_allowed",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single key descriptor could not be turned into a usable public key.
///
/// Never fatal: the cache logs and skips the offending descriptor.
#[derive(Debug, Error)]
pub enum KeyCodecError {
    #[error("malformed key material: {0}")]
    Format(&'static str),

    #[error("invalid base64url in field '{field}': {source}")]
    Base64 {
        field: &'static str,
        #[source]
        source: base64::DecodeError,
    },

    #[error("encoded key rejected by decoder: {0}")]
    Der(String),
}

/// The remote key set could not be fetched or parsed as a whole.
#[derive(Debug, Clone, Error)]
pub enum KeyFetchError {
    #[error("key source request failed: {0}")]
    Transport(String),

    #[error("key source returned HTTP {0}")]
    Status(u16),

    #[error("key source returned a malformed document: {0}")]
    Malformed(String),

    #[error("key source did not answer within {0:?}")]
    Timeout(std::time::Duration),

    #[error("key source returned no usable keys ({skipped} descriptors skipped)")]
    NoUsableKeys { skipped: usize },
}

/// Reasons a signed request is rejected by the verifier.
#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("malformed signature envelope: {0}")]
    SignatureFormat(&'static str),

    #[error("timestamp {claimed} outside the allowed window of {window_secs}s (now {now})")]
    TimestampExpired {
        claimed: i64,
        now: i64,
        window_secs: u64,
    },

    #[error("signature does not match any of {keys_tried} cached keys")]
    SignatureInvalid { keys_tried: usize },

    #[error("no verification keys are available")]
    KeyUnavailable,
}

impl VerifyError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            VerifyError::SignatureFormat(_) => ErrorKind::SignatureFormatError,
            VerifyError::TimestampExpired { .. } => ErrorKind::TimestampExpired,
            VerifyError::SignatureInvalid { .. } => ErrorKind::SignatureInvalid,
            VerifyError::KeyUnavailable => ErrorKind::KeyUnavailable,
        }
    }
}

/// Failure of the durable mirror of the submission store.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("persistence I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("persisted submission could not be (de)serialized: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("persistence queue is full, job dropped")]
    QueueFull,

    #[error("persistence writer has shut down")]
    Closed,
}
