//! Error types for fieldlink-types.

use thiserror::Error;

/// Errors raised while decoding or validating a device frame.
///
/// Every variant is recoverable: the session reports it to the peer and keeps
/// the connection open.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ProtocolError {
    /// The frame was not valid JSON or did not match any known message kind.
    #[error("Invalid message: {0}")]
    Malformed(String),

    /// A field carried a value outside its accepted range.
    #[error("Invalid value for {field}: {reason}")]
    InvalidValue {
        field: &'static str,
        reason: String,
    },

    /// The frame bytes were not valid UTF-8.
    #[error("Invalid message: not valid UTF-8 ({0})")]
    NotUtf8(#[from] std::str::Utf8Error),

    /// The frame exceeded the configured size limit.
    #[error("Message too large: {size} bytes (limit {limit})")]
    TooLarge { size: usize, limit: usize },
}

impl From<serde_json::Error> for ProtocolError {
    fn from(e: serde_json::Error) -> Self {
        ProtocolError::Malformed(e.to_string())
    }
}

/// Result type alias using fieldlink-types' ProtocolError type.
pub type ProtocolResult<T> = std::result::Result<T, ProtocolError>;
