//! Error types for walletsync wire and state types.

use thiserror::Error;

/// Errors that can occur decoding walletsync types.
#[derive(Debug, Error)]
pub enum TypesError {
    /// JSON (de)serialization failed
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Wrong number of bytes for a fixed-size value
    #[error("invalid length for {kind}: expected {expected}, got {actual}")]
    InvalidLength {
        /// What was being decoded
        kind: &'static str,
        /// Expected length
        expected: usize,
        /// Actual length
        actual: usize,
    },

    /// Text encoding (hex/base64) was malformed
    #[error("invalid encoding for {kind}: {reason}")]
    InvalidEncoding {
        /// What was being decoded
        kind: &'static str,
        /// Decoder message
        reason: String,
    },

    /// A frame was valid JSON but not a request, response or notice
    #[error("invalid frame: {0}")]
    InvalidFrame(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = TypesError::InvalidLength {
            kind: "wallet hash",
            expected: 32,
            actual: 4,
        };
        assert_eq!(
            err.to_string(),
            "invalid length for wallet hash: expected 32, got 4"
        );
    }

    #[test]
    fn error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<TypesError>();
    }
}
