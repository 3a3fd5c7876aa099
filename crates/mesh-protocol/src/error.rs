use thiserror::Error;

/// Errors raised while encoding, decoding or authenticating protocol data.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Malformed envelope: {0}")]
    Malformed(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Frame too large: {size} bytes exceeds {limit}")]
    FrameTooLarge { size: usize, limit: usize },

    #[error("Invalid signature: {0}")]
    InvalidSignature(String),

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Unsupported protocol version: {0}")]
    UnsupportedVersion(String),
}

impl From<serde_json::Error> for ProtocolError {
    fn from(e: serde_json::Error) -> Self {
        ProtocolError::Serialization(e.to_string())
    }
}
