//! SSH transport error types

use thiserror::Error;

/// Errors raised by the transport layer (connect, auth, channels, uploads)
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("Host key rejected for {host}:{port} ({fingerprint})")]
    HostKeyRejected {
        host: String,
        port: u16,
        fingerprint: String,
    },

    #[error("Invalid private key: {0}")]
    InvalidKey(String),

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Channel error: {0}")]
    ChannelError(String),

    #[error("Upload to {path} failed: {message}")]
    Upload { path: String, message: String },

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Session closed")]
    SessionClosed,
}

impl From<russh::Error> for TransportError {
    fn from(e: russh::Error) -> Self {
        TransportError::ChannelError(e.to_string())
    }
}

impl serde::Serialize for TransportError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}
