//! Error types for the control channel

use std::io;
use thiserror::Error;

/// Control channel errors
#[derive(Debug, Error)]
pub enum IpcError {
    /// Send attempted on a channel that is no longer connected
    #[error("Channel closed")]
    ChannelClosed,

    /// Disconnect requested on a channel that is already disconnected
    #[error("IPC channel is already disconnected")]
    NotConnected,

    /// Value cannot be carried by the negotiated serialization mode
    #[error("Value not supported by {mode} serialization: {reason}")]
    UnsupportedValue { mode: &'static str, reason: String },

    /// Incoming frame exceeded the configured maximum length
    #[error("Frame exceeds maximum length of {max} bytes")]
    FrameTooLarge { max: usize },

    /// JSON encode/decode failure
    #[error("JSON frame error: {0}")]
    Json(#[from] serde_json::Error),

    /// Advanced frame encode failure
    #[error("Failed to encode frame: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// Advanced frame decode failure
    #[error("Failed to decode frame: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    /// Underlying handle I/O failure
    #[error("Channel I/O error: {0}")]
    Io(#[from] io::Error),

    /// Unknown serialization mode name
    #[error("Invalid serialization mode: {0}")]
    InvalidSerializationMode(String),

    /// Child-side bootstrap: no channel descriptor was inherited
    #[error("No channel descriptor in environment variable {0}")]
    MissingChannelFd(&'static str),

    /// Child-side bootstrap: descriptor variable is malformed
    #[error("Invalid channel descriptor: {0}")]
    InvalidChannelFd(String),
}

impl IpcError {
    /// Whether this error is the expected result of the channel's own teardown
    ///
    /// Interrupted reads and resets on an already-closing handle end the read
    /// loop quietly instead of being reported.
    pub fn is_teardown(&self) -> bool {
        match self {
            IpcError::ChannelClosed | IpcError::NotConnected => true,
            IpcError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::Interrupted
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::NotConnected
                    | io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }
}

/// Result type for channel operations
pub type Result<T> = std::result::Result<T, IpcError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(IpcError::ChannelClosed.to_string(), "Channel closed");
        assert_eq!(
            IpcError::NotConnected.to_string(),
            "IPC channel is already disconnected"
        );
        let err = IpcError::FrameTooLarge { max: 16 };
        assert_eq!(err.to_string(), "Frame exceeds maximum length of 16 bytes");
    }

    #[test]
    fn test_teardown_classification() {
        assert!(IpcError::ChannelClosed.is_teardown());
        assert!(IpcError::Io(io::Error::from(io::ErrorKind::BrokenPipe)).is_teardown());
        assert!(IpcError::Io(io::Error::from(io::ErrorKind::Interrupted)).is_teardown());
        assert!(!IpcError::Io(io::Error::from(io::ErrorKind::PermissionDenied)).is_teardown());
        assert!(!IpcError::FrameTooLarge { max: 1 }.is_teardown());
    }
}
