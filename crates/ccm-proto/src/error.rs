/// CCM error types.
///
/// Nothing in the protocol layer is fatal to the process: handlers either
/// drop-and-log or propagate one of these variants so the caller can decide
/// whether to retry, reset the round, or shut down.

use serde::{Deserialize, Serialize};

/// Unified error type for all CCM operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, thiserror::Error)]
pub enum CcmError {
    #[error("network error")]
    NetworkError,
    #[error("message codec error")]
    Codec,
    #[error("message exceeds maximum size")]
    MessageTooLarge,
    #[error("node not present in the directory")]
    UnknownNode,
    #[error("node directory is full")]
    DirectoryFull,
    #[error("send failed after exhausting retries")]
    SendFailed,
    #[error("transport channel closed")]
    ChannelClosed,
    #[error("no connection to peer")]
    NotConnected,
    #[error("malformed membership bitmap")]
    BadBitmap,
    #[error("protocol version mismatch")]
    VerMismatch,
    #[error("ccm is shutting down")]
    Shutdown,
}

/// Result type alias for CCM operations.
pub type CcmResult<T> = Result<T, CcmError>;

impl From<std::io::Error> for CcmError {
    fn from(_: std::io::Error) -> Self {
        CcmError::NetworkError
    }
}
