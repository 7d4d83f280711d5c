use std::time::Duration;

use deckwire_frame::FrameError;
use deckwire_transport::TransportError;

/// Errors surfaced to callers of the session and device APIs.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    /// The initial open or handshake failed. Never retried automatically.
    #[error("connect failed: {0}")]
    ConnectFailed(String),

    /// The link dropped or was closed while the operation was outstanding.
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// No response arrived within the request deadline.
    #[error("transaction timed out after {0:?}")]
    TransactionTimeout(Duration),

    /// Every transaction id is in use.
    #[error("too many pending transactions ({0})")]
    TooManyPending(usize),

    /// The identify exchange after open did not succeed.
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    /// An outgoing message could not be encoded.
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),
}

impl From<TransportError> for SessionError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::ConnectFailed { .. }
            | TransportError::Handshake { .. }
            | TransportError::UnsupportedBaudRate(_) => Self::ConnectFailed(err.to_string()),
            other => Self::ConnectionLost(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, SessionError>;
