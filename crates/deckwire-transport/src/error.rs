/// Errors that can occur in device transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The link could not be established.
    #[error("failed to connect to {endpoint}: {reason}")]
    ConnectFailed { endpoint: String, reason: String },

    /// The link opened but the device rejected or garbled the upgrade exchange.
    #[error("handshake with {endpoint} failed: {reason}")]
    Handshake { endpoint: String, reason: String },

    /// An established link dropped (read/write error, EOF, or peer close).
    #[error("link lost: {0}")]
    LinkLost(String),

    /// The transport has been closed locally.
    #[error("transport closed")]
    Closed,

    /// The requested line speed cannot be expressed on this platform.
    #[error("unsupported baud rate {0}")]
    UnsupportedBaudRate(u32),

    /// An I/O error occurred while configuring the transport.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// Returns true if this error means an established link is gone.
    pub fn is_link_loss(&self) -> bool {
        matches!(self, TransportError::LinkLost(_) | TransportError::Closed)
    }
}

pub type Result<T> = std::result::Result<T, TransportError>;
