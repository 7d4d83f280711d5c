use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Result;

/// How a transport delimits frames on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// Ordered byte stream without boundaries; frames carry a length prefix.
    Stream,
    /// Boundary-preserving messages; one frame per message, no length prefix.
    Message,
}

impl Framing {
    /// Human-readable name for diagnostics.
    pub fn name(self) -> &'static str {
        match self {
            Framing::Stream => "stream",
            Framing::Message => "message",
        }
    }
}

/// A connected device link.
///
/// Implementations are opened by their own constructors and are usable
/// through a shared reference, so one task can read while another writes
/// and a third closes. Every method after [`Transport::close`] fails with
/// [`crate::TransportError::Closed`].
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Framing the codec must apply to this link.
    fn framing(&self) -> Framing;

    /// Endpoint description (device path or URL) for logs and events.
    fn endpoint(&self) -> &str;

    /// Write one encoded frame. Concurrent calls never interleave.
    async fn write(&self, bytes: Bytes) -> Result<()>;

    /// Read the next inbound unit.
    ///
    /// Stream links return whatever bytes are available, possibly none once
    /// the bounded read wait elapses. Message links return exactly one message.
    async fn read(&self) -> Result<Bytes>;

    /// Release the underlying handle. Idempotent and safe to call from any task.
    async fn close(&self);

    /// Whether [`Transport::close`] has been called.
    fn is_closed(&self) -> bool;
}
