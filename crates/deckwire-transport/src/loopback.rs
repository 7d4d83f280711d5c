//! In-memory transport pair.
//!
//! [`pair`] returns a [`LoopbackTransport`] that behaves like a real link of
//! the chosen [`Framing`], plus a [`LoopbackPeer`] that plays the device:
//! it sees every write and can inject inbound bytes or drop the link.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{Result, TransportError};
use crate::traits::{Framing, Transport};

/// Default bounded wait for stream-framed reads.
pub const DEFAULT_READ_WAIT: Duration = Duration::from_millis(50);

/// Create a connected transport/peer pair.
pub fn pair(framing: Framing) -> (LoopbackTransport, LoopbackPeer) {
    pair_with_read_wait(framing, DEFAULT_READ_WAIT)
}

/// Create a pair with an explicit bounded wait for stream-framed reads.
pub fn pair_with_read_wait(
    framing: Framing,
    read_wait: Duration,
) -> (LoopbackTransport, LoopbackPeer) {
    let (to_transport, inbound) = mpsc::unbounded_channel();
    let (outbound, from_transport) = mpsc::unbounded_channel();
    let link_down = CancellationToken::new();
    let closed_by_owner = CancellationToken::new();

    let transport = LoopbackTransport {
        framing,
        name: format!("loopback:{}", framing.name()),
        inbound: Mutex::new(inbound),
        outbound,
        read_wait,
        link_down: link_down.clone(),
        closed_by_owner: closed_by_owner.clone(),
        closed: AtomicBool::new(false),
    };
    let peer = LoopbackPeer {
        to_transport,
        from_transport,
        link_down,
        closed_by_owner,
    };
    (transport, peer)
}

/// The client side of a loopback pair.
pub struct LoopbackTransport {
    framing: Framing,
    name: String,
    inbound: Mutex<mpsc::UnboundedReceiver<Bytes>>,
    outbound: mpsc::UnboundedSender<Bytes>,
    read_wait: Duration,
    link_down: CancellationToken,
    closed_by_owner: CancellationToken,
    closed: AtomicBool,
}

#[async_trait]
impl Transport for LoopbackTransport {
    fn framing(&self) -> Framing {
        self.framing
    }

    fn endpoint(&self) -> &str {
        &self.name
    }

    async fn write(&self, bytes: Bytes) -> Result<()> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        if self.link_down.is_cancelled() {
            return Err(TransportError::LinkLost("loopback link dropped".to_string()));
        }
        self.outbound
            .send(bytes)
            .map_err(|_| TransportError::LinkLost("loopback peer gone".to_string()))
    }

    async fn read(&self) -> Result<Bytes> {
        let mut inbound = tokio::select! {
            _ = self.closed_by_owner.cancelled() => return Err(TransportError::Closed),
            inbound = self.inbound.lock() => inbound,
        };

        let next = async {
            match self.framing {
                Framing::Stream => match tokio::time::timeout(self.read_wait, inbound.recv()).await
                {
                    Ok(next) => next,
                    Err(_) => Some(Bytes::new()),
                },
                Framing::Message => inbound.recv().await,
            }
        };

        tokio::select! {
            biased;
            _ = self.closed_by_owner.cancelled() => Err(TransportError::Closed),
            _ = self.link_down.cancelled() => {
                Err(TransportError::LinkLost("loopback link dropped".to_string()))
            }
            next = next => {
                next.ok_or_else(|| TransportError::LinkLost("loopback peer gone".to_string()))
            }
        }
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.closed_by_owner.cancel();
        debug!(endpoint = %self.name, "loopback link closed");
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// The device side of a loopback pair.
pub struct LoopbackPeer {
    to_transport: mpsc::UnboundedSender<Bytes>,
    from_transport: mpsc::UnboundedReceiver<Bytes>,
    link_down: CancellationToken,
    closed_by_owner: CancellationToken,
}

impl LoopbackPeer {
    /// Deliver bytes (stream) or one message (message framing) to the transport.
    pub fn send(&self, bytes: impl Into<Bytes>) -> Result<()> {
        if self.link_down.is_cancelled() {
            return Err(TransportError::LinkLost("loopback link dropped".to_string()));
        }
        self.to_transport
            .send(bytes.into())
            .map_err(|_| TransportError::Closed)
    }

    /// Next unit written by the transport, or `None` once it is gone.
    pub async fn recv(&mut self) -> Option<Bytes> {
        tokio::select! {
            next = self.from_transport.recv() => next,
            _ = self.closed_by_owner.cancelled() => self.from_transport.try_recv().ok(),
        }
    }

    /// Simulate the device vanishing: pending and future reads fail with link loss.
    pub fn disconnect(&self) {
        self.link_down.cancel();
    }

    /// Whether the transport side was closed by its owner.
    pub fn is_closed(&self) -> bool {
        self.closed_by_owner.is_cancelled()
    }
}
