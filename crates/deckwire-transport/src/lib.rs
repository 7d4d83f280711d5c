//! Device transport abstraction.
//!
//! Two structurally different links sit behind one [`Transport`] trait:
//! - a serial byte stream (no message boundaries), and
//! - a WebSocket network link (one binary message per frame).
//!
//! This is the lowest layer of deckwire. Framing lives in `deckwire-frame`;
//! request correlation and reconnection live in `deckwire-session`.

pub mod error;
pub mod loopback;
pub mod network;
pub mod traits;

#[cfg(unix)]
pub mod serial;

pub use error::{Result, TransportError};
pub use loopback::{LoopbackPeer, LoopbackTransport};
pub use network::{NetworkConfig, NetworkTransport};
pub use traits::{Framing, Transport};

#[cfg(unix)]
pub use serial::{SerialConfig, SerialTransport};
