//! Transport-agnostic communication with Loupedeck-style control surfaces.
//!
//! deckwire talks to multi-button/knob panels over a serial link or a
//! WebSocket, correlates requests with their responses, dispatches device
//! events, and reconnects when the link drops.
//!
//! # Crate Structure
//!
//! - [`transport`]: serial, network and in-memory links behind one trait
//! - [`frame`]: the binary frame format and command table
//! - [`session`]: request correlation, events, reconnection and discovery
//! - [`config`]: JSON configuration covering every layer
//! - [`logging`]: `tracing-subscriber` setup

pub mod config;
pub mod logging;

/// Re-export transport types.
pub mod transport {
    pub use deckwire_transport::*;
}

/// Re-export frame types.
pub mod frame {
    pub use deckwire_frame::*;
}

/// Re-export session types.
pub mod session {
    pub use deckwire_session::*;
}

pub use config::{ConfigError, DeckwireConfig};
pub use deckwire_session::{connect, Device, DeviceConfig, Endpoint, Event, SessionError};
pub use logging::{init_logging, LogFormat, LogLevel, LogSettings};
