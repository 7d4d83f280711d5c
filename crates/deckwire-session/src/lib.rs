//! Device sessions for deckwire.
//!
//! A [`Session`] owns one open transport: it numbers outgoing requests,
//! matches responses to them and publishes every other inbound message on
//! an [`EventEmitter`]. A [`Device`] supervises sessions across link loss
//! using the [`LinkState`] machine and [`Backoff`], and is the surface
//! higher layers talk to.
//!
//! ```no_run
//! use std::time::Duration;
//! use deckwire_session::{connect, DeviceConfig, Endpoint};
//!
//! # async fn demo() -> deckwire_session::Result<()> {
//! let device = connect(Endpoint::parse("/dev/ttyACM0"), DeviceConfig::default()).await?;
//! device.on("button", |event| {
//!     println!("{event:?}");
//!     Ok(())
//! });
//! let reply = device.send_request(0x07, &[], Duration::from_secs(1)).await?;
//! println!("version payload: {:?}", reply.payload);
//! device.close().await;
//! # Ok(())
//! # }
//! ```

pub mod backoff;
pub mod connector;
pub mod device;
pub mod discovery;
pub mod emitter;
pub mod error;
pub mod handshake;
pub mod reconnect;
pub mod session;

pub use backoff::{Backoff, BackoffConfig};
pub use connector::{Endpoint, Opener, SystemOpener};
pub use device::{connect, Device, DeviceConfig};
pub use discovery::{
    discover, parse_advertisement, serial_ports, AdvertisedEndpoint, DiscoveryConfig,
    DiscoverySession,
};
pub use emitter::{CallbackError, Event, EventEmitter, SubscriptionId};
pub use error::{Result, SessionError};
pub use handshake::{identify, DeviceIdentity, HandshakeConfig};
pub use reconnect::{LinkEvent, LinkState};
pub use session::{Session, SessionConfig, MAX_PENDING};
