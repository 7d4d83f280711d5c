use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use deckwire_frame::command::VERSION;
use tracing::{debug, info};

use crate::error::{Result, SessionError};
use crate::session::Session;

/// Configuration for the identify exchange run after every open.
#[derive(Debug, Clone)]
pub struct HandshakeConfig {
    /// Run the exchange at all. When disabled the link counts as up once open.
    pub enabled: bool,
    /// Command used to query the device.
    pub command: u8,
    /// Deadline for the reply.
    pub timeout: Duration,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            command: VERSION,
            timeout: Duration::from_secs(2),
        }
    }
}

/// What the device reported during the identify exchange.
#[derive(Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    /// Firmware version as `major.minor.patch`, when the reply carries one.
    pub version: Option<String>,
    /// Raw reply payload.
    pub raw: Bytes,
}

impl DeviceIdentity {
    /// Interpret a version reply: the first three bytes are major, minor, patch.
    pub fn from_payload(raw: Bytes) -> Self {
        let version = match raw.get(..3) {
            Some([major, minor, patch]) => Some(format!("{major}.{minor}.{patch}")),
            _ => None,
        };
        Self { version, raw }
    }
}

impl fmt::Debug for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceIdentity")
            .field("version", &self.version)
            .field("raw", &format_args!("<{} bytes>", self.raw.len()))
            .finish()
    }
}

/// Query the device over a freshly started session.
///
/// Any failure, including a timeout, is reported as
/// [`SessionError::HandshakeFailed`].
pub async fn identify(session: &Session, config: &HandshakeConfig) -> Result<DeviceIdentity> {
    debug!(endpoint = %session.endpoint(), command = config.command, "identifying device");
    let reply = session
        .send_request(config.command, &[], config.timeout)
        .await
        .map_err(|e| SessionError::HandshakeFailed(e.to_string()))?;

    let identity = DeviceIdentity::from_payload(reply.payload);
    info!(
        endpoint = %session.endpoint(),
        version = identity.version.as_deref().unwrap_or("unknown"),
        "device identified"
    );
    Ok(identity)
}
