//! JSON configuration for every layer.
//!
//! All sections and fields are optional; anything omitted takes the same
//! default as the corresponding library config struct. Durations are
//! millisecond integers. Unknown fields are rejected so typos surface.
//!
//! ```json
//! {
//!   "session": { "request_timeout_ms": 2000, "watchdog_timeout_ms": 0 },
//!   "reconnect": { "initial_ms": 500, "max_ms": 10000, "jitter": 0.2 },
//!   "log": { "format": "json", "level": "debug", "ansi": false, "target": true }
//! }
//! ```

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use deckwire_frame::{FrameConfig, HEADER_SIZE};
use deckwire_session::{
    BackoffConfig, Device, DeviceConfig, DiscoveryConfig, Endpoint, HandshakeConfig,
    SessionConfig, SystemOpener,
};
use deckwire_transport::NetworkConfig;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::logging::LogSettings;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid configuration document: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Top-level configuration document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DeckwireConfig {
    pub frame: FrameSection,
    pub session: SessionSection,
    pub reconnect: ReconnectSection,
    pub serial: SerialSection,
    pub network: NetworkSection,
    pub discovery: DiscoverySection,
    pub log: LogSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FrameSection {
    /// Largest accepted frame body in bytes.
    pub max_frame_size: usize,
}

impl Default for FrameSection {
    fn default() -> Self {
        Self {
            max_frame_size: FrameConfig::default().max_frame_size,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SessionSection {
    pub request_timeout_ms: u64,
    /// `0` disables keepalive.
    pub keepalive_interval_ms: u64,
    /// `0` disables the watchdog.
    pub watchdog_timeout_ms: u64,
    pub keepalive_command: u8,
    /// Identify the device right after the link opens.
    pub handshake: bool,
    pub handshake_timeout_ms: u64,
}

impl Default for SessionSection {
    fn default() -> Self {
        let session = SessionConfig::default();
        let handshake = HandshakeConfig::default();
        Self {
            request_timeout_ms: millis(session.request_timeout),
            keepalive_interval_ms: millis(session.keepalive_interval),
            watchdog_timeout_ms: millis(session.watchdog_timeout),
            keepalive_command: session.keepalive_command,
            handshake: handshake.enabled,
            handshake_timeout_ms: millis(handshake.timeout),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReconnectSection {
    pub initial_ms: u64,
    pub max_ms: u64,
    /// Fraction of each delay that may be shaved off, `0.0..=0.5`.
    pub jitter: f64,
}

impl Default for ReconnectSection {
    fn default() -> Self {
        let backoff = BackoffConfig::default();
        Self {
            initial_ms: millis(backoff.initial),
            max_ms: millis(backoff.max),
            jitter: backoff.jitter,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SerialSection {
    pub baud_rate: u32,
    pub read_wait_ms: u64,
    pub handshake_timeout_ms: u64,
    /// Send the HTTP upgrade preamble after opening the port.
    pub upgrade: bool,
}

impl Default for SerialSection {
    fn default() -> Self {
        Self {
            baud_rate: 256_000,
            read_wait_ms: 100,
            handshake_timeout_ms: 2_000,
            upgrade: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NetworkSection {
    pub connect_timeout_ms: u64,
}

impl Default for NetworkSection {
    fn default() -> Self {
        Self {
            connect_timeout_ms: millis(NetworkConfig::default().connect_timeout),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DiscoverySection {
    pub bind: SocketAddr,
    pub timeout_ms: u64,
}

impl Default for DiscoverySection {
    fn default() -> Self {
        let discovery = DiscoveryConfig::default();
        Self {
            bind: discovery.bind,
            timeout_ms: millis(discovery.timeout),
        }
    }
}

impl DeckwireConfig {
    /// Read and validate a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = text.parse::<Self>()?;
        debug!(path = %path.display(), "configuration loaded");
        Ok(config)
    }

    /// Reject values the lower layers cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.frame.max_frame_size < HEADER_SIZE {
            return Err(ConfigError::Invalid(format!(
                "frame.max_frame_size must be at least {HEADER_SIZE}"
            )));
        }
        if self.session.request_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "session.request_timeout_ms must be positive".to_string(),
            ));
        }
        if self.session.handshake && self.session.handshake_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "session.handshake_timeout_ms must be positive".to_string(),
            ));
        }
        if self.session.watchdog_timeout_ms != 0
            && self.session.watchdog_timeout_ms <= self.session.keepalive_interval_ms
        {
            return Err(ConfigError::Invalid(
                "session.watchdog_timeout_ms must exceed session.keepalive_interval_ms".to_string(),
            ));
        }
        if self.reconnect.initial_ms == 0 {
            return Err(ConfigError::Invalid(
                "reconnect.initial_ms must be positive".to_string(),
            ));
        }
        if self.reconnect.max_ms < self.reconnect.initial_ms {
            return Err(ConfigError::Invalid(
                "reconnect.max_ms must not be below reconnect.initial_ms".to_string(),
            ));
        }
        if !(0.0..=0.5).contains(&self.reconnect.jitter) {
            return Err(ConfigError::Invalid(format!(
                "reconnect.jitter must be within 0.0..=0.5, got {}",
                self.reconnect.jitter
            )));
        }
        Ok(())
    }

    pub fn frame_config(&self) -> FrameConfig {
        FrameConfig {
            max_frame_size: self.frame.max_frame_size,
        }
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            request_timeout: Duration::from_millis(self.session.request_timeout_ms),
            keepalive_interval: Duration::from_millis(self.session.keepalive_interval_ms),
            watchdog_timeout: Duration::from_millis(self.session.watchdog_timeout_ms),
            keepalive_command: self.session.keepalive_command,
            max_frame_size: self.frame.max_frame_size,
        }
    }

    pub fn handshake_config(&self) -> HandshakeConfig {
        HandshakeConfig {
            enabled: self.session.handshake,
            timeout: Duration::from_millis(self.session.handshake_timeout_ms),
            ..HandshakeConfig::default()
        }
    }

    pub fn backoff_config(&self) -> BackoffConfig {
        BackoffConfig {
            initial: Duration::from_millis(self.reconnect.initial_ms),
            max: Duration::from_millis(self.reconnect.max_ms),
            jitter: self.reconnect.jitter,
        }
    }

    pub fn device_config(&self) -> DeviceConfig {
        DeviceConfig {
            session: self.session_config(),
            handshake: self.handshake_config(),
            backoff: self.backoff_config(),
        }
    }

    pub fn discovery_config(&self) -> DiscoveryConfig {
        DiscoveryConfig {
            bind: self.discovery.bind,
            timeout: Duration::from_millis(self.discovery.timeout_ms),
        }
    }

    #[cfg(unix)]
    pub fn serial_config(&self) -> deckwire_transport::SerialConfig {
        deckwire_transport::SerialConfig {
            baud_rate: self.serial.baud_rate,
            read_wait: Duration::from_millis(self.serial.read_wait_ms),
            handshake_timeout: Duration::from_millis(self.serial.handshake_timeout_ms),
            upgrade: self.serial.upgrade,
        }
    }

    pub fn network_config(&self) -> NetworkConfig {
        NetworkConfig {
            connect_timeout: Duration::from_millis(self.network.connect_timeout_ms),
        }
    }

    /// Opener for real links using the serial, network and discovery sections.
    pub fn opener(&self) -> SystemOpener {
        SystemOpener {
            #[cfg(unix)]
            serial: self.serial_config(),
            network: self.network_config(),
            discovery: self.discovery_config(),
        }
    }

    /// A disconnected device for `endpoint` configured from every section.
    pub fn device(&self, endpoint: Endpoint) -> Device {
        Device::with_opener(endpoint, self.device_config(), self.opener())
    }
}

impl FromStr for DeckwireConfig {
    type Err = ConfigError;

    fn from_str(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_library_defaults() {
        let config = DeckwireConfig::default();
        let session = config.session_config();
        let expected = SessionConfig::default();
        assert_eq!(session.request_timeout, expected.request_timeout);
        assert_eq!(session.keepalive_interval, expected.keepalive_interval);
        assert_eq!(session.watchdog_timeout, expected.watchdog_timeout);
        assert_eq!(session.max_frame_size, expected.max_frame_size);

        let backoff = config.backoff_config();
        assert_eq!(backoff.initial, BackoffConfig::default().initial);
        assert_eq!(backoff.max, BackoffConfig::default().max);
        assert_eq!(config.discovery_config().bind, DiscoveryConfig::default().bind);
        config.validate().unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn serial_defaults_match_transport() {
        let serial = DeckwireConfig::default().serial_config();
        let expected = deckwire_transport::SerialConfig::default();
        assert_eq!(serial.baud_rate, expected.baud_rate);
        assert_eq!(serial.read_wait, expected.read_wait);
        assert_eq!(serial.handshake_timeout, expected.handshake_timeout);
        assert_eq!(serial.upgrade, expected.upgrade);
    }

    #[test]
    fn empty_document_is_default() {
        let config: DeckwireConfig = "{}".parse().unwrap();
        assert_eq!(config, DeckwireConfig::default());
    }
}
