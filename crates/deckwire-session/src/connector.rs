use std::fmt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use deckwire_transport::{NetworkConfig, NetworkTransport, Transport, TransportError};
#[cfg(unix)]
use deckwire_transport::{SerialConfig, SerialTransport};
use tracing::{debug, info};

use crate::discovery::{discover, serial_ports, DiscoveryConfig};

/// Where to find a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// A serial device node, e.g. `/dev/ttyACM0`.
    Serial { path: PathBuf },
    /// A WebSocket URL or bare `host[:port]`.
    Network { url: String },
    /// Whatever is found first: serial ports, then network discovery.
    Auto,
}

impl Endpoint {
    /// Interpret a user-supplied endpoint string.
    ///
    /// `auto` selects [`Endpoint::Auto`], an absolute path selects a serial
    /// port, anything else is treated as a network address.
    pub fn parse(text: &str) -> Self {
        let text = text.trim();
        if text.is_empty() || text.eq_ignore_ascii_case("auto") {
            Endpoint::Auto
        } else if text.starts_with('/') {
            Endpoint::Serial {
                path: PathBuf::from(text),
            }
        } else {
            Endpoint::Network {
                url: text.to_string(),
            }
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Serial { path } => write!(f, "serial:{}", path.display()),
            Endpoint::Network { url } => write!(f, "network:{url}"),
            Endpoint::Auto => f.write_str("auto"),
        }
    }
}

/// Opens transports for endpoints.
///
/// The device uses this for the first connect and for every reconnect
/// attempt, so a test can substitute scripted links and failures.
#[async_trait]
pub trait Opener: Send + Sync + 'static {
    /// Open a fresh transport to `endpoint`.
    async fn open(&self, endpoint: &Endpoint) -> Result<Box<dyn Transport>, TransportError>;
}

/// Opens real serial and network links.
#[derive(Debug, Clone, Default)]
pub struct SystemOpener {
    #[cfg(unix)]
    pub serial: SerialConfig,
    pub network: NetworkConfig,
    pub discovery: DiscoveryConfig,
}

impl SystemOpener {
    #[cfg(unix)]
    async fn open_serial(&self, path: &Path) -> Result<Box<dyn Transport>, TransportError> {
        let link = SerialTransport::open(path, self.serial.clone()).await?;
        Ok(Box::new(link))
    }

    #[cfg(not(unix))]
    async fn open_serial(&self, path: &Path) -> Result<Box<dyn Transport>, TransportError> {
        Err(TransportError::ConnectFailed {
            endpoint: path.display().to_string(),
            reason: "serial links require a Unix platform".to_string(),
        })
    }

    async fn open_network(&self, url: &str) -> Result<Box<dyn Transport>, TransportError> {
        let link = NetworkTransport::open(url, self.network.clone()).await?;
        Ok(Box::new(link))
    }

    async fn open_auto(&self) -> Result<Box<dyn Transport>, TransportError> {
        for path in serial_ports() {
            match self.open_serial(&path).await {
                Ok(link) => {
                    info!(path = %path.display(), "auto-selected serial device");
                    return Ok(link);
                }
                Err(err) => debug!(path = %path.display(), error = %err, "serial candidate failed"),
            }
        }

        for advertised in discover(&self.discovery).await {
            let url = advertised.address.to_string();
            match self.open_network(&url).await {
                Ok(link) => {
                    info!(device = %advertised.device_id, %url, "auto-selected network device");
                    return Ok(link);
                }
                Err(err) => debug!(%url, error = %err, "network candidate failed"),
            }
        }

        Err(TransportError::ConnectFailed {
            endpoint: Endpoint::Auto.to_string(),
            reason: "no devices found".to_string(),
        })
    }
}

#[async_trait]
impl Opener for SystemOpener {
    async fn open(&self, endpoint: &Endpoint) -> Result<Box<dyn Transport>, TransportError> {
        match endpoint {
            Endpoint::Serial { path } => self.open_serial(path).await,
            Endpoint::Network { url } => self.open_network(url).await,
            Endpoint::Auto => self.open_auto().await,
        }
    }
}
