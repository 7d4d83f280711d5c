//! Finding devices: UDP advertisements on the local network and USB serial ports.
//!
//! Each [`DiscoverySession`] owns its own socket and dedup set. Sessions are
//! independent; nothing here is process-global.

use std::collections::HashSet;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use deckwire_transport::network::{device_url, DEFAULT_PORT};
use serde::Deserialize;
use tokio::net::UdpSocket;
use tracing::{debug, info, trace, warn};

use crate::connector::Endpoint;

/// UDP port devices broadcast advertisements to.
pub const DEFAULT_DISCOVERY_PORT: u16 = 40_303;

/// Protocol version assumed when an advertisement omits it.
pub const DEFAULT_PROTOCOL_VERSION: &str = "1";

/// USB vendor ids of supported devices.
pub const KNOWN_VENDOR_IDS: [u16; 2] = [0x2ec2, 0x1532];

const MAX_ADVERTISEMENT: usize = 2048;

/// Configuration for network discovery.
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Local address to listen on.
    pub bind: SocketAddr,
    /// How long [`discover`] listens before giving up.
    pub timeout: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), DEFAULT_DISCOVERY_PORT),
            timeout: Duration::from_secs(3),
        }
    }
}

/// A device reachable over the network transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdvertisedEndpoint {
    /// Address of the device's WebSocket listener.
    pub address: SocketAddr,
    /// Stable device identifier.
    pub device_id: String,
    /// Advertised protocol version.
    pub protocol_version: String,
}

impl AdvertisedEndpoint {
    /// Endpoint for connecting to this device.
    pub fn to_endpoint(&self) -> Endpoint {
        Endpoint::Network {
            url: device_url(&self.address.to_string()),
        }
    }
}

#[derive(Debug, Deserialize)]
struct Advertisement {
    id: String,
    #[serde(default = "default_version")]
    version: String,
    #[serde(default, alias = "host")]
    address: Option<String>,
    #[serde(default)]
    port: Option<u16>,
}

fn default_version() -> String {
    DEFAULT_PROTOCOL_VERSION.to_string()
}

/// Parse one advertisement datagram received from `source`.
///
/// Unknown fields are ignored. A missing address means the sender's own
/// address; a missing port means the default WebSocket port.
pub fn parse_advertisement(datagram: &[u8], source: SocketAddr) -> Option<AdvertisedEndpoint> {
    let ad: Advertisement = match serde_json::from_slice(datagram) {
        Ok(ad) => ad,
        Err(err) => {
            debug!(%source, error = %err, "ignoring malformed advertisement");
            return None;
        }
    };
    if ad.id.is_empty() {
        debug!(%source, "ignoring advertisement without device id");
        return None;
    }

    let address = match ad.address.as_deref() {
        None => SocketAddr::new(source.ip(), ad.port.unwrap_or(DEFAULT_PORT)),
        Some(text) => match text.parse::<SocketAddr>() {
            Ok(addr) => addr,
            Err(_) => match text.parse::<IpAddr>() {
                Ok(ip) => SocketAddr::new(ip, ad.port.unwrap_or(DEFAULT_PORT)),
                Err(_) => {
                    debug!(%source, address = text, "ignoring advertisement with bad address");
                    return None;
                }
            },
        },
    };

    Some(AdvertisedEndpoint {
        address,
        device_id: ad.id,
        protocol_version: ad.version,
    })
}

/// One listening period with its own dedup set.
///
/// `start` may be called again after `stop`; each start begins a new
/// session in which every device is reported once.
#[derive(Debug)]
pub struct DiscoverySession {
    config: DiscoveryConfig,
    socket: Option<UdpSocket>,
    seen: HashSet<String>,
}

impl DiscoverySession {
    /// Create a stopped session.
    pub fn new(config: DiscoveryConfig) -> Self {
        Self {
            config,
            socket: None,
            seen: HashSet::new(),
        }
    }

    /// Bind the listening socket. Returns the bound address.
    pub async fn start(&mut self) -> io::Result<SocketAddr> {
        self.stop();
        let socket = UdpSocket::bind(self.config.bind).await?;
        socket.set_broadcast(true)?;
        let local = socket.local_addr()?;
        info!(%local, "discovery started");
        self.socket = Some(socket);
        Ok(local)
    }

    /// Release the socket and forget which devices were seen.
    pub fn stop(&mut self) {
        if self.socket.take().is_some() {
            debug!(devices = self.seen.len(), "discovery stopped");
        }
        self.seen.clear();
    }

    /// Whether the session is listening.
    pub fn is_running(&self) -> bool {
        self.socket.is_some()
    }

    /// Wait for the next device not yet reported in this session.
    ///
    /// Returns `None` when the session is stopped or the socket fails.
    pub async fn next(&mut self) -> Option<AdvertisedEndpoint> {
        let socket = self.socket.as_ref()?;
        let mut buf = vec![0u8; MAX_ADVERTISEMENT];
        loop {
            let (len, source) = match socket.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(err) => {
                    warn!(error = %err, "discovery socket failed");
                    return None;
                }
            };
            let Some(endpoint) = parse_advertisement(&buf[..len], source) else {
                continue;
            };
            if !self.seen.insert(endpoint.device_id.clone()) {
                trace!(device = %endpoint.device_id, "duplicate advertisement");
                continue;
            }
            info!(
                device = %endpoint.device_id,
                address = %endpoint.address,
                version = %endpoint.protocol_version,
                "device discovered"
            );
            return Some(endpoint);
        }
    }

    /// Collect every new device seen within `window`.
    pub async fn collect(&mut self, window: Duration) -> Vec<AdvertisedEndpoint> {
        let mut found = Vec::new();
        let deadline = tokio::time::Instant::now() + window;
        while let Ok(Some(endpoint)) = tokio::time::timeout_at(deadline, self.next()).await {
            found.push(endpoint);
        }
        found
    }
}

/// Listen for `config.timeout` and return every device heard from.
///
/// Finding nothing, or failing to listen at all, yields an empty list.
pub async fn discover(config: &DiscoveryConfig) -> Vec<AdvertisedEndpoint> {
    let mut session = DiscoverySession::new(config.clone());
    if let Err(err) = session.start().await {
        warn!(bind = %config.bind, error = %err, "discovery unavailable");
        return Vec::new();
    }
    let found = session.collect(config.timeout).await;
    session.stop();
    if found.is_empty() {
        info!(timeout = ?config.timeout, "no devices discovered");
    }
    found
}

/// Serial device nodes whose USB vendor is a supported one.
pub fn serial_ports() -> Vec<PathBuf> {
    if cfg!(target_os = "linux") {
        scan_tty_class(Path::new("/sys/class/tty"), Path::new("/dev"))
    } else {
        Vec::new()
    }
}

fn scan_tty_class(class_dir: &Path, dev_dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(class_dir) else {
        return Vec::new();
    };

    let mut ports: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| {
            vendor_id(&entry.path()).is_some_and(|vendor| KNOWN_VENDOR_IDS.contains(&vendor))
        })
        .map(|entry| dev_dir.join(entry.file_name()))
        .collect();
    ports.sort();
    ports
}

/// USB vendor id of a tty class entry: `device/../idVendor` for CDC-ACM interfaces.
fn vendor_id(tty: &Path) -> Option<u16> {
    let text = std::fs::read_to_string(tty.join("device").join("..").join("idVendor")).ok()?;
    u16::from_str_radix(text.trim(), 16).ok()
}
