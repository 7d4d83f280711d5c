use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::os::fd::AsRawFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::io::unix::AsyncFd;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Result, TransportError};
use crate::traits::{Framing, Transport};

/// Line speed the devices are opened at. It has no termios constant on
/// Linux, so it is set through `termios2` there.
pub const DEFAULT_BAUD_RATE: u32 = 256_000;

/// HTTP upgrade request the device expects before framed traffic.
const UPGRADE_REQUEST: &[u8] = b"GET /index.html\r\nHTTP/1.1\r\nConnection: Upgrade\r\nUpgrade: websocket\r\nSec-WebSocket-Key: 123abc\r\n\r\n";
const UPGRADE_RESPONSE_PREFIX: &[u8] = b"HTTP/1.1";
const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";
const MAX_UPGRADE_RESPONSE: usize = 4 * 1024;

/// Written on close so the device drops back to its idle state.
const CLOSE_MARKER: [u8; 6] = [0x88, 0x80, 0x00, 0x00, 0x00, 0x00];

const READ_CHUNK_SIZE: usize = 8 * 1024;

/// Configuration for a serial link.
#[derive(Debug, Clone)]
pub struct SerialConfig {
    /// Line speed in baud.
    pub baud_rate: u32,
    /// Upper bound for a single `read` before it returns no bytes.
    pub read_wait: Duration,
    /// Deadline for the upgrade exchange.
    pub handshake_timeout: Duration,
    /// Perform the HTTP upgrade exchange after opening.
    pub upgrade: bool,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            baud_rate: DEFAULT_BAUD_RATE,
            read_wait: Duration::from_millis(100),
            handshake_timeout: Duration::from_secs(2),
            upgrade: true,
        }
    }
}

/// Byte-stream transport over a tty device node.
///
/// The descriptor is opened non-blocking, switched to raw mode and driven
/// through tokio's reactor. Any read or write failure is reported as
/// [`TransportError::LinkLost`].
pub struct SerialTransport {
    path: PathBuf,
    name: String,
    config: SerialConfig,
    fd: Mutex<Option<Arc<AsyncFd<File>>>>,
    leftover: Mutex<BytesMut>,
    write_lock: tokio::sync::Mutex<()>,
    shutdown: CancellationToken,
    closed: AtomicBool,
}

impl SerialTransport {
    /// Open the device at `path`, configure the line and run the upgrade exchange.
    pub async fn open(path: impl AsRef<Path>, config: SerialConfig) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let name = path.display().to_string();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NOCTTY | libc::O_NONBLOCK)
            .open(&path)
            .map_err(|e| TransportError::ConnectFailed {
                endpoint: name.clone(),
                reason: e.to_string(),
            })?;

        configure_raw(&file, config.baud_rate).map_err(|e| match e {
            TransportError::UnsupportedBaudRate(rate) => TransportError::UnsupportedBaudRate(rate),
            other => TransportError::ConnectFailed {
                endpoint: name.clone(),
                reason: other.to_string(),
            },
        })?;

        let fd = AsyncFd::new(file).map_err(|e| TransportError::ConnectFailed {
            endpoint: name.clone(),
            reason: e.to_string(),
        })?;

        let transport = Self {
            path,
            name,
            config,
            fd: Mutex::new(Some(Arc::new(fd))),
            leftover: Mutex::new(BytesMut::new()),
            write_lock: tokio::sync::Mutex::new(()),
            shutdown: CancellationToken::new(),
            closed: AtomicBool::new(false),
        };

        if transport.config.upgrade {
            match tokio::time::timeout(transport.config.handshake_timeout, transport.upgrade())
                .await
            {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    transport.close().await;
                    return Err(err);
                }
                Err(_) => {
                    transport.close().await;
                    return Err(TransportError::Handshake {
                        endpoint: transport.name.clone(),
                        reason: format!(
                            "no upgrade response within {:?}",
                            transport.config.handshake_timeout
                        ),
                    });
                }
            }
        }

        info!(path = %transport.name, baud = transport.config.baud_rate, "serial link open");
        Ok(transport)
    }

    /// The device path this link was opened on.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read whatever bytes are available, waiting at most `read_wait`.
    pub async fn read_available(&self) -> Result<Bytes> {
        {
            let mut leftover = lock(&self.leftover);
            if !leftover.is_empty() {
                return Ok(leftover.split().freeze());
            }
        }

        let fd = self.handle()?;
        tokio::select! {
            _ = self.shutdown.cancelled() => Err(TransportError::Closed),
            read = tokio::time::timeout(self.config.read_wait, read_some(&fd)) => match read {
                Ok(result) => result,
                Err(_) => Ok(Bytes::new()),
            },
        }
    }

    async fn write_all(&self, bytes: &[u8]) -> Result<()> {
        let fd = self.handle()?;
        let _serialized = self.write_lock.lock().await;

        let mut offset = 0usize;
        while offset < bytes.len() {
            let mut guard = tokio::select! {
                _ = self.shutdown.cancelled() => return Err(TransportError::Closed),
                guard = fd.writable() => guard.map_err(|e| TransportError::LinkLost(e.to_string()))?,
            };

            match guard.try_io(|inner| {
                let mut file: &File = inner.get_ref();
                file.write(&bytes[offset..])
            }) {
                Ok(Ok(0)) => {
                    return Err(TransportError::LinkLost(
                        "serial device accepted no bytes".to_string(),
                    ))
                }
                Ok(Ok(n)) => offset += n,
                Ok(Err(err)) if err.kind() == ErrorKind::Interrupted => continue,
                Ok(Err(err)) => return Err(TransportError::LinkLost(err.to_string())),
                Err(_would_block) => continue,
            }
        }
        Ok(())
    }

    async fn upgrade(&self) -> Result<()> {
        self.write_all(UPGRADE_REQUEST).await?;

        let fd = self.handle()?;
        let mut response = BytesMut::new();
        loop {
            let chunk = read_some(&fd).await?;
            response.extend_from_slice(&chunk);

            if let Some(end) = find(&response, HEADER_TERMINATOR) {
                if !response.starts_with(UPGRADE_RESPONSE_PREFIX) {
                    return Err(TransportError::Handshake {
                        endpoint: self.name.clone(),
                        reason: format!(
                            "invalid upgrade response: {:?}",
                            String::from_utf8_lossy(&response[..end])
                        ),
                    });
                }
                let rest = response.split_off(end + HEADER_TERMINATOR.len());
                if !rest.is_empty() {
                    debug!(path = %self.name, bytes = rest.len(), "retaining bytes after upgrade");
                    lock(&self.leftover).extend_from_slice(&rest);
                }
                debug!(path = %self.name, "upgrade exchange complete");
                return Ok(());
            }

            if response.len() > MAX_UPGRADE_RESPONSE {
                return Err(TransportError::Handshake {
                    endpoint: self.name.clone(),
                    reason: format!("upgrade response exceeds {MAX_UPGRADE_RESPONSE} bytes"),
                });
            }
        }
    }

    fn handle(&self) -> Result<Arc<AsyncFd<File>>> {
        lock(&self.fd).clone().ok_or(TransportError::Closed)
    }
}

#[async_trait]
impl Transport for SerialTransport {
    fn framing(&self) -> Framing {
        Framing::Stream
    }

    fn endpoint(&self) -> &str {
        &self.name
    }

    async fn write(&self, bytes: Bytes) -> Result<()> {
        self.write_all(&bytes).await
    }

    async fn read(&self) -> Result<Bytes> {
        self.read_available().await
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown.cancel();

        let handle = lock(&self.fd).take();
        if let Some(fd) = handle {
            let mut file: &File = fd.get_ref();
            if let Err(err) = file.write(&CLOSE_MARKER) {
                debug!(path = %self.name, error = %err, "close marker not written");
            }
            info!(path = %self.name, "serial link closed");
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for SerialTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialTransport")
            .field("path", &self.path)
            .field("baud_rate", &self.config.baud_rate)
            .field("closed", &self.is_closed())
            .finish()
    }
}

async fn read_some(fd: &AsyncFd<File>) -> Result<Bytes> {
    let mut buf = vec![0u8; READ_CHUNK_SIZE];
    loop {
        let mut guard = fd
            .readable()
            .await
            .map_err(|e| TransportError::LinkLost(e.to_string()))?;

        match guard.try_io(|inner| {
            let mut file: &File = inner.get_ref();
            file.read(&mut buf)
        }) {
            Ok(Ok(0)) => {
                return Err(TransportError::LinkLost(
                    "serial device reached end of file".to_string(),
                ))
            }
            Ok(Ok(n)) => {
                buf.truncate(n);
                return Ok(Bytes::from(buf));
            }
            Ok(Err(err)) if err.kind() == ErrorKind::Interrupted => continue,
            Ok(Err(err)) => return Err(TransportError::LinkLost(err.to_string())),
            Err(_would_block) => continue,
        }
    }
}

fn configure_raw(file: &File, baud_rate: u32) -> Result<()> {
    if baud_rate == 0 {
        return Err(TransportError::UnsupportedBaudRate(baud_rate));
    }
    let fd = file.as_raw_fd();

    // SAFETY: an all-zero termios is a valid out-parameter for tcgetattr.
    let mut tio: libc::termios = unsafe { std::mem::zeroed() };

    // SAFETY: `fd` is an open descriptor owned by `file` and `tio` is writable.
    if unsafe { libc::tcgetattr(fd, &mut tio) } != 0 {
        return Err(std::io::Error::last_os_error().into());
    }

    // SAFETY: `tio` was initialised by tcgetattr above.
    unsafe { libc::cfmakeraw(&mut tio) };
    tio.c_cflag |= libc::CLOCAL | libc::CREAD;

    let standard = standard_speed(baud_rate);
    if let Some(speed) = standard {
        // SAFETY: `tio` is a valid termios and `speed` a platform speed value.
        let speed_rc =
            unsafe { libc::cfsetispeed(&mut tio, speed) | libc::cfsetospeed(&mut tio, speed) };
        if speed_rc != 0 {
            return Err(TransportError::UnsupportedBaudRate(baud_rate));
        }
    }

    // SAFETY: `fd` is still open and `tio` is fully initialised.
    if unsafe { libc::tcsetattr(fd, libc::TCSANOW, &tio) } != 0 {
        return Err(std::io::Error::last_os_error().into());
    }

    if standard.is_none() {
        set_custom_speed(fd, baud_rate)?;
    }
    Ok(())
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn standard_speed(rate: u32) -> Option<libc::speed_t> {
    let speed = match rate {
        9_600 => libc::B9600,
        19_200 => libc::B19200,
        38_400 => libc::B38400,
        57_600 => libc::B57600,
        115_200 => libc::B115200,
        230_400 => libc::B230400,
        460_800 => libc::B460800,
        921_600 => libc::B921600,
        _ => return None,
    };
    Some(speed)
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn standard_speed(rate: u32) -> Option<libc::speed_t> {
    // BSD-derived termios takes the literal rate.
    Some(rate as libc::speed_t)
}

#[cfg(all(
    target_os = "linux",
    target_env = "gnu",
    any(
        target_arch = "x86",
        target_arch = "x86_64",
        target_arch = "arm",
        target_arch = "aarch64"
    )
))]
fn set_custom_speed(fd: std::os::fd::RawFd, rate: u32) -> Result<()> {
    // _IOR/_IOW('T', 0x2A/0x2B, struct termios2) on the generic ioctl layout.
    const TCGETS2: libc::c_ulong = 0x802c_542a;
    const TCSETS2: libc::c_ulong = 0x402c_542b;

    // SAFETY: an all-zero termios2 is a valid out-parameter for TCGETS2.
    let mut tio: libc::termios2 = unsafe { std::mem::zeroed() };

    // SAFETY: `fd` is open and `tio` is a writable termios2.
    if unsafe { libc::ioctl(fd, TCGETS2, &mut tio) } != 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    tio.c_cflag &= !libc::CBAUD;
    tio.c_cflag |= libc::BOTHER;
    tio.c_ispeed = rate;
    tio.c_ospeed = rate;

    // SAFETY: `fd` is open and `tio` was filled by TCGETS2 above.
    if unsafe { libc::ioctl(fd, TCSETS2, &tio) } != 0 {
        warn!(baud = rate, error = %std::io::Error::last_os_error(), "custom baud rate refused");
        return Err(TransportError::UnsupportedBaudRate(rate));
    }
    debug!(baud = rate, "custom baud rate set");
    Ok(())
}

#[cfg(not(all(
    target_os = "linux",
    target_env = "gnu",
    any(
        target_arch = "x86",
        target_arch = "x86_64",
        target_arch = "arm",
        target_arch = "aarch64"
    )
)))]
fn set_custom_speed(_fd: std::os::fd::RawFd, rate: u32) -> Result<()> {
    warn!(baud = rate, "baud rate has no termios constant");
    Err(TransportError::UnsupportedBaudRate(rate))
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
