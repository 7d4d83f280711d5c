use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use crate::error::{Result, TransportError};
use crate::traits::{Framing, Transport};

/// Default WebSocket port devices listen on.
pub const DEFAULT_PORT: u16 = 80;

/// How long `close` waits to deliver the close frame.
const CLOSE_GRACE: Duration = Duration::from_millis(250);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Configuration for a network link.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Deadline for TCP connect plus WebSocket upgrade.
    pub connect_timeout: Duration,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
        }
    }
}

/// Build the WebSocket URL for a device host (with or without port).
pub fn device_url(host: &str) -> String {
    if host.starts_with("ws://") || host.starts_with("wss://") {
        host.to_string()
    } else {
        format!("ws://{host}")
    }
}

/// Message-oriented transport over a WebSocket connection.
///
/// Each binary WebSocket message carries exactly one frame. A peer close
/// frame, end of stream, or protocol error is reported as
/// [`TransportError::LinkLost`]. `close` may be called from any task while
/// another task is blocked in `read`.
pub struct NetworkTransport {
    url: String,
    sink: Mutex<SplitSink<WsStream, WsMessage>>,
    stream: Mutex<SplitStream<WsStream>>,
    shutdown: CancellationToken,
    closed: AtomicBool,
}

impl NetworkTransport {
    /// Connect to `url` (or a bare `host[:port]`).
    pub async fn open(url: &str, config: NetworkConfig) -> Result<Self> {
        let url = device_url(url);
        debug!(%url, "connecting");

        let (ws, _response) = match tokio::time::timeout(
            config.connect_timeout,
            connect_async(url.as_str()),
        )
        .await
        {
            Ok(Ok(connected)) => connected,
            Ok(Err(err)) => {
                return Err(TransportError::ConnectFailed {
                    endpoint: url,
                    reason: err.to_string(),
                })
            }
            Err(_) => {
                return Err(TransportError::ConnectFailed {
                    endpoint: url,
                    reason: format!("timed out after {:?}", config.connect_timeout),
                })
            }
        };

        let (sink, stream) = ws.split();
        info!(%url, "network link open");
        Ok(Self {
            url,
            sink: Mutex::new(sink),
            stream: Mutex::new(stream),
            shutdown: CancellationToken::new(),
            closed: AtomicBool::new(false),
        })
    }

    /// Receive the next binary message.
    pub async fn read_message(&self) -> Result<Bytes> {
        let mut stream = tokio::select! {
            _ = self.shutdown.cancelled() => return Err(TransportError::Closed),
            stream = self.stream.lock() => stream,
        };

        loop {
            let next = tokio::select! {
                _ = self.shutdown.cancelled() => return Err(TransportError::Closed),
                next = stream.next() => next,
            };

            match next {
                Some(Ok(WsMessage::Binary(data))) => {
                    trace!(url = %self.url, len = data.len(), "message received");
                    return Ok(Bytes::from(data));
                }
                Some(Ok(WsMessage::Close(frame))) => {
                    return Err(TransportError::LinkLost(match frame {
                        Some(frame) => format!(
                            "peer closed ({}): {}",
                            u16::from(frame.code),
                            frame.reason
                        ),
                        None => "peer closed".to_string(),
                    }));
                }
                Some(Ok(WsMessage::Text(text))) => {
                    debug!(url = %self.url, len = text.len(), "ignoring text message");
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => return Err(TransportError::LinkLost(err.to_string())),
                None => return Err(TransportError::LinkLost("stream ended".to_string())),
            }
        }
    }
}

#[async_trait]
impl Transport for NetworkTransport {
    fn framing(&self) -> Framing {
        Framing::Message
    }

    fn endpoint(&self) -> &str {
        &self.url
    }

    async fn write(&self, bytes: Bytes) -> Result<()> {
        let mut sink = tokio::select! {
            _ = self.shutdown.cancelled() => return Err(TransportError::Closed),
            sink = self.sink.lock() => sink,
        };

        tokio::select! {
            _ = self.shutdown.cancelled() => Err(TransportError::Closed),
            sent = sink.send(WsMessage::Binary(bytes.to_vec())) => {
                sent.map_err(|e| TransportError::LinkLost(e.to_string()))
            }
        }
    }

    async fn read(&self) -> Result<Bytes> {
        self.read_message().await
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown.cancel();

        // Writers observe the cancellation and release the sink.
        if let Ok(mut sink) = tokio::time::timeout(CLOSE_GRACE, self.sink.lock()).await {
            match tokio::time::timeout(CLOSE_GRACE, sink.close()).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => debug!(url = %self.url, error = %err, "close frame failed"),
                Err(_) => debug!(url = %self.url, "close frame timed out"),
            }
        }
        info!(url = %self.url, "network link closed");
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for NetworkTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkTransport")
            .field("url", &self.url)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use tokio::net::TcpListener;

    use super::*;

    async fn echo_server() -> (String, tokio::task::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            while let Some(Ok(msg)) = ws.next().await {
                match msg {
                    WsMessage::Binary(data) => ws.send(WsMessage::Binary(data)).await.unwrap(),
                    WsMessage::Close(_) => break,
                    _ => {}
                }
            }
        });
        (format!("127.0.0.1:{}", addr.port()), handle)
    }

    #[test]
    fn device_url_adds_scheme_once() {
        assert_eq!(device_url("10.0.0.5"), "ws://10.0.0.5");
        assert_eq!(device_url("ws://10.0.0.5:80"), "ws://10.0.0.5:80");
    }

    #[tokio::test]
    async fn binary_messages_keep_boundaries() {
        let (host, server) = echo_server().await;
        let link = NetworkTransport::open(&host, NetworkConfig::default())
            .await
            .unwrap();
        assert_eq!(link.framing(), Framing::Message);

        link.write(Bytes::from_static(b"\x07\x01")).await.unwrap();
        link.write(Bytes::from_static(b"\x09\x02\x05")).await.unwrap();

        assert_eq!(link.read().await.unwrap().as_ref(), b"\x07\x01");
        assert_eq!(link.read().await.unwrap().as_ref(), b"\x09\x02\x05");

        link.close().await;
        server.await.unwrap();
    }

    #[tokio::test]
    async fn peer_close_is_link_loss() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            ws.close(None).await.unwrap();
        });

        let link = NetworkTransport::open(&addr.to_string(), NetworkConfig::default())
            .await
            .unwrap();
        let err = link.read().await.unwrap_err();
        assert!(matches!(err, TransportError::LinkLost(_)));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn close_unblocks_pending_read() {
        let (host, _server) = echo_server().await;
        let link = std::sync::Arc::new(
            NetworkTransport::open(&host, NetworkConfig::default())
                .await
                .unwrap(),
        );

        let reader = {
            let link = link.clone();
            tokio::spawn(async move { link.read().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        link.close().await;
        link.close().await;

        let err = reader.await.unwrap().unwrap_err();
        assert!(matches!(err, TransportError::Closed));
        assert!(link.is_closed());
    }

    #[tokio::test]
    async fn refused_connection_is_connect_failure() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = NetworkTransport::open(&addr.to_string(), NetworkConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::ConnectFailed { .. }));
    }
}
