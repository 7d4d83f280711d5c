use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use deckwire_frame::Message;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backoff::{Backoff, BackoffConfig};
use crate::connector::{Endpoint, Opener, SystemOpener};
use crate::emitter::{CallbackError, Event, EventEmitter, SubscriptionId};
use crate::error::{Result, SessionError};
use crate::handshake::{identify, DeviceIdentity, HandshakeConfig};
use crate::reconnect::{LinkEvent, LinkState};
use crate::session::{Session, SessionConfig};

/// Configuration for a supervised device connection.
#[derive(Debug, Clone, Default)]
pub struct DeviceConfig {
    pub session: SessionConfig,
    pub handshake: HandshakeConfig,
    pub backoff: BackoffConfig,
}

struct Link {
    state: LinkState,
    session: Option<Arc<Session>>,
    identity: Option<DeviceIdentity>,
}

struct Inner {
    endpoint: Endpoint,
    opener: Arc<dyn Opener>,
    config: DeviceConfig,
    emitter: Arc<EventEmitter>,
    link: Mutex<Link>,
    shutdown: CancellationToken,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

/// A device connection that survives link loss.
///
/// After a successful [`connect`](Device::connect) a supervisor task watches
/// the live [`Session`]. When it drops, pending requests fail with
/// [`SessionError::ConnectionLost`], a `disconnect` event is published, and
/// the link is reopened with backoff until it succeeds or
/// [`close`](Device::close) is called. Each reconnect installs a brand new
/// session and publishes `connect` again.
///
/// Subscriptions live on the device and carry over across reconnects.
/// Dropping the device stops all background work.
pub struct Device {
    inner: Arc<Inner>,
}

impl Device {
    /// A disconnected device that opens real serial and network links.
    pub fn new(endpoint: Endpoint, config: DeviceConfig) -> Self {
        Self::with_opener(endpoint, config, SystemOpener::default())
    }

    /// A disconnected device that opens links through `opener`.
    pub fn with_opener(endpoint: Endpoint, config: DeviceConfig, opener: impl Opener) -> Self {
        Self {
            inner: Arc::new(Inner {
                endpoint,
                opener: Arc::new(opener),
                config,
                emitter: Arc::new(EventEmitter::new()),
                link: Mutex::new(Link {
                    state: LinkState::Disconnected,
                    session: None,
                    identity: None,
                }),
                shutdown: CancellationToken::new(),
                supervisor: Mutex::new(None),
            }),
        }
    }

    /// Open the link and run the identify handshake.
    ///
    /// A failure here is returned as [`SessionError::ConnectFailed`] and is
    /// not retried. Calling `connect` on a connected device is a no-op.
    pub async fn connect(&self) -> Result<()> {
        if self.inner.transition(LinkEvent::ConnectRequested).is_none() {
            return match self.state() {
                LinkState::Connected => Ok(()),
                state => Err(SessionError::ConnectFailed(format!(
                    "cannot connect while {state}"
                ))),
            };
        }

        info!(endpoint = %self.inner.endpoint, "connecting");
        let (session, identity) = match self.inner.establish().await {
            Ok(established) => established,
            Err(err) => {
                self.inner.transition(LinkEvent::OpenFailed);
                warn!(endpoint = %self.inner.endpoint, error = %err, "connect failed");
                return Err(match err {
                    SessionError::ConnectFailed(_) => err,
                    other => SessionError::ConnectFailed(other.to_string()),
                });
            }
        };

        if !self.inner.install(&session, identity) {
            session.close().await;
            return Err(SessionError::ConnectFailed(
                "device closed during connect".to_string(),
            ));
        }
        self.inner.publish_connect(&session);

        let handle = tokio::spawn(supervise(self.inner.clone(), session));
        *lock(&self.inner.supervisor) = Some(handle);
        Ok(())
    }

    /// Send a request on the current link and wait for its response.
    pub async fn send_request(
        &self,
        command: u8,
        payload: &[u8],
        timeout: Duration,
    ) -> Result<Message> {
        self.inner
            .current()?
            .send_request(command, payload, timeout)
            .await
    }

    /// [`send_request`](Self::send_request) with the configured default deadline.
    pub async fn request(&self, command: u8, payload: &[u8]) -> Result<Message> {
        self.inner.current()?.request(command, payload).await
    }

    /// Send a message that expects no response.
    pub async fn send_fire_and_forget(&self, command: u8, payload: &[u8]) -> Result<()> {
        self.inner
            .current()?
            .send_fire_and_forget(command, payload)
            .await
    }

    /// Subscribe to an event type (`connect`, `disconnect`, `button`, ...).
    pub fn on<F>(&self, event_type: impl Into<String>, callback: F) -> SubscriptionId
    where
        F: Fn(&Event) -> std::result::Result<(), CallbackError> + Send + Sync + 'static,
    {
        self.inner.emitter.subscribe(event_type, callback)
    }

    /// Remove a subscription.
    pub fn off(&self, id: SubscriptionId) -> bool {
        self.inner.emitter.unsubscribe(id)
    }

    /// Stop for good: cancel reconnection, fail pending requests, close the link.
    ///
    /// Publishes a final `disconnect` if the device was connected. Idempotent.
    pub async fn close(&self) {
        let (previous, session) = {
            let mut link = self.inner.lock_link();
            let previous = link.state;
            let Some(next) = previous.apply(LinkEvent::CloseRequested) else {
                return;
            };
            link.state = next;
            (previous, link.session.take())
        };

        debug!(endpoint = %self.inner.endpoint, from = %previous, "closing");
        self.inner.shutdown.cancel();
        if let Some(session) = session {
            session.close().await;
        }
        let supervisor = lock(&self.inner.supervisor).take();
        if let Some(handle) = supervisor {
            let _ = handle.await;
        }

        info!(endpoint = %self.inner.endpoint, "device closed");
        if previous == LinkState::Connected {
            self.inner.emitter.publish(&Event::Disconnect {
                reason: "closed".to_string(),
            });
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> LinkState {
        self.inner.lock_link().state
    }

    /// Whether a live session is installed.
    pub fn is_connected(&self) -> bool {
        self.state() == LinkState::Connected
    }

    /// What the device reported in its most recent handshake.
    pub fn identity(&self) -> Option<DeviceIdentity> {
        self.inner.lock_link().identity.clone()
    }

    /// The endpoint this device connects to.
    pub fn endpoint(&self) -> &Endpoint {
        &self.inner.endpoint
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        self.inner.shutdown.cancel();
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("endpoint", &self.inner.endpoint)
            .field("state", &self.state())
            .finish()
    }
}

/// Create a device for `endpoint` and connect it.
pub async fn connect(endpoint: Endpoint, config: DeviceConfig) -> Result<Device> {
    let device = Device::new(endpoint, config);
    device.connect().await?;
    Ok(device)
}

impl Inner {
    fn lock_link(&self) -> MutexGuard<'_, Link> {
        lock(&self.link)
    }

    /// Apply `event` to the lifecycle state; `None` if it was not valid.
    fn transition(&self, event: LinkEvent) -> Option<LinkState> {
        let mut link = self.lock_link();
        let next = link.state.apply(event)?;
        if next != link.state {
            debug!(from = %link.state, to = %next, ?event, "link state");
        }
        link.state = next;
        Some(next)
    }

    /// Move to `Connected` with `session` installed, unless closed meanwhile.
    fn install(&self, session: &Arc<Session>, identity: Option<DeviceIdentity>) -> bool {
        let mut link = self.lock_link();
        let Some(next) = link.state.apply(LinkEvent::Opened) else {
            return false;
        };
        link.state = next;
        link.session = Some(session.clone());
        link.identity = identity;
        true
    }

    fn current(&self) -> Result<Arc<Session>> {
        let link = self.lock_link();
        link.session
            .clone()
            .ok_or_else(|| SessionError::ConnectionLost(format!("device {}", link.state)))
    }

    fn publish_connect(&self, session: &Session) {
        self.emitter.publish(&Event::Connect {
            endpoint: session.endpoint().to_string(),
        });
    }

    /// Open a transport, start a session on it and identify the device.
    async fn establish(&self) -> Result<(Arc<Session>, Option<DeviceIdentity>)> {
        let transport = tokio::select! {
            _ = self.shutdown.cancelled() => {
                return Err(SessionError::ConnectionLost("device closed".to_string()));
            }
            opened = self.opener.open(&self.endpoint) => {
                opened.map_err(|e| SessionError::ConnectFailed(e.to_string()))?
            }
        };

        let session = Session::start(
            transport,
            self.emitter.clone(),
            self.config.session.clone(),
            self.shutdown.child_token(),
        );
        if !self.config.handshake.enabled {
            return Ok((session, None));
        }

        match identify(&session, &self.config.handshake).await {
            Ok(identity) => Ok((session, Some(identity))),
            Err(err) => {
                session.close().await;
                Err(err)
            }
        }
    }

    /// Reopen with backoff until it works or the device is closed.
    async fn reconnect(&self) -> Option<Arc<Session>> {
        let mut backoff = Backoff::new(self.config.backoff.clone());
        loop {
            let delay = backoff.next_delay();
            info!(
                endpoint = %self.endpoint,
                attempt = backoff.attempt(),
                delay_ms = delay.as_millis() as u64,
                "reconnect scheduled"
            );
            tokio::select! {
                _ = self.shutdown.cancelled() => return None,
                _ = tokio::time::sleep(delay) => {}
            }

            match self.establish().await {
                Ok((session, identity)) => {
                    if self.install(&session, identity) {
                        info!(endpoint = %self.endpoint, attempt = backoff.attempt(), "reconnected");
                        return Some(session);
                    }
                    session.close().await;
                    return None;
                }
                Err(err) => {
                    self.transition(LinkEvent::OpenFailed)?;
                    warn!(
                        endpoint = %self.endpoint,
                        attempt = backoff.attempt(),
                        error = %err,
                        "reconnect attempt failed"
                    );
                }
            }
        }
    }
}

async fn supervise(inner: Arc<Inner>, mut session: Arc<Session>) {
    loop {
        let Some(reason) = session.stopped().await else {
            return;
        };

        {
            let mut link = inner.lock_link();
            let Some(next) = link.state.apply(LinkEvent::LinkLost) else {
                return;
            };
            link.state = next;
            link.session = None;
        }
        warn!(endpoint = %inner.endpoint, %reason, "connection lost");
        inner.emitter.publish(&Event::Disconnect { reason });

        session = match inner.reconnect().await {
            Some(session) => session,
            None => return,
        };
        inner.publish_connect(&session);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
