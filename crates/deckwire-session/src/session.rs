use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use deckwire_frame::command::VERSION;
use deckwire_frame::{FrameCodec, FrameConfig, Framing, Message, StreamBatch, DEFAULT_MAX_FRAME_SIZE};
use deckwire_transport::{Transport, TransportError};
use tokio::sync::oneshot;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::emitter::{Event, EventEmitter};
use crate::error::{Result, SessionError};

/// Number of usable transaction ids. Id 0 is the absent marker.
pub const MAX_PENDING: usize = u8::MAX as usize;

/// Configuration for one session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Deadline used by [`Session::request`].
    pub request_timeout: Duration,
    /// Send a keepalive after this long without inbound traffic. Zero disables.
    ///
    /// The keepalive is a tracked request; its reply is consumed here and
    /// never reaches subscribers.
    pub keepalive_interval: Duration,
    /// Treat the link as lost after this long without inbound traffic. Zero disables.
    pub watchdog_timeout: Duration,
    /// Command sent as the keepalive probe.
    pub keepalive_command: u8,
    /// Largest frame accepted or produced.
    pub max_frame_size: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(5),
            keepalive_interval: Duration::from_secs(5),
            watchdog_timeout: Duration::from_secs(15),
            keepalive_command: VERSION,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

impl SessionConfig {
    fn frame_config(&self) -> FrameConfig {
        FrameConfig {
            max_frame_size: self.max_frame_size,
        }
    }

}

enum Waiter {
    Caller(oneshot::Sender<Result<Message>>),
    Keepalive,
}

struct Slot {
    generation: u64,
    waiter: Waiter,
}

struct Pending {
    next_id: u8,
    generation: u64,
    slots: HashMap<u8, Slot>,
    keepalive: Option<u8>,
    closed: Option<String>,
}

impl Pending {
    fn new() -> Self {
        Self {
            next_id: 1,
            generation: 0,
            slots: HashMap::new(),
            keepalive: None,
            closed: None,
        }
    }

    /// Next id in 1..=255 that is not pending, rotating.
    fn allocate(&mut self) -> Option<u8> {
        for _ in 0..MAX_PENDING {
            let id = self.next_id;
            self.next_id = if id == u8::MAX { 1 } else { id + 1 };
            if !self.slots.contains_key(&id) {
                return Some(id);
            }
        }
        None
    }

    fn insert(&mut self, waiter: Waiter) -> Result<(u8, u64)> {
        let id = self
            .allocate()
            .ok_or(SessionError::TooManyPending(MAX_PENDING))?;
        self.generation += 1;
        let generation = self.generation;
        self.slots.insert(id, Slot { generation, waiter });
        Ok((id, generation))
    }
}

/// One live connection: a transport, its codec, and the pending transactions.
///
/// A background task reads the transport, resolves responses and publishes
/// everything else on the shared [`EventEmitter`]. When the link drops the
/// task fails every pending transaction with
/// [`SessionError::ConnectionLost`] and closes the transport; a session is
/// never revived, the owner starts a new one.
pub struct Session {
    transport: Arc<dyn Transport>,
    encoder: FrameCodec,
    pending: Mutex<Pending>,
    emitter: Arc<EventEmitter>,
    config: SessionConfig,
    shutdown: CancellationToken,
    done: CancellationToken,
    last_inbound: Mutex<Instant>,
    loss: Mutex<Option<String>>,
}

impl Session {
    /// Take ownership of an open transport and start the inbound loop.
    ///
    /// Cancelling `shutdown` (or any parent token) stops the session.
    pub fn start(
        transport: Box<dyn Transport>,
        emitter: Arc<EventEmitter>,
        config: SessionConfig,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        let framing = transport.framing();
        let decoder = FrameCodec::with_config(framing, config.frame_config());
        let session = Arc::new(Self {
            transport: Arc::from(transport),
            encoder: FrameCodec::with_config(framing, config.frame_config()),
            pending: Mutex::new(Pending::new()),
            emitter,
            config,
            shutdown,
            done: CancellationToken::new(),
            last_inbound: Mutex::new(Instant::now()),
            loss: Mutex::new(None),
        });

        tokio::spawn(session.clone().run(decoder));
        session
    }

    /// Send a request and wait for the response carrying its transaction id.
    pub async fn send_request(
        &self,
        command: u8,
        payload: &[u8],
        timeout: Duration,
    ) -> Result<Message> {
        let (id, generation, rx) = self.register()?;
        let mut guard = PendingGuard {
            session: self,
            id,
            generation,
            active: true,
        };

        let frame = self.encoder.encode(command, Some(id), payload)?;
        trace!(command, transaction_id = id, len = payload.len(), "request");
        self.transport.write(frame).await?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => {
                guard.disarm();
                result
            }
            Ok(Err(_)) => {
                guard.disarm();
                Err(SessionError::ConnectionLost(self.closed_reason()))
            }
            Err(_) => {
                debug!(command, transaction_id = id, ?timeout, "request timed out");
                Err(SessionError::TransactionTimeout(timeout))
            }
        }
    }

    /// [`send_request`](Self::send_request) with the configured default deadline.
    pub async fn request(&self, command: u8, payload: &[u8]) -> Result<Message> {
        self.send_request(command, payload, self.config.request_timeout)
            .await
    }

    /// Send a message that expects no response.
    pub async fn send_fire_and_forget(&self, command: u8, payload: &[u8]) -> Result<()> {
        self.ensure_open()?;
        let frame = self.encoder.encode(command, None, payload)?;
        trace!(command, len = payload.len(), "fire-and-forget");
        self.transport.write(frame).await?;
        Ok(())
    }

    /// Stop the inbound loop, fail pending requests and close the transport.
    ///
    /// Returns once the loop has finished. Idempotent.
    pub async fn close(&self) {
        self.shutdown.cancel();
        self.done.cancelled().await;
    }

    /// Wait until the session has stopped.
    ///
    /// Returns the loss reason, or `None` if the session was closed on request.
    pub async fn stopped(&self) -> Option<String> {
        self.done.cancelled().await;
        self.lock_loss().clone()
    }

    /// Whether the inbound loop has finished.
    pub fn is_closed(&self) -> bool {
        self.done.is_cancelled()
    }

    /// Description of the remote endpoint.
    pub fn endpoint(&self) -> &str {
        self.transport.endpoint()
    }

    /// Framing of the underlying transport.
    pub fn framing(&self) -> Framing {
        self.transport.framing()
    }

    /// Number of caller requests waiting for a response.
    pub fn pending_count(&self) -> usize {
        self.lock_pending()
            .slots
            .values()
            .filter(|slot| matches!(slot.waiter, Waiter::Caller(_)))
            .count()
    }

    async fn run(self: Arc<Self>, mut decoder: FrameCodec) {
        info!(
            endpoint = %self.endpoint(),
            framing = self.framing().name(),
            "session started"
        );
        let mut ticker = ticker(self.config.keepalive_interval);

        let loss = loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break None,
                read = self.transport.read() => match read {
                    Ok(chunk) => {
                        if !chunk.is_empty() {
                            *lock(&self.last_inbound) = Instant::now();
                        }
                        self.dispatch(decoder.decode(chunk));
                    }
                    Err(TransportError::Closed) if self.shutdown.is_cancelled() => break None,
                    Err(err) => break Some(err.to_string()),
                },
                _ = until(self.watchdog_deadline()) => {
                    let idle = lock(&self.last_inbound).elapsed();
                    break Some(format!("no inbound traffic for {idle:?}"));
                }
                _ = tick(&mut ticker) => {
                    if let Some(reason) = self.keepalive().await {
                        break Some(reason);
                    }
                }
            }
        };

        let reason = match &loss {
            Some(reason) => {
                warn!(endpoint = %self.endpoint(), %reason, "link lost");
                reason.clone()
            }
            None => "session closed".to_string(),
        };
        *self.lock_loss() = loss;

        self.fail_pending(&reason);
        self.transport.close().await;
        self.done.cancel();
        info!(endpoint = %self.endpoint(), "session stopped");
    }

    fn dispatch(&self, batch: StreamBatch) {
        if let Some(err) = batch.error {
            warn!(endpoint = %self.endpoint(), error = %err, "discarded undecodable inbound data");
        }
        for message in batch.messages {
            if let Some(event) = self.resolve(message) {
                trace!(command = event.command, "event");
                self.emitter.publish(&Event::Message(event));
            }
        }
    }

    /// Complete the matching transaction, or hand the message back as an event.
    fn resolve(&self, message: Message) -> Option<Message> {
        let Some(id) = message.transaction_id else {
            return Some(message);
        };
        let tx = {
            let mut pending = self.lock_pending();
            match pending.slots.remove(&id) {
                None => return Some(message),
                Some(Slot {
                    waiter: Waiter::Keepalive,
                    ..
                }) => {
                    pending.keepalive = None;
                    trace!(transaction_id = id, "keepalive answered");
                    return None;
                }
                Some(Slot {
                    waiter: Waiter::Caller(tx),
                    ..
                }) => tx,
            }
        };

        debug!(command = message.command, transaction_id = id, "response");
        match tx.send(Ok(message)) {
            Ok(()) => None,
            Err(Ok(message)) => {
                debug!(transaction_id = id, "caller gone, routing response as event");
                Some(message)
            }
            Err(Err(_)) => None,
        }
    }

    fn watchdog_deadline(&self) -> Option<Instant> {
        let watchdog = self.config.watchdog_timeout;
        if watchdog.is_zero() {
            return None;
        }
        Some(*lock(&self.last_inbound) + watchdog)
    }

    /// Probe a quiet link. Returns a loss reason if the probe cannot be sent.
    async fn keepalive(&self) -> Option<String> {
        let idle = lock(&self.last_inbound).elapsed();
        if idle < self.config.keepalive_interval {
            return None;
        }

        let id = {
            let mut pending = self.lock_pending();
            if pending.closed.is_some() {
                return None;
            }
            if let Some(stale) = pending.keepalive.take() {
                if matches!(
                    pending.slots.get(&stale),
                    Some(Slot {
                        waiter: Waiter::Keepalive,
                        ..
                    })
                ) {
                    pending.slots.remove(&stale);
                    trace!(transaction_id = stale, "keepalive unanswered");
                }
            }
            match pending.insert(Waiter::Keepalive) {
                Ok((id, _)) => {
                    pending.keepalive = Some(id);
                    id
                }
                Err(err) => {
                    debug!(error = %err, "keepalive skipped");
                    return None;
                }
            }
        };

        debug!(endpoint = %self.endpoint(), ?idle, transaction_id = id, "keepalive");
        let sent = match self
            .encoder
            .encode(self.config.keepalive_command, Some(id), &[])
        {
            Ok(frame) => self.transport.write(frame).await.map_err(SessionError::from),
            Err(err) => Err(err.into()),
        };
        sent.err().map(|err| format!("keepalive failed: {err}"))
    }

    fn register(&self) -> Result<(u8, u64, oneshot::Receiver<Result<Message>>)> {
        let mut pending = self.lock_pending();
        if let Some(reason) = &pending.closed {
            return Err(SessionError::ConnectionLost(reason.clone()));
        }
        let (tx, rx) = oneshot::channel();
        let (id, generation) = pending.insert(Waiter::Caller(tx))?;
        Ok((id, generation, rx))
    }

    fn fail_pending(&self, reason: &str) {
        let slots: Vec<oneshot::Sender<Result<Message>>> = {
            let mut pending = self.lock_pending();
            pending.closed = Some(reason.to_string());
            pending.keepalive = None;
            pending
                .slots
                .drain()
                .filter_map(|(_, slot)| match slot.waiter {
                    Waiter::Caller(tx) => Some(tx),
                    Waiter::Keepalive => None,
                })
                .collect()
        };
        if !slots.is_empty() {
            debug!(count = slots.len(), %reason, "failing pending requests");
        }
        for tx in slots {
            let _ = tx.send(Err(SessionError::ConnectionLost(reason.to_string())));
        }
    }

    fn ensure_open(&self) -> Result<()> {
        match &self.lock_pending().closed {
            Some(reason) => Err(SessionError::ConnectionLost(reason.clone())),
            None => Ok(()),
        }
    }

    fn closed_reason(&self) -> String {
        self.lock_pending()
            .closed
            .clone()
            .unwrap_or_else(|| "session closed".to_string())
    }

    fn lock_pending(&self) -> MutexGuard<'_, Pending> {
        lock(&self.pending)
    }

    fn lock_loss(&self) -> MutexGuard<'_, Option<String>> {
        lock(&self.loss)
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("endpoint", &self.endpoint())
            .field("framing", &self.framing())
            .field("pending", &self.pending_count())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Removes an abandoned transaction (timeout or dropped caller).
struct PendingGuard<'a> {
    session: &'a Session,
    id: u8,
    generation: u64,
    active: bool,
}

impl PendingGuard<'_> {
    fn disarm(&mut self) {
        self.active = false;
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if !self.active {
            return;
        }
        let mut pending = self.session.lock_pending();
        if matches!(pending.slots.get(&self.id), Some(slot) if slot.generation == self.generation) {
            pending.slots.remove(&self.id);
            trace!(transaction_id = self.id, "abandoned transaction removed");
        }
    }
}

fn ticker(period: Duration) -> Option<Interval> {
    if period.is_zero() {
        return None;
    }
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    Some(interval)
}

async fn until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}

async fn tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
