#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use deckwire_frame::command::VERSION;
use deckwire_frame::{decode_frame, decode_message, encode, Message, DEFAULT_MAX_FRAME_SIZE};
use deckwire_session::{Endpoint, Event, EventEmitter, Opener, Session, SessionConfig};
use deckwire_transport::loopback::{self, LoopbackPeer};
use deckwire_transport::{Framing, Transport, TransportError};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Firmware version the fake device reports.
pub const FAKE_VERSION: [u8; 3] = [1, 2, 3];

/// Session config with keepalive and watchdog disabled.
pub fn quiet_config() -> SessionConfig {
    SessionConfig {
        keepalive_interval: std::time::Duration::ZERO,
        watchdog_timeout: std::time::Duration::ZERO,
        ..SessionConfig::default()
    }
}

pub fn start_session(framing: Framing) -> (Arc<Session>, LoopbackPeer, Arc<EventEmitter>) {
    start_session_with(framing, quiet_config())
}

pub fn start_session_with(
    framing: Framing,
    config: SessionConfig,
) -> (Arc<Session>, LoopbackPeer, Arc<EventEmitter>) {
    let (link, peer) = loopback::pair(framing);
    let emitter = Arc::new(EventEmitter::new());
    let session = Session::start(
        Box::new(link),
        emitter.clone(),
        config,
        CancellationToken::new(),
    );
    (session, peer, emitter)
}

pub fn wire(framing: Framing, command: u8, txid: Option<u8>, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::new();
    encode(framing, command, txid, payload, &mut buf).unwrap();
    buf.freeze()
}

/// Next frame written by the session. Each write carries one whole frame.
pub async fn next_frame(peer: &mut LoopbackPeer, framing: Framing) -> Message {
    let chunk = peer.recv().await.expect("session wrote nothing");
    match framing {
        Framing::Message => decode_message(chunk, DEFAULT_MAX_FRAME_SIZE).unwrap(),
        Framing::Stream => {
            let mut buf = BytesMut::from(chunk.as_ref());
            decode_frame(&mut buf, DEFAULT_MAX_FRAME_SIZE)
                .unwrap()
                .expect("partial frame")
        }
    }
}

/// Forwards every published event of the given types into a channel.
pub fn record(emitter: &EventEmitter, types: &[&str]) -> mpsc::UnboundedReceiver<Event> {
    let (tx, rx) = mpsc::unbounded_channel();
    for kind in types {
        let tx = tx.clone();
        emitter.subscribe(*kind, move |event| {
            tx.send(event.clone())?;
            Ok(())
        });
    }
    rx
}

/// Control handle for a fake device behind a loopback link.
#[derive(Clone)]
pub struct FakeDevice {
    kill: CancellationToken,
    inject: mpsc::UnboundedSender<Bytes>,
}

impl FakeDevice {
    /// Drop the link as if the device was unplugged.
    pub fn unplug(&self) {
        self.kill.cancel();
    }

    /// Push raw bytes to the host.
    pub fn send(&self, bytes: Bytes) {
        let _ = self.inject.send(bytes);
    }
}

/// Spawn a device that answers VERSION requests and ignores everything else.
pub fn spawn_fake_device(mut peer: LoopbackPeer, framing: Framing) -> FakeDevice {
    let kill = CancellationToken::new();
    let (inject, mut injected) = mpsc::unbounded_channel::<Bytes>();
    let handle = FakeDevice {
        kill: kill.clone(),
        inject,
    };

    tokio::spawn(async move {
        let mut buf = BytesMut::new();
        loop {
            tokio::select! {
                _ = kill.cancelled() => {
                    peer.disconnect();
                    return;
                }
                Some(bytes) = injected.recv() => {
                    let _ = peer.send(bytes);
                }
                chunk = peer.recv() => {
                    let Some(chunk) = chunk else { return };
                    let requests = match framing {
                        Framing::Message => decode_message(chunk, DEFAULT_MAX_FRAME_SIZE).into_iter().collect::<Vec<_>>(),
                        Framing::Stream => {
                            buf.extend_from_slice(&chunk);
                            let mut out = Vec::new();
                            while let Ok(Some(message)) = decode_frame(&mut buf, DEFAULT_MAX_FRAME_SIZE) {
                                out.push(message);
                            }
                            out
                        }
                    };
                    for request in requests {
                        if request.command == VERSION && request.transaction_id.is_some() {
                            let _ = peer.send(wire(framing, VERSION, request.transaction_id, &FAKE_VERSION));
                        }
                    }
                }
            }
        }
    });

    handle
}

/// What the next `open` call does.
#[derive(Debug, Clone, Copy)]
pub enum Step {
    Open,
    Fail,
}

/// Opener that follows a script and records when each attempt happened.
#[derive(Clone)]
pub struct ScriptedOpener {
    framing: Framing,
    script: Arc<Mutex<VecDeque<Step>>>,
    pub attempts: Arc<Mutex<Vec<Instant>>>,
    pub devices: Arc<Mutex<Vec<FakeDevice>>>,
}

impl ScriptedOpener {
    pub fn new(framing: Framing, steps: &[Step]) -> Self {
        Self {
            framing,
            script: Arc::new(Mutex::new(steps.iter().copied().collect())),
            attempts: Arc::new(Mutex::new(Vec::new())),
            devices: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn attempt_count(&self) -> usize {
        self.attempts.lock().unwrap().len()
    }

    pub fn device(&self, index: usize) -> FakeDevice {
        self.devices.lock().unwrap()[index].clone()
    }
}

#[async_trait]
impl Opener for ScriptedOpener {
    async fn open(&self, endpoint: &Endpoint) -> Result<Box<dyn Transport>, TransportError> {
        self.attempts.lock().unwrap().push(Instant::now());
        let step = self.script.lock().unwrap().pop_front().unwrap_or(Step::Fail);
        match step {
            Step::Fail => Err(TransportError::ConnectFailed {
                endpoint: endpoint.to_string(),
                reason: "connection refused".to_string(),
            }),
            Step::Open => {
                let (link, peer) = loopback::pair(self.framing);
                let device = spawn_fake_device(peer, self.framing);
                self.devices.lock().unwrap().push(device);
                Ok(Box::new(link))
            }
        }
    }
}
