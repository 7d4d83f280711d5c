use bytes::{Bytes, BytesMut};
use tracing::{debug, trace};

use crate::codec::{decode_message, decode_stream, encode, FrameConfig, StreamBatch, HEADER_SIZE};
use crate::error::{FrameError, Result};
use deckwire_transport::Framing;

const INITIAL_BUFFER_CAPACITY: usize = 8 * 1024;

/// Framing-aware encoder and decoder for one link.
///
/// For stream links it owns the receive buffer, so chunks may arrive split
/// or coalesced at any byte boundary. For message links each chunk is one
/// frame and nothing is buffered.
pub struct FrameCodec {
    framing: Framing,
    config: FrameConfig,
    buf: BytesMut,
}

impl FrameCodec {
    /// Create a codec for `framing` with default configuration.
    pub fn new(framing: Framing) -> Self {
        Self::with_config(framing, FrameConfig::default())
    }

    /// Create a codec for `framing` with explicit configuration.
    pub fn with_config(framing: Framing, config: FrameConfig) -> Self {
        let capacity = match framing {
            Framing::Stream => INITIAL_BUFFER_CAPACITY,
            Framing::Message => 0,
        };
        Self {
            framing,
            config,
            buf: BytesMut::with_capacity(capacity),
        }
    }

    /// Encode one outgoing message into wire bytes.
    pub fn encode(&self, command: u8, transaction_id: Option<u8>, payload: &[u8]) -> Result<Bytes> {
        let max_payload = self.config.max_frame_size.saturating_sub(HEADER_SIZE);
        if payload.len() > max_payload {
            return Err(FrameError::PayloadTooLarge {
                size: payload.len(),
                max: max_payload,
            });
        }

        let mut dst = BytesMut::new();
        encode(self.framing, command, transaction_id, payload, &mut dst)?;
        Ok(dst.freeze())
    }

    /// Feed one chunk read from the transport and return what it completed.
    ///
    /// An empty chunk on a stream link (an idle read) yields nothing.
    pub fn decode(&mut self, chunk: Bytes) -> StreamBatch {
        match self.framing {
            Framing::Stream => {
                if !chunk.is_empty() {
                    self.buf.extend_from_slice(&chunk);
                }
                let batch = decode_stream(&mut self.buf, self.config.max_frame_size);
                if let Some(err) = &batch.error {
                    debug!(error = %err, "receive buffer discarded");
                }
                trace!(
                    decoded = batch.messages.len(),
                    buffered = self.buf.len(),
                    "stream chunk decoded"
                );
                batch
            }
            Framing::Message => match decode_message(chunk, self.config.max_frame_size) {
                Ok(message) => StreamBatch {
                    messages: vec![message],
                    error: None,
                },
                Err(err) => StreamBatch {
                    messages: Vec::new(),
                    error: Some(err),
                },
            },
        }
    }

    /// Bytes held back waiting for the rest of a frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Drop any partially received frame.
    pub fn reset(&mut self) {
        self.buf.clear();
    }

    /// The framing this codec was built for.
    pub fn framing(&self) -> Framing {
        self.framing
    }

    /// Current codec configuration.
    pub fn config(&self) -> &FrameConfig {
        &self.config
    }
}
