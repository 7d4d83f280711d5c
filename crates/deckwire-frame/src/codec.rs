use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{FrameError, Result};
use deckwire_transport::Framing;

/// First byte of every stream frame: a final, unfragmented binary frame.
pub const FRAME_MAGIC: u8 = 0x82;

/// Smallest stream prefix: the magic byte and one length byte.
pub const MIN_PREFIX_SIZE: usize = 2;

/// Frame header after the prefix: command (1) + transaction id (1).
pub const HEADER_SIZE: usize = 2;

/// Transaction id carried by frames that belong to no transaction.
pub const NO_TRANSACTION: u8 = 0;

/// Default maximum frame size (header + payload): 1 MiB.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 1024 * 1024;

const MASK_BIT: u8 = 0x80;
const LENGTH_MASK: u8 = 0x7f;
const MAX_SHORT_LENGTH: usize = 125;
const LENGTH_16: u8 = 126;
const LENGTH_64: u8 = 127;
const MASK_KEY_SIZE: usize = 4;

/// A decoded logical message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Command identifier.
    pub command: u8,
    /// Transaction id, or `None` for the absent marker.
    pub transaction_id: Option<u8>,
    /// Opaque payload.
    pub payload: Bytes,
}

impl Message {
    /// Create a new message.
    pub fn new(command: u8, transaction_id: Option<u8>, payload: impl Into<Bytes>) -> Self {
        Self {
            command,
            transaction_id: transaction_id.filter(|id| *id != NO_TRANSACTION),
            payload: payload.into(),
        }
    }

    /// The total wire size of this message under `framing`, as encoded here.
    pub fn wire_size(&self, framing: Framing) -> usize {
        let body = HEADER_SIZE + self.payload.len();
        match framing {
            Framing::Stream => stream_prefix_size(body) + body,
            Framing::Message => body,
        }
    }
}

/// Messages decoded from one pass over an accumulating buffer.
#[derive(Debug, Default)]
pub struct StreamBatch {
    /// Complete messages, in wire order.
    pub messages: Vec<Message>,
    /// Set when the buffer was discarded to resynchronise.
    pub error: Option<FrameError>,
}

/// Prefix size [`encode_frame`] writes in front of a `body_len`-byte body.
pub fn stream_prefix_size(body_len: usize) -> usize {
    let extended = match body_len {
        0..=MAX_SHORT_LENGTH => 0,
        126..=0xffff => 2,
        _ => 8,
    };
    MIN_PREFIX_SIZE + extended + MASK_KEY_SIZE
}

/// Encode a frame for a byte-stream link.
///
/// Stream links carry WebSocket binary frames after the serial upgrade:
/// ```text
/// ┌───────┬──────────────┬──────────────┬──────────┬──────────┬────────┬─────────┐
/// │ 0x82  │ M | Len (7b) │ Ext length   │ Mask key │ Command  │ Txn id │ Payload │
/// │ (1B)  │ (1B)         │ (0, 2 or 8B) │ (0 or 4B)│ (1B)     │ (1B)   │         │
/// └───────┴──────────────┴──────────────┴──────────┴──────────┴────────┴─────────┘
/// ```
/// Length covers command, transaction id and payload. A 7-bit length of
/// 126 or 127 means a 16- or 64-bit big-endian length follows. Frames
/// written here are host frames: masked with an all-zero key, which
/// leaves the body unchanged.
pub fn encode_frame(
    command: u8,
    transaction_id: Option<u8>,
    payload: &[u8],
    dst: &mut BytesMut,
) -> Result<()> {
    let body = HEADER_SIZE + payload.len();
    dst.reserve(stream_prefix_size(body) + body);
    dst.put_u8(FRAME_MAGIC);
    match body {
        0..=MAX_SHORT_LENGTH => dst.put_u8(MASK_BIT | body as u8),
        126..=0xffff => {
            dst.put_u8(MASK_BIT | LENGTH_16);
            dst.put_u16(body as u16);
        }
        _ => {
            dst.put_u8(MASK_BIT | LENGTH_64);
            dst.put_u64(body as u64);
        }
    }
    dst.put_bytes(0, MASK_KEY_SIZE);
    put_body(command, transaction_id, payload, dst);
    Ok(())
}

/// Encode a frame for a message link (no length prefix).
pub fn encode_message(
    command: u8,
    transaction_id: Option<u8>,
    payload: &[u8],
    dst: &mut BytesMut,
) -> Result<()> {
    dst.reserve(HEADER_SIZE + payload.len());
    put_body(command, transaction_id, payload, dst);
    Ok(())
}

/// Encode a frame for the given framing.
pub fn encode(
    framing: Framing,
    command: u8,
    transaction_id: Option<u8>,
    payload: &[u8],
    dst: &mut BytesMut,
) -> Result<()> {
    match framing {
        Framing::Stream => encode_frame(command, transaction_id, payload, dst),
        Framing::Message => encode_message(command, transaction_id, payload, dst),
    }
}

fn put_body(command: u8, transaction_id: Option<u8>, payload: &[u8], dst: &mut BytesMut) {
    dst.put_u8(command);
    dst.put_u8(transaction_id.unwrap_or(NO_TRANSACTION));
    dst.put_slice(payload);
}

/// Decode one frame from a byte-stream buffer.
///
/// Returns `Ok(None)` if the buffer doesn't contain a complete frame yet.
/// On success, consumes the frame bytes from the buffer. A declared length
/// above `max_frame_size` fails immediately, before waiting for the body.
/// Masked and unmasked frames are both accepted.
pub fn decode_frame(src: &mut BytesMut, max_frame_size: usize) -> Result<Option<Message>> {
    if src.len() < MIN_PREFIX_SIZE {
        return Ok(None);
    }
    if src[0] != FRAME_MAGIC {
        return Err(FrameError::MalformedFrame(format!(
            "expected frame marker {FRAME_MAGIC:#04x}, found {:#04x}",
            src[0]
        )));
    }

    let masked = src[1] & MASK_BIT != 0;
    let (body_len, extended) = match src[1] & LENGTH_MASK {
        LENGTH_16 => {
            if src.len() < MIN_PREFIX_SIZE + 2 {
                return Ok(None);
            }
            (usize::from(u16::from_be_bytes([src[2], src[3]])), 2)
        }
        LENGTH_64 => {
            if src.len() < MIN_PREFIX_SIZE + 8 {
                return Ok(None);
            }
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&src[MIN_PREFIX_SIZE..MIN_PREFIX_SIZE + 8]);
            (usize::try_from(u64::from_be_bytes(raw)).unwrap_or(usize::MAX), 8)
        }
        short => (usize::from(short), 0),
    };

    if body_len > max_frame_size {
        return Err(FrameError::FrameTooLarge {
            size: body_len,
            max: max_frame_size,
        });
    }
    if body_len < HEADER_SIZE {
        return Err(FrameError::MalformedFrame(format!(
            "length {body_len} shorter than {HEADER_SIZE}-byte header"
        )));
    }

    let key_len = if masked { MASK_KEY_SIZE } else { 0 };
    let prefix = MIN_PREFIX_SIZE + extended + key_len;
    if src.len() < prefix + body_len {
        return Ok(None);
    }

    src.advance(MIN_PREFIX_SIZE + extended);
    let mut key = [0u8; MASK_KEY_SIZE];
    if masked {
        key.copy_from_slice(&src[..MASK_KEY_SIZE]);
        src.advance(MASK_KEY_SIZE);
    }
    let mut body = src.split_to(body_len);
    if key != [0u8; MASK_KEY_SIZE] {
        for (i, byte) in body.iter_mut().enumerate() {
            *byte ^= key[i % MASK_KEY_SIZE];
        }
    }
    parse_body(body.freeze()).map(Some)
}

/// Decode every complete frame in `src`.
///
/// A trailing partial frame stays in `src` for the next read. On any
/// decode failure the whole buffer is discarded and the error reported;
/// messages decoded before the failure are still returned.
pub fn decode_stream(src: &mut BytesMut, max_frame_size: usize) -> StreamBatch {
    let mut batch = StreamBatch::default();
    loop {
        match decode_frame(src, max_frame_size) {
            Ok(Some(message)) => batch.messages.push(message),
            Ok(None) => break,
            Err(err) => {
                src.clear();
                batch.error = Some(err);
                break;
            }
        }
    }
    batch
}

/// Decode one message received on a boundary-preserving link.
pub fn decode_message(bytes: Bytes, max_frame_size: usize) -> Result<Message> {
    if bytes.len() > max_frame_size {
        return Err(FrameError::FrameTooLarge {
            size: bytes.len(),
            max: max_frame_size,
        });
    }
    if bytes.len() < HEADER_SIZE {
        return Err(FrameError::MalformedFrame(format!(
            "message of {} bytes shorter than {HEADER_SIZE}-byte header",
            bytes.len()
        )));
    }
    parse_body(bytes)
}

fn parse_body(mut body: Bytes) -> Result<Message> {
    if body.len() < HEADER_SIZE {
        return Err(FrameError::MalformedFrame("truncated header".to_string()));
    }
    let command = body.get_u8();
    let transaction_id = body.get_u8();
    Ok(Message::new(command, Some(transaction_id), body))
}

/// Configuration for the frame codec.
#[derive(Debug, Clone)]
pub struct FrameConfig {
    /// Maximum frame size (header + payload) in bytes. Default: 1 MiB.
    pub max_frame_size: usize,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}
