//! Frame encoding and decoding for control-surface devices.
//!
//! Every logical message is a command id, a transaction id (or the absent
//! marker) and an opaque payload. On byte-stream links each frame is
//! wrapped in a WebSocket binary frame header (`0x82` plus a length); on
//! message links the transport keeps boundaries and the header is omitted.
//!
//! The codec never decides whether a message is a response or an event.

pub mod codec;
pub mod command;
pub mod decoder;
pub mod error;

pub use codec::{
    decode_frame, decode_message, decode_stream, encode, encode_frame, encode_message,
    stream_prefix_size, FrameConfig, Message, StreamBatch, DEFAULT_MAX_FRAME_SIZE, FRAME_MAGIC,
    HEADER_SIZE, MIN_PREFIX_SIZE, NO_TRANSACTION,
};
pub use command::{event_type, CONNECT_EVENT, DISCONNECT_EVENT};
pub use decoder::FrameCodec;
pub use error::{FrameError, Result};
pub use deckwire_transport::Framing;
