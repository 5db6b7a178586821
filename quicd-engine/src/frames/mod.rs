//! # QUIC Frames (RFC 9000 Section 12.4, 19)
//!
//! Zero-copy parsing and buffer-injected serialization of the frames used
//! by the engine: PADDING, PING, ACK, CRYPTO, STREAM, MAX_DATA, MAX_STREAM_DATA,
//! CONNECTION_CLOSE and HANDSHAKE_DONE.

pub mod parse;
pub mod types;

pub use parse::{
    crypto_frame_overhead, stream_frame_overhead, DefaultFrameParser, DefaultFrameSerializer, FrameIterator,
    FrameParser, FrameSerializer,
};
pub use types::*;
