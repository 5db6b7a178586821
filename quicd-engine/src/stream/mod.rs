//! # QUIC Streams (RFC 9000 Section 2, 3)
//!
//! Reassembly and send buffers, the per-connection stream table with its
//! flow control, and the reader/writer handles applications hold.

pub mod buffer;
pub mod handle;
pub mod manager;

pub use buffer::{InsertError, RecvBuffer, SendBuffer, SendChunk};
pub use handle::{StreamReader, StreamWriter};
pub use manager::{
    PeerLimits, Stream, StreamManager, DEFAULT_CONNECTION_WINDOW, DEFAULT_STREAM_WINDOW, MAX_PEER_STREAMS,
};
