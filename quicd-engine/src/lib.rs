//! quicd-engine: a sans-io QUIC connection engine
//!
//! Implements the connection core of RFC 9000 and RFC 9001 for QUIC v1,
//! QUIC v2 (RFC 9369) and draft-29: packet protection, the packet and
//! frame codecs, a handshake adapter with NSS key-log export, streams
//! with async readers, and client and server handling of Retry, Version
//! Negotiation and CONNECTION_CLOSE.
//!
//! # Architecture
//!
//! - **Sans-io core**: [`Connection`] consumes and produces datagrams and
//!   never touches a socket or a clock
//! - **Zero-copy parsing**: headers and frames borrow from the datagram
//! - **Single-threaded driver**: [`QuicConnection`] binds the core to a
//!   [`DatagramSender`] and resolves stream reads from the receive path
//! - **Pluggable handshake**: the engine drives any [`TlsSession`];
//!   [`RustlsSession`] runs TLS 1.3 with certificate authentication,
//!   SNI and ALPN through `rustls::quic`
//! - **Flow control**: receive windows are advertised in the transport
//!   parameters and slide as the application reads
//!
//! # Module Organization
//!
//! - `types`: varints, connection IDs, stream IDs, epochs
//! - `packet`: header codec, packet numbers, protection, Retry, packet spaces
//! - `frames`: frame codec
//! - `crypto`: packet keys, key holders, key log
//! - `tls`: handshake component interface and the rustls session
//! - `flow_control`: send credit and receive windows
//! - `stream`: reassembly buffers, stream table, stream handles
//! - `connection`: the engine and its driver

#![forbid(unsafe_code)]

pub mod config;
pub mod connection;
pub mod crypto;
pub mod error;
pub mod flow_control;
pub mod frames;
pub mod packet;
pub mod stream;
pub mod tls;
pub mod transport;
pub mod types;
pub mod version;

pub use config::{ConnectionConfig, ServerIdentity};
pub use connection::{Connection, ConnectionState, ConnectionStats, DatagramSender, QuicConnection};
pub use crypto::{CipherSuite, KeyLog};
pub use error::{ConnectionError, Error, Result, TransportErrorCode};
pub use stream::{StreamReader, StreamWriter};
pub use tls::{RustlsSession, TlsSession};
pub use types::{ConnectionId, Epoch, Side, StreamDirection, StreamId};
pub use version::Version;
