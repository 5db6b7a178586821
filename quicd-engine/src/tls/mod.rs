//! # Handshake Component Interface (RFC 9001 Section 4)
//!
//! The engine talks to the handshake through [`TlsSession`]: it feeds
//! CRYPTO bytes with [`TlsSession::read_handshake`] and drains
//! [`TlsEvent`]s (bytes to send, packet keys, key-log secrets,
//! completion). The engine never looks inside the handshake messages.
//!
//! [`RustlsSession`] runs TLS 1.3 through `rustls::quic`.

pub mod session;

pub use session::RustlsSession;

use crate::crypto::{CipherSuite, PacketKey};
use crate::error::Result;
use crate::types::Epoch;
use bytes::Bytes;
use zeroize::Zeroizing;

// TLS alert descriptions (RFC 8446 Section 6.2)
pub const ALERT_UNEXPECTED_MESSAGE: u8 = 10;
pub const ALERT_HANDSHAKE_FAILURE: u8 = 40;
pub const ALERT_BAD_CERTIFICATE: u8 = 42;
pub const ALERT_DECODE_ERROR: u8 = 50;
pub const ALERT_INTERNAL_ERROR: u8 = 80;
pub const ALERT_UNKNOWN_CA: u8 = 48;
pub const ALERT_NO_APPLICATION_PROTOCOL: u8 = 120;

/// Output of the handshake component, drained in order.
pub enum TlsEvent {
    /// Handshake bytes to send in CRYPTO frames of `Epoch`
    WriteData(Epoch, Bytes),
    /// Packet keys of `Epoch`: (send, receive)
    InstallKeys(Epoch, PacketKey, PacketKey),
    /// A traffic secret for the key log. Both secrets of an epoch come
    /// server first, ahead of that epoch's [`TlsEvent::InstallKeys`].
    Secret {
        label: &'static str,
        client_random: Vec<u8>,
        secret: Zeroizing<Vec<u8>>,
    },
    HandshakeComplete,
}

impl std::fmt::Debug for TlsEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TlsEvent::WriteData(epoch, data) => write!(f, "WriteData({epoch}, {} bytes)", data.len()),
            TlsEvent::InstallKeys(epoch, ..) => write!(f, "InstallKeys({epoch})"),
            TlsEvent::Secret { label, .. } => write!(f, "Secret({label})"),
            TlsEvent::HandshakeComplete => f.write_str("HandshakeComplete"),
        }
    }
}

/// A handshake in progress, client or server.
///
/// Errors are `Error::Handshake { alert, .. }`; the engine reports them as
/// CRYPTO_ERROR.
pub trait TlsSession {
    /// Begin the handshake. A client queues its first flight; a server
    /// does nothing until the ClientHello arrives.
    fn start(&mut self) -> Result<()>;

    /// Consume contiguous handshake bytes received in `epoch`. Partial
    /// messages are buffered until complete.
    fn read_handshake(&mut self, epoch: Epoch, data: &[u8]) -> Result<()>;

    fn poll_event(&mut self) -> Option<TlsEvent>;

    fn is_handshake_complete(&self) -> bool;

    /// Raw transport parameters the peer sent, once received.
    fn peer_transport_parameters(&self) -> Option<&[u8]>;

    /// Negotiated suite, once known.
    fn cipher_suite(&self) -> Option<CipherSuite>;

    /// Negotiated ALPN protocol, once known.
    fn alpn_protocol(&self) -> Option<&[u8]>;
}
