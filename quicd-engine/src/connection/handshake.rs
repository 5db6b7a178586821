//! # Handshake Adapter (RFC 9001 Section 4)
//!
//! Glue between the packet spaces and a [`TlsSession`]: contiguous CRYPTO
//! bytes go in, handshake bytes come back out into the CRYPTO stream of
//! the right epoch, and every key change becomes installed packet keys
//! (plus key-log lines when a sink is configured).

#![forbid(unsafe_code)]

use crate::crypto::KeyLog;
use crate::error::{ConnectionError, Error};
use crate::packet::PacketSpace;
use crate::tls::{TlsEvent, TlsSession, ALERT_INTERNAL_ERROR};
use crate::types::{Epoch, Side};

/// Convert a handshake-side error into the close it causes.
pub(crate) fn handshake_error(err: Error) -> ConnectionError {
    match err {
        Error::Handshake { alert, reason } => ConnectionError::crypto(alert, reason),
        Error::Transport(err) => err,
        other => ConnectionError::crypto(ALERT_INTERNAL_ERROR, other.to_string()),
    }
}

pub(crate) struct HandshakeAdapter {
    side: Side,
    session: Box<dyn TlsSession>,
    key_log: Option<KeyLog>,
}

impl HandshakeAdapter {
    pub(crate) fn new(side: Side, session: Box<dyn TlsSession>, key_log: Option<KeyLog>) -> Self {
        Self { side, session, key_log }
    }

    /// Swap in a fresh session, keeping the key log. Used when the client
    /// restarts its handshake under another version.
    pub(crate) fn replace_session(&mut self, session: Box<dyn TlsSession>) {
        self.session = session;
    }

    pub(crate) fn set_key_log(&mut self, key_log: KeyLog) {
        self.key_log = Some(key_log);
    }

    pub(crate) fn is_complete(&self) -> bool {
        self.session.is_handshake_complete()
    }

    pub(crate) fn peer_transport_parameters(&self) -> Option<&[u8]> {
        self.session.peer_transport_parameters()
    }

    pub(crate) fn alpn_protocol(&self) -> Option<&[u8]> {
        self.session.alpn_protocol()
    }

    /// Start the session and queue its first flight. Returns true if the
    /// handshake completed.
    pub(crate) fn start(&mut self, spaces: &mut [PacketSpace; 3]) -> Result<bool, ConnectionError> {
        self.session.start().map_err(handshake_error)?;
        self.drain_events(spaces)
    }

    /// Hand newly contiguous CRYPTO data of `epoch` to the session.
    /// Returns true if this completed the handshake.
    pub(crate) fn on_crypto_data(&mut self, epoch: Epoch, spaces: &mut [PacketSpace; 3]) -> Result<bool, ConnectionError> {
        let data = spaces[epoch.index()].crypto_stream.recv.read(usize::MAX);
        if data.is_empty() {
            return Ok(false);
        }
        tracing::trace!(%epoch, len = data.len(), "handshake data");
        self.session.read_handshake(epoch, &data).map_err(handshake_error)?;
        self.drain_events(spaces)
    }

    fn drain_events(&mut self, spaces: &mut [PacketSpace; 3]) -> Result<bool, ConnectionError> {
        let mut completed = false;
        while let Some(event) = self.session.poll_event() {
            match event {
                TlsEvent::WriteData(epoch, data) => {
                    spaces[epoch.index()].crypto_stream.write(&data);
                }
                TlsEvent::InstallKeys(epoch, send, recv) => {
                    let crypto = &mut spaces[epoch.index()].crypto;
                    crypto.install_recv(recv).map_err(handshake_error)?;
                    crypto.install_send(send);
                    tracing::debug!(%epoch, suite = ?self.session.cipher_suite(), "installed packet keys");
                }
                TlsEvent::Secret {
                    label,
                    client_random,
                    secret,
                } => {
                    if let Some(key_log) = self.key_log.as_mut() {
                        key_log.log_secret(label, &client_random, &secret);
                    }
                }
                TlsEvent::HandshakeComplete => completed = true,
            }
        }
        Ok(completed)
    }
}

impl std::fmt::Debug for HandshakeAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandshakeAdapter")
            .field("side", &self.side)
            .field("complete", &self.session.is_handshake_complete())
            .field("key_log", &self.key_log.is_some())
            .finish()
    }
}
