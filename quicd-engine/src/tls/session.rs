//! # TLS 1.3 over rustls
//!
//! [`RustlsSession`] wraps a `rustls::quic::Connection`. The server
//! authenticates with its certificate chain; the client checks that chain
//! against its roots and the configured server name. Transport parameters
//! and ALPN ride in the TLS extensions.
//!
//! rustls hands out handshake bytes and key changes from `write_hs`: bytes
//! returned together with a key change still belong to the old epoch, so
//! the write epoch only advances after they are queued.

#![forbid(unsafe_code)]

use super::{TlsEvent, TlsSession, ALERT_INTERNAL_ERROR};
use crate::config::{ConnectionConfig, ServerIdentity};
use crate::crypto::{secret_label, CipherSuite, PacketKey, SecretCollector};
use crate::error::{Error, Result};
use crate::types::{Epoch, Side};
use crate::version::Version;
use bytes::Bytes;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::ServerName;
use rustls::quic::{KeyChange, Keys};
use rustls::RootCertStore;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;

fn config_error(err: impl std::fmt::Display) -> Error {
    Error::Config(format!("tls: {err}"))
}

/// The ring provider restricted to `suites`, in preference order.
fn provider(suites: &[CipherSuite]) -> Arc<CryptoProvider> {
    Arc::new(CryptoProvider {
        cipher_suites: suites.iter().map(|suite| suite.rustls_suite()).collect(),
        ..rustls::crypto::ring::default_provider()
    })
}

/// Roots from `ca_file`, or the webpki set when none is given.
fn root_store(ca_file: Option<&Path>) -> Result<RootCertStore> {
    let mut roots = RootCertStore::empty();
    let Some(path) = ca_file else {
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        return Ok(roots);
    };
    let pem = std::fs::read(path).map_err(|e| config_error(format!("failed to read {}: {e}", path.display())))?;
    for cert in rustls_pemfile::certs(&mut &pem[..]) {
        roots.add(cert.map_err(config_error)?).map_err(config_error)?;
    }
    if roots.is_empty() {
        return Err(config_error(format!("no certificates in {}", path.display())));
    }
    Ok(roots)
}

fn alpn(config: &ConnectionConfig) -> Vec<Vec<u8>> {
    config.alpn_protocols.iter().map(|p| p.as_bytes().to_vec()).collect()
}

pub struct RustlsSession {
    side: Side,
    conn: rustls::quic::Connection,
    secrets: Arc<SecretCollector>,
    write_epoch: Epoch,
    events: VecDeque<TlsEvent>,
    complete: bool,
}

impl RustlsSession {
    /// Client session for `config.server_name`, trusting `config.ca_file`
    /// or the webpki roots. `transport_parameters` is our encoded block.
    pub fn new_client(config: &ConnectionConfig, version: Version, transport_parameters: Vec<u8>) -> Result<Self> {
        let secrets = Arc::new(SecretCollector::default());
        let mut tls = rustls::ClientConfig::builder_with_provider(provider(&config.cipher_suites))
            .with_protocol_versions(&[&rustls::version::TLS13])
            .map_err(config_error)?
            .with_root_certificates(root_store(config.ca_file.as_deref())?)
            .with_no_client_auth();
        tls.alpn_protocols = alpn(config);
        tls.key_log = secrets.clone();

        let server_name = ServerName::try_from(config.server_name.clone()).map_err(config_error)?;
        let conn = rustls::quic::ClientConnection::new(
            Arc::new(tls),
            version.rustls_version(),
            server_name,
            transport_parameters,
        )
        .map_err(config_error)?;
        Ok(Self::new(Side::Client, conn.into(), secrets))
    }

    /// Server session presenting `identity`.
    pub fn new_server(
        config: &ConnectionConfig,
        identity: &ServerIdentity,
        version: Version,
        transport_parameters: Vec<u8>,
    ) -> Result<Self> {
        let secrets = Arc::new(SecretCollector::default());
        let mut tls = rustls::ServerConfig::builder_with_provider(provider(&config.cipher_suites))
            .with_protocol_versions(&[&rustls::version::TLS13])
            .map_err(config_error)?
            .with_no_client_auth()
            .with_single_cert(identity.cert_chain().to_vec(), identity.key().clone_key())
            .map_err(config_error)?;
        tls.alpn_protocols = alpn(config);
        tls.key_log = secrets.clone();
        // No session tickets: the handshake ends with the client Finished
        tls.send_tls13_tickets = 0;

        let conn = rustls::quic::ServerConnection::new(Arc::new(tls), version.rustls_version(), transport_parameters)
            .map_err(config_error)?;
        Ok(Self::new(Side::Server, conn.into(), secrets))
    }

    fn new(side: Side, conn: rustls::quic::Connection, secrets: Arc<SecretCollector>) -> Self {
        Self {
            side,
            conn,
            secrets,
            write_epoch: Epoch::Initial,
            events: VecDeque::new(),
            complete: false,
        }
    }

    fn failure(&self, err: rustls::Error) -> Error {
        let alert = self.conn.alert().map(u8::from).unwrap_or(ALERT_INTERNAL_ERROR);
        Error::Handshake {
            alert,
            reason: err.to_string(),
        }
    }

    /// Move everything rustls has to say into the event queue.
    fn drain(&mut self) {
        loop {
            let mut data = Vec::new();
            let change = self.conn.write_hs(&mut data);
            if !data.is_empty() {
                self.events.push_back(TlsEvent::WriteData(self.write_epoch, Bytes::from(data)));
            }
            match change {
                Some(KeyChange::Handshake { keys }) => self.install(Epoch::Handshake, keys),
                Some(KeyChange::OneRtt { keys, .. }) => self.install(Epoch::OneRtt, keys),
                None => break,
            }
        }
        if !self.complete && !self.conn.is_handshaking() {
            self.complete = true;
            tracing::debug!(side = ?self.side, alpn = ?self.conn.alpn_protocol().map(String::from_utf8_lossy), "tls handshake complete");
            self.events.push_back(TlsEvent::HandshakeComplete);
        }
    }

    fn install(&mut self, epoch: Epoch, keys: Keys) {
        let client_random = self.secrets.client_random();
        for owner in [Side::Server, Side::Client] {
            let Some(label) = secret_label(epoch, owner) else {
                continue;
            };
            let name = label.strip_prefix("QUIC_").unwrap_or(label);
            if let Some(secret) = self.secrets.take(name) {
                self.events.push_back(TlsEvent::Secret {
                    label,
                    client_random: client_random.clone(),
                    secret,
                });
            }
        }
        let (send, recv) = PacketKey::pair(keys);
        self.events.push_back(TlsEvent::InstallKeys(epoch, send, recv));
        self.write_epoch = epoch;
    }
}

impl TlsSession for RustlsSession {
    fn start(&mut self) -> Result<()> {
        self.drain();
        Ok(())
    }

    fn read_handshake(&mut self, epoch: Epoch, data: &[u8]) -> Result<()> {
        tracing::trace!(side = ?self.side, %epoch, len = data.len(), "tls input");
        if let Err(err) = self.conn.read_hs(data) {
            return Err(self.failure(err));
        }
        self.drain();
        Ok(())
    }

    fn poll_event(&mut self) -> Option<TlsEvent> {
        self.events.pop_front()
    }

    fn is_handshake_complete(&self) -> bool {
        self.complete
    }

    fn peer_transport_parameters(&self) -> Option<&[u8]> {
        self.conn.quic_transport_parameters()
    }

    fn cipher_suite(&self) -> Option<CipherSuite> {
        self.conn.negotiated_cipher_suite().and_then(CipherSuite::from_rustls)
    }

    fn alpn_protocol(&self) -> Option<&[u8]> {
        self.conn.alpn_protocol()
    }
}

impl std::fmt::Debug for RustlsSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RustlsSession")
            .field("side", &self.side)
            .field("write_epoch", &self.write_epoch)
            .field("complete", &self.complete)
            .finish_non_exhaustive()
    }
}
