//! Connection configuration.
//!
//! [`ConnectionConfig`] is plain serde data so it can be embedded in a
//! larger TOML file:
//!
//! ```toml
//! supported_versions = [1, 0x6b3343cf]
//! cipher_suites = ["TLS_AES_128_GCM_SHA256"]
//! connection_id_length = 8
//! require_retry = true
//! server_name = "localhost"
//! alpn_protocols = ["hq-interop"]
//! ca_file = "/etc/quic/ca.pem"
//! initial_max_data = 10485760
//! initial_max_stream_data = 1048576
//! ```
//!
//! Key material is not serialisable; a server additionally needs a
//! [`ServerIdentity`]. A client without `ca_file` trusts the webpki root
//! set.

use crate::crypto::CipherSuite;
use crate::error::{Error, Result};
use crate::stream::{DEFAULT_CONNECTION_WINDOW, DEFAULT_STREAM_WINDOW};
use crate::types::MAX_CID_LEN;
use crate::version::Version;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Smallest datagram a QUIC endpoint must be able to send (RFC 9000 Section 14)
pub const MIN_INITIAL_DATAGRAM_SIZE: usize = 1200;

/// Per-connection settings shared by both roles.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Versions in preference order; a client's first Initial uses the first
    pub supported_versions: Vec<Version>,

    /// Cipher suites in preference order
    pub cipher_suites: Vec<CipherSuite>,

    /// Length of the connection IDs this endpoint issues
    pub connection_id_length: usize,

    /// Largest datagram this endpoint sends
    pub max_datagram_size: usize,

    /// Server: validate client addresses with a Retry round trip
    pub require_retry: bool,

    /// Idle timeout announced in transport parameters, in milliseconds
    pub max_idle_timeout_ms: u64,

    /// Client: name sent as SNI and checked against the certificate
    pub server_name: String,

    /// ALPN protocols in preference order; both ends need one in common
    pub alpn_protocols: Vec<String>,

    /// Client: PEM file with the trusted roots instead of the webpki set
    pub ca_file: Option<PathBuf>,

    /// Connection-level receive window announced to the peer
    pub initial_max_data: u64,

    /// Receive window announced for every stream
    pub initial_max_stream_data: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            supported_versions: vec![Version::V1, Version::V2],
            cipher_suites: vec![CipherSuite::Aes128GcmSha256, CipherSuite::ChaCha20Poly1305Sha256],
            connection_id_length: 8,
            max_datagram_size: MIN_INITIAL_DATAGRAM_SIZE,
            require_retry: false,
            max_idle_timeout_ms: 30_000,
            server_name: "localhost".to_string(),
            alpn_protocols: vec!["hq-interop".to_string()],
            ca_file: None,
            initial_max_data: DEFAULT_CONNECTION_WINDOW,
            initial_max_stream_data: DEFAULT_STREAM_WINDOW,
        }
    }
}

impl ConnectionConfig {
    /// Check every field, reporting all problems at once.
    pub fn validate(&self) -> std::result::Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.supported_versions.is_empty() {
            errors.push("supported_versions must not be empty".to_string());
        }
        for (i, v) in self.supported_versions.iter().enumerate() {
            if self.supported_versions[..i].contains(v) {
                errors.push(format!("supported_versions lists {v:?} twice"));
            }
        }
        if self.cipher_suites.is_empty() {
            errors.push("cipher_suites must not be empty".to_string());
        }
        if self.connection_id_length > MAX_CID_LEN {
            errors.push(format!(
                "connection_id_length {} exceeds the maximum of {MAX_CID_LEN}",
                self.connection_id_length
            ));
        }
        if self.max_datagram_size < MIN_INITIAL_DATAGRAM_SIZE {
            errors.push(format!(
                "max_datagram_size {} is below the QUIC minimum of {MIN_INITIAL_DATAGRAM_SIZE}",
                self.max_datagram_size
            ));
        }
        if self.max_datagram_size > 65_527 {
            errors.push(format!("max_datagram_size {} exceeds 65527", self.max_datagram_size));
        }
        if rustls::pki_types::ServerName::try_from(self.server_name.as_str()).is_err() {
            errors.push(format!("server_name {:?} is not a DNS name or IP address", self.server_name));
        }
        if self.alpn_protocols.iter().any(|p| p.is_empty() || p.len() > 255) {
            errors.push("alpn_protocols entries must be 1 to 255 bytes".to_string());
        }
        if self.initial_max_stream_data == 0 || self.initial_max_data < self.initial_max_stream_data {
            errors.push(format!(
                "initial_max_data {} must be at least initial_max_stream_data {}, which must be non-zero",
                self.initial_max_data, self.initial_max_stream_data
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Parse and validate a TOML document.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Self = toml::from_str(s).map_err(|e| Error::Config(e.to_string()))?;
        config.validate().map_err(|errors| Error::Config(errors.join("; ")))?;
        Ok(config)
    }

    /// Same settings restricted to `versions`.
    pub fn with_versions(mut self, versions: &[Version]) -> Self {
        self.supported_versions = versions.to_vec();
        self
    }
}

/// Certificate chain and private key presented by a server.
pub struct ServerIdentity {
    cert_chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
}

impl ServerIdentity {
    pub fn new(cert_chain: Vec<CertificateDer<'static>>, key: PrivateKeyDer<'static>) -> Self {
        Self { cert_chain, key }
    }

    /// Parse a PEM certificate chain (leaf first) and a PEM private key.
    pub fn from_pem(cert_pem: &[u8], key_pem: &[u8]) -> Result<Self> {
        let cert_chain = rustls_pemfile::certs(&mut &cert_pem[..])
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| Error::Config(format!("invalid certificate PEM: {e}")))?;
        if cert_chain.is_empty() {
            return Err(Error::Config("no certificate in PEM input".to_string()));
        }
        let key = rustls_pemfile::private_key(&mut &key_pem[..])
            .map_err(|e| Error::Config(format!("invalid private key PEM: {e}")))?
            .ok_or_else(|| Error::Config("no private key in PEM input".to_string()))?;
        Ok(Self { cert_chain, key })
    }

    /// Read PEM files from disk.
    pub fn load(cert_path: impl AsRef<Path>, key_path: impl AsRef<Path>) -> Result<Self> {
        let read = |path: &Path| {
            std::fs::read(path).map_err(|e| Error::Config(format!("failed to read {}: {e}", path.display())))
        };
        Self::from_pem(&read(cert_path.as_ref())?, &read(key_path.as_ref())?)
    }

    pub fn cert_chain(&self) -> &[CertificateDer<'static>] {
        &self.cert_chain
    }

    pub(crate) fn key(&self) -> &PrivateKeyDer<'static> {
        &self.key
    }
}

impl Clone for ServerIdentity {
    fn clone(&self) -> Self {
        Self {
            cert_chain: self.cert_chain.clone(),
            key: self.key.clone_key(),
        }
    }
}

impl std::fmt::Debug for ServerIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerIdentity")
            .field("certificates", &self.cert_chain.len())
            .field("leaf_len", &self.cert_chain.first().map(|c| c.len()))
            .finish_non_exhaustive()
    }
}
