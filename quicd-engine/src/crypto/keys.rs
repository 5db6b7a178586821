//! # Packet Protection Keys (RFC 9001 Section 5)
//!
//! A [`PacketKey`] bundles the AEAD key and header protection key of one
//! direction of one epoch. Keys come from `rustls::quic`: Initial keys are
//! derived from the client's DCID here, later epochs are handed over by the
//! TLS session. Raw key bytes never leave rustls.

#![forbid(unsafe_code)]

use crate::error::{Error, Result};
use crate::types::{PacketNumber, Side};
use crate::version::Version;
use core::fmt;
use rustls::crypto::ring::cipher_suite::{TLS13_AES_128_GCM_SHA256, TLS13_CHACHA20_POLY1305_SHA256};
use rustls::quic::{DirectionalKeys, HeaderProtectionKey, Keys};
use rustls::SupportedCipherSuite;
use serde::{Deserialize, Serialize};

/// AEAD authentication tag length for every supported suite
pub const TAG_LEN: usize = 16;

/// Header protection sample length (RFC 9001 Section 5.4.2)
pub const SAMPLE_LEN: usize = 16;

/// TLS 1.3 cipher suites usable for QUIC packet protection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CipherSuite {
    #[serde(rename = "TLS_AES_128_GCM_SHA256")]
    Aes128GcmSha256,
    #[serde(rename = "TLS_CHACHA20_POLY1305_SHA256")]
    ChaCha20Poly1305Sha256,
}

impl CipherSuite {
    pub fn id(self) -> u16 {
        match self {
            CipherSuite::Aes128GcmSha256 => 0x1301,
            CipherSuite::ChaCha20Poly1305Sha256 => 0x1303,
        }
    }

    pub fn from_id(id: u16) -> Option<Self> {
        match id {
            0x1301 => Some(CipherSuite::Aes128GcmSha256),
            0x1303 => Some(CipherSuite::ChaCha20Poly1305Sha256),
            _ => None,
        }
    }

    /// The rustls implementation of this suite.
    pub fn rustls_suite(self) -> SupportedCipherSuite {
        match self {
            CipherSuite::Aes128GcmSha256 => TLS13_AES_128_GCM_SHA256,
            CipherSuite::ChaCha20Poly1305Sha256 => TLS13_CHACHA20_POLY1305_SHA256,
        }
    }

    /// Map a negotiated rustls suite back, if it is one we offer.
    pub fn from_rustls(suite: SupportedCipherSuite) -> Option<Self> {
        match suite.suite() {
            rustls::CipherSuite::TLS13_AES_128_GCM_SHA256 => Some(CipherSuite::Aes128GcmSha256),
            rustls::CipherSuite::TLS13_CHACHA20_POLY1305_SHA256 => Some(CipherSuite::ChaCha20Poly1305Sha256),
            _ => None,
        }
    }
}

fn rustls_side(side: Side) -> rustls::Side {
    match side {
        Side::Client => rustls::Side::Client,
        Side::Server => rustls::Side::Server,
    }
}

/// Keys for one direction of one epoch.
pub struct PacketKey {
    packet: Box<dyn rustls::quic::PacketKey>,
    header: Box<dyn HeaderProtectionKey>,
}

impl fmt::Debug for PacketKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PacketKey")
            .field("tag_len", &self.packet.tag_len())
            .finish_non_exhaustive()
    }
}

impl From<DirectionalKeys> for PacketKey {
    fn from(keys: DirectionalKeys) -> Self {
        Self {
            packet: keys.packet,
            header: keys.header,
        }
    }
}

impl PacketKey {
    /// Split a rustls key set into (send, receive).
    pub fn pair(keys: Keys) -> (Self, Self) {
        (keys.local.into(), keys.remote.into())
    }

    /// Initial-style keys for `side`, derived from `client_dcid` with the
    /// salt and labels of `version` and the hash and AEAD of `suite`.
    /// Returns (send, receive).
    pub fn derive(suite: CipherSuite, version: Version, client_dcid: &[u8], side: Side) -> Result<(Self, Self)> {
        let quic_suite = suite
            .rustls_suite()
            .tls13()
            .and_then(|suite| suite.quic_suite())
            .ok_or(Error::InvalidKey)?;
        let keys = quic_suite.keys(client_dcid, rustls_side(side), version.rustls_version());
        Ok(Self::pair(keys))
    }

    /// Initial keys (RFC 9001 Section 5.2). Returns (send, receive).
    pub fn initial(version: Version, client_dcid: &[u8], side: Side) -> Result<(Self, Self)> {
        Self::derive(CipherSuite::Aes128GcmSha256, version, client_dcid, side)
    }

    /// Encrypt `payload` with `header` as associated data. Returns ciphertext || tag.
    pub fn seal(&self, pn: PacketNumber, header: &[u8], payload: &[u8]) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(payload.len() + self.packet.tag_len());
        out.extend_from_slice(payload);
        let tag = self
            .packet
            .encrypt_in_place(pn, header, &mut out)
            .map_err(|_| Error::InvalidKey)?;
        out.extend_from_slice(tag.as_ref());
        Ok(out)
    }

    /// Authenticate and decrypt `ciphertext` (which includes the tag).
    pub fn open(&self, pn: PacketNumber, header: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
        if ciphertext.len() < self.packet.tag_len() {
            return Err(Error::Decryption);
        }
        let mut buf = ciphertext.to_vec();
        let plain_len = self
            .packet
            .decrypt_in_place(pn, header, &mut buf)
            .map_err(|_| Error::Decryption)?
            .len();
        buf.truncate(plain_len);
        Ok(buf)
    }

    /// Mask the first byte and the packet number bytes in place. Only as
    /// many `pn_bytes` as the first byte announces are touched.
    pub fn protect_header(&self, sample: &[u8], first: &mut u8, pn_bytes: &mut [u8]) -> Result<()> {
        if sample.len() != SAMPLE_LEN {
            return Err(Error::BufferTooSmall);
        }
        self.header
            .encrypt_in_place(sample, first, pn_bytes)
            .map_err(|_| Error::InvalidKey)
    }

    /// Undo [`PacketKey::protect_header`]; the packet number length is read
    /// from the unmasked first byte.
    pub fn unprotect_header(&self, sample: &[u8], first: &mut u8, pn_bytes: &mut [u8]) -> Result<()> {
        if sample.len() != SAMPLE_LEN {
            return Err(Error::Decryption);
        }
        self.header
            .decrypt_in_place(sample, first, pn_bytes)
            .map_err(|_| Error::Decryption)
    }
}
