//! # Retry Packets (RFC 9000 Section 17.2.5, RFC 9001 Section 5.8)
//!
//! A Retry carries a cleartext token and a 16-byte integrity tag computed
//! with a per-version fixed AES-128-GCM key over the Retry pseudo-packet:
//!
//! ```text
//! Retry Pseudo-Packet {
//!   ODCID Length (8),
//!   Original Destination Connection ID (0..160),
//!   <Retry packet without the integrity tag>
//! }
//! ```
//!
//! The server side also mints address validation tokens that bind the
//! client's original destination CID to the Retry source CID.

#![forbid(unsafe_code)]

use super::header::{LongPacketType, FIXED_BIT, HEADER_FORM_BIT, LONG_PACKET_TYPE_SHIFT, RETRY_INTEGRITY_TAG_LEN};
use crate::error::{Error, Result};
use crate::types::{ConnectionId, MAX_CID_LEN};
use crate::version::Version;
use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::Aes128Gcm;
use bytes::{BufMut, Bytes, BytesMut};
use hmac::{Hmac, Mac};
use rand::{Rng, RngCore};
use sha2::Sha256;
use zeroize::Zeroizing;

/// Compute the integrity tag for `retry_without_tag`.
pub fn integrity_tag(version: Version, odcid: &[u8], retry_without_tag: &[u8]) -> Result<[u8; RETRY_INTEGRITY_TAG_LEN]> {
    let (key, nonce) = version.retry_integrity();
    let cipher = Aes128Gcm::new_from_slice(key).map_err(|_| Error::InvalidKey)?;

    let mut pseudo = Vec::with_capacity(1 + odcid.len() + retry_without_tag.len());
    pseudo.push(odcid.len() as u8);
    pseudo.extend_from_slice(odcid);
    pseudo.extend_from_slice(retry_without_tag);

    let tag = cipher
        .encrypt(nonce.as_slice().into(), Payload { msg: &[], aad: &pseudo })
        .map_err(|_| Error::InvalidKey)?;
    tag.try_into().map_err(|_| Error::InvalidKey)
}

/// Check the integrity tag at the end of a complete Retry `packet`.
pub fn verify_integrity(version: Version, odcid: &[u8], packet: &[u8]) -> bool {
    let Some(split) = packet.len().checked_sub(RETRY_INTEGRITY_TAG_LEN) else {
        return false;
    };
    let (body, tag) = packet.split_at(split);
    match integrity_tag(version, odcid, body) {
        Ok(expected) => expected.as_slice() == tag,
        Err(_) => false,
    }
}

/// Build a Retry packet sent by a server to a client.
///
/// `dcid` is the client's source CID, `scid` the new server CID the client
/// must use from now on, `odcid` the DCID of the client's first Initial.
pub fn encode_retry(
    version: Version,
    dcid: &ConnectionId,
    scid: &ConnectionId,
    odcid: &ConnectionId,
    token: &[u8],
) -> Result<Bytes> {
    let mut buf = BytesMut::with_capacity(7 + dcid.len() + scid.len() + token.len() + RETRY_INTEGRITY_TAG_LEN);
    let unused = rand::thread_rng().gen::<u8>() & 0x0f;
    buf.put_u8(
        HEADER_FORM_BIT
            | FIXED_BIT
            | (version.long_type_bits(LongPacketType::Retry) << LONG_PACKET_TYPE_SHIFT)
            | unused,
    );
    buf.put_u32(version.wire());
    buf.put_u8(dcid.len() as u8);
    buf.put_slice(dcid.as_bytes());
    buf.put_u8(scid.len() as u8);
    buf.put_slice(scid.as_bytes());
    buf.put_slice(token);
    let tag = integrity_tag(version, odcid.as_bytes(), &buf)?;
    buf.put_slice(&tag);
    Ok(buf.freeze())
}

const TOKEN_MAC_LEN: usize = 16;

/// Server secret for address validation tokens.
pub struct RetryTokenKey {
    key: Zeroizing<[u8; 32]>,
}

impl RetryTokenKey {
    pub fn random() -> Self {
        let mut key = Zeroizing::new([0u8; 32]);
        rand::thread_rng().fill_bytes(&mut key[..]);
        Self { key }
    }

    fn mac(&self, odcid: &[u8], retry_scid: &[u8]) -> Result<Hmac<Sha256>> {
        let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(&self.key[..]).map_err(|_| Error::InvalidKey)?;
        mac.update(b"quicd retry token");
        mac.update(&[odcid.len() as u8]);
        mac.update(odcid);
        mac.update(retry_scid);
        Ok(mac)
    }

    /// Token layout: `odcid_len || odcid || HMAC-SHA256(...)[..16]`
    pub fn mint(&self, odcid: &ConnectionId, retry_scid: &ConnectionId) -> Result<Bytes> {
        let tag = self.mac(odcid.as_bytes(), retry_scid.as_bytes())?.finalize().into_bytes();
        let mut token = BytesMut::with_capacity(1 + odcid.len() + TOKEN_MAC_LEN);
        token.put_u8(odcid.len() as u8);
        token.put_slice(odcid.as_bytes());
        token.put_slice(&tag[..TOKEN_MAC_LEN]);
        Ok(token.freeze())
    }

    /// Recover the original destination CID from a token addressed to `retry_scid`.
    pub fn validate(&self, token: &[u8], retry_scid: &[u8]) -> Option<ConnectionId> {
        let (&len, rest) = token.split_first()?;
        let len = usize::from(len);
        if len > MAX_CID_LEN || rest.len() != len + TOKEN_MAC_LEN {
            return None;
        }
        let (odcid, tag) = rest.split_at(len);
        self.mac(odcid, retry_scid).ok()?.verify_truncated_left(tag).ok()?;
        ConnectionId::from_slice(odcid)
    }
}
