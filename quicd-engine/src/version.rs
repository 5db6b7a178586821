//! # QUIC Versions (RFC 8999, RFC 9000 Section 6, RFC 9369)
//!
//! The engine speaks QUIC v1, QUIC v2 and draft-29. The versions share the
//! wire image and differ only in:
//!
//! 1. the Initial salt and packet protection labels, which rustls
//!    applies once told the version
//! 2. the long-header packet type encoding (RFC 9369 Section 3.2)
//! 3. the Retry integrity key and nonce (RFC 9001 Section 5.8)

#![forbid(unsafe_code)]

use crate::error::Error;
use crate::packet::LongPacketType;
use serde::{Deserialize, Serialize};

/// QUIC Version 1 (RFC 9000)
pub const VERSION_1: u32 = 0x0000_0001;

/// QUIC Version 2 (RFC 9369)
pub const VERSION_2: u32 = 0x6b33_43cf;

/// IETF draft 29, the last widely deployed draft
pub const VERSION_DRAFT_29: u32 = 0xff00_001d;

/// Version field value identifying a Version Negotiation packet
pub const VERSION_NEGOTIATION: u32 = 0x0000_0000;

/// Reserved versions have the form 0x?a?a?a?a (RFC 9000 Section 15).
/// They are never selected but may appear in negotiation lists.
pub fn is_reserved_version(version: u32) -> bool {
    (version & 0x0f0f_0f0f) == 0x0a0a_0a0a
}

/// A QUIC version this engine implements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub enum Version {
    V1,
    V2,
    Draft29,
}

impl Version {
    pub fn from_wire(value: u32) -> Option<Self> {
        match value {
            VERSION_1 => Some(Version::V1),
            VERSION_2 => Some(Version::V2),
            VERSION_DRAFT_29 => Some(Version::Draft29),
            _ => None,
        }
    }

    pub fn wire(self) -> u32 {
        match self {
            Version::V1 => VERSION_1,
            Version::V2 => VERSION_2,
            Version::Draft29 => VERSION_DRAFT_29,
        }
    }

    /// The rustls identifier, which selects the Initial salt and the
    /// packet protection labels.
    pub fn rustls_version(self) -> rustls::quic::Version {
        match self {
            Version::V1 => rustls::quic::Version::V1,
            Version::V2 => rustls::quic::Version::V2,
            Version::Draft29 => rustls::quic::Version::V1Draft,
        }
    }

    /// Retry integrity AES-128-GCM key and nonce (RFC 9001 Section 5.8)
    pub fn retry_integrity(self) -> (&'static [u8; 16], &'static [u8; 12]) {
        match self {
            Version::V1 => (
                &[
                    0xbe, 0x0c, 0x69, 0x0b, 0x9f, 0x66, 0x57, 0x5a, 0x1d, 0x76, 0x6b, 0x54, 0xe3, 0x68,
                    0xc8, 0x4e,
                ],
                &[0x46, 0x15, 0x99, 0xd3, 0x5d, 0x63, 0x2b, 0xf2, 0x23, 0x98, 0x25, 0xbb],
            ),
            Version::V2 => (
                &[
                    0x8f, 0xb4, 0xb0, 0x1b, 0x56, 0xac, 0x48, 0xe2, 0x60, 0xfb, 0xcb, 0xce, 0xad, 0x7c,
                    0xcc, 0x92,
                ],
                &[0xd8, 0x69, 0x69, 0xbc, 0x2d, 0x7c, 0x6d, 0x99, 0x90, 0xef, 0xb0, 0x4a],
            ),
            Version::Draft29 => (
                &[
                    0xcc, 0xce, 0x18, 0x7e, 0xd0, 0x9a, 0x09, 0xd0, 0x57, 0x28, 0x15, 0x5a, 0x6c, 0xb9,
                    0x6b, 0xe1,
                ],
                &[0xe5, 0x49, 0x30, 0xf9, 0x7f, 0x21, 0x36, 0xf0, 0x53, 0x0a, 0x8c, 0x1c],
            ),
        }
    }

    /// Two-bit long-header type field for `ty`.
    pub fn long_type_bits(self, ty: LongPacketType) -> u8 {
        let v1 = match ty {
            LongPacketType::Initial => 0b00,
            LongPacketType::ZeroRtt => 0b01,
            LongPacketType::Handshake => 0b10,
            LongPacketType::Retry => 0b11,
        };
        match self {
            // RFC 9369 Section 3.2 rotates every type by one
            Version::V2 => (v1 + 1) & 0b11,
            Version::V1 | Version::Draft29 => v1,
        }
    }

    pub fn long_type_from_bits(self, bits: u8) -> LongPacketType {
        let v1 = match self {
            Version::V2 => bits.wrapping_sub(1) & 0b11,
            Version::V1 | Version::Draft29 => bits & 0b11,
        };
        match v1 {
            0b00 => LongPacketType::Initial,
            0b01 => LongPacketType::ZeroRtt,
            0b10 => LongPacketType::Handshake,
            _ => LongPacketType::Retry,
        }
    }
}

impl TryFrom<u32> for Version {
    type Error = Error;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Version::from_wire(value).ok_or(Error::UnsupportedVersion(value))
    }
}

impl From<Version> for u32 {
    fn from(version: Version) -> Self {
        version.wire()
    }
}

/// Pick the first version in `preferred` that the peer also `offered`.
///
/// Reserved versions in the offer are skipped.
pub fn select_version(preferred: &[Version], offered: &[u32]) -> Option<Version> {
    preferred
        .iter()
        .copied()
        .find(|v| offered.iter().any(|o| !is_reserved_version(*o) && *o == v.wire()))
}
