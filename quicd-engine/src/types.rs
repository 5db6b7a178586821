//! # Core QUIC Types (RFC 8999, RFC 9000)
//!
//! Variable-length integers, connection IDs, stream IDs and the small
//! enumerations (side, epoch) that every other module speaks in.

#![forbid(unsafe_code)]

use bytes::{BufMut, Bytes};
use core::fmt;
use rand::RngCore;

// ============================================================================
// Variable-Length Integer Encoding (RFC 9000 Section 16)
// ============================================================================

/// Variable-length integer. The two most significant bits of the first byte
/// select a 1, 2, 4 or 8 byte encoding.
pub type VarInt = u64;

/// Maximum value for VarInt (2^62 - 1)
pub const VARINT_MAX: u64 = (1u64 << 62) - 1;

/// VarInt encoding and decoding utilities
pub struct VarIntCodec;

impl VarIntCodec {
    /// Decode a VarInt from the front of `buf`, returning (value, bytes_consumed).
    pub fn decode(buf: &[u8]) -> Option<(VarInt, usize)> {
        let first = *buf.first()?;
        let len = 1usize << (first >> 6);
        if buf.len() < len {
            return None;
        }
        let mut value = u64::from(first & 0x3f);
        for byte in &buf[1..len] {
            value = (value << 8) | u64::from(*byte);
        }
        Some((value, len))
    }

    /// Number of bytes needed to encode `value`, or None above VARINT_MAX.
    pub fn size(value: VarInt) -> Option<usize> {
        match value {
            0..=63 => Some(1),
            64..=16_383 => Some(2),
            16_384..=1_073_741_823 => Some(4),
            1_073_741_824..=VARINT_MAX => Some(8),
            _ => None,
        }
    }

    /// Append `value` using its shortest encoding.
    pub fn put<B: BufMut>(buf: &mut B, value: VarInt) {
        match Self::size(value) {
            Some(1) => buf.put_u8(value as u8),
            Some(2) => buf.put_u16(0x4000 | value as u16),
            Some(4) => buf.put_u32(0x8000_0000 | value as u32),
            _ => buf.put_u64(0xc000_0000_0000_0000 | (value & VARINT_MAX)),
        }
    }

    /// Append `value` as a fixed two-byte varint. Used for length fields that
    /// are written before the value they describe is known.
    pub fn put_u16_form<B: BufMut>(buf: &mut B, value: u16) {
        debug_assert!(value < 0x4000);
        buf.put_u16(0x4000 | (value & 0x3fff));
    }
}

/// Bounds-checked reader over a byte slice.
///
/// Every accessor returns `None` instead of panicking when the input is
/// exhausted, so decoders can be driven by untrusted data.
#[derive(Debug, Clone)]
pub struct ByteReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn u8(&mut self) -> Option<u8> {
        let b = *self.buf.get(self.pos)?;
        self.pos += 1;
        Some(b)
    }

    pub fn u16(&mut self) -> Option<u16> {
        self.bytes(2).map(|b| u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn u24(&mut self) -> Option<u32> {
        self.bytes(3)
            .map(|b| (u32::from(b[0]) << 16) | (u32::from(b[1]) << 8) | u32::from(b[2]))
    }

    pub fn u32(&mut self) -> Option<u32> {
        self.bytes(4).map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn varint(&mut self) -> Option<VarInt> {
        let (value, len) = VarIntCodec::decode(&self.buf[self.pos..])?;
        self.pos += len;
        Some(value)
    }

    pub fn bytes(&mut self, len: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(len)?;
        let slice = self.buf.get(self.pos..end)?;
        self.pos = end;
        Some(slice)
    }

    /// Everything not yet consumed.
    pub fn rest(&mut self) -> &'a [u8] {
        let slice = &self.buf[self.pos..];
        self.pos = self.buf.len();
        slice
    }
}

// ============================================================================
// Connection IDs (RFC 9000 Section 5.1)
// ============================================================================

/// Maximum connection ID length for QUIC v1 and v2
pub const MAX_CID_LEN: usize = 20;

/// Opaque connection identifier chosen by an endpoint.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct ConnectionId {
    bytes: Bytes,
}

impl ConnectionId {
    /// Build a connection ID, rejecting values longer than [`MAX_CID_LEN`].
    pub fn from_slice(data: &[u8]) -> Option<Self> {
        (data.len() <= MAX_CID_LEN).then(|| Self {
            bytes: Bytes::copy_from_slice(data),
        })
    }

    /// A fresh random connection ID of `len` bytes (clamped to 20).
    pub fn random(len: usize) -> Self {
        let mut buf = vec![0u8; len.min(MAX_CID_LEN)];
        rand::thread_rng().fill_bytes(&mut buf);
        Self { bytes: buf.into() }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl fmt::Debug for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ConnectionId({})", hex::encode(&self.bytes))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(&self.bytes))
    }
}

// ============================================================================
// Endpoint role and cryptographic epochs
// ============================================================================

/// Which end of the connection we are.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Client,
    Server,
}

impl Side {
    pub fn is_client(self) -> bool {
        self == Side::Client
    }

    pub fn is_server(self) -> bool {
        self == Side::Server
    }

    pub fn peer(self) -> Side {
        match self {
            Side::Client => Side::Server,
            Side::Server => Side::Client,
        }
    }
}

/// Cryptographic phase of a connection. Each epoch has its own keys and
/// its own packet number space (RFC 9000 Section 12.3, RFC 9001 Section 4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Epoch {
    Initial,
    Handshake,
    OneRtt,
}

impl Epoch {
    /// All epochs in coalescing order.
    pub const ALL: [Epoch; 3] = [Epoch::Initial, Epoch::Handshake, Epoch::OneRtt];

    pub fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Epoch::Initial => "initial",
            Epoch::Handshake => "handshake",
            Epoch::OneRtt => "1-rtt",
        })
    }
}

/// Packet number (RFC 9000 Section 12.3). Full 62-bit value.
pub type PacketNumber = u64;

// ============================================================================
// Stream IDs (RFC 9000 Section 2.1)
// ============================================================================

/// Stream identifier. Bit 0 names the initiator (0 = client), bit 1 the
/// directionality (0 = bidirectional).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StreamId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamDirection {
    Bidirectional,
    Unidirectional,
}

impl StreamId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// First ID of the class opened by `initiator` in `direction`.
    pub fn first(initiator: Side, direction: StreamDirection) -> Self {
        let mut id = 0;
        if initiator.is_server() {
            id |= 0x1;
        }
        if direction == StreamDirection::Unidirectional {
            id |= 0x2;
        }
        Self(id)
    }

    pub fn value(self) -> u64 {
        self.0
    }

    pub fn initiator(self) -> Side {
        if self.0 & 0x1 == 0 {
            Side::Client
        } else {
            Side::Server
        }
    }

    pub fn direction(self) -> StreamDirection {
        if self.0 & 0x2 == 0 {
            StreamDirection::Bidirectional
        } else {
            StreamDirection::Unidirectional
        }
    }

    pub fn is_unidirectional(self) -> bool {
        self.direction() == StreamDirection::Unidirectional
    }

    /// Class index 0..4 (`id mod 4`).
    pub fn class(self) -> usize {
        (self.0 & 0x3) as usize
    }

    /// Whether `side` may send data on this stream.
    pub fn can_send(self, side: Side) -> bool {
        !self.is_unidirectional() || self.initiator() == side
    }

    /// Whether `side` may receive data on this stream.
    pub fn can_receive(self, side: Side) -> bool {
        !self.is_unidirectional() || self.initiator() != side
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    mod varint_tests {
        use super::*;

        /// RFC 9000 Appendix A.1 sample encodings
        #[test]
        fn rfc_samples_decode() {
            let samples: [(&[u8], u64); 4] = [
                (&[0xc2, 0x19, 0x7c, 0x5e, 0xff, 0x14, 0xe8, 0x8c], 151_288_809_941_952_652),
                (&[0x9d, 0x7f, 0x3e, 0x7d], 494_878_333),
                (&[0x7b, 0xbd], 15_293),
                (&[0x25], 37),
            ];
            for (bytes, value) in samples {
                assert_eq!(VarIntCodec::decode(bytes), Some((value, bytes.len())));
            }
            // Two-byte encoding of 37 is also legal
            assert_eq!(VarIntCodec::decode(&[0x40, 0x25]), Some((37, 2)));
        }

        #[test]
        fn put_uses_shortest_form() {
            for (value, len) in [(0u64, 1), (63, 1), (64, 2), (16_383, 2), (16_384, 4), (1 << 30, 8)] {
                let mut buf = BytesMut::new();
                VarIntCodec::put(&mut buf, value);
                assert_eq!(buf.len(), len, "value {value}");
                assert_eq!(VarIntCodec::decode(&buf), Some((value, len)));
            }
            assert_eq!(VarIntCodec::size(VARINT_MAX + 1), None);
        }

        #[test]
        fn truncated_input() {
            assert_eq!(VarIntCodec::decode(&[]), None);
            assert_eq!(VarIntCodec::decode(&[0x9d, 0x7f]), None);
        }
    }

    mod reader_tests {
        use super::*;

        #[test]
        fn reads_are_bounds_checked() {
            let mut r = ByteReader::new(&[0x01, 0x02, 0x03]);
            assert_eq!(r.u16(), Some(0x0102));
            assert_eq!(r.u16(), None);
            assert_eq!(r.u8(), Some(0x03));
            assert!(r.is_empty());
            assert_eq!(r.bytes(usize::MAX), None);
        }
    }

    mod stream_id_tests {
        use super::*;

        #[test]
        fn class_bits() {
            assert_eq!(StreamId::first(Side::Client, StreamDirection::Bidirectional), StreamId(0));
            assert_eq!(StreamId::first(Side::Server, StreamDirection::Bidirectional), StreamId(1));
            assert_eq!(StreamId::first(Side::Client, StreamDirection::Unidirectional), StreamId(2));
            assert_eq!(StreamId::first(Side::Server, StreamDirection::Unidirectional), StreamId(3));
            assert_eq!(StreamId(6).initiator(), Side::Client);
            assert!(StreamId(7).is_unidirectional());
        }

        #[test]
        fn unidirectional_permissions() {
            let client_uni = StreamId(2);
            assert!(client_uni.can_send(Side::Client));
            assert!(!client_uni.can_receive(Side::Client));
            assert!(client_uni.can_receive(Side::Server));
            assert!(!client_uni.can_send(Side::Server));
            assert!(StreamId(0).can_send(Side::Server));
        }
    }

    #[test]
    fn connection_id_limits() {
        assert!(ConnectionId::from_slice(&[0u8; 21]).is_none());
        assert_eq!(ConnectionId::random(8).len(), 8);
        assert_eq!(ConnectionId::random(64).len(), MAX_CID_LEN);
        let cid = ConnectionId::from_slice(&[0xc9, 0x83]).unwrap();
        assert_eq!(cid.to_string(), "c983");
    }
}
