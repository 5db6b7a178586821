//! # QUIC Packet Header Parsing and Encoding (RFC 9000 Section 17, RFC 8999)
//!
//! Zero-copy header parsing with lifetime-bound return types. The parser
//! only looks at the cleartext part of a header; the packet number and the
//! low bits of the first byte stay protected until
//! [`super::protection::open_packet`] removes header protection.

#![forbid(unsafe_code)]

use super::number::write_truncated;
use crate::error::{Error, Result};
use crate::types::{ByteReader, ConnectionId, PacketNumber, VarIntCodec, MAX_CID_LEN};
use crate::version::{Version, VERSION_NEGOTIATION};
use bytes::{BufMut, Bytes, BytesMut};
use rand::Rng;

// ============================================================================
// Header Form Constants (RFC 8999 Section 5.1, RFC 9000 Section 17)
// ============================================================================

/// Header Form Bit: 1 = Long Header, 0 = Short Header
pub const HEADER_FORM_BIT: u8 = 0x80;

/// Fixed Bit, set in every packet except Version Negotiation
pub const FIXED_BIT: u8 = 0x40;

/// Long Packet Type bits (4-5)
pub const LONG_PACKET_TYPE_SHIFT: u8 = 4;

/// Packet Number Length Mask: encodes (packet_number_length - 1)
pub const PACKET_NUMBER_LENGTH_MASK: u8 = 0x03;

/// Length of the Retry Integrity Tag (RFC 9001 Section 5.8)
pub const RETRY_INTEGRITY_TAG_LEN: usize = 16;

/// Long header packet types. The wire encoding depends on the version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LongPacketType {
    Initial,
    ZeroRtt,
    Handshake,
    Retry,
}

// ============================================================================
// Header Structures (Zero-Copy, Lifetime-Bound)
// ============================================================================

/// Initial, 0-RTT or Handshake packet header (RFC 9000 Section 17.2)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LongHeader<'a> {
    pub packet_type: LongPacketType,
    pub version: Version,
    pub dcid: &'a [u8],
    pub scid: &'a [u8],
    /// Address validation token; empty unless an Initial carries one
    pub token: &'a [u8],
    /// Offset of the protected packet number field
    pub pn_offset: usize,
}

/// 1-RTT packet header (RFC 9000 Section 17.3)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShortHeader<'a> {
    pub dcid: &'a [u8],
    pub pn_offset: usize,
}

/// A classified packet header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Header<'a> {
    /// Protected long header packet
    Long(LongHeader<'a>),
    /// Protected short header packet
    Short(ShortHeader<'a>),
    /// Retry (RFC 9000 Section 17.2.5); cleartext token plus integrity tag
    Retry {
        version: Version,
        dcid: &'a [u8],
        scid: &'a [u8],
        token: &'a [u8],
        integrity_tag: &'a [u8],
    },
    /// Version Negotiation (RFC 9000 Section 17.2.1)
    VersionNegotiation {
        dcid: &'a [u8],
        scid: &'a [u8],
        versions: Vec<u32>,
    },
    /// Long header carrying a version this endpoint does not implement
    UnsupportedVersion {
        version: u32,
        dcid: &'a [u8],
        scid: &'a [u8],
    },
}

impl Header<'_> {
    /// Destination connection ID of any header form.
    pub fn dcid(&self) -> &[u8] {
        match self {
            Header::Long(h) => h.dcid,
            Header::Short(h) => h.dcid,
            Header::Retry { dcid, .. }
            | Header::VersionNegotiation { dcid, .. }
            | Header::UnsupportedVersion { dcid, .. } => dcid,
        }
    }
}

/// A parsed header plus the extent of its packet within the datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedPacket<'a> {
    pub header: Header<'a>,
    /// Bytes of the datagram occupied by this packet, header included
    pub packet_len: usize,
}

// ============================================================================
// Parsing
// ============================================================================

/// Header parser trait; the short header form needs the local CID length.
pub trait PacketParser {
    /// Parse the packet at the front of `buf`.
    fn parse_packet<'a>(&self, buf: &'a [u8]) -> Result<ParsedPacket<'a>>;
}

/// Parser for an endpoint whose own connection IDs are `local_cid_len` bytes.
#[derive(Debug, Clone, Copy)]
pub struct DefaultHeaderParser {
    local_cid_len: usize,
}

impl DefaultHeaderParser {
    pub fn new(local_cid_len: usize) -> Self {
        Self { local_cid_len }
    }
}

fn read_cid<'a>(r: &mut ByteReader<'a>) -> Result<&'a [u8]> {
    let len = usize::from(r.u8().ok_or(Error::MalformedHeader)?);
    if len > MAX_CID_LEN {
        return Err(Error::MalformedHeader);
    }
    r.bytes(len).ok_or(Error::MalformedHeader)
}

impl PacketParser for DefaultHeaderParser {
    fn parse_packet<'a>(&self, buf: &'a [u8]) -> Result<ParsedPacket<'a>> {
        let mut r = ByteReader::new(buf);
        let first = r.u8().ok_or(Error::MalformedHeader)?;

        if first & HEADER_FORM_BIT == 0 {
            if first & FIXED_BIT == 0 {
                return Err(Error::MalformedHeader);
            }
            let dcid = r.bytes(self.local_cid_len).ok_or(Error::MalformedHeader)?;
            return Ok(ParsedPacket {
                header: Header::Short(ShortHeader {
                    dcid,
                    pn_offset: r.position(),
                }),
                packet_len: buf.len(),
            });
        }

        let wire_version = r.u32().ok_or(Error::MalformedHeader)?;
        let dcid = read_cid(&mut r)?;
        let scid = read_cid(&mut r)?;

        if wire_version == VERSION_NEGOTIATION {
            let list = r.rest();
            if list.is_empty() || list.len() % 4 != 0 {
                return Err(Error::MalformedHeader);
            }
            let versions = list
                .chunks_exact(4)
                .map(|c| u32::from_be_bytes([c[0], c[1], c[2], c[3]]))
                .collect();
            return Ok(ParsedPacket {
                header: Header::VersionNegotiation { dcid, scid, versions },
                packet_len: buf.len(),
            });
        }

        let Some(version) = Version::from_wire(wire_version) else {
            return Ok(ParsedPacket {
                header: Header::UnsupportedVersion {
                    version: wire_version,
                    dcid,
                    scid,
                },
                packet_len: buf.len(),
            });
        };

        if first & FIXED_BIT == 0 {
            return Err(Error::MalformedHeader);
        }

        let packet_type = version.long_type_from_bits((first >> LONG_PACKET_TYPE_SHIFT) & 0x03);
        match packet_type {
            LongPacketType::Retry => {
                let rest = r.rest();
                if rest.len() < RETRY_INTEGRITY_TAG_LEN {
                    return Err(Error::MalformedHeader);
                }
                let (token, integrity_tag) = rest.split_at(rest.len() - RETRY_INTEGRITY_TAG_LEN);
                Ok(ParsedPacket {
                    header: Header::Retry {
                        version,
                        dcid,
                        scid,
                        token,
                        integrity_tag,
                    },
                    packet_len: buf.len(),
                })
            }
            LongPacketType::Initial | LongPacketType::ZeroRtt | LongPacketType::Handshake => {
                let token = if packet_type == LongPacketType::Initial {
                    let len = r.varint().ok_or(Error::MalformedHeader)?;
                    let len = usize::try_from(len).map_err(|_| Error::MalformedHeader)?;
                    r.bytes(len).ok_or(Error::MalformedHeader)?
                } else {
                    &[][..]
                };
                let length = r.varint().ok_or(Error::MalformedHeader)?;
                let pn_offset = r.position();
                let packet_len = usize::try_from(length)
                    .ok()
                    .and_then(|l| pn_offset.checked_add(l))
                    .filter(|end| *end <= buf.len())
                    .ok_or(Error::MalformedHeader)?;
                Ok(ParsedPacket {
                    header: Header::Long(LongHeader {
                        packet_type,
                        version,
                        dcid,
                        scid,
                        token,
                        pn_offset,
                    }),
                    packet_len,
                })
            }
        }
    }
}

// ============================================================================
// Encoding
// ============================================================================

/// Write a long header up to and including the truncated packet number.
///
/// `remainder_len` is the number of bytes that follow the packet number
/// (ciphertext plus tag). The Length field always uses the two-byte varint
/// form so the header size is known before the payload is. Returns the
/// packet number offset.
#[allow(clippy::too_many_arguments)]
pub fn write_long_header(
    buf: &mut BytesMut,
    version: Version,
    packet_type: LongPacketType,
    dcid: &ConnectionId,
    scid: &ConnectionId,
    token: &[u8],
    pn: PacketNumber,
    pn_len: usize,
    remainder_len: usize,
) -> Result<usize> {
    let length = pn_len + remainder_len;
    if length >= 0x4000 || !(1..=4).contains(&pn_len) {
        return Err(Error::BufferTooSmall);
    }
    let first = HEADER_FORM_BIT
        | FIXED_BIT
        | (version.long_type_bits(packet_type) << LONG_PACKET_TYPE_SHIFT)
        | (pn_len as u8 - 1);
    buf.put_u8(first);
    buf.put_u32(version.wire());
    put_cid(buf, dcid);
    put_cid(buf, scid);
    if packet_type == LongPacketType::Initial {
        VarIntCodec::put(buf, token.len() as u64);
        buf.put_slice(token);
    }
    VarIntCodec::put_u16_form(buf, length as u16);
    let pn_offset = buf.len();
    write_truncated(buf, pn, pn_len);
    Ok(pn_offset)
}

/// Write a short header; returns the packet number offset.
pub fn write_short_header(buf: &mut BytesMut, dcid: &ConnectionId, pn: PacketNumber, pn_len: usize) -> usize {
    buf.put_u8(FIXED_BIT | (pn_len as u8 - 1));
    buf.put_slice(dcid.as_bytes());
    let pn_offset = buf.len();
    write_truncated(buf, pn, pn_len);
    pn_offset
}

fn put_cid(buf: &mut BytesMut, cid: &ConnectionId) {
    buf.put_u8(cid.len() as u8);
    buf.put_slice(cid.as_bytes());
}

/// Build a Version Negotiation packet answering a client whose Initial
/// carried `client_dcid`/`client_scid` (RFC 9000 Section 17.2.1).
pub fn encode_version_negotiation(client_dcid: &[u8], client_scid: &[u8], versions: &[u32]) -> Bytes {
    let mut buf = BytesMut::with_capacity(7 + client_dcid.len() + client_scid.len() + 4 * versions.len());
    buf.put_u8(HEADER_FORM_BIT | (rand::thread_rng().gen::<u8>() & 0x7f));
    buf.put_u32(VERSION_NEGOTIATION);
    // The client's source CID becomes our destination and vice versa
    buf.put_u8(client_scid.len() as u8);
    buf.put_slice(client_scid);
    buf.put_u8(client_dcid.len() as u8);
    buf.put_slice(client_dcid);
    for v in versions {
        buf.put_u32(*v);
    }
    buf.freeze()
}
