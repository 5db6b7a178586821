//! # Packet Protection (RFC 9001 Section 5)
//!
//! Sealing encrypts the payload with the header as associated data and then
//! masks the packet number and low first-byte bits using a sample of the
//! ciphertext. Opening runs the same steps backwards. The sample always
//! starts four bytes after the packet number offset, whatever the actual
//! packet number length.

#![forbid(unsafe_code)]

use super::header::PACKET_NUMBER_LENGTH_MASK;
use super::number;
use crate::crypto::{PacketKey, SAMPLE_LEN};
use crate::error::{Error, Result};
use crate::types::PacketNumber;
use bytes::BytesMut;

const SAMPLE_OFFSET: usize = 4;

/// Longest packet number encoding
const MAX_PN_LEN: usize = 4;

/// Smallest plaintext payload that still leaves room for a header
/// protection sample when the packet number takes `pn_len` bytes.
pub fn min_payload_len(pn_len: usize) -> usize {
    SAMPLE_OFFSET.saturating_sub(pn_len)
}

/// Seal `payload` behind `header`, which must end with the `pn`'s truncated
/// encoding starting at `pn_offset`. Returns the protected packet.
pub fn seal_packet(
    key: &PacketKey,
    pn: PacketNumber,
    header: &[u8],
    pn_offset: usize,
    payload: &[u8],
) -> Result<BytesMut> {
    let pn_len = header.len().checked_sub(pn_offset).ok_or(Error::BufferTooSmall)?;
    if pn_offset == 0 {
        return Err(Error::BufferTooSmall);
    }
    let ciphertext = key.seal(pn, header, payload)?;

    let mut packet = BytesMut::with_capacity(header.len() + ciphertext.len());
    packet.extend_from_slice(header);
    packet.extend_from_slice(&ciphertext);

    let sample_start = pn_offset + SAMPLE_OFFSET;
    let mut sample = [0u8; SAMPLE_LEN];
    sample.copy_from_slice(
        packet
            .get(sample_start..sample_start + SAMPLE_LEN)
            .ok_or(Error::BufferTooSmall)?,
    );
    let (first, rest) = packet.split_at_mut(1);
    let pn_bytes = rest
        .get_mut(pn_offset - 1..pn_offset - 1 + pn_len)
        .ok_or(Error::BufferTooSmall)?;
    key.protect_header(&sample, &mut first[0], pn_bytes)?;
    Ok(packet)
}

/// Result of removing packet protection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenedPacket {
    pub packet_number: PacketNumber,
    /// First byte with header protection removed
    pub first_byte: u8,
    pub payload: Vec<u8>,
}

/// Remove header protection and decrypt one packet.
///
/// `packet` spans exactly one packet; `largest_received` is the largest
/// packet number processed so far in its space.
pub fn open_packet(
    key: &PacketKey,
    packet: &[u8],
    pn_offset: usize,
    largest_received: Option<PacketNumber>,
) -> Result<OpenedPacket> {
    let sample_start = pn_offset + SAMPLE_OFFSET;
    let sample = packet
        .get(sample_start..sample_start + SAMPLE_LEN)
        .ok_or(Error::Decryption)?;
    if pn_offset == 0 {
        return Err(Error::Decryption);
    }

    // Unmask a copy of the first byte and the longest packet number
    let mut first_byte = packet[0];
    let mut pn_bytes = [0u8; MAX_PN_LEN];
    pn_bytes.copy_from_slice(&packet[pn_offset..pn_offset + MAX_PN_LEN]);
    key.unprotect_header(sample, &mut first_byte, &mut pn_bytes)?;
    let pn_len = usize::from(first_byte & PACKET_NUMBER_LENGTH_MASK) + 1;

    let mut header = packet[..pn_offset + pn_len].to_vec();
    header[0] = first_byte;
    header[pn_offset..].copy_from_slice(&pn_bytes[..pn_len]);
    let truncated = pn_bytes[..pn_len]
        .iter()
        .fold(0u64, |acc, b| (acc << 8) | u64::from(*b));

    let expected = largest_received.map_or(0, |pn| pn + 1);
    let packet_number = number::decode(truncated, pn_len * 8, expected)?;
    let payload = key.open(packet_number, &header, &packet[pn_offset + pn_len..])?;

    Ok(OpenedPacket {
        packet_number,
        first_byte,
        payload,
    })
}
