//! # Packet Number Encoding/Decoding (RFC 9000 Section 17.1)
//!
//! Only the low bits of a packet number travel on the wire. The sender
//! picks a length from the gap to the largest acknowledged number; the
//! receiver restores the full value from the largest number it has seen.

#![forbid(unsafe_code)]

use crate::error::{Error, Result};
use crate::types::PacketNumber;
use bytes::BufMut;

/// Bytes needed to send `full_pn` given the peer's largest acknowledged
/// packet (RFC 9000 Appendix A.2).
pub fn encode_length(full_pn: PacketNumber, largest_acked: Option<PacketNumber>) -> usize {
    let num_unacked = match largest_acked {
        Some(acked) => full_pn.saturating_sub(acked),
        None => full_pn + 1,
    };

    // Twice the span of unacknowledged packets must be representable
    let num_bits = (64 - num_unacked.leading_zeros()) as usize + 1;
    match num_bits {
        0..=8 => 1,
        9..=16 => 2,
        17..=24 => 3,
        _ => 4,
    }
}

/// Append the low `len` bytes of `pn`, most significant first.
pub fn write_truncated<B: BufMut>(buf: &mut B, pn: PacketNumber, len: usize) {
    let bytes = pn.to_be_bytes();
    buf.put_slice(&bytes[8 - len..]);
}

/// Restore a truncated packet number (RFC 9000 Appendix A.3).
///
/// `expected_pn` is one more than the largest packet number received in
/// the space.
pub fn decode(truncated_pn: u64, pn_nbits: usize, expected_pn: PacketNumber) -> Result<PacketNumber> {
    if !matches!(pn_nbits, 8 | 16 | 24 | 32) {
        return Err(Error::MalformedHeader);
    }

    let pn_win = 1u64 << pn_nbits;
    let pn_hwin = pn_win / 2;
    let pn_mask = pn_win - 1;

    let candidate = (expected_pn & !pn_mask) | truncated_pn;

    if candidate + pn_hwin <= expected_pn && candidate < (1u64 << 62) - pn_win {
        Ok(candidate + pn_win)
    } else if candidate > expected_pn + pn_hwin && candidate >= pn_win {
        Ok(candidate - pn_win)
    } else {
        Ok(candidate)
    }
}
