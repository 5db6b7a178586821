//! # QUIC Frame Types (RFC 9000 Section 19)
//!
//! The frame subset the engine speaks. Payload-carrying variants borrow
//! from the decrypted packet buffer.

#![forbid(unsafe_code)]

use crate::types::{PacketNumber, StreamId, VarInt};
use core::ops::RangeInclusive;

// ============================================================================
// Frame Type Constants (RFC 9000 Section 12.4, Table 3)
// ============================================================================

pub const FRAME_TYPE_PADDING: VarInt = 0x00;
pub const FRAME_TYPE_PING: VarInt = 0x01;
pub const FRAME_TYPE_ACK: VarInt = 0x02;
pub const FRAME_TYPE_ACK_ECN: VarInt = 0x03;
pub const FRAME_TYPE_CRYPTO: VarInt = 0x06;
/// STREAM frames occupy 0x08..=0x0f; the low three bits are flags
pub const FRAME_TYPE_STREAM_BASE: VarInt = 0x08;
pub const FRAME_TYPE_STREAM_MAX: VarInt = 0x0f;
pub const FRAME_TYPE_MAX_DATA: VarInt = 0x10;
pub const FRAME_TYPE_MAX_STREAM_DATA: VarInt = 0x11;
pub const FRAME_TYPE_CONNECTION_CLOSE: VarInt = 0x1c;
pub const FRAME_TYPE_CONNECTION_CLOSE_APP: VarInt = 0x1d;
pub const FRAME_TYPE_HANDSHAKE_DONE: VarInt = 0x1e;

/// STREAM frame flag bits
pub const STREAM_FRAME_BIT_FIN: VarInt = 0x01;
pub const STREAM_FRAME_BIT_LEN: VarInt = 0x02;
pub const STREAM_FRAME_BIT_OFF: VarInt = 0x04;

/// ACK frame (RFC 9000 Section 19.3)
///
/// `ranges` are inclusive, disjoint and sorted from highest to lowest; the
/// first range contains `largest`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckFrame {
    pub largest: PacketNumber,
    pub ack_delay: VarInt,
    pub ranges: Vec<RangeInclusive<PacketNumber>>,
}

impl AckFrame {
    pub fn acks(&self, pn: PacketNumber) -> bool {
        self.ranges.iter().any(|r| r.contains(&pn))
    }
}

/// A decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame<'a> {
    /// One or more consecutive PADDING bytes
    Padding { length: usize },
    Ping,
    Ack(AckFrame),
    Crypto {
        offset: u64,
        data: &'a [u8],
    },
    Stream {
        stream_id: StreamId,
        offset: u64,
        data: &'a [u8],
        fin: bool,
    },
    /// Connection-level credit (RFC 9000 Section 19.9)
    MaxData(VarInt),
    /// Stream-level credit (RFC 9000 Section 19.10)
    MaxStreamData {
        stream_id: StreamId,
        maximum: VarInt,
    },
    /// CONNECTION_CLOSE; `frame_type` is present for the transport variant (0x1c)
    ConnectionClose {
        error_code: VarInt,
        frame_type: Option<VarInt>,
        reason: &'a [u8],
    },
    HandshakeDone,
}

impl Frame<'_> {
    /// Wire type used when reporting errors about this frame.
    pub fn frame_type(&self) -> VarInt {
        match self {
            Frame::Padding { .. } => FRAME_TYPE_PADDING,
            Frame::Ping => FRAME_TYPE_PING,
            Frame::Ack(_) => FRAME_TYPE_ACK,
            Frame::Crypto { .. } => FRAME_TYPE_CRYPTO,
            Frame::Stream { offset, fin, .. } => {
                let mut ty = FRAME_TYPE_STREAM_BASE | STREAM_FRAME_BIT_LEN;
                if *offset != 0 {
                    ty |= STREAM_FRAME_BIT_OFF;
                }
                if *fin {
                    ty |= STREAM_FRAME_BIT_FIN;
                }
                ty
            }
            Frame::MaxData(_) => FRAME_TYPE_MAX_DATA,
            Frame::MaxStreamData { .. } => FRAME_TYPE_MAX_STREAM_DATA,
            Frame::ConnectionClose { frame_type: Some(_), .. } => FRAME_TYPE_CONNECTION_CLOSE,
            Frame::ConnectionClose { frame_type: None, .. } => FRAME_TYPE_CONNECTION_CLOSE_APP,
            Frame::HandshakeDone => FRAME_TYPE_HANDSHAKE_DONE,
        }
    }

    /// RFC 9000 Section 13.2: everything but ACK, PADDING and CONNECTION_CLOSE
    pub fn is_ack_eliciting(&self) -> bool {
        !matches!(
            self,
            Frame::Padding { .. } | Frame::Ack(_) | Frame::ConnectionClose { .. }
        )
    }
}
