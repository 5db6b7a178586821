//! # Packet Number Spaces (RFC 9000 Section 12.3, 13.1)
//!
//! One [`PacketSpace`] per epoch: an independent packet number counter,
//! the epoch's keys, duplicate detection for received packet numbers, the
//! pending-ACK state, and the CRYPTO byte stream in both directions.

#![forbid(unsafe_code)]

use crate::crypto::CryptoContext;
use crate::frames::AckFrame;
use crate::stream::buffer::{RecvBuffer, SendBuffer};
use crate::types::{Epoch, PacketNumber};
use bytes::BytesMut;
use std::collections::BTreeMap;

/// Maximum number of disjoint ranges remembered per space
const MAX_ACK_RANGES: usize = 64;

/// Buffering window for out-of-order CRYPTO data
pub const CRYPTO_BUFFER_LIMIT: u64 = 64 * 1024;

/// Received packet numbers as disjoint inclusive ranges.
///
/// Numbers below the oldest retained range count as duplicates once old
/// ranges have been evicted.
#[derive(Debug, Clone, Default)]
pub struct ReceivedPackets {
    /// start -> end (inclusive)
    ranges: BTreeMap<PacketNumber, PacketNumber>,
    /// Everything below this is treated as already seen
    floor: PacketNumber,
}

impl ReceivedPackets {
    pub fn contains(&self, pn: PacketNumber) -> bool {
        if pn < self.floor {
            return true;
        }
        self.ranges
            .range(..=pn)
            .next_back()
            .is_some_and(|(_, end)| pn <= *end)
    }

    /// Record `pn`; returns false if it was already recorded.
    pub fn insert(&mut self, pn: PacketNumber) -> bool {
        if self.contains(pn) {
            return false;
        }
        let mut start = pn;
        let mut end = pn;
        if let Some((&s, &e)) = self.ranges.range(..pn).next_back() {
            if e + 1 == pn {
                start = s;
                self.ranges.remove(&s);
            }
        }
        if let Some(&e) = self.ranges.get(&(pn + 1)) {
            end = e;
            self.ranges.remove(&(pn + 1));
        }
        self.ranges.insert(start, end);

        while self.ranges.len() > MAX_ACK_RANGES {
            if let Some((_, end)) = self.ranges.pop_first() {
                self.floor = end + 1;
            }
        }
        true
    }

    pub fn largest(&self) -> Option<PacketNumber> {
        self.ranges.values().next_back().copied()
    }

    /// ACK frame covering everything recorded.
    pub fn to_ack_frame(&self) -> Option<AckFrame> {
        let largest = self.largest()?;
        Some(AckFrame {
            largest,
            ack_delay: 0,
            ranges: self.ranges.iter().rev().map(|(s, e)| *s..=*e).collect(),
        })
    }
}

/// Whether an ACK is owed, and how urgently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum AckState {
    #[default]
    Idle,
    /// Sent with the next packet that goes out anyway
    Deferred,
    /// Triggers a datagram by itself
    Immediate,
}

/// CRYPTO stream of one epoch.
#[derive(Debug)]
pub struct CryptoStream {
    pub send: SendBuffer,
    pub recv: RecvBuffer,
    /// Everything ever written, kept so a restarted Initial can resend it
    history: BytesMut,
}

impl CryptoStream {
    fn new() -> Self {
        Self {
            send: SendBuffer::new(),
            recv: RecvBuffer::new(CRYPTO_BUFFER_LIMIT),
            history: BytesMut::new(),
        }
    }

    pub fn write(&mut self, data: &[u8]) {
        self.history.extend_from_slice(data);
        self.send.write(data);
    }

    /// Queue the whole stream again from offset zero.
    pub fn rewind(&mut self) {
        self.send.rewind(&self.history);
    }
}

/// Per-epoch connection state.
#[derive(Debug)]
pub struct PacketSpace {
    pub epoch: Epoch,
    next_pn: PacketNumber,
    pub crypto: CryptoContext,
    pub received: ReceivedPackets,
    pub ack: AckState,
    /// Largest of our packet numbers the peer acknowledged
    pub largest_acked: Option<PacketNumber>,
    pub crypto_stream: CryptoStream,
}

impl PacketSpace {
    pub fn new(epoch: Epoch) -> Self {
        Self {
            epoch,
            next_pn: 0,
            crypto: CryptoContext::new(epoch),
            received: ReceivedPackets::default(),
            ack: AckState::Idle,
            largest_acked: None,
            crypto_stream: CryptoStream::new(),
        }
    }

    /// Allocate the next packet number.
    pub fn next_packet_number(&mut self) -> PacketNumber {
        let pn = self.next_pn;
        self.next_pn += 1;
        pn
    }

    pub fn peek_packet_number(&self) -> PacketNumber {
        self.next_pn
    }

    /// Record a received packet and escalate the ACK state.
    pub fn on_packet_received(&mut self, pn: PacketNumber, ack: AckState) {
        self.received.insert(pn);
        self.ack = self.ack.max(ack);
    }

    pub fn on_ack_received(&mut self, ack: &AckFrame) {
        // Ignore acknowledgements for packets never sent
        if ack.largest < self.next_pn {
            self.largest_acked = self.largest_acked.max(Some(ack.largest));
        }
    }

    /// ACK frame to send now, if one is owed.
    pub fn take_ack(&mut self) -> Option<AckFrame> {
        if self.ack == AckState::Idle {
            return None;
        }
        self.ack = AckState::Idle;
        self.received.to_ack_frame()
    }

    /// Forget receive history, restart numbering and empty the CRYPTO
    /// stream (Version Negotiation starts a fresh connection attempt with
    /// a new ClientHello). Keys are replaced by the caller.
    pub fn reset(&mut self) {
        self.next_pn = 0;
        self.received = ReceivedPackets::default();
        self.ack = AckState::Idle;
        self.largest_acked = None;
        self.crypto_stream = CryptoStream::new();
    }

    /// Anything other than an ACK waiting to be sent in this space.
    pub fn has_crypto_pending(&self) -> bool {
        self.crypto_stream.send.has_pending()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod received_tests {
        use super::*;

        #[test]
        fn ranges_merge() {
            let mut rx = ReceivedPackets::default();
            for pn in [0, 1, 2, 5, 4, 9] {
                assert!(rx.insert(pn));
            }
            assert!(!rx.insert(4));
            let ack = rx.to_ack_frame().unwrap();
            assert_eq!(ack.largest, 9);
            assert_eq!(ack.ranges, vec![9..=9, 4..=5, 0..=2]);
        }

        #[test]
        fn bridging_insert_joins_neighbours() {
            let mut rx = ReceivedPackets::default();
            rx.insert(1);
            rx.insert(3);
            rx.insert(2);
            assert_eq!(rx.to_ack_frame().unwrap().ranges, vec![1..=3]);
        }

        #[test]
        fn evicted_ranges_count_as_duplicates() {
            let mut rx = ReceivedPackets::default();
            for i in 0..=MAX_ACK_RANGES as u64 {
                rx.insert(i * 2);
            }
            assert!(rx.contains(0));
            assert!(rx.contains(1));
            assert!(!rx.insert(1));
            assert!(!rx.contains(3));
        }
    }

    #[test]
    fn packet_numbers_increase() {
        let mut space = PacketSpace::new(Epoch::Handshake);
        assert_eq!(space.next_packet_number(), 0);
        assert_eq!(space.next_packet_number(), 1);
        assert_eq!(space.peek_packet_number(), 2);
    }

    #[test]
    fn ack_state_escalates_and_clears() {
        let mut space = PacketSpace::new(Epoch::OneRtt);
        space.on_packet_received(0, AckState::Deferred);
        space.on_packet_received(1, AckState::Idle);
        assert_eq!(space.ack, AckState::Deferred);
        space.on_packet_received(2, AckState::Immediate);
        let ack = space.take_ack().unwrap();
        assert_eq!(ack.ranges, vec![0..=2]);
        assert_eq!(space.take_ack(), None);
    }

    #[test]
    fn ack_for_unsent_packets_is_ignored() {
        let mut space = PacketSpace::new(Epoch::Initial);
        space.next_packet_number();
        space.on_ack_received(&AckFrame {
            largest: 5,
            ack_delay: 0,
            ranges: vec![0..=5],
        });
        assert_eq!(space.largest_acked, None);
        space.on_ack_received(&AckFrame {
            largest: 0,
            ack_delay: 0,
            ranges: vec![0..=0],
        });
        assert_eq!(space.largest_acked, Some(0));
    }

    #[test]
    fn reset_starts_a_fresh_crypto_stream() {
        let mut space = PacketSpace::new(Epoch::Initial);
        space.crypto_stream.write(b"client hello");
        let chunk = space.crypto_stream.send.pop_chunk(100).unwrap();
        assert_eq!(chunk.offset, 0);
        space.next_packet_number();
        space.reset();
        assert_eq!(space.peek_packet_number(), 0);
        assert!(!space.has_crypto_pending());

        space.crypto_stream.write(b"second hello");
        let chunk = space.crypto_stream.send.pop_chunk(100).unwrap();
        assert_eq!((chunk.offset, &chunk.data[..]), (0, &b"second hello"[..]));
    }
}
