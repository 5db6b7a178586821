//! # Stream Data Buffers (RFC 9000 Section 2.2)
//!
//! STREAM and CRYPTO frames may arrive out of order or overlap. The receive
//! buffer keeps the contiguous prefix ready for reading and parks later
//! segments, keyed by offset, until the gap before them closes. The send
//! buffer holds bytes the application wrote that have not been framed yet.

#![forbid(unsafe_code)]

use bytes::{Bytes, BytesMut};
use std::collections::BTreeMap;

/// Why a received segment was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertError {
    /// Data past the final size, or a conflicting final size
    FinalSize,
    /// Data beyond the buffering window
    LimitExceeded,
}

/// Reassembly buffer for one receive direction.
#[derive(Debug)]
pub struct RecvBuffer {
    /// Offset of the first byte in `ready`
    read_offset: u64,
    /// Contiguous bytes not yet read
    ready: BytesMut,
    /// Out-of-order segments beyond the contiguous prefix
    pending: BTreeMap<u64, Bytes>,
    fin_offset: Option<u64>,
    /// Largest end offset accepted, relative to `read_offset`
    window: u64,
}

impl RecvBuffer {
    pub fn new(window: u64) -> Self {
        Self {
            read_offset: 0,
            ready: BytesMut::new(),
            pending: BTreeMap::new(),
            fin_offset: None,
            window,
        }
    }

    fn contiguous_end(&self) -> u64 {
        self.read_offset + self.ready.len() as u64
    }

    /// Accept `data` at `offset`. Duplicate and overlapping bytes are ignored.
    pub fn insert(&mut self, offset: u64, data: &[u8], fin: bool) -> Result<(), InsertError> {
        let end = offset.checked_add(data.len() as u64).ok_or(InsertError::FinalSize)?;

        if end > self.read_offset + self.window {
            return Err(InsertError::LimitExceeded);
        }
        if let Some(fin_offset) = self.fin_offset {
            if end > fin_offset || (fin && end != fin_offset) {
                return Err(InsertError::FinalSize);
            }
        }
        if fin {
            let highest = self
                .pending
                .iter()
                .next_back()
                .map_or(self.contiguous_end(), |(o, d)| o + d.len() as u64)
                .max(self.contiguous_end());
            if end < highest {
                return Err(InsertError::FinalSize);
            }
            self.fin_offset = Some(end);
        }
        let contiguous_end = self.contiguous_end();
        if end <= contiguous_end {
            return Ok(());
        }
        if offset <= contiguous_end {
            let skip = (contiguous_end - offset) as usize;
            self.ready.extend_from_slice(&data[skip..]);
            self.drain_pending();
        } else {
            let keep = match self.pending.get(&offset) {
                Some(existing) => existing.len() < data.len(),
                None => true,
            };
            if keep {
                self.pending.insert(offset, Bytes::copy_from_slice(data));
            }
        }
        Ok(())
    }

    fn drain_pending(&mut self) {
        loop {
            let contiguous_end = self.contiguous_end();
            let Some(entry) = self.pending.first_entry() else {
                break;
            };
            if *entry.key() > contiguous_end {
                break;
            }
            let (offset, segment) = entry.remove_entry();
            let end = offset + segment.len() as u64;
            if end > contiguous_end {
                let skip = (contiguous_end - offset) as usize;
                self.ready.extend_from_slice(&segment[skip..]);
            }
        }
    }

    /// Take up to `max` contiguous bytes.
    pub fn read(&mut self, max: usize) -> Bytes {
        let n = max.min(self.ready.len());
        self.read_offset += n as u64;
        self.ready.split_to(n).freeze()
    }

    /// Bytes ready for reading.
    pub fn available(&self) -> usize {
        self.ready.len()
    }

    pub fn fin_received(&self) -> bool {
        self.fin_offset.is_some()
    }

    /// Every byte up to the final size has arrived.
    pub fn is_complete(&self) -> bool {
        self.fin_offset == Some(self.contiguous_end())
    }

    /// Every byte up to the final size has been read.
    pub fn is_drained(&self) -> bool {
        self.fin_offset == Some(self.read_offset)
    }
}

/// Outgoing bytes of one send direction.
#[derive(Debug, Default)]
pub struct SendBuffer {
    /// Offset of the first unsent byte
    offset: u64,
    pending: BytesMut,
    fin_pending: bool,
    fin_sent: bool,
}

/// A chunk ready to be framed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendChunk {
    pub offset: u64,
    pub data: Bytes,
    pub fin: bool,
}

impl SendBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write(&mut self, data: &[u8]) {
        self.pending.extend_from_slice(data);
    }

    /// Mark the end of the stream; the FIN goes out once the buffer drains.
    pub fn finish(&mut self) {
        self.fin_pending = true;
    }

    pub fn is_finished(&self) -> bool {
        self.fin_pending
    }

    pub fn fin_sent(&self) -> bool {
        self.fin_sent
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty() || (self.fin_pending && !self.fin_sent)
    }

    /// Bytes written but not framed yet.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Offset the next chunk will start at.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Take the next chunk of at most `max` bytes. A FIN-only chunk is
    /// returned once, after all data.
    pub fn pop_chunk(&mut self, max: usize) -> Option<SendChunk> {
        if !self.has_pending() {
            return None;
        }
        let n = max.min(self.pending.len());
        if n == 0 && !self.pending.is_empty() {
            return None;
        }
        let offset = self.offset;
        let data = self.pending.split_to(n).freeze();
        self.offset += n as u64;
        let fin = self.fin_pending && self.pending.is_empty();
        if fin {
            self.fin_sent = true;
        }
        Some(SendChunk { offset, data, fin })
    }

    /// Requeue everything from offset zero. `history` is the full byte
    /// stream written so far.
    pub fn rewind(&mut self, history: &[u8]) {
        self.offset = 0;
        self.pending = BytesMut::from(history);
        self.fin_sent = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod recv_tests {
        use super::*;

        #[test]
        fn in_order_delivery() {
            let mut buf = RecvBuffer::new(1024);
            buf.insert(0, b"hello ", false).unwrap();
            buf.insert(6, b"world", true).unwrap();
            assert!(buf.is_complete());
            assert_eq!(buf.read(5), Bytes::from_static(b"hello"));
            assert_eq!(buf.read(100), Bytes::from_static(b" world"));
            assert!(buf.is_drained());
        }

        #[test]
        fn gap_is_filled_later() {
            let mut buf = RecvBuffer::new(1024);
            buf.insert(4, b"efgh", false).unwrap();
            assert_eq!(buf.available(), 0);
            buf.insert(0, b"abcd", false).unwrap();
            assert_eq!(buf.read(usize::MAX), Bytes::from_static(b"abcdefgh"));
        }

        #[test]
        fn parked_segments_drain_in_order() {
            let mut buf = RecvBuffer::new(1024);
            buf.insert(9, b"jk", true).unwrap();
            buf.insert(6, b"ghi", false).unwrap();
            buf.insert(2, b"cdef", false).unwrap();
            buf.insert(3, b"de", false).unwrap();
            assert_eq!(buf.available(), 0);
            buf.insert(0, b"abc", false).unwrap();
            assert!(buf.is_complete());
            assert_eq!(buf.read(usize::MAX), Bytes::from_static(b"abcdefghijk"));
            assert!(buf.is_drained());
        }

        #[test]
        fn overlap_and_duplicates_are_trimmed() {
            let mut buf = RecvBuffer::new(1024);
            buf.insert(0, b"abc", false).unwrap();
            buf.insert(0, b"abc", false).unwrap();
            buf.insert(5, b"fg", false).unwrap();
            buf.insert(2, b"cdef", false).unwrap();
            assert_eq!(buf.read(usize::MAX), Bytes::from_static(b"abcdefg"));
        }

        #[test]
        fn final_size_violations() {
            let mut buf = RecvBuffer::new(1024);
            buf.insert(0, b"abcd", true).unwrap();
            assert_eq!(buf.insert(4, b"x", false), Err(InsertError::FinalSize));
            assert_eq!(buf.insert(0, b"ab", true), Err(InsertError::FinalSize));

            let mut buf = RecvBuffer::new(1024);
            buf.insert(10, b"zz", false).unwrap();
            assert_eq!(buf.insert(0, b"a", true), Err(InsertError::FinalSize));
        }

        #[test]
        fn window_is_enforced() {
            let mut buf = RecvBuffer::new(8);
            assert_eq!(buf.insert(4, b"abcdefgh", false), Err(InsertError::LimitExceeded));
            buf.insert(0, b"abcdefgh", false).unwrap();
            buf.read(4);
            buf.insert(8, b"ijkl", false).unwrap();
        }

        #[test]
        fn empty_fin_completes_stream() {
            let mut buf = RecvBuffer::new(16);
            buf.insert(0, b"ab", false).unwrap();
            buf.insert(2, b"", true).unwrap();
            assert!(buf.is_complete());
            assert!(!buf.is_drained());
            buf.read(2);
            assert!(buf.is_drained());
        }
    }

    mod send_tests {
        use super::*;

        #[test]
        fn chunks_carry_offsets_and_single_fin() {
            let mut buf = SendBuffer::new();
            buf.write(b"abcdef");
            buf.finish();
            let first = buf.pop_chunk(4).unwrap();
            assert_eq!((first.offset, &first.data[..], first.fin), (0, &b"abcd"[..], false));
            let second = buf.pop_chunk(4).unwrap();
            assert_eq!((second.offset, &second.data[..], second.fin), (4, &b"ef"[..], true));
            assert!(buf.fin_sent());
            assert_eq!(buf.pop_chunk(4), None);
        }

        #[test]
        fn fin_without_data() {
            let mut buf = SendBuffer::new();
            buf.finish();
            let chunk = buf.pop_chunk(10).unwrap();
            assert!(chunk.fin && chunk.data.is_empty());
            assert!(!buf.has_pending());
        }

        #[test]
        fn rewind_requeues_history() {
            let mut buf = SendBuffer::new();
            buf.write(b"hello");
            buf.pop_chunk(10).unwrap();
            buf.rewind(b"hello");
            let chunk = buf.pop_chunk(10).unwrap();
            assert_eq!((chunk.offset, &chunk.data[..]), (0, &b"hello"[..]));
        }
    }
}
