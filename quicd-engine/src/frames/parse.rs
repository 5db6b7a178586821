//! # Frame Parsing and Serialization (RFC 9000 Section 19)
//!
//! Parsing is zero-copy: data-carrying frames borrow from the payload.
//! Any unknown type or truncated body yields [`Error::FrameDecode`]; the
//! caller then discards the whole packet.

#![forbid(unsafe_code)]

use super::types::*;
use crate::error::{Error, Result};
use crate::types::{ByteReader, StreamId, VarIntCodec};
use bytes::{BufMut, BytesMut};

/// Frame parser trait
pub trait FrameParser {
    /// Parse a single frame, returning it and the bytes consumed.
    fn parse_frame<'a>(&self, buf: &'a [u8]) -> Result<(Frame<'a>, usize)>;

    /// Iterate over every frame in a packet payload.
    fn iter_frames<'a>(&'a self, payload: &'a [u8]) -> FrameIterator<'a, Self>
    where
        Self: Sized,
    {
        FrameIterator {
            parser: self,
            buf: payload,
            offset: 0,
        }
    }
}

/// Iterator over the frames of a payload. Stops after the first error.
pub struct FrameIterator<'a, P: FrameParser + ?Sized> {
    parser: &'a P,
    buf: &'a [u8],
    offset: usize,
}

impl<'a, P: FrameParser + ?Sized> Iterator for FrameIterator<'a, P> {
    type Item = Result<Frame<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset >= self.buf.len() {
            return None;
        }
        match self.parser.parse_frame(&self.buf[self.offset..]) {
            Ok((frame, consumed)) => {
                self.offset += consumed;
                Some(Ok(frame))
            }
            Err(e) => {
                self.offset = self.buf.len();
                Some(Err(e))
            }
        }
    }
}

/// Default frame parser implementation
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultFrameParser;

impl FrameParser for DefaultFrameParser {
    fn parse_frame<'a>(&self, buf: &'a [u8]) -> Result<(Frame<'a>, usize)> {
        let mut r = ByteReader::new(buf);
        let frame_type = r.varint().ok_or(Error::FrameDecode)?;

        let frame = match frame_type {
            FRAME_TYPE_PADDING => {
                let mut length = 1;
                while buf.get(length) == Some(&0) {
                    length += 1;
                }
                return Ok((Frame::Padding { length }, length));
            }
            FRAME_TYPE_PING => Frame::Ping,
            FRAME_TYPE_ACK | FRAME_TYPE_ACK_ECN => {
                Frame::Ack(parse_ack(&mut r, frame_type == FRAME_TYPE_ACK_ECN).ok_or(Error::FrameDecode)?)
            }
            FRAME_TYPE_CRYPTO => {
                let offset = r.varint().ok_or(Error::FrameDecode)?;
                let data = length_prefixed(&mut r)?;
                Frame::Crypto { offset, data }
            }
            FRAME_TYPE_STREAM_BASE..=FRAME_TYPE_STREAM_MAX => {
                let stream_id = StreamId(r.varint().ok_or(Error::FrameDecode)?);
                let offset = if frame_type & STREAM_FRAME_BIT_OFF != 0 {
                    r.varint().ok_or(Error::FrameDecode)?
                } else {
                    0
                };
                let data = if frame_type & STREAM_FRAME_BIT_LEN != 0 {
                    length_prefixed(&mut r)?
                } else {
                    r.rest()
                };
                Frame::Stream {
                    stream_id,
                    offset,
                    data,
                    fin: frame_type & STREAM_FRAME_BIT_FIN != 0,
                }
            }
            FRAME_TYPE_MAX_DATA => Frame::MaxData(r.varint().ok_or(Error::FrameDecode)?),
            FRAME_TYPE_MAX_STREAM_DATA => {
                let stream_id = StreamId(r.varint().ok_or(Error::FrameDecode)?);
                let maximum = r.varint().ok_or(Error::FrameDecode)?;
                Frame::MaxStreamData { stream_id, maximum }
            }
            FRAME_TYPE_CONNECTION_CLOSE | FRAME_TYPE_CONNECTION_CLOSE_APP => {
                let error_code = r.varint().ok_or(Error::FrameDecode)?;
                let offending = if frame_type == FRAME_TYPE_CONNECTION_CLOSE {
                    Some(r.varint().ok_or(Error::FrameDecode)?)
                } else {
                    None
                };
                let reason = length_prefixed(&mut r)?;
                Frame::ConnectionClose {
                    error_code,
                    frame_type: offending,
                    reason,
                }
            }
            FRAME_TYPE_HANDSHAKE_DONE => Frame::HandshakeDone,
            _ => return Err(Error::FrameDecode),
        };
        Ok((frame, r.position()))
    }
}

fn length_prefixed<'a>(r: &mut ByteReader<'a>) -> Result<&'a [u8]> {
    let len = r.varint().ok_or(Error::FrameDecode)?;
    let len = usize::try_from(len).map_err(|_| Error::FrameDecode)?;
    r.bytes(len).ok_or(Error::FrameDecode)
}

fn parse_ack(r: &mut ByteReader<'_>, ecn: bool) -> Option<AckFrame> {
    let largest = r.varint()?;
    let ack_delay = r.varint()?;
    let range_count = r.varint()?;
    let first_range = r.varint()?;

    let mut smallest = largest.checked_sub(first_range)?;
    // Each additional range needs at least two bytes
    let mut ranges = Vec::with_capacity(usize::try_from(range_count).ok()?.min(r.remaining() / 2) + 1);
    ranges.push(smallest..=largest);
    for _ in 0..range_count {
        let gap = r.varint()?;
        let len = r.varint()?;
        let high = smallest.checked_sub(gap)?.checked_sub(2)?;
        let low = high.checked_sub(len)?;
        ranges.push(low..=high);
        smallest = low;
    }
    if ecn {
        for _ in 0..3 {
            r.varint()?;
        }
    }
    Some(AckFrame {
        largest,
        ack_delay,
        ranges,
    })
}

// ============================================================================
// Serialization
// ============================================================================

/// Frame serializer trait. The caller provides the buffer.
pub trait FrameSerializer {
    /// Append `frame` to `buf`, returning the bytes written.
    fn serialize_frame(&self, frame: &Frame<'_>, buf: &mut BytesMut) -> Result<usize>;

    /// Encoded size of `frame`.
    fn frame_size(&self, frame: &Frame<'_>) -> usize;
}

/// Default frame serializer implementation
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultFrameSerializer;

fn varint_len(v: u64) -> usize {
    VarIntCodec::size(v).unwrap_or(8)
}

impl FrameSerializer for DefaultFrameSerializer {
    fn serialize_frame(&self, frame: &Frame<'_>, buf: &mut BytesMut) -> Result<usize> {
        let start = buf.len();
        match frame {
            Frame::Padding { length } => buf.put_bytes(0, *length),
            Frame::Ping => VarIntCodec::put(buf, FRAME_TYPE_PING),
            Frame::Ack(ack) => {
                let (first, rest) = ack.ranges.split_first().ok_or(Error::FrameDecode)?;
                VarIntCodec::put(buf, FRAME_TYPE_ACK);
                VarIntCodec::put(buf, ack.largest);
                VarIntCodec::put(buf, ack.ack_delay);
                VarIntCodec::put(buf, rest.len() as u64);
                VarIntCodec::put(buf, ack.largest - first.start());
                let mut smallest = *first.start();
                for range in rest {
                    VarIntCodec::put(buf, smallest - range.end() - 2);
                    VarIntCodec::put(buf, range.end() - range.start());
                    smallest = *range.start();
                }
            }
            Frame::Crypto { offset, data } => {
                VarIntCodec::put(buf, FRAME_TYPE_CRYPTO);
                VarIntCodec::put(buf, *offset);
                VarIntCodec::put(buf, data.len() as u64);
                buf.put_slice(data);
            }
            Frame::Stream {
                stream_id,
                offset,
                data,
                ..
            } => {
                VarIntCodec::put(buf, frame.frame_type());
                VarIntCodec::put(buf, stream_id.value());
                if *offset != 0 {
                    VarIntCodec::put(buf, *offset);
                }
                VarIntCodec::put(buf, data.len() as u64);
                buf.put_slice(data);
            }
            Frame::MaxData(maximum) => {
                VarIntCodec::put(buf, FRAME_TYPE_MAX_DATA);
                VarIntCodec::put(buf, *maximum);
            }
            Frame::MaxStreamData { stream_id, maximum } => {
                VarIntCodec::put(buf, FRAME_TYPE_MAX_STREAM_DATA);
                VarIntCodec::put(buf, stream_id.value());
                VarIntCodec::put(buf, *maximum);
            }
            Frame::ConnectionClose {
                error_code,
                frame_type,
                reason,
            } => {
                VarIntCodec::put(buf, frame.frame_type());
                VarIntCodec::put(buf, *error_code);
                if let Some(ty) = frame_type {
                    VarIntCodec::put(buf, *ty);
                }
                VarIntCodec::put(buf, reason.len() as u64);
                buf.put_slice(reason);
            }
            Frame::HandshakeDone => VarIntCodec::put(buf, FRAME_TYPE_HANDSHAKE_DONE),
        }
        Ok(buf.len() - start)
    }

    fn frame_size(&self, frame: &Frame<'_>) -> usize {
        match frame {
            Frame::Padding { length } => *length,
            Frame::Ping | Frame::HandshakeDone => 1,
            Frame::Ack(ack) => {
                let Some((first, rest)) = ack.ranges.split_first() else {
                    return 0;
                };
                let mut size = 1
                    + varint_len(ack.largest)
                    + varint_len(ack.ack_delay)
                    + varint_len(rest.len() as u64)
                    + varint_len(ack.largest - first.start());
                let mut smallest = *first.start();
                for range in rest {
                    size += varint_len(smallest - range.end() - 2) + varint_len(range.end() - range.start());
                    smallest = *range.start();
                }
                size
            }
            Frame::Crypto { offset, data } => crypto_frame_overhead(*offset, data.len()) + data.len(),
            Frame::Stream {
                stream_id,
                offset,
                data,
                ..
            } => stream_frame_overhead(*stream_id, *offset, data.len()) + data.len(),
            Frame::MaxData(maximum) => 1 + varint_len(*maximum),
            Frame::MaxStreamData { stream_id, maximum } => 1 + varint_len(stream_id.value()) + varint_len(*maximum),
            Frame::ConnectionClose {
                error_code,
                frame_type,
                reason,
            } => {
                1 + varint_len(*error_code)
                    + frame_type.map_or(0, varint_len)
                    + varint_len(reason.len() as u64)
                    + reason.len()
            }
        }
    }
}

/// Bytes a CRYPTO frame adds on top of its data.
pub fn crypto_frame_overhead(offset: u64, len: usize) -> usize {
    1 + varint_len(offset) + varint_len(len as u64)
}

/// Bytes a STREAM frame (always with explicit length) adds on top of its data.
pub fn stream_frame_overhead(stream_id: StreamId, offset: u64, len: usize) -> usize {
    let offset_len = if offset != 0 { varint_len(offset) } else { 0 };
    1 + varint_len(stream_id.value()) + offset_len + varint_len(len as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(frame: &Frame<'_>) -> BytesMut {
        let mut buf = BytesMut::new();
        let written = DefaultFrameSerializer.serialize_frame(frame, &mut buf).unwrap();
        assert_eq!(written, buf.len());
        assert_eq!(DefaultFrameSerializer.frame_size(frame), written, "{frame:?}");
        buf
    }

    mod stream_frame_tests {
        use super::*;

        #[test]
        fn stream_frame_flags() {
            let frame = Frame::Stream {
                stream_id: StreamId(4),
                offset: 10,
                data: b"ping",
                fin: true,
            };
            let buf = encode(&frame);
            assert_eq!(buf[0], 0x0f);
            let (parsed, consumed) = DefaultFrameParser.parse_frame(&buf).unwrap();
            assert_eq!(parsed, frame);
            assert_eq!(consumed, buf.len());
        }

        /// Without the LEN bit the data runs to the end of the packet
        #[test]
        fn implicit_length_takes_rest() {
            let buf = [0x08, 0x00, b'a', b'b', b'c'];
            let (frame, consumed) = DefaultFrameParser.parse_frame(&buf).unwrap();
            assert_eq!(consumed, 5);
            assert_eq!(
                frame,
                Frame::Stream {
                    stream_id: StreamId(0),
                    offset: 0,
                    data: b"abc",
                    fin: false,
                }
            );
        }

        #[test]
        fn truncated_stream_data() {
            let buf = [0x0a, 0x00, 0x05, b'a'];
            assert_eq!(DefaultFrameParser.parse_frame(&buf), Err(Error::FrameDecode));
        }
    }

    mod ack_frame_tests {
        use super::*;

        #[test]
        fn multiple_ranges() {
            let frame = Frame::Ack(AckFrame {
                largest: 20,
                ack_delay: 0,
                ranges: vec![18..=20, 10..=15, 3..=3],
            });
            let buf = encode(&frame);
            let (parsed, _) = DefaultFrameParser.parse_frame(&buf).unwrap();
            assert_eq!(parsed, frame);
            if let Frame::Ack(ack) = parsed {
                assert!(ack.acks(12));
                assert!(!ack.acks(16));
            }
        }

        #[test]
        fn range_underflow_is_rejected() {
            // largest 2, first range 5
            let buf = [0x02, 0x02, 0x00, 0x00, 0x05];
            assert_eq!(DefaultFrameParser.parse_frame(&buf), Err(Error::FrameDecode));
        }

        #[test]
        fn ecn_counts_are_consumed() {
            let buf = [0x03, 0x01, 0x00, 0x00, 0x00, 0x01, 0x02, 0x03, 0x01];
            let frames: Vec<_> = DefaultFrameParser.iter_frames(&buf).collect();
            assert_eq!(frames.len(), 2);
            assert!(matches!(frames[1], Ok(Frame::Ping)));
        }
    }

    mod close_frame_tests {
        use super::*;

        #[test]
        fn transport_and_application_variants() {
            let transport = Frame::ConnectionClose {
                error_code: 0x0a,
                frame_type: Some(0x08),
                reason: b"bad stream",
            };
            let buf = encode(&transport);
            assert_eq!(buf[0], 0x1c);
            assert_eq!(DefaultFrameParser.parse_frame(&buf).unwrap().0, transport);

            let app = Frame::ConnectionClose {
                error_code: 7,
                frame_type: None,
                reason: b"",
            };
            let buf = encode(&app);
            assert_eq!(buf[0], 0x1d);
            assert_eq!(DefaultFrameParser.parse_frame(&buf).unwrap().0, app);
        }
    }

    #[test]
    fn credit_frames() {
        let frame = Frame::MaxStreamData {
            stream_id: StreamId(4),
            maximum: 3 << 20,
        };
        let buf = encode(&frame);
        assert_eq!(buf[0], 0x11);
        assert_eq!(DefaultFrameParser.parse_frame(&buf).unwrap(), (frame, buf.len()));

        let buf = encode(&Frame::MaxData(16_384));
        assert_eq!(&buf[..], &[0x10, 0x80, 0x00, 0x40, 0x00]);
        assert!(Frame::MaxData(1).is_ack_eliciting());
        assert_eq!(DefaultFrameParser.parse_frame(&[0x11, 0x04]), Err(Error::FrameDecode));
    }

    #[test]
    fn padding_is_coalesced() {
        let buf = [0x00, 0x00, 0x00, 0x01];
        let frames: Vec<_> = DefaultFrameParser
            .iter_frames(&buf)
            .collect::<Result<Vec<_>>>()
            .unwrap();
        assert_eq!(frames, vec![Frame::Padding { length: 3 }, Frame::Ping]);
    }

    #[test]
    fn unknown_type_stops_iteration() {
        let buf = [0x01, 0x21, 0x01];
        let frames: Vec<_> = DefaultFrameParser.iter_frames(&buf).collect();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[1], Err(Error::FrameDecode));
    }

    #[test]
    fn crypto_frame_round_trip() {
        let frame = Frame::Crypto {
            offset: 300,
            data: &[1, 2, 3],
        };
        let buf = encode(&frame);
        assert_eq!(DefaultFrameParser.parse_frame(&buf).unwrap(), (frame, buf.len()));
    }
}
