//! Decoder robustness: arbitrary input never panics, it is either decoded
//! or rejected with an error.

use proptest::prelude::*;
use quicd_engine::crypto::PacketKey;
use quicd_engine::frames::{DefaultFrameParser, FrameParser};
use quicd_engine::packet::{open_packet, DefaultHeaderParser, PacketParser};
use quicd_engine::stream::RecvBuffer;
use quicd_engine::transport::TransportParameters;
use quicd_engine::types::VarIntCodec;
use quicd_engine::{ConnectionConfig, Connection, ServerIdentity, Side, Version};

proptest! {
    #[test]
    fn header_parser_never_panics(data in proptest::collection::vec(any::<u8>(), 0..1500), cid_len in 0usize..=20) {
        let parser = DefaultHeaderParser::new(cid_len);
        if let Ok(parsed) = parser.parse_packet(&data) {
            prop_assert!(parsed.packet_len <= data.len());
        }
    }

    #[test]
    fn frame_parser_never_panics(data in proptest::collection::vec(any::<u8>(), 0..512)) {
        let parser = DefaultFrameParser;
        for frame in parser.iter_frames(&data) {
            if frame.is_err() {
                break;
            }
        }
    }

    #[test]
    fn varint_decode_is_consistent(data in proptest::collection::vec(any::<u8>(), 0..9)) {
        if let Some((value, len)) = VarIntCodec::decode(&data) {
            prop_assert!(len <= data.len());
            prop_assert_eq!(VarIntCodec::size(value).map(|s| s <= len), Some(true));
        }
    }

    #[test]
    fn transport_parameters_decode_never_panics(data in proptest::collection::vec(any::<u8>(), 0..256)) {
        let _ = TransportParameters::decode(&data);
    }

    #[test]
    fn open_rejects_garbage(
        data in proptest::collection::vec(any::<u8>(), 0..256),
        pn_offset in 0usize..64,
    ) {
        let (_, key) = PacketKey::initial(Version::V1, &[7u8; 8], Side::Server).unwrap();
        prop_assert!(open_packet(&key, &data, pn_offset, None).is_err());
    }

    #[test]
    fn recv_buffer_accepts_any_segment_order(
        segments in proptest::collection::vec((0u64..64, proptest::collection::vec(any::<u8>(), 0..16)), 0..16),
    ) {
        let mut buf = RecvBuffer::new(1024);
        for (offset, data) in &segments {
            let _ = buf.insert(*offset, data, false);
        }
        let read = buf.read(usize::MAX);
        prop_assert!(read.len() <= 80);
    }

    #[test]
    fn connection_survives_random_datagrams(datagrams in proptest::collection::vec(proptest::collection::vec(any::<u8>(), 0..1300), 0..8)) {
        let mut server = Connection::new_server(
            ConnectionConfig::default(),
            ServerIdentity::from_pem(include_bytes!("certs/server.pem"), include_bytes!("certs/server.key")).unwrap(),
        ).unwrap();
        for datagram in &datagrams {
            server.handle_datagram(datagram);
            while server.poll_transmit().is_some() {}
        }
        prop_assert_eq!(server.stats().datagrams_received, datagrams.len() as u64);
    }
}
