//! # QUIC Packets (RFC 9000 Section 17, RFC 9001 Section 5)
//!
//! Header codec, packet number encoding, packet protection, Retry packets
//! and the per-epoch packet number spaces.

pub mod header;
pub mod number;
pub mod protection;
pub mod retry;
pub mod space;

pub use header::{
    encode_version_negotiation, write_long_header, write_short_header, DefaultHeaderParser, Header, LongHeader,
    LongPacketType, PacketParser, ParsedPacket, ShortHeader, RETRY_INTEGRITY_TAG_LEN,
};
pub use protection::{min_payload_len, open_packet, seal_packet, OpenedPacket};
pub use retry::{encode_retry, verify_integrity, RetryTokenKey};
pub use space::{AckState, PacketSpace, ReceivedPackets, CRYPTO_BUFFER_LIMIT};
