//! # QUIC Cryptography (RFC 9001)
//!
//! Packet protection keys, per-epoch key holders and key-log export. Key
//! derivation and the AEAD and header protection primitives come from
//! `rustls::quic` on the ring provider.

pub mod context;
pub mod keylog;
pub mod keys;

pub use context::{CryptoContext, KeyState};
pub use keylog::{secret_label, KeyLog, SecretCollector};
pub use keys::{CipherSuite, PacketKey, SAMPLE_LEN, TAG_LEN};
