//! # QUIC Connection Engine (RFC 9000 Section 5)
//!
//! The sans-io [`Connection`] state machine, the glue to the handshake
//! component, and a single-threaded driver for async applications.

pub mod driver;
pub(crate) mod handshake;
pub mod state;


pub use driver::{DatagramSender, QuicConnection};
pub use state::{Connection, ConnectionState, ConnectionStats};
