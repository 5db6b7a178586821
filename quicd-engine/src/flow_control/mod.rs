//! # Flow Control (RFC 9000 Section 4)
//!
//! Credit-based limits at two levels: per stream (MAX_STREAM_DATA) and for
//! the connection as a whole (MAX_DATA). Initial values travel in the
//! transport parameters.

pub mod controller;

pub use controller::{FlowControlLimit, RecvWindow, SendCredit};
