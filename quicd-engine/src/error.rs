//! QUIC Error Types
//!
//! RFC 9000 Section 20 defines two error domains:
//! - **Transport Errors**: Protocol violations at the QUIC layer
//! - **Application Errors**: Application-specific errors carried over QUIC
//!
//! Errors raised while processing a received datagram never leave the
//! engine; they are turned into a silent drop or a local close.

#![forbid(unsafe_code)]

use crate::types::Epoch;
use thiserror::Error;

/// Transport Error Codes as defined in RFC 9000 Section 20.1
///
/// Carried in CONNECTION_CLOSE frames of type 0x1c.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u64)]
pub enum TransportErrorCode {
    NoError = 0x00,
    InternalError = 0x01,
    ConnectionRefused = 0x02,
    FlowControlError = 0x03,
    StreamLimitError = 0x04,
    /// Frame received in a stream state that does not permit it
    StreamStateError = 0x05,
    FinalSizeError = 0x06,
    FrameEncodingError = 0x07,
    TransportParameterError = 0x08,
    ConnectionIdLimitError = 0x09,
    ProtocolViolation = 0x0a,
    InvalidToken = 0x0b,
    ApplicationError = 0x0c,
    CryptoBufferExceeded = 0x0d,
    KeyUpdateError = 0x0e,
    AeadLimitReached = 0x0f,
    NoViablePath = 0x10,
}

impl TransportErrorCode {
    pub fn code(self) -> u64 {
        self as u64
    }
}

/// Base of the CRYPTO_ERROR range (RFC 9001 Section 4.8): a TLS alert
/// `a` is reported as `0x0100 + a`.
pub const CRYPTO_ERROR_BASE: u64 = 0x0100;

/// A connection-terminating error, as it appears in a CONNECTION_CLOSE
/// frame. `frame_type` is present for transport-level closes only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionError {
    pub error_code: u64,
    pub frame_type: Option<u64>,
    pub reason: String,
}

impl ConnectionError {
    /// Transport-level error blamed on the frame type `frame_type`.
    pub fn transport(code: TransportErrorCode, frame_type: u64, reason: impl Into<String>) -> Self {
        Self {
            error_code: code.code(),
            frame_type: Some(frame_type),
            reason: reason.into(),
        }
    }

    /// Handshake failure reported as CRYPTO_ERROR on a CRYPTO frame.
    pub fn crypto(alert: u8, reason: impl Into<String>) -> Self {
        Self {
            error_code: CRYPTO_ERROR_BASE + u64::from(alert),
            frame_type: Some(crate::frames::FRAME_TYPE_CRYPTO),
            reason: reason.into(),
        }
    }

    pub fn is_application(&self) -> bool {
        self.frame_type.is_none()
    }
}

/// Main error type for QUIC operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// Declared lengths exceed the buffer, or a fixed field is invalid
    #[error("malformed packet header")]
    MalformedHeader,

    /// Unknown frame type or truncated frame body
    #[error("frame decode error")]
    FrameDecode,

    /// AEAD authentication failed or header protection could not be removed
    #[error("packet authentication failed")]
    Decryption,

    #[error("no {0} key installed")]
    KeyUnavailable(Epoch),

    #[error("duplicate packet number {0}")]
    DuplicatePacket(u64),

    /// A protocol violation that closes the connection
    #[error("transport error {:#x}: {}", .0.error_code, .0.reason)]
    Transport(ConnectionError),

    /// The handshake component failed; `alert` is a TLS alert code
    #[error("handshake failed (alert {alert}): {reason}")]
    Handshake { alert: u8, reason: String },

    #[error("stream {0} not found")]
    StreamNotFound(u64),

    #[error("stream {0} does not permit this operation")]
    StreamState(u64),

    #[error("connection closed")]
    ConnectionClosed,

    /// The peer offered no version we support
    #[error("version negotiation failed")]
    VersionNegotiationFailed,

    #[error("unsupported version {0:#010x}")]
    UnsupportedVersion(u32),

    #[error("invalid retry packet")]
    InvalidRetry,

    #[error("buffer too small")]
    BufferTooSmall,

    #[error("invalid key material")]
    InvalidKey,

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl From<ConnectionError> for Error {
    fn from(err: ConnectionError) -> Self {
        Error::Transport(err)
    }
}

/// Result type alias for QUIC operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crypto_error_maps_alert() {
        let err = ConnectionError::crypto(40, "handshake failure");
        assert_eq!(err.error_code, 0x128);
        assert_eq!(err.frame_type, Some(0x06));
        assert!(!err.is_application());
    }

    #[test]
    fn display_includes_code() {
        let err = Error::from(ConnectionError::transport(
            TransportErrorCode::StreamStateError,
            0x08,
            "send-only stream",
        ));
        assert_eq!(err.to_string(), "transport error 0x5: send-only stream");
    }
}
