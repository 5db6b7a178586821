//! # Transport Parameters (RFC 9000 Section 18)
//!
//! Exchanged inside the handshake as a sequence of
//! `(id: varint, length: varint, value)` tuples. The engine understands the
//! connection ID parameters used to authenticate Retry and Version
//! Negotiation, the initial flow control limits, the idle timeout and the
//! UDP payload limit. Unknown parameters are skipped.

#![forbid(unsafe_code)]

use crate::error::{ConnectionError, Error, Result, TransportErrorCode};
use crate::frames::FRAME_TYPE_CRYPTO;
use crate::types::{ByteReader, ConnectionId, VarInt, VarIntCodec};
use bytes::{BufMut, BytesMut};

/// Transport Parameter ID (RFC 9000 Section 18.2)
pub type TransportParameterId = VarInt;

pub const TP_ORIGINAL_DESTINATION_CONNECTION_ID: TransportParameterId = 0x00;
pub const TP_MAX_IDLE_TIMEOUT: TransportParameterId = 0x01;
pub const TP_MAX_UDP_PAYLOAD_SIZE: TransportParameterId = 0x03;
pub const TP_INITIAL_MAX_DATA: TransportParameterId = 0x04;
pub const TP_INITIAL_MAX_STREAM_DATA_BIDI_LOCAL: TransportParameterId = 0x05;
pub const TP_INITIAL_MAX_STREAM_DATA_BIDI_REMOTE: TransportParameterId = 0x06;
pub const TP_INITIAL_MAX_STREAM_DATA_UNI: TransportParameterId = 0x07;
pub const TP_INITIAL_SOURCE_CONNECTION_ID: TransportParameterId = 0x0f;
pub const TP_RETRY_SOURCE_CONNECTION_ID: TransportParameterId = 0x10;

/// Smallest permitted max_udp_payload_size
pub const MIN_UDP_PAYLOAD_SIZE: VarInt = 1200;

pub const DEFAULT_MAX_IDLE_TIMEOUT_MS: VarInt = 30_000;

fn param_error(reason: &str) -> Error {
    Error::Transport(ConnectionError::transport(
        TransportErrorCode::TransportParameterError,
        FRAME_TYPE_CRYPTO,
        reason,
    ))
}

/// The parameters one endpoint announces.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportParameters {
    /// Server only: DCID of the client's first Initial
    pub original_destination_connection_id: Option<ConnectionId>,
    pub initial_source_connection_id: Option<ConnectionId>,
    /// Server only, after sending a Retry
    pub retry_source_connection_id: Option<ConnectionId>,
    /// Milliseconds; zero or absent disables the idle timeout
    pub max_idle_timeout: Option<VarInt>,
    pub max_udp_payload_size: Option<VarInt>,
    /// Connection-level credit; absent means zero
    pub initial_max_data: Option<VarInt>,
    /// Credit on bidirectional streams the announcing endpoint opened
    pub initial_max_stream_data_bidi_local: Option<VarInt>,
    /// Credit on bidirectional streams the receiving endpoint opens
    pub initial_max_stream_data_bidi_remote: Option<VarInt>,
    pub initial_max_stream_data_uni: Option<VarInt>,
}

impl TransportParameters {
    /// Append the TLV encoding to `buf`.
    pub fn encode(&self, buf: &mut BytesMut) {
        let cids = [
            (TP_ORIGINAL_DESTINATION_CONNECTION_ID, &self.original_destination_connection_id),
            (TP_INITIAL_SOURCE_CONNECTION_ID, &self.initial_source_connection_id),
            (TP_RETRY_SOURCE_CONNECTION_ID, &self.retry_source_connection_id),
        ];
        for (id, cid) in cids {
            if let Some(cid) = cid {
                VarIntCodec::put(buf, id);
                VarIntCodec::put(buf, cid.len() as u64);
                buf.put_slice(cid.as_bytes());
            }
        }
        let ints = [
            (TP_MAX_IDLE_TIMEOUT, self.max_idle_timeout),
            (TP_MAX_UDP_PAYLOAD_SIZE, self.max_udp_payload_size),
            (TP_INITIAL_MAX_DATA, self.initial_max_data),
            (TP_INITIAL_MAX_STREAM_DATA_BIDI_LOCAL, self.initial_max_stream_data_bidi_local),
            (TP_INITIAL_MAX_STREAM_DATA_BIDI_REMOTE, self.initial_max_stream_data_bidi_remote),
            (TP_INITIAL_MAX_STREAM_DATA_UNI, self.initial_max_stream_data_uni),
        ];
        for (id, value) in ints {
            if let Some(value) = value {
                VarIntCodec::put(buf, id);
                VarIntCodec::put(buf, VarIntCodec::size(value).unwrap_or(8) as u64);
                VarIntCodec::put(buf, value);
            }
        }
    }

    /// Decode a parameter block. Duplicate parameters and malformed
    /// values are TRANSPORT_PARAMETER_ERROR.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut params = Self::default();
        let mut seen = Vec::new();
        let mut r = ByteReader::new(buf);
        while !r.is_empty() {
            let id = r.varint().ok_or_else(|| param_error("truncated parameter id"))?;
            let len = r.varint().ok_or_else(|| param_error("truncated parameter length"))?;
            let len = usize::try_from(len).map_err(|_| param_error("parameter too long"))?;
            let value = r.bytes(len).ok_or_else(|| param_error("truncated parameter value"))?;
            if seen.contains(&id) {
                return Err(param_error("duplicate transport parameter"));
            }
            seen.push(id);

            match id {
                TP_ORIGINAL_DESTINATION_CONNECTION_ID => {
                    params.original_destination_connection_id = Some(decode_cid(value)?);
                }
                TP_INITIAL_SOURCE_CONNECTION_ID => {
                    params.initial_source_connection_id = Some(decode_cid(value)?);
                }
                TP_RETRY_SOURCE_CONNECTION_ID => {
                    params.retry_source_connection_id = Some(decode_cid(value)?);
                }
                TP_MAX_IDLE_TIMEOUT => params.max_idle_timeout = Some(decode_int(value)?),
                TP_MAX_UDP_PAYLOAD_SIZE => params.max_udp_payload_size = Some(decode_int(value)?),
                TP_INITIAL_MAX_DATA => params.initial_max_data = Some(decode_int(value)?),
                TP_INITIAL_MAX_STREAM_DATA_BIDI_LOCAL => {
                    params.initial_max_stream_data_bidi_local = Some(decode_int(value)?);
                }
                TP_INITIAL_MAX_STREAM_DATA_BIDI_REMOTE => {
                    params.initial_max_stream_data_bidi_remote = Some(decode_int(value)?);
                }
                TP_INITIAL_MAX_STREAM_DATA_UNI => params.initial_max_stream_data_uni = Some(decode_int(value)?),
                _ => {}
            }
        }
        params.validate()?;
        Ok(params)
    }

    /// Range checks from RFC 9000 Section 18.2.
    pub fn validate(&self) -> Result<()> {
        if self.max_udp_payload_size.is_some_and(|size| size < MIN_UDP_PAYLOAD_SIZE) {
            return Err(param_error("max_udp_payload_size below 1200"));
        }
        Ok(())
    }

    /// Client-side authentication of the server's connection IDs
    /// (RFC 9000 Section 7.3).
    ///
    /// `original_dcid` is the DCID of the client's very first Initial,
    /// `server_scid` the SCID the server used in its packets, and
    /// `retry_scid` the SCID of the Retry the client accepted, if any.
    pub fn validate_server_cids(
        &self,
        original_dcid: &ConnectionId,
        server_scid: &ConnectionId,
        retry_scid: Option<&ConnectionId>,
    ) -> Result<()> {
        if self.original_destination_connection_id.as_ref() != Some(original_dcid) {
            return Err(param_error("original_destination_connection_id mismatch"));
        }
        if self.initial_source_connection_id.as_ref() != Some(server_scid) {
            return Err(param_error("initial_source_connection_id mismatch"));
        }
        if self.retry_source_connection_id.as_ref() != retry_scid {
            return Err(param_error("retry_source_connection_id mismatch"));
        }
        Ok(())
    }

    /// Server-side check of the client's initial_source_connection_id.
    pub fn validate_client_cids(&self, client_scid: &ConnectionId) -> Result<()> {
        if self.initial_source_connection_id.as_ref() != Some(client_scid) {
            return Err(param_error("initial_source_connection_id mismatch"));
        }
        if self.original_destination_connection_id.is_some() || self.retry_source_connection_id.is_some() {
            return Err(param_error("server-only parameter sent by client"));
        }
        Ok(())
    }
}

fn decode_cid(value: &[u8]) -> Result<ConnectionId> {
    ConnectionId::from_slice(value).ok_or_else(|| param_error("connection id too long"))
}

fn decode_int(value: &[u8]) -> Result<VarInt> {
    match VarIntCodec::decode(value) {
        Some((v, used)) if used == value.len() => Ok(v),
        _ => Err(param_error("malformed integer parameter")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cid(bytes: &[u8]) -> ConnectionId {
        ConnectionId::from_slice(bytes).unwrap()
    }

    fn server_params() -> TransportParameters {
        TransportParameters {
            original_destination_connection_id: Some(cid(&[1; 8])),
            initial_source_connection_id: Some(cid(&[2; 8])),
            retry_source_connection_id: None,
            max_idle_timeout: Some(DEFAULT_MAX_IDLE_TIMEOUT_MS),
            max_udp_payload_size: Some(1452),
            initial_max_data: Some(16 << 20),
            initial_max_stream_data_bidi_local: Some(1 << 20),
            initial_max_stream_data_bidi_remote: Some(1 << 20),
            initial_max_stream_data_uni: Some(1 << 20),
        }
    }

    #[test]
    fn decode_encoded_block() {
        let params = server_params();
        let mut buf = BytesMut::new();
        params.encode(&mut buf);
        assert_eq!(TransportParameters::decode(&buf).unwrap(), params);
    }

    #[test]
    fn unknown_parameters_are_skipped() {
        let mut buf = BytesMut::new();
        buf.put_slice(&[0x40, 0x21, 2, 0xaa, 0xbb]);
        server_params().encode(&mut buf);
        assert_eq!(TransportParameters::decode(&buf).unwrap(), server_params());
    }

    #[test]
    fn duplicates_and_truncation_are_rejected() {
        let mut buf = BytesMut::new();
        server_params().encode(&mut buf);
        server_params().encode(&mut buf);
        assert!(TransportParameters::decode(&buf).is_err());
        assert!(TransportParameters::decode(&[0x00, 0x08, 1, 2]).is_err());
    }

    #[test]
    fn small_udp_payload_is_invalid() {
        let params = TransportParameters {
            max_udp_payload_size: Some(1000),
            ..Default::default()
        };
        let mut buf = BytesMut::new();
        params.encode(&mut buf);
        let err = TransportParameters::decode(&buf).unwrap_err();
        match err {
            Error::Transport(e) => assert_eq!(e.error_code, TransportErrorCode::TransportParameterError.code()),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn server_cid_authentication() {
        let params = server_params();
        params.validate_server_cids(&cid(&[1; 8]), &cid(&[2; 8]), None).unwrap();
        assert!(params.validate_server_cids(&cid(&[9; 8]), &cid(&[2; 8]), None).is_err());
        assert!(params
            .validate_server_cids(&cid(&[1; 8]), &cid(&[2; 8]), Some(&cid(&[3; 8])))
            .is_err());
    }

    #[test]
    fn client_must_not_send_server_parameters() {
        let params = TransportParameters {
            initial_source_connection_id: Some(cid(&[4; 8])),
            ..Default::default()
        };
        params.validate_client_cids(&cid(&[4; 8])).unwrap();
        assert!(server_params().validate_client_cids(&cid(&[2; 8])).is_err());
    }
}
