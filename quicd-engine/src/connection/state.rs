//! # Connection State Machine (RFC 9000 Section 5, 10, 12, 17)
//!
//! Pure state machine: accepts datagrams through [`Connection::handle_datagram`]
//! and hands datagrams back from [`Connection::poll_transmit`]. It owns the
//! three packet spaces, the stream table and the handshake adapter; nothing
//! here performs I/O.
//!
//! Inbound, each coalesced packet is parsed, unprotected with its epoch's
//! keys and its frames dispatched. Anything that fails to parse or
//! authenticate is dropped and counted; it never reaches the peer as an
//! error. Outbound, every epoch with pending work contributes one packet
//! to a single datagram, in Initial, Handshake, 1-RTT order.

#![forbid(unsafe_code)]

use super::handshake::{handshake_error, HandshakeAdapter};
use crate::config::{ConnectionConfig, ServerIdentity, MIN_INITIAL_DATAGRAM_SIZE};
use crate::crypto::{CryptoContext, KeyLog, TAG_LEN};
use crate::error::{ConnectionError, Error, Result, TransportErrorCode};
use crate::frames::{
    crypto_frame_overhead, DefaultFrameParser, DefaultFrameSerializer, Frame, FrameParser, FrameSerializer,
    FRAME_TYPE_CRYPTO,
};
use crate::packet::number;
use crate::packet::{
    encode_retry, encode_version_negotiation, open_packet, seal_packet, verify_integrity, write_long_header,
    write_short_header, AckState, DefaultHeaderParser, Header, LongHeader, LongPacketType, OpenedPacket,
    PacketParser, PacketSpace, RetryTokenKey,
};
use crate::stream::{InsertError, PeerLimits, StreamManager};
use crate::tls::{RustlsSession, TlsSession};
use crate::transport::TransportParameters;
use crate::types::{ConnectionId, Epoch, PacketNumber, Side, StreamDirection, StreamId, VarIntCodec};
use crate::version::{select_version, Version};
use bytes::{BufMut, Bytes, BytesMut};
use std::collections::VecDeque;
use std::task::{Poll, Waker};

/// Length of the random DCID in a client's first Initial (RFC 9000 Section 7.2)
const INITIAL_DCID_LEN: usize = 8;

/// No packet is started in a datagram with less free space than this
const MIN_PACKET_ROOM: usize = 64;

/// Largest packet number encoding, used when sizing headers
const MAX_PN_LEN: usize = 4;

/// Longest MAX_STREAM_DATA encoding: type, stream id and limit
const MAX_CREDIT_FRAME_LEN: usize = 1 + 8 + 8;

// ============================================================================
// Connection State
// ============================================================================

/// Connection lifecycle (RFC 9000 Section 10)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Handshake in progress
    Handshaking,

    /// Handshake complete
    Active,

    /// CONNECTION_CLOSE queued but not yet sent
    Closing,

    /// Terminal; no further input is processed
    Closed,
}

/// Datagram and packet counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionStats {
    pub datagrams_sent: u64,
    pub datagrams_received: u64,
    pub packets_sent: u64,
    pub packets_received: u64,
    /// Packets discarded without effect: undecodable, unauthenticated,
    /// duplicate, or for an epoch without keys
    pub packets_dropped: u64,
}

fn ack_state_for(epoch: Epoch, frame: &Frame<'_>) -> AckState {
    if !frame.is_ack_eliciting() {
        AckState::Idle
    } else if epoch != Epoch::OneRtt {
        AckState::Immediate
    } else {
        match frame {
            Frame::Stream { .. } | Frame::Crypto { .. } | Frame::Ping => AckState::Immediate,
            _ => AckState::Deferred,
        }
    }
}

/// Frames permitted in Initial and Handshake packets (RFC 9000 Section 12.4)
fn allowed_before_one_rtt(frame: &Frame<'_>) -> bool {
    matches!(
        frame,
        Frame::Padding { .. }
            | Frame::Ping
            | Frame::Ack(_)
            | Frame::Crypto { .. }
            | Frame::ConnectionClose { frame_type: Some(_), .. }
    )
}

fn close_frame(epoch: Epoch, err: &ConnectionError) -> Frame<'_> {
    if err.is_application() && epoch != Epoch::OneRtt {
        // RFC 9000 Section 10.2.3: no application close outside 1-RTT
        return Frame::ConnectionClose {
            error_code: TransportErrorCode::ApplicationError.code(),
            frame_type: Some(0),
            reason: &[],
        };
    }
    Frame::ConnectionClose {
        error_code: err.error_code,
        frame_type: err.frame_type,
        reason: err.reason.as_bytes(),
    }
}

/// One QUIC connection, client or server.
pub struct Connection {
    side: Side,
    config: ConnectionConfig,
    identity: Option<ServerIdentity>,
    version: Version,
    state: ConnectionState,

    host_cid: ConnectionId,
    peer_cid: ConnectionId,
    /// DCID of the client's first Initial
    original_dcid: ConnectionId,
    /// Client: SCID of the first server packet
    server_initial_scid: Option<ConnectionId>,
    /// SCID of the Retry in use (sent by a server, accepted by a client)
    retry_scid: Option<ConnectionId>,
    /// Client: token echoed in every Initial after a Retry
    retry_token: Bytes,
    /// Server: present when address validation is required
    retry_key: Option<RetryTokenKey>,
    /// A Retry or Version Negotiation already restarted the attempt
    restarted: bool,
    /// A packet from the peer has been authenticated
    peer_packet_seen: bool,

    spaces: [PacketSpace; 3],
    streams: StreamManager,
    handshake: Option<HandshakeAdapter>,
    /// Held until the handshake adapter exists
    key_log: Option<KeyLog>,
    parser: DefaultHeaderParser,

    handshake_complete: bool,
    handshake_confirmed: bool,
    handshake_done_pending: bool,
    pending_close: Option<ConnectionError>,
    /// Why the connection ended
    error: Option<Error>,

    /// Stateless replies (Version Negotiation, Retry)
    outgoing: VecDeque<Bytes>,
    connect_waiters: Vec<Waker>,
    stats: ConnectionStats,
}

impl Connection {
    /// A client connection. Nothing is sent until [`Connection::connect`].
    pub fn new_client(config: ConnectionConfig) -> Result<Self> {
        let host_cid = ConnectionId::random(config.connection_id_length);
        let peer_cid = ConnectionId::random(INITIAL_DCID_LEN);
        Self::new(Side::Client, config, None, host_cid, peer_cid)
    }

    /// A server connection waiting for a client's first Initial.
    pub fn new_server(config: ConnectionConfig, identity: ServerIdentity) -> Result<Self> {
        let host_cid = ConnectionId::random(config.connection_id_length);
        let mut conn = Self::new(Side::Server, config, Some(identity), host_cid, ConnectionId::empty())?;
        conn.retry_key = conn.config.require_retry.then(RetryTokenKey::random);
        Ok(conn)
    }

    fn new(
        side: Side,
        config: ConnectionConfig,
        identity: Option<ServerIdentity>,
        host_cid: ConnectionId,
        peer_cid: ConnectionId,
    ) -> Result<Self> {
        config.validate().map_err(|errors| Error::Config(errors.join("; ")))?;
        let version = config
            .supported_versions
            .first()
            .copied()
            .ok_or_else(|| Error::Config("supported_versions must not be empty".to_string()))?;
        let parser = DefaultHeaderParser::new(host_cid.len());
        let streams = StreamManager::with_windows(side, config.initial_max_data, config.initial_max_stream_data);
        tracing::debug!(?side, ?version, %host_cid, "connection created");

        Ok(Self {
            side,
            config,
            identity,
            version,
            state: ConnectionState::Handshaking,
            host_cid,
            peer_cid,
            original_dcid: ConnectionId::empty(),
            server_initial_scid: None,
            retry_scid: None,
            retry_token: Bytes::new(),
            retry_key: None,
            restarted: false,
            peer_packet_seen: false,
            spaces: Epoch::ALL.map(PacketSpace::new),
            streams,
            handshake: None,
            key_log: None,
            parser,
            handshake_complete: false,
            handshake_confirmed: false,
            handshake_done_pending: false,
            pending_close: None,
            error: None,
            outgoing: VecDeque::new(),
            connect_waiters: Vec::new(),
            stats: ConnectionStats::default(),
        })
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    pub fn side(&self) -> Side {
        self.side
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn stats(&self) -> ConnectionStats {
        self.stats
    }

    pub fn host_cid(&self) -> &ConnectionId {
        &self.host_cid
    }

    pub fn peer_cid(&self) -> &ConnectionId {
        &self.peer_cid
    }

    pub fn original_dcid(&self) -> &ConnectionId {
        &self.original_dcid
    }

    /// ALPN protocol agreed in the handshake.
    pub fn alpn_protocol(&self) -> Option<&[u8]> {
        self.handshake.as_ref().and_then(HandshakeAdapter::alpn_protocol)
    }

    pub fn is_handshake_complete(&self) -> bool {
        self.handshake_complete
    }

    pub fn is_handshake_confirmed(&self) -> bool {
        self.handshake_confirmed
    }

    /// Why the connection ended, once it has.
    pub fn error(&self) -> Option<&Error> {
        self.error.as_ref()
    }

    /// Key holder of `epoch`, for diagnostics and fault injection.
    pub fn crypto_mut(&mut self, epoch: Epoch) -> &mut CryptoContext {
        &mut self.spaces[epoch.index()].crypto
    }

    /// Record handshake and 1-RTT secrets to `key_log` from now on.
    pub fn set_key_log(&mut self, key_log: KeyLog) {
        match self.handshake.as_mut() {
            Some(handshake) => handshake.set_key_log(key_log),
            None => self.key_log = Some(key_log),
        }
    }

    fn is_open(&self) -> bool {
        matches!(self.state, ConnectionState::Handshaking | ConnectionState::Active)
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    /// Client: derive Initial keys and queue the ClientHello. A server
    /// waits for its peer, so this is a no-op there.
    pub fn connect(&mut self) -> Result<()> {
        if self.side.is_server() || self.handshake.is_some() {
            return Ok(());
        }
        if !self.is_open() {
            return Err(Error::ConnectionClosed);
        }
        self.original_dcid = self.peer_cid.clone();
        let session = self.client_session()?;
        self.spaces[Epoch::Initial.index()]
            .crypto
            .setup_initial(self.version, Side::Client, self.peer_cid.as_bytes())?;

        let mut handshake = HandshakeAdapter::new(Side::Client, session, self.key_log.take());
        let started = handshake.start(&mut self.spaces);
        self.handshake = Some(handshake);
        if let Err(err) = started {
            self.start_close(err);
            return Err(Error::ConnectionClosed);
        }
        tracing::debug!(version = ?self.version, dcid = %self.peer_cid, "client handshake started");
        Ok(())
    }

    /// TLS client session for the current version, checking the server
    /// against `server_name` and offering the configured ALPN protocols.
    fn client_session(&self) -> Result<Box<dyn TlsSession>> {
        let params = self.local_transport_parameters();
        let session = RustlsSession::new_client(&self.config, self.version, params.to_vec())?;
        Ok(Box::new(session))
    }

    /// Close the connection. `frame_type` present makes this a transport
    /// close, otherwise it is an application close. Further calls are
    /// ignored.
    pub fn close(&mut self, error_code: u64, frame_type: Option<u64>, reason: &str) {
        if !self.is_open() {
            return;
        }
        self.error = Some(Error::ConnectionClosed);
        self.start_close(ConnectionError {
            error_code,
            frame_type,
            reason: reason.to_string(),
        });
    }

    /// Highest epoch we can still protect a CONNECTION_CLOSE in. 1-RTT is
    /// only used once the peer is known to hold its keys.
    fn close_epoch(&self) -> Option<Epoch> {
        Epoch::ALL
            .into_iter()
            .rev()
            .filter(|epoch| *epoch != Epoch::OneRtt || self.handshake_complete)
            .find(|epoch| self.spaces[epoch.index()].crypto.can_send())
    }

    fn start_close(&mut self, err: ConnectionError) {
        if !self.is_open() {
            return;
        }
        tracing::info!(
            side = ?self.side,
            error_code = err.error_code,
            frame_type = ?err.frame_type,
            reason = %err.reason,
            "closing connection"
        );
        if self.error.is_none() {
            self.error = Some(Error::Transport(err.clone()));
        }
        if self.close_epoch().is_some() {
            self.pending_close = Some(err);
            self.state = ConnectionState::Closing;
        } else {
            self.state = ConnectionState::Closed;
        }
        self.streams.on_connection_closed();
        self.wake_connect_waiters();
    }

    fn enter_closed(&mut self) {
        self.state = ConnectionState::Closed;
        self.pending_close = None;
        self.streams.on_connection_closed();
        self.wake_connect_waiters();
    }

    fn wake_connect_waiters(&mut self) {
        for waker in self.connect_waiters.drain(..) {
            waker.wake();
        }
    }

    /// Resolves once the handshake completes, or fails once the connection
    /// ends without completing it.
    pub fn poll_connected(&mut self, waker: &Waker) -> Poll<Result<()>> {
        if self.handshake_complete {
            return Poll::Ready(Ok(()));
        }
        if !self.is_open() {
            return Poll::Ready(Err(self.error.clone().unwrap_or(Error::ConnectionClosed)));
        }
        if !self.connect_waiters.iter().any(|w| w.will_wake(waker)) {
            self.connect_waiters.push(waker.clone());
        }
        Poll::Pending
    }

    fn local_transport_parameters(&self) -> Bytes {
        let server = self.side.is_server();
        let params = TransportParameters {
            original_destination_connection_id: server.then(|| self.original_dcid.clone()),
            initial_source_connection_id: Some(self.host_cid.clone()),
            retry_source_connection_id: if server { self.retry_scid.clone() } else { None },
            max_idle_timeout: Some(self.config.max_idle_timeout_ms),
            max_udp_payload_size: Some(self.config.max_datagram_size as u64),
            initial_max_data: Some(self.streams.local_max_data()),
            initial_max_stream_data_bidi_local: Some(self.streams.local_stream_window()),
            initial_max_stream_data_bidi_remote: Some(self.streams.local_stream_window()),
            initial_max_stream_data_uni: Some(self.streams.local_stream_window()),
        };
        let mut buf = BytesMut::new();
        params.encode(&mut buf);
        buf.freeze()
    }

    fn validate_peer_parameters(&self) -> Result<TransportParameters> {
        let missing = || {
            Error::Transport(ConnectionError::transport(
                TransportErrorCode::TransportParameterError,
                FRAME_TYPE_CRYPTO,
                "missing transport parameters",
            ))
        };
        let raw = self
            .handshake
            .as_ref()
            .and_then(HandshakeAdapter::peer_transport_parameters)
            .ok_or_else(missing)?;
        let params = TransportParameters::decode(raw)?;
        match self.side {
            Side::Client => {
                let server_scid = self.server_initial_scid.as_ref().ok_or_else(missing)?;
                params.validate_server_cids(&self.original_dcid, server_scid, self.retry_scid.as_ref())?;
            }
            Side::Server => params.validate_client_cids(&self.peer_cid)?,
        }
        Ok(params)
    }

    fn on_handshake_complete(&mut self) -> std::result::Result<(), ConnectionError> {
        if self.handshake_complete {
            return Ok(());
        }
        let params = self.validate_peer_parameters().map_err(handshake_error)?;
        let credit = |limit: Option<u64>| limit.unwrap_or(0);
        self.streams.set_peer_limits(PeerLimits {
            max_data: credit(params.initial_max_data),
            stream_bidi_local: credit(params.initial_max_stream_data_bidi_local),
            stream_bidi_remote: credit(params.initial_max_stream_data_bidi_remote),
            stream_uni: credit(params.initial_max_stream_data_uni),
        });
        self.handshake_complete = true;
        self.state = ConnectionState::Active;
        let alpn = self.handshake.as_ref().and_then(HandshakeAdapter::alpn_protocol);
        tracing::info!(
            side = ?self.side,
            version = ?self.version,
            alpn = ?alpn.map(String::from_utf8_lossy),
            "handshake complete"
        );
        if self.side.is_server() {
            self.handshake_done_pending = true;
            self.on_handshake_confirmed();
        }
        self.wake_connect_waiters();
        Ok(())
    }

    /// RFC 9001 Section 4.9.2: Handshake send keys are no longer needed.
    fn on_handshake_confirmed(&mut self) {
        if self.handshake_confirmed {
            return;
        }
        self.handshake_confirmed = true;
        self.spaces[Epoch::Handshake.index()].crypto.discard_send();
        tracing::debug!(side = ?self.side, "handshake confirmed");
    }

    fn discard_keys(&mut self, epoch: Epoch) {
        let space = &mut self.spaces[epoch.index()];
        space.crypto.discard();
        space.ack = AckState::Idle;
        tracing::debug!(%epoch, "discarded keys");
    }

    // ------------------------------------------------------------------------
    // Receive path
    // ------------------------------------------------------------------------

    /// Process one received datagram. Never fails: bad packets are dropped,
    /// protocol violations close the connection.
    pub fn handle_datagram(&mut self, datagram: &[u8]) {
        if !self.is_open() {
            tracing::trace!(len = datagram.len(), "ignoring datagram on closed connection");
            return;
        }
        self.stats.datagrams_received += 1;

        let parser = self.parser;
        let mut offset = 0;
        while offset < datagram.len() && self.is_open() {
            let remaining = &datagram[offset..];
            let parsed = match parser.parse_packet(remaining) {
                Ok(parsed) => parsed,
                Err(err) => {
                    tracing::debug!(%err, offset, "dropping rest of datagram");
                    self.stats.packets_dropped += 1;
                    break;
                }
            };
            offset += parsed.packet_len;
            self.handle_packet(parsed.header, &remaining[..parsed.packet_len], datagram.len());
        }
    }

    fn drop_packet(&mut self, reason: &'static str) {
        tracing::debug!(reason, "dropping packet");
        self.stats.packets_dropped += 1;
    }

    fn handle_packet(&mut self, header: Header<'_>, packet: &[u8], datagram_len: usize) {
        match header {
            Header::VersionNegotiation { dcid, scid, versions } => self.on_version_negotiation(dcid, scid, &versions),
            Header::Retry {
                version,
                dcid,
                scid,
                token,
                ..
            } => self.on_retry(version, dcid, scid, token, packet),
            Header::UnsupportedVersion { version, dcid, scid } => {
                self.on_unsupported_version(version, dcid, scid, datagram_len)
            }
            Header::Long(header) => self.on_long_packet(&header, packet, datagram_len),
            Header::Short(header) => {
                if header.dcid != self.host_cid.as_bytes() {
                    return self.drop_packet("unknown destination connection id");
                }
                if let Some(opened) = self.open(Epoch::OneRtt, packet, header.pn_offset) {
                    self.on_packet(Epoch::OneRtt, opened);
                }
            }
        }
    }

    fn on_long_packet(&mut self, header: &LongHeader<'_>, packet: &[u8], datagram_len: usize) {
        let epoch = match header.packet_type {
            LongPacketType::Initial => Epoch::Initial,
            LongPacketType::Handshake => Epoch::Handshake,
            LongPacketType::ZeroRtt | LongPacketType::Retry => return self.drop_packet("0-RTT is not supported"),
        };

        if self.side.is_server() && self.handshake.is_none() {
            if epoch != Epoch::Initial {
                return self.drop_packet("no connection state for packet");
            }
            if !self.config.supported_versions.contains(&header.version) {
                return self.on_unsupported_version(header.version.wire(), header.dcid, header.scid, datagram_len);
            }
            if !self.accept_initial(header, datagram_len) {
                return self.drop_packet("client Initial not accepted");
            }
        }
        if header.version != self.version {
            return self.drop_packet("version mismatch");
        }

        let Some(opened) = self.open(epoch, packet, header.pn_offset) else {
            return;
        };
        if self.side.is_client() && self.server_initial_scid.is_none() {
            if let Some(scid) = ConnectionId::from_slice(header.scid) {
                tracing::debug!(%scid, "adopting server connection id");
                self.peer_cid = scid.clone();
                self.server_initial_scid = Some(scid);
            }
        }
        self.on_packet(epoch, opened);
    }

    /// Remove packet protection. Failures are silent drops.
    fn open(&mut self, epoch: Epoch, packet: &[u8], pn_offset: usize) -> Option<OpenedPacket> {
        let space = &self.spaces[epoch.index()];
        let opened = space
            .crypto
            .opener()
            .and_then(|key| open_packet(key, packet, pn_offset, space.received.largest()));
        match opened {
            Ok(opened) if space.received.contains(opened.packet_number) => {
                tracing::trace!(%epoch, pn = opened.packet_number, "duplicate packet");
                self.stats.packets_dropped += 1;
                None
            }
            Ok(opened) => Some(opened),
            Err(err) => {
                tracing::debug!(%epoch, %err, "dropping unprotectable packet");
                self.stats.packets_dropped += 1;
                None
            }
        }
    }

    fn on_packet(&mut self, epoch: Epoch, opened: OpenedPacket) {
        let parser = DefaultFrameParser;
        let frames = match parser.iter_frames(&opened.payload).collect::<Result<Vec<_>>>() {
            Ok(frames) if !frames.is_empty() => frames,
            Ok(_) => return self.drop_packet("packet without frames"),
            Err(err) => {
                tracing::debug!(%epoch, %err, "dropping packet with undecodable frames");
                self.stats.packets_dropped += 1;
                return;
            }
        };

        let ack = frames
            .iter()
            .map(|frame| ack_state_for(epoch, frame))
            .max()
            .unwrap_or(AckState::Idle);
        self.spaces[epoch.index()].on_packet_received(opened.packet_number, ack);
        self.stats.packets_received += 1;
        self.peer_packet_seen = true;
        tracing::trace!(%epoch, pn = opened.packet_number, frames = frames.len(), "packet received");

        // RFC 9001 Section 4.9.1: a server is done with Initial keys once
        // the client speaks in Handshake packets
        if epoch == Epoch::Handshake && self.side.is_server() && self.spaces[Epoch::Initial.index()].crypto.can_receive() {
            self.discard_keys(Epoch::Initial);
        }

        for frame in frames {
            if let Err(err) = self.on_frame(epoch, frame) {
                self.start_close(err);
            }
            if !self.is_open() {
                break;
            }
        }
    }

    fn on_frame(&mut self, epoch: Epoch, frame: Frame<'_>) -> std::result::Result<(), ConnectionError> {
        let frame_type = frame.frame_type();
        if epoch != Epoch::OneRtt && !allowed_before_one_rtt(&frame) {
            return Err(ConnectionError::transport(
                TransportErrorCode::ProtocolViolation,
                frame_type,
                "frame not allowed in this packet type",
            ));
        }
        match frame {
            Frame::Padding { .. } | Frame::Ping => {}
            Frame::Ack(ack) => self.spaces[epoch.index()].on_ack_received(&ack),
            Frame::Crypto { offset, data } => self.on_crypto_frame(epoch, offset, data)?,
            Frame::Stream {
                stream_id,
                offset,
                data,
                fin,
            } => self.streams.on_stream_frame(stream_id, offset, data, fin, frame_type)?,
            Frame::MaxData(maximum) => self.streams.on_max_data(maximum),
            Frame::MaxStreamData { stream_id, maximum } => {
                self.streams.on_max_stream_data(stream_id, maximum, frame_type)?;
            }
            Frame::ConnectionClose {
                error_code,
                frame_type,
                reason,
            } => self.on_peer_close(ConnectionError {
                error_code,
                frame_type,
                reason: String::from_utf8_lossy(reason).into_owned(),
            }),
            Frame::HandshakeDone => {
                if self.side.is_server() {
                    return Err(ConnectionError::transport(
                        TransportErrorCode::ProtocolViolation,
                        frame_type,
                        "HANDSHAKE_DONE from a client",
                    ));
                }
                self.on_handshake_confirmed();
            }
        }
        Ok(())
    }

    fn on_crypto_frame(&mut self, epoch: Epoch, offset: u64, data: &[u8]) -> std::result::Result<(), ConnectionError> {
        let recv = &mut self.spaces[epoch.index()].crypto_stream.recv;
        if let Err(err) = recv.insert(offset, data, false) {
            let (code, reason) = match err {
                InsertError::LimitExceeded => (
                    TransportErrorCode::CryptoBufferExceeded,
                    "CRYPTO data beyond the reassembly window",
                ),
                InsertError::FinalSize => (TransportErrorCode::ProtocolViolation, "CRYPTO stream ended"),
            };
            return Err(ConnectionError::transport(code, FRAME_TYPE_CRYPTO, reason));
        }
        let Some(handshake) = self.handshake.as_mut() else {
            return Ok(());
        };
        if handshake.on_crypto_data(epoch, &mut self.spaces)? {
            self.on_handshake_complete()?;
        }
        Ok(())
    }

    fn on_peer_close(&mut self, err: ConnectionError) {
        tracing::info!(
            side = ?self.side,
            error_code = err.error_code,
            frame_type = ?err.frame_type,
            reason = %err.reason,
            "connection closed by peer"
        );
        self.error = Some(Error::Transport(err));
        self.enter_closed();
    }

    // ------------------------------------------------------------------------
    // Retry and Version Negotiation
    // ------------------------------------------------------------------------

    fn on_version_negotiation(&mut self, dcid: &[u8], scid: &[u8], versions: &[u32]) {
        if self.side.is_server() {
            return self.drop_packet("version negotiation sent to a server");
        }
        if self.restarted || self.peer_packet_seen {
            return self.drop_packet("late version negotiation");
        }
        if dcid != self.host_cid.as_bytes() || scid != self.peer_cid.as_bytes() {
            return self.drop_packet("version negotiation for other connection ids");
        }
        if versions.contains(&self.version.wire()) {
            return self.drop_packet("version negotiation lists the current version");
        }

        let Some(version) = select_version(&self.config.supported_versions, versions) else {
            tracing::info!(offered = ?versions, "no common version");
            self.error = Some(Error::VersionNegotiationFailed);
            self.enter_closed();
            return;
        };
        let initial = &mut self.spaces[Epoch::Initial.index()];
        initial.reset();
        if let Err(err) = initial.crypto.setup_initial(version, Side::Client, self.peer_cid.as_bytes()) {
            tracing::warn!(%err, "failed to derive Initial keys");
            return;
        }
        self.version = version;
        self.restarted = true;
        tracing::info!(?version, "restarting after version negotiation");

        // The ClientHello is rebuilt for the new version
        let session = match self.client_session() {
            Ok(session) => session,
            Err(err) => {
                tracing::warn!(%err, "failed to restart the handshake");
                self.error = Some(err);
                self.enter_closed();
                return;
            }
        };
        let Some(handshake) = self.handshake.as_mut() else {
            return;
        };
        handshake.replace_session(session);
        if let Err(err) = handshake.start(&mut self.spaces) {
            self.start_close(err);
        }
    }

    fn on_retry(&mut self, version: Version, dcid: &[u8], scid: &[u8], token: &[u8], packet: &[u8]) {
        if self.side.is_server() {
            return self.drop_packet("retry sent to a server");
        }
        if self.restarted || self.peer_packet_seen {
            return self.drop_packet("late retry");
        }
        if version != self.version
            || dcid != self.host_cid.as_bytes()
            || scid == self.original_dcid.as_bytes()
            || token.is_empty()
        {
            return self.drop_packet("invalid retry");
        }
        if !verify_integrity(version, self.original_dcid.as_bytes(), packet) {
            return self.drop_packet("retry integrity tag mismatch");
        }
        let Some(new_dcid) = ConnectionId::from_slice(scid) else {
            return self.drop_packet("invalid retry");
        };

        let initial = &mut self.spaces[Epoch::Initial.index()];
        if let Err(err) = initial.crypto.setup_initial(version, Side::Client, scid) {
            tracing::warn!(%err, "failed to derive Initial keys");
            return;
        }
        // Packet numbers continue; the ClientHello goes out again
        initial.crypto_stream.rewind();
        tracing::info!(scid = %new_dcid, token_len = token.len(), "accepted retry");
        self.peer_cid = new_dcid.clone();
        self.retry_scid = Some(new_dcid);
        self.retry_token = Bytes::copy_from_slice(token);
        self.restarted = true;
    }

    fn on_unsupported_version(&mut self, version: u32, dcid: &[u8], scid: &[u8], datagram_len: usize) {
        if self.side.is_client() || self.handshake.is_some() {
            return self.drop_packet("unsupported version");
        }
        // RFC 9000 Section 6.1: only answer datagrams that could carry an Initial
        if datagram_len < MIN_INITIAL_DATAGRAM_SIZE {
            return self.drop_packet("unsupported version in a short datagram");
        }
        let versions: Vec<u32> = self.config.supported_versions.iter().map(|v| v.wire()).collect();
        tracing::debug!(version = format_args!("{version:#010x}"), "sending version negotiation");
        self.outgoing.push_back(encode_version_negotiation(dcid, scid, &versions));
    }

    /// Server: set up state from a client's first Initial. Returns false if
    /// the packet does not start a connection.
    fn accept_initial(&mut self, header: &LongHeader<'_>, datagram_len: usize) -> bool {
        if datagram_len < MIN_INITIAL_DATAGRAM_SIZE {
            tracing::debug!(datagram_len, "client Initial in a short datagram");
            return false;
        }
        let (Some(dcid), Some(scid)) = (ConnectionId::from_slice(header.dcid), ConnectionId::from_slice(header.scid))
        else {
            return false;
        };

        let original_dcid = if self.retry_key.is_none() {
            if dcid.len() < INITIAL_DCID_LEN {
                return false;
            }
            dcid.clone()
        } else if header.token.is_empty() {
            self.send_retry(header.version, &dcid, &scid);
            return false;
        } else {
            let odcid = self
                .retry_key
                .as_ref()
                .filter(|_| dcid == self.host_cid)
                .and_then(|key| key.validate(header.token, header.dcid));
            let Some(odcid) = odcid else {
                tracing::debug!("invalid address validation token");
                return false;
            };
            self.retry_scid = Some(self.host_cid.clone());
            odcid
        };

        if self.identity.is_none() {
            return false;
        }
        if let Err(err) = self.spaces[Epoch::Initial.index()]
            .crypto
            .setup_initial(header.version, Side::Server, header.dcid)
        {
            tracing::warn!(%err, "failed to derive Initial keys");
            return false;
        }
        self.version = header.version;
        self.peer_cid = scid;
        self.original_dcid = original_dcid;

        let params = self.local_transport_parameters().to_vec();
        let session = self
            .identity
            .as_ref()
            .map(|identity| RustlsSession::new_server(&self.config, identity, self.version, params));
        let session = match session {
            Some(Ok(session)) => session,
            Some(Err(err)) => {
                tracing::warn!(%err, "failed to set up the TLS server");
                return false;
            }
            None => return false,
        };
        let mut handshake = HandshakeAdapter::new(Side::Server, Box::new(session), self.key_log.take());
        if let Err(err) = handshake.start(&mut self.spaces) {
            tracing::warn!(?err, "failed to start server handshake");
            return false;
        }
        self.handshake = Some(handshake);
        tracing::debug!(
            version = ?self.version,
            odcid = %self.original_dcid,
            peer = %self.peer_cid,
            "accepted client Initial"
        );
        true
    }

    fn send_retry(&mut self, version: Version, odcid: &ConnectionId, client_scid: &ConnectionId) {
        let Some(key) = self.retry_key.as_ref() else {
            return;
        };
        let retry = key
            .mint(odcid, &self.host_cid)
            .and_then(|token| encode_retry(version, client_scid, &self.host_cid, odcid, &token));
        match retry {
            Ok(packet) => {
                tracing::debug!(%odcid, scid = %self.host_cid, "sending retry");
                self.outgoing.push_back(packet);
            }
            Err(err) => tracing::warn!(%err, "failed to build retry"),
        }
    }

    // ------------------------------------------------------------------------
    // Streams
    // ------------------------------------------------------------------------

    pub fn open_stream(&mut self, direction: StreamDirection) -> Result<StreamId> {
        self.streams.open(direction)
    }

    pub fn has_stream(&self, id: StreamId) -> bool {
        self.streams.contains(id)
    }

    pub fn stream_write(&mut self, id: StreamId, data: &[u8]) -> Result<()> {
        self.streams.write(id, data)
    }

    pub fn stream_finish(&mut self, id: StreamId) -> Result<()> {
        self.streams.finish(id)
    }

    pub fn poll_stream_read(&mut self, id: StreamId, max: Option<usize>, waker: &Waker) -> Poll<Result<Bytes>> {
        self.streams.poll_read(id, max, waker)
    }

    pub fn poll_accept(&mut self, waker: &Waker) -> Poll<Result<StreamId>> {
        self.streams.poll_accept(waker)
    }

    // ------------------------------------------------------------------------
    // Send path
    // ------------------------------------------------------------------------

    /// Next datagram to send, if any.
    pub fn poll_transmit(&mut self) -> Option<Bytes> {
        let datagram = match self.outgoing.pop_front() {
            Some(datagram) => Some(datagram),
            None => match self.state {
                ConnectionState::Closed => None,
                ConnectionState::Closing => self.transmit_close(),
                ConnectionState::Handshaking | ConnectionState::Active => self.transmit(),
            },
        };
        if let Some(datagram) = &datagram {
            self.stats.datagrams_sent += 1;
            tracing::trace!(len = datagram.len(), "datagram ready");
        }
        datagram
    }

    fn transmit(&mut self) -> Option<Bytes> {
        match self.build_datagram(None) {
            Ok(datagram) => datagram,
            Err(err) => {
                tracing::warn!(%err, "failed to build datagram");
                self.start_close(ConnectionError::transport(
                    TransportErrorCode::InternalError,
                    0,
                    err.to_string(),
                ));
                None
            }
        }
    }

    /// Send the queued CONNECTION_CLOSE once, then go quiet.
    fn transmit_close(&mut self) -> Option<Bytes> {
        self.state = ConnectionState::Closed;
        let err = self.pending_close.take()?;
        match self.build_datagram(Some(&err)) {
            Ok(datagram) => datagram,
            Err(err) => {
                tracing::warn!(%err, "failed to build CONNECTION_CLOSE");
                None
            }
        }
    }

    fn has_ack_eliciting(&self, epoch: Epoch) -> bool {
        self.spaces[epoch.index()].has_crypto_pending()
            || (epoch == Epoch::OneRtt
                && self.handshake_complete
                && (self.handshake_done_pending
                    || self.streams.has_pending_send()
                    || self.streams.has_pending_window_update()))
    }

    fn has_pending(&self, epoch: Epoch) -> bool {
        let space = &self.spaces[epoch.index()];
        space.crypto.can_send() && (space.ack == AckState::Immediate || self.has_ack_eliciting(epoch))
    }

    fn build_datagram(&mut self, close: Option<&ConnectionError>) -> Result<Option<Bytes>> {
        let epochs: Vec<Epoch> = match close {
            Some(_) => self.close_epoch().into_iter().collect(),
            None => Epoch::ALL.into_iter().filter(|epoch| self.has_pending(*epoch)).collect(),
        };
        let Some(&last) = epochs.last() else {
            return Ok(None);
        };
        // RFC 9000 Section 14.1: Initial datagrams from clients, and
        // ack-eliciting ones from servers, are padded to 1200 bytes
        let pad = epochs.contains(&Epoch::Initial)
            && (self.side.is_client() || (close.is_none() && self.has_ack_eliciting(Epoch::Initial)));

        let mut datagram = BytesMut::with_capacity(self.config.max_datagram_size);
        let mut sent_handshake = false;
        for epoch in epochs {
            let pad_to = (pad && epoch == last).then_some(MIN_INITIAL_DATAGRAM_SIZE);
            if self.build_packet(epoch, &mut datagram, close, pad_to)? {
                sent_handshake |= epoch == Epoch::Handshake;
            }
        }

        // RFC 9001 Section 4.9.1: a client is done with Initial keys once
        // it sends in Handshake packets
        if sent_handshake && self.side.is_client() && self.spaces[Epoch::Initial.index()].crypto.can_send() {
            self.discard_keys(Epoch::Initial);
        }
        Ok((!datagram.is_empty()).then(|| datagram.freeze()))
    }

    /// Header size with the longest packet number encoding.
    fn max_header_len(&self, epoch: Epoch) -> usize {
        match epoch {
            Epoch::OneRtt => 1 + self.peer_cid.len() + MAX_PN_LEN,
            Epoch::Initial | Epoch::Handshake => {
                let token = if epoch == Epoch::Initial {
                    VarIntCodec::size(self.retry_token.len() as u64).unwrap_or(8) + self.retry_token.len()
                } else {
                    0
                };
                1 + 4 + 1 + self.peer_cid.len() + 1 + self.host_cid.len() + token + 2 + MAX_PN_LEN
            }
        }
    }

    fn write_header(
        &self,
        epoch: Epoch,
        pn: PacketNumber,
        pn_len: usize,
        payload_len: usize,
    ) -> Result<(BytesMut, usize)> {
        let mut header = BytesMut::with_capacity(self.max_header_len(epoch));
        let pn_offset = match epoch {
            Epoch::OneRtt => write_short_header(&mut header, &self.peer_cid, pn, pn_len),
            Epoch::Initial | Epoch::Handshake => {
                let (packet_type, token) = if epoch == Epoch::Initial {
                    (LongPacketType::Initial, &self.retry_token[..])
                } else {
                    (LongPacketType::Handshake, &[][..])
                };
                write_long_header(
                    &mut header,
                    self.version,
                    packet_type,
                    &self.peer_cid,
                    &self.host_cid,
                    token,
                    pn,
                    pn_len,
                    payload_len + TAG_LEN,
                )?
            }
        };
        Ok((header, pn_offset))
    }

    fn build_payload(&mut self, epoch: Epoch, room: usize, close: Option<&ConnectionError>) -> Result<BytesMut> {
        let serializer = DefaultFrameSerializer;
        let mut payload = BytesMut::with_capacity(room);
        if let Some(err) = close {
            serializer.serialize_frame(&close_frame(epoch, err), &mut payload)?;
            return Ok(payload);
        }

        let space = &mut self.spaces[epoch.index()];
        if let Some(ack) = space.take_ack() {
            serializer.serialize_frame(&Frame::Ack(ack), &mut payload)?;
        }
        if epoch == Epoch::OneRtt && self.handshake_done_pending {
            serializer.serialize_frame(&Frame::HandshakeDone, &mut payload)?;
            self.handshake_done_pending = false;
        }
        loop {
            let left = room.saturating_sub(payload.len());
            let overhead = crypto_frame_overhead(space.crypto_stream.send.offset(), left);
            if left <= overhead {
                break;
            }
            let Some(chunk) = space.crypto_stream.send.pop_chunk(left - overhead) else {
                break;
            };
            let frame = Frame::Crypto {
                offset: chunk.offset,
                data: &chunk.data,
            };
            serializer.serialize_frame(&frame, &mut payload)?;
        }
        if epoch == Epoch::OneRtt && self.handshake_complete {
            if payload.len() + MAX_CREDIT_FRAME_LEN <= room {
                if let Some(maximum) = self.streams.take_max_data_update() {
                    serializer.serialize_frame(&Frame::MaxData(maximum), &mut payload)?;
                }
            }
            while payload.len() + MAX_CREDIT_FRAME_LEN <= room {
                let Some((stream_id, maximum)) = self.streams.take_max_stream_data_update() else {
                    break;
                };
                serializer.serialize_frame(&Frame::MaxStreamData { stream_id, maximum }, &mut payload)?;
            }
            while let Some((stream_id, chunk)) = self.streams.pop_send_chunk(room.saturating_sub(payload.len())) {
                let frame = Frame::Stream {
                    stream_id,
                    offset: chunk.offset,
                    data: &chunk.data,
                    fin: chunk.fin,
                };
                serializer.serialize_frame(&frame, &mut payload)?;
            }
        }
        Ok(payload)
    }

    /// Append one protected packet of `epoch` to `datagram`. Returns false
    /// if there was nothing to send or no room for it.
    fn build_packet(
        &mut self,
        epoch: Epoch,
        datagram: &mut BytesMut,
        close: Option<&ConnectionError>,
        pad_to: Option<usize>,
    ) -> Result<bool> {
        let used = datagram.len() + self.max_header_len(epoch) + TAG_LEN;
        let Some(room) = self
            .config
            .max_datagram_size
            .checked_sub(used)
            .filter(|room| *room >= MIN_PACKET_ROOM)
        else {
            return Ok(false);
        };
        let mut payload = self.build_payload(epoch, room, close)?;
        if payload.is_empty() {
            return Ok(false);
        }

        let space = &mut self.spaces[epoch.index()];
        let pn = space.next_packet_number();
        let pn_len = number::encode_length(pn, space.largest_acked);
        let min_len = crate::packet::min_payload_len(pn_len);
        if payload.len() < min_len {
            payload.put_bytes(0, min_len - payload.len());
        }

        let (mut header, mut pn_offset) = self.write_header(epoch, pn, pn_len, payload.len())?;
        if let Some(target) = pad_to {
            let len = datagram.len() + header.len() + payload.len() + TAG_LEN;
            if len < target {
                payload.put_bytes(0, target - len);
                (header, pn_offset) = self.write_header(epoch, pn, pn_len, payload.len())?;
            }
        }

        let key = self.spaces[epoch.index()].crypto.sealer()?;
        let packet = seal_packet(key, pn, &header, pn_offset, &payload)?;
        datagram.extend_from_slice(&packet);
        self.stats.packets_sent += 1;
        tracing::trace!(%epoch, pn, len = packet.len(), "packet sent");
        Ok(true)
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("side", &self.side)
            .field("version", &self.version)
            .field("state", &self.state)
            .field("host_cid", &self.host_cid)
            .field("peer_cid", &self.peer_cid)
            .field("handshake", &self.handshake.as_ref().map(HandshakeAdapter::is_complete))
            .field("streams", &self.streams.len())
            .field("stats", &self.stats)
            .finish()
    }
}
