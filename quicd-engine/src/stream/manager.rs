//! # Stream Manager (RFC 9000 Section 2, 3, 4)
//!
//! Owns every stream of a connection, keyed by ID. Peer-initiated streams
//! come into existence on the first frame that names them (opening any
//! lower ID of the same class as well), local ones through
//! [`StreamManager::open`].
//!
//! Reads are poll-based: a reader with nothing to consume leaves its
//! waker on the stream's wait-list and is woken by frame delivery or by
//! connection close.
//!
//! Flow control runs at two levels. Each receive half has a window that
//! slides as the application consumes data, and the connection has one
//! over the sum of all streams. Sends are capped by the credit the peer
//! announced in its transport parameters and later MAX_DATA and
//! MAX_STREAM_DATA frames.

#![forbid(unsafe_code)]

use super::buffer::{InsertError, RecvBuffer, SendBuffer, SendChunk};
use crate::error::{ConnectionError, Error, Result, TransportErrorCode};
use crate::flow_control::{FlowControlLimit, RecvWindow, SendCredit};
use crate::frames::stream_frame_overhead;
use crate::types::{Side, StreamDirection, StreamId};
use bytes::{Bytes, BytesMut};
use std::collections::{BTreeMap, VecDeque};
use std::task::{Poll, Waker};

/// Default receive window per stream
pub const DEFAULT_STREAM_WINDOW: u64 = 1 << 20;

/// Default receive window for the whole connection
pub const DEFAULT_CONNECTION_WINDOW: u64 = 10 << 20;

/// Peer-initiated streams allowed per class
pub const MAX_PEER_STREAMS: u64 = 1024;

/// Send limits the peer announced in its transport parameters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PeerLimits {
    pub max_data: FlowControlLimit,
    /// Streams the peer opens
    pub stream_bidi_local: FlowControlLimit,
    /// Streams we open
    pub stream_bidi_remote: FlowControlLimit,
    pub stream_uni: FlowControlLimit,
}

impl PeerLimits {
    fn stream_credit(&self, id: StreamId, side: Side) -> FlowControlLimit {
        match id.direction() {
            StreamDirection::Unidirectional => self.stream_uni,
            StreamDirection::Bidirectional if id.initiator() == side => self.stream_bidi_remote,
            StreamDirection::Bidirectional => self.stream_bidi_local,
        }
    }
}

#[derive(Debug)]
struct RecvHalf {
    buffer: RecvBuffer,
    window: RecvWindow,
    /// Data gathered for a pending unbounded read
    collected: BytesMut,
}

#[derive(Debug)]
struct SendHalf {
    buffer: SendBuffer,
    credit: SendCredit,
}

impl SendHalf {
    /// Something can go out with `connection` bytes of connection credit.
    fn is_sendable(&self, connection: u64) -> bool {
        if self.buffer.pending_len() > 0 {
            self.credit.available().min(connection) > 0
        } else {
            self.buffer.has_pending()
        }
    }
}

/// One stream: either half may be absent on unidirectional streams.
#[derive(Debug)]
pub struct Stream {
    pub id: StreamId,
    recv: Option<RecvHalf>,
    send: Option<SendHalf>,
    /// A reader has observed end-of-stream
    end_delivered: bool,
    read_waiters: Vec<Waker>,
}

impl Stream {
    fn new(id: StreamId, side: Side, window: u64, peer: &PeerLimits) -> Self {
        Self {
            id,
            recv: id.can_receive(side).then(|| RecvHalf {
                buffer: RecvBuffer::new(window),
                window: RecvWindow::new(window),
                collected: BytesMut::new(),
            }),
            send: id.can_send(side).then(|| SendHalf {
                buffer: SendBuffer::new(),
                credit: SendCredit::new(peer.stream_credit(id, side)),
            }),
            end_delivered: false,
            read_waiters: Vec::new(),
        }
    }

    fn wake_readers(&mut self) {
        for waker in self.read_waiters.drain(..) {
            waker.wake();
        }
    }

    fn is_finished(&self) -> bool {
        let send_done = self.send.as_ref().map_or(true, |s| s.buffer.fin_sent());
        let recv_done = self.recv.is_none() || self.end_delivered;
        send_done && recv_done
    }

    /// The receive window should move and the peer still has data to send.
    fn needs_window_update(&self) -> bool {
        self.recv
            .as_ref()
            .is_some_and(|r| !r.buffer.fin_received() && r.window.should_update())
    }
}

fn add_waker(waiters: &mut Vec<Waker>, waker: &Waker) {
    if !waiters.iter().any(|w| w.will_wake(waker)) {
        waiters.push(waker.clone());
    }
}

fn flow_error(frame_type: u64, reason: &'static str) -> ConnectionError {
    ConnectionError::transport(TransportErrorCode::FlowControlError, frame_type, reason)
}

/// Connection-level stream table.
#[derive(Debug)]
pub struct StreamManager {
    side: Side,
    /// Next unused ID per class (`id mod 4`)
    next_ids: [u64; 4],
    streams: BTreeMap<StreamId, Stream>,
    /// Peer-initiated streams not yet handed out by `poll_accept`
    incoming: VecDeque<StreamId>,
    accept_waiters: Vec<Waker>,
    closed: bool,
    /// Receive window for each new stream
    stream_window: u64,
    recv_flow: RecvWindow,
    send_flow: SendCredit,
    peer_limits: PeerLimits,
}

impl StreamManager {
    pub fn new(side: Side) -> Self {
        Self::with_windows(side, DEFAULT_CONNECTION_WINDOW, DEFAULT_STREAM_WINDOW)
    }

    /// A table advertising `max_data` for the connection and
    /// `stream_window` for every stream.
    pub fn with_windows(side: Side, max_data: u64, stream_window: u64) -> Self {
        Self {
            side,
            next_ids: [0, 1, 2, 3],
            streams: BTreeMap::new(),
            incoming: VecDeque::new(),
            accept_waiters: Vec::new(),
            closed: false,
            stream_window,
            recv_flow: RecvWindow::new(max_data),
            send_flow: SendCredit::new(0),
            peer_limits: PeerLimits::default(),
        }
    }

    fn is_local(&self, id: StreamId) -> bool {
        id.initiator() == self.side
    }

    /// Connection-level limit we have announced.
    pub fn local_max_data(&self) -> u64 {
        self.recv_flow.limit()
    }

    pub fn local_stream_window(&self) -> u64 {
        self.stream_window
    }

    /// Apply the peer's transport parameters. Streams opened before the
    /// handshake finished get their credit now.
    pub fn set_peer_limits(&mut self, limits: PeerLimits) {
        self.peer_limits = limits;
        self.send_flow.raise(limits.max_data);
        for stream in self.streams.values_mut() {
            if let Some(send) = stream.send.as_mut() {
                send.credit.raise(limits.stream_credit(stream.id, self.side));
            }
        }
        tracing::debug!(?limits, "peer flow control limits");
    }

    /// Allocate and register the next locally-initiated stream.
    pub fn open(&mut self, direction: StreamDirection) -> Result<StreamId> {
        if self.closed {
            return Err(Error::ConnectionClosed);
        }
        let class = StreamId::first(self.side, direction).class();
        let id = StreamId::new(self.next_ids[class]);
        self.next_ids[class] += 4;
        self.streams
            .insert(id, Stream::new(id, self.side, self.stream_window, &self.peer_limits));
        tracing::debug!(stream_id = %id, ?direction, "opened local stream");
        Ok(id)
    }

    pub fn contains(&self, id: StreamId) -> bool {
        self.streams.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    /// Validate an ID named by the peer, opening peer streams up to it.
    fn open_for_frame(&mut self, id: StreamId, frame_type: u64) -> std::result::Result<(), ConnectionError> {
        let class = id.class();
        if self.is_local(id) {
            if id.value() >= self.next_ids[class] {
                return Err(ConnectionError::transport(
                    TransportErrorCode::StreamStateError,
                    frame_type,
                    "frame for a local stream that was never opened",
                ));
            }
        } else if id.value() >= self.next_ids[class] {
            if id.value() / 4 >= MAX_PEER_STREAMS {
                return Err(ConnectionError::transport(
                    TransportErrorCode::StreamLimitError,
                    frame_type,
                    "too many peer streams",
                ));
            }
            while self.next_ids[class] <= id.value() {
                let new_id = StreamId::new(self.next_ids[class]);
                self.next_ids[class] += 4;
                self.streams
                    .insert(new_id, Stream::new(new_id, self.side, self.stream_window, &self.peer_limits));
                self.incoming.push_back(new_id);
                tracing::debug!(stream_id = %new_id, "peer opened stream");
            }
            for waker in self.accept_waiters.drain(..) {
                waker.wake();
            }
        }
        Ok(())
    }

    /// Deliver a received STREAM frame.
    pub fn on_stream_frame(
        &mut self,
        id: StreamId,
        offset: u64,
        data: &[u8],
        fin: bool,
        frame_type: u64,
    ) -> std::result::Result<(), ConnectionError> {
        if !id.can_receive(self.side) {
            return Err(ConnectionError::transport(
                TransportErrorCode::StreamStateError,
                frame_type,
                "STREAM frame on a send-only stream",
            ));
        }
        self.open_for_frame(id, frame_type)?;
        // Absent here means the stream was already reaped
        let Some(stream) = self.streams.get_mut(&id) else {
            tracing::trace!(stream_id = %id, "ignoring frame for retired stream");
            return Ok(());
        };
        let Some(recv) = stream.recv.as_mut() else {
            return Ok(());
        };
        let end = offset.checked_add(data.len() as u64).ok_or_else(|| {
            ConnectionError::transport(TransportErrorCode::FrameEncodingError, frame_type, "stream offset overflow")
        })?;
        let fresh = recv
            .window
            .on_received(end)
            .ok_or_else(|| flow_error(frame_type, "stream data beyond MAX_STREAM_DATA"))?;
        self.recv_flow
            .on_received(self.recv_flow.received() + fresh)
            .ok_or_else(|| flow_error(frame_type, "connection data beyond MAX_DATA"))?;
        match recv.buffer.insert(offset, data, fin) {
            Ok(()) => {}
            Err(InsertError::FinalSize) => {
                return Err(ConnectionError::transport(
                    TransportErrorCode::FinalSizeError,
                    frame_type,
                    "inconsistent final size",
                ))
            }
            Err(InsertError::LimitExceeded) => {
                return Err(flow_error(frame_type, "stream receive window exceeded"));
            }
        }
        stream.wake_readers();
        Ok(())
    }

    /// Peer raised the connection-level send limit.
    pub fn on_max_data(&mut self, maximum: u64) {
        if self.send_flow.raise(maximum) {
            tracing::trace!(maximum, "connection send credit raised");
        }
    }

    /// Peer raised the send limit of one stream.
    pub fn on_max_stream_data(
        &mut self,
        id: StreamId,
        maximum: u64,
        frame_type: u64,
    ) -> std::result::Result<(), ConnectionError> {
        if !id.can_send(self.side) {
            return Err(ConnectionError::transport(
                TransportErrorCode::StreamStateError,
                frame_type,
                "MAX_STREAM_DATA for a receive-only stream",
            ));
        }
        self.open_for_frame(id, frame_type)?;
        if let Some(send) = self.streams.get_mut(&id).and_then(|s| s.send.as_mut()) {
            if send.credit.raise(maximum) {
                tracing::trace!(stream_id = %id, maximum, "stream send credit raised");
            }
        }
        Ok(())
    }

    fn stream_mut(&mut self, id: StreamId) -> Result<&mut Stream> {
        self.streams.get_mut(&id).ok_or(Error::StreamNotFound(id.value()))
    }

    fn send_mut(&mut self, id: StreamId) -> Result<&mut SendBuffer> {
        if self.closed {
            return Err(Error::ConnectionClosed);
        }
        self.stream_mut(id)?
            .send
            .as_mut()
            .map(|s| &mut s.buffer)
            .ok_or(Error::StreamState(id.value()))
    }

    pub fn write(&mut self, id: StreamId, data: &[u8]) -> Result<()> {
        let send = self.send_mut(id)?;
        if send.is_finished() {
            return Err(Error::StreamState(id.value()));
        }
        send.write(data);
        Ok(())
    }

    /// Close the send half; a FIN goes out after buffered data.
    pub fn finish(&mut self, id: StreamId) -> Result<()> {
        self.send_mut(id)?.finish();
        Ok(())
    }

    /// Poll for stream data.
    ///
    /// `max = Some(n)` returns up to `n` bytes as soon as any are buffered.
    /// `max = None` waits for the FIN and returns everything left. An empty
    /// result means end-of-stream.
    ///
    /// Data moved out of the reassembly buffer counts as consumed, so an
    /// unbounded read keeps the peer's credit flowing while it waits.
    pub fn poll_read(&mut self, id: StreamId, max: Option<usize>, waker: &Waker) -> Poll<Result<Bytes>> {
        let closed = self.closed;
        let Some(stream) = self.streams.get_mut(&id) else {
            // Reaped streams already delivered their end
            let known = id.value() < self.next_ids[id.class()];
            return if known && id.can_receive(self.side) {
                Poll::Ready(Ok(Bytes::new()))
            } else {
                Poll::Ready(Err(Error::StreamNotFound(id.value())))
            };
        };
        let Some(recv) = stream.recv.as_mut() else {
            return Poll::Ready(Err(Error::StreamState(id.value())));
        };

        if let Some(max) = max {
            if !recv.collected.is_empty() {
                let n = max.min(recv.collected.len());
                return Poll::Ready(Ok(recv.collected.split_to(n).freeze()));
            }
        }

        let data = match max {
            Some(max) if recv.buffer.available() > 0 || recv.buffer.is_complete() => recv.buffer.read(max),
            Some(_) => Bytes::new(),
            None => {
                let chunk = recv.buffer.read(usize::MAX);
                recv.collected.extend_from_slice(&chunk);
                chunk
            }
        };
        recv.window.on_consumed(data.len() as u64);
        self.recv_flow.on_consumed(data.len() as u64);

        let ready = match max {
            Some(_) => !data.is_empty() || recv.buffer.is_complete(),
            None => recv.buffer.is_complete(),
        };
        if !ready {
            if closed {
                return Poll::Ready(Err(Error::ConnectionClosed));
            }
            add_waker(&mut stream.read_waiters, waker);
            return Poll::Pending;
        }

        let data = match max {
            Some(_) => data,
            None => recv.collected.split().freeze(),
        };
        if recv.buffer.is_drained() && recv.collected.is_empty() {
            stream.end_delivered = true;
        }
        tracing::trace!(stream_id = %id, len = data.len(), "stream read");
        self.reap(id);
        Poll::Ready(Ok(data))
    }

    /// Poll for the next peer-initiated stream.
    pub fn poll_accept(&mut self, waker: &Waker) -> Poll<Result<StreamId>> {
        if let Some(id) = self.incoming.pop_front() {
            return Poll::Ready(Ok(id));
        }
        if self.closed {
            return Poll::Ready(Err(Error::ConnectionClosed));
        }
        add_waker(&mut self.accept_waiters, waker);
        Poll::Pending
    }

    /// Some stream has data or a FIN that current credit lets out.
    pub fn has_pending_send(&self) -> bool {
        let connection = self.send_flow.available();
        self.streams
            .values()
            .any(|s| s.send.as_ref().is_some_and(|send| send.is_sendable(connection)))
    }

    /// Next chunk to frame, sized so the whole STREAM frame fits in `room`
    /// and within both stream and connection credit.
    pub fn pop_send_chunk(&mut self, room: usize) -> Option<(StreamId, SendChunk)> {
        let connection = self.send_flow.available();
        let (id, chunk) = self.streams.values_mut().find_map(|stream| {
            let send = stream.send.as_mut().filter(|s| s.is_sendable(connection))?;
            let overhead = stream_frame_overhead(stream.id, send.buffer.offset(), room);
            let credit = send.credit.available().min(connection);
            let max = room.checked_sub(overhead)?.min(usize::try_from(credit).unwrap_or(usize::MAX));
            let chunk = send.buffer.pop_chunk(max)?;
            send.credit.consume(chunk.data.len() as u64);
            Some((stream.id, chunk))
        })?;
        self.send_flow.consume(chunk.data.len() as u64);
        if chunk.fin {
            self.reap(id);
        }
        Some((id, chunk))
    }

    /// A MAX_DATA or MAX_STREAM_DATA frame is due.
    pub fn has_pending_window_update(&self) -> bool {
        self.recv_flow.should_update() || self.streams.values().any(Stream::needs_window_update)
    }

    /// New connection-level limit to announce, if the window should move.
    pub fn take_max_data_update(&mut self) -> Option<u64> {
        self.recv_flow.should_update().then(|| self.recv_flow.update())
    }

    /// Next stream whose window should move, with its new limit.
    pub fn take_max_stream_data_update(&mut self) -> Option<(StreamId, u64)> {
        let stream = self.streams.values_mut().find(|s| s.needs_window_update())?;
        let recv = stream.recv.as_mut()?;
        Some((stream.id, recv.window.update()))
    }

    fn reap(&mut self, id: StreamId) {
        if self.streams.get(&id).is_some_and(Stream::is_finished) {
            self.streams.remove(&id);
            tracing::debug!(stream_id = %id, "stream reaped");
        }
    }

    /// Connection is gone: fail pending and future operations.
    pub fn on_connection_closed(&mut self) {
        self.closed = true;
        for stream in self.streams.values_mut() {
            stream.wake_readers();
        }
        for waker in self.accept_waiters.drain(..) {
            waker.wake();
        }
    }
}
