//! # Connection Driver
//!
//! Binds a sans-io [`Connection`] to a datagram transport on a
//! single-threaded executor. Every entry point that can produce output
//! flushes the engine into the [`DatagramSender`] before returning.
//!
//! The engine sits in a `RefCell`; the borrow is released before each
//! datagram is handed to the sender, so a transport that delivers to the
//! peer synchronously (and the peer that answers synchronously) is fine.

#![forbid(unsafe_code)]

use super::state::{Connection, ConnectionState, ConnectionStats};
use crate::config::{ConnectionConfig, ServerIdentity};
use crate::crypto::KeyLog;
use crate::error::{Error, Result};
use crate::stream::{StreamReader, StreamWriter};
use crate::types::{StreamDirection, StreamId};
use bytes::Bytes;
use std::cell::RefCell;
use std::future::poll_fn;
use std::io::Write;
use std::rc::Rc;

/// Outbound half of the transport. Delivery failures are the
/// transport's concern.
pub trait DatagramSender {
    fn send_datagram(&self, datagram: Bytes);
}

pub(crate) struct Shared {
    pub(crate) conn: RefCell<Connection>,
    sender: RefCell<Option<Rc<dyn DatagramSender>>>,
}

impl Shared {
    /// Hand every datagram the engine has ready to the sender.
    pub(crate) fn flush(&self) {
        let Some(sender) = self.sender.borrow().clone() else {
            return;
        };
        loop {
            let next = self.conn.borrow_mut().poll_transmit();
            let Some(datagram) = next else {
                break;
            };
            sender.send_datagram(datagram);
        }
    }
}

impl std::fmt::Debug for Shared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.conn.try_borrow() {
            Ok(conn) => std::fmt::Debug::fmt(&*conn, f),
            Err(_) => f.write_str("Connection { <in use> }"),
        }
    }
}

/// A QUIC connection driven by datagram callbacks.
#[derive(Clone, Debug)]
pub struct QuicConnection {
    shared: Rc<Shared>,
}

impl QuicConnection {
    pub fn client(config: ConnectionConfig) -> Result<Self> {
        Ok(Self::new(Connection::new_client(config)?))
    }

    pub fn server(config: ConnectionConfig, identity: ServerIdentity) -> Result<Self> {
        Ok(Self::new(Connection::new_server(config, identity)?))
    }

    fn new(conn: Connection) -> Self {
        Self {
            shared: Rc::new(Shared {
                conn: RefCell::new(conn),
                sender: RefCell::new(None),
            }),
        }
    }

    /// Write NSS key-log lines for every handshake and 1-RTT secret to `sink`.
    pub fn with_secrets_log(self, sink: impl Write + 'static) -> Self {
        self.shared.conn.borrow_mut().set_key_log(KeyLog::new(Box::new(sink)));
        self
    }

    /// The transport is ready. A client sends its first flight.
    pub fn connection_made(&self, sender: Rc<dyn DatagramSender>) {
        *self.shared.sender.borrow_mut() = Some(sender);
        let started = self.shared.conn.borrow_mut().connect();
        if let Err(err) = started {
            tracing::warn!(%err, "failed to start handshake");
        }
        self.shared.flush();
    }

    /// Inbound entry point for every datagram from the peer.
    pub fn datagram_received(&self, datagram: &[u8]) {
        self.shared.conn.borrow_mut().handle_datagram(datagram);
        self.shared.flush();
    }

    /// Wait for the handshake to complete.
    ///
    /// Fails if the connection ends first, including when version
    /// negotiation finds no common version.
    pub async fn connect(&self) -> Result<()> {
        poll_fn(|cx| {
            let polled = self.shared.conn.borrow_mut().poll_connected(cx.waker());
            polled
        })
        .await
    }

    /// Open a locally initiated stream.
    pub fn create_stream(&self, unidirectional: bool) -> Result<(StreamReader, StreamWriter)> {
        let direction = if unidirectional {
            StreamDirection::Unidirectional
        } else {
            StreamDirection::Bidirectional
        };
        let id = self.shared.conn.borrow_mut().open_stream(direction)?;
        Ok(self.handles(id))
    }

    /// Handles for an existing stream.
    pub fn stream(&self, id: StreamId) -> Result<(StreamReader, StreamWriter)> {
        if !self.shared.conn.borrow().has_stream(id) {
            return Err(Error::StreamNotFound(id.value()));
        }
        Ok(self.handles(id))
    }

    /// Wait for the next stream the peer opens.
    pub async fn accept_stream(&self) -> Result<(StreamReader, StreamWriter)> {
        let id = poll_fn(|cx| {
            let polled = self.shared.conn.borrow_mut().poll_accept(cx.waker());
            polled
        })
        .await?;
        Ok(self.handles(id))
    }

    fn handles(&self, id: StreamId) -> (StreamReader, StreamWriter) {
        let weak = Rc::downgrade(&self.shared);
        (StreamReader::new(weak.clone(), id), StreamWriter::new(weak, id))
    }

    /// Close the connection and send the CONNECTION_CLOSE. A `frame_type`
    /// makes it a transport close, otherwise it is an application close.
    pub fn close(&self, error_code: u64, frame_type: Option<u64>, reason: &str) {
        self.shared.conn.borrow_mut().close(error_code, frame_type, reason);
        self.shared.flush();
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.conn.borrow().state()
    }

    pub fn stats(&self) -> ConnectionStats {
        self.shared.conn.borrow().stats()
    }

    /// Run `f` against the engine, then flush whatever it queued.
    pub fn with_engine<R>(&self, f: impl FnOnce(&mut Connection) -> R) -> R {
        let result = f(&mut self.shared.conn.borrow_mut());
        self.shared.flush();
        result
    }
}
