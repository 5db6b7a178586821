//! Application-facing stream handles.
//!
//! Handles hold a weak reference to the connection and a stream ID; the
//! connection owns the stream state. Dropping a handle (or a pending
//! `read` future) never touches buffered data.

#![forbid(unsafe_code)]

use crate::connection::driver::Shared;
use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::types::StreamId;
use bytes::Bytes;
use std::future::poll_fn;
use std::rc::Weak;
use std::task::Poll;

fn with_connection<R>(shared: &Weak<Shared>, f: impl FnOnce(&mut Connection) -> Result<R>) -> Result<R> {
    let shared = shared.upgrade().ok_or(Error::ConnectionClosed)?;
    let result = f(&mut shared.conn.borrow_mut());
    shared.flush();
    result
}

/// Receiving half of a stream.
#[derive(Debug, Clone)]
pub struct StreamReader {
    shared: Weak<Shared>,
    id: StreamId,
}

impl StreamReader {
    pub(crate) fn new(shared: Weak<Shared>, id: StreamId) -> Self {
        Self { shared, id }
    }

    pub fn stream_id(&self) -> StreamId {
        self.id
    }

    /// Read from the stream.
    ///
    /// With `Some(max)` this resolves as soon as any data is buffered and
    /// returns at most `max` bytes. With `None` it waits for the peer's FIN
    /// and returns everything that is left. An empty result is
    /// end-of-stream.
    pub async fn read(&self, max: Option<usize>) -> Result<Bytes> {
        poll_fn(|cx| {
            let Some(shared) = self.shared.upgrade() else {
                return Poll::Ready(Err(Error::ConnectionClosed));
            };
            let polled = shared.conn.borrow_mut().poll_stream_read(self.id, max, cx.waker());
            // Consumed data may have opened the peer's window
            shared.flush();
            polled
        })
        .await
    }
}

/// Sending half of a stream. Every call flushes the connection.
#[derive(Debug, Clone)]
pub struct StreamWriter {
    shared: Weak<Shared>,
    id: StreamId,
}

impl StreamWriter {
    pub(crate) fn new(shared: Weak<Shared>, id: StreamId) -> Self {
        Self { shared, id }
    }

    pub fn stream_id(&self) -> StreamId {
        self.id
    }

    /// Queue `data` and send what fits now.
    pub fn write(&self, data: &[u8]) -> Result<()> {
        with_connection(&self.shared, |conn| conn.stream_write(self.id, data))
    }

    /// Close the sending half. The FIN follows any queued data exactly once.
    pub fn write_eof(&self) -> Result<()> {
        with_connection(&self.shared, |conn| conn.stream_finish(self.id))
    }
}
