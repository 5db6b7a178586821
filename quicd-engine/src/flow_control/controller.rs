//! Send credit and receive windows.
//!
//! A [`SendCredit`] tracks what the peer allows us to send; a
//! [`RecvWindow`] tracks what we allow the peer to send and when the
//! advertised limit should move forward. Receive windows slide as the
//! application consumes data, so a reader that stops reading stops the
//! sender instead of growing our buffers.

#![forbid(unsafe_code)]

/// Flow Control Limit (bytes)
pub type FlowControlLimit = u64;

/// Credit granted by the peer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SendCredit {
    limit: FlowControlLimit,
    used: u64,
}

impl SendCredit {
    pub fn new(limit: FlowControlLimit) -> Self {
        Self { limit, used: 0 }
    }

    pub fn limit(&self) -> FlowControlLimit {
        self.limit
    }

    pub fn used(&self) -> u64 {
        self.used
    }

    /// Bytes that may still be sent.
    pub fn available(&self) -> u64 {
        self.limit.saturating_sub(self.used)
    }

    /// Record `bytes` of new data sent. Callers stay within `available`.
    pub fn consume(&mut self, bytes: u64) {
        debug_assert!(bytes <= self.available());
        self.used += bytes;
    }

    /// Apply a MAX_DATA or MAX_STREAM_DATA value. Limits never shrink;
    /// returns true if the limit moved.
    pub fn raise(&mut self, limit: FlowControlLimit) -> bool {
        if limit <= self.limit {
            return false;
        }
        self.limit = limit;
        true
    }
}

/// Window we advertise to the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecvWindow {
    /// Size of the window kept open ahead of consumed data
    window: u64,
    /// Limit the peer currently knows about
    limit: FlowControlLimit,
    /// Highest byte count received
    received: u64,
    /// Bytes handed to the application
    consumed: u64,
}

impl RecvWindow {
    pub fn new(window: u64) -> Self {
        Self {
            window,
            limit: window,
            received: 0,
            consumed: 0,
        }
    }

    pub fn limit(&self) -> FlowControlLimit {
        self.limit
    }

    pub fn received(&self) -> u64 {
        self.received
    }

    /// Peer data now reaches `end`. Returns the count of bytes that are
    /// new, or None if `end` is past the advertised limit.
    pub fn on_received(&mut self, end: u64) -> Option<u64> {
        if end > self.limit {
            return None;
        }
        let fresh = end.saturating_sub(self.received);
        self.received = self.received.max(end);
        Some(fresh)
    }

    pub fn on_consumed(&mut self, bytes: u64) {
        self.consumed = (self.consumed + bytes).min(self.received);
    }

    /// Less than half the window is left open.
    pub fn should_update(&self) -> bool {
        self.limit - self.consumed < self.window / 2
    }

    /// Slide the window to `consumed + window` and return the new limit.
    pub fn update(&mut self) -> FlowControlLimit {
        self.limit = self.limit.max(self.consumed + self.window);
        self.limit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_credit_only_grows() {
        let mut credit = SendCredit::new(100);
        credit.consume(60);
        assert_eq!(credit.available(), 40);
        assert!(!credit.raise(80));
        assert!(credit.raise(200));
        assert_eq!(credit.available(), 140);
        credit.consume(140);
        assert_eq!(credit.available(), 0);
    }

    #[test]
    fn receive_limit_is_enforced() {
        let mut window = RecvWindow::new(100);
        assert_eq!(window.on_received(40), Some(40));
        // Retransmitted or reordered data is not counted twice
        assert_eq!(window.on_received(30), Some(0));
        assert_eq!(window.on_received(100), Some(60));
        assert_eq!(window.on_received(101), None);
    }

    #[test]
    fn window_slides_with_consumption() {
        let mut window = RecvWindow::new(100);
        window.on_received(100);
        window.on_consumed(40);
        assert!(!window.should_update());
        window.on_consumed(20);
        assert!(window.should_update());
        assert_eq!(window.update(), 160);
        assert!(!window.should_update());
        assert_eq!(window.on_received(160), Some(60));
    }
}
