//! Key-log export in the NSS `SSLKEYLOGFILE` line format used by QUIC
//! analysers: `<LABEL> <client_random_hex> <secret_hex>`.
//!
//! rustls reports secrets through its [`rustls::KeyLog`] hook as it derives
//! them, in whatever order its state machine produces. A
//! [`SecretCollector`] parks them until the session hands out the keys of
//! that epoch, so lines are written per epoch, server secret first.

#![forbid(unsafe_code)]

use crate::types::{Epoch, Side};
use parking_lot::Mutex;
use std::io::Write;
use zeroize::Zeroizing;

/// Key-log label for the secret of `epoch` owned by `owner` (the side that
/// sends with it), or None for epochs that are not logged.
pub fn secret_label(epoch: Epoch, owner: Side) -> Option<&'static str> {
    match (epoch, owner) {
        (Epoch::Handshake, Side::Server) => Some("QUIC_SERVER_HANDSHAKE_TRAFFIC_SECRET"),
        (Epoch::Handshake, Side::Client) => Some("QUIC_CLIENT_HANDSHAKE_TRAFFIC_SECRET"),
        (Epoch::OneRtt, Side::Server) => Some("QUIC_SERVER_TRAFFIC_SECRET_0"),
        (Epoch::OneRtt, Side::Client) => Some("QUIC_CLIENT_TRAFFIC_SECRET_0"),
        (Epoch::Initial, _) => None,
    }
}

/// Secret as reported by rustls, waiting to be logged.
struct CollectedSecret {
    label: String,
    secret: Zeroizing<Vec<u8>>,
}

/// [`rustls::KeyLog`] implementation that keeps secrets for the session.
#[derive(Default)]
pub struct SecretCollector {
    client_random: Mutex<Vec<u8>>,
    secrets: Mutex<Vec<CollectedSecret>>,
}

impl SecretCollector {
    /// Remove and return the secret rustls logged as `label`.
    pub fn take(&self, label: &str) -> Option<Zeroizing<Vec<u8>>> {
        let mut secrets = self.secrets.lock();
        let index = secrets.iter().position(|s| s.label == label)?;
        Some(secrets.swap_remove(index).secret)
    }

    /// ClientHello random of the connection; empty until the first secret.
    pub fn client_random(&self) -> Vec<u8> {
        self.client_random.lock().clone()
    }
}

impl rustls::KeyLog for SecretCollector {
    fn log(&self, label: &str, client_random: &[u8], secret: &[u8]) {
        let mut random = self.client_random.lock();
        if random.is_empty() {
            random.extend_from_slice(client_random);
        }
        self.secrets.lock().push(CollectedSecret {
            label: label.to_string(),
            secret: Zeroizing::new(secret.to_vec()),
        });
    }
}

impl std::fmt::Debug for SecretCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretCollector")
            .field("pending", &self.secrets.lock().len())
            .finish()
    }
}

/// Append-only sink for derived secrets.
pub struct KeyLog {
    sink: Box<dyn Write>,
}

impl KeyLog {
    pub fn new(sink: Box<dyn Write>) -> Self {
        Self { sink }
    }

    /// Write one line. Sink failures are logged and otherwise ignored.
    pub fn log_secret(&mut self, label: &str, client_random: &[u8], secret: &[u8]) {
        let line = format!("{} {} {}\n", label, hex::encode(client_random), hex::encode(secret));
        if let Err(err) = self
            .sink
            .write_all(line.as_bytes())
            .and_then(|()| self.sink.flush())
        {
            tracing::warn!(%err, label, "failed to write key log line");
        }
    }
}

impl std::fmt::Debug for KeyLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("KeyLog")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    struct Shared(Rc<RefCell<Vec<u8>>>);

    impl Write for Shared {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.borrow_mut().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn line_format() {
        let buf = Rc::new(RefCell::new(Vec::new()));
        let mut log = KeyLog::new(Box::new(Shared(buf.clone())));
        log.log_secret("QUIC_SERVER_TRAFFIC_SECRET_0", &[0xab, 0x01], &[0xff]);
        assert_eq!(
            String::from_utf8(buf.borrow().clone()).unwrap(),
            "QUIC_SERVER_TRAFFIC_SECRET_0 ab01 ff\n"
        );
    }

    #[test]
    fn collector_hands_out_each_secret_once() {
        let collector = SecretCollector::default();
        rustls::KeyLog::log(&collector, "CLIENT_HANDSHAKE_TRAFFIC_SECRET", &[1, 2], &[0xaa]);
        rustls::KeyLog::log(&collector, "SERVER_HANDSHAKE_TRAFFIC_SECRET", &[9, 9], &[0xbb]);
        assert_eq!(collector.client_random(), vec![1, 2]);
        assert_eq!(collector.take("SERVER_HANDSHAKE_TRAFFIC_SECRET").unwrap().as_slice(), &[0xbb]);
        assert!(collector.take("SERVER_HANDSHAKE_TRAFFIC_SECRET").is_none());
        assert!(collector.take("EXPORTER_SECRET").is_none());
    }

    #[test]
    fn initial_secrets_are_not_logged() {
        assert_eq!(secret_label(Epoch::Initial, Side::Client), None);
        assert_eq!(
            secret_label(Epoch::Handshake, Side::Client),
            Some("QUIC_CLIENT_HANDSHAKE_TRAFFIC_SECRET")
        );
    }
}
