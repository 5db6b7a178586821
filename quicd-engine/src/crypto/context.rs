//! Per-epoch key holder.
//!
//! Each direction is either [`KeyState::Absent`] or
//! [`KeyState::Installed`]; packet processing branches on that state
//! instead of on nullable fields, so a missing key is an explicit drop.

#![forbid(unsafe_code)]

use super::keys::PacketKey;
use crate::error::{Error, Result};
use crate::types::{Epoch, Side};
use crate::version::Version;

#[derive(Debug, Default)]
pub enum KeyState {
    #[default]
    Absent,
    Installed(PacketKey),
}

impl KeyState {
    pub fn is_installed(&self) -> bool {
        matches!(self, KeyState::Installed(_))
    }
}

/// Send and receive keys of one epoch, settable independently.
#[derive(Debug)]
pub struct CryptoContext {
    epoch: Epoch,
    send: KeyState,
    recv: KeyState,
}

impl CryptoContext {
    pub fn new(epoch: Epoch) -> Self {
        Self {
            epoch,
            send: KeyState::Absent,
            recv: KeyState::Absent,
        }
    }

    /// Install Initial keys for `side` derived from the client's DCID.
    /// Replaces any previous Initial keys (Retry and Version Negotiation
    /// restart the Initial epoch).
    pub fn setup_initial(&mut self, version: Version, side: Side, client_dcid: &[u8]) -> Result<()> {
        let (send, recv) = PacketKey::initial(version, client_dcid, side)?;
        self.send = KeyState::Installed(send);
        self.recv = KeyState::Installed(recv);
        Ok(())
    }

    /// Install (or replace) the send key.
    pub fn install_send(&mut self, key: PacketKey) {
        self.send = KeyState::Installed(key);
    }

    /// Install the receive key. An installed receive key is never replaced.
    pub fn install_recv(&mut self, key: PacketKey) -> Result<()> {
        if self.recv.is_installed() {
            return Err(Error::InvalidKey);
        }
        self.recv = KeyState::Installed(key);
        Ok(())
    }

    pub fn discard_send(&mut self) {
        self.send = KeyState::Absent;
    }

    /// Drop both directions.
    pub fn discard(&mut self) {
        self.send = KeyState::Absent;
        self.recv = KeyState::Absent;
    }

    pub fn can_send(&self) -> bool {
        self.send.is_installed()
    }

    pub fn can_receive(&self) -> bool {
        self.recv.is_installed()
    }

    pub fn sealer(&self) -> Result<&PacketKey> {
        match &self.send {
            KeyState::Installed(key) => Ok(key),
            KeyState::Absent => Err(Error::KeyUnavailable(self.epoch)),
        }
    }

    pub fn opener(&self) -> Result<&PacketKey> {
        match &self.recv {
            KeyState::Installed(key) => Ok(key),
            KeyState::Absent => Err(Error::KeyUnavailable(self.epoch)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_keys_are_mirrored() {
        let dcid = [0x83, 0x94, 0xc8, 0xf0];
        let mut client = CryptoContext::new(Epoch::Initial);
        let mut server = CryptoContext::new(Epoch::Initial);
        client.setup_initial(Version::V1, Side::Client, &dcid).unwrap();
        server.setup_initial(Version::V1, Side::Server, &dcid).unwrap();

        let sealed = client.sealer().unwrap().seal(0, b"h", b"hello").unwrap();
        assert_eq!(server.opener().unwrap().open(0, b"h", &sealed).unwrap(), b"hello");
    }

    #[test]
    fn absent_key_is_an_error() {
        let ctx = CryptoContext::new(Epoch::Handshake);
        assert_eq!(ctx.sealer().unwrap_err(), Error::KeyUnavailable(Epoch::Handshake));
        assert!(!ctx.can_receive());
    }

    #[test]
    fn receive_key_is_not_replaced() {
        let mut ctx = CryptoContext::new(Epoch::OneRtt);
        let key = || PacketKey::initial(Version::V1, &[1; 8], Side::Server).unwrap().1;
        ctx.install_recv(key()).unwrap();
        assert_eq!(ctx.install_recv(key()), Err(Error::InvalidKey));
        ctx.install_send(key());
        ctx.install_send(key());
        ctx.discard_send();
        assert!(!ctx.can_send());
        assert!(ctx.can_receive());
    }
}
