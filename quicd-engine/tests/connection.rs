//! End-to-end tests: a client and a server connected through an in-memory
//! transport that delivers each datagram synchronously to the peer. Bulk
//! transfers use a queued transport shuttled by the test instead.

use bytes::Bytes;
use quicd_engine::crypto::PacketKey;
use quicd_engine::packet::{encode_retry, encode_version_negotiation};
use quicd_engine::{
    CipherSuite, ConnectionConfig, ConnectionId, ConnectionState, DatagramSender, Epoch, Error, QuicConnection,
    ServerIdentity, Side, StreamId, Version,
};
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::Duration;

const VERSIONS: [Version; 3] = [Version::V1, Version::V2, Version::Draft29];

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Counts datagrams and hands them to the peer, if one is attached.
#[derive(Default)]
struct FakeTransport {
    sent: Cell<usize>,
    target: RefCell<Option<QuicConnection>>,
}

impl FakeTransport {
    fn to(target: &QuicConnection) -> Rc<Self> {
        Rc::new(Self {
            sent: Cell::new(0),
            target: RefCell::new(Some(target.clone())),
        })
    }
}

impl DatagramSender for FakeTransport {
    fn send_datagram(&self, datagram: Bytes) {
        self.sent.set(self.sent.get() + 1);
        let target = self.target.borrow().clone();
        if let Some(target) = target {
            target.datagram_received(&datagram);
        }
    }
}

#[derive(Clone, Default)]
struct SharedLog(Rc<RefCell<Vec<u8>>>);

impl SharedLog {
    fn contents(&self) -> String {
        String::from_utf8(self.0.borrow().clone()).unwrap()
    }
}

impl Write for SharedLog {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.borrow_mut().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

struct Pair {
    client: QuicConnection,
    server: QuicConnection,
    client_transport: Rc<FakeTransport>,
    server_transport: Rc<FakeTransport>,
}

fn cert_path(name: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/certs").join(name)
}

/// Settings for either end; clients trust the test CA.
fn config(version: Version) -> ConnectionConfig {
    ConnectionConfig {
        ca_file: Some(cert_path("ca.pem")),
        ..ConnectionConfig::default()
    }
    .with_versions(&[version])
}

fn identity() -> ServerIdentity {
    ServerIdentity::load(cert_path("server.pem"), cert_path("server.key")).unwrap()
}

fn crypto_error_code(err: &Error) -> Option<u64> {
    match err {
        Error::Transport(err) if err.frame_type == Some(0x06) => Some(err.error_code),
        _ => None,
    }
}

fn start(client: QuicConnection, server: QuicConnection) -> Pair {
    init_tracing();
    let client_transport = FakeTransport::to(&server);
    let server_transport = FakeTransport::to(&client);
    server.connection_made(server_transport.clone());
    client.connection_made(client_transport.clone());
    Pair {
        client,
        server,
        client_transport,
        server_transport,
    }
}

fn pair_with(client_config: ConnectionConfig, server_config: ConnectionConfig) -> Pair {
    start(
        QuicConnection::client(client_config).unwrap(),
        QuicConnection::server(server_config, identity()).unwrap(),
    )
}

fn pair(version: Version) -> Pair {
    pair_with(config(version), config(version))
}

/// A client whose datagrams go nowhere.
fn lonely_client(config: ConnectionConfig) -> (QuicConnection, Rc<FakeTransport>) {
    init_tracing();
    let client = QuicConnection::client(config).unwrap();
    let transport = Rc::new(FakeTransport::default());
    client.connection_made(transport.clone());
    (client, transport)
}

#[tokio::test]
async fn connects_with_every_version() {
    for version in VERSIONS {
        let p = pair(version);
        p.client.connect().await.unwrap();
        p.server.connect().await.unwrap();

        assert_eq!(p.client_transport.sent.get(), 2, "{version:?}");
        assert_eq!(p.server_transport.sent.get(), 2, "{version:?}");
        assert_eq!(p.client.state(), ConnectionState::Active);
        assert_eq!(p.server.state(), ConnectionState::Active);
        assert_eq!(p.client.with_engine(|c| c.version()), version);
    }
}

#[tokio::test]
async fn connects_with_chacha20() {
    let config = ConnectionConfig {
        cipher_suites: vec![CipherSuite::ChaCha20Poly1305Sha256],
        ..config(Version::V1)
    };
    let p = pair_with(config.clone(), config);
    p.client.connect().await.unwrap();
}

#[tokio::test]
async fn negotiates_alpn() {
    let client_config = ConnectionConfig {
        alpn_protocols: vec!["h3".to_string(), "hq-interop".to_string()],
        ..config(Version::V1)
    };
    let p = pair_with(client_config, config(Version::V1));
    p.client.connect().await.unwrap();
    let agreed = |conn: &QuicConnection| conn.with_engine(|c| c.alpn_protocol().map(<[u8]>::to_vec));
    assert_eq!(agreed(&p.client), Some(b"hq-interop".to_vec()));
    assert_eq!(agreed(&p.server), Some(b"hq-interop".to_vec()));
}

#[tokio::test]
async fn connects_by_ip_address() {
    let client_config = ConnectionConfig {
        server_name: "127.0.0.1".to_string(),
        ..config(Version::V1)
    };
    let p = pair_with(client_config, config(Version::V1));
    p.client.connect().await.unwrap();
}

#[tokio::test]
async fn untrusted_certificate_fails_the_handshake() {
    let client_config = ConnectionConfig {
        ca_file: Some(cert_path("other-ca.pem")),
        ..config(Version::V1)
    };
    let p = pair_with(client_config, config(Version::V1));
    let err = p.client.connect().await.unwrap_err();
    // unknown_ca
    assert_eq!(crypto_error_code(&err), Some(0x100 + 48));
    assert_eq!(p.client.state(), ConnectionState::Closed);
    assert_eq!(p.server.state(), ConnectionState::Closed);
    assert!(p.server.connect().await.is_err());
}

#[tokio::test]
async fn wrong_server_name_fails_the_handshake() {
    let client_config = ConnectionConfig {
        server_name: "quic.example".to_string(),
        ..config(Version::V1)
    };
    let p = pair_with(client_config, config(Version::V1));
    let err = p.client.connect().await.unwrap_err();
    // bad_certificate
    assert_eq!(crypto_error_code(&err), Some(0x100 + 42));
}

#[tokio::test]
async fn stream_round_trip() {
    for version in VERSIONS {
        let p = pair(version);
        p.client.connect().await.unwrap();

        let (reader, writer) = p.client.create_stream(false).unwrap();
        assert_eq!(writer.stream_id(), StreamId::new(0));
        writer.write(b"ping").unwrap();
        // One STREAM datagram, one ACK back
        assert_eq!(p.client_transport.sent.get(), 3);
        assert_eq!(p.server_transport.sent.get(), 3);
        writer.write_eof().unwrap();
        assert_eq!(p.client_transport.sent.get(), 4);
        assert_eq!(p.server_transport.sent.get(), 4);

        let (server_reader, server_writer) = p.server.accept_stream().await.unwrap();
        assert_eq!(server_reader.stream_id(), StreamId::new(0));
        assert_eq!(&server_reader.read(None).await.unwrap()[..], b"ping");
        assert!(server_reader.read(Some(10)).await.unwrap().is_empty());

        server_writer.write(b"pong").unwrap();
        server_writer.write_eof().unwrap();
        assert_eq!(&reader.read(None).await.unwrap()[..], b"pong");
    }
}

#[tokio::test]
async fn bounded_reads_split_data() {
    let p = pair(Version::V1);
    p.client.connect().await.unwrap();

    let (_, writer) = p.client.create_stream(true).unwrap();
    assert_eq!(writer.stream_id(), StreamId::new(2));
    writer.write(b"abcdef").unwrap();
    writer.write_eof().unwrap();

    let (reader, _) = p.server.accept_stream().await.unwrap();
    assert_eq!(&reader.read(Some(4)).await.unwrap()[..], b"abcd");
    assert_eq!(&reader.read(Some(4)).await.unwrap()[..], b"ef");
    assert!(reader.read(Some(4)).await.unwrap().is_empty());
}

#[tokio::test]
async fn read_resolves_when_data_arrives() {
    let p = pair(Version::V1);
    p.client.connect().await.unwrap();

    let (_, writer) = p.client.create_stream(false).unwrap();
    writer.write(b"hello").unwrap();
    let (reader, _) = p.server.accept_stream().await.unwrap();

    let (read, written) = tokio::join!(reader.read(None), async {
        writer.write(b" world")?;
        writer.write_eof()
    });
    written.unwrap();
    assert_eq!(&read.unwrap()[..], b"hello world");
}

#[tokio::test]
async fn dropped_read_keeps_buffered_data() {
    let p = pair(Version::V1);
    p.client.connect().await.unwrap();

    let (_, writer) = p.client.create_stream(false).unwrap();
    writer.write(b"kept").unwrap();
    let (reader, _) = p.server.accept_stream().await.unwrap();

    // A whole-stream read cannot finish without FIN; abandon it
    let pending = tokio::time::timeout(std::time::Duration::from_millis(10), reader.read(None)).await;
    assert!(pending.is_err());

    writer.write_eof().unwrap();
    assert_eq!(&reader.read(None).await.unwrap()[..], b"kept");
}

#[tokio::test]
async fn stream_ids_follow_role_and_direction() {
    let p = pair(Version::V1);
    p.client.connect().await.unwrap();

    let ids = |conn: &QuicConnection| -> Vec<u64> {
        [false, false, true, true]
            .into_iter()
            .map(|uni| conn.create_stream(uni).unwrap().1.stream_id().value())
            .collect()
    };
    assert_eq!(ids(&p.client), vec![0, 4, 2, 6]);
    assert_eq!(ids(&p.server), vec![1, 5, 3, 7]);
}

#[tokio::test]
async fn key_logs_are_identical() {
    for version in VERSIONS {
        let (client_log, server_log) = (SharedLog::default(), SharedLog::default());
        let client = QuicConnection::client(config(version))
            .unwrap()
            .with_secrets_log(client_log.clone());
        let server = QuicConnection::server(config(version), identity())
            .unwrap()
            .with_secrets_log(server_log.clone());
        let p = start(client, server);
        p.client.connect().await.unwrap();

        let log = client_log.contents();
        assert_eq!(log, server_log.contents());
        let labels: Vec<&str> = log.lines().filter_map(|line| line.split(' ').next()).collect();
        assert_eq!(
            labels,
            [
                "QUIC_SERVER_HANDSHAKE_TRAFFIC_SECRET",
                "QUIC_CLIENT_HANDSHAKE_TRAFFIC_SECRET",
                "QUIC_SERVER_TRAFFIC_SECRET_0",
                "QUIC_CLIENT_TRAFFIC_SECRET_0",
            ],
            "{version:?}"
        );
        for line in log.lines() {
            let fields: Vec<&str> = line.split(' ').collect();
            assert_eq!(fields.len(), 3);
            assert_eq!(fields[1].len(), 64);
            assert_eq!(fields[2].len(), 64);
        }
    }
}

#[tokio::test]
async fn close_sends_one_datagram() {
    for version in VERSIONS {
        let p = pair(version);
        p.client.connect().await.unwrap();
        let (reader, _) = p.client.create_stream(false).unwrap();

        p.client.close(0, None, "done");
        assert_eq!(p.client_transport.sent.get(), 3);
        assert_eq!(p.server_transport.sent.get(), 2);
        assert_eq!(p.client.state(), ConnectionState::Closed);
        assert_eq!(p.server.state(), ConnectionState::Closed);

        p.client.close(0, None, "again");
        assert_eq!(p.client_transport.sent.get(), 3);
        assert_eq!(reader.read(None).await, Err(Error::ConnectionClosed));
    }
}

#[tokio::test]
async fn transport_close_reaches_peer() {
    let p = pair(Version::V2);
    p.client.connect().await.unwrap();

    p.server.close(0x0a, Some(0x08), "protocol violation");
    let error = p.client.with_engine(|c| c.error().cloned());
    match error {
        Some(Error::Transport(err)) => {
            assert_eq!(err.error_code, 0x0a);
            assert_eq!(err.frame_type, Some(0x08));
            assert_eq!(err.reason, "protocol violation");
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn corrupted_key_close_is_invisible_to_peer() {
    for version in VERSIONS {
        let p = pair(version);
        p.client.connect().await.unwrap();

        let (bogus, _) = PacketKey::initial(version, &[0u8; 8], Side::Server).unwrap();
        p.server.with_engine(|c| c.crypto_mut(Epoch::OneRtt).install_send(bogus));
        p.server.close(0, None, "");

        assert_eq!(p.server.state(), ConnectionState::Closed);
        assert_eq!(p.server_transport.sent.get(), 3);
        assert_eq!(p.client.state(), ConnectionState::Active);
        assert_eq!(p.client_transport.sent.get(), 2);
        assert_eq!(p.client.stats().packets_dropped, 1);
    }
}

#[tokio::test]
async fn handshake_through_retry() {
    for version in VERSIONS {
        let server_config = ConnectionConfig {
            require_retry: true,
            ..config(version)
        };
        let p = pair_with(config(version), server_config);
        p.client.connect().await.unwrap();

        assert_eq!(p.client_transport.sent.get(), 3);
        assert_eq!(p.server_transport.sent.get(), 3);
        let server_cid = p.server.with_engine(|c| c.host_cid().clone());
        assert_eq!(p.client.with_engine(|c| c.peer_cid().clone()), server_cid);
    }
}

#[tokio::test]
async fn client_follows_crafted_retry_once() {
    for version in VERSIONS {
        let (client, transport) = lonely_client(config(version));
        assert_eq!(transport.sent.get(), 1);

        let (host_cid, original_dcid) = client.with_engine(|c| (c.host_cid().clone(), c.peer_cid().clone()));
        let retry_scid = ConnectionId::random(8);
        let retry = encode_retry(version, &host_cid, &retry_scid, &original_dcid, b"opaque token").unwrap();

        client.datagram_received(&retry);
        assert_eq!(transport.sent.get(), 2);
        assert_eq!(client.with_engine(|c| c.peer_cid().clone()), retry_scid);

        // At most one Retry per connection attempt
        client.datagram_received(&retry);
        assert_eq!(transport.sent.get(), 2);
    }
}

#[tokio::test]
async fn client_follows_crafted_version_negotiation() {
    let (client, transport) = lonely_client(config(Version::V1).with_versions(&[Version::V1, Version::V2]));
    assert_eq!(transport.sent.get(), 1);

    let (host_cid, peer_cid) = client.with_engine(|c| (c.host_cid().clone(), c.peer_cid().clone()));
    let vn = encode_version_negotiation(peer_cid.as_bytes(), host_cid.as_bytes(), &[0x0a1a_2a3a, Version::V2.wire()]);
    client.datagram_received(&vn);

    assert_eq!(transport.sent.get(), 2);
    assert_eq!(client.with_engine(|c| c.version()), Version::V2);
}

#[tokio::test]
async fn version_negotiation_without_common_version_fails() {
    let (client, transport) = lonely_client(config(Version::V1));

    let (host_cid, peer_cid) = client.with_engine(|c| (c.host_cid().clone(), c.peer_cid().clone()));
    let vn = encode_version_negotiation(peer_cid.as_bytes(), host_cid.as_bytes(), &[Version::Draft29.wire()]);
    client.datagram_received(&vn);

    assert_eq!(transport.sent.get(), 1);
    assert_eq!(client.state(), ConnectionState::Closed);
    assert_eq!(client.connect().await, Err(Error::VersionNegotiationFailed));
}

#[tokio::test]
async fn negotiates_down_to_server_version() {
    let client_config = config(Version::V1).with_versions(&[Version::V1, Version::V2]);
    let p = pair_with(client_config, config(Version::V2));
    p.client.connect().await.unwrap();

    assert_eq!(p.client.with_engine(|c| c.version()), Version::V2);
    assert_eq!(p.client_transport.sent.get(), 3);
    assert_eq!(p.server_transport.sent.get(), 3);
}

#[tokio::test]
async fn unknown_stream_is_reported() {
    let p = pair(Version::V1);
    p.client.connect().await.unwrap();
    assert!(matches!(p.client.stream(StreamId::new(8)), Err(Error::StreamNotFound(8))));
}

/// Collects datagrams until the test moves them.
#[derive(Default)]
struct QueuedTransport {
    queue: RefCell<VecDeque<Bytes>>,
}

impl DatagramSender for QueuedTransport {
    fn send_datagram(&self, datagram: Bytes) {
        self.queue.borrow_mut().push_back(datagram);
    }
}

struct QueuedPair {
    client: QuicConnection,
    server: QuicConnection,
    client_out: Rc<QueuedTransport>,
    server_out: Rc<QueuedTransport>,
}

impl QueuedPair {
    async fn connected(client_config: ConnectionConfig, server_config: ConnectionConfig) -> Self {
        init_tracing();
        let p = Self {
            client: QuicConnection::client(client_config).unwrap(),
            server: QuicConnection::server(server_config, identity()).unwrap(),
            client_out: Rc::default(),
            server_out: Rc::default(),
        };
        p.server.connection_made(p.server_out.clone());
        p.client.connection_made(p.client_out.clone());
        p.shuttle();
        p.client.connect().await.unwrap();
        p
    }

    /// Deliver queued datagrams both ways until neither side sends more.
    fn shuttle(&self) {
        loop {
            let to_server = self.client_out.queue.borrow_mut().pop_front();
            if let Some(datagram) = &to_server {
                self.server.datagram_received(datagram);
            }
            let to_client = self.server_out.queue.borrow_mut().pop_front();
            if let Some(datagram) = &to_client {
                self.client.datagram_received(datagram);
            }
            if to_server.is_none() && to_client.is_none() {
                break;
            }
        }
    }
}

/// Writes larger than the peer's stream window wait for credit instead of
/// breaking the connection, and arrive intact once the reader drains them.
#[tokio::test]
async fn write_beyond_receive_window_is_paced() {
    const LEN: usize = 2 << 20;
    let p = QueuedPair::connected(config(Version::V1), config(Version::V1)).await;

    let (_, writer) = p.client.create_stream(false).unwrap();
    writer.write(&[7u8; LEN]).unwrap();
    writer.write_eof().unwrap();
    p.shuttle();
    assert_eq!(p.client.state(), ConnectionState::Active);
    assert_eq!(p.server.state(), ConnectionState::Active);

    let (reader, _) = p.server.accept_stream().await.unwrap();
    let first = reader.read(Some(usize::MAX)).await.unwrap();
    // Exactly the advertised stream window made it across
    assert_eq!(first.len(), 1 << 20);

    let mut total = first.len();
    loop {
        p.shuttle();
        let chunk = tokio::time::timeout(Duration::from_secs(5), reader.read(Some(usize::MAX)))
            .await
            .expect("transfer stalled")
            .unwrap();
        if chunk.is_empty() {
            break;
        }
        assert!(chunk.iter().all(|b| *b == 7));
        total += chunk.len();
    }
    assert_eq!(total, LEN);
    assert_eq!(p.client.state(), ConnectionState::Active);
    assert_eq!(p.server.state(), ConnectionState::Active);
}

#[tokio::test]
async fn several_streams_share_connection_credit() {
    let small = |version| ConnectionConfig {
        initial_max_data: 256 * 1024,
        initial_max_stream_data: 64 * 1024,
        ..config(version)
    };
    let p = QueuedPair::connected(small(Version::V2), small(Version::V2)).await;

    let payloads: Vec<Vec<u8>> = (0..4u8).map(|n| vec![n; 300 * 1024]).collect();
    for payload in &payloads {
        let (_, writer) = p.client.create_stream(true).unwrap();
        writer.write(payload).unwrap();
        writer.write_eof().unwrap();
    }
    p.shuttle();

    let mut readers = Vec::new();
    for _ in &payloads {
        readers.push(p.server.accept_stream().await.unwrap().0);
    }
    // Whole-stream reads keep credit flowing while they wait
    let reads = futures_util::future::join_all(readers.iter().map(|reader| reader.read(None)));
    let shuttling = async {
        for _ in 0..10_000 {
            p.shuttle();
            tokio::task::yield_now().await;
        }
    };
    let received = tokio::select! {
        received = reads => received,
        _ = shuttling => panic!("transfer stalled"),
    };
    for (data, payload) in received.into_iter().zip(&payloads) {
        assert_eq!(&data.unwrap()[..], &payload[..]);
    }
}
