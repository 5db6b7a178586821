//! Benchmarks for packet protection hot paths.
//!
//! These benchmarks measure:
//! - Sealing a 1-RTT packet (AEAD plus header protection)
//! - Opening the same packet
//! - Initial key derivation from a client DCID
//!
//! Run with: cargo bench -p quicd-engine --bench packet_protection

use bytes::BytesMut;
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use quicd_engine::crypto::{CipherSuite, CryptoContext, PacketKey};
use quicd_engine::packet::{open_packet, seal_packet, write_short_header};
use quicd_engine::{ConnectionId, Epoch, Side, Version};

const PAYLOAD_LEN: usize = 1100;

/// One direction key; the benches seal and open with the same instance.
fn key(suite: CipherSuite) -> PacketKey {
    PacketKey::derive(suite, Version::V1, &[0x42; 8], Side::Client).unwrap().0
}

fn header(dcid: &ConnectionId, pn: u64) -> (BytesMut, usize) {
    let mut buf = BytesMut::new();
    let pn_offset = write_short_header(&mut buf, dcid, pn, 2);
    (buf, pn_offset)
}

fn bench_seal(c: &mut Criterion) {
    let mut group = c.benchmark_group("seal_packet");
    group.throughput(Throughput::Bytes(PAYLOAD_LEN as u64));
    let dcid = ConnectionId::random(8);
    let payload = vec![0xab; PAYLOAD_LEN];

    for (name, suite) in [
        ("aes128gcm", CipherSuite::Aes128GcmSha256),
        ("chacha20poly1305", CipherSuite::ChaCha20Poly1305Sha256),
    ] {
        let key = key(suite);
        group.bench_function(name, |b| {
            let mut pn = 0u64;
            b.iter(|| {
                let (hdr, pn_offset) = header(&dcid, pn);
                let packet = seal_packet(&key, pn, &hdr, pn_offset, black_box(&payload)).unwrap();
                pn += 1;
                packet
            })
        });
    }

    group.finish();
}

fn bench_open(c: &mut Criterion) {
    let mut group = c.benchmark_group("open_packet");
    group.throughput(Throughput::Bytes(PAYLOAD_LEN as u64));
    let dcid = ConnectionId::random(8);
    let payload = vec![0xab; PAYLOAD_LEN];

    for (name, suite) in [
        ("aes128gcm", CipherSuite::Aes128GcmSha256),
        ("chacha20poly1305", CipherSuite::ChaCha20Poly1305Sha256),
    ] {
        let key = key(suite);
        let (hdr, pn_offset) = header(&dcid, 7);
        let packet = seal_packet(&key, 7, &hdr, pn_offset, &payload).unwrap();
        group.bench_function(name, |b| {
            b.iter(|| open_packet(&key, black_box(&packet), pn_offset, Some(6)).unwrap())
        });
    }

    group.finish();
}

fn bench_initial_keys(c: &mut Criterion) {
    let mut group = c.benchmark_group("initial_keys");
    group.throughput(Throughput::Elements(1));
    let dcid = ConnectionId::random(8);

    group.bench_function("setup_initial", |b| {
        b.iter(|| {
            let mut ctx = CryptoContext::new(Epoch::Initial);
            ctx.setup_initial(Version::V1, Side::Client, black_box(dcid.as_bytes())).unwrap();
            ctx
        })
    });

    group.finish();
}

criterion_group!(benches, bench_seal, bench_open, bench_initial_keys);
criterion_main!(benches);
