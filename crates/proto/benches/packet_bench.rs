//! SSH Packet Benchmarks
//!
//! Benchmarks for message encoding, packet framing, and encrypted
//! packetizer throughput.
//!
//! Run with: `cargo bench --bench packet_bench`

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use kestrel_proto::ssh::crypto::{
    CipherAlgorithm, CipherDirection, MacAlgorithm, MacKey, PacketCipher,
};
use kestrel_proto::ssh::message::{Message, MessageType};
use kestrel_proto::ssh::packet::{BufferedStream, Packet, Packetizer, RekeyLimits};
use std::time::Duration;

/// Builds a CHANNEL_DATA message carrying `len` bytes
fn channel_data(len: usize) -> Message {
    let mut m = Message::with_type(MessageType::ChannelData);
    m.add_int(0).add_string(vec![0x5a; len]);
    m
}

/// Sender and receiver packetizers sharing one key set
fn encrypted_pair(
    cipher: CipherAlgorithm,
    mac: MacAlgorithm,
) -> (Packetizer<BufferedStream>, Packetizer<BufferedStream>) {
    let key = vec![0x42u8; cipher.key_size()];
    let iv = vec![0x24u8; cipher.iv_size()];
    let mac_key = vec![0x17u8; mac.key_size()];

    // long runs would otherwise trip the rekey limits
    let unlimited = RekeyLimits {
        packets: u64::MAX,
        bytes: u64::MAX,
        packets_overflow_max: u64::MAX,
        bytes_overflow_max: u64::MAX,
    };
    let mut tx = Packetizer::new(BufferedStream::new());
    let mut rx = Packetizer::new(BufferedStream::new());
    tx.set_rekey_limits(unlimited);
    rx.set_rekey_limits(unlimited);
    tx.set_outbound_cipher(
        PacketCipher::new(cipher, &key, &iv, CipherDirection::Encrypt).unwrap(),
        MacKey::new(mac, &mac_key).unwrap(),
    );
    rx.set_inbound_cipher(
        PacketCipher::new(cipher, &key, &iv, CipherDirection::Decrypt).unwrap(),
        MacKey::new(mac, &mac_key).unwrap(),
    );
    (tx, rx)
}

fn bench_message_encoding(c: &mut Criterion) {
    let mut group = c.benchmark_group("message");

    group.bench_function("encode_channel_request", |b| {
        b.iter(|| {
            let mut m = Message::with_type(MessageType::ChannelRequest);
            m.add_int(black_box(7))
                .add_string("exec")
                .add_boolean(true)
                .add_string(black_box("ls -la /tmp"));
            black_box(m)
        });
    });

    group.bench_function("decode_channel_request", |b| {
        let mut m = Message::with_type(MessageType::ChannelRequest);
        m.add_int(7).add_string("exec").add_boolean(true).add_string("ls -la /tmp");
        let bytes = m.as_bytes().to_vec();
        b.iter(|| {
            let mut m = Message::from_bytes(black_box(&bytes));
            m.get_byte().unwrap();
            m.get_int().unwrap();
            black_box(m.get_text().unwrap());
            m.get_boolean().unwrap();
            black_box(m.get_string().unwrap())
        });
    });

    group.finish();
}

fn bench_packet_framing(c: &mut Criterion) {
    let mut group = c.benchmark_group("packet_framing");

    for size in [64usize, 1024, 32768] {
        let payload = vec![0xabu8; size];
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_function(format!("frame_{}bytes", size), |b| {
            b.iter(|| black_box(Packet::new(black_box(payload.clone())).to_bytes()));
        });

        let wire = Packet::new(payload.clone()).to_bytes();
        group.bench_function(format!("parse_{}bytes", size), |b| {
            b.iter(|| black_box(Packet::from_bytes(black_box(&wire)).unwrap()));
        });
    }

    group.finish();
}

fn bench_encrypted_roundtrip(c: &mut Criterion) {
    let mut group = c.benchmark_group("packetizer");
    group.measurement_time(Duration::from_secs(5));

    let suites = [
        (CipherAlgorithm::Aes128Ctr, MacAlgorithm::HmacSha256),
        (CipherAlgorithm::Aes256Ctr, MacAlgorithm::HmacSha512),
        (CipherAlgorithm::Aes128Cbc, MacAlgorithm::HmacSha1),
    ];

    for (cipher, mac) in suites {
        let (mut tx, mut rx) = encrypted_pair(cipher, mac);
        let msg = channel_data(16 * 1024);
        group.throughput(Throughput::Bytes(16 * 1024));
        group.bench_function(format!("{}+{}_16k", cipher.name(), mac.name()), |b| {
            b.iter(|| {
                tx.send_message(&msg).unwrap();
                let wire = tx.stream_mut().take_written();
                rx.stream_mut().feed(&wire);
                black_box(rx.read_message().unwrap())
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_message_encoding,
    bench_packet_framing,
    bench_encrypted_roundtrip
);
criterion_main!(benches);
