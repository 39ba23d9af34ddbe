use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use streamcarrier::{FixedMagicProvider, RawAeadSessionKey, SessionKey, StreamCodec};

fn make_key(capacity: usize) -> RawAeadSessionKey {
    RawAeadSessionKey::new(&[9u8; 32], capacity).expect("valid key")
}

/// Single-packet encode/decode throughput at a capacity large enough that
/// every size tested stays unfragmented.
fn bench_codec_round_trip(c: &mut Criterion) {
    let mut group = c.benchmark_group("codec_round_trip");

    for size in [64usize, 1024, 16 * 1024, 256 * 1024].iter() {
        group.throughput(Throughput::Bytes(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            let key = make_key(1024 * 1024);
            let payload = vec![0xABu8; size];
            b.iter(|| {
                let mut sender = StreamCodec::new(Arc::new(FixedMagicProvider));
                let frames = sender
                    .encode_write(&key as &dyn SessionKey, b'A', 0x01, 0x01, black_box(&payload))
                    .unwrap();
                let wire: Vec<u8> = frames.concat();

                let mut receiver = StreamCodec::new(Arc::new(FixedMagicProvider));
                receiver.feed(&wire);
                black_box(receiver.poll(&key as &dyn SessionKey))
            });
        });
    }

    group.finish();
}

/// Fragmentation overhead: same payload sizes, but capacity forces the
/// codec to split each write into multiple frames.
fn bench_codec_fragmented_round_trip(c: &mut Criterion) {
    let mut group = c.benchmark_group("codec_fragmented_round_trip");

    for size in [4096usize, 64 * 1024, 512 * 1024].iter() {
        group.throughput(Throughput::Bytes(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            let key = make_key(512);
            let payload = vec![0xCDu8; size];
            b.iter(|| {
                let mut sender = StreamCodec::new(Arc::new(FixedMagicProvider));
                let frames = sender
                    .encode_write(&key as &dyn SessionKey, b'A', 0x01, 0x01, black_box(&payload))
                    .unwrap();
                let wire: Vec<u8> = frames.concat();

                let mut receiver = StreamCodec::new(Arc::new(FixedMagicProvider));
                receiver.feed(&wire);
                black_box(receiver.poll(&key as &dyn SessionKey))
            });
        });
    }

    group.finish();
}

/// Raw AEAD encrypt/decrypt cost in isolation, independent of framing.
fn bench_session_key_encrypt_decrypt(c: &mut Criterion) {
    let mut group = c.benchmark_group("session_key_aead");

    for size in [64usize, 1024, 64 * 1024].iter() {
        group.throughput(Throughput::Bytes(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            let key = make_key(usize::MAX / 2);
            let payload = vec![0x11u8; size];
            b.iter(|| {
                let ciphertext = key.encrypt(black_box(&payload)).unwrap();
                black_box(key.decrypt(&ciphertext).unwrap())
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_codec_round_trip,
    bench_codec_fragmented_round_trip,
    bench_session_key_encrypt_decrypt
);
criterion_main!(benches);
