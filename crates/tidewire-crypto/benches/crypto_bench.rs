//! Benchmarks for Tidewire cryptographic operations

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use tidewire_crypto::{
    aead,
    identity::IdentityKeyPair,
    kdf::{kdf_chain_step, kdf_root_chain, SymmetricKey},
    keys::KeyPair,
    ratchet::{RatchetLimits, RatchetSession},
    x3dh::{HandshakeEngine, PreKeyManager},
};

fn session_pair() -> (RatchetSession, RatchetSession) {
    let alice_identity = IdentityKeyPair::generate();
    let mut bob_prekeys = PreKeyManager::new(IdentityKeyPair::generate());
    let (alice, init) = HandshakeEngine::initiate(
        &alice_identity,
        &bob_prekeys.get_bundle(),
        RatchetLimits::default(),
    )
    .unwrap();
    let bob = HandshakeEngine::respond(&mut bob_prekeys, &init, RatchetLimits::default()).unwrap();
    (alice, bob)
}

fn bench_diffie_hellman(c: &mut Criterion) {
    let alice = KeyPair::generate();
    let bob = KeyPair::generate();

    c.bench_function("x25519_dh", |b| {
        b.iter(|| black_box(alice.dh(&bob.public_key())))
    });
}

fn bench_kdf(c: &mut Criterion) {
    let mut group = c.benchmark_group("KDF");
    let key = SymmetricKey::from_bytes([0x42u8; 32]);

    group.bench_function("root_chain", |b| {
        b.iter(|| black_box(kdf_root_chain(&key, &[0x07u8; 32]).unwrap()))
    });
    group.bench_function("chain_step", |b| b.iter(|| black_box(kdf_chain_step(&key))));

    group.finish();
}

fn bench_aead(c: &mut Criterion) {
    let mut group = c.benchmark_group("AEAD");
    let key = SymmetricKey::from_bytes([0x42u8; 32]);
    let ad = [0u8; 40];

    for size in [64usize, 1024, 16384].iter() {
        let plaintext = vec![0x42u8; *size];
        let ciphertext = aead::encrypt(&key, &plaintext, &ad).unwrap();
        group.throughput(Throughput::Bytes(*size as u64));

        group.bench_with_input(BenchmarkId::new("encrypt", size), &plaintext, |b, pt| {
            b.iter(|| black_box(aead::encrypt(&key, pt, &ad).unwrap()))
        });
        group.bench_with_input(BenchmarkId::new("decrypt", size), &ciphertext, |b, ct| {
            b.iter(|| black_box(aead::decrypt(&key, ct, &ad).unwrap()))
        });
    }

    group.finish();
}

fn bench_handshake(c: &mut Criterion) {
    c.bench_function("x3dh_full", |b| b.iter(|| black_box(session_pair())));
}

fn bench_ratchet(c: &mut Criterion) {
    let mut group = c.benchmark_group("Ratchet");

    for size in [64usize, 1024, 16384].iter() {
        let plaintext = vec![0x42u8; *size];
        group.throughput(Throughput::Bytes(*size as u64));

        group.bench_with_input(BenchmarkId::new("encrypt_decrypt", size), &plaintext, |b, pt| {
            let (mut alice, mut bob) = session_pair();
            b.iter(|| {
                let message = alice.encrypt(pt).unwrap();
                black_box(bob.decrypt(&message).unwrap())
            })
        });
    }

    group.bench_function("ping_pong_dh_step", |b| {
        let (mut alice, mut bob) = session_pair();
        b.iter(|| {
            let message = alice.encrypt(b"ping").unwrap();
            bob.decrypt(&message).unwrap();
            let reply = bob.encrypt(b"pong").unwrap();
            black_box(alice.decrypt(&reply).unwrap())
        })
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_diffie_hellman,
    bench_kdf,
    bench_aead,
    bench_handshake,
    bench_ratchet,
);
criterion_main!(benches);
