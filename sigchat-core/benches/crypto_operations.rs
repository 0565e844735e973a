use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use sigchat_core::crypto::{
    create_message_hash, derive_key_pair, sign_envelope_at, verify_with_key, EcJwk, KeyResolutionError,
    KeySource, PublicKeyCache, Verifier,
};
use std::sync::Arc;
use std::time::Duration;

const TIMESTAMP: &str = "2025-01-01T12:00:00.000Z";

fn bench_key_derivation(c: &mut Criterion) {
    let mut group = c.benchmark_group("crypto_key_derivation");

    group.bench_function("derive_key_pair", |b| {
        b.iter(|| derive_key_pair(black_box("alice"), black_box("correct horse battery staple")))
    });

    for batch_size in [10, 100].iter() {
        group.throughput(Throughput::Elements(*batch_size as u64));
        group.bench_with_input(BenchmarkId::new("batch", batch_size), batch_size, |b, &n| {
            b.iter(|| {
                let keys: Vec<_> = (0..n)
                    .map(|i| derive_key_pair(&format!("user{}", i), "pw"))
                    .collect();
                black_box(keys)
            });
        });
    }

    group.finish();
}

fn bench_message_hash(c: &mut Criterion) {
    let mut group = c.benchmark_group("crypto_message_hash");

    for size in [32, 256, 1024, 4096].iter() {
        let text = "x".repeat(*size);
        group.throughput(Throughput::Bytes(*size as u64));
        group.bench_with_input(BenchmarkId::new("message_size", size), &text, |b, text| {
            b.iter(|| create_message_hash("alice", "bob", black_box(text), TIMESTAMP))
        });
    }

    group.finish();
}

fn bench_signing(c: &mut Criterion) {
    let mut group = c.benchmark_group("crypto_signing");
    let kp = derive_key_pair("alice", "pw").expect("derive");

    for size in [32, 1024, 16384].iter() {
        let text = "x".repeat(*size);
        group.throughput(Throughput::Bytes(*size as u64));
        group.bench_with_input(BenchmarkId::new("message_size", size), &text, |b, text| {
            b.iter(|| sign_envelope_at("alice", "bob", black_box(text), TIMESTAMP, &kp.private_key))
        });
    }

    group.finish();
}

fn bench_verification(c: &mut Criterion) {
    let mut group = c.benchmark_group("crypto_verification");
    let kp = derive_key_pair("alice", "pw").expect("derive");

    for size in [32, 1024, 16384].iter() {
        let text = "x".repeat(*size);
        let envelope = sign_envelope_at("alice", "bob", &text, TIMESTAMP, &kp.private_key).expect("sign");
        group.throughput(Throughput::Bytes(*size as u64));
        group.bench_with_input(BenchmarkId::new("message_size", size), &envelope, |b, env| {
            b.iter(|| verify_with_key(black_box(env), &kp.public_key))
        });
    }

    group.finish();
}

struct StaticSource(EcJwk);

#[async_trait::async_trait]
impl KeySource for StaticSource {
    async fn fetch_public_key(&self, _username: &str) -> Result<EcJwk, KeyResolutionError> {
        Ok(self.0.clone())
    }
}

fn bench_cached_verifier(c: &mut Criterion) {
    let mut group = c.benchmark_group("crypto_verifier");
    group.measurement_time(Duration::from_secs(10));

    let runtime = tokio::runtime::Runtime::new().expect("runtime");
    let kp = derive_key_pair("alice", "pw").expect("derive");
    let envelope = sign_envelope_at("alice", "bob", "hello", TIMESTAMP, &kp.private_key).expect("sign");
    let verifier = Verifier::new(
        Arc::new(StaticSource(kp.public_key.clone())),
        Arc::new(PublicKeyCache::default()),
    );

    group.bench_function("cached_key", |b| {
        b.iter(|| runtime.block_on(verifier.verify(black_box(&envelope), false)))
    });
    group.bench_function("forced_refresh", |b| {
        b.iter(|| runtime.block_on(verifier.verify(black_box(&envelope), true)))
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_key_derivation,
    bench_message_hash,
    bench_signing,
    bench_verification,
    bench_cached_verifier,
);
criterion_main!(benches);
