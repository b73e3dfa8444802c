use criterion::{black_box, criterion_group, criterion_main, Criterion};
use rustls::server::ResolvesServerCert;
use rustls::sign::CertifiedKey;
use rustls::ServerConfig;

use portcullis::sni::{CertCrypto, SslContextEntry, SslContextRegistry};

#[derive(Debug)]
struct EmptyResolver;
impl ResolvesServerCert for EmptyResolver {
    fn resolve(&self, _: rustls::server::ClientHello) -> Option<std::sync::Arc<CertifiedKey>> {
        None
    }
}

fn dummy_entry() -> SslContextEntry {
    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_cert_resolver(std::sync::Arc::new(EmptyResolver));
    SslContextEntry {
        server_config: std::sync::Arc::new(config),
        crypto: CertCrypto::BestAvailable,
    }
}

fn registry_with(n: usize) -> SslContextRegistry {
    let mut reg = SslContextRegistry::new();
    for i in 0..n {
        reg.insert(&format!("host-{i}.example.com"), CertCrypto::BestAvailable, dummy_entry(), false);
    }
    reg.insert("*.wild.example.com", CertCrypto::BestAvailable, dummy_entry(), false);
    reg.insert("default.example.com", CertCrypto::BestAvailable, dummy_entry(), true);
    reg
}

fn bench_sni_lookup(c: &mut Criterion) {
    let reg = registry_with(1000);

    c.bench_function("sni_lookup_exact", |b| {
        b.iter(|| reg.lookup(black_box(Some("host-500.example.com")), CertCrypto::BestAvailable))
    });

    c.bench_function("sni_lookup_wildcard", |b| {
        b.iter(|| reg.lookup(black_box(Some("anything.wild.example.com")), CertCrypto::BestAvailable))
    });

    c.bench_function("sni_lookup_default_fallthrough", |b| {
        b.iter(|| reg.lookup(black_box(Some("totally-unmatched.other.net")), CertCrypto::BestAvailable))
    });
}

criterion_group!(benches, bench_sni_lookup);
criterion_main!(benches);
