//! SNI-keyed TLS context selection.
//!
//! A hot path at handshake time: case-insensitive exact match first, then a
//! one-level-up wildcard match only (`*.foo.com` matches `bar.foo.com` but
//! not `baz.bar.foo.com`). Deliberately not general suffix matching — see
//! the design note on this in the expanded spec.

use std::collections::HashMap;

use crate::config::SslContextConfig;

/// Crypto strength required of the selected certificate. A lookup for
/// `BestAvailable` falls back across strengths; a lookup for a specific
/// strength only matches a context registered at exactly that strength.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CertCrypto {
    BestAvailable,
    Sha1Signature,
}

/// A domain name wrapped for case-insensitive equality and hashing, so
/// `"Foo.Com"` and `"foo.com"` collide in the registry's map.
#[derive(Debug, Clone)]
pub struct DnString(String);

impl DnString {
    pub fn new(s: impl Into<String>) -> Self {
        DnString(s.into())
    }
}

impl PartialEq for DnString {
    fn eq(&self, other: &Self) -> bool {
        self.0.eq_ignore_ascii_case(&other.0)
    }
}
impl Eq for DnString {}

impl std::hash::Hash for DnString {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        for b in self.0.bytes() {
            b.to_ascii_lowercase().hash(state);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct SslContextKey {
    dn: DnString,
    crypto: CertCrypto,
}

/// A built TLS server context plus the crypto strength it was registered at.
/// The real certificate/key material loading is out of scope (§1); this
/// struct is the seam the Acceptor hangs a `rustls::ServerConfig` off of.
#[derive(Clone)]
pub struct SslContextEntry {
    pub server_config: std::sync::Arc<rustls::ServerConfig>,
    pub crypto: CertCrypto,
}

/// Registry of TLS contexts keyed by domain + crypto strength, plus the
/// context used when SNI is absent or unmatched.
#[derive(Clone, Default)]
pub struct SslContextRegistry {
    by_key: HashMap<SslContextKey, SslContextEntry>,
    default: Option<SslContextEntry>,
}

impl SslContextRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, domain: &str, crypto: CertCrypto, entry: SslContextEntry, is_default: bool) {
        if is_default {
            self.default = Some(entry.clone());
        }
        self.by_key.insert(
            SslContextKey {
                dn: DnString::new(domain),
                crypto,
            },
            entry,
        );
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty() && self.default.is_none()
    }

    pub fn has_default(&self) -> bool {
        self.default.is_some()
    }

    /// Looks up a server name: exact match, then one-level-up wildcard, at
    /// the requested crypto strength, then falling back to best-available,
    /// finally falling through to the default context. Missing SNI (`None`)
    /// goes straight to the default.
    pub fn lookup(&self, server_name: Option<&str>, crypto: CertCrypto) -> Option<&SslContextEntry> {
        let name = server_name?;
        self.lookup_exact(name, crypto)
            .or_else(|| self.lookup_wildcard(name, crypto))
            .or_else(|| {
                if crypto != CertCrypto::BestAvailable {
                    self.lookup_exact(name, CertCrypto::BestAvailable)
                        .or_else(|| self.lookup_wildcard(name, CertCrypto::BestAvailable))
                } else {
                    None
                }
            })
            .or(self.default.as_ref())
    }

    fn lookup_exact(&self, name: &str, crypto: CertCrypto) -> Option<&SslContextEntry> {
        self.by_key.get(&SslContextKey {
            dn: DnString::new(name),
            crypto,
        })
    }

    /// `bar.foo.com` → tries `*.foo.com`. Does not strip more than one label.
    fn lookup_wildcard(&self, name: &str, crypto: CertCrypto) -> Option<&SslContextEntry> {
        let (_, rest) = name.split_once('.')?;
        let wildcard = format!("*.{rest}");
        self.lookup_exact(&wildcard, crypto)
    }
}

impl SslContextRegistry {
    /// Placeholder builder: real cert/key parsing is out of scope for this
    /// crate (the TLS library primitive is a named external collaborator,
    /// §1); callers supply a built `rustls::ServerConfig` per domain.
    pub fn from_configs(
        configs: &[SslContextConfig],
        build: impl Fn(&SslContextConfig) -> Result<rustls::ServerConfig, rustls::Error>,
    ) -> Result<Self, rustls::Error> {
        let mut registry = SslContextRegistry::new();
        for cfg in configs {
            let server_config = std::sync::Arc::new(build(cfg)?);
            let entry = SslContextEntry {
                server_config,
                crypto: CertCrypto::BestAvailable,
            };
            for domain in &cfg.domains {
                registry.insert(domain, CertCrypto::BestAvailable, entry.clone(), cfg.is_default);
            }
            if cfg.domains.is_empty() && cfg.is_default {
                registry.default = Some(entry);
            }
        }
        Ok(registry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy_entry() -> SslContextEntry {
        let config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_cert_resolver(std::sync::Arc::new(EmptyResolver));
        SslContextEntry {
            server_config: std::sync::Arc::new(config),
            crypto: CertCrypto::BestAvailable,
        }
    }

    #[derive(Debug)]
    struct EmptyResolver;
    impl rustls::server::ResolvesServerCert for EmptyResolver {
        fn resolve(&self, _: rustls::server::ClientHello) -> Option<std::sync::Arc<rustls::sign::CertifiedKey>> {
            None
        }
    }

    #[test]
    fn exact_match_is_case_insensitive() {
        let mut reg = SslContextRegistry::new();
        reg.insert("Example.Com", CertCrypto::BestAvailable, dummy_entry(), false);
        assert!(reg.lookup(Some("example.com"), CertCrypto::BestAvailable).is_some());
    }

    #[test]
    fn one_level_wildcard_matches_direct_child_only() {
        let mut reg = SslContextRegistry::new();
        reg.insert("*.foo.com", CertCrypto::BestAvailable, dummy_entry(), false);
        assert!(reg.lookup(Some("bar.foo.com"), CertCrypto::BestAvailable).is_some());
        assert!(reg
            .lookup(Some("baz.bar.foo.com"), CertCrypto::BestAvailable)
            .is_none());
    }

    #[test]
    fn missing_sni_falls_through_to_default() {
        let mut reg = SslContextRegistry::new();
        reg.insert("example.com", CertCrypto::BestAvailable, dummy_entry(), true);
        assert!(reg.lookup(None, CertCrypto::BestAvailable).is_none());
        assert!(reg.lookup(Some("nomatch.com"), CertCrypto::BestAvailable).is_some());
    }
}
