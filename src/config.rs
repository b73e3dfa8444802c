//! Immutable configuration records: per-VIP server socket config and the
//! TLS context descriptions it carries. Validation lives on the types that
//! need it ([`crate::load_shed::LoadShedConfiguration::validate`]); these
//! structs are plain data, built once at startup and handed to the
//! [`crate::acceptor::Acceptor`].

use std::net::SocketAddr;
use std::time::Duration;

/// One `(certificate, key)` pair plus the domains it should be selected for.
/// Mirrors the subset of `SSLContextConfig` the Acceptor needs to build an
/// [`crate::sni::SslContextRegistry`].
#[derive(Debug, Clone)]
pub struct SslContextConfig {
    /// Certificate chain file, PEM-encoded.
    pub cert_path: String,
    /// Private key file, PEM-encoded.
    pub key_path: String,
    /// Domains this context answers for. Empty means "default context."
    pub domains: Vec<String>,
    /// Whether this is the context served when SNI is absent or unmatched.
    pub is_default: bool,
}

/// SSL session cache sizing, mirrors `SSLCacheOptions`.
#[derive(Debug, Clone, Copy)]
pub struct SslCacheOptions {
    pub ssl_cache_timeout: Duration,
    pub max_ssl_cache_size: usize,
    pub ssl_cache_flush_size: usize,
}

impl Default for SslCacheOptions {
    fn default() -> Self {
        SslCacheOptions {
            ssl_cache_timeout: Duration::from_secs(0),
            max_ssl_cache_size: 20480,
            ssl_cache_flush_size: 200,
        }
    }
}

/// Immutable per-VIP configuration, mirrors `ServerSocketConfig`.
#[derive(Debug, Clone)]
pub struct ServerSocketConfig {
    pub name: String,
    pub bind_address: SocketAddr,
    pub accept_backlog: i32,
    pub max_num_pending_connections_per_worker: u32,
    pub connection_idle_timeout: Duration,
    pub ssl_handshake_timeout: Duration,
    pub ssl_context_configs: Vec<SslContextConfig>,
    pub ssl_cache_options: SslCacheOptions,
    pub allow_insecure_connections_on_secure_server: bool,
    pub strict_ssl: bool,
    pub max_concurrent_ssl_handshakes: u32,
    pub enable_tcp_fast_open: bool,
    pub fast_open_queue_size: u32,
    pub graceful_shutdown_timeout: Duration,
}

impl ServerSocketConfig {
    pub fn new(name: impl Into<String>, bind_address: SocketAddr) -> Self {
        ServerSocketConfig {
            name: name.into(),
            bind_address,
            accept_backlog: 1024,
            max_num_pending_connections_per_worker: 1024,
            connection_idle_timeout: Duration::from_millis(600_000),
            ssl_handshake_timeout: Duration::from_millis(60_000),
            ssl_context_configs: Vec::new(),
            ssl_cache_options: SslCacheOptions::default(),
            allow_insecure_connections_on_secure_server: false,
            strict_ssl: true,
            max_concurrent_ssl_handshakes: 30_720,
            enable_tcp_fast_open: false,
            fast_open_queue_size: 100,
            graceful_shutdown_timeout: Duration::from_secs(5),
        }
    }

    pub fn is_ssl(&self) -> bool {
        !self.ssl_context_configs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_tuning_values() {
        let cfg = ServerSocketConfig::new("vip0", "0.0.0.0:0".parse().unwrap());
        assert_eq!(cfg.accept_backlog, 1024);
        assert_eq!(cfg.max_num_pending_connections_per_worker, 1024);
        assert_eq!(cfg.connection_idle_timeout, Duration::from_secs(600));
        assert_eq!(cfg.ssl_handshake_timeout, Duration::from_secs(60));
        assert_eq!(cfg.max_concurrent_ssl_handshakes, 30_720);
        assert_eq!(cfg.graceful_shutdown_timeout, Duration::from_secs(5));
        assert!(!cfg.is_ssl());
    }
}
