//! Stats sink consumed by the Acceptor and Handshake Manager.
//!
//! This is deliberately a trait, not a concrete metrics implementation:
//! metrics storage is out of scope (§1). A [`NoopStats`] is provided for
//! tests and for callers that don't want to wire one up yet.

use std::time::Duration;

/// Recording surface for per-connection setup stats.
pub trait Stats: Send + Sync {
    /// Elapsed wall time for a completed (successful or failed) TLS accept.
    fn record_ssl_accept_latency(&self, latency: Duration);
    /// A TLS session ticket was presented; `hit` means the ticket decrypted
    /// to a resumable session.
    fn record_tls_ticket(&self, is_new: bool, hit: bool);
    /// A TLS session cache lookup; `foreign` means it was served from a
    /// peer worker's shard.
    fn record_ssl_session(&self, is_new: bool, hit: bool, foreign: bool);
    /// A ticket-key rotation swept in a new seed; `valid` means it parsed.
    fn record_tls_ticket_rotation(&self, valid: bool);
    /// A connection was rejected by load shedding.
    fn record_load_shed_rejected(&self);
    /// A handshake failed or timed out after `latency` with `raw_bytes_read`
    /// bytes consumed off the wire.
    fn record_handshake_error(&self, latency: Duration, raw_bytes_read: u64);
}

/// A `Stats` that discards everything. Used by default and in tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopStats;

impl Stats for NoopStats {
    fn record_ssl_accept_latency(&self, _latency: Duration) {}
    fn record_tls_ticket(&self, _is_new: bool, _hit: bool) {}
    fn record_ssl_session(&self, _is_new: bool, _hit: bool, _foreign: bool) {}
    fn record_tls_ticket_rotation(&self, _valid: bool) {}
    fn record_load_shed_rejected(&self) {}
    fn record_handshake_error(&self, _latency: Duration, _raw_bytes_read: u64) {}
}
