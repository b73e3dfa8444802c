//! Error taxonomy for the acceptor pipeline.
//!
//! None of these ever unwind out of an event-loop callback; each is converted
//! at its point of origin into a stat update, a closed transport, and a
//! cleared pending-handshake counter. See [`crate::acceptor::Acceptor`] for
//! where each variant is produced and consumed.

use std::io;

/// Failure while peeking the first bytes of a newly accepted socket.
#[derive(Debug, thiserror::Error)]
pub enum PeekError {
    /// The peer closed the connection before the required byte count arrived.
    #[error("peer closed connection before {0} peek bytes were read")]
    Eof(usize),
    /// The underlying read failed.
    #[error("read error while peeking: {0}")]
    Read(#[source] io::Error),
}

/// Failure while selecting or driving a handshake helper.
#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    /// No registered peek callback recognized the connection's first bytes.
    #[error("unrecognized protocol: no peek callback matched")]
    UnrecognizedProtocol,
    /// Too many handshakes are already in flight on this worker.
    #[error("dropped: {0} handshakes already in progress")]
    Dropped(u32),
    /// The handshake did not complete before its deadline.
    #[error("handshake timed out")]
    Timeout,
    /// The peek stage failed outright.
    #[error("peek failed: {0}")]
    Peek(#[from] PeekError),
    /// The TLS library reported a handshake failure.
    #[error("tls handshake failed: {0}")]
    Tls(#[source] rustls::Error),
    /// The socket errored out during handshake I/O.
    #[error("handshake io error: {0}")]
    Io(#[source] io::Error),
}

/// Failure while loading or reloading TLS context configuration.
#[derive(Debug, thiserror::Error)]
pub enum TlsConfigError {
    /// No contexts were configured at all.
    #[error("no TLS context configs supplied")]
    Empty,
    /// Building a `rustls::ServerConfig` from a context config failed.
    #[error("failed to build TLS context: {0}")]
    Build(#[source] rustls::Error),
    /// A certificate or key file could not be read.
    #[error("failed to read TLS credential file {0}: {1}")]
    CredentialFile(String, #[source] io::Error),
}

/// A `LoadShedConfiguration` failed its sanity check.
#[derive(Debug, thiserror::Error)]
pub enum LoadShedConfigError {
    /// A ratio field was outside `[0, 1]`.
    #[error("{field} must be in [0, 1], got {value}")]
    RatioOutOfRange {
        /// Name of the offending field.
        field: &'static str,
        /// The out-of-range value.
        value: f64,
    },
    /// `maxActiveConnections` exceeded `maxConnections`.
    #[error("maxActiveConnections ({active}) must be <= maxConnections ({total})")]
    ActiveExceedsTotal {
        /// Configured active-connection ceiling.
        active: u64,
        /// Configured total-connection ceiling.
        total: u64,
    },
    /// The CPU-usage-exceed window was configured to zero.
    #[error("cpuUsageExceedWindowSize must be >= 1")]
    ZeroExceedWindow,
}

/// Errors surfaced while accepting a new file descriptor from the listening
/// socket. Never fatal: the listening socket handles its own FD-exhaustion
/// back-off, this is purely informational.
#[derive(Debug, thiserror::Error)]
#[error("error accepting connection: {0}")]
pub struct AcceptError(#[source] pub io::Error);
