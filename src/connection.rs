//! The `Connection` trait implemented by anything the
//! [`crate::connection_manager::ConnectionManager`] tracks: both ordinary
//! application connections and in-flight [`crate::handshake::HandshakeManager`]
//! instances, which are themselves connections for idle/timeout purposes.

/// Why a connection is being force-closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// The manager is shutting down and the grace period elapsed.
    Shutdown,
    /// The connection's idle timer fired.
    IdleTimeout,
    /// Evicted early by `dropIdleConnections` under pressure.
    EarlyIdleDrop,
    /// The owning handshake timed out.
    HandshakeTimeout,
}

/// A connection tracked by a `ConnectionManager`.
pub trait Connection {
    /// Whether the connection currently has work in flight. The manager
    /// consults this only for the drain algorithm's bookkeeping; busy/idle
    /// partition membership itself is driven by explicit `on_activated` /
    /// `on_deactivated` calls, not by polling this method.
    fn is_busy(&self) -> bool;

    /// Delivered when a graceful drain enters its "notify pending shutdown"
    /// phase. Informational only; the connection is not forced closed.
    fn notify_pending_shutdown(&mut self);

    /// Delivered when a graceful drain enters its "close when idle" phase.
    /// If the connection is not busy, it should close itself promptly.
    fn close_when_idle(&mut self);

    /// Forcibly closes the connection for `reason`.
    fn drop_connection(&mut self, reason: DropReason);
}
