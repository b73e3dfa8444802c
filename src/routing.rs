//! Accept-Routing Handler: an optional pre-pipeline that peeks
//! application-layer routing bytes and hands the connection to a sibling
//! worker by hashing. Surrounding, not core (§2) — specified here only at
//! its interface boundary, not with the full cross-thread handoff machinery
//! a production implementation would need.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::io::Read;
use std::net::SocketAddr;

use crate::net::TcpStream;
use crate::peeker::{PeekOutcome, SocketPeeker};
use crate::transport::Transport;

/// Extracts a routing key from the peeked prefix of a connection. Returns
/// `None` if more bytes are needed before a key can be determined.
pub trait RoutingDataHandler<R> {
    fn bytes_required(&self) -> usize;
    fn extract(&self, peeked: &[u8]) -> Option<R>;
}

/// Routes a newly accepted, not-yet-dispatched connection to one of
/// `worker_count` sibling workers by hashing its routing key modulo the
/// worker count. The caller is responsible for actually moving the socket
/// to the target worker's event loop (e.g. via a channel + waker, as the
/// worker module does for freshly accepted sockets).
pub struct AcceptRoutingHandler<R, H> {
    handler: H,
    worker_count: usize,
    _marker: std::marker::PhantomData<R>,
}

impl<R: Hash, H: RoutingDataHandler<R>> AcceptRoutingHandler<R, H> {
    pub fn new(handler: H, worker_count: usize) -> Self {
        AcceptRoutingHandler {
            handler,
            worker_count,
            _marker: std::marker::PhantomData,
        }
    }

    pub fn bytes_required(&self) -> usize {
        self.handler.bytes_required()
    }

    /// Peeks the routing prefix off `transport` and, once available,
    /// returns the index of the worker that should own this connection.
    /// `Ok(None)` means more data is needed; the caller should retry on the
    /// next readable event.
    pub fn route<S: TcpStream + Read>(
        &self,
        peeker: &mut SocketPeeker,
        transport: &mut Transport<S>,
    ) -> std::io::Result<Option<usize>> {
        match peeker.poll(transport)? {
            None => Ok(None),
            Some(PeekOutcome::Error(_)) => Ok(Some(0)),
            Some(PeekOutcome::Success(bytes)) => match self.handler.extract(&bytes) {
                Some(key) => Ok(Some(self.hash_to_worker(&key))),
                None => Ok(Some(0)),
            },
        }
    }

    fn hash_to_worker(&self, key: &R) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() as usize) % self.worker_count.max(1)
    }
}

/// A routed connection handed off between workers: the transport plus its
/// peer address, after routing-prefix extraction has completed.
pub struct RoutedConnection<S> {
    pub transport: Transport<S>,
    pub client_addr: SocketAddr,
}
