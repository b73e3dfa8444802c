//! Registry of peek callbacks consulted by the [`crate::handshake::HandshakeManager`]
//! once the initial bytes of a connection have been peeked.

use std::io::{Read, Write};
use std::sync::Arc;

use crate::handshake::{HandshakeHelper, PlaintextHelper, TlsHandshakeHelper};
use crate::net::TcpStream;

/// A registered protocol detector: declares how many bytes it needs to see
/// and, given exactly that many peeked bytes, either produces a helper or
/// declines.
pub trait PeekCallback<S>: Send {
    fn bytes_required(&self) -> usize;
    fn get_helper(&self, peeked: &[u8]) -> Option<Box<dyn HandshakeHelper<S>>>;
}

/// The first byte of a TLS record is its content type; `0x16` is Handshake.
/// Anything else peeked at this position is assumed to be plaintext.
/// Registered ahead of the default-to-TLS callback so more specific
/// detectors run first.
pub struct TlsPlaintextDetector;

impl<S: 'static> PeekCallback<S> for TlsPlaintextDetector {
    fn bytes_required(&self) -> usize {
        1
    }

    fn get_helper(&self, peeked: &[u8]) -> Option<Box<dyn HandshakeHelper<S>>> {
        match peeked.first() {
            Some(&0x16) => None,
            _ => Some(Box::new(PlaintextHelper)),
        }
    }
}

/// Always matches, needs no peeked bytes, and hands off to a TLS helper
/// built from the registry's default `rustls::ServerConfig`.
pub struct DefaultToTlsCallback {
    config: Arc<rustls::ServerConfig>,
}

impl DefaultToTlsCallback {
    pub fn new(config: Arc<rustls::ServerConfig>) -> Self {
        DefaultToTlsCallback { config }
    }
}

impl<S: TcpStream + Read + Write + 'static> PeekCallback<S> for DefaultToTlsCallback {
    fn bytes_required(&self) -> usize {
        0
    }

    fn get_helper(&self, _peeked: &[u8]) -> Option<Box<dyn HandshakeHelper<S>>> {
        match TlsHandshakeHelper::new(self.config.clone()) {
            Ok(helper) => Some(Box::new(helper)),
            Err(e) => {
                log::error!("failed to construct tls handshake helper: {e}");
                None
            }
        }
    }
}

/// Holds an ordered sequence of peek callbacks. The manager's effective peek
/// length is the max `bytes_required` over all registered callbacks: every
/// callback sees the same peeked prefix, regardless of how many bytes it
/// individually asked for.
#[derive(Default)]
pub struct SecurityProtocolContextManager<S> {
    callbacks: Vec<Box<dyn PeekCallback<S>>>,
}

impl<S> SecurityProtocolContextManager<S> {
    pub fn new() -> Self {
        SecurityProtocolContextManager { callbacks: Vec::new() }
    }

    pub fn register(&mut self, callback: Box<dyn PeekCallback<S>>) {
        self.callbacks.push(callback);
    }

    pub fn effective_peek_length(&self) -> usize {
        self.callbacks.iter().map(|c| c.bytes_required()).max().unwrap_or(0)
    }

    /// Walks callbacks in registration order; the first to return a helper
    /// wins. `None` means every callback declined — "unrecognized protocol."
    pub fn select_helper(&self, peeked: &[u8]) -> Option<Box<dyn HandshakeHelper<S>>> {
        self.callbacks.iter().find_map(|c| c.get_helper(peeked))
    }

    pub fn is_empty(&self) -> bool {
        self.callbacks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpStream as StdTcpStream;

    #[test]
    fn plaintext_byte_yields_plaintext_helper() {
        let mut mgr: SecurityProtocolContextManager<StdTcpStream> = SecurityProtocolContextManager::new();
        mgr.register(Box::new(TlsPlaintextDetector));
        assert_eq!(mgr.effective_peek_length(), 1);
        assert!(mgr.select_helper(&[0x47]).is_some());
    }

    #[test]
    fn tls_byte_declines_plaintext_detector() {
        let mut mgr: SecurityProtocolContextManager<StdTcpStream> = SecurityProtocolContextManager::new();
        mgr.register(Box::new(TlsPlaintextDetector));
        assert!(mgr.select_helper(&[0x16]).is_none());
    }

    #[test]
    fn empty_registry_recognizes_nothing() {
        let mgr: SecurityProtocolContextManager<StdTcpStream> = SecurityProtocolContextManager::new();
        assert_eq!(mgr.effective_peek_length(), 0);
        assert!(mgr.select_helper(&[]).is_none());
    }
}
