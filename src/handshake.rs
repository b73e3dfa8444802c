//! Per-connection handshake state machine: owns the socket from the moment
//! the Acceptor hands it off until the transport is ready for application
//! use or the handshake has failed. Participates in the Connection Manager's
//! list like any other connection, so the same idle/drain machinery governs
//! its timeout.

use std::io::{Read, Write};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::connection::{Connection, DropReason};
use crate::error::HandshakeError;
use crate::net::TcpStream;
use crate::peeker::{PeekOutcome, SocketPeeker};
use crate::security_protocol::SecurityProtocolContextManager;
use crate::transport::{SecureTransportType, Transport, TransportInfo};

/// Process-wide count of in-flight handshakes, mirrored per-worker in the
/// Acceptor. §3: "Σ per-worker numPendingHandshakes = global counter."
pub static GLOBAL_PENDING_HANDSHAKES: AtomicU32 = AtomicU32::new(0);

/// Result of a handshake reaching a terminal state.
pub enum HandshakeResult<S> {
    Ready {
        transport: Transport<S>,
        client_addr: SocketAddr,
        next_protocol: Option<String>,
        secure_transport_type: SecureTransportType,
        tinfo: TransportInfo,
    },
    Failed {
        error: HandshakeError,
        tinfo: TransportInfo,
    },
}

/// Outcome of advancing a handshake helper by one step.
pub enum HelperStep {
    Pending,
    Ready {
        next_protocol: Option<String>,
        secure_transport_type: SecureTransportType,
    },
    Failed(HandshakeError),
}

/// Strategy object selected from peeked bytes that drives a particular
/// protocol's setup on a new transport.
pub trait HandshakeHelper<S>: Send {
    fn advance(&mut self, transport: &mut Transport<S>) -> HelperStep;
}

/// Trivial helper for the plaintext path: ready on the first poll, no bytes
/// consumed beyond the peek.
pub struct PlaintextHelper;

impl<S> HandshakeHelper<S> for PlaintextHelper {
    fn advance(&mut self, _transport: &mut Transport<S>) -> HelperStep {
        HelperStep::Ready {
            next_protocol: None,
            secure_transport_type: SecureTransportType::None,
        }
    }
}

/// Drives a `rustls::ServerConnection` to completion, reading/writing the
/// underlying transport as the library demands.
pub struct TlsHandshakeHelper {
    conn: rustls::ServerConnection,
}

impl TlsHandshakeHelper {
    pub fn new(config: Arc<rustls::ServerConfig>) -> Result<Self, rustls::Error> {
        Ok(TlsHandshakeHelper {
            conn: rustls::ServerConnection::new(config)?,
        })
    }
}

impl<S: TcpStream + Read + Write> HandshakeHelper<S> for TlsHandshakeHelper {
    fn advance(&mut self, transport: &mut Transport<S>) -> HelperStep {
        if self.conn.wants_read() {
            match self.conn.read_tls(transport) {
                Ok(0) => {
                    return HelperStep::Failed(HandshakeError::Io(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "eof during tls handshake",
                    )));
                }
                Ok(_) => {
                    if let Err(e) = self.conn.process_new_packets() {
                        return HelperStep::Failed(HandshakeError::Tls(e));
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(e) => return HelperStep::Failed(HandshakeError::Io(e)),
            }
        }
        if self.conn.wants_write() {
            match self.conn.write_tls(transport) {
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(e) => return HelperStep::Failed(HandshakeError::Io(e)),
            }
        }
        if !self.conn.is_handshaking() && !self.conn.wants_write() {
            let next_protocol = self
                .conn
                .alpn_protocol()
                .map(|p| String::from_utf8_lossy(p).into_owned());
            HelperStep::Ready {
                next_protocol,
                secure_transport_type: SecureTransportType::Tls,
            }
        } else {
            HelperStep::Pending
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Started,
    Peeking,
    Handshaking,
    Ready,
    Failed,
}

/// The per-connection handshake state machine itself. Generic over the
/// stream type so tests can drive it with a plain `std::net::TcpStream`
/// pair instead of `mio`.
pub struct HandshakeManager<S> {
    state: State,
    transport: Option<Transport<S>>,
    client_addr: SocketAddr,
    accept_time: Instant,
    tinfo: TransportInfo,
    peeker: Option<SocketPeeker>,
    helper: Option<Box<dyn HandshakeHelper<S>>>,
    timeout_id: Option<crate::timer::TimerId>,
}

impl<S> HandshakeManager<S> {
    /// Starts tracking a newly accepted, not-yet-classified connection.
    /// Increments the global and (via the caller, who owns the per-worker
    /// counter) per-worker pending-handshake counters.
    pub fn start(transport: Transport<S>, client_addr: SocketAddr, accept_time: Instant) -> Self {
        GLOBAL_PENDING_HANDSHAKES.fetch_add(1, Ordering::Relaxed);
        HandshakeManager {
            state: State::Started,
            transport: Some(transport),
            client_addr,
            accept_time,
            tinfo: TransportInfo::new(client_addr, accept_time),
            peeker: None,
            helper: None,
            timeout_id: None,
        }
    }

    pub fn set_timeout_id(&mut self, id: crate::timer::TimerId) {
        self.timeout_id = Some(id);
    }

    pub fn timeout_id(&self) -> Option<crate::timer::TimerId> {
        self.timeout_id
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.state, State::Ready | State::Failed)
    }
}

impl<S: TcpStream + Read + Write> HandshakeManager<S> {
    /// Advances the state machine as far as it can go without blocking.
    /// Returns `Some(result)` once a terminal state is reached.
    pub fn poll(
        &mut self,
        protocols: &SecurityProtocolContextManager<S>,
    ) -> Option<HandshakeResult<S>> {
        if self.state == State::Started {
            let len = protocols.effective_peek_length();
            self.peeker = Some(SocketPeeker::new(len));
            self.state = State::Peeking;
        }

        if self.state == State::Peeking {
            let transport = self.transport.as_mut().expect("transport present while peeking");
            let peeker = self.peeker.as_mut().expect("peeker present while peeking");
            match peeker.poll(transport) {
                Ok(None) => return None,
                Ok(Some(PeekOutcome::Error(e))) => {
                    self.state = State::Failed;
                    return Some(HandshakeResult::Failed {
                        error: HandshakeError::Peek(e),
                        tinfo: self.tinfo.clone(),
                    });
                }
                Ok(Some(PeekOutcome::Success(bytes))) => match protocols.select_helper(&bytes) {
                    Some(helper) => {
                        self.helper = Some(helper);
                        self.state = State::Handshaking;
                    }
                    None => {
                        self.state = State::Failed;
                        return Some(HandshakeResult::Failed {
                            error: HandshakeError::UnrecognizedProtocol,
                            tinfo: self.tinfo.clone(),
                        });
                    }
                },
                Err(e) => {
                    self.state = State::Failed;
                    return Some(HandshakeResult::Failed {
                        error: HandshakeError::Io(e),
                        tinfo: self.tinfo.clone(),
                    });
                }
            }
        }

        if self.state == State::Handshaking {
            let transport = self.transport.as_mut().expect("transport present while handshaking");
            let helper = self.helper.as_mut().expect("helper present while handshaking");
            match helper.advance(transport) {
                HelperStep::Pending => return None,
                HelperStep::Ready {
                    next_protocol,
                    secure_transport_type,
                } => {
                    self.state = State::Ready;
                    return Some(HandshakeResult::Ready {
                        transport: self.transport.take().unwrap(),
                        client_addr: self.client_addr,
                        next_protocol,
                        secure_transport_type,
                        tinfo: self.tinfo.clone(),
                    });
                }
                HelperStep::Failed(error) => {
                    self.state = State::Failed;
                    return Some(HandshakeResult::Failed {
                        error,
                        tinfo: self.tinfo.clone(),
                    });
                }
            }
        }

        None
    }
}

impl<S> Connection for HandshakeManager<S> {
    fn is_busy(&self) -> bool {
        true
    }

    fn notify_pending_shutdown(&mut self) {}

    fn close_when_idle(&mut self) {
        self.drop_connection(DropReason::Shutdown);
    }

    fn drop_connection(&mut self, _reason: DropReason) {
        self.state = State::Failed;
        self.transport = None;
    }
}

impl<S> Drop for HandshakeManager<S> {
    fn drop(&mut self) {
        GLOBAL_PENDING_HANDSHAKES.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security_protocol::{PeekCallback, SecurityProtocolContextManager};
    use std::io::Write;
    use std::net::{TcpListener, TcpStream as StdTcpStream};

    fn pair() -> (StdTcpStream, StdTcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = StdTcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        server.set_nonblocking(true).unwrap();
        (server, client)
    }

    struct AlwaysPlaintext;
    impl PeekCallback<StdTcpStream> for AlwaysPlaintext {
        fn bytes_required(&self) -> usize {
            2
        }
        fn get_helper(&self, _peeked: &[u8]) -> Option<Box<dyn HandshakeHelper<StdTcpStream>>> {
            Some(Box::new(PlaintextHelper))
        }
    }

    struct NeverMatches;
    impl PeekCallback<StdTcpStream> for NeverMatches {
        fn bytes_required(&self) -> usize {
            2
        }
        fn get_helper(&self, _peeked: &[u8]) -> Option<Box<dyn HandshakeHelper<StdTcpStream>>> {
            None
        }
    }

    #[test]
    fn peek_then_handshake_success_reaches_ready() {
        let (server, mut client) = pair();
        client.write_all(&[0x16, 0x03]).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));

        let mut protocols: SecurityProtocolContextManager<StdTcpStream> = SecurityProtocolContextManager::new();
        protocols.register(Box::new(AlwaysPlaintext));

        let mut mgr = HandshakeManager::start(Transport::new(server), "127.0.0.1:1".parse().unwrap(), Instant::now());
        let result = loop {
            if let Some(r) = mgr.poll(&protocols) {
                break r;
            }
        };
        match result {
            HandshakeResult::Ready {
                secure_transport_type, ..
            } => assert_eq!(secure_transport_type, SecureTransportType::None),
            HandshakeResult::Failed { .. } => panic!("expected ready"),
        }
    }

    #[test]
    fn peek_success_with_no_matching_callback_fails_unrecognized() {
        let (server, mut client) = pair();
        client.write_all(&[0xff, 0xff]).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));

        let mut protocols: SecurityProtocolContextManager<StdTcpStream> = SecurityProtocolContextManager::new();
        protocols.register(Box::new(NeverMatches));

        let mut mgr = HandshakeManager::start(Transport::new(server), "127.0.0.1:1".parse().unwrap(), Instant::now());
        let result = loop {
            if let Some(r) = mgr.poll(&protocols) {
                break r;
            }
        };
        match result {
            HandshakeResult::Failed { error, .. } => {
                assert!(matches!(error, HandshakeError::UnrecognizedProtocol));
            }
            HandshakeResult::Ready { .. } => panic!("expected failure"),
        }
    }

    #[test]
    fn global_pending_handshakes_decrements_exactly_once_on_drop() {
        let (server, _client) = pair();
        let before = GLOBAL_PENDING_HANDSHAKES.load(Ordering::Relaxed);
        let mgr = HandshakeManager::start(Transport::new(server), "127.0.0.1:1".parse().unwrap(), Instant::now());
        assert_eq!(GLOBAL_PENDING_HANDSHAKES.load(Ordering::Relaxed), before + 1);
        drop(mgr);
        assert_eq!(GLOBAL_PENDING_HANDSHAKES.load(Ordering::Relaxed), before);
    }
}
