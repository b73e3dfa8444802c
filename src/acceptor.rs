//! The per-worker orchestrator: receives accepted file descriptors, applies
//! admission and socket options, bounds in-flight handshakes, and owns the
//! Connection Manager. Drives the lifecycle `init -> running -> draining ->
//! done`.

use std::io::{Read, Write};
use std::net::SocketAddr;
use std::os::unix::io::AsRawFd;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::ServerSocketConfig;
use crate::connection::{Connection, DropReason};
use crate::connection_manager::{ConnKey, ConnectionManager};
use crate::error::HandshakeError;
use crate::handshake::{HandshakeManager, HandshakeResult, GLOBAL_PENDING_HANDSHAKES};
use crate::load_shed::LoadShedConfiguration;
use crate::net::socket_opts;
use crate::net::TcpStream;
use crate::security_protocol::{DefaultToTlsCallback, SecurityProtocolContextManager, TlsPlaintextDetector};
use crate::sni::SslContextRegistry;
use crate::stats::Stats;
use crate::timer::TimerWheel;
use crate::transport::{SecureTransportType, Transport, TransportInfo, MAX_READS_PER_EVENT};

/// Monotonic lifecycle states. `running -> done` is permitted for a forced
/// stop; every other transition goes through `draining`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum AcceptorState {
    Init,
    Running,
    Draining,
    Done,
}

/// An application-level ready connection, tracked by the Connection Manager
/// purely for idle/drain bookkeeping. The application supplies its own
/// busy predicate and close hooks; this crate does not interpret the bytes
/// flowing over the transport once it's handed off.
pub struct ManagedAppConnection {
    pub is_busy: Box<dyn FnMut() -> bool + Send>,
    pub on_notify_pending_shutdown: Box<dyn FnMut() + Send>,
    pub on_close_when_idle: Box<dyn FnMut() + Send>,
    pub on_drop: Box<dyn FnMut(DropReason) + Send>,
}

impl Connection for ManagedAppConnection {
    fn is_busy(&self) -> bool {
        (self.is_busy)()
    }
    fn notify_pending_shutdown(&mut self) {
        (self.on_notify_pending_shutdown)()
    }
    fn close_when_idle(&mut self) {
        if !(self.is_busy)() {
            (self.on_close_when_idle)()
        }
    }
    fn drop_connection(&mut self, reason: DropReason) {
        (self.on_drop)(reason)
    }
}

/// Either a connection still completing its handshake, or one ready for
/// application use. Both are `Connection`s so the same manager tracks both.
pub enum Tracked<S> {
    Handshake(HandshakeManager<S>),
    App(ManagedAppConnection),
}

impl<S> Connection for Tracked<S> {
    fn is_busy(&self) -> bool {
        match self {
            Tracked::Handshake(_) => true,
            Tracked::App(c) => c.is_busy(),
        }
    }
    fn notify_pending_shutdown(&mut self) {
        if let Tracked::App(c) = self {
            c.notify_pending_shutdown();
        }
    }
    fn close_when_idle(&mut self) {
        match self {
            Tracked::Handshake(h) => h.close_when_idle(),
            Tracked::App(c) => c.close_when_idle(),
        }
    }
    fn drop_connection(&mut self, reason: DropReason) {
        match self {
            Tracked::Handshake(h) => h.drop_connection(reason),
            Tracked::App(c) => c.drop_connection(reason),
        }
    }
}

/// Invoked once per admitted, fully-handshaked connection.
pub type NewConnectionHook<S> = Box<
    dyn FnMut(Transport<S>, SocketAddr, Option<String>, SecureTransportType, TransportInfo) -> ManagedAppConnection
        + Send,
>;

pub struct Acceptor<S> {
    state: AcceptorState,
    config: ServerSocketConfig,
    load_shed: LoadShedConfiguration,
    ssl_registry: SslContextRegistry,
    protocols: SecurityProtocolContextManager<S>,
    connections: ConnectionManager<Tracked<S>>,
    wheel: TimerWheel,
    num_pending_handshakes: u32,
    stats: Arc<dyn Stats>,
    on_new_connection: NewConnectionHook<S>,
    on_connections_drained: Box<dyn FnMut() + Send>,
    force_shutdown_in_progress: bool,
}

impl<S: TcpStream + Read + Write + AsRawFd + 'static> Acceptor<S> {
    pub fn new(
        config: ServerSocketConfig,
        load_shed: LoadShedConfiguration,
        ssl_registry: SslContextRegistry,
        stats: Arc<dyn Stats>,
        on_new_connection: NewConnectionHook<S>,
        on_connections_drained: Box<dyn FnMut() + Send>,
    ) -> Self {
        let mut protocols = SecurityProtocolContextManager::new();
        if config.is_ssl() {
            if config.allow_insecure_connections_on_secure_server {
                protocols.register(Box::new(TlsPlaintextDetector));
            }
            if let Some(default_entry) = ssl_registry.lookup(None, crate::sni::CertCrypto::BestAvailable) {
                protocols.register(Box::new(DefaultToTlsCallback::new(default_entry.server_config.clone())));
            } else if !config.strict_ssl {
                log::error!("no default TLS context configured for {}", config.name);
            }
        }
        let idle_timeout = config.connection_idle_timeout;
        Acceptor {
            state: AcceptorState::Init,
            config,
            load_shed,
            ssl_registry,
            protocols,
            connections: ConnectionManager::new(idle_timeout),
            wheel: TimerWheel::new(),
            num_pending_handshakes: 0,
            stats,
            on_new_connection,
            on_connections_drained,
            force_shutdown_in_progress: false,
        }
    }

    pub fn state(&self) -> AcceptorState {
        self.state
    }

    /// `init -> running`. Socket-option application to the listener's fd
    /// itself is the caller's responsibility (the listener is an external
    /// collaborator, §6); this only flips the lifecycle state.
    pub fn start(&mut self) {
        self.state = AcceptorState::Running;
    }

    /// Admission algorithm. `current_connections` is this worker's own
    /// count; `global_active`/`global_total` are the process-wide shed
    /// probes, expensive enough that the fast path and whitelist check
    /// avoid touching them at all.
    pub fn can_accept(&self, addr: SocketAddr, current_connections: u64, global_active: u64, global_total: u64) -> bool {
        if self.config.max_num_pending_connections_per_worker == 0 {
            return true;
        }
        if current_connections < self.config.max_num_pending_connections_per_worker as u64 {
            return true;
        }
        if self.load_shed.is_whitelisted(addr.ip()) {
            return true;
        }
        let total_exceeded =
            self.load_shed.max_connections > 0 && global_total >= self.load_shed.max_connections;
        if total_exceeded {
            self.log_rejection(addr);
            return false;
        }
        let active_exceeded =
            self.load_shed.max_active_connections > 0 && global_active >= self.load_shed.max_active_connections;
        if active_exceeded {
            self.log_rejection(addr);
            return false;
        }
        true
    }

    /// Rate-limited 1-in-1000 rejection log, per §4.5/§4.6.
    fn log_rejection(&self, addr: SocketAddr) {
        use std::sync::atomic::AtomicU64;
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        if n % 1000 == 0 {
            log::warn!("load shed rejecting {addr}, count={n}");
        }
    }

    /// Step 1-4 of `connectionAccepted`: admission, socket options, accept
    /// timestamp, and the plaintext/secure branch. Returns the connection's
    /// current tracking key, if it's still tracked once this call returns
    /// (a handshake may complete synchronously, in which case the returned
    /// key may already refer to its post-handshake `Tracked::App` entry
    /// rather than the handshake record originally created).
    pub fn connection_accepted(
        &mut self,
        socket: S,
        client_addr: SocketAddr,
        global_active: u64,
        global_total: u64,
    ) -> Option<ConnKey> {
        if !self.can_accept(client_addr, self.connections.len() as u64, global_active, global_total) {
            if let Err(e) = socket_opts::set_linger_rst(socket.as_raw_fd()) {
                log::warn!("failed to set SO_LINGER on rejected connection: {e}");
            }
            self.stats.record_load_shed_rejected();
            drop(socket);
            return None;
        }
        let _ = socket.set_nodelay(true);
        let accept_time = Instant::now();
        let mut transport = Transport::new(socket);

        if self.config.is_ssl() {
            if self.num_pending_handshakes >= self.config.max_concurrent_ssl_handshakes {
                self.stats.record_handshake_error(Duration::ZERO, 0);
                return None;
            }
            self.num_pending_handshakes += 1;
            let handshake = HandshakeManager::start(transport, client_addr, accept_time);
            let key = self
                .connections
                .add(Tracked::Handshake(handshake), true, &mut self.wheel);
            self.connections.schedule_timeout(
                key,
                self.config.ssl_handshake_timeout,
                DropReason::HandshakeTimeout,
                &mut self.wheel,
            );
            self.poll_handshake(key)
        } else {
            let mut tinfo = TransportInfo::new(client_addr, accept_time);
            tinfo.populate_from_socket(transport.socket());
            transport.set_max_reads_per_event(MAX_READS_PER_EVENT);
            self.connection_ready(transport, client_addr, None, SecureTransportType::None, tinfo)
        }
    }

    /// Advances the handshake at `key`, if any, dispatching on completion.
    /// Called by the worker event loop whenever that connection's socket
    /// becomes readable or writable. Returns the key's current tracking
    /// entry once settled (see `connection_accepted`), or `None` if the
    /// connection was dropped outright.
    pub fn poll_handshake(&mut self, key: ConnKey) -> Option<ConnKey> {
        let result = match self.connections.get_mut(key) {
            Some(Tracked::Handshake(h)) => h.poll(&self.protocols),
            _ => return Some(key),
        };
        let Some(result) = result else { return Some(key) };
        self.connections.remove(key, &mut self.wheel);
        self.num_pending_handshakes = self.num_pending_handshakes.saturating_sub(1);
        let settled = match result {
            HandshakeResult::Ready {
                mut transport,
                client_addr,
                next_protocol,
                secure_transport_type,
                mut tinfo,
            } => {
                tinfo.populate_from_socket(transport.socket());
                transport.set_max_reads_per_event(MAX_READS_PER_EVENT);
                self.stats.record_ssl_accept_latency(tinfo.accept_time.elapsed());
                self.connection_ready(transport, client_addr, next_protocol, secure_transport_type, tinfo)
            }
            HandshakeResult::Failed { error, tinfo } => {
                self.stats
                    .record_handshake_error(tinfo.accept_time.elapsed(), tinfo.raw_bytes_received);
                if matches!(error, HandshakeError::UnrecognizedProtocol) {
                    log::debug!("closing connection from {}: unrecognized protocol", tinfo.client_addr);
                }
                None
            }
        };
        self.check_drained();
        settled
    }

    /// Caps per-event reads, then hands off to the application if the
    /// acceptor isn't already draining. Returns the key of the newly
    /// tracked `Tracked::App` entry, or `None` if the connection was
    /// dropped silently because the acceptor is already draining.
    fn connection_ready(
        &mut self,
        mut transport: Transport<S>,
        client_addr: SocketAddr,
        next_protocol: Option<String>,
        secure_transport_type: SecureTransportType,
        tinfo: TransportInfo,
    ) -> Option<ConnKey> {
        transport.set_max_reads_per_event(MAX_READS_PER_EVENT);
        if self.state >= AcceptorState::Draining {
            return None;
        }
        let managed = (self.on_new_connection)(transport, client_addr, next_protocol, secure_transport_type, tinfo);
        Some(self.connections.add(Tracked::App(managed), true, &mut self.wheel))
    }

    pub fn drain_all_connections(&mut self, graceful_timeout: Duration) {
        if self.state != AcceptorState::Running && self.state != AcceptorState::Draining {
            return;
        }
        self.connections
            .initiate_graceful_shutdown(graceful_timeout, &mut self.wheel);
    }

    /// Advances the active drain by one bounded batch; the worker event
    /// loop calls this once per iteration while draining.
    pub fn drain_tick(&mut self) {
        self.connections.drain_tick();
        if self.connections.take_empty_notification() {
            self.check_drained();
        }
    }

    pub fn accept_stopped(&mut self) {
        let grace = self.config.graceful_shutdown_timeout;
        self.connections.initiate_graceful_shutdown(grace, &mut self.wheel);
        if self.state != AcceptorState::Done {
            self.state = AcceptorState::Draining;
        }
        self.check_drained();
    }

    /// Schedulable from any thread via the event loop's post primitive;
    /// here it's just a flag plus the synchronous drop, since the caller is
    /// expected to have already hopped onto the event-loop thread.
    pub fn force_stop(&mut self) {
        self.force_shutdown_in_progress = true;
        self.drop_all_connections();
        self.force_shutdown_in_progress = false;
        self.check_drained();
    }

    pub fn drop_all_connections(&mut self) {
        self.connections.drop_all_connections(&mut self.wheel);
    }

    pub fn drop_connections(&mut self, fraction: f64) {
        self.connections.drop_connections(fraction, &mut self.wheel);
    }

    pub fn drop_idle_connections(&mut self, n: usize) -> usize {
        self.connections.drop_idle_connections(n, &mut self.wheel)
    }

    /// Call after any drain-relevant event. Transitions to `done` once
    /// there are no pending handshakes, no tracked connections, and no
    /// forced shutdown in progress.
    pub fn check_drained(&mut self) {
        if self.num_pending_handshakes > 0 || !self.connections.is_empty() || self.force_shutdown_in_progress {
            return;
        }
        if self.state == AcceptorState::Done {
            return;
        }
        self.state = AcceptorState::Done;
        (self.on_connections_drained)();
    }

    pub fn num_pending_handshakes(&self) -> u32 {
        self.num_pending_handshakes
    }

    pub fn global_pending_handshakes() -> u32 {
        GLOBAL_PENDING_HANDSHAKES.load(Ordering::Relaxed)
    }

    pub fn timer_wheel_mut(&mut self) -> &mut TimerWheel {
        &mut self.wheel
    }

    /// Dispatches a fired timer id: first as a possible drain grace timer,
    /// then as a possible per-connection idle timeout. A timer id that
    /// matches neither (e.g. one already cancelled) is simply ignored.
    pub fn handle_timer_fired(&mut self, id: crate::timer::TimerId) {
        self.connections.grace_timer_expired(id);
        let was_handshake = self
            .connections
            .timer_key(id)
            .is_some_and(|key| matches!(self.connections.get(key), Some(Tracked::Handshake(_))));
        let removed = self.connections.handle_idle_timeout(id, &mut self.wheel);
        if removed {
            if was_handshake {
                self.num_pending_handshakes = self.num_pending_handshakes.saturating_sub(1);
                self.stats.record_handshake_error(Duration::ZERO, 0);
            }
            self.check_drained();
        }
    }

    pub fn connections(&self) -> &ConnectionManager<Tracked<S>> {
        &self.connections
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::NoopStats;

    fn base_config() -> ServerSocketConfig {
        ServerSocketConfig::new("test", "127.0.0.1:0".parse().unwrap())
    }

    #[test]
    fn admission_fast_path_skips_global_probe() {
        let mut cfg = base_config();
        cfg.max_num_pending_connections_per_worker = 200;
        let acceptor = Acceptor::<std::net::TcpStream>::new(
            cfg,
            LoadShedConfiguration::default(),
            SslContextRegistry::new(),
            Arc::new(NoopStats),
            Box::new(|_t, _a, _p, _s, _i| ManagedAppConnection {
                is_busy: Box::new(|| false),
                on_notify_pending_shutdown: Box::new(|| {}),
                on_close_when_idle: Box::new(|| {}),
                on_drop: Box::new(|_| {}),
            }),
            Box::new(|| {}),
        );
        assert!(acceptor.can_accept("10.0.0.1:1".parse().unwrap(), 100, u64::MAX, u64::MAX));
    }

    #[test]
    fn admission_whitelist_overrides_shed() {
        let mut cfg = base_config();
        cfg.max_num_pending_connections_per_worker = 200;
        let mut load_shed = LoadShedConfiguration::default();
        load_shed.max_connections = 200;
        load_shed.max_active_connections = 100;
        load_shed.add_whitelist_addr("127.0.0.1");
        let acceptor = Acceptor::<std::net::TcpStream>::new(
            cfg,
            load_shed,
            SslContextRegistry::new(),
            Arc::new(NoopStats),
            Box::new(|_t, _a, _p, _s, _i| ManagedAppConnection {
                is_busy: Box::new(|| false),
                on_notify_pending_shutdown: Box::new(|| {}),
                on_close_when_idle: Box::new(|| {}),
                on_drop: Box::new(|_| {}),
            }),
            Box::new(|| {}),
        );
        assert!(acceptor.can_accept("127.0.0.1:12345".parse().unwrap(), 300, 110, 210));
    }

    #[test]
    fn admission_shed_rejects_over_threshold() {
        let mut cfg = base_config();
        cfg.max_num_pending_connections_per_worker = 200;
        let mut load_shed = LoadShedConfiguration::default();
        load_shed.max_connections = 200;
        load_shed.max_active_connections = 100;
        let acceptor = Acceptor::<std::net::TcpStream>::new(
            cfg,
            load_shed,
            SslContextRegistry::new(),
            Arc::new(NoopStats),
            Box::new(|_t, _a, _p, _s, _i| ManagedAppConnection {
                is_busy: Box::new(|| false),
                on_notify_pending_shutdown: Box::new(|| {}),
                on_close_when_idle: Box::new(|| {}),
                on_drop: Box::new(|_| {}),
            }),
            Box::new(|| {}),
        );
        assert!(!acceptor.can_accept("10.0.0.1:1".parse().unwrap(), 300, 110, 210));
    }

    #[test]
    fn check_drained_fires_once_on_empty() {
        let fired = Arc::new(std::sync::atomic::AtomicU32::new(0));
        let fired2 = fired.clone();
        let mut acceptor = Acceptor::new(
            base_config(),
            LoadShedConfiguration::default(),
            SslContextRegistry::new(),
            Arc::new(NoopStats),
            Box::new(|_t, _a, _p, _s, _i| ManagedAppConnection {
                is_busy: Box::new(|| false),
                on_notify_pending_shutdown: Box::new(|| {}),
                on_close_when_idle: Box::new(|| {}),
                on_drop: Box::new(|_| {}),
            }),
            Box::new(move || {
                fired2.fetch_add(1, Ordering::Relaxed);
            }),
        );
        acceptor.start();
        acceptor.accept_stopped();
        assert_eq!(fired.load(Ordering::Relaxed), 1);
        assert_eq!(acceptor.state(), AcceptorState::Done);
    }
}
