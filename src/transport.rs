//! Per-connection transport wrapper: pre-received data push-back (for
//! peek-then-restore), a max-reads-per-event cap, and the `TransportInfo`
//! snapshot handed to the application on `onNewConnection`.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::os::unix::io::AsRawFd;
use std::time::{Duration, Instant};

use crate::net::socket_opts;
use crate::net::TcpStream;

/// Negotiated security transport type, reported alongside a ready connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecureTransportType {
    None,
    Tls,
}

/// Snapshot of connection-setup facts, populated progressively as the
/// connection moves from accept through handshake to ready. Mirrors the
/// `TransportInfo` fields referenced across §4.4 and §6.
#[derive(Debug, Clone)]
pub struct TransportInfo {
    pub accept_time: Instant,
    pub client_addr: SocketAddr,
    pub raw_bytes_received: u64,
    pub raw_bytes_written: u64,
    pub tfo_succeeded: bool,
    pub rtt: Option<Duration>,
    pub rtt_var: Option<Duration>,
    pub total_retransmits: Option<u32>,
    pub cwnd: Option<u32>,
    pub ssthresh: Option<u32>,
    pub ssl_setup_time: Option<Duration>,
    pub ssl_setup_bytes_read: u64,
    pub ssl_setup_bytes_written: u64,
    pub ssl_server_name: Option<String>,
    pub ssl_cipher: Option<String>,
    pub ssl_version: Option<String>,
    pub ssl_resume: bool,
    pub ssl_next_protocol: Option<String>,
}

impl TransportInfo {
    pub fn new(client_addr: SocketAddr, accept_time: Instant) -> Self {
        TransportInfo {
            accept_time,
            client_addr,
            raw_bytes_received: 0,
            raw_bytes_written: 0,
            tfo_succeeded: false,
            rtt: None,
            rtt_var: None,
            total_retransmits: None,
            cwnd: None,
            ssthresh: None,
            ssl_setup_time: None,
            ssl_setup_bytes_read: 0,
            ssl_setup_bytes_written: 0,
            ssl_server_name: None,
            ssl_cipher: None,
            ssl_version: None,
            ssl_resume: false,
            ssl_next_protocol: None,
        }
    }

    /// Fills in the OS-level fields this crate can read without an
    /// application-layer collaborator: RTT/retransmits/cwnd/ssthresh from
    /// `TCP_INFO`.
    pub fn populate_from_socket<S: TcpStream + AsRawFd>(&mut self, socket: &S) {
        if let Some(info) = socket_opts::read_tcp_info(socket.as_raw_fd()) {
            self.rtt = Some(Duration::from_micros(info.rtt_us as u64));
            self.rtt_var = Some(Duration::from_micros(info.rtt_var_us as u64));
            self.total_retransmits = Some(info.total_retrans);
            self.cwnd = Some(info.snd_cwnd);
            self.ssthresh = Some(info.snd_ssthresh);
        }
    }
}

/// Maximum reads serviced per connection per event-loop wakeup, so one fast
/// sender cannot starve its siblings. Spec default: 16.
pub const MAX_READS_PER_EVENT: u32 = 16;

/// Wraps a raw stream with a pre-received-data queue: bytes pushed back by
/// the [`crate::peeker::SocketPeeker`] are drained before further reads hit
/// the socket. This is the "peek-then-push-back" primitive from §9's design
/// notes.
pub struct Transport<S> {
    socket: S,
    pre_received: VecDeque<u8>,
    max_reads_per_event: u32,
}

impl<S: TcpStream> Transport<S> {
    pub fn new(socket: S) -> Self {
        Transport {
            socket,
            pre_received: VecDeque::new(),
            max_reads_per_event: MAX_READS_PER_EVENT,
        }
    }

    pub fn set_max_reads_per_event(&mut self, n: u32) {
        self.max_reads_per_event = n;
    }

    pub fn max_reads_per_event(&self) -> u32 {
        self.max_reads_per_event
    }

    /// Pushes bytes back so the next `read` sees them before hitting the
    /// socket. Used once, by the handshake path, to hand peeked bytes to
    /// whichever reader (TLS library or plaintext path) takes over.
    pub fn set_pre_received_data(&mut self, data: Vec<u8>) {
        self.pre_received.extend(data);
    }

    pub fn socket(&self) -> &S {
        &self.socket
    }

    pub fn socket_mut(&mut self) -> &mut S {
        &mut self.socket
    }

    pub fn into_socket(self) -> S {
        self.socket
    }
}

impl<S: TcpStream + Read> Read for Transport<S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if !self.pre_received.is_empty() {
            let n = std::cmp::min(buf.len(), self.pre_received.len());
            for slot in buf.iter_mut().take(n) {
                *slot = self.pre_received.pop_front().unwrap();
            }
            return Ok(n);
        }
        self.socket.read(buf)
    }
}

impl<S: TcpStream + Write> Write for Transport<S> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.socket.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.socket.flush()
    }
}
