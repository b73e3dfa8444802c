//! Raw socket-option access that neither `mio` nor `std::net` expose:
//! `SO_LINGER` with a zero timeout (used to force an RST instead of a clean
//! FIN on admission rejection) and `TCP_INFO` (used to populate
//! [`crate::transport::TransportInfo`]'s RTT and retransmit fields).

use std::io;
use std::mem;
use std::os::unix::io::RawFd;

/// Subset of `struct tcp_info` fields the transport layer reports.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TcpInfo {
    /// Smoothed round-trip time, in microseconds.
    pub rtt_us: u32,
    /// RTT variance, in microseconds.
    pub rtt_var_us: u32,
    /// Total segments retransmitted on this connection.
    pub total_retrans: u32,
    /// Current congestion window, in MSS-sized segments.
    pub snd_cwnd: u32,
    /// Slow-start threshold.
    pub snd_ssthresh: u32,
}

/// Sets `SO_LINGER` with `l_onoff = 1, l_linger = 0`, causing the next
/// `close()` on this fd to send RST instead of completing a graceful FIN
/// handshake. Used when an accepted connection is rejected by load shedding:
/// the peer should see an immediate reset rather than spend time on a
/// connection that's about to disappear.
pub fn set_linger_rst(fd: RawFd) -> io::Result<()> {
    let linger = libc::linger {
        l_onoff: 1,
        l_linger: 0,
    };
    let ret = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_LINGER,
            &linger as *const libc::linger as *const libc::c_void,
            mem::size_of::<libc::linger>() as libc::socklen_t,
        )
    };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Reads `TCP_INFO` for the given fd. Returns `None` on platforms or socket
/// states where the kernel doesn't populate it (e.g. the socket has already
/// been closed) rather than surfacing an error: this data is diagnostic only.
#[cfg(target_os = "linux")]
pub fn read_tcp_info(fd: RawFd) -> Option<TcpInfo> {
    let mut info: libc::tcp_info = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::tcp_info>() as libc::socklen_t;
    let ret = unsafe {
        libc::getsockopt(
            fd,
            libc::IPPROTO_TCP,
            libc::TCP_INFO,
            &mut info as *mut libc::tcp_info as *mut libc::c_void,
            &mut len,
        )
    };
    if ret != 0 {
        return None;
    }
    Some(TcpInfo {
        rtt_us: info.tcpi_rtt,
        rtt_var_us: info.tcpi_rttvar,
        total_retrans: info.tcpi_total_retrans,
        snd_cwnd: info.tcpi_snd_cwnd,
        snd_ssthresh: info.tcpi_snd_ssthresh,
    })
}

#[cfg(not(target_os = "linux"))]
pub fn read_tcp_info(_fd: RawFd) -> Option<TcpInfo> {
    None
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use super::*;
    use std::net::{TcpListener, TcpStream};
    use std::os::unix::io::AsRawFd;

    #[test]
    fn linger_rst_accepted_by_kernel() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        set_linger_rst(client.as_raw_fd()).unwrap();
    }

    #[test]
    fn tcp_info_readable_on_established_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        assert!(read_tcp_info(client.as_raw_fd()).is_some());
        drop(server);
    }
}
