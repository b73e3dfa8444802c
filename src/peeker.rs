//! Reads exactly *N* bytes from a transport's inbound stream without
//! consuming them from the application's point of view: the bytes are
//! pushed back onto the transport as pre-received data once the read
//! completes, via [`crate::transport::Transport::set_pre_received_data`].

use std::io::{self, Read};

use crate::error::PeekError;
use crate::net::TcpStream;
use crate::transport::Transport;

/// Outcome of a completed peek.
pub enum PeekOutcome {
    Success(Vec<u8>),
    Error(PeekError),
}

/// Drives a fixed-length, consume-free read. Fixed-length only: the peeker
/// declares up front how many bytes it needs and allocates exactly that
/// much, rather than accepting a movable/growable buffer.
pub struct SocketPeeker {
    required: usize,
    buf: Vec<u8>,
}

impl SocketPeeker {
    pub fn new(required: usize) -> Self {
        SocketPeeker {
            required,
            buf: Vec::with_capacity(required),
        }
    }

    /// `start()`: zero-length peeks succeed synchronously with an empty
    /// buffer and never touch the socket.
    pub fn is_trivial(&self) -> bool {
        self.required == 0
    }

    /// Attempts to read the remaining bytes from `transport`. Returns
    /// `Ok(None)` if more bytes are still needed (the caller should retry on
    /// the next readable event), `Ok(Some(outcome))` once the peek has
    /// concluded one way or another.
    pub fn poll<S: TcpStream + Read>(
        &mut self,
        transport: &mut Transport<S>,
    ) -> io::Result<Option<PeekOutcome>> {
        if self.is_trivial() {
            return Ok(Some(PeekOutcome::Success(Vec::new())));
        }
        let mut scratch = vec![0u8; self.required - self.buf.len()];
        loop {
            match transport.read(&mut scratch) {
                Ok(0) => {
                    return Ok(Some(PeekOutcome::Error(PeekError::Eof(self.required))));
                }
                Ok(n) => {
                    self.buf.extend_from_slice(&scratch[..n]);
                    if self.buf.len() == self.required {
                        let peeked = std::mem::take(&mut self.buf);
                        transport.set_pre_received_data(peeked.clone());
                        return Ok(Some(PeekOutcome::Success(peeked)));
                    }
                    scratch = vec![0u8; self.required - self.buf.len()];
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                Err(e) => return Ok(Some(PeekOutcome::Error(PeekError::Read(e)))),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read as _, Write};
    use std::net::{TcpListener, TcpStream as StdTcpStream};

    fn pair() -> (Transport<StdTcpStream>, StdTcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = StdTcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        server.set_nonblocking(true).unwrap();
        (Transport::new(server), client)
    }

    #[test]
    fn zero_length_peek_succeeds_without_touching_socket() {
        let (mut transport, _client) = pair();
        let mut peeker = SocketPeeker::new(0);
        match peeker.poll(&mut transport).unwrap() {
            Some(PeekOutcome::Success(bytes)) => assert!(bytes.is_empty()),
            _ => panic!("expected immediate success"),
        }
    }

    #[test]
    fn peeked_bytes_are_restored_for_next_reader() {
        let (mut transport, mut client) = pair();
        client.write_all(&[0x16, 0x03]).unwrap();
        let mut peeker = SocketPeeker::new(2);
        std::thread::sleep(std::time::Duration::from_millis(20));
        match peeker.poll(&mut transport).unwrap() {
            Some(PeekOutcome::Success(bytes)) => assert_eq!(bytes, vec![0x16, 0x03]),
            _ => panic!("expected peek success"),
        }
        let mut out = [0u8; 2];
        transport.read_exact(&mut out).unwrap();
        assert_eq!(out, [0x16, 0x03]);
    }
}
