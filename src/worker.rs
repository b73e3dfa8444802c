//! Per-worker event loop: one `mio::Poll`, one listener, one [`Acceptor`].
//! Everything here runs on a single thread; the only cross-thread entry
//! points are `force_stop` and `drop_connections(pct)`, both delivered
//! through a channel plus a `mio::Waker`.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::os::unix::io::AsRawFd;
use std::sync::mpsc::{Receiver, Sender};
use std::sync::Arc;
use std::time::{Duration, Instant};

use mio::{Events, Interest, Poll, Token, Waker};

use crate::acceptor::{Acceptor, AcceptorState, Tracked};
use crate::connection_manager::ConnKey;
use crate::net::{TcpListener, TcpStream};

const LISTEN_TOKEN: Token = Token(0);
const WAKE_TOKEN: Token = Token(1);
const FIRST_CONN_TOKEN: usize = 2;

/// Requests deliverable from any thread.
pub enum WorkerCommand {
    ForceStop,
    DropConnections(f64),
}

/// Drives one worker's listener + acceptor to completion, i.e. until the
/// acceptor reaches `AcceptorState::Done`.
pub struct Worker<L, S> {
    poll: Poll,
    waker: Arc<Waker>,
    listener: L,
    acceptor: Acceptor<S>,
    commands: Receiver<WorkerCommand>,
    tokens: HashMap<Token, ConnKey>,
    next_token: usize,
    max_accepts_per_wakeup: u32,
}

impl<S: TcpStream + Read + Write + AsRawFd + 'static, L: TcpListener<S> + mio::event::Source>
    Worker<L, S>
{
    pub fn new(
        mut listener: L,
        acceptor: Acceptor<S>,
    ) -> io::Result<(Self, Sender<WorkerCommand>)> {
        let poll = Poll::new()?;
        poll.registry()
            .register(&mut listener, LISTEN_TOKEN, Interest::READABLE)?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKE_TOKEN)?);
        let (tx, rx) = std::sync::mpsc::channel();
        Ok((
            Worker {
                poll,
                waker,
                listener,
                acceptor,
                commands: rx,
                tokens: HashMap::new(),
                next_token: FIRST_CONN_TOKEN,
                max_accepts_per_wakeup: 64,
            },
            tx,
        ))
    }

    pub fn waker(&self) -> Arc<Waker> {
        self.waker.clone()
    }

    /// Runs the event loop until the acceptor finishes draining.
    pub fn run(&mut self) -> io::Result<()> {
        self.acceptor.start();
        let mut events = Events::with_capacity(1024);
        while self.acceptor.state() != AcceptorState::Done {
            let timeout = self.next_poll_timeout();
            match self.poll.poll(&mut events, timeout) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }

            for event in events.iter() {
                match event.token() {
                    LISTEN_TOKEN => self.accept_loop()?,
                    WAKE_TOKEN => self.drain_commands(),
                    token => {
                        if let Some(&key) = self.tokens.get(&token) {
                            match self.acceptor.poll_handshake(key) {
                                Some(settled) if self.handshake_settled(settled) => {
                                    self.tokens.remove(&token);
                                }
                                Some(settled) => {
                                    self.tokens.insert(token, settled);
                                }
                                None => {
                                    self.tokens.remove(&token);
                                }
                            }
                        }
                    }
                }
            }

            if self.acceptor.state() == AcceptorState::Draining {
                self.acceptor.drain_tick();
            }
            self.fire_expired_timers();
        }
        Ok(())
    }

    fn handshake_settled(&self, key: ConnKey) -> bool {
        !matches!(self.acceptor.connections().get(key), Some(Tracked::Handshake(_)))
    }

    fn accept_loop(&mut self) -> io::Result<()> {
        for _ in 0..self.max_accepts_per_wakeup {
            match self.listener.accept() {
                Ok((mut socket, addr)) => {
                    let token = Token(self.next_token);
                    self.next_token += 1;
                    if let Err(e) =
                        self.poll
                            .registry()
                            .register(&mut socket, token, Interest::READABLE | Interest::WRITABLE)
                    {
                        log::warn!("failed to register accepted socket: {e}");
                        continue;
                    }
                    if let Some(key) = self.acceptor.connection_accepted(socket, addr, 0, 0) {
                        self.tokens.insert(token, key);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    log::error!("accept error: {e}");
                    break;
                }
            }
        }
        Ok(())
    }

    fn drain_commands(&mut self) {
        while let Ok(cmd) = self.commands.try_recv() {
            match cmd {
                WorkerCommand::ForceStop => self.acceptor.force_stop(),
                WorkerCommand::DropConnections(pct) => self.acceptor.drop_connections(pct),
            }
        }
    }

    /// Dispatches every timer id that's come due: idle timeouts, handshake
    /// timeouts (armed the same way, since a `HandshakeManager` is itself a
    /// connection), and drain grace timers all resolve through the same
    /// per-id lookup.
    fn fire_expired_timers(&mut self) {
        let now = Instant::now();
        let fired = self.acceptor.timer_wheel_mut().pop_expired(now);
        for id in fired {
            self.acceptor.handle_timer_fired(id);
        }
    }

    fn next_poll_timeout(&mut self) -> Option<Duration> {
        let wheel = self.acceptor.timer_wheel_mut();
        wheel
            .next_deadline()
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }
}
