//! Acceptor, connection lifecycle, and TLS-peeking pipeline dispatch for a
//! single worker thread. See the crate's design notes for how the pieces
//! fit together: a listener hands raw sockets to an [`acceptor::Acceptor`],
//! which runs admission and load-shed checks, peeks the first bytes of each
//! connection to pick plaintext or TLS, drives the handshake to completion,
//! and registers the result with a [`connection_manager::ConnectionManager`]
//! for idle tracking and graceful drain.

pub mod acceptor;
pub mod config;
pub mod connection;
pub mod connection_manager;
pub mod error;
pub mod handshake;
pub mod load_shed;
pub mod net;
pub mod peeker;
pub mod routing;
pub mod security_protocol;
pub mod sni;
pub mod stats;
pub mod timer;
pub mod transport;
pub mod worker;
