pub mod socket_opts;
pub mod tcp_listener;
pub mod tcp_stream;

pub use tcp_listener::TcpListener;
pub use tcp_stream::TcpStream;
