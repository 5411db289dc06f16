//! Network transports for replication.

pub mod tcp;

pub use tcp::TcpTransport;
