//! Byte-stream transport for modelwire.
//!
//! The queue broker and every queue-backed comm driver talk over Unix domain
//! sockets. This crate owns the socket lifecycle (bind, stale-path cleanup,
//! accept, connect, shutdown) and hands out [`IpcStream`] values that the frame
//! layer reads from and writes to.

pub mod error;
pub mod stream;

#[cfg(unix)]
pub mod uds;

pub use error::{Result, TransportError};
pub use stream::IpcStream;

#[cfg(unix)]
pub use uds::UnixDomainSocket;
