//! A self-tuning pool of pipelined client connections to a remote host.
//!
//! Work is submitted to a [`HostPortal`] as [`Op`]s: opaque operations
//! carrying their own send/receive callbacks ([`Protocol`]). Each pooled
//! connection runs a sender and a receiver task that pipeline commands: the
//! sender writes request phases for new operations while the receiver reads
//! responses for earlier ones. The pool retires idle connections, pauses
//! after failures, re-queues work stranded on a dead socket, and fails the
//! queue outright when the endpoint is unreachable.
//!
//! The engine never frames bytes: the [`Transport`] dials and closes
//! streams, and each operation's [`Protocol`] owns its wire phases.

pub mod context;
pub mod error;
pub mod op;
pub mod portal;
pub mod status;
pub mod transport;

mod connection;

pub use context::{ContextConfig, PortalContext};
pub use error::Error;
pub use op::{Op, OpConfig, Protocol};
pub use portal::{HostPortal, PortalStats};
pub use status::Status;
pub use transport::{ConnectionStream, NetReader, NetStream, NetWriter, TcpTransport, Transport};

pub type Result<T> = std::result::Result<T, Error>;
