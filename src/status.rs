//! Completion statuses carried by operation callbacks.

use std::fmt;

/// Outcome of a single protocol phase, and ultimately of a whole operation.
///
/// The engine never interprets payloads; the only channel a [`Protocol`]
/// implementation has to influence scheduling is the status it returns from
/// each phase.
///
/// [`Protocol`]: crate::op::Protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// The phase completed normally.
    Success,
    /// The peer asked for the command to be retried on a fresh connection.
    ///
    /// The connection is torn down, the operation is re-queued, and the
    /// portal pauses for the operation's `retry_wait` before reconnecting.
    Retry,
    /// The phase did not complete within the operation's deadline.
    Timeout,
    /// The socket died mid-exchange.
    Dead,
    /// The portal's host does not resolve; nothing will ever connect.
    InvalidHost,
    /// The host resolves but connections keep failing.
    CantConnect,
    /// Any other failure; reported to the caller as-is.
    Error,
}

impl Status {
    /// `true` for [`Status::Success`].
    pub fn is_success(self) -> bool {
        matches!(self, Status::Success)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Status::Success => "success",
            Status::Retry => "retry",
            Status::Timeout => "timeout",
            Status::Dead => "dead",
            Status::InvalidHost => "invalid host",
            Status::CantConnect => "can't connect",
            Status::Error => "error",
        };
        f.write_str(name)
    }
}
