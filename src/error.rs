use thiserror::Error;

/// Engine-level failures surfaced to callers.
///
/// Wire and dial failures never appear here: they are folded into the
/// [`Status`](crate::Status) an operation completes with.
#[derive(Debug, Error)]
pub enum Error {
    #[error("portal is shut down")]
    PortalClosed,
}
