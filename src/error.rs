//! Errno-shaped error types for the producer path and its collaborators.

/// Errors returned by [`crate::producer::tcp_send`].
///
/// These map onto the errno set named in SPEC_FULL.md §7; partial progress always
/// trumps a later error (see `tcp_send`'s partial-progress rule), so this type is
/// only ever returned when *zero* bytes were queued on the call that produced it.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SendError {
    #[error("descriptor is not a stream socket")]
    NotSocket,

    #[error("socket is not connected")]
    NotConnected,

    #[error("peer link-layer address is not resolved")]
    NetUnreachable,

    #[error("operation would block")]
    WouldBlock,

    #[error("no memory available for a write buffer")]
    OutOfMemory,
}

/// Errors from accept-queue / listener management in [`crate::table::ConnectionTable`].
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TableError {
    #[error("port {0} is already bound by a listener")]
    PortInUse(u16),

    #[error("no listener is registered on port {0}")]
    NoListener(u16),
}
