use std::io;

/// Errors surfaced by the loop, the timer subsystem, and connection managers.
///
/// Success is expressed as `Ok(())`. The same taxonomy is used for the status
/// of the final connection callback, so the enum stays `Clone + Eq`;
/// underlying OS error detail is logged at the site where it is mapped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// A required parameter is missing or has the wrong type.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    /// The operation is not allowed in the current lifecycle state.
    #[error("operation not allowed in the current state")]
    InvalidState,
    /// An event source with that name is already registered.
    #[error("duplicate event source name")]
    NameConflict,
    /// Unknown connection id, timer id, or event source.
    #[error("not found")]
    NotFound,
    /// Allocation, descriptor exhaustion, or address in use.
    #[error("out of resources")]
    OutOfResources,
    /// An outbound connect was refused at the socket layer.
    #[error("connection rejected")]
    ConnectionRejected,
    /// The connection was closed by the peer or locally.
    #[error("connection closed")]
    ConnectionClosed,
    /// Reentrancy violation or inconsistent internal state.
    #[error("internal error")]
    Internal,
}

/// Map an OS error from a bind/listen/resource path.
pub(crate) fn resource_error(e: &io::Error) -> Error {
    match e.kind() {
        io::ErrorKind::AddrInUse
        | io::ErrorKind::AddrNotAvailable
        | io::ErrorKind::OutOfMemory => Error::OutOfResources,
        _ => match e.raw_os_error() {
            Some(libc::EMFILE) | Some(libc::ENFILE) | Some(libc::ENOBUFS)
            | Some(libc::ENOMEM) => Error::OutOfResources,
            _ => Error::Internal,
        },
    }
}
