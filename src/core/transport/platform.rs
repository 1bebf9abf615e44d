//! I/O error classification
//!
//! A disconnect closes the transport while its read task may still have a read
//! in flight. The OS then reports an "invalid handle" style error, which must
//! not reach the caller as a genuine I/O failure.

use std::io;

#[cfg(windows)]
const ERROR_INVALID_HANDLE: i32 = 6;

/// Was this error caused by a concurrent close of our own handle?
#[cfg(unix)]
pub fn is_closed_handle(err: &io::Error) -> bool {
    err.raw_os_error() == Some(libc::EBADF)
}

/// Was this error caused by a concurrent close of our own handle?
#[cfg(windows)]
pub fn is_closed_handle(err: &io::Error) -> bool {
    err.raw_os_error() == Some(ERROR_INVALID_HANDLE)
}

/// Was this error caused by a concurrent close of our own handle?
#[cfg(not(any(unix, windows)))]
pub fn is_closed_handle(_err: &io::Error) -> bool {
    false
}

/// The handle was already closed before we tried to close it
pub fn is_already_closed(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::NotConnected | io::ErrorKind::BrokenPipe | io::ErrorKind::UnexpectedEof
    ) || is_closed_handle(err)
}

/// A write failed because the peer is gone
pub fn is_dead_peer(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::UnexpectedEof
    ) || is_closed_handle(err)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    #[test]
    fn test_ebadf_is_closed_handle() {
        let err = io::Error::from_raw_os_error(libc::EBADF);
        assert!(is_closed_handle(&err));
        assert!(is_already_closed(&err));
    }

    #[test]
    fn test_dead_peer_kinds() {
        assert!(is_dead_peer(&io::Error::from(io::ErrorKind::BrokenPipe)));
        assert!(is_dead_peer(&io::Error::from(io::ErrorKind::ConnectionReset)));
        assert!(!is_dead_peer(&io::Error::from(io::ErrorKind::PermissionDenied)));
        assert!(!is_closed_handle(&io::Error::new(io::ErrorKind::Other, "boom")));
    }
}
