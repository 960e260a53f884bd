/// We expect some [`std::io::Error`] during regular operations:
/// clients may hang up at any time, including while we're writing a
/// response to them.
use std::io::Error;
use std::io::ErrorKind;

/// Checks whether the error means the peer went away: broken pipe,
/// connection reset, or not connected anymore.  These are routine for
/// a server, and only worth logging at debug level.
pub fn is_disconnect_error(error: &Error) -> bool {
    match error.kind() {
        ErrorKind::BrokenPipe | ErrorKind::ConnectionReset | ErrorKind::NotConnected => true,
        _ => match error.raw_os_error() {
            Some(errno) => errno == libc::EPIPE || errno == libc::ECONNRESET,
            None => false,
        },
    }
}

// Mostly trivial, but let's at least make sure we didn't mess up raw_os_error
// and confirm that libc agrees with what we know to be true on Linux.
#[test]
fn test_getters() {
    assert!(is_disconnect_error(&Error::new(
        ErrorKind::BrokenPipe,
        "broken"
    )));
    assert!(!is_disconnect_error(&Error::new(
        ErrorKind::PermissionDenied,
        "bad"
    )));

    assert!(is_disconnect_error(&Error::from_raw_os_error(libc::EPIPE)));
    assert!(is_disconnect_error(&Error::from_raw_os_error(
        libc::ECONNRESET
    )));
    assert!(is_disconnect_error(&Error::from_raw_os_error(libc::ENOTCONN)));
    assert!(!is_disconnect_error(&Error::from_raw_os_error(libc::EIO)));

    #[cfg(target_os = "linux")]
    assert!(is_disconnect_error(&Error::from_raw_os_error(32))); // EPIPE
    #[cfg(target_os = "linux")]
    assert!(!is_disconnect_error(&Error::from_raw_os_error(1))); // EPERM
}
