//! Accept-loop transient-failure policy
//!
//! Both listeners recover from transient accept errors with the same
//! exponential backoff: 5 ms doubling to a 1 s cap, reset on success.
//! Anything else is fatal.

use std::io;
use std::time::Duration;

const INITIAL_DELAY: Duration = Duration::from_millis(5);
const MAX_DELAY: Duration = Duration::from_secs(1);

/// Whether an accept error is worth retrying.
///
/// The case this exists for is descriptor exhaustion under load
/// (EMFILE/ENFILE, plus ENOBUFS), which the stdlib surfaces only
/// through the raw OS error; connections aborted before accept
/// (ECONNABORTED) are retried too.
pub fn is_transient(err: &io::Error) -> bool {
    #[cfg(unix)]
    if let Some(code) = err.raw_os_error() {
        return matches!(
            code,
            libc::EMFILE | libc::ENFILE | libc::ENOBUFS | libc::ECONNABORTED
        );
    }
    err.kind() == io::ErrorKind::ConnectionAborted
}

/// Next backoff step after a transient failure.
pub fn next_delay(current: Duration) -> Duration {
    if current.is_zero() {
        INITIAL_DELAY
    } else {
        (current * 2).min(MAX_DELAY)
    }
}
