//! Failure-to-errno mapping.
//!
//! After a suspension the coroutine may carry a pending cooperative
//! failure. [`consume_failure`] takes it exactly once and sets the thread
//! `errno` the way the legacy callers expect:
//!
//! | failure | errno |
//! |---|---|
//! | cancelled | `ECANCELED` |
//! | timeout | `ETIMEDOUT` |
//! | anything else | `EINTR` (and a warning is logged) |
//! | none pending | `EINTR` |

use corio_core::co_warn;
use corio_core::coroutine::CoroutineRef;
use corio_core::failure::Failure;

#[cfg(target_os = "linux")]
fn errno_ptr() -> *mut libc::c_int {
    unsafe { libc::__errno_location() }
}

#[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
fn errno_ptr() -> *mut libc::c_int {
    unsafe { libc::__error() }
}

/// Set the thread `errno`.
pub fn set_errno(code: i32) {
    unsafe { *errno_ptr() = code };
}

/// Read the thread `errno`.
pub fn last_errno() -> i32 {
    unsafe { *errno_ptr() }
}

/// Consume the coroutine's pending failure (if any), set `errno` from it,
/// and return the chosen code.
pub fn consume_failure(coroutine: &CoroutineRef) -> i32 {
    let code = match coroutine.take_failure() {
        Some(Failure::Cancelled) => libc::ECANCELED,
        Some(Failure::Timeout) => libc::ETIMEDOUT,
        Some(Failure::Other(msg)) => {
            co_warn!("async operation interrupted: {}", msg);
            libc::EINTR
        }
        None => libc::EINTR,
    };
    set_errno(code);
    code
}

/// Set `errno` and return `-1`, the usual synchronous error exit.
pub fn fail_errno(code: i32) -> i32 {
    set_errno(code);
    -1
}
