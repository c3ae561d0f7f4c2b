//! Socket blocking-mode toggle.

use corio_core::event::RawFd;
use corio_core::failure::Failure;
use std::io;

/// Switch a descriptor between blocking and non-blocking mode.
pub fn set_socket_blocking(fd: RawFd, blocking: bool) -> Result<(), Failure> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
    if flags == -1 {
        return Err(Failure::other(format!(
            "fcntl(F_GETFL) failed: {}",
            io::Error::last_os_error()
        )));
    }

    let new_flags = if blocking {
        flags & !libc::O_NONBLOCK
    } else {
        flags | libc::O_NONBLOCK
    };
    if unsafe { libc::fcntl(fd, libc::F_SETFL, new_flags) } == -1 {
        return Err(Failure::other(format!(
            "fcntl(F_SETFL) failed: {}",
            io::Error::last_os_error()
        )));
    }

    Ok(())
}
