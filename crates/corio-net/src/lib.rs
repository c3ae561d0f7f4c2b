//! # corio-net — blocking-contract network primitives for coroutines
//!
//! Drop-in async versions of poll, select, and the classic name-resolution
//! calls. Each function keeps its legacy contract — return value and
//! `errno` conventions included — but instead of blocking the thread it
//! registers reactor events, suspends the calling coroutine, and restores
//! the original semantics when the reactor wakes it:
//!
//! ```ignore
//! // Inside a coroutine — looks like blocking, suspends under the hood:
//! let mut entries = [PollFd::new(fd, libc::POLLIN)];
//! let ready = poll_async(&mut entries, 1000);
//!
//! let mut res = None;
//! getaddrinfo_async(Some("example.com"), None, &AddrInfoHints::default(), &mut res);
//! ```
//!
//! All functions must be called from a coroutine attached to the thread's
//! installed reactor; calling them elsewhere fails with `EINVAL` (or
//! `None` for the hostent-style wrappers).

pub mod blocking;
pub mod dns;
pub mod errno;
pub mod fdset;
pub mod poll;
pub mod select;

pub use blocking::set_socket_blocking;
pub use dns::{
    getaddresses_async, getaddrinfo_async, gethostbyaddr_async, gethostbyname_async, Hostent,
};
pub use errno::{consume_failure, last_errno, set_errno};
pub use fdset::FdSet;
pub use poll::{poll_async, PollFd};
pub use select::{select_async, TimeVal};
