//! The consumed reactor boundary.
//!
//! The embedding runtime implements [`Reactor`] and installs it per thread
//! with [`crate::tls::install`]. The adapters never see past this trait:
//! event construction, coroutine scheduling, and the suspension primitive
//! all go through it.

use crate::addr::AddrInfoHints;
use crate::bits::EventBits;
use crate::coroutine::CoroutineRef;
use crate::event::{EventRef, RawFd};
use crate::failure::Failure;
use crate::tls;
use std::net::SocketAddr;
use std::time::Duration;

/// One reactor per thread; all adapter calls must originate from a
/// coroutine attached to that reactor.
pub trait Reactor {
    /// Readiness event for a socket descriptor.
    fn new_socket_event(&self, fd: RawFd, interest: EventBits) -> Result<EventRef, Failure>;

    /// Readiness event for a plain file descriptor (hosts that do not
    /// distinguish sockets route both constructors to the same source).
    fn new_fd_event(&self, fd: RawFd, interest: EventBits) -> Result<EventRef, Failure>;

    /// One-shot or periodic timer.
    fn new_timer_event(&self, timeout: Duration, periodic: bool) -> Result<EventRef, Failure>;

    /// Name-to-address resolution event.
    fn new_getaddrinfo_event(
        &self,
        node: Option<&str>,
        service: Option<&str>,
        hints: &AddrInfoHints,
    ) -> Result<EventRef, Failure>;

    /// Address-to-name resolution event.
    fn new_getnameinfo_event(&self, addr: SocketAddr) -> Result<EventRef, Failure>;

    /// Start a new coroutine running `f`.
    fn spawn(&self, f: Box<dyn FnOnce()>) -> CoroutineRef;

    /// Hand a resumed coroutine back to the scheduler.
    fn enqueue(&self, coroutine: &CoroutineRef);

    /// Park the current coroutine until it is enqueued again. Callbacks
    /// fire on the reactor thread while it is parked.
    fn suspend(&self);
}

/// Suspend the current coroutine on the thread's installed reactor.
pub fn suspend() {
    match tls::reactor() {
        Some(reactor) => reactor.suspend(),
        None => {
            crate::co_error!("suspend() with no reactor installed on this thread");
        }
    }
}
