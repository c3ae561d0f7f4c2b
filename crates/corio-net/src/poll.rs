//! Async emulation of poll(2) for coroutine contexts.

use crate::errno::{self, fail_errno};
use corio_core::bits::{bits_to_poll, poll_to_bits};
use corio_core::coroutine::{resume, resume_with_error, CoroutineRef};
use corio_core::event::{EventCallback, EventRef, RawFd};
use corio_core::failure::Failure;
use corio_core::reactor;
use corio_core::tls;
use corio_core::waker::{resume_when, waker_destroy, waker_new_with_timeout};
use std::cell::Cell;
use std::rc::Rc;

/// One monitored descriptor, layout-compatible with `struct pollfd`.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollFd {
    pub fd: RawFd,
    /// Requested events (`POLLIN` | `POLLOUT` | ...).
    pub events: i16,
    /// Reported events, written by the call.
    pub revents: i16,
}

impl PollFd {
    pub fn new(fd: RawFd, events: i16) -> Self {
        Self {
            fd,
            events,
            revents: 0,
        }
    }
}

/// Per-entry callback record: stashes the translated `revents` and counts
/// the entry once when it first reports readiness.
struct PollCallback {
    coroutine: CoroutineRef,
    revents: Rc<Cell<i16>>,
}

impl EventCallback for PollCallback {
    fn invoke(&self, event: &EventRef, failure: Option<&Failure>) {
        if let Some(failure) = failure {
            event.mark_failure_handled();
            resume_with_error(&self.coroutine, failure.clone());
            return;
        }

        if self.coroutine.has_waker() {
            let revents = bits_to_poll(event.triggered());
            let previous = self.revents.get();
            self.revents.set(revents);

            // The accumulator counts distinct ready entries, so only the
            // transition from "nothing" to "something" bumps it.
            if revents != 0 && previous == 0 {
                self.coroutine.with_waker(|w| w.bump_ready());
            }
        }

        resume(&self.coroutine);
    }
}

/// Wait for events on a set of descriptors without blocking the thread.
///
/// Follows poll(2): returns the number of entries whose `revents` is
/// non-zero, `0` when the timeout expires with nothing ready, or `-1`
/// with `errno` set. A negative `timeout_ms` waits indefinitely; `0`
/// returns after one reactor tick if nothing is immediately ready.
///
/// Extra error codes over the legacy contract: `EINVAL` when called
/// outside a coroutine, `ENOMEM` when the reactor refuses an event,
/// `ECANCELED`/`ETIMEDOUT`/`EINTR` for cooperative failures delivered
/// while suspended.
pub fn poll_async(entries: &mut [PollFd], timeout_ms: i32) -> i32 {
    let Some(coroutine) = tls::current_coroutine() else {
        return fail_errno(libc::EINVAL);
    };
    let Some(reactor) = tls::reactor() else {
        return fail_errno(libc::EINVAL);
    };

    let deadline = if timeout_ms < 0 {
        None
    } else {
        Some(timeout_ms as u64)
    };
    if let Err(failure) = waker_new_with_timeout(&coroutine, deadline) {
        coroutine.set_failure(failure);
        errno::consume_failure(&coroutine);
        waker_destroy(&coroutine);
        return -1;
    }

    // One readiness event per entry, each with a record pointing at that
    // entry's scratch slot. Ownership goes through the waker, so a failed
    // setup below unwinds every event registered so far.
    let mut scratch: Vec<Rc<Cell<i16>>> = Vec::with_capacity(entries.len());
    for entry in entries.iter() {
        let interest = poll_to_bits(entry.events);
        let event = match reactor.new_socket_event(entry.fd, interest) {
            Ok(event) => event,
            Err(_) => {
                waker_destroy(&coroutine);
                return fail_errno(libc::ENOMEM);
            }
        };

        let revents = Rc::new(Cell::new(0i16));
        let record = Rc::new(PollCallback {
            coroutine: coroutine.clone(),
            revents: revents.clone(),
        });
        if let Err(failure) = resume_when(&coroutine, event, true, record) {
            coroutine.set_failure(failure);
            errno::consume_failure(&coroutine);
            waker_destroy(&coroutine);
            return -1;
        }
        scratch.push(revents);
    }

    // Zero the counter only now, so callbacks firing between registration
    // and suspension still contribute.
    coroutine.with_waker(|w| w.init_counter());
    reactor::suspend();

    if coroutine.has_failure() {
        errno::consume_failure(&coroutine);
        waker_destroy(&coroutine);
        return -1;
    }

    let ready = coroutine.with_waker(|w| w.count()).unwrap_or(0) as i32;
    for (entry, slot) in entries.iter_mut().zip(scratch.iter()) {
        entry.revents = slot.get();
    }
    waker_destroy(&coroutine);
    ready
}
