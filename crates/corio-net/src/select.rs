//! Async emulation of select(2) for coroutine contexts.

use crate::errno::{self, fail_errno};
use crate::fdset::FdSet;
use corio_core::bits::EventBits;
use corio_core::coroutine::{resume, resume_with_error, CoroutineRef};
use corio_core::event::{EventCallback, EventRef, RawFd};
use corio_core::failure::Failure;
use corio_core::reactor;
use corio_core::tls;
use corio_core::waker::{resume_when, waker_destroy, waker_new_with_timeout};
use std::cell::{Cell, RefCell};
use std::rc::Rc;

/// Timeout specification, mirroring `struct timeval`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeVal {
    pub sec: i64,
    pub usec: i64,
}

impl TimeVal {
    pub fn from_ms(ms: u64) -> Self {
        Self {
            sec: (ms / 1000) as i64,
            usec: ((ms % 1000) * 1000) as i64,
        }
    }

    pub fn to_ms(&self) -> u64 {
        (self.sec * 1000 + self.usec / 1000).max(0) as u64
    }
}

/// Per-descriptor callback record: flips the fd in the scratch sets that
/// match its triggered bits and counts the descriptor once.
struct SelectCallback {
    coroutine: CoroutineRef,
    fd: RawFd,
    rfds: Rc<RefCell<FdSet>>,
    wfds: Rc<RefCell<FdSet>>,
    efds: Rc<RefCell<FdSet>>,
    counted: Cell<bool>,
}

impl EventCallback for SelectCallback {
    fn invoke(&self, event: &EventRef, failure: Option<&Failure>) {
        if let Some(failure) = failure {
            event.mark_failure_handled();
            resume_with_error(&self.coroutine, failure.clone());
            return;
        }

        if self.coroutine.has_waker() {
            let triggered = event.triggered();
            if !triggered.is_empty() {
                if !self.counted.get() {
                    self.counted.set(true);
                    self.coroutine.with_waker(|w| w.bump_ready());
                }

                if triggered.contains(EventBits::READABLE) {
                    self.rfds.borrow_mut().insert(self.fd);
                }
                if triggered.contains(EventBits::WRITABLE) {
                    self.wfds.borrow_mut().insert(self.fd);
                }
                if triggered.intersects(EventBits::DISCONNECT | EventBits::PRIORITIZED) {
                    self.efds.borrow_mut().insert(self.fd);
                }
            }
        }

        resume(&self.coroutine);
    }
}

fn requested(set: &Option<&mut FdSet>, fd: RawFd) -> bool {
    set.as_ref().map_or(false, |s| s.contains(fd))
}

/// Wait for readiness across three descriptor sets without blocking the
/// thread.
///
/// Follows select(2): the provided sets are overwritten with the
/// descriptors that became ready, and the return value is the number of
/// ready descriptors (`0` on timeout, `-1` with `errno` on error).
///
/// The descriptor range scanned is `0..max_fd` — callers pass the
/// conventional highest-descriptor-plus-one. `max_fd` larger than
/// `i32::MAX` fails with `-1`. `tv = None` waits indefinitely; a zero
/// timeval returns after one reactor tick.
pub fn select_async(
    max_fd: usize,
    mut rfds: Option<&mut FdSet>,
    mut wfds: Option<&mut FdSet>,
    mut efds: Option<&mut FdSet>,
    tv: Option<&TimeVal>,
) -> i32 {
    let Some(coroutine) = tls::current_coroutine() else {
        return fail_errno(libc::EINVAL);
    };
    let Some(reactor) = tls::reactor() else {
        return fail_errno(libc::EINVAL);
    };

    if max_fd > i32::MAX as usize {
        return -1;
    }

    let deadline = tv.map(TimeVal::to_ms);
    if let Err(failure) = waker_new_with_timeout(&coroutine, deadline) {
        coroutine.set_failure(failure);
        errno::consume_failure(&coroutine);
        waker_destroy(&coroutine);
        return -1;
    }

    // Results accumulate in scratch sets and overwrite the inputs only on
    // the success path, preserving the select() output convention.
    let scratch_r = Rc::new(RefCell::new(FdSet::new()));
    let scratch_w = Rc::new(RefCell::new(FdSet::new()));
    let scratch_e = Rc::new(RefCell::new(FdSet::new()));

    for fd in 0..max_fd as RawFd {
        let mut interest = EventBits::NONE;
        if requested(&rfds, fd) {
            interest |= EventBits::READABLE;
        }
        if requested(&wfds, fd) {
            interest |= EventBits::WRITABLE;
        }
        if requested(&efds, fd) {
            interest |= EventBits::PRIORITIZED;
        }
        if interest.is_empty() {
            continue;
        }

        let event = match reactor.new_fd_event(fd, interest) {
            Ok(event) => event,
            Err(_) => {
                waker_destroy(&coroutine);
                return fail_errno(libc::ENOMEM);
            }
        };

        let record = Rc::new(SelectCallback {
            coroutine: coroutine.clone(),
            fd,
            rfds: scratch_r.clone(),
            wfds: scratch_w.clone(),
            efds: scratch_e.clone(),
            counted: Cell::new(false),
        });
        if let Err(failure) = resume_when(&coroutine, event, true, record) {
            coroutine.set_failure(failure);
            errno::consume_failure(&coroutine);
            waker_destroy(&coroutine);
            return -1;
        }
    }

    coroutine.with_waker(|w| w.init_counter());
    reactor::suspend();

    if coroutine.has_failure() {
        errno::consume_failure(&coroutine);
        waker_destroy(&coroutine);
        return -1;
    }

    let ready = coroutine.with_waker(|w| w.count()).unwrap_or(0) as i32;

    if let Some(out) = rfds.as_deref_mut() {
        *out = *scratch_r.borrow();
    }
    if let Some(out) = wfds.as_deref_mut() {
        *out = *scratch_w.borrow();
    }
    if let Some(out) = efds.as_deref_mut() {
        *out = *scratch_e.borrow();
    }

    waker_destroy(&coroutine);
    ready
}

#[cfg(test)]
mod tests {
    use super::*;
    use corio_core::lab::LabReactor;

    fn lab() -> Rc<LabReactor> {
        let lab = LabReactor::new();
        lab.install();
        lab
    }

    #[test]
    fn zero_timeout_returns_zero_and_empty_sets() {
        let lab = lab();
        let mut rfds = FdSet::new();
        rfds.insert(3);

        let ret = lab.enter(|| {
            select_async(
                4,
                Some(&mut rfds),
                None,
                None,
                Some(&TimeVal::from_ms(0)),
            )
        });

        assert_eq!(ret, 0);
        assert_eq!(rfds.count_below(8), 0);
        assert_eq!(lab.live_events(), 0);
    }

    #[test]
    fn ready_descriptors_land_in_matching_sets() {
        let lab = lab();
        let mut rfds = FdSet::new();
        let mut wfds = FdSet::new();
        rfds.insert(3);
        wfds.insert(4);

        let ret = lab.clone().enter(|| {
            let fire = lab.clone();
            lab.on_suspend(move || {
                fire.fire_fd(3, EventBits::READABLE);
                fire.fire_fd(4, EventBits::WRITABLE);
            });
            select_async(5, Some(&mut rfds), Some(&mut wfds), None, None)
        });

        assert_eq!(ret, 2);
        assert!(rfds.contains(3));
        assert!(!rfds.contains(4));
        assert!(wfds.contains(4));
        assert!(!wfds.contains(3));
    }

    #[test]
    fn disconnect_and_prioritized_land_in_the_exception_set() {
        let lab = lab();
        let mut efds = FdSet::new();
        efds.insert(6);
        efds.insert(7);

        let ret = lab.clone().enter(|| {
            let fire = lab.clone();
            lab.on_suspend(move || {
                fire.fire_fd(6, EventBits::PRIORITIZED);
                fire.fire_fd(7, EventBits::DISCONNECT);
            });
            select_async(8, None, None, Some(&mut efds), None)
        });

        assert_eq!(ret, 2);
        assert!(efds.contains(6));
        assert!(efds.contains(7));
    }

    #[test]
    fn unrequested_descriptors_never_appear_in_outputs() {
        let lab = lab();
        let mut rfds = FdSet::new();
        let mut wfds = FdSet::new();
        rfds.insert(3);

        let ret = lab.clone().enter(|| {
            let fire = lab.clone();
            lab.on_suspend(move || fire.fire_fd(3, EventBits::READABLE));
            select_async(5, Some(&mut rfds), Some(&mut wfds), None, None)
        });

        assert_eq!(ret, 1);
        assert!(rfds.contains(3));
        assert_eq!(wfds.count_below(8), 0);
    }

    #[test]
    fn fd_equal_to_max_fd_is_ignored() {
        // The scanned range is exclusive: fd 3 with max_fd 3 registers
        // nothing, so the call times out with no descriptors watched.
        let lab = lab();
        let mut rfds = FdSet::new();
        rfds.insert(3);

        let ret = lab.enter(|| {
            select_async(3, Some(&mut rfds), None, None, Some(&TimeVal::from_ms(0)))
        });

        assert_eq!(ret, 0);
        assert_eq!(rfds.count_below(8), 0);
        assert_eq!(lab.live_events(), 0);
    }

    #[test]
    fn outside_coroutine_is_einval() {
        let mut rfds = FdSet::new();
        rfds.insert(1);
        assert_eq!(select_async(2, Some(&mut rfds), None, None, None), -1);
        assert_eq!(errno::last_errno(), libc::EINVAL);
    }

    #[test]
    fn oversized_max_fd_fails() {
        let lab = lab();
        let ret = lab.enter(|| select_async(i32::MAX as usize + 1, None, None, None, None));
        assert_eq!(ret, -1);
    }

    #[test]
    fn construction_failure_is_enomem() {
        let lab = lab();
        let mut rfds = FdSet::new();
        rfds.insert(0);
        rfds.insert(1);

        let ret = lab.clone().enter_with(|co| {
            lab.refuse_events_after(1, 1);
            let ret = select_async(2, Some(&mut rfds), None, None, None);
            assert!(!co.has_waker());
            ret
        });

        assert_eq!(ret, -1);
        assert_eq!(errno::last_errno(), libc::ENOMEM);
        assert_eq!(lab.live_events(), 0);
    }

    #[test]
    fn timeval_conversion() {
        assert_eq!(TimeVal::from_ms(1500), TimeVal { sec: 1, usec: 500_000 });
        assert_eq!(TimeVal { sec: 2, usec: 250_000 }.to_ms(), 2250);
        assert_eq!(TimeVal { sec: 0, usec: 0 }.to_ms(), 0);
    }
}
