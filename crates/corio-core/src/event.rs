//! The polymorphic reactor event surface.
//!
//! An [`Event`] is a pending asynchronous condition: socket readiness, fd
//! readiness, a timer, a DNS lookup, or a transfer in flight. Reactors
//! construct their own event types; the transfer bridge in `corio-transfer`
//! implements the trait itself. All of them share the bookkeeping in
//! [`EventCore`]: the callback list, the closed flag, the triggered bitset
//! and the numeric result slot.
//!
//! Lifecycle contract:
//! - `start` arms the event with its backing source (fallible);
//! - `stop` disarms it and marks it closed (idempotent);
//! - `dispose` releases it, stopping first if it is still live.
//!
//! Exactly one owner is responsible for `dispose` per event: the waker for
//! events linked through it, or the bridge context for sockets and timers
//! the transfer engine manages.

use crate::addr::AddrInfoList;
use crate::bits::EventBits;
use crate::failure::Failure;
use std::any::Any;
use std::cell::{Cell, RefCell};
use std::rc::Rc;

/// Raw file descriptor, as the legacy APIs pass it around.
pub type RawFd = i32;

/// Sentinel for "no descriptor".
pub const INVALID_FD: RawFd = -1;

/// A callback record attached to an event.
///
/// Records are small heap structs binding the reactor callback to the
/// awaiting coroutine and the caller-visible result buffers. The contract:
/// if `failure` is set, mark it handled on the event and resume the
/// coroutine with that failure; otherwise update the result buffers and
/// the waker accumulator, then resume. Resumption is idempotent — the
/// first resumption schedules the coroutine, later callbacks only update
/// the accumulator.
pub trait EventCallback {
    fn invoke(&self, event: &EventRef, failure: Option<&Failure>);
}

/// The reactor-facing event surface.
///
/// Accessors with defaults cover the variant-specific fields: readiness
/// variants expose `triggered`/`socket`/`update_interest`, DNS variants
/// expose `addr_result`/`hostname`, and the transfer bridge uses the
/// numeric `result` slot.
pub trait Event {
    /// Arm the event. Fails when the backing source refuses it.
    fn start(&self) -> Result<(), Failure>;

    /// Disarm the event and mark it closed. Safe to call twice.
    fn stop(&self);

    /// Release the event; stops first if it is still live.
    fn dispose(&self);

    fn add_callback(&self, callback: Rc<dyn EventCallback>);
    fn del_callback(&self, callback: &Rc<dyn EventCallback>);
    fn is_closed(&self) -> bool;

    /// Record that a delivered failure was consumed by a callback, so the
    /// reactor does not propagate it further.
    fn mark_failure_handled(&self);

    /// Readiness bits observed at the last trigger.
    fn triggered(&self) -> EventBits {
        EventBits::NONE
    }

    /// Descriptor this event watches, or [`INVALID_FD`].
    fn socket(&self) -> RawFd {
        INVALID_FD
    }

    /// OR additional readiness bits into the watched interest set.
    fn update_interest(&self, _bits: EventBits) {}

    /// Resolved address chain (DNS address-info variant).
    fn addr_result(&self) -> Option<AddrInfoList> {
        None
    }

    /// Resolved host name (DNS name-info variant).
    fn hostname(&self) -> Option<Rc<str>> {
        None
    }

    /// Numeric completion result, when one was recorded.
    fn result(&self) -> Option<i64> {
        None
    }

    /// Record a numeric completion result.
    fn set_result(&self, _value: i64) {}

    /// Concrete-type escape hatch, the trait-object analogue of the
    /// event-struct downcasts reactors do internally.
    fn as_any(&self) -> &dyn Any;
}

pub type EventRef = Rc<dyn Event>;

fn same_callback(a: &Rc<dyn EventCallback>, b: &Rc<dyn EventCallback>) -> bool {
    // Compare allocation addresses; the vtable half of the fat pointer is
    // irrelevant for identity.
    std::ptr::eq(
        Rc::as_ptr(a) as *const u8,
        Rc::as_ptr(b) as *const u8,
    )
}

/// Shared event bookkeeping embedded by every event implementation.
pub struct EventCore {
    callbacks: RefCell<Vec<Rc<dyn EventCallback>>>,
    closed: Cell<bool>,
    triggered: Cell<EventBits>,
    result: Cell<Option<i64>>,
    failure_handled: Cell<bool>,
}

impl Default for EventCore {
    fn default() -> Self {
        Self::new()
    }
}

impl EventCore {
    pub fn new() -> Self {
        Self {
            callbacks: RefCell::new(Vec::new()),
            closed: Cell::new(false),
            triggered: Cell::new(EventBits::NONE),
            result: Cell::new(None),
            failure_handled: Cell::new(false),
        }
    }

    pub fn add_callback(&self, callback: Rc<dyn EventCallback>) {
        self.callbacks.borrow_mut().push(callback);
    }

    pub fn del_callback(&self, callback: &Rc<dyn EventCallback>) {
        self.callbacks
            .borrow_mut()
            .retain(|cb| !same_callback(cb, callback));
    }

    pub fn callback_count(&self) -> usize {
        self.callbacks.borrow().len()
    }

    pub fn clear_callbacks(&self) {
        self.callbacks.borrow_mut().clear();
    }

    /// Invoke every attached callback. The list is snapshotted first so a
    /// callback may detach itself (or its siblings) mid-notify.
    pub fn notify(&self, event: &EventRef, failure: Option<&Failure>) {
        let snapshot: Vec<_> = self.callbacks.borrow().clone();
        for callback in snapshot {
            callback.invoke(event, failure);
        }
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed.get()
    }

    #[inline]
    pub fn set_closed(&self) {
        self.closed.set(true);
    }

    #[inline]
    pub fn triggered(&self) -> EventBits {
        self.triggered.get()
    }

    #[inline]
    pub fn set_triggered(&self, bits: EventBits) {
        self.triggered.set(bits);
    }

    #[inline]
    pub fn result(&self) -> Option<i64> {
        self.result.get()
    }

    #[inline]
    pub fn set_result(&self, value: i64) {
        self.result.set(Some(value));
    }

    #[inline]
    pub fn mark_failure_handled(&self) {
        self.failure_handled.set(true);
    }

    #[inline]
    pub fn failure_handled(&self) -> bool {
        self.failure_handled.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    struct StubEvent {
        core: EventCore,
    }

    impl Event for StubEvent {
        fn start(&self) -> Result<(), Failure> {
            Ok(())
        }
        fn stop(&self) {
            self.core.set_closed();
        }
        fn dispose(&self) {
            if !self.core.is_closed() {
                self.stop();
            }
        }
        fn add_callback(&self, callback: Rc<dyn EventCallback>) {
            self.core.add_callback(callback);
        }
        fn del_callback(&self, callback: &Rc<dyn EventCallback>) {
            self.core.del_callback(callback);
        }
        fn is_closed(&self) -> bool {
            self.core.is_closed()
        }
        fn mark_failure_handled(&self) {
            self.core.mark_failure_handled();
        }
        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    struct CountingCallback {
        hits: Cell<u32>,
        failures: Cell<u32>,
    }

    impl EventCallback for CountingCallback {
        fn invoke(&self, _event: &EventRef, failure: Option<&Failure>) {
            self.hits.set(self.hits.get() + 1);
            if failure.is_some() {
                self.failures.set(self.failures.get() + 1);
            }
        }
    }

    fn stub() -> Rc<StubEvent> {
        Rc::new(StubEvent {
            core: EventCore::new(),
        })
    }

    #[test]
    fn notify_reaches_every_callback() {
        let event = stub();
        let a = Rc::new(CountingCallback {
            hits: Cell::new(0),
            failures: Cell::new(0),
        });
        let b = Rc::new(CountingCallback {
            hits: Cell::new(0),
            failures: Cell::new(0),
        });
        event.add_callback(a.clone());
        event.add_callback(b.clone());

        let as_ref: EventRef = event.clone();
        event.core.notify(&as_ref, None);
        assert_eq!(a.hits.get(), 1);
        assert_eq!(b.hits.get(), 1);

        event.core.notify(&as_ref, Some(&Failure::Cancelled));
        assert_eq!(a.failures.get(), 1);
        assert_eq!(b.failures.get(), 1);
    }

    #[test]
    fn del_callback_removes_by_identity() {
        let event = stub();
        let a: Rc<dyn EventCallback> = Rc::new(CountingCallback {
            hits: Cell::new(0),
            failures: Cell::new(0),
        });
        let b: Rc<dyn EventCallback> = Rc::new(CountingCallback {
            hits: Cell::new(0),
            failures: Cell::new(0),
        });
        event.add_callback(a.clone());
        event.add_callback(b.clone());
        assert_eq!(event.core.callback_count(), 2);

        event.del_callback(&a);
        assert_eq!(event.core.callback_count(), 1);
        event.del_callback(&a);
        assert_eq!(event.core.callback_count(), 1);
        event.del_callback(&b);
        assert_eq!(event.core.callback_count(), 0);
    }

    struct SelfDetaching {
        event: RefCell<Option<EventRef>>,
        me: RefCell<Option<Rc<dyn EventCallback>>>,
        hits: Cell<u32>,
    }

    impl EventCallback for SelfDetaching {
        fn invoke(&self, event: &EventRef, _failure: Option<&Failure>) {
            self.hits.set(self.hits.get() + 1);
            if let Some(me) = self.me.borrow().as_ref() {
                event.del_callback(me);
            }
            *self.event.borrow_mut() = Some(event.clone());
        }
    }

    #[test]
    fn callback_may_detach_itself_during_notify() {
        let event = stub();
        let cb = Rc::new(SelfDetaching {
            event: RefCell::new(None),
            me: RefCell::new(None),
            hits: Cell::new(0),
        });
        let as_dyn: Rc<dyn EventCallback> = cb.clone();
        *cb.me.borrow_mut() = Some(as_dyn.clone());
        event.add_callback(as_dyn);

        let as_ref: EventRef = event.clone();
        event.core.notify(&as_ref, None);
        assert_eq!(cb.hits.get(), 1);
        assert_eq!(event.core.callback_count(), 0);

        // Second notify finds nobody.
        event.core.notify(&as_ref, None);
        assert_eq!(cb.hits.get(), 1);
        *cb.me.borrow_mut() = None;
        *cb.event.borrow_mut() = None;
    }

    #[test]
    fn dispose_stops_a_live_event() {
        let event = stub();
        assert!(!event.is_closed());
        event.dispose();
        assert!(event.is_closed());
    }

    #[test]
    fn result_slot_round_trips() {
        let core = EventCore::new();
        assert_eq!(core.result(), None);
        core.set_result(23);
        assert_eq!(core.result(), Some(23));
    }
}
