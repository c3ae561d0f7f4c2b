//! Per-suspension waker: result accumulator plus event ownership.
//!
//! Every adapter call creates a waker on the current coroutine, links the
//! reactor events it registers through it, suspends, and destroys it on
//! the way out — success or failure. Destruction is the single point that
//! cancels events: callbacks are detached from every linked event and
//! owned events are disposed, which is what breaks the
//! waker → event → callback → coroutine reference cycle.

use crate::coroutine::{resume, resume_with_error, CoroutineRef};
use crate::event::{EventCallback, EventRef};
use crate::failure::Failure;
use crate::tls;
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;

/// The accumulator value a waker carries across a suspension.
///
/// Starts `Undef`; the poll/select records count ready descriptors in
/// `Count`, the DNS records flip `Flag`, and the transfer bridge stores
/// the engine status in `Status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakerResult {
    Undef,
    Count(i64),
    Flag(bool),
    Status(i64),
}

struct LinkedEvent {
    event: EventRef,
    callback: Rc<dyn EventCallback>,
    owned: bool,
}

/// Per-suspension state installed on a coroutine.
pub struct Waker {
    result: Cell<WakerResult>,
    expired: Cell<bool>,
    events: RefCell<Vec<LinkedEvent>>,
    deadline: RefCell<Option<EventRef>>,
}

impl Waker {
    fn new() -> Self {
        Self {
            result: Cell::new(WakerResult::Undef),
            expired: Cell::new(false),
            events: RefCell::new(Vec::new()),
            deadline: RefCell::new(None),
        }
    }

    #[inline]
    pub fn result(&self) -> WakerResult {
        self.result.get()
    }

    #[inline]
    pub fn set_result(&self, result: WakerResult) {
        self.result.set(result);
    }

    /// Reset the accumulator to zero. Done just before suspension so that
    /// callbacks firing between registration and suspension still count.
    #[inline]
    pub fn init_counter(&self) {
        self.result.set(WakerResult::Count(0));
    }

    /// Count one more ready descriptor.
    pub fn bump_ready(&self) {
        let next = match self.result.get() {
            WakerResult::Undef => WakerResult::Count(1),
            WakerResult::Count(n) => WakerResult::Count(n + 1),
            other => other,
        };
        self.result.set(next);
    }

    /// The accumulated ready count (0 unless counting).
    pub fn count(&self) -> i64 {
        match self.result.get() {
            WakerResult::Count(n) => n,
            _ => 0,
        }
    }

    #[inline]
    pub fn set_flag(&self, value: bool) {
        self.result.set(WakerResult::Flag(value));
    }

    #[inline]
    pub fn flag(&self) -> bool {
        matches!(self.result.get(), WakerResult::Flag(true))
    }

    #[inline]
    pub fn set_status(&self, value: i64) {
        self.result.set(WakerResult::Status(value));
    }

    pub fn status(&self) -> Option<i64> {
        match self.result.get() {
            WakerResult::Status(v) => Some(v),
            _ => None,
        }
    }

    /// Record that the waker deadline fired. An expected wakeup, not a
    /// failure: poll/select return their accumulator (usually 0).
    #[inline]
    pub fn mark_expired(&self) {
        self.expired.set(true);
    }

    #[inline]
    pub fn is_expired(&self) -> bool {
        self.expired.get()
    }

    #[inline]
    pub fn has_deadline(&self) -> bool {
        self.deadline.borrow().is_some()
    }

    pub fn deadline_event(&self) -> Option<EventRef> {
        self.deadline.borrow().clone()
    }

    /// Number of events currently linked (diagnostics/tests).
    pub fn linked_events(&self) -> usize {
        self.events.borrow().len()
    }
}

/// Resumes the coroutine when its waker deadline fires, with no failure
/// attached.
struct DeadlineCallback {
    coroutine: CoroutineRef,
}

impl EventCallback for DeadlineCallback {
    fn invoke(&self, event: &EventRef, failure: Option<&Failure>) {
        if let Some(failure) = failure {
            event.mark_failure_handled();
            resume_with_error(&self.coroutine, failure.clone());
            return;
        }
        self.coroutine.with_waker(|w| w.mark_expired());
        resume(&self.coroutine);
    }
}

/// Install a fresh waker on the coroutine, replacing (and cancelling) any
/// previous one.
pub fn waker_new(coroutine: &CoroutineRef) -> Result<(), Failure> {
    waker_destroy(coroutine);
    *coroutine.waker_cell().borrow_mut() = Some(Waker::new());
    Ok(())
}

/// Install a fresh waker with an optional deadline in milliseconds.
///
/// `None` waits indefinitely. `Some(0)` arms a zero-delay deadline that
/// fires on the next reactor tick; the deadline resumes the coroutine
/// normally (no failure) with [`Waker::is_expired`] set.
pub fn waker_new_with_timeout(coroutine: &CoroutineRef, timeout_ms: Option<u64>) -> Result<(), Failure> {
    waker_new(coroutine)?;

    let Some(ms) = timeout_ms else {
        return Ok(());
    };

    let reactor = tls::reactor().ok_or_else(|| Failure::other("no reactor installed on this thread"))?;
    let timer = reactor.new_timer_event(Duration::from_millis(ms), false)?;
    timer.add_callback(Rc::new(DeadlineCallback {
        coroutine: coroutine.clone(),
    }));
    if let Err(failure) = timer.start() {
        timer.dispose();
        return Err(failure);
    }

    coroutine
        .waker_cell()
        .borrow()
        .as_ref()
        .expect("waker installed above")
        .deadline
        .replace(Some(timer));
    Ok(())
}

/// Link an event to the coroutine's waker and arm it.
///
/// `own` transfers dispose responsibility to the waker: when the waker is
/// destroyed the event is stopped and disposed. Events owned elsewhere
/// (the transfer bridge context) pass `own = false` and only have the
/// callback detached.
pub fn resume_when(
    coroutine: &CoroutineRef,
    event: EventRef,
    own: bool,
    callback: Rc<dyn EventCallback>,
) -> Result<(), Failure> {
    event.add_callback(callback.clone());

    {
        let slot = coroutine.waker_cell().borrow();
        let waker = slot
            .as_ref()
            .ok_or_else(|| Failure::other("resume_when called without a waker"))?;
        waker.events.borrow_mut().push(LinkedEvent {
            event: event.clone(),
            callback,
            owned: own,
        });
    }

    // Arm last; on failure the linkage stays in place so waker_destroy
    // still detaches and disposes it.
    event.start()
}

/// Tear down the coroutine's waker, if any: detach every linked callback,
/// dispose owned events and the deadline timer.
pub fn waker_destroy(coroutine: &CoroutineRef) {
    let Some(waker) = coroutine.waker_cell().borrow_mut().take() else {
        return;
    };

    for linked in waker.events.take() {
        linked.event.del_callback(&linked.callback);
        if linked.owned {
            linked.event.dispose();
        }
    }

    if let Some(timer) = waker.deadline.take() {
        timer.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coroutine::Coroutine;
    use crate::event::{Event, EventCore};
    use std::any::Any;
    use std::cell::Cell;

    struct StubEvent {
        core: EventCore,
        disposed: Cell<bool>,
    }

    impl StubEvent {
        fn new() -> Rc<Self> {
            Rc::new(Self {
                core: EventCore::new(),
                disposed: Cell::new(false),
            })
        }
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
            self.disposed.set(true);
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

    struct NopCallback;

    impl EventCallback for NopCallback {
        fn invoke(&self, _event: &EventRef, _failure: Option<&Failure>) {}
    }

    #[test]
    fn accumulator_transitions() {
        let waker = Waker::new();
        assert_eq!(waker.result(), WakerResult::Undef);
        assert_eq!(waker.count(), 0);

        waker.bump_ready();
        assert_eq!(waker.result(), WakerResult::Count(1));
        waker.bump_ready();
        assert_eq!(waker.count(), 2);

        waker.init_counter();
        assert_eq!(waker.count(), 0);
    }

    #[test]
    fn flag_and_status_values() {
        let waker = Waker::new();
        assert!(!waker.flag());
        waker.set_flag(true);
        assert!(waker.flag());

        waker.set_status(42);
        assert_eq!(waker.status(), Some(42));
        // Non-counting results don't bump.
        waker.bump_ready();
        assert_eq!(waker.status(), Some(42));
    }

    #[test]
    fn destroy_disposes_owned_and_detaches_unowned() {
        let co = Coroutine::new(1);
        waker_new(&co).unwrap();

        let owned = StubEvent::new();
        let borrowed = StubEvent::new();
        resume_when(&co, owned.clone(), true, Rc::new(NopCallback)).unwrap();
        resume_when(&co, borrowed.clone(), false, Rc::new(NopCallback)).unwrap();
        assert_eq!(co.with_waker(|w| w.linked_events()), Some(2));

        waker_destroy(&co);
        assert!(!co.has_waker());
        assert!(owned.disposed.get());
        assert!(!borrowed.disposed.get());
        assert_eq!(owned.core.callback_count(), 0);
        assert_eq!(borrowed.core.callback_count(), 0);
    }

    #[test]
    fn waker_new_replaces_and_cancels_previous() {
        let co = Coroutine::new(1);
        waker_new(&co).unwrap();
        let owned = StubEvent::new();
        resume_when(&co, owned.clone(), true, Rc::new(NopCallback)).unwrap();

        waker_new(&co).unwrap();
        assert!(owned.disposed.get());
        assert_eq!(co.with_waker(|w| w.linked_events()), Some(0));
        waker_destroy(&co);
    }

    #[test]
    fn resume_when_without_waker_fails() {
        let co = Coroutine::new(1);
        let event = StubEvent::new();
        let err = resume_when(&co, event.clone(), true, Rc::new(NopCallback));
        assert!(err.is_err());
    }

    #[test]
    fn destroy_without_waker_is_a_noop() {
        let co = Coroutine::new(1);
        waker_destroy(&co);
        assert!(!co.has_waker());
    }
}
