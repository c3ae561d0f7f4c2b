//! Thread-local installation of the reactor and the current coroutine.
//!
//! Mirrors the one-reactor-per-thread model: the runtime installs its
//! reactor at thread setup and publishes the coroutine it is about to run;
//! adapters read both from here.

use crate::coroutine::CoroutineRef;
use crate::reactor::Reactor;
use std::cell::RefCell;
use std::rc::Rc;

thread_local! {
    static REACTOR: RefCell<Option<Rc<dyn Reactor>>> = const { RefCell::new(None) };
    static CURRENT: RefCell<Option<CoroutineRef>> = const { RefCell::new(None) };
}

/// Install the reactor for this thread, replacing any previous one.
pub fn install(reactor: Rc<dyn Reactor>) {
    REACTOR.with(|cell| *cell.borrow_mut() = Some(reactor));
}

/// Remove the thread's reactor (thread shutdown).
pub fn deinstall() {
    REACTOR.with(|cell| *cell.borrow_mut() = None);
    CURRENT.with(|cell| *cell.borrow_mut() = None);
}

/// The reactor installed on this thread, if any.
pub fn reactor() -> Option<Rc<dyn Reactor>> {
    REACTOR.with(|cell| cell.borrow().clone())
}

#[inline]
pub fn is_installed() -> bool {
    REACTOR.with(|cell| cell.borrow().is_some())
}

/// Publish the coroutine currently executing on this thread.
pub fn set_current_coroutine(coroutine: Option<CoroutineRef>) {
    CURRENT.with(|cell| *cell.borrow_mut() = coroutine);
}

/// The coroutine currently executing on this thread, if any. Adapters use
/// this as their in-coroutine-context check.
pub fn current_coroutine() -> Option<CoroutineRef> {
    CURRENT.with(|cell| cell.borrow().clone())
}
