//! Coroutine handle shared by the runtime, the adapters, and callbacks.
//!
//! The runtime owns execution (stacks, scheduling); this type carries the
//! state the adaptation layer needs: the waker slot, the pending
//! cooperative failure, an internal context map keyed by opaque
//! module-allocated keys, and finalizer hooks that run once when the
//! coroutine ends.

use crate::failure::Failure;
use crate::tls;
use crate::waker::Waker;
use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Opaque key for the per-coroutine internal context map.
///
/// Allocate once per module with [`context_key_alloc`] and reuse it for
/// every coroutine; the name is diagnostic only.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextKey {
    id: u64,
    name: &'static str,
}

impl fmt::Debug for ContextKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContextKey({}:{})", self.id, self.name)
    }
}

static NEXT_KEY: AtomicU64 = AtomicU64::new(1);

/// Allocate a process-unique context key.
pub fn context_key_alloc(name: &'static str) -> ContextKey {
    ContextKey {
        id: NEXT_KEY.fetch_add(1, Ordering::Relaxed),
        name,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoroutineState {
    /// Executing on the current thread.
    Running,
    /// Parked inside an adapter, waiting for events.
    Suspended,
    /// Resumption requested; the runtime hands control back next tick.
    Queued,
    /// Body returned; finalizers have run.
    Finished,
}

pub type CoroutineRef = Rc<Coroutine>;

pub struct Coroutine {
    id: u64,
    state: Cell<CoroutineState>,
    waker: RefCell<Option<Waker>>,
    failure: RefCell<Option<Failure>>,
    context: RefCell<HashMap<ContextKey, Box<dyn Any>>>,
    finalizers: RefCell<Vec<Box<dyn FnOnce(&Coroutine)>>>,
}

impl Coroutine {
    pub fn new(id: u64) -> CoroutineRef {
        Rc::new(Self {
            id,
            state: Cell::new(CoroutineState::Running),
            waker: RefCell::new(None),
            failure: RefCell::new(None),
            context: RefCell::new(HashMap::new()),
            finalizers: RefCell::new(Vec::new()),
        })
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub fn state(&self) -> CoroutineState {
        self.state.get()
    }

    #[inline]
    pub fn set_state(&self, state: CoroutineState) {
        self.state.set(state);
    }

    #[inline]
    pub fn is_finished(&self) -> bool {
        self.state.get() == CoroutineState::Finished
    }

    // ── Waker slot ────────────────────────────────────────────────────

    pub(crate) fn waker_cell(&self) -> &RefCell<Option<Waker>> {
        &self.waker
    }

    #[inline]
    pub fn has_waker(&self) -> bool {
        self.waker.borrow().is_some()
    }

    /// Run `f` against the live waker, if one is installed.
    pub fn with_waker<R>(&self, f: impl FnOnce(&Waker) -> R) -> Option<R> {
        self.waker.borrow().as_ref().map(f)
    }

    // ── Pending failure ───────────────────────────────────────────────

    /// Attach (or replace) the pending failure. The most recent failure
    /// wins; the adapter consumes it exactly once on the way out.
    pub fn set_failure(&self, failure: Failure) {
        *self.failure.borrow_mut() = Some(failure);
    }

    #[inline]
    pub fn has_failure(&self) -> bool {
        self.failure.borrow().is_some()
    }

    /// Consume the pending failure.
    pub fn take_failure(&self) -> Option<Failure> {
        self.failure.borrow_mut().take()
    }

    // ── Internal context ──────────────────────────────────────────────

    pub fn context_set(&self, key: ContextKey, value: Box<dyn Any>) {
        self.context.borrow_mut().insert(key, value);
    }

    /// Run `f` against the stored value for `key`, if any.
    pub fn context_with<R>(&self, key: ContextKey, f: impl FnOnce(&dyn Any) -> R) -> Option<R> {
        self.context.borrow().get(&key).map(|v| f(v.as_ref()))
    }

    /// Clone the stored `T` for `key`, if present and of that type.
    pub fn context_get_cloned<T: Clone + 'static>(&self, key: ContextKey) -> Option<T> {
        self.context
            .borrow()
            .get(&key)
            .and_then(|v| v.downcast_ref::<T>())
            .cloned()
    }

    /// Remove the entry for `key`. Returns whether one existed.
    pub fn context_unset(&self, key: ContextKey) -> bool {
        self.context.borrow_mut().remove(&key).is_some()
    }

    // ── End-of-coroutine hooks ────────────────────────────────────────

    /// Register a hook that runs exactly once when the coroutine ends.
    pub fn add_finalizer(&self, f: Box<dyn FnOnce(&Coroutine)>) {
        self.finalizers.borrow_mut().push(f);
    }

    /// Mark the coroutine finished: run the finalizers, then drop whatever
    /// is left in the context map.
    pub fn finish(&self) {
        let hooks = std::mem::take(&mut *self.finalizers.borrow_mut());
        for hook in hooks {
            hook(self);
        }
        self.context.borrow_mut().clear();
        self.state.set(CoroutineState::Finished);
    }
}

impl fmt::Debug for Coroutine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Coroutine")
            .field("id", &self.id)
            .field("state", &self.state.get())
            .field("has_waker", &self.has_waker())
            .field("has_failure", &self.has_failure())
            .finish()
    }
}

/// Schedule a suspended coroutine to continue.
///
/// Idempotent: the first call moves it to `Queued` and hands it to the
/// reactor; later calls (more callbacks firing before the runtime gets
/// around to it) are no-ops. A callback firing between event registration
/// and the suspension point marks the coroutine `Queued` so the suspend
/// returns immediately.
pub fn resume(coroutine: &CoroutineRef) {
    match coroutine.state() {
        CoroutineState::Suspended => {
            coroutine.set_state(CoroutineState::Queued);
            if let Some(reactor) = tls::reactor() {
                reactor.enqueue(coroutine);
            }
        }
        CoroutineState::Running => {
            // Fired before the suspension point; leave a pending wake.
            coroutine.set_state(CoroutineState::Queued);
        }
        CoroutineState::Queued | CoroutineState::Finished => {}
    }
}

/// Attach `failure` to the coroutine and schedule it.
pub fn resume_with_error(coroutine: &CoroutineRef, failure: Failure) {
    coroutine.set_failure(failure);
    resume(coroutine);
}

/// Cancel the coroutine: it wakes with a [`Failure::Cancelled`] pending.
pub fn cancel(coroutine: &CoroutineRef) {
    resume_with_error(coroutine, Failure::Cancelled);
}
