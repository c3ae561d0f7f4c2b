//! Single-request mode: one thread-local engine, one awaiting coroutine
//! per transfer.
//!
//! `perform_async` wraps the easy handle in a [`TransferEvent`], links it
//! to the coroutine's waker, and suspends. The engine's global socket and
//! timer callbacks translate its interest into reactor events; the
//! dispatchers feed readiness back with `socket_action` and drain
//! completed messages, which is what finally resumes the coroutine.
//!
//! Unlike the poll/select adapters, descriptors are registered *after*
//! the coroutine suspends — the engine announces them from inside
//! `socket_action`. Sockets and the timer are owned by this module's
//! thread-local state, not the caller's waker, and persist across calls.

use crate::engine::{
    ActionMask, EasyId, EngineRef, MultiStatus, SocketInterest, TransferEngine, TransferStatus,
    SOCKET_TIMEOUT,
};
use corio_core::callback::WakerResolve;
use corio_core::co_warn;
use corio_core::event::{Event, EventCallback, EventCore, EventRef};
use corio_core::failure::Failure;
use corio_core::reactor;
use corio_core::tls;
use corio_core::waker::{resume_when, waker_destroy, waker_new};
use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::{Rc, Weak};
use std::time::Duration;

struct SingleState {
    engine: EngineRef,
    events: HashMap<EasyId, Rc<TransferEvent>>,
    timer: Option<EventRef>,
}

thread_local! {
    static FACTORY: RefCell<Option<Box<dyn Fn() -> EngineRef>>> = const { RefCell::new(None) };
    static STATE: RefCell<Option<SingleState>> = const { RefCell::new(None) };
}

/// Register the constructor for the thread-local engine. Invoked lazily
/// by the first `perform_async`/`setup` on each thread.
pub fn install_engine_factory(factory: impl Fn() -> EngineRef + 'static) {
    FACTORY.with(|cell| *cell.borrow_mut() = Some(Box::new(factory)));
}

fn engine() -> Option<EngineRef> {
    STATE.with(|cell| cell.borrow().as_ref().map(|s| s.engine.clone()))
}

fn lookup_event(easy: EasyId) -> Option<Rc<TransferEvent>> {
    STATE.with(|cell| {
        cell.borrow()
            .as_ref()
            .and_then(|s| s.events.get(&easy).cloned())
    })
}

fn insert_event(easy: EasyId, event: Rc<TransferEvent>) {
    STATE.with(|cell| {
        if let Some(state) = cell.borrow_mut().as_mut() {
            state.events.insert(easy, event);
        }
    });
}

fn remove_event(easy: EasyId) {
    STATE.with(|cell| {
        if let Some(state) = cell.borrow_mut().as_mut() {
            state.events.remove(&easy);
        }
    });
}

fn take_timer() -> Option<EventRef> {
    STATE.with(|cell| {
        cell.borrow_mut()
            .as_mut()
            .and_then(|state| state.timer.take())
    })
}

fn store_timer(timer: EventRef) {
    STATE.with(|cell| {
        if let Some(state) = cell.borrow_mut().as_mut() {
            state.timer = Some(timer);
        }
    });
}

/// The event wrapping one easy handle for the duration of a
/// `perform_async` call.
pub struct TransferEvent {
    me: Weak<TransferEvent>,
    core: EventCore,
    easy: Cell<Option<EasyId>>,
}

impl TransferEvent {
    fn new(easy: EasyId) -> Rc<Self> {
        Rc::new_cyclic(|me| Self {
            me: me.clone(),
            core: EventCore::new(),
            easy: Cell::new(Some(easy)),
        })
    }

    fn notify(&self, failure: Option<&Failure>) {
        if let Some(me) = self.me.upgrade() {
            let event: EventRef = me;
            self.core.notify(&event, failure);
        }
    }
}

impl Event for TransferEvent {
    fn start(&self) -> Result<(), Failure> {
        let Some(easy) = self.easy.get() else {
            return Err(Failure::other("transfer event already detached"));
        };
        let me = self
            .me
            .upgrade()
            .ok_or_else(|| Failure::other("transfer event dropped"))?;
        let engine =
            engine().ok_or_else(|| Failure::other("single-mode transfer state missing"))?;

        insert_event(easy, me);

        if engine.add_handle(easy) != MultiStatus::Ok {
            self.stop();
            return Err(Failure::other("engine refused the transfer handle"));
        }
        if engine.socket_action(SOCKET_TIMEOUT, ActionMask::NONE) != MultiStatus::Ok {
            self.stop();
            return Err(Failure::other("engine rejected the initial kick"));
        }
        Ok(())
    }

    fn stop(&self) {
        if self.core.is_closed() {
            return;
        }
        self.core.set_closed();

        if let Some(easy) = self.easy.take() {
            remove_event(easy);
            if let Some(engine) = engine() {
                engine.remove_handle(easy);
            }
        }
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

    fn result(&self) -> Option<i64> {
        self.core.result()
    }

    fn set_result(&self, value: i64) {
        self.core.set_result(value);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Feeds socket readiness back into the engine, then drains completions.
struct PollDispatch;

impl EventCallback for PollDispatch {
    fn invoke(&self, event: &EventRef, failure: Option<&Failure>) {
        let Some(engine) = engine() else {
            return;
        };

        let bits = event.triggered();
        let mut action = ActionMask::NONE;
        if bits.contains(corio_core::bits::EventBits::READABLE) {
            action |= ActionMask::IN;
        }
        if bits.contains(corio_core::bits::EventBits::WRITABLE) {
            action |= ActionMask::OUT;
        }
        if failure.is_some() {
            event.mark_failure_handled();
            action |= ActionMask::ERR;
        }

        engine.socket_action(event.socket(), action);
        drain_completed(&engine);
    }
}

/// Timeout kicks: let the engine progress, then drain completions.
struct TimerDispatch;

impl EventCallback for TimerDispatch {
    fn invoke(&self, _event: &EventRef, _failure: Option<&Failure>) {
        let Some(engine) = engine() else {
            return;
        };
        engine.socket_action(SOCKET_TIMEOUT, ActionMask::NONE);
        drain_completed(&engine);
    }
}

/// Pull every DONE message out of the engine and resume its awaiter.
fn drain_completed(engine: &EngineRef) {
    while let Some(message) = engine.next_done() {
        engine.remove_handle(message.handle);

        // A matching event means a coroutine is still waiting on this
        // handle; anything else was already torn down.
        let Some(event) = lookup_event(message.handle) else {
            continue;
        };
        event.set_result(message.status.0 as i64);
        event.notify(None);
        event.stop();
    }
}

/// Global socket callback installed on the thread-local engine.
fn single_socket_cb(
    easy: EasyId,
    fd: corio_core::event::RawFd,
    what: SocketInterest,
    slot: Option<EventRef>,
) -> MultiStatus {
    if lookup_event(easy).is_none() {
        return MultiStatus::Ok;
    }

    if what == SocketInterest::Remove {
        if let Some(event) = slot {
            event.dispose();
        }
        return MultiStatus::Ok;
    }

    match slot {
        None => {
            let Some(reactor) = tls::reactor() else {
                return MultiStatus::BadSocket;
            };
            let event = match reactor.new_socket_event(fd, what.bits()) {
                Ok(event) => event,
                Err(_) => return MultiStatus::BadSocket,
            };
            event.add_callback(Rc::new(PollDispatch));

            let Some(engine) = engine() else {
                return MultiStatus::BadSocket;
            };
            engine.assign(fd, Some(event.clone()));
            if event.start().is_err() {
                engine.assign(fd, None);
                return MultiStatus::BadSocket;
            }
            MultiStatus::Ok
        }
        Some(event) => {
            event.update_interest(what.bits());
            MultiStatus::Ok
        }
    }
}

/// Global timer callback installed on the thread-local engine.
fn single_timer_cb(timeout_ms: i64) -> MultiStatus {
    if let Some(timer) = take_timer() {
        timer.dispose();
    }
    if timeout_ms < 0 {
        return MultiStatus::Ok;
    }

    let Some(reactor) = tls::reactor() else {
        return MultiStatus::InternalError;
    };
    let timer = match reactor.new_timer_event(Duration::from_millis(timeout_ms as u64), false) {
        Ok(timer) => timer,
        Err(_) => return MultiStatus::InternalError,
    };
    timer.add_callback(Rc::new(TimerDispatch));
    if timer.start().is_err() {
        return MultiStatus::InternalError;
    }
    store_timer(timer);
    MultiStatus::Ok
}

/// Initialise the thread-local single-request state. Idempotent; fails
/// when no engine factory was installed.
pub fn setup() -> Result<(), Failure> {
    if STATE.with(|cell| cell.borrow().is_some()) {
        return Ok(());
    }

    let engine = FACTORY
        .with(|cell| cell.borrow().as_ref().map(|f| f()))
        .ok_or_else(|| Failure::other("no transfer-engine factory installed"))?;

    engine.set_socket_callback(Some(Rc::new(single_socket_cb)));
    engine.set_timer_callback(Some(Rc::new(single_timer_cb)));

    STATE.with(|cell| {
        *cell.borrow_mut() = Some(SingleState {
            engine,
            events: HashMap::new(),
            timer: None,
        })
    });
    Ok(())
}

/// Tear down the thread-local state: dispose the timer and any events
/// still registered, detach the engine callbacks.
pub fn shutdown() {
    let Some(state) = STATE.with(|cell| cell.borrow_mut().take()) else {
        return;
    };

    if let Some(timer) = state.timer {
        timer.dispose();
    }
    for (_easy, event) in state.events {
        event.dispose();
    }
    state.engine.set_socket_callback(None);
    state.engine.set_timer_callback(None);
}

/// Run one transfer to completion, suspending the calling coroutine.
///
/// Returns the engine's own status code for the transfer;
/// [`TransferStatus::FAILED_INIT`] when called outside a coroutine or
/// when setup fails, [`TransferStatus::ABORTED_BY_CALLBACK`] when a
/// cooperative failure (cancellation included) lands while suspended.
pub fn perform_async(easy: EasyId) -> TransferStatus {
    if setup().is_err() {
        return TransferStatus::FAILED_INIT;
    }

    let Some(coroutine) = tls::current_coroutine() else {
        return TransferStatus::FAILED_INIT;
    };
    if waker_new(&coroutine).is_err() {
        return TransferStatus::FAILED_INIT;
    }

    let event = TransferEvent::new(easy);
    if let Err(failure) = resume_when(
        &coroutine,
        event,
        true,
        WakerResolve::new(coroutine.clone()),
    ) {
        co_warn!("transfer setup failed: {}", failure);
        waker_destroy(&coroutine);
        return TransferStatus::FAILED_INIT;
    }

    reactor::suspend();

    if coroutine.has_failure() {
        coroutine.take_failure();
        waker_destroy(&coroutine);
        return TransferStatus::ABORTED_BY_CALLBACK;
    }

    let status = coroutine
        .with_waker(|w| w.status())
        .flatten()
        .map(|code| TransferStatus(code as i32))
        .unwrap_or(TransferStatus::OK);
    waker_destroy(&coroutine);
    status
}
