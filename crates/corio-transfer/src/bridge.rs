//! Multi-handle mode: a per-multi bridge context.
//!
//! Embedders that expose the multi API themselves get one [`BridgeCtx`]
//! per multi handle. The ctx owns the descriptor map and the timer the
//! engine asks for, and doubles as an event: a coroutine waiting in
//! [`multi_select_async`] subscribes to it and is woken either by its
//! waker deadline or by the descriptor map draining to empty.
//!
//! `socket_action` can reentrantly invoke the socket/timer callbacks
//! below from inside a dispatcher, so map mutations detach first and
//! dispose after, and no borrow is held across an engine call.

use crate::engine::{
    ActionMask, EngineRef, MultiStatus, SocketInterest, TransferEngine, SOCKET_TIMEOUT,
};
use corio_core::callback::WakerResolve;
use corio_core::co_warn;
use corio_core::event::{Event, EventCallback, EventCore, EventRef, RawFd};
use corio_core::failure::Failure;
use corio_core::reactor;
use corio_core::tls;
use corio_core::waker::{resume_when, waker_destroy, waker_new_with_timeout};
use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::{Rc, Weak};
use std::time::Duration;

/// A transfer-multi handle plus its lazily-created bridge.
pub struct MultiHandle {
    engine: EngineRef,
    bridge: RefCell<Option<Rc<BridgeCtx>>>,
}

impl MultiHandle {
    pub fn new(engine: EngineRef) -> Self {
        Self {
            engine,
            bridge: RefCell::new(None),
        }
    }

    pub fn engine(&self) -> &EngineRef {
        &self.engine
    }

    /// The bridge context, if one was created already.
    pub fn bridge(&self) -> Option<Rc<BridgeCtx>> {
        self.bridge.borrow().clone()
    }
}

impl Drop for MultiHandle {
    fn drop(&mut self) {
        multi_dispose(self);
    }
}

/// Per-multi bridge state: descriptor map, optional timer, engine
/// back-pointer. Implements [`Event`] so select waiters can subscribe.
pub struct BridgeCtx {
    me: Weak<BridgeCtx>,
    core: EventCore,
    engine: EngineRef,
    poll_list: RefCell<HashMap<RawFd, EventRef>>,
    timer: RefCell<Option<EventRef>>,
}

impl BridgeCtx {
    fn attach(multi: &MultiHandle) -> Rc<Self> {
        let ctx = Rc::new_cyclic(|me| Self {
            me: me.clone(),
            core: EventCore::new(),
            engine: multi.engine.clone(),
            poll_list: RefCell::new(HashMap::new()),
            timer: RefCell::new(None),
        });

        let weak = Rc::downgrade(&ctx);
        multi
            .engine
            .set_socket_callback(Some(Rc::new(move |easy, fd, what, slot| {
                match weak.upgrade() {
                    Some(ctx) => ctx.socket_event(easy, fd, what, slot),
                    None => MultiStatus::InternalError,
                }
            })));

        let weak = Rc::downgrade(&ctx);
        multi
            .engine
            .set_timer_callback(Some(Rc::new(move |timeout_ms| match weak.upgrade() {
                Some(ctx) => ctx.timer_event(timeout_ms),
                None => MultiStatus::InternalError,
            })));

        ctx
    }

    /// Number of descriptors the engine currently has under watch.
    pub fn poll_count(&self) -> usize {
        self.poll_list.borrow().len()
    }

    pub fn has_timer(&self) -> bool {
        self.timer.borrow().is_some()
    }

    fn notify(&self, failure: Option<&Failure>) {
        if let Some(me) = self.me.upgrade() {
            let event: EventRef = me;
            self.core.notify(&event, failure);
        }
    }

    fn socket_event(
        &self,
        _easy: crate::engine::EasyId,
        fd: RawFd,
        what: SocketInterest,
        _slot: Option<EventRef>,
    ) -> MultiStatus {
        if what == SocketInterest::Remove {
            // Detach from the map before disposing, so reentrant
            // callbacks see a consistent map.
            let removed = self.poll_list.borrow_mut().remove(&fd);
            let Some(event) = removed else {
                return MultiStatus::Ok;
            };
            event.dispose();

            if self.poll_list.borrow().is_empty() {
                // Nothing left to watch: wake any subscriber, no error.
                self.notify(None);
            }
            return MultiStatus::Ok;
        }

        let existing = self.poll_list.borrow().get(&fd).cloned();
        match existing {
            None => {
                let Some(reactor) = tls::reactor() else {
                    return MultiStatus::BadSocket;
                };
                let event = match reactor.new_socket_event(fd, what.bits()) {
                    Ok(event) => event,
                    Err(_) => return MultiStatus::BadSocket,
                };
                event.add_callback(Rc::new(PollDispatch {
                    ctx: self.me.clone(),
                }));
                self.poll_list.borrow_mut().insert(fd, event.clone());
                if event.start().is_err() {
                    co_warn!("failed to start bridge socket event for fd {}", fd);
                    self.poll_list.borrow_mut().remove(&fd);
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

    fn timer_event(&self, timeout_ms: i64) -> MultiStatus {
        if let Some(timer) = self.timer.borrow_mut().take() {
            timer.dispose();
        }
        if timeout_ms < 0 {
            return MultiStatus::Ok;
        }

        let Some(reactor) = tls::reactor() else {
            return MultiStatus::InternalError;
        };
        let timer = match reactor.new_timer_event(Duration::from_millis(timeout_ms as u64), false)
        {
            Ok(timer) => timer,
            Err(_) => return MultiStatus::InternalError,
        };
        timer.add_callback(Rc::new(TimerDispatch {
            ctx: self.me.clone(),
        }));
        if timer.start().is_err() {
            return MultiStatus::InternalError;
        }
        *self.timer.borrow_mut() = Some(timer);
        MultiStatus::Ok
    }
}

impl Event for BridgeCtx {
    fn start(&self) -> Result<(), Failure> {
        Ok(())
    }

    fn stop(&self) {
        if self.core.is_closed() {
            return;
        }
        self.core.set_closed();

        let events: Vec<EventRef> = self
            .poll_list
            .borrow_mut()
            .drain()
            .map(|(_, event)| event)
            .collect();
        for event in events {
            event.dispose();
        }
        if let Some(timer) = self.timer.borrow_mut().take() {
            timer.dispose();
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

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Per-ctx poll dispatcher: triggered bits → engine action mask.
struct PollDispatch {
    ctx: Weak<BridgeCtx>,
}

impl EventCallback for PollDispatch {
    fn invoke(&self, event: &EventRef, failure: Option<&Failure>) {
        let Some(ctx) = self.ctx.upgrade() else {
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

        // May reentrantly invoke socket_event/timer_event above.
        ctx.engine.socket_action(event.socket(), action);
    }
}

/// Per-ctx timer dispatcher.
struct TimerDispatch {
    ctx: Weak<BridgeCtx>,
}

impl EventCallback for TimerDispatch {
    fn invoke(&self, _event: &EventRef, _failure: Option<&Failure>) {
        let Some(ctx) = self.ctx.upgrade() else {
            return;
        };
        ctx.engine.socket_action(SOCKET_TIMEOUT, ActionMask::NONE);
    }
}

fn ensure_bridge(multi: &MultiHandle) -> Rc<BridgeCtx> {
    if let Some(ctx) = multi.bridge.borrow().as_ref() {
        return ctx.clone();
    }
    let ctx = BridgeCtx::attach(multi);
    *multi.bridge.borrow_mut() = Some(ctx.clone());
    ctx
}

/// Kick the engine and report how many descriptors it is watching.
pub fn multi_perform_async(multi: &MultiHandle, running: &mut i32) -> MultiStatus {
    let ctx = ensure_bridge(multi);
    multi.engine.socket_action(SOCKET_TIMEOUT, ActionMask::NONE);
    *running = ctx.poll_count() as i32;
    MultiStatus::Ok
}

/// Wait until the engine's first descriptor resolves or `timeout_ms`
/// expires.
///
/// Timeout is the *expected* outcome here and returns
/// [`MultiStatus::Ok`] with `numfds` set to the current watch count; any
/// other cooperative failure comes back as
/// [`MultiStatus::InternalError`]. `timeout_ms <= 0` waits until the
/// descriptor map drains.
pub fn multi_select_async(multi: &MultiHandle, timeout_ms: i64, numfds: &mut i32) -> MultiStatus {
    let ctx = ensure_bridge(multi);

    let Some(coroutine) = tls::current_coroutine() else {
        *numfds = ctx.poll_count() as i32;
        return MultiStatus::InternalError;
    };

    let deadline = if timeout_ms > 0 {
        Some(timeout_ms as u64)
    } else {
        None
    };
    if waker_new_with_timeout(&coroutine, deadline).is_err() {
        *numfds = ctx.poll_count() as i32;
        return MultiStatus::InternalError;
    }

    // The ctx persists across calls; the waker only borrows it.
    let as_event: EventRef = ctx.clone();
    if resume_when(
        &coroutine,
        as_event,
        false,
        WakerResolve::new(coroutine.clone()),
    )
    .is_err()
    {
        waker_destroy(&coroutine);
        *numfds = ctx.poll_count() as i32;
        return MultiStatus::InternalError;
    }

    multi.engine.socket_action(SOCKET_TIMEOUT, ActionMask::NONE);
    reactor::suspend();

    let mut result = MultiStatus::Ok;
    if let Some(failure) = coroutine.take_failure() {
        // The deadline is an expected way out; everything else is not.
        if !failure.is_timeout() {
            result = MultiStatus::InternalError;
        }
    }

    waker_destroy(&coroutine);
    *numfds = ctx.poll_count() as i32;
    result
}

/// Detach the bridge from its multi handle: dispose every watched
/// descriptor and the timer, clear the engine callbacks.
pub fn multi_dispose(multi: &MultiHandle) {
    let ctx = multi.bridge.borrow_mut().take();
    if let Some(ctx) = ctx {
        ctx.dispose();
    }
    multi.engine.set_socket_callback(None);
    multi.engine.set_timer_callback(None);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{EasyId, TransferStatus};
    use crate::lab::{LabEngine, TransferPlan};
    use corio_core::bits::EventBits;
    use corio_core::coroutine::{cancel, resume_with_error};
    use corio_core::lab::{LabEvent, LabReactor};

    fn harness() -> (Rc<LabReactor>, Rc<LabEngine>, MultiHandle) {
        let lab = LabReactor::new();
        lab.install();
        let engine = LabEngine::new();
        let multi = MultiHandle::new(engine.clone() as EngineRef);
        (lab, engine, multi)
    }

    fn plan(engine: &LabEngine, easy: EasyId, fd: RawFd, kicks: u32) {
        engine.add_handle(easy);
        engine.plan_transfer(
            easy,
            TransferPlan {
                fd,
                interest: SocketInterest::In,
                actions_until_done: kicks,
                status: TransferStatus::OK,
                timer_ms: None,
            },
        );
    }

    #[test]
    fn multi_perform_reports_watched_descriptors() {
        let (_lab, engine, multi) = harness();
        plan(&engine, 1, 10, 1);
        plan(&engine, 2, 11, 1);

        let mut running = -1;
        assert_eq!(multi_perform_async(&multi, &mut running), MultiStatus::Ok);
        assert_eq!(running, 2);
        assert_eq!(multi.bridge().unwrap().poll_count(), 2);
    }

    #[test]
    fn select_timeout_is_success_with_current_count() {
        let (lab, engine, multi) = harness();
        plan(&engine, 1, 10, 1);
        plan(&engine, 2, 11, 1);

        let mut numfds = -1;
        let status = lab.enter(|| multi_select_async(&multi, 25, &mut numfds));

        assert_eq!(status, MultiStatus::Ok);
        assert_eq!(numfds, 2);
    }

    #[test]
    fn select_wakes_when_the_poll_list_drains() {
        let (lab, engine, multi) = harness();
        plan(&engine, 1, 10, 1);
        plan(&engine, 2, 11, 1);

        let mut numfds = -1;
        let status = lab.clone().enter_with(|co| {
            let fire = lab.clone();
            lab.on_suspend(move || fire.fire_fd(10, EventBits::READABLE));
            let fire = lab.clone();
            lab.on_suspend(move || fire.fire_fd(11, EventBits::READABLE));

            let status = multi_select_async(&multi, 0, &mut numfds);
            assert!(!co.has_waker());
            status
        });

        assert_eq!(status, MultiStatus::Ok);
        assert_eq!(numfds, 0);
        // Removals happened reentrantly, from inside socket_action calls
        // made by the poll dispatcher.
        assert_eq!(lab.live_events(), 0);
    }

    #[test]
    fn select_survives_repeated_calls() {
        let (lab, engine, multi) = harness();
        plan(&engine, 1, 10, 2);

        let mut numfds = -1;
        let status = lab.enter(|| multi_select_async(&multi, 5, &mut numfds));
        assert_eq!(status, MultiStatus::Ok);
        assert_eq!(numfds, 1);

        // The ctx (and its descriptor) persisted across the call.
        let status = lab.enter(|| multi_select_async(&multi, 5, &mut numfds));
        assert_eq!(status, MultiStatus::Ok);
        assert_eq!(numfds, 1);
    }

    #[test]
    fn cancellation_is_internal_error() {
        let (lab, engine, multi) = harness();
        plan(&engine, 1, 10, 1);

        let mut numfds = -1;
        let status = lab.clone().enter_with(|co| {
            let victim = co.clone();
            lab.on_suspend(move || cancel(&victim));
            multi_select_async(&multi, 0, &mut numfds)
        });

        assert_eq!(status, MultiStatus::InternalError);
    }

    #[test]
    fn delivered_timeout_failure_is_success() {
        let (lab, engine, multi) = harness();
        plan(&engine, 1, 10, 1);

        let mut numfds = -1;
        let status = lab.clone().enter_with(|co| {
            let victim = co.clone();
            lab.on_suspend(move || {
                resume_with_error(&victim, Failure::Timeout);
            });
            let status = multi_select_async(&multi, 0, &mut numfds);
            assert!(!co.has_failure());
            status
        });

        assert_eq!(status, MultiStatus::Ok);
        assert_eq!(numfds, 1);
    }

    #[test]
    fn outside_coroutine_is_internal_error() {
        let (_lab, engine, multi) = harness();
        plan(&engine, 1, 10, 1);
        let mut numfds = -1;
        assert_eq!(
            multi_select_async(&multi, 5, &mut numfds),
            MultiStatus::InternalError
        );
    }

    #[test]
    fn engine_interest_updates_or_bits_in_place() {
        let (_lab, engine, multi) = harness();
        let mut running = 0;
        multi_perform_async(&multi, &mut running);

        engine.request_socket(1, 10, SocketInterest::In);
        engine.request_socket(1, 10, SocketInterest::Out);

        let ctx = multi.bridge().unwrap();
        assert_eq!(ctx.poll_count(), 1);

        let event = ctx.poll_list.borrow().get(&10).cloned().unwrap();
        let lab_event = event.as_any().downcast_ref::<LabEvent>().unwrap();
        assert!(lab_event.interest().contains(EventBits::READABLE));
        assert!(lab_event.interest().contains(EventBits::WRITABLE));
    }

    #[test]
    fn engine_timer_requests_manage_one_timer() {
        let (lab, engine, multi) = harness();
        let mut running = 0;
        multi_perform_async(&multi, &mut running);

        engine.trigger_timer(100);
        let ctx = multi.bridge().unwrap();
        assert!(ctx.has_timer());
        assert_eq!(lab.live_timers(), 1);

        engine.trigger_timer(200);
        assert_eq!(lab.live_timers(), 1);

        engine.trigger_timer(-1);
        assert!(!ctx.has_timer());
        assert_eq!(lab.live_timers(), 0);
    }

    #[test]
    fn timer_dispatch_kicks_the_engine() {
        let (lab, engine, multi) = harness();
        plan(&engine, 1, 10, 1);

        let mut running = 0;
        multi_perform_async(&multi, &mut running);
        engine.trigger_timer(10);

        lab.fire_timers();
        let log = engine.action_log();
        assert!(log.contains(&(SOCKET_TIMEOUT, ActionMask::NONE)));
    }

    #[test]
    fn dispose_clears_events_and_callbacks() {
        let (lab, engine, multi) = harness();
        plan(&engine, 1, 10, 5);
        plan(&engine, 2, 11, 5);

        let mut running = 0;
        multi_perform_async(&multi, &mut running);
        engine.trigger_timer(50);
        assert_eq!(lab.live_events(), 3);

        multi_dispose(&multi);
        assert_eq!(lab.live_events(), 0);
        assert!(!engine.has_socket_callback());
        assert!(!engine.has_timer_callback());
        assert!(multi.bridge().is_none());

        // Dropping the handle later must not double-dispose.
        drop(multi);
    }

    #[test]
    fn remove_for_unknown_descriptor_is_ignored() {
        let (_lab, engine, multi) = harness();
        let mut running = 0;
        multi_perform_async(&multi, &mut running);

        engine.request_socket(1, 42, SocketInterest::Remove);
        assert_eq!(multi.bridge().unwrap().poll_count(), 0);
    }
}
