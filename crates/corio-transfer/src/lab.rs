//! Scripted transfer engine for deterministic tests.
//!
//! `LabEngine` plays the engine side of the socket/timer callback
//! protocol. Each planned transfer announces its descriptor interest on
//! the first timeout kick, counts down one step per `socket_action` on
//! its descriptor, and on reaching zero queues a done message and retires
//! the descriptor with a reentrant `Remove` callback — the same
//! call-you-from-inside-your-call shape the real engines have.

use crate::engine::{
    ActionMask, DoneMessage, EasyId, MultiStatus, SocketCallback, SocketInterest, TimerCallback,
    TransferEngine, TransferStatus, SOCKET_TIMEOUT,
};
use corio_core::event::{EventRef, RawFd};
use std::cell::RefCell;
use std::collections::{HashMap, HashSet, VecDeque};
use std::rc::Rc;

/// Scripted behavior of one transfer.
#[derive(Debug, Clone)]
pub struct TransferPlan {
    /// Descriptor the transfer runs on.
    pub fd: RawFd,
    /// Interest announced for that descriptor.
    pub interest: SocketInterest,
    /// `socket_action` calls on the descriptor before completion.
    pub actions_until_done: u32,
    /// Status reported in the done message.
    pub status: TransferStatus,
    /// Timer the engine requests at announce time, if any.
    pub timer_ms: Option<i64>,
}

struct PlanState {
    plan: TransferPlan,
    remaining: u32,
    announced: bool,
}

/// Deterministic engine double.
pub struct LabEngine {
    socket_cb: RefCell<Option<SocketCallback>>,
    timer_cb: RefCell<Option<TimerCallback>>,
    handles: RefCell<HashSet<EasyId>>,
    slots: RefCell<HashMap<RawFd, EventRef>>,
    plans: RefCell<HashMap<EasyId, PlanState>>,
    done: RefCell<VecDeque<DoneMessage>>,
    actions: RefCell<Vec<(RawFd, ActionMask)>>,
}

impl LabEngine {
    pub fn new() -> Rc<Self> {
        Rc::new(Self {
            socket_cb: RefCell::new(None),
            timer_cb: RefCell::new(None),
            handles: RefCell::new(HashSet::new()),
            slots: RefCell::new(HashMap::new()),
            plans: RefCell::new(HashMap::new()),
            done: RefCell::new(VecDeque::new()),
            actions: RefCell::new(Vec::new()),
        })
    }

    pub fn plan_transfer(&self, easy: EasyId, plan: TransferPlan) {
        let remaining = plan.actions_until_done;
        self.plans.borrow_mut().insert(
            easy,
            PlanState {
                plan,
                remaining,
                announced: false,
            },
        );
    }

    /// Invoke the installed socket callback directly, as the engine does
    /// when its interest for a descriptor changes.
    pub fn request_socket(&self, easy: EasyId, fd: RawFd, what: SocketInterest) -> MultiStatus {
        let callback = self.socket_cb.borrow().clone();
        let slot = self.slots.borrow().get(&fd).cloned();
        match callback {
            Some(callback) => callback(easy, fd, what, slot),
            None => MultiStatus::InternalError,
        }
    }

    /// Invoke the installed timer callback directly.
    pub fn trigger_timer(&self, timeout_ms: i64) -> MultiStatus {
        let callback = self.timer_cb.borrow().clone();
        match callback {
            Some(callback) => callback(timeout_ms),
            None => MultiStatus::InternalError,
        }
    }

    /// Queue a done message by hand (for drain edge cases).
    pub fn push_done(&self, message: DoneMessage) {
        self.done.borrow_mut().push_back(message);
    }

    pub fn handle_count(&self) -> usize {
        self.handles.borrow().len()
    }

    pub fn has_socket_callback(&self) -> bool {
        self.socket_cb.borrow().is_some()
    }

    pub fn has_timer_callback(&self) -> bool {
        self.timer_cb.borrow().is_some()
    }

    /// Every `socket_action` call seen so far, in order.
    pub fn action_log(&self) -> Vec<(RawFd, ActionMask)> {
        self.actions.borrow().clone()
    }

    fn announce_pending(&self) {
        // Collect first, then call out: the callback may reenter.
        let pending: Vec<(EasyId, TransferPlan)> = {
            let handles = self.handles.borrow();
            let mut plans = self.plans.borrow_mut();
            plans
                .iter_mut()
                .filter(|(easy, state)| handles.contains(easy) && !state.announced)
                .map(|(easy, state)| {
                    state.announced = true;
                    (*easy, state.plan.clone())
                })
                .collect()
        };

        for (easy, plan) in pending {
            self.request_socket(easy, plan.fd, plan.interest);
            if let Some(ms) = plan.timer_ms {
                self.trigger_timer(ms);
            }
        }
    }

    fn progress_fd(&self, fd: RawFd) {
        let completed: Option<(EasyId, TransferPlan)> = {
            let handles = self.handles.borrow();
            let mut plans = self.plans.borrow_mut();
            let mut hit = None;
            for (easy, state) in plans.iter_mut() {
                if state.plan.fd == fd && handles.contains(easy) && state.remaining > 0 {
                    state.remaining -= 1;
                    if state.remaining == 0 {
                        hit = Some((*easy, state.plan.clone()));
                    }
                    break;
                }
            }
            hit
        };

        if let Some((easy, plan)) = completed {
            self.done.borrow_mut().push_back(DoneMessage {
                handle: easy,
                status: plan.status,
            });
            // Retire the descriptor reentrantly, then clear the slot.
            self.request_socket(easy, fd, SocketInterest::Remove);
            self.slots.borrow_mut().remove(&fd);
        }
    }
}

impl TransferEngine for LabEngine {
    fn add_handle(&self, easy: EasyId) -> MultiStatus {
        self.handles.borrow_mut().insert(easy);
        MultiStatus::Ok
    }

    fn remove_handle(&self, easy: EasyId) -> MultiStatus {
        self.handles.borrow_mut().remove(&easy);
        MultiStatus::Ok
    }

    fn socket_action(&self, fd: RawFd, mask: ActionMask) -> MultiStatus {
        self.actions.borrow_mut().push((fd, mask));

        if fd == SOCKET_TIMEOUT {
            self.announce_pending();
        } else {
            self.progress_fd(fd);
        }
        MultiStatus::Ok
    }

    fn assign(&self, fd: RawFd, slot: Option<EventRef>) {
        match slot {
            Some(event) => {
                self.slots.borrow_mut().insert(fd, event);
            }
            None => {
                self.slots.borrow_mut().remove(&fd);
            }
        }
    }

    fn next_done(&self) -> Option<DoneMessage> {
        self.done.borrow_mut().pop_front()
    }

    fn set_socket_callback(&self, callback: Option<SocketCallback>) {
        *self.socket_cb.borrow_mut() = callback;
    }

    fn set_timer_callback(&self, callback: Option<TimerCallback>) {
        *self.timer_cb.borrow_mut() = callback;
    }
}
