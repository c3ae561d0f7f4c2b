//! Scripted reactor for deterministic tests.
//!
//! `LabReactor` implements the [`Reactor`] boundary with no sockets, no
//! clock and no threads. Tests script what "happens" while the coroutine
//! is suspended: [`LabReactor::on_suspend`] queues actions that run, in
//! order, inside [`Reactor::suspend`]. Readiness is injected with
//! [`LabReactor::fire_fd`], DNS answers come from an in-memory table, and
//! the waker deadline fires automatically once the script runs dry —
//! which is exactly the "nothing became ready before the timeout" case.

use crate::addr::{AddrInfo, AddrInfoHints, AddrInfoList};
use crate::bits::EventBits;
use crate::coroutine::{Coroutine, CoroutineRef, CoroutineState};
use crate::event::{Event, EventCallback, EventCore, EventRef, RawFd, INVALID_FD};
use crate::failure::Failure;
use crate::reactor::Reactor;
use crate::tls;
use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::net::{IpAddr, SocketAddr};
use std::rc::{Rc, Weak};
use std::time::Duration;

/// One scripted resolver answer.
#[derive(Debug, Clone)]
pub struct DnsEntry {
    pub addrs: Vec<IpAddr>,
    pub canonname: Option<String>,
}

enum LabEventKind {
    Socket { fd: RawFd },
    FdPoll { fd: RawFd },
    Timer { ms: u64, periodic: bool },
    AddrInfo {
        node: Option<String>,
        service: Option<String>,
        hints: AddrInfoHints,
    },
    NameInfo { addr: SocketAddr },
}

/// An event produced by the [`LabReactor`].
pub struct LabEvent {
    me: Weak<LabEvent>,
    reactor: Weak<LabReactor>,
    core: EventCore,
    kind: LabEventKind,
    started: Cell<bool>,
    interest: Cell<EventBits>,
    addr_result: RefCell<Option<AddrInfoList>>,
    name_result: RefCell<Option<Rc<str>>>,
}

impl LabEvent {
    fn new(reactor: &Rc<LabReactor>, kind: LabEventKind, interest: EventBits) -> Rc<Self> {
        Rc::new_cyclic(|me| Self {
            me: me.clone(),
            reactor: Rc::downgrade(reactor),
            core: EventCore::new(),
            kind,
            started: Cell::new(false),
            interest: Cell::new(interest),
            addr_result: RefCell::new(None),
            name_result: RefCell::new(None),
        })
    }

    fn self_ref(&self) -> Option<EventRef> {
        self.me.upgrade().map(|rc| rc as EventRef)
    }

    /// Notify this event's callbacks.
    pub fn fire(&self, failure: Option<&Failure>) {
        if let Some(event) = self.self_ref() {
            self.core.notify(&event, failure);
        }
    }

    pub fn interest(&self) -> EventBits {
        self.interest.get()
    }

    pub fn is_started(&self) -> bool {
        self.started.get()
    }

    fn fd(&self) -> RawFd {
        match self.kind {
            LabEventKind::Socket { fd } | LabEventKind::FdPoll { fd } => fd,
            _ => INVALID_FD,
        }
    }

    fn is_timer(&self) -> bool {
        matches!(self.kind, LabEventKind::Timer { .. })
    }

    pub fn timer_ms(&self) -> Option<u64> {
        match self.kind {
            LabEventKind::Timer { ms, .. } => Some(ms),
            _ => None,
        }
    }

    pub fn is_periodic(&self) -> bool {
        matches!(self.kind, LabEventKind::Timer { periodic: true, .. })
    }

    fn resolve_dns(&self) {
        if self.core.is_closed() {
            return;
        }
        let Some(reactor) = self.reactor.upgrade() else {
            return;
        };

        match &self.kind {
            LabEventKind::AddrInfo {
                node,
                service,
                hints,
            } => {
                let Some(node) = node.as_deref() else {
                    self.fire(Some(&Failure::other("lab resolver requires a node")));
                    return;
                };
                let entry = reactor.dns_hosts.borrow().get(node).cloned();
                let Some(entry) = entry else {
                    self.fire(Some(&Failure::other(format!(
                        "getaddrinfo for {} failed",
                        node
                    ))));
                    return;
                };

                let port: u16 = service
                    .as_deref()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(0);
                let mut list = Vec::new();
                for ip in &entry.addrs {
                    let keep = if hints.family == libc::AF_INET {
                        ip.is_ipv4()
                    } else if hints.family == libc::AF_INET6 {
                        ip.is_ipv6()
                    } else {
                        true
                    };
                    if !keep {
                        continue;
                    }
                    let family = if ip.is_ipv4() {
                        libc::AF_INET
                    } else {
                        libc::AF_INET6
                    };
                    list.push(AddrInfo {
                        family,
                        socktype: hints.socktype,
                        protocol: hints.protocol,
                        addr: SocketAddr::new(*ip, port),
                        canonname: if list.is_empty() {
                            entry.canonname.clone()
                        } else {
                            None
                        },
                    });
                }

                if list.is_empty() {
                    self.fire(Some(&Failure::other(format!(
                        "no addresses found for {}",
                        node
                    ))));
                    return;
                }
                *self.addr_result.borrow_mut() = Some(AddrInfoList(list));
                self.fire(None);
            }
            LabEventKind::NameInfo { addr } => {
                let ip = addr.ip().to_string();
                let name = reactor.dns_names.borrow().get(&ip).cloned();
                match name {
                    Some(name) => {
                        *self.name_result.borrow_mut() = Some(Rc::from(name.as_str()));
                        self.fire(None);
                    }
                    None => {
                        self.fire(Some(&Failure::other(format!(
                            "getnameinfo for {} failed",
                            ip
                        ))));
                    }
                }
            }
            _ => {}
        }
    }
}

impl Event for LabEvent {
    fn start(&self) -> Result<(), Failure> {
        if self.core.is_closed() {
            return Err(Failure::other("start on a closed event"));
        }
        self.started.set(true);

        // DNS events resolve from the table once the reactor regains
        // control, i.e. inside the suspension.
        if matches!(
            self.kind,
            LabEventKind::AddrInfo { .. } | LabEventKind::NameInfo { .. }
        ) {
            if let (Some(reactor), Some(me)) = (self.reactor.upgrade(), self.me.upgrade()) {
                reactor.push_action(Box::new(move || me.resolve_dns()));
            }
        }
        Ok(())
    }

    fn stop(&self) {
        if self.core.is_closed() {
            return;
        }
        self.core.set_closed();
        self.started.set(false);
    }

    fn dispose(&self) {
        if !self.core.is_closed() {
            self.stop();
        }
        if let (Some(reactor), Some(me)) = (self.reactor.upgrade(), self.me.upgrade()) {
            reactor.forget(&me);
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

    fn triggered(&self) -> EventBits {
        self.core.triggered()
    }

    fn socket(&self) -> RawFd {
        self.fd()
    }

    fn update_interest(&self, bits: EventBits) {
        self.interest.set(self.interest.get() | bits);
    }

    fn addr_result(&self) -> Option<AddrInfoList> {
        self.addr_result.borrow().clone()
    }

    fn hostname(&self) -> Option<Rc<str>> {
        self.name_result.borrow().clone()
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

/// Deterministic reactor double.
pub struct LabReactor {
    me: Weak<LabReactor>,
    events: RefCell<Vec<Rc<LabEvent>>>,
    script: RefCell<VecDeque<Box<dyn FnOnce()>>>,
    run_queue: RefCell<VecDeque<CoroutineRef>>,
    dns_hosts: RefCell<HashMap<String, DnsEntry>>,
    dns_names: RefCell<HashMap<String, String>>,
    refuse_skip: Cell<u32>,
    refuse_events: Cell<u32>,
    next_coroutine: Cell<u64>,
}

impl LabReactor {
    pub fn new() -> Rc<Self> {
        Rc::new_cyclic(|me| Self {
            me: me.clone(),
            events: RefCell::new(Vec::new()),
            script: RefCell::new(VecDeque::new()),
            run_queue: RefCell::new(VecDeque::new()),
            dns_hosts: RefCell::new(HashMap::new()),
            dns_names: RefCell::new(HashMap::new()),
            refuse_skip: Cell::new(0),
            refuse_events: Cell::new(0),
            next_coroutine: Cell::new(1),
        })
    }

    /// Install this reactor on the current thread.
    pub fn install(self: &Rc<Self>) {
        tls::install(self.clone());
    }

    /// Run `f` as the body of a fresh coroutine, finishing it afterwards.
    pub fn enter<R>(self: &Rc<Self>, f: impl FnOnce() -> R) -> R {
        self.enter_with(|_| f())
    }

    /// Like [`enter`](Self::enter), but hands `f` the coroutine handle
    /// (for cancellation tests).
    pub fn enter_with<R>(self: &Rc<Self>, f: impl FnOnce(&CoroutineRef) -> R) -> R {
        let id = self.next_coroutine.get();
        self.next_coroutine.set(id + 1);
        let coroutine = Coroutine::new(id);

        let previous = tls::current_coroutine();
        tls::set_current_coroutine(Some(coroutine.clone()));
        let out = f(&coroutine);
        coroutine.finish();
        tls::set_current_coroutine(previous);
        out
    }

    /// Queue an action to run while the next coroutine is suspended.
    pub fn on_suspend(&self, f: impl FnOnce() + 'static) {
        self.push_action(Box::new(f));
    }

    fn push_action(&self, f: Box<dyn FnOnce()>) {
        self.script.borrow_mut().push_back(f);
    }

    /// Report readiness for every started event watching `fd`.
    pub fn fire_fd(&self, fd: RawFd, bits: EventBits) {
        for event in self.fd_events(fd) {
            event.core.set_triggered(bits);
            event.fire(None);
        }
    }

    /// Deliver a failure to every started event watching `fd`.
    pub fn fail_fd(&self, fd: RawFd, failure: Failure) {
        for event in self.fd_events(fd) {
            event.fire(Some(&failure));
        }
    }

    fn fd_events(&self, fd: RawFd) -> Vec<Rc<LabEvent>> {
        self.events
            .borrow()
            .iter()
            .filter(|e| e.fd() == fd && e.is_started() && !e.is_closed())
            .cloned()
            .collect()
    }

    /// Fire every started timer event (bridge timers, not just deadlines).
    pub fn fire_timers(&self) {
        let timers: Vec<_> = self
            .events
            .borrow()
            .iter()
            .filter(|e| e.is_timer() && e.is_started() && !e.is_closed())
            .cloned()
            .collect();
        for timer in timers {
            timer.fire(None);
        }
    }

    /// Live (not yet disposed) events, for leak assertions.
    pub fn live_events(&self) -> usize {
        self.events.borrow().len()
    }

    /// Resumptions handed to the scheduler so far.
    pub fn enqueued_resumes(&self) -> usize {
        self.run_queue.borrow().len()
    }

    /// Started timer events currently live.
    pub fn live_timers(&self) -> usize {
        self.events
            .borrow()
            .iter()
            .filter(|e| e.is_timer() && e.is_started())
            .count()
    }

    /// Make the next `n` event constructions fail, as an allocation
    /// refusal would.
    pub fn refuse_next_events(&self, n: u32) {
        self.refuse_skip.set(0);
        self.refuse_events.set(n);
    }

    /// Allow `skip` constructions, then refuse the following `n`.
    pub fn refuse_events_after(&self, skip: u32, n: u32) {
        self.refuse_skip.set(skip);
        self.refuse_events.set(n);
    }

    pub fn add_dns_host(&self, name: &str, addrs: Vec<IpAddr>, canonname: Option<&str>) {
        self.dns_hosts.borrow_mut().insert(
            name.to_string(),
            DnsEntry {
                addrs,
                canonname: canonname.map(str::to_string),
            },
        );
    }

    pub fn add_dns_name(&self, ip: &str, hostname: &str) {
        self.dns_names
            .borrow_mut()
            .insert(ip.to_string(), hostname.to_string());
    }

    fn forget(&self, event: &Rc<LabEvent>) {
        self.events
            .borrow_mut()
            .retain(|e| !Rc::ptr_eq(e, event));
    }

    fn make_event(&self, kind: LabEventKind, interest: EventBits) -> Result<EventRef, Failure> {
        let skip = self.refuse_skip.get();
        if skip > 0 {
            self.refuse_skip.set(skip - 1);
        } else {
            let remaining = self.refuse_events.get();
            if remaining > 0 {
                self.refuse_events.set(remaining - 1);
                return Err(Failure::other("lab: event construction refused"));
            }
        }
        let reactor = self.me.upgrade().expect("lab reactor gone");
        let event = LabEvent::new(&reactor, kind, interest);
        self.events.borrow_mut().push(event.clone());
        Ok(event)
    }
}

impl Reactor for LabReactor {
    fn new_socket_event(&self, fd: RawFd, interest: EventBits) -> Result<EventRef, Failure> {
        self.make_event(LabEventKind::Socket { fd }, interest)
    }

    fn new_fd_event(&self, fd: RawFd, interest: EventBits) -> Result<EventRef, Failure> {
        self.make_event(LabEventKind::FdPoll { fd }, interest)
    }

    fn new_timer_event(&self, timeout: Duration, periodic: bool) -> Result<EventRef, Failure> {
        self.make_event(
            LabEventKind::Timer {
                ms: timeout.as_millis() as u64,
                periodic,
            },
            EventBits::NONE,
        )
    }

    fn new_getaddrinfo_event(
        &self,
        node: Option<&str>,
        service: Option<&str>,
        hints: &AddrInfoHints,
    ) -> Result<EventRef, Failure> {
        self.make_event(
            LabEventKind::AddrInfo {
                node: node.map(str::to_string),
                service: service.map(str::to_string),
                hints: *hints,
            },
            EventBits::NONE,
        )
    }

    fn new_getnameinfo_event(&self, addr: SocketAddr) -> Result<EventRef, Failure> {
        self.make_event(LabEventKind::NameInfo { addr }, EventBits::NONE)
    }

    fn spawn(&self, f: Box<dyn FnOnce()>) -> CoroutineRef {
        let id = self.next_coroutine.get();
        self.next_coroutine.set(id + 1);
        let coroutine = Coroutine::new(id);

        let previous = tls::current_coroutine();
        tls::set_current_coroutine(Some(coroutine.clone()));
        f();
        coroutine.finish();
        tls::set_current_coroutine(previous);
        coroutine
    }

    fn enqueue(&self, coroutine: &CoroutineRef) {
        self.run_queue.borrow_mut().push_back(coroutine.clone());
    }

    fn suspend(&self) {
        let coroutine =
            tls::current_coroutine().expect("lab: suspend called outside a coroutine");

        if coroutine.state() == CoroutineState::Queued {
            coroutine.set_state(CoroutineState::Running);
            return;
        }
        coroutine.set_state(CoroutineState::Suspended);

        loop {
            let action = self.script.borrow_mut().pop_front();
            match action {
                Some(run) => {
                    run();
                    if coroutine.state() == CoroutineState::Queued {
                        coroutine.set_state(CoroutineState::Running);
                        return;
                    }
                }
                None => {
                    // Script exhausted: the deadline, if armed, expires now.
                    let deadline = coroutine.with_waker(|w| w.deadline_event()).flatten();
                    if let Some(timer) = deadline {
                        if !timer.is_closed() {
                            if let Some(lab) = timer.as_any().downcast_ref::<LabEvent>() {
                                lab.fire(None);
                            }
                        }
                        if coroutine.state() == CoroutineState::Queued {
                            coroutine.set_state(CoroutineState::Running);
                            return;
                        }
                    }
                    panic!(
                        "lab: coroutine {} suspended with nothing left to run",
                        coroutine.id()
                    );
                }
            }
        }
    }
}
