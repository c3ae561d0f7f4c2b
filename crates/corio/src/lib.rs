//! # corio — async I/O adaptation layer for coroutine reactors
//!
//! Blocking-contract system primitives (poll, select, name resolution,
//! driving a multi-transfer engine) reworked to cooperate with a
//! coroutine reactor. Callers keep the legacy signatures and return
//! conventions; under the hood each call registers reactor events,
//! suspends the calling coroutine, and resumes it with the legacy result
//! when the reactor signals completion.
//!
//! The embedding runtime provides the reactor
//! ([`Reactor`](corio_core::reactor::Reactor)) and installs it per thread
//! with [`install`]; coroutine code then calls the adapters re-exported
//! here.

pub use corio_core::{
    cancel, context_key_alloc, current_coroutine, install, resume, resume_with_error, AddrInfo,
    AddrInfoHints, AddrInfoList, ContextKey, Coroutine, CoroutineRef, CoroutineState, Event,
    EventBits, EventCallback, EventCore, EventRef, Failure, RawFd, Reactor, Waker, WakerResult,
};
pub use corio_core::{co_debug, co_error, co_info, co_log, co_trace, co_warn};

pub use corio_net::{
    getaddresses_async, getaddrinfo_async, gethostbyaddr_async, gethostbyname_async, poll_async,
    select_async, set_socket_blocking, FdSet, Hostent, PollFd, TimeVal,
};

pub use corio_transfer::{
    install_engine_factory, multi_dispose, multi_perform_async, multi_select_async, perform_async,
    ActionMask, BridgeCtx, DoneMessage, EasyId, EngineRef, MultiHandle, MultiStatus,
    SocketInterest, TransferEngine, TransferStatus, SOCKET_TIMEOUT,
};

/// Initialise the layer for this thread. Idempotent; the single-request
/// transfer state is created lazily here (or on first
/// [`perform_async`]) when an engine factory is installed.
pub fn setup() {
    corio_core::log::init();
    let _ = corio_transfer::setup();
}

/// Dispose the layer's thread-local state: the single-request transfer
/// bridge and the installed reactor.
pub fn shutdown() {
    corio_transfer::shutdown();
    corio_core::deinstall();
}

#[cfg(test)]
mod tests {
    use super::*;
    use corio_core::lab::LabReactor;
    use corio_transfer::lab::LabEngine;

    #[test]
    fn setup_and_shutdown_are_idempotent() {
        let lab = LabReactor::new();
        lab.install();
        let engine = LabEngine::new();
        let for_factory = engine.clone();
        install_engine_factory(move || for_factory.clone() as EngineRef);

        setup();
        setup();
        assert!(engine.has_socket_callback());

        shutdown();
        assert!(!engine.has_socket_callback());
        shutdown();
    }

    #[test]
    fn adapters_are_reachable_through_the_facade() {
        let lab = LabReactor::new();
        lab.install();

        let mut entries = [PollFd::new(3, libc::POLLIN)];
        let ret = lab.clone().enter(|| {
            let fire = lab.clone();
            lab.on_suspend(move || fire.fire_fd(3, EventBits::READABLE));
            poll_async(&mut entries, -1)
        });

        assert_eq!(ret, 1);
        assert_eq!(entries[0].revents, libc::POLLIN);
        shutdown();
    }
}
