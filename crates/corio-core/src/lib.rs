//! # corio-core — reactor/coroutine boundary for the corio adaptation layer
//!
//! corio lets code written against blocking contracts (poll, select, name
//! resolution, driving a multi-transfer engine) run inside cooperative
//! coroutines. This crate holds the boundary that the adapters in
//! `corio-net` and `corio-transfer` are built on:
//!
//! - [`Reactor`] — the event loop the embedding runtime provides. The
//!   adapters only ever talk to it through this trait: they ask for
//!   readiness / timer / DNS events, enqueue resumed coroutines, and
//!   suspend the current one.
//! - [`Event`] — the polymorphic pending-condition object. Reactors (and
//!   the transfer bridge, which implements its own event types) share the
//!   bookkeeping in [`EventCore`].
//! - [`Waker`] — per-suspension state: the result accumulator, the list of
//!   events registered for this call, and the optional deadline. Destroying
//!   the waker is the single point that cancels everything it owns.
//! - [`Coroutine`] — the handle the runtime and the callbacks share:
//!   waker slot, pending cooperative failure, per-coroutine context map,
//!   and end-of-coroutine finalizers.
//! - [`lab`] — a scripted, fully deterministic reactor used by the test
//!   suites of every corio crate. No sockets, no clock, no threads.
//!
//! ## Flow
//!
//! ```text
//! caller (in coroutine) ──> adapter ──> waker_new ──> resume_when × N
//!                                            │
//!                                        suspend()
//!                                            │            reactor fires
//!                                            │<── callback records update
//!                                            │    buffers + accumulator,
//!                                            │    resume() the coroutine
//!                                        wake: translate accumulator back
//!                                        to the legacy return convention,
//!                                        waker_destroy()
//! ```

pub mod addr;
pub mod bits;
pub mod callback;
pub mod coroutine;
pub mod event;
pub mod failure;
pub mod lab;
pub mod log;
pub mod reactor;
pub mod tls;
pub mod waker;

pub use addr::{AddrInfo, AddrInfoHints, AddrInfoList};
pub use bits::EventBits;
pub use callback::WakerResolve;
pub use coroutine::{
    cancel, context_key_alloc, resume, resume_with_error, ContextKey, Coroutine, CoroutineRef,
    CoroutineState,
};
pub use event::{Event, EventCallback, EventCore, EventRef, RawFd, INVALID_FD};
pub use failure::Failure;
pub use reactor::{suspend, Reactor};
pub use tls::{current_coroutine, deinstall, install};
pub use waker::{
    resume_when, waker_destroy, waker_new, waker_new_with_timeout, Waker, WakerResult,
};
