//! # corio-transfer — reactor bridge for a multi-transfer engine
//!
//! A multi-transfer URL engine drives its I/O by calling back into the
//! embedder: a *socket callback* announces which descriptors it wants
//! watched, a *timer callback* asks for a wakeup. This crate wires that
//! protocol into the corio reactor so transfers make progress while the
//! requesting coroutine is suspended:
//!
//! - [`single`] — one thread-local engine shared by every
//!   [`perform_async`](single::perform_async) call; the classic
//!   one-request-blocks-one-coroutine shape.
//! - [`bridge`] — a per-multi-handle [`BridgeCtx`](bridge::BridgeCtx) for
//!   embedders that expose the multi API itself
//!   ([`multi_perform_async`](bridge::multi_perform_async),
//!   [`multi_select_async`](bridge::multi_select_async)).
//!
//! The engine stays external: everything goes through the
//! [`TransferEngine`](engine::TransferEngine) contract, and [`lab`]
//! provides a scripted implementation for tests.

pub mod bridge;
pub mod engine;
pub mod lab;
pub mod single;

pub use bridge::{multi_dispose, multi_perform_async, multi_select_async, BridgeCtx, MultiHandle};
pub use engine::{
    ActionMask, DoneMessage, EasyId, EngineRef, MultiStatus, SocketInterest, TransferEngine,
    TransferStatus, SOCKET_TIMEOUT,
};
pub use single::{install_engine_factory, perform_async, setup, shutdown};
