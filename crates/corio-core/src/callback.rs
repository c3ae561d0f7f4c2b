//! The standard waker-resolve callback record.

use crate::coroutine::{resume, resume_with_error, CoroutineRef};
use crate::event::{EventCallback, EventRef};
use crate::failure::Failure;
use std::rc::Rc;

/// Default resolver: copy the event's numeric result into the waker and
/// resume the coroutine. Used where the caller needs no per-event buffer
/// updates — the transfer bridge links its events with this record.
pub struct WakerResolve {
    coroutine: CoroutineRef,
}

impl WakerResolve {
    pub fn new(coroutine: CoroutineRef) -> Rc<Self> {
        Rc::new(Self { coroutine })
    }
}

impl EventCallback for WakerResolve {
    fn invoke(&self, event: &EventRef, failure: Option<&Failure>) {
        if let Some(failure) = failure {
            event.mark_failure_handled();
            resume_with_error(&self.coroutine, failure.clone());
            return;
        }

        if let Some(value) = event.result() {
            self.coroutine.with_waker(|w| w.set_status(value));
        }
        resume(&self.coroutine);
    }
}
