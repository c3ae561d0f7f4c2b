//! Event-bit translation between legacy poll bits and reactor bits.
//!
//! The reactor works with an abstract readiness set; legacy callers speak
//! `POLLIN`/`POLLOUT`/... . The two pure functions here convert between the
//! representations. `POLLERR` and `POLLNVAL` are request-side sentinels
//! only: poll(2) reports both conditions as read-ready, so they are
//! requested as [`EventBits::READABLE`] and never produced on the way back.

use std::fmt;
use std::ops::{BitOr, BitOrAssign};

/// Abstract readiness bits understood by the reactor.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct EventBits(u32);

impl EventBits {
    pub const NONE: Self = Self(0);
    pub const READABLE: Self = Self(1);
    pub const WRITABLE: Self = Self(1 << 1);
    pub const DISCONNECT: Self = Self(1 << 2);
    pub const PRIORITIZED: Self = Self(1 << 3);

    #[inline]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// True when the two sets share at least one bit.
    #[inline]
    pub fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }
}

impl BitOr for EventBits {
    type Output = Self;

    #[inline]
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for EventBits {
    #[inline]
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for EventBits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut list = f.debug_list();
        for (bit, name) in [
            (Self::READABLE, "READABLE"),
            (Self::WRITABLE, "WRITABLE"),
            (Self::DISCONNECT, "DISCONNECT"),
            (Self::PRIORITIZED, "PRIORITIZED"),
        ] {
            if self.contains(bit) {
                list.entry(&name);
            }
        }
        list.finish()
    }
}

/// Translate requested poll bits into reactor bits.
///
/// `POLLERR` and `POLLNVAL` collapse to `READABLE`, matching poll(2)'s
/// treat-as-read-ready convention. Round-trip is not expected for them.
pub fn poll_to_bits(events: i16) -> EventBits {
    let mut bits = EventBits::NONE;

    if events & libc::POLLIN != 0 {
        bits |= EventBits::READABLE;
    }
    if events & libc::POLLOUT != 0 {
        bits |= EventBits::WRITABLE;
    }
    if events & libc::POLLHUP != 0 {
        bits |= EventBits::DISCONNECT;
    }
    if events & libc::POLLPRI != 0 {
        bits |= EventBits::PRIORITIZED;
    }
    if events & libc::POLLERR != 0 {
        bits |= EventBits::READABLE;
    }
    if events & libc::POLLNVAL != 0 {
        bits |= EventBits::READABLE;
    }

    bits
}

/// Translate triggered reactor bits back into poll `revents` bits.
pub fn bits_to_poll(bits: EventBits) -> i16 {
    let mut events: i16 = 0;

    if bits.contains(EventBits::READABLE) {
        events |= libc::POLLIN;
    }
    if bits.contains(EventBits::WRITABLE) {
        events |= libc::POLLOUT;
    }
    if bits.contains(EventBits::DISCONNECT) {
        events |= libc::POLLHUP;
    }
    if bits.contains(EventBits::PRIORITIZED) {
        events |= libc::POLLPRI;
    }

    events
}
