//! A one-shot, one-byte event.
//!
//! An [`Event`] starts unset and is set exactly once, by the first call to
//! [`notify`](Event::notify). Threads that wait for it before then park on
//! its address. The state only ever moves forward:
//!
//! ```text
//! Unset ──> HasParked ──> Set
//!   └────────────────────────^
//! ```
use crate::{
    loom::sync::atomic::{AtomicU8, Ordering::*},
    parking_lot,
    tstate::ThreadState,
};
use core::fmt;
use mycelium_bitfield::enum_from_bits;
use std::time::Duration;

/// A notify-once synchronization point.
///
/// Everything that happens before [`notify`](Self::notify) is visible to a
/// thread whose wait returns `true`.
#[repr(transparent)]
pub struct Event {
    state: AtomicU8,
}

enum_from_bits! {
    #[derive(Debug, Eq, PartialEq)]
    enum State<u8> {
        Unset = 0,
        Set = 1,
        HasParked = 2,
    }
}

impl Event {
    loom_const_fn! {
        /// Returns a new, unset `Event`.
        #[must_use]
        pub fn new() -> Self {
            Self { state: AtomicU8::new(State::Unset as u8) }
        }
    }

    /// Sets the event, waking every thread waiting for it.
    ///
    /// Setting an event that is already set does nothing.
    pub fn notify(&self) {
        let prev = State::decode(self.state.swap(State::Set as u8, AcqRel));
        match test_dbg!(prev) {
            State::Unset | State::Set => {}
            State::HasParked => {
                let woken = parking_lot::unpark_all(&self.state);
                trace!(woken, "Event::notify: woke waiters");
            }
        }
    }

    /// Blocks until the event is set.
    pub fn wait(&self) {
        while !self.wait_timed(None) {}
    }

    /// Blocks until the event is set, detaching `tstate` while blocked.
    pub fn wait_detached(&self, tstate: &dyn ThreadState) {
        while !self.wait_timed_detached(None, tstate) {}
    }

    /// Blocks until the event is set or `timeout` elapses.
    ///
    /// Returns `true` if the event is set. A `false` return means the wait
    /// timed out (or was interrupted): only a set event is ever reported as
    /// set.
    #[must_use]
    pub fn wait_timed(&self, timeout: Option<Duration>) -> bool {
        self.wait_inner(timeout, None)
    }

    /// Like [`wait_timed`](Self::wait_timed), detaching `tstate` while
    /// blocked.
    #[must_use]
    pub fn wait_timed_detached(&self, timeout: Option<Duration>, tstate: &dyn ThreadState) -> bool {
        self.wait_inner(timeout, Some(tstate))
    }

    /// Returns `true` if the event has been set.
    #[inline]
    #[must_use]
    pub fn is_set(&self) -> bool {
        self.load() == State::Set
    }

    fn wait_inner(&self, timeout: Option<Duration>, tstate: Option<&dyn ThreadState>) -> bool {
        loop {
            match test_dbg!(self.load()) {
                State::Set => return true,
                State::Unset => {
                    if self
                        .state
                        .compare_exchange(State::Unset as u8, State::HasParked as u8, Relaxed, Relaxed)
                        .is_err()
                    {
                        continue;
                    }
                }
                State::HasParked => {}
            }

            let _ = parking_lot::park(&self.state, State::HasParked as u8, timeout, None, tstate);
            return self.is_set();
        }
    }

    #[inline]
    fn load(&self) -> State {
        State::decode(self.state.load(Acquire))
    }
}

impl Default for Event {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event").field("state", &self.load()).finish()
    }
}

impl State {
    fn decode(bits: u8) -> Self {
        Self::try_from(bits).unwrap_or_else(|error| fatal!("corrupted event state: {error}"))
    }
}
