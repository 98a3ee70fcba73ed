//! The raw wait primitive underneath every blocking operation.
//!
//! A [`Semaphore`] is a small counting semaphore built directly on the
//! platform mutex and condition variable. It is the only place in this crate
//! where a thread parked in the [parking lot] goes to sleep. (The
//! [`RawMutex`] slow path, which the parking lot is built on, parks the OS
//! thread directly.)
//!
//! Each OS thread owns one semaphore, its *parker*, which is created the
//! first time the thread parks and is shared by reference count. A
//! thread that wakes another always does so through its own reference to
//! the sleeper's semaphore, so the sleeper may return (and tear down the
//! stack frame that linked it into a wait list) as soon as the wakeup is
//! posted.
//!
//! [`RawMutex`]: crate::raw_mutex::RawMutex
//! [parking lot]: crate::parking_lot
use crate::loom::sync::{Arc, Condvar, Mutex, MutexGuard};
use core::fmt;
use std::{
    sync::PoisonError,
    time::{Duration, Instant},
};

/// A counting semaphore with timed and interruptible waits.
pub struct Semaphore {
    state: Mutex<State>,
    cond: Condvar,
}

/// A handle that can interrupt the thread owning a [`Semaphore`].
///
/// This is the equivalent of delivering a signal to a blocked thread: if the
/// thread is in (or next enters) an interruptible wait, that wait returns
/// [`WaitStatus::Interrupted`] instead of sleeping. Interruptions are sticky
/// until an interruptible wait consumes them; uninterruptible waits leave
/// them pending.
#[derive(Clone)]
pub struct Interrupter(Arc<Semaphore>);

/// The outcome of [`Semaphore::wait`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum WaitStatus {
    /// A permit was consumed.
    Acquired,
    /// The timeout elapsed before a permit was posted.
    TimedOut,
    /// The wait was interrupted.
    Interrupted,
}

#[derive(Debug, Default)]
struct State {
    permits: usize,
    interrupted: bool,
}

crate::loom::thread_local! {
    static PARKER: Arc<Semaphore> = Arc::new(Semaphore::new());
}

/// Returns the calling thread's parker.
#[cfg(not(loom))]
pub(crate) fn current() -> Arc<Semaphore> {
    PARKER.try_with(Arc::clone).unwrap_or_else(|_| {
        fatal!("thread blocked after its parker was destroyed (during thread exit?)")
    })
}

#[cfg(loom)]
pub(crate) fn current() -> Arc<Semaphore> {
    PARKER.with(Arc::clone)
}

// === impl Semaphore ===

impl Semaphore {
    /// Returns a new semaphore with no permits.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            cond: Condvar::new(),
        }
    }

    /// Adds a permit, waking a thread blocked in [`wait`](Self::wait).
    pub fn post(&self) {
        let mut state = self.lock();
        state.permits += 1;
        self.cond.notify_one();
    }

    /// Interrupts the current or next interruptible [`wait`](Self::wait).
    pub fn interrupt(&self) {
        let mut state = self.lock();
        state.interrupted = true;
        self.cond.notify_all();
    }

    /// Waits for a permit.
    ///
    /// - `timeout`: `None` waits forever, `Some(Duration::ZERO)` only takes
    ///   a permit if one is already available.
    /// - `interruptible`: if `true`, a pending interruption ends the wait
    ///   with [`WaitStatus::Interrupted`]. A permit that is already available
    ///   takes priority over an interruption.
    pub fn wait(&self, timeout: Option<Duration>, interruptible: bool) -> WaitStatus {
        let deadline = timeout.and_then(|timeout| Instant::now().checked_add(timeout));
        let mut state = self.lock();
        loop {
            if state.permits > 0 {
                state.permits -= 1;
                return WaitStatus::Acquired;
            }

            if interruptible && state.interrupted {
                state.interrupted = false;
                return WaitStatus::Interrupted;
            }

            if timeout == Some(Duration::ZERO) {
                return WaitStatus::TimedOut;
            }

            state = match deadline {
                Some(deadline) if crate::loom::HAS_TIMEOUTS => {
                    let now = Instant::now();
                    if now >= deadline {
                        return WaitStatus::TimedOut;
                    }
                    self.wait_timeout(state, deadline - now)
                }
                _ => self
                    .cond
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner),
            };
        }
    }

    #[cfg(not(loom))]
    fn wait_timeout<'a>(&self, state: MutexGuard<'a, State>, dur: Duration) -> MutexGuard<'a, State> {
        let (state, _) = self
            .cond
            .wait_timeout(state, dur)
            .unwrap_or_else(PoisonError::into_inner);
        state
    }

    #[cfg(loom)]
    fn wait_timeout<'a>(&self, state: MutexGuard<'a, State>, _: Duration) -> MutexGuard<'a, State> {
        self.cond.wait(state).unwrap_or_else(PoisonError::into_inner)
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // no user code ever runs while this lock is held, so it cannot be
        // poisoned by anything but a bug in this module.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for Semaphore {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.state.try_lock() {
            Ok(state) => f
                .debug_struct("Semaphore")
                .field("permits", &state.permits)
                .field("interrupted", &state.interrupted)
                .finish(),
            Err(_) => f.pad("Semaphore { <locked> }"),
        }
    }
}

// === impl Interrupter ===

impl Interrupter {
    /// Returns an `Interrupter` for the calling thread.
    #[must_use]
    pub fn current() -> Self {
        Self(current())
    }

    /// Interrupts the thread this handle was created on.
    pub fn interrupt(&self) {
        test_debug!("Interrupter::interrupt");
        self.0.interrupt();
    }
}

impl fmt::Debug for Interrupter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Interrupter").field(&self.0).finish()
    }
}
