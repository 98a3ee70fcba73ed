//! The runtime's general-purpose lock: one byte, fair under contention.
//!
//! A [`ByteMutex`] is a single [`AtomicU8`] holding one of four states:
//!
//! | state                 | bits   | meaning                                 |
//! |-----------------------|--------|-----------------------------------------|
//! | `Unlocked`            | `0b00` | free, nobody waiting                    |
//! | `Locked`              | `0b01` | held, nobody waiting                    |
//! | `UnlockedHasParked`   | `0b10` | free, threads parked or about to wake   |
//! | `LockedHasParked`     | `0b11` | held, threads parked on its address     |
//!
//! Locking and unlocking an uncontended mutex is a single compare-and-swap.
//! Contended threads (optionally after spinning briefly) set the
//! "has parked" bit and sleep in the [parking lot], keyed by the mutex's
//! address. The "has parked" bit may be set when nobody is parked anymore,
//! but never the other way around.
//!
//! # Fairness
//!
//! A woken waiter normally has to race newly arriving threads for the lock,
//! which keeps throughput high but could starve it. To bound that, each
//! waiter notes when it started waiting. If a waiter has been waiting for
//! longer than [`FAIRNESS_WINDOW`] when the lock is released, the unlocking
//! thread hands it the lock directly: the state stays locked and the waiter
//! returns owning it.
//!
//! [parking lot]: crate::parking_lot
use crate::{
    loom::{
        sync::atomic::{AtomicU8, Ordering::{self, *}},
        thread,
    },
    parking_lot::{self, ParkStatus},
    time::Deadline,
    tstate::ThreadState,
};
use core::{fmt, ptr::NonNull};
use mycelium_bitfield::{bitfield, enum_from_bits};
use std::time::{Duration, Instant};

/// How long a waiter races newly arriving threads for the lock before the
/// unlocking thread hands the lock to it directly.
pub const FAIRNESS_WINDOW: Duration = Duration::from_millis(1);

/// How many times a contended locker yields before parking.
///
/// Only free-threaded builds spin: with a global interpreter lock, the
/// holder can't make progress while we spin anyway.
pub const MAX_SPIN_COUNT: usize = if cfg!(feature = "free-threaded") {
    40
} else {
    0
};

/// A one-byte mutual exclusion lock with direct handoff to starved waiters.
///
/// `ByteMutex` is zero-initialized and needs no destruction, so it can be
/// embedded in any structure. It protects no data by itself; wrap data in a
/// [`blocking::Mutex<T, ByteMutex>`](crate::blocking::Mutex) to get RAII
/// guards.
#[repr(transparent)]
pub struct ByteMutex {
    state: AtomicU8,
}

bitfield! {
    /// Options for [`ByteMutex::lock_timed`].
    #[derive(Eq, PartialEq)]
    pub struct LockFlags<u8> {
        /// Detach the thread state while blocked.
        pub const DETACH: bool;

        /// When interrupted, run the thread state's
        /// [pending calls](ThreadState::make_pending_calls), and give up
        /// with [`LockStatus::Interrupted`] if one of them fails.
        pub const HANDLE_SIGNALS: bool;

        /// When interrupted, give up with [`LockStatus::Interrupted`].
        ///
        /// Ignored if `HANDLE_SIGNALS` is also set.
        pub const FAIL_IF_INTERRUPTED: bool;
    }
}

/// The outcome of [`ByteMutex::lock_timed`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[must_use]
pub enum LockStatus {
    /// The lock was acquired.
    Acquired,
    /// The lock was not acquired before the timeout elapsed.
    Failure,
    /// The wait was interrupted, and the caller asked to be told.
    Interrupted,
}

/// Error returned by [`ByteMutex::try_unlock`] when the mutex was not locked.
#[derive(Copy, Clone, Debug, Eq, PartialEq, thiserror::Error)]
#[error("unlocking mutex that is not locked")]
pub struct NotLocked(());

enum_from_bits! {
    #[derive(Debug, Eq, PartialEq)]
    enum State<u8> {
        Unlocked = 0b00,
        Locked = 0b01,
        UnlockedHasParked = 0b10,
        LockedHasParked = 0b11,
    }
}

/// Shared between a parked locker and the thread that unparks it.
///
/// Lives on the locker's stack. The unparker only touches it from the
/// parking lot callback, under the bucket lock.
struct MutexEntry {
    /// Written by the locker.
    #[cfg_attr(loom, allow(dead_code))]
    time_to_be_fair: Instant,
    /// Written by the unparker: `true` if the lock now belongs to the
    /// locker.
    handed_off: bool,
    /// How many times the locker was woken without a handoff.
    lost_races: usize,
}

// === impl ByteMutex ===

impl ByteMutex {
    loom_const_fn! {
        /// Returns a new `ByteMutex`, in the unlocked state.
        #[must_use]
        pub fn new() -> Self {
            Self { state: AtomicU8::new(State::Unlocked as u8) }
        }
    }

    /// Attempts to acquire the lock without blocking.
    ///
    /// This is a single compare-and-swap from the `Unlocked` state, so it
    /// fails if any thread is parked on the mutex, even if it is free.
    #[cfg_attr(test, track_caller)]
    #[must_use]
    pub fn try_lock(&self) -> bool {
        test_dbg!(self
            .state
            .compare_exchange(State::Unlocked as u8, State::Locked as u8, Acquire, Relaxed)
            .is_ok())
    }

    /// Acquires the lock, blocking until it is available.
    ///
    /// The calling thread's state is not detached while it waits; use
    /// [`lock_detached`](Self::lock_detached) from runtime threads.
    #[cfg_attr(test, track_caller)]
    pub fn lock(&self) {
        if !self.try_lock() {
            let status = self.lock_timed(None, LockFlags::new(), None);
            debug_assert_eq!(status, LockStatus::Acquired);
        }
    }

    /// Acquires the lock, detaching `tstate` while blocked.
    #[cfg_attr(test, track_caller)]
    pub fn lock_detached(&self, tstate: &dyn ThreadState) {
        if !self.try_lock() {
            let flags = LockFlags::new().with(LockFlags::DETACH, true);
            let status = self.lock_timed(None, flags, Some(tstate));
            debug_assert_eq!(status, LockStatus::Acquired);
        }
    }

    /// Acquires the lock, giving up after `timeout`.
    ///
    /// - `timeout`: `None` waits forever; `Some(Duration::ZERO)` fails
    ///   immediately if the lock is held.
    /// - `flags`: see [`LockFlags`].
    /// - `tstate`: the calling thread's state, used by the `DETACH` and
    ///   `HANDLE_SIGNALS` flags.
    ///
    /// Interruptions are retried unless `flags` say otherwise.
    pub fn lock_timed(
        &self,
        timeout: Option<Duration>,
        flags: LockFlags,
        tstate: Option<&dyn ThreadState>,
    ) -> LockStatus {
        let state = self.load(Relaxed);
        if !state.is_locked() {
            if self.compare_exchange(state, state.with_locked()).is_ok() {
                return LockStatus::Acquired;
            }
        } else if timeout == Some(Duration::ZERO) {
            return LockStatus::Failure;
        }

        self.lock_slow(timeout, flags, tstate)
    }

    /// Releases the lock.
    ///
    /// If threads are parked on the mutex, one of them is woken, and may be
    /// handed the lock directly.
    ///
    /// Unlocking a mutex that is not locked is a fatal error.
    #[cfg_attr(test, track_caller)]
    pub fn unlock(&self) {
        if test_dbg!(self
            .state
            .compare_exchange(State::Locked as u8, State::Unlocked as u8, Release, Relaxed)
            .is_err())
        {
            self.unlock_slow();
        }
    }

    /// Releases the lock, returning an error if it was not locked.
    pub fn try_unlock(&self) -> Result<(), NotLocked> {
        let mut state = self.load(Relaxed);
        loop {
            if !state.is_locked() {
                return Err(NotLocked(()));
            }

            if state.has_parked() {
                parking_lot::unpark_one(&self.state, |entry, has_more| {
                    self.unpark_callback(entry, has_more)
                });
                return Ok(());
            }

            match self.compare_exchange(state, State::Unlocked) {
                Ok(_) => return Ok(()),
                Err(actual) => state = actual,
            }
        }
    }

    /// Returns `true` if the mutex is locked.
    ///
    /// This is a racy snapshot, only good for assertions and diagnostics.
    #[inline]
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.load(Relaxed).is_locked()
    }

    #[cold]
    #[inline(never)]
    fn lock_slow(
        &self,
        mut timeout: Option<Duration>,
        flags: LockFlags,
        tstate: Option<&dyn ThreadState>,
    ) -> LockStatus {
        let now = Instant::now();
        let deadline = Deadline::after(now, timeout);
        let mut entry = MutexEntry {
            time_to_be_fair: now + FAIRNESS_WINDOW,
            handed_off: false,
            lost_races: 0,
        };
        let detach = if flags.get(LockFlags::DETACH) {
            tstate
        } else {
            None
        };

        let mut spins = 0;
        let mut state = self.load(Relaxed);
        loop {
            if !state.is_locked() {
                match self.compare_exchange(state, state.with_locked()) {
                    Ok(_) => return LockStatus::Acquired,
                    Err(actual) => {
                        state = actual;
                        continue;
                    }
                }
            }

            if !state.has_parked() && spins < MAX_SPIN_COUNT {
                thread::yield_now();
                spins += 1;
                state = self.load(Relaxed);
                continue;
            }

            if timeout == Some(Duration::ZERO) {
                return LockStatus::Failure;
            }

            let parked = state.with_parked();
            if parked != state {
                // we are the first waiter.
                if let Err(actual) = self.compare_exchange(state, parked) {
                    state = actual;
                    continue;
                }
            }

            let park_arg = NonNull::from(&mut entry).cast::<()>();
            match parking_lot::park(&self.state, parked as u8, timeout, Some(park_arg), detach) {
                ParkStatus::Unparked if entry.handed_off => {
                    debug_assert!(self.is_locked(), "handed off an unlocked mutex");
                    trace!(
                        mutex = ?self,
                        lost_races = entry.lost_races,
                        "ByteMutex::lock: handed off"
                    );
                    return LockStatus::Acquired;
                }
                ParkStatus::Unparked => entry.lost_races += 1,
                ParkStatus::Interrupted => {
                    // handled signals that ran cleanly keep the lock waiting,
                    // even if it would otherwise fail when interrupted.
                    if flags.get(LockFlags::HANDLE_SIGNALS) {
                        let failed = tstate
                            .is_some_and(|tstate| tstate.make_pending_calls().is_err());
                        if failed {
                            return LockStatus::Interrupted;
                        }
                    } else if flags.get(LockFlags::FAIL_IF_INTERRUPTED) {
                        return LockStatus::Interrupted;
                    }
                }
                ParkStatus::TimedOut => return LockStatus::Failure,
                ParkStatus::Invalid => {}
            }

            timeout = deadline.remaining();
            state = self.load(Relaxed);
        }
    }

    #[cold]
    #[inline(never)]
    #[cfg_attr(test, track_caller)]
    fn unlock_slow(&self) {
        if self.try_unlock().is_err() {
            fatal!("unlocking mutex that is not locked");
        }
    }

    /// Decides the state the mutex is left in when a parked thread is woken.
    ///
    /// Runs under the parking lot's bucket lock.
    fn unpark_callback(&self, entry: Option<NonNull<()>>, has_more: bool) {
        let state = match entry {
            Some(entry) => {
                // Safety: the parked thread passed a pointer to its own
                // `MutexEntry`, and can't return before this callback does.
                let entry = unsafe { entry.cast::<MutexEntry>().as_mut() };
                let fair = entry.should_be_fair();
                entry.handed_off = fair;
                trace!(fair, has_more, "ByteMutex::unlock: waking waiter");
                State::new(fair, has_more)
            }
            None => State::Unlocked,
        };
        self.state.store(state as u8, Release);
    }

    #[inline]
    fn load(&self, order: Ordering) -> State {
        State::decode(self.state.load(order))
    }

    #[inline]
    fn compare_exchange(&self, current: State, new: State) -> Result<State, State> {
        self.state
            .compare_exchange(current as u8, new as u8, AcqRel, Relaxed)
            .map(State::decode)
            .map_err(State::decode)
    }
}

impl Default for ByteMutex {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ByteMutex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ByteMutex")
            .field("state", &self.load(Relaxed))
            .finish()
    }
}

// === impl LockFlags ===

impl Default for LockFlags {
    fn default() -> Self {
        Self::new()
    }
}

// === impl State ===

impl State {
    const LOCKED: u8 = 0b01;
    const HAS_PARKED: u8 = 0b10;

    fn new(locked: bool, has_parked: bool) -> Self {
        let mut bits = 0;
        if locked {
            bits |= Self::LOCKED;
        }
        if has_parked {
            bits |= Self::HAS_PARKED;
        }
        Self::decode(bits)
    }

    #[inline]
    fn decode(bits: u8) -> Self {
        Self::try_from(bits).unwrap_or_else(|error| fatal!("corrupted mutex state: {error}"))
    }

    #[inline]
    fn is_locked(self) -> bool {
        self as u8 & Self::LOCKED != 0
    }

    #[inline]
    fn has_parked(self) -> bool {
        self as u8 & Self::HAS_PARKED != 0
    }

    #[inline]
    fn with_locked(self) -> Self {
        Self::new(true, self.has_parked())
    }

    #[inline]
    fn with_parked(self) -> Self {
        Self::new(self.is_locked(), true)
    }
}

// === impl MutexEntry ===

impl MutexEntry {
    #[cfg(not(loom))]
    fn should_be_fair(&self) -> bool {
        Instant::now() > self.time_to_be_fair
    }

    // loom has no clock to wait out the fairness window with, so hand off
    // to any waiter that has already lost a race.
    #[cfg(loom)]
    fn should_be_fair(&self) -> bool {
        self.lost_races > 0
    }
}
