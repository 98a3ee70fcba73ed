//! One-time initialization with a fallible initializer.
use crate::{
    loom::sync::atomic::{AtomicU8, Ordering::*},
    parking_lot,
    tstate::ThreadState,
};
use core::fmt;
use mycelium_bitfield::enum_from_bits;

/// A one-byte flag guarding a one-time initialization.
///
/// Unlike [`std::sync::Once`], the initializer may fail. A failed (or
/// panicking) initializer leaves the `Once` incomplete, and the next caller
/// runs its own initializer.
#[repr(transparent)]
pub struct Once {
    state: AtomicU8,
}

enum_from_bits! {
    #[derive(Debug, Eq, PartialEq)]
    enum State<u8> {
        Incomplete = 0b000,
        Running = 0b001,
        RunningHasParked = 0b011,
        Complete = 0b100,
    }
}

/// Publishes the outcome of a running initializer, even if it panics.
struct Finish<'a> {
    once: &'a Once,
    complete: bool,
}

impl Once {
    loom_const_fn! {
        /// Returns a new, incomplete `Once`.
        #[must_use]
        pub fn new() -> Self {
            Self { state: AtomicU8::new(State::Incomplete as u8) }
        }
    }

    /// Runs `f` if no initializer has completed successfully yet.
    ///
    /// If another thread is running its initializer, this blocks until it
    /// finishes. Returns `Ok(())` once the `Once` is complete, whether or not
    /// `f` was the initializer that completed it. If `f` runs and fails, its
    /// error is returned and the `Once` stays incomplete.
    pub fn call_once<E>(&self, f: impl FnOnce() -> Result<(), E>) -> Result<(), E> {
        if self.is_completed() {
            return Ok(());
        }
        self.call_once_slow(None, f)
    }

    /// Like [`call_once`](Self::call_once), detaching `tstate` while blocked.
    pub fn call_once_detached<E>(
        &self,
        tstate: &dyn ThreadState,
        f: impl FnOnce() -> Result<(), E>,
    ) -> Result<(), E> {
        if self.is_completed() {
            return Ok(());
        }
        self.call_once_slow(Some(tstate), f)
    }

    /// Returns `true` if an initializer has completed successfully.
    #[inline]
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.load() == State::Complete
    }

    #[cold]
    fn call_once_slow<E>(
        &self,
        tstate: Option<&dyn ThreadState>,
        f: impl FnOnce() -> Result<(), E>,
    ) -> Result<(), E> {
        let mut state = self.load();
        loop {
            match test_dbg!(state) {
                State::Complete => return Ok(()),
                State::Incomplete => match self.compare_exchange(state, State::Running) {
                    Ok(_) => break,
                    Err(actual) => {
                        state = actual;
                        continue;
                    }
                },
                State::Running => {
                    // we are the first waiter.
                    if let Err(actual) = self.compare_exchange(state, State::RunningHasParked) {
                        state = actual;
                        continue;
                    }
                }
                State::RunningHasParked => {}
            }

            let _ = parking_lot::park(
                &self.state,
                State::RunningHasParked as u8,
                None,
                None,
                tstate,
            );
            state = self.load();
        }

        let mut finish = Finish {
            once: self,
            complete: false,
        };
        let result = f();
        finish.complete = result.is_ok();
        result
    }

    #[inline]
    fn load(&self) -> State {
        State::decode(self.state.load(Acquire))
    }

    #[inline]
    fn compare_exchange(&self, current: State, new: State) -> Result<State, State> {
        self.state
            .compare_exchange(current as u8, new as u8, Acquire, Acquire)
            .map(State::decode)
            .map_err(State::decode)
    }
}

impl Default for Once {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Once {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Once").field("state", &self.load()).finish()
    }
}

impl Drop for Finish<'_> {
    fn drop(&mut self) {
        let next = if self.complete {
            State::Complete
        } else {
            State::Incomplete
        };
        let prev = State::decode(self.once.state.swap(next as u8, AcqRel));
        if prev == State::RunningHasParked {
            let woken = parking_lot::unpark_all(&self.once.state);
            trace!(complete = self.complete, woken, "Once: woke waiters");
        }
    }
}

impl State {
    fn decode(bits: u8) -> Self {
        Self::try_from(bits).unwrap_or_else(|error| fatal!("corrupted once state: {error}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loom::{
        self,
        sync::{atomic::AtomicUsize, Arc},
        thread,
    };

    #[test]
    fn runs_once() {
        loom::model(|| {
            let once = Once::new();
            let mut calls = 0;
            assert_eq!(once.call_once(|| Ok::<_, ()>(calls += 1)), Ok(()));
            assert_eq!(once.call_once(|| Ok::<_, ()>(calls += 1)), Ok(()));
            assert_eq!(calls, 1);
            assert!(once.is_completed());
        });
    }

    #[test]
    fn failure_allows_retry() {
        loom::model(|| {
            let once = Once::new();
            assert_eq!(once.call_once(|| Err("nope")), Err("nope"));
            assert!(!once.is_completed());

            assert_eq!(once.call_once(|| Ok::<_, &str>(())), Ok(()));
            assert!(once.is_completed());
        });
    }

    #[test]
    fn concurrent_callers_run_one_initializer() {
        loom::model(|| {
            let once = Arc::new(Once::new());
            let calls = Arc::new(AtomicUsize::new(0));

            let init = |once: &Once, calls: &AtomicUsize| {
                once.call_once(|| {
                    calls.fetch_add(1, SeqCst);
                    Ok::<_, ()>(())
                })
                .unwrap();
                assert!(once.is_completed());
            };

            let thread = thread::spawn({
                let once = once.clone();
                let calls = calls.clone();
                move || init(&once, &calls)
            });

            init(&once, &calls);
            thread.join().unwrap();

            assert_eq!(calls.load(SeqCst), 1);
        });
    }

    #[test]
    fn waiter_retries_after_failure() {
        loom::model(|| {
            let once = Arc::new(Once::new());
            let thread = thread::spawn({
                let once = once.clone();
                move || once.call_once(|| Err(()))
            });

            // either we run first and succeed, or the other thread fails
            // and we retry.
            assert_eq!(once.call_once(|| Ok::<_, ()>(())), Ok(()));
            let _ = thread.join().unwrap();
            assert!(once.is_completed());
        });
    }

    #[test]
    #[cfg(not(loom))]
    fn panicking_initializer_resets() {
        let once = Once::new();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            once.call_once(|| -> Result<(), ()> { panic!("initializer panicked") })
        }));
        assert!(result.is_err());
        assert!(!once.is_completed());

        assert_eq!(once.call_once(|| Ok::<_, ()>(())), Ok(()));
    }
}
