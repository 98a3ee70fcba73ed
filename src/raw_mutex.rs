//! A word-sized lock that never touches the parking lot.
//!
//! [`RawMutex`] is the lock protecting each [parking lot] bucket, so it
//! cannot itself park. Instead, a contended locker pushes a waiter record
//! (which lives on its own stack) onto a singly-linked list threaded through
//! the lock word, and sleeps until the unlocking thread sets the record's
//! `woken` flag.
//!
//! The flag, not the wakeup, is what tells a waiter it was popped. A thread
//! that gave up waiting in the parking lot may still have a wakeup in flight
//! when it takes a bucket lock, and the thread may be unparked spuriously.
//! Neither is mistaken for being popped off this list.
//!
//! The lowest bit of the word is the lock bit. The remaining bits are the
//! address of the most recently pushed waiter, whose `next` field links to
//! the waiter pushed before it, and so on. Pushing a waiter and taking or
//! releasing the lock are always a single compare-and-swap over the whole
//! word.
//!
//! Unlocking does **not** hand the lock to the waiter it wakes: the popped
//! waiter has to race for the lock again like any other thread.
//!
//! [parking lot]: crate::parking_lot
use crate::loom::{
    sync::atomic::{AtomicBool, AtomicUsize, Ordering::*},
    thread::{self, Thread},
};
use core::{fmt, ptr};

/// A word-sized mutual exclusion lock with an intrusive list of waiters.
///
/// This is the lowest-level lock in the crate; prefer
/// [`ByteMutex`](crate::ByteMutex) for anything that is not part of the
/// parking lot itself. Use it with [`blocking::Mutex`](crate::blocking::Mutex)
/// to protect data.
pub struct RawMutex {
    state: AtomicUsize,
}

/// A thread blocked in [`RawMutex::lock`].
///
/// Owned by the blocked thread's stack frame, and only ever read by the
/// thread that pops it off the list.
// the lock bit is stolen from the waiter's address.
#[repr(align(2))]
struct RawWaiter {
    next: *const RawWaiter,
    thread: Thread,
    /// Set by the unlocking thread once it has popped this waiter. The
    /// waiter's frame may be gone as soon as this is stored.
    woken: AtomicBool,
}

const UNLOCKED: usize = 0;
const LOCKED: usize = 1;

// === impl RawMutex ===

impl RawMutex {
    loom_const_fn! {
        /// Returns a new `RawMutex`, in the unlocked state.
        #[must_use]
        pub fn new() -> Self {
            Self { state: AtomicUsize::new(UNLOCKED) }
        }
    }

    /// Acquires the lock, blocking the current thread until it is available.
    #[cfg_attr(test, track_caller)]
    pub fn lock(&self) {
        if test_dbg!(self
            .state
            .compare_exchange(UNLOCKED, LOCKED, Acquire, Relaxed)
            .is_err())
        {
            self.lock_slow();
        }
    }

    /// Attempts to acquire the lock without blocking.
    ///
    /// Returns `true` if the lock was acquired.
    #[cfg_attr(test, track_caller)]
    pub fn try_lock(&self) -> bool {
        let mut state = self.state.load(Relaxed);
        while state & LOCKED == 0 {
            // keep any waiters that are still linked into the word.
            match self
                .state
                .compare_exchange(state, state | LOCKED, Acquire, Relaxed)
            {
                Ok(_) => return true,
                Err(actual) => state = actual,
            }
        }
        false
    }

    /// Releases the lock, waking the most recently linked waiter, if there is
    /// one.
    ///
    /// # Safety
    ///
    /// The caller must hold the lock. Unlocking a `RawMutex` whose lock bit
    /// is clear is a fatal error.
    #[cfg_attr(test, track_caller)]
    pub unsafe fn unlock(&self) {
        if test_dbg!(self
            .state
            .compare_exchange(LOCKED, UNLOCKED, Release, Relaxed)
            .is_err())
        {
            self.unlock_slow();
        }
    }

    /// Returns `true` if the lock is currently held.
    ///
    /// This is a racy snapshot.
    #[inline]
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.state.load(Relaxed) & LOCKED == LOCKED
    }

    #[cold]
    #[inline(never)]
    fn lock_slow(&self) {
        let mut waiter = RawWaiter {
            next: ptr::null(),
            thread: thread::current(),
            woken: AtomicBool::new(false),
        };

        let mut state = self.state.load(Relaxed);
        loop {
            if state & LOCKED == 0 {
                match self
                    .state
                    .compare_exchange(state, state | LOCKED, Acquire, Relaxed)
                {
                    Ok(_) => return,
                    Err(actual) => {
                        state = actual;
                        continue;
                    }
                }
            }

            waiter.next = (state & !LOCKED) as *const RawWaiter;
            waiter.woken.store(false, Relaxed);
            let link = ptr::addr_of!(waiter) as usize | LOCKED;
            if let Err(actual) = self
                .state
                .compare_exchange(state, link, Release, Relaxed)
            {
                state = actual;
                continue;
            }

            trace!(waiter = ?ptr::addr_of!(waiter), "RawMutex::lock: waiting");
            // no handoff: the unlocking thread has released the lock (and
            // popped us) by the time `woken` is set.
            while !test_dbg!(waiter.woken.load(Acquire)) {
                thread::park();
            }
            state = self.state.load(Relaxed);
        }
    }

    #[cold]
    #[inline(never)]
    fn unlock_slow(&self) {
        let mut state = self.state.load(Acquire);
        loop {
            if state & LOCKED == 0 {
                fatal!("unlocking mutex that is not locked");
            }

            let head = (state & !LOCKED) as *const RawWaiter;
            if head.is_null() {
                match self
                    .state
                    .compare_exchange(state, UNLOCKED, Release, Acquire)
                {
                    Ok(_) => return,
                    Err(actual) => {
                        state = actual;
                        continue;
                    }
                }
            }

            // Safety: only the lock holder pops waiters, and a waiter does
            // not return from `lock_slow` until its `woken` flag is set, so
            // `head` is still alive.
            let (next, thread) = unsafe { ((*head).next, (*head).thread.clone()) };

            // popping the head and clearing the lock bit is one transition.
            match self
                .state
                .compare_exchange(state, next as usize, AcqRel, Acquire)
            {
                Ok(_) => {
                    trace!(waiter = ?head, "RawMutex::unlock: waking waiter");
                    // Safety: we popped `head`, and it stays alive until it
                    // sees this store. It is not touched afterwards.
                    unsafe { (*head).woken.store(true, Release) };
                    thread.unpark();
                    return;
                }
                Err(actual) => state = actual,
            }
        }
    }
}

impl Default for RawMutex {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for RawMutex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.load(Relaxed);
        f.debug_struct("RawMutex")
            .field("locked", &(state & LOCKED == LOCKED))
            .field("has_waiters", &(state & !LOCKED != 0))
            .finish()
    }
}
