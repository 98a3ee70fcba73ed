//! The calling thread's execution state, as seen by blocking primitives.
//!
//! A runtime thread may hold a claim on a coarse shared execution resource
//! (such as a global interpreter lock, or the "attached" slot that lets a
//! garbage collector know the thread may touch managed objects). If such a
//! thread blocks on one of this crate's fine-grained primitives while still
//! holding that claim, every other thread that needs the coarse resource
//! stalls too, and a thread that holds the fine-grained lock while waiting
//! for the coarse resource would deadlock with it.
//!
//! Blocking operations that accept a [`ThreadState`] *detach* the thread
//! before going to sleep and *attach* it again once they wake up. The
//! capability is passed explicitly, rather than looked up from a
//! thread-local, so that the primitives never need to know how the runtime
//! tracks its threads.
use core::fmt;

/// A runtime thread's claim on a coarse shared execution resource.
///
/// # Contract
///
/// - [`detach`](Self::detach) is only called on a thread for which
///   [`is_attached`](Self::is_attached) just returned `true`, and is always
///   followed by exactly one call to [`attach`](Self::attach) on the same
///   thread once the wait is over.
/// - `attach` may block (for example, while another thread holds the global
///   interpreter lock). How the claim is re-acquired is entirely up to the
///   implementation.
/// - [`make_pending_calls`](Self::make_pending_calls) is only called when
///   the caller asked for interruptions to be serviced, while the thread is
///   attached.
pub trait ThreadState {
    /// Returns `true` if the thread currently holds its claim on the coarse
    /// resource.
    fn is_attached(&self) -> bool;

    /// Releases the thread's claim on the coarse resource.
    fn detach(&self);

    /// Re-acquires the thread's claim on the coarse resource.
    fn attach(&self);

    /// Runs any pending signal handlers or other asynchronous callbacks.
    ///
    /// Returns an error if one of them raised, in which case an interruptible
    /// wait gives up and reports the interruption to its caller.
    fn make_pending_calls(&self) -> Result<(), PendingCallsError> {
        Ok(())
    }
}

/// Error returned by [`ThreadState::make_pending_calls`] when a pending call
/// raised an error.
///
/// The error itself is owned by the runtime (typically it has already been
/// recorded in the thread's execution state); this type only signals that
/// the wait should be abandoned.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, thiserror::Error)]
#[error("a pending call raised an error")]
pub struct PendingCallsError(());

impl PendingCallsError {
    /// Returns a new `PendingCallsError`.
    #[must_use]
    pub const fn new() -> Self {
        Self(())
    }
}

impl fmt::Debug for dyn ThreadState + '_ {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadState")
            .field("attached", &self.is_attached())
            .finish()
    }
}

/// Runs `f` with `tstate` detached, if it is attached.
pub(crate) fn detached<T>(tstate: Option<&dyn ThreadState>, f: impl FnOnce() -> T) -> T {
    match tstate {
        Some(tstate) if tstate.is_attached() => {
            test_trace!("detaching thread state while blocked");
            tstate.detach();
            let ret = f();
            tstate.attach();
            test_trace!("re-attached thread state");
            ret
        }
        _ => f(),
    }
}
