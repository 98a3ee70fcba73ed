//! Per-thread execution state.
//!
//! An [`ExecState`] is what the interpreter and compiled traces pass around
//! as "the current thread": it holds the error currently being raised, the
//! queue of calls other threads have asked this one to run, and, when the
//! runtime has a global interpreter lock, whether this thread holds it.
use hyphae::{
    blocking::Mutex,
    semaphore::Interrupter,
    tstate::{PendingCallsError, ThreadState},
    ByteMutex,
};
use std::{
    cell::{Cell, RefCell},
    collections::VecDeque,
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering::*},
        Arc,
    },
};

/// An error raised while executing code.
#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
#[non_exhaustive]
pub enum ExecError {
    /// A local variable was read before it was assigned.
    #[error("cannot access local variable '{name}' where it is not associated with a value")]
    UnboundLocal {
        /// The variable's name.
        name: String,
    },

    /// Execution was interrupted (for example, by a signal handler).
    #[error("interrupted")]
    Interrupted,

    /// The runtime itself misbehaved.
    #[error("internal error: {0}")]
    System(String),

    /// Any other error.
    #[error("{0}")]
    Other(String),
}

/// Marker returned when an error was raised.
///
/// The error itself has already been recorded in the [`ExecState`]; use
/// [`ExecState::take_error`] to retrieve it.
#[derive(Copy, Clone, Debug, Eq, PartialEq, thiserror::Error)]
#[error("an error was raised and recorded in the thread state")]
pub struct Raised(());

/// A call that another thread asked this thread to run.
pub type PendingCall = Box<dyn FnOnce() -> Result<(), ExecError> + Send>;

/// The queue of calls waiting to run on one thread.
///
/// Any thread may [`add`](Self::add) to the queue. The owning thread runs
/// the calls the next time it checks for them: between trace iterations, or
/// while blocked in an interruptible lock.
pub struct PendingCalls {
    calls: Mutex<VecDeque<PendingCall>, ByteMutex>,
    has_pending: AtomicBool,
    interrupter: Interrupter,
}

/// A thread's execution state.
///
/// An `ExecState` belongs to the thread that created it, which is the one
/// that [pending calls](PendingCalls) interrupt.
pub struct ExecState {
    global_lock: Option<Arc<ByteMutex>>,
    attached: Cell<bool>,
    error: RefCell<Option<ExecError>>,
    pending: Arc<PendingCalls>,
}

// === impl Raised ===

impl Raised {
    pub(crate) const fn new() -> Self {
        Self(())
    }
}

// === impl PendingCalls ===

impl PendingCalls {
    fn new() -> Self {
        Self {
            calls: Mutex::with_raw_lock(VecDeque::new(), ByteMutex::new()),
            has_pending: AtomicBool::new(false),
            interrupter: Interrupter::current(),
        }
    }

    /// Queues `call` and interrupts the owning thread, if it is blocked.
    pub fn add(&self, call: impl FnOnce() -> Result<(), ExecError> + Send + 'static) {
        self.calls.with_lock(|calls| calls.push_back(Box::new(call)));
        self.has_pending.store(true, Release);
        self.interrupter.interrupt();
    }

    /// Returns `true` if calls may be waiting to run.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.has_pending.load(Acquire)
    }

    fn pop(&self) -> Option<PendingCall> {
        self.calls.with_lock(VecDeque::pop_front)
    }
}

impl fmt::Debug for PendingCalls {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("PendingCalls");
        match self.calls.try_lock() {
            Some(calls) => s.field("calls", &calls.len()),
            None => s.field("calls", &format_args!("<locked>")),
        };
        s.field("has_pending", &self.is_pending()).finish()
    }
}

// === impl ExecState ===

impl ExecState {
    /// Returns the execution state of a thread in a runtime without a global
    /// interpreter lock.
    ///
    /// The thread starts out attached.
    #[must_use]
    pub fn new() -> Self {
        Self {
            global_lock: None,
            attached: Cell::new(true),
            error: RefCell::new(None),
            pending: Arc::new(PendingCalls::new()),
        }
    }

    /// Returns the execution state of a thread that runs while holding
    /// `global_lock`.
    ///
    /// This blocks until the calling thread holds the lock. The lock is
    /// released while the thread is detached, and when the `ExecState` is
    /// dropped.
    #[must_use]
    pub fn with_global_lock(global_lock: Arc<ByteMutex>) -> Self {
        global_lock.lock();
        Self {
            global_lock: Some(global_lock),
            attached: Cell::new(true),
            error: RefCell::new(None),
            pending: Arc::new(PendingCalls::new()),
        }
    }

    /// Records `error` as the error being raised, returning the marker that
    /// says so.
    ///
    /// A previously recorded error is replaced.
    pub fn raise(&self, error: ExecError) -> Raised {
        if let Some(prev) = self.error.replace(Some(error)) {
            tracing::debug!(%prev, "replacing previously raised error");
        }
        Raised::new()
    }

    /// Returns `true` if an error has been raised and not yet taken.
    #[must_use]
    pub fn has_error(&self) -> bool {
        self.error.borrow().is_some()
    }

    /// Takes the error being raised, if any.
    pub fn take_error(&self) -> Option<ExecError> {
        self.error.take()
    }

    /// Returns a handle for queueing calls on this thread.
    #[must_use]
    pub fn pending_calls(&self) -> Arc<PendingCalls> {
        self.pending.clone()
    }

    /// Runs any pending calls, as the interpreter does between iterations
    /// of a loop.
    ///
    /// If a call fails, its error is recorded and the remaining calls are
    /// left for the next check.
    pub fn check_eval_breaker(&self) -> Result<(), Raised> {
        if !self.pending.is_pending() {
            return Ok(());
        }
        self.make_pending_calls().map_err(|_| Raised::new())
    }
}

impl Default for ExecState {
    fn default() -> Self {
        Self::new()
    }
}

impl ThreadState for ExecState {
    fn is_attached(&self) -> bool {
        self.attached.get()
    }

    fn detach(&self) {
        debug_assert!(self.attached.get(), "detaching a detached thread");
        self.attached.set(false);
        if let Some(ref lock) = self.global_lock {
            lock.unlock();
        }
    }

    fn attach(&self) {
        debug_assert!(!self.attached.get(), "attaching an attached thread");
        if let Some(ref lock) = self.global_lock {
            lock.lock();
        }
        self.attached.set(true);
    }

    fn make_pending_calls(&self) -> Result<(), PendingCallsError> {
        if !self.pending.has_pending.swap(false, AcqRel) {
            return Ok(());
        }

        while let Some(call) = self.pending.pop() {
            if let Err(error) = call() {
                tracing::debug!(%error, "pending call raised");
                self.raise(error);
                // anything still queued runs at the next check.
                if self.pending.calls.with_lock(|calls| !calls.is_empty()) {
                    self.pending.has_pending.store(true, Release);
                }
                return Err(PendingCallsError::new());
            }
        }

        Ok(())
    }
}

impl Drop for ExecState {
    fn drop(&mut self) {
        if let (Some(lock), true) = (self.global_lock.as_ref(), self.attached.get()) {
            lock.unlock();
        }
    }
}

impl fmt::Debug for ExecState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecState")
            .field("global_lock", &self.global_lock)
            .field("attached", &self.attached.get())
            .field("error", &self.error.try_borrow().ok())
            .field("pending", &self.pending)
            .finish()
    }
}
