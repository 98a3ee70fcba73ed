//! A data-carrying mutex over any of this crate's raw locks.
//!
//! [`RawMutex`] and [`ByteMutex`] are bare locks: they protect nothing by
//! themselves. [`Mutex`] pairs one of them with the data it protects and
//! hands out RAII [`MutexGuard`]s, so the lock can't be forgotten.
//!
//! The parking lot uses `Mutex<_, RawMutex>` for its buckets; everything
//! else should generally use `Mutex<_, ByteMutex>`.
use crate::{
    loom::cell::{MutPtr, UnsafeCell},
    mutex::ByteMutex,
    raw_mutex::RawMutex,
};
use core::{
    fmt,
    ops::{Deref, DerefMut},
};

/// A lock that can be used to guard a [`Mutex`].
///
/// # Safety
///
/// Implementations must provide mutual exclusion: between a call to
/// [`lock`](Self::lock) (or a successful [`try_lock`](Self::try_lock)) and
/// the matching [`unlock`](Self::unlock), no other caller may acquire the
/// lock.
pub unsafe trait RawLock {
    /// Acquires the lock, blocking until it is available.
    fn lock(&self);

    /// Attempts to acquire the lock without blocking, returning `true` if it
    /// was acquired.
    fn try_lock(&self) -> bool;

    /// Releases the lock.
    ///
    /// # Safety
    ///
    /// The lock must be held by the caller.
    unsafe fn unlock(&self);

    /// Returns `true` if the lock is currently held.
    fn is_locked(&self) -> bool;
}

/// A mutual exclusion lock protecting a value of type `T`.
pub struct Mutex<T, Lock = RawMutex> {
    lock: Lock,
    data: UnsafeCell<T>,
}

/// An RAII guard for a locked [`Mutex`].
///
/// The lock is released when the guard is dropped.
#[must_use = "if unused, the `Mutex` will immediately unlock"]
pub struct MutexGuard<'a, T, Lock: RawLock = RawMutex> {
    ptr: MutPtr<T>,
    lock: &'a Lock,
}

// === impl RawLock ===

unsafe impl RawLock for RawMutex {
    #[inline]
    #[cfg_attr(test, track_caller)]
    fn lock(&self) {
        RawMutex::lock(self)
    }

    #[inline]
    #[cfg_attr(test, track_caller)]
    fn try_lock(&self) -> bool {
        RawMutex::try_lock(self)
    }

    #[inline]
    #[cfg_attr(test, track_caller)]
    unsafe fn unlock(&self) {
        RawMutex::unlock(self)
    }

    #[inline]
    fn is_locked(&self) -> bool {
        RawMutex::is_locked(self)
    }
}

unsafe impl RawLock for ByteMutex {
    #[inline]
    #[cfg_attr(test, track_caller)]
    fn lock(&self) {
        ByteMutex::lock(self)
    }

    #[inline]
    #[cfg_attr(test, track_caller)]
    fn try_lock(&self) -> bool {
        ByteMutex::try_lock(self)
    }

    #[inline]
    #[cfg_attr(test, track_caller)]
    unsafe fn unlock(&self) {
        ByteMutex::unlock(self)
    }

    #[inline]
    fn is_locked(&self) -> bool {
        ByteMutex::is_locked(self)
    }
}

// === impl Mutex ===

impl<T> Mutex<T> {
    loom_const_fn! {
        /// Returns a new `Mutex` protecting `data`, guarded by a [`RawMutex`].
        #[must_use]
        pub fn new(data: T) -> Self {
            Self {
                lock: RawMutex::new(),
                data: UnsafeCell::new(data),
            }
        }
    }
}

impl<T, Lock> Mutex<T, Lock> {
    loom_const_fn! {
        /// Returns a new `Mutex` protecting `data`, guarded by `lock`.
        #[must_use]
        pub fn with_raw_lock(data: T, lock: Lock) -> Self {
            Self {
                lock,
                data: UnsafeCell::new(data),
            }
        }
    }
}

impl<T, Lock: RawLock> Mutex<T, Lock> {
    fn guard(&self) -> MutexGuard<'_, T, Lock> {
        MutexGuard {
            ptr: self.data.get_mut(),
            lock: &self.lock,
        }
    }

    /// Attempts to lock the mutex without blocking.
    ///
    /// Returns `None` if the mutex is already locked.
    #[must_use]
    #[cfg_attr(test, track_caller)]
    pub fn try_lock(&self) -> Option<MutexGuard<'_, T, Lock>> {
        if self.lock.try_lock() {
            Some(self.guard())
        } else {
            None
        }
    }

    /// Locks the mutex, blocking until it is available.
    #[cfg_attr(test, track_caller)]
    pub fn lock(&self) -> MutexGuard<'_, T, Lock> {
        self.lock.lock();
        self.guard()
    }

    /// Locks the mutex and calls `f` with mutable access to the data,
    /// unlocking it again once `f` returns.
    #[cfg_attr(test, track_caller)]
    pub fn with_lock<U>(&self, f: impl FnOnce(&mut T) -> U) -> U {
        let mut guard = self.lock();
        f(&mut guard)
    }

    /// Returns `true` if the mutex is currently locked.
    #[inline]
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.lock.is_locked()
    }

    /// Consumes the mutex, returning the protected data.
    #[inline]
    #[must_use]
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }

    /// Returns a mutable reference to the protected data.
    ///
    /// No locking takes place: the mutable borrow of the mutex guarantees
    /// that no guards exist.
    pub fn get_mut(&mut self) -> &mut T {
        unsafe {
            // Safety: `&mut self` statically excludes any guards.
            self.data.with_mut(|data| &mut *data)
        }
    }
}

impl<T: Default, Lock: Default> Default for Mutex<T, Lock> {
    fn default() -> Self {
        Self {
            lock: Default::default(),
            data: UnsafeCell::new(Default::default()),
        }
    }
}

impl<T, Lock> fmt::Debug for Mutex<T, Lock>
where
    T: fmt::Debug,
    Lock: fmt::Debug + RawLock,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("Mutex");
        match self.try_lock() {
            Some(data) => s.field("data", &*data),
            None => s.field("data", &format_args!("<locked>")),
        };
        s.field("lock", &self.lock).finish()
    }
}

unsafe impl<T: Send, Lock: Send> Send for Mutex<T, Lock> {}
unsafe impl<T: Send, Lock: Sync> Sync for Mutex<T, Lock> {}

// === impl MutexGuard ===

impl<T, Lock: RawLock> Deref for MutexGuard<'_, T, Lock> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &Self::Target {
        unsafe {
            // Safety: we are holding the lock.
            &*self.ptr.deref()
        }
    }
}

impl<T, Lock: RawLock> DerefMut for MutexGuard<'_, T, Lock> {
    #[inline]
    fn deref_mut(&mut self) -> &mut Self::Target {
        unsafe {
            // Safety: we are holding the lock.
            self.ptr.deref()
        }
    }
}

impl<T, Lock: RawLock> Drop for MutexGuard<'_, T, Lock> {
    #[inline]
    #[cfg_attr(test, track_caller)]
    fn drop(&mut self) {
        unsafe { self.lock.unlock() }
    }
}

impl<T, Lock> fmt::Debug for MutexGuard<'_, T, Lock>
where
    T: fmt::Debug,
    Lock: RawLock,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self.deref(), f)
    }
}
