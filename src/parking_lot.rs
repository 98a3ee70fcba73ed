//! A process-wide table of threads waiting on memory addresses.
//!
//! The [`ByteMutex`], [`Event`] and [`Once`] types are a single byte each.
//! They have no room for a wait list, so threads that need to block on one
//! of them *park* here instead, keyed by the primitive's address.
//!
//! Addresses hash into a fixed table of buckets. Each bucket is a
//! [`blocking::Mutex`] over a [`RawMutex`] (which never parks, so the table
//! can't recurse into itself) protecting an intrusive list of waiter nodes.
//! Every node lives on the stack of the thread it represents, so parking
//! never allocates.
//!
//! The contract that makes this free of lost wakeups: [`park`] re-checks
//! that the address still holds the value the caller expected *while
//! holding the bucket lock*, and [`unpark_one`] / [`unpark_all`] take the
//! same bucket lock. A thread that changes the value and then unparks can't
//! slip in between a parker's check and its enqueue.
//!
//! [`ByteMutex`]: crate::ByteMutex
//! [`Event`]: crate::Event
//! [`Once`]: crate::Once
//! [`RawMutex`]: crate::raw_mutex::RawMutex
use crate::{
    blocking::Mutex,
    loom::sync::{
        atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering::*},
        Arc,
    },
    semaphore::{self, Semaphore, WaitStatus},
    tstate::{self, ThreadState},
};
use cordyceps::{list, Linked, List};
use core::{fmt, marker::PhantomPinned, pin::pin, ptr::NonNull};
use std::time::Duration;

/// An atomic value that threads can park on.
///
/// This is implemented for the atomic integer types this crate's primitives
/// are made of.
pub trait Parkable {
    /// The value stored in the atomic.
    type Value: Copy + Eq + fmt::Debug;

    /// Returns the current value.
    fn current(&self) -> Self::Value;

    /// Returns the key that waiters on this atomic are filed under.
    #[inline]
    fn key(&self) -> usize {
        self as *const Self as *const () as usize
    }
}

/// The outcome of [`park`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[must_use]
pub enum ParkStatus {
    /// The thread was woken by [`unpark_one`] or [`unpark_all`].
    Unparked,
    /// The address no longer held the expected value, so the thread did not
    /// park at all.
    Invalid,
    /// The timeout elapsed.
    TimedOut,
    /// The thread was interrupted while parked.
    Interrupted,
}

/// The number of buckets in the table.
///
/// A prime, so that addresses that are multiples of a power of two still
/// spread out.
#[cfg(not(loom))]
pub const NUM_BUCKETS: usize = 257;

// few enough to exercise collisions between unrelated addresses.
#[cfg(loom)]
pub const NUM_BUCKETS: usize = 4;

struct Bucket {
    waiters: List<Waiter>,
    /// Number of waiters in `waiters`, on any address.
    num_waiters: usize,
}

/// A parked thread.
///
/// Everything except `links` and `is_unparking` is immutable while the node
/// is linked. Both of those are only touched with the bucket lock held.
struct Waiter {
    links: list::Links<Waiter>,
    key: usize,
    park_arg: Option<NonNull<()>>,
    parker: Arc<Semaphore>,
    /// Set once an unparker has taken this waiter off the list. The wakeup
    /// is posted *after* the bucket lock is released, so a waiter that
    /// gives up in the meantime must still wait for it.
    is_unparking: AtomicBool,
    _pin: PhantomPinned,
}

#[cfg(not(loom))]
static BUCKETS: [Mutex<Bucket>; NUM_BUCKETS] = {
    // each use of the constant is a new bucket, which is the point.
    #[allow(clippy::declare_interior_mutable_const)]
    const BUCKET: Mutex<Bucket> = Mutex::new(Bucket::new());
    [BUCKET; NUM_BUCKETS]
};

#[cfg(loom)]
crate::loom::lazy_static! {
    static ref BUCKETS: [Mutex<Bucket>; NUM_BUCKETS] =
        core::array::from_fn(|_| Mutex::new(Bucket::new()));
}

fn bucket(key: usize) -> &'static Mutex<Bucket> {
    &BUCKETS[key % NUM_BUCKETS]
}

/// Parks the calling thread on `addr`, if it still holds `expected`.
///
/// - `timeout`: `None` waits until unparked, `Some(Duration::ZERO)` returns
///   [`ParkStatus::TimedOut`] right away unless a wakeup is already pending.
/// - `park_arg`: an opaque pointer handed to the [`unpark_one`] callback
///   that wakes this thread. It must stay valid until `park` returns.
/// - `detach`: if the thread state is attached, it is detached while the
///   thread sleeps and re-attached before `park` returns, once the thread
///   is off the wait list. Re-attaching may itself park.
///
/// Returns [`ParkStatus::Invalid`] without sleeping if `addr` did not hold
/// `expected` once the bucket lock was taken.
pub fn park<A>(
    addr: &A,
    expected: A::Value,
    timeout: Option<Duration>,
    park_arg: Option<NonNull<()>>,
    detach: Option<&dyn ThreadState>,
) -> ParkStatus
where
    A: Parkable + ?Sized,
{
    let key = addr.key();
    let bucket = bucket(key);
    let waiter = pin!(Waiter::new(key, park_arg));
    let waiter = waiter.as_ref().get_ref();
    let ptr = NonNull::from(waiter);

    {
        let mut bucket = bucket.lock();
        let current = addr.current();
        if test_dbg!(current != expected) {
            trace!(key, ?current, ?expected, "park: value changed, not parking");
            return ParkStatus::Invalid;
        }
        bucket.waiters.push_back(ptr);
        bucket.num_waiters += 1;
    }

    trace!(key, ?timeout, "park: parking");
    // the thread re-attaches only once the node is unlinked and no wakeup
    // for it is in flight. Attaching may park again on this thread.
    tstate::detached(detach, || wait_parked(bucket, waiter, timeout))
}

/// Sleeps until `waiter` is unparked or gives up, and takes it off the
/// bucket's list if it gave up.
fn wait_parked(
    bucket: &Mutex<Bucket>,
    waiter: &Waiter,
    timeout: Option<Duration>,
) -> ParkStatus {
    let key = waiter.key;
    let status = waiter.parker.wait(timeout, true);
    if status == WaitStatus::Acquired {
        trace!(key, "park: unparked");
        return ParkStatus::Unparked;
    }

    let mut bucket = bucket.lock();
    if waiter.is_unparking.load(Relaxed) {
        // an unparker dequeued us before we gave up; its wakeup is on the
        // way and has to be consumed.
        drop(bucket);
        let _ = waiter.parker.wait(None, false);
        trace!(key, "park: unparked after giving up");
        return ParkStatus::Unparked;
    }

    unsafe {
        // Safety: we are not unparking, so we are still linked into this
        // bucket's list.
        bucket.waiters.remove(NonNull::from(waiter));
    }
    bucket.num_waiters -= 1;
    drop(bucket);

    if status == WaitStatus::Interrupted {
        trace!(key, "park: interrupted");
        ParkStatus::Interrupted
    } else {
        trace!(key, "park: timed out");
        ParkStatus::TimedOut
    }
}

/// Wakes the longest-parked thread on `addr`, if there is one.
///
/// `f` is called with the bucket lock held, whether or not a thread was
/// found. It receives the woken thread's `park_arg` (or `None` if nothing
/// was parked) and whether other threads are still parked in the same
/// bucket. The latter is conservative: they may be parked on a different
/// address that shares the bucket. Because `f` runs under the bucket lock, it
/// is the place to update the value at `addr` so that it can't race with a
/// new thread parking.
///
/// The woken thread is signalled after the bucket lock has been released.
pub fn unpark_one<A>(addr: &A, f: impl FnOnce(Option<NonNull<()>>, bool))
where
    A: Parkable + ?Sized,
{
    let key = addr.key();
    let parker = {
        let mut bucket = bucket(key).lock();
        let waiter = bucket
            .waiters
            .cursor_front_mut()
            .remove_first(|waiter| waiter.key == key);
        match waiter {
            Some(waiter) => {
                bucket.num_waiters -= 1;
                // Safety: the waiter can't return from `park` without taking
                // the bucket lock, which we hold.
                let waiter = unsafe { waiter.as_ref() };
                waiter.is_unparking.store(true, Relaxed);
                f(waiter.park_arg, bucket.num_waiters > 0);
                Some(waiter.parker.clone())
            }
            None => {
                f(None, false);
                None
            }
        }
    };

    if let Some(parker) = parker {
        trace!(key, "unpark_one: waking parked thread");
        parker.post();
    }
}

/// Wakes every thread parked on `addr`, returning how many were woken.
pub fn unpark_all<A>(addr: &A) -> usize
where
    A: Parkable + ?Sized,
{
    let key = addr.key();
    let mut woken = List::<Waiter>::new();
    {
        let mut guard = bucket(key).lock();
        let bucket = &mut *guard;
        let mut cursor = bucket.waiters.cursor_front_mut();
        while let Some(waiter) = cursor.remove_first(|waiter| waiter.key == key) {
            // Safety: as in `unpark_one`.
            unsafe { waiter.as_ref() }
                .is_unparking
                .store(true, Relaxed);
            bucket.num_waiters -= 1;
            woken.push_back(waiter);
        }
    }

    let mut count = 0;
    while let Some(waiter) = woken.pop_front() {
        // Safety: the waiter is unparking, so it stays in `park` until its
        // wakeup is posted.
        let parker = unsafe { waiter.as_ref() }.parker.clone();
        parker.post();
        count += 1;
    }

    trace!(key, count, "unpark_all: woke parked threads");
    count
}

#[cfg(test)]
pub(crate) fn num_parked<A: Parkable + ?Sized>(addr: &A) -> usize {
    let key = addr.key();
    let bucket = bucket(key).lock();
    bucket
        .waiters
        .iter()
        .filter(|waiter| waiter.key == key)
        .count()
}

// === impl Parkable ===

impl Parkable for AtomicU8 {
    type Value = u8;

    #[inline]
    fn current(&self) -> u8 {
        self.load(Acquire)
    }
}

impl Parkable for AtomicUsize {
    type Value = usize;

    #[inline]
    fn current(&self) -> usize {
        self.load(Acquire)
    }
}

// === impl Bucket ===

impl Bucket {
    loom_const_fn! {
        fn new() -> Self {
            Self {
                waiters: List::new(),
                num_waiters: 0,
            }
        }
    }
}

// Safety: the waiter nodes in the list are only accessed with the bucket
// lock held, or by a thread that has taken a node off the list.
unsafe impl Send for Bucket {}

// === impl Waiter ===

impl Waiter {
    fn new(key: usize, park_arg: Option<NonNull<()>>) -> Self {
        Self {
            links: list::Links::new(),
            key,
            park_arg,
            parker: semaphore::current(),
            is_unparking: AtomicBool::new(false),
            _pin: PhantomPinned,
        }
    }
}

unsafe impl Linked<list::Links<Waiter>> for Waiter {
    type Handle = NonNull<Waiter>;

    fn into_ptr(r: Self::Handle) -> NonNull<Self> {
        r
    }

    unsafe fn from_ptr(ptr: NonNull<Self>) -> Self::Handle {
        ptr
    }

    unsafe fn links(target: NonNull<Self>) -> NonNull<list::Links<Waiter>> {
        // Safety: using `ptr::addr_of_mut!` avoids creating a temporary
        // reference, which stacked borrows dislikes.
        let links = core::ptr::addr_of_mut!((*target.as_ptr()).links);
        NonNull::new_unchecked(links)
    }
}

impl fmt::Debug for Waiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Waiter")
            .field("key", &format_args!("{:#x}", self.key))
            .field("park_arg", &self.park_arg)
            .field("is_unparking", &self.is_unparking.load(Relaxed))
            .finish()
    }
}
