#![cfg(not(loom))]

mod support;

use hyphae::{blocking::Mutex, mutex::FAIRNESS_WINDOW, ByteMutex, LockFlags, LockStatus};
use std::{
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering::*},
        Barrier,
    },
    thread,
    time::{Duration, Instant},
};

const THREADS: usize = 8;
const ITERS: usize = 2_000;

#[test]
fn mutual_exclusion() {
    let _trace = support::trace_init();
    let lock = ByteMutex::new();
    let inside = AtomicBool::new(false);
    let count = AtomicUsize::new(0);

    thread::scope(|s| {
        for _ in 0..THREADS {
            s.spawn(|| {
                for _ in 0..ITERS {
                    lock.lock();
                    assert!(!inside.swap(true, Relaxed), "two threads in the critical section");
                    // a non-atomic read-modify-write, made safe by the lock.
                    let n = count.load(Relaxed);
                    count.store(n + 1, Relaxed);
                    inside.store(false, Relaxed);
                    lock.unlock();
                }
            });
        }
    });

    assert_eq!(count.load(Relaxed), THREADS * ITERS);
    assert!(!lock.is_locked());
}

#[test]
fn no_lost_wakeups() {
    let _trace = support::trace_init();
    let counter = Mutex::with_raw_lock(0usize, ByteMutex::new());

    thread::scope(|s| {
        for thread in 0..THREADS {
            let counter = &counter;
            s.spawn(move || {
                for i in 0..ITERS {
                    counter.with_lock(|n| {
                        // uneven hold times, so that some unlocks find
                        // parked threads and some don't.
                        support::busy_work((thread * 31 + i * 17) % 200);
                        *n += 1;
                    });
                }
            });
        }
    });

    // if any wakeup had been lost, the scope would never have finished.
    assert_eq!(counter.into_inner(), THREADS * ITERS);
}

#[test]
fn starved_waiter_gets_the_lock() {
    let _trace = support::trace_init();
    let lock = ByteMutex::new();
    let stop = AtomicBool::new(false);
    let barrier = Barrier::new(2);

    thread::scope(|s| {
        s.spawn(|| {
            lock.lock();
            barrier.wait();
            // hammer the lock, giving a fresh waiter no gap to win a race
            // for it.
            while !stop.load(Relaxed) {
                lock.unlock();
                lock.lock();
            }
            lock.unlock();
        });

        barrier.wait();
        let started = Instant::now();
        lock.lock();
        let waited = started.elapsed();
        stop.store(true, Relaxed);
        lock.unlock();

        tracing::info!(?waited, "starved waiter acquired the lock");
        assert!(waited < Duration::from_secs(5), "waited {waited:?}");
    });
}

#[test]
fn every_waiter_has_a_bounded_wait() {
    const ITERS: usize = 3_000;
    // each waiter ahead of a starved one holds the lock for at most one
    // fairness window, plus scheduling slack.
    let bound = (FAIRNESS_WINDOW + Duration::from_millis(30)) * THREADS as u32;

    let _trace = support::trace_init();
    let lock = ByteMutex::new();
    let barrier = Barrier::new(THREADS);

    let worst = thread::scope(|s| {
        let threads = (0..THREADS)
            .map(|thread| {
                let (lock, barrier) = (&lock, &barrier);
                s.spawn(move || {
                    barrier.wait();
                    let mut worst = Duration::ZERO;
                    for i in 0..ITERS {
                        let started = Instant::now();
                        lock.lock();
                        worst = worst.max(started.elapsed());
                        support::busy_work((thread * 13 + i * 7) % 100);
                        lock.unlock();
                    }
                    worst
                })
            })
            .collect::<Vec<_>>();

        threads
            .into_iter()
            .map(|thread| thread.join().unwrap())
            .collect::<Vec<_>>()
    });

    tracing::info!(?worst, ?bound, "worst lock waits per thread");
    for (thread, waited) in worst.into_iter().enumerate() {
        assert!(
            waited < bound,
            "thread {thread} waited {waited:?} for the lock (bound {bound:?})"
        );
    }
}

#[test]
fn zero_timeout_fails_immediately() {
    let _trace = support::trace_init();
    let lock = ByteMutex::new();
    lock.lock();

    thread::scope(|s| {
        s.spawn(|| {
            let started = Instant::now();
            let status = lock.lock_timed(Some(Duration::ZERO), LockFlags::new(), None);
            assert_eq!(status, LockStatus::Failure);
            assert!(started.elapsed() < Duration::from_millis(100));
        });
    });

    lock.unlock();
    assert_eq!(
        lock.lock_timed(Some(Duration::ZERO), LockFlags::new(), None),
        LockStatus::Acquired
    );
    lock.unlock();
}

#[test]
fn released_before_timeout() {
    let _trace = support::trace_init();
    let timeout = Duration::from_millis(400);
    let lock = ByteMutex::new();
    let barrier = Barrier::new(2);
    lock.lock();

    thread::scope(|s| {
        s.spawn(|| {
            barrier.wait();
            thread::sleep(timeout / 2);
            lock.unlock();
        });

        barrier.wait();
        let started = Instant::now();
        let status = lock.lock_timed(Some(timeout), LockFlags::new(), None);
        let waited = started.elapsed();
        assert_eq!(status, LockStatus::Acquired);
        assert!(waited < timeout, "waited {waited:?}");
        lock.unlock();
    });
}

#[test]
fn held_past_timeout() {
    let _trace = support::trace_init();
    let timeout = Duration::from_millis(100);
    let lock = ByteMutex::new();
    let barrier = Barrier::new(2);
    lock.lock();

    thread::scope(|s| {
        s.spawn(|| {
            barrier.wait();
            let started = Instant::now();
            let status = lock.lock_timed(Some(timeout), LockFlags::new(), None);
            let waited = started.elapsed();
            assert_eq!(status, LockStatus::Failure);
            assert!(waited >= timeout, "gave up after {waited:?}");
        });

        barrier.wait();
        thread::sleep(timeout * 2);
        lock.unlock();
    });

    // the timed-out waiter must not have left the mutex wedged.
    assert!(lock.try_lock());
    lock.unlock();
}
