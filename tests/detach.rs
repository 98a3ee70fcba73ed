#![cfg(not(loom))]
//! Blocking while holding a coarse, interpreter-wide lock.
//!
//! These tests stand in for a runtime with a global interpreter lock: a
//! thread is "attached" while it holds the GIL. A thread that blocks on a
//! fine-grained lock while attached must let go of the GIL, or a thread
//! that holds the fine-grained lock and is waiting for the GIL could never
//! finish.

mod support;

use hyphae::{ByteMutex, Event, LockFlags, LockStatus, ThreadState};
use std::{
    cell::Cell,
    sync::{
        atomic::{AtomicUsize, Ordering::*},
        Barrier,
    },
    thread,
};

struct Gil {
    lock: ByteMutex,
    detaches: AtomicUsize,
}

/// One thread's claim on the [`Gil`].
struct Attached<'gil> {
    gil: &'gil Gil,
    attached: Cell<bool>,
}

impl Gil {
    fn new() -> Self {
        Self {
            lock: ByteMutex::new(),
            detaches: AtomicUsize::new(0),
        }
    }

    fn attach(&self) -> Attached<'_> {
        self.lock.lock();
        Attached {
            gil: self,
            attached: Cell::new(true),
        }
    }
}

impl ThreadState for Attached<'_> {
    fn is_attached(&self) -> bool {
        self.attached.get()
    }

    fn detach(&self) {
        assert!(self.attached.replace(false), "detached twice");
        self.gil.detaches.fetch_add(1, Relaxed);
        self.gil.lock.unlock();
    }

    fn attach(&self) {
        self.gil.lock.lock();
        assert!(!self.attached.replace(true), "attached twice");
    }
}

impl Drop for Attached<'_> {
    fn drop(&mut self) {
        if self.attached.get() {
            self.gil.lock.unlock();
        }
    }
}

#[test]
fn lock_detached_releases_the_gil() {
    let _trace = support::trace_init();
    let gil = Gil::new();
    let fine = ByteMutex::new();
    let barrier = Barrier::new(2);

    thread::scope(|s| {
        s.spawn(|| {
            fine.lock();
            barrier.wait();
            // only possible if the other thread detaches while it waits for
            // `fine`.
            let tstate = gil.attach();
            drop(tstate);
            fine.unlock();
        });

        let tstate = gil.attach();
        barrier.wait();
        fine.lock_detached(&tstate);
        assert!(tstate.is_attached());
        assert!(gil.lock.is_locked());
        fine.unlock();
    });

    assert_eq!(gil.detaches.load(Relaxed), 1);
    assert!(!gil.lock.is_locked());
}

#[test]
fn uncontended_lock_does_not_detach() {
    let _trace = support::trace_init();
    let gil = Gil::new();
    let fine = ByteMutex::new();

    let tstate = gil.attach();
    fine.lock_detached(&tstate);
    fine.unlock();
    assert_eq!(
        fine.lock_timed(None, LockFlags::new().with(LockFlags::DETACH, true), Some(&tstate)),
        LockStatus::Acquired
    );
    fine.unlock();
    drop(tstate);

    assert_eq!(gil.detaches.load(Relaxed), 0);
}

#[test]
fn event_wait_detached_releases_the_gil() {
    let _trace = support::trace_init();
    let gil = Gil::new();
    let event = Event::new();
    let barrier = Barrier::new(2);

    thread::scope(|s| {
        s.spawn(|| {
            barrier.wait();
            let tstate = gil.attach();
            event.notify();
            drop(tstate);
        });

        let tstate = gil.attach();
        barrier.wait();
        event.wait_detached(&tstate);
        assert!(tstate.is_attached());
    });

    assert_eq!(gil.detaches.load(Relaxed), 1);
    assert!(event.is_set());
}
