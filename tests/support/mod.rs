#![allow(dead_code)]

use std::time::{Duration, Instant};
use tracing_subscriber::{
    filter::{EnvFilter, LevelFilter},
    util::SubscriberInitExt,
};

/// Installs a `RUST_LOG`-controlled test subscriber for the current thread.
#[must_use]
pub fn trace_init() -> tracing::subscriber::DefaultGuard {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .with_thread_names(true)
        .finish()
        .set_default()
}

/// Burns a little CPU, so that critical sections have uneven lengths.
pub fn busy_work(iters: usize) -> usize {
    (0..iters).fold(0usize, |acc, i| std::hint::black_box(acc.wrapping_add(i)))
}

/// Polls `cond` until it holds, panicking after `timeout`.
#[track_caller]
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) {
    let started = Instant::now();
    while !cond() {
        assert!(
            started.elapsed() < timeout,
            "condition not reached after {timeout:?}"
        );
        std::thread::sleep(Duration::from_millis(1));
    }
}
