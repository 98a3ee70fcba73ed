//! Unrecoverable runtime errors.
//!
//! The primitives in this crate sit underneath the runtime's own error
//! handling, so a broken invariant (unlocking a lock that is not held, a
//! corrupted state byte, a thread blocking after its parker was torn down)
//! cannot be reported as an ordinary error. Instead, the process is halted
//! immediately, without unwinding through arbitrary handler code.
//!
//! In this crate's own unit tests, the fatal path panics instead of
//! aborting, so that tests can observe it.
use core::fmt;

/// Logs `args` and halts the process.
///
/// This never unwinds (outside of this crate's unit tests). It writes the
/// diagnostic to stderr as well as emitting a `tracing` event, since a
/// subscriber may never get the chance to flush.
#[cold]
#[inline(never)]
#[track_caller]
pub fn fatal_error(args: fmt::Arguments<'_>) -> ! {
    let location = core::panic::Location::caller();
    tracing::error!(%location, "fatal error: {args}");

    #[cfg(test)]
    panic!("fatal error: {args}");

    #[cfg(not(test))]
    {
        use std::io::Write;
        let mut stderr = std::io::stderr().lock();
        let _ = writeln!(stderr, "hyphae: fatal error at {location}: {args}");
        let _ = stderr.flush();
        std::process::abort()
    }
}
