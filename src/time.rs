//! Timeouts and deadlines.
//!
//! Blocking operations in this crate take an `Option<Duration>` timeout:
//!
//! - `None` blocks until the operation completes,
//! - `Some(Duration::ZERO)` never blocks,
//! - `Some(t)` blocks for at most `t`.
//!
//! When a timed wait has to be retried (for example, because a mutex was
//! released but another thread won the race for it), the remaining time is
//! recomputed from a [`Deadline`]. An expired deadline yields
//! `Some(Duration::ZERO)`, never `None`: running out of time must not turn a
//! timed wait into an unbounded one.
use std::time::{Duration, Instant};

/// The point in time at which a timed wait gives up.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Deadline(Option<Instant>);

impl Deadline {
    /// A deadline that never expires.
    pub const NEVER: Self = Self(None);

    /// Returns the deadline `timeout` after `now`.
    ///
    /// A timeout too large to represent as an [`Instant`] never expires.
    #[must_use]
    pub fn after(now: Instant, timeout: Option<Duration>) -> Self {
        Self(timeout.and_then(|timeout| now.checked_add(timeout)))
    }

    /// Returns the time left until this deadline, as a timeout.
    ///
    /// Returns `None` if the deadline never expires, and
    /// `Some(Duration::ZERO)` if it has already passed.
    #[must_use]
    pub fn remaining(&self) -> Option<Duration> {
        self.remaining_at(Instant::now())
    }

    pub(crate) fn remaining_at(&self, now: Instant) -> Option<Duration> {
        self.0.map(|deadline| deadline.saturating_duration_since(now))
    }

    /// Returns `true` if this deadline has passed.
    #[must_use]
    pub fn has_expired(&self) -> bool {
        self.remaining() == Some(Duration::ZERO)
    }
}

/// Converts a timeout in the runtime's signed-nanosecond convention into an
/// `Option<Duration>`.
///
/// Negative values mean "wait forever", zero means "do not block", and
/// positive values are a relative timeout.
#[must_use]
pub fn from_nanos(timeout_ns: i64) -> Option<Duration> {
    u64::try_from(timeout_ns).ok().map(Duration::from_nanos)
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn expired_deadline_clamps_to_zero() {
        let now = Instant::now();
        let deadline = Deadline::after(now, Some(Duration::from_millis(5)));
        let later = now + Duration::from_secs(1);
        assert_eq!(deadline.remaining_at(later), Some(Duration::ZERO));
    }

    #[test]
    fn never_has_no_remaining_time() {
        assert_eq!(Deadline::NEVER.remaining(), None);
        assert!(!Deadline::NEVER.has_expired());
        assert_eq!(Deadline::after(Instant::now(), None), Deadline::NEVER);
    }

    #[test]
    fn zero_timeout_is_already_expired() {
        let deadline = Deadline::after(Instant::now(), Some(Duration::ZERO));
        assert!(deadline.has_expired());
    }

    proptest! {
        #[test]
        fn negative_nanos_wait_forever(ns in i64::MIN..0) {
            prop_assert_eq!(from_nanos(ns), None);
        }

        #[test]
        fn non_negative_nanos_are_relative(ns in 0i64..=i64::MAX) {
            prop_assert_eq!(from_nanos(ns), Some(Duration::from_nanos(ns as u64)));
        }

        #[test]
        fn remaining_never_exceeds_timeout(ms in 0u64..10_000, elapsed in 0u64..20_000) {
            let now = Instant::now();
            let deadline = Deadline::after(now, Some(Duration::from_millis(ms)));
            let remaining = deadline
                .remaining_at(now + Duration::from_millis(elapsed))
                .expect("finite deadline must have a remaining time");
            prop_assert_eq!(remaining, Duration::from_millis(ms.saturating_sub(elapsed)));
        }
    }
}
