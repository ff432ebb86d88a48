//! Governance Clock
//!
//! Injectable time source. Every window computation in the engine and the
//! scheduler reads time through [`Clock`] so tests can drive it by hand.

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;

/// Source of "now" for window arithmetic.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock backed by `chrono::Utc::now()`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    #[inline]
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually advanced clock.
///
/// # Determinism Contract
/// - `now()` only changes through `advance_by()` / `advance_to()`
/// - time never moves backward; `advance_to()` with an earlier instant is ignored
/// - clones share the same underlying instant, so a test can hand one clone to
///   the engine and keep another to drive it
#[derive(Debug, Clone)]
pub struct ManualClock {
    current: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            current: Arc::new(Mutex::new(start)),
        }
    }

    /// Clock starting at a Unix timestamp in seconds.
    pub fn from_unix_secs(secs: i64) -> Self {
        let start = DateTime::<Utc>::from_timestamp(secs, 0).unwrap_or_default();
        Self::new(start)
    }

    pub fn advance_by(&self, delta: Duration) {
        if delta <= Duration::zero() {
            return;
        }
        let mut current = self.current.lock();
        *current += delta;
    }

    pub fn advance_to(&self, instant: DateTime<Utc>) {
        let mut current = self.current.lock();
        if instant > *current {
            *current = instant;
        }
    }
}

impl Clock for ManualClock {
    #[inline]
    fn now(&self) -> DateTime<Utc> {
        *self.current.lock()
    }
}

impl fmt::Display for ManualClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.now().to_rfc3339())
    }
}

/// Time left until `deadline`, clamped at zero.
pub fn remaining_until(now: DateTime<Utc>, deadline: DateTime<Utc>) -> std::time::Duration {
    (deadline - now).to_std().unwrap_or(std::time::Duration::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_advances_and_shares_state() {
        let clock = ManualClock::from_unix_secs(1_700_000_000);
        let handle = clock.clone();
        let start = clock.now();

        handle.advance_by(Duration::minutes(11));
        assert_eq!(clock.now() - start, Duration::minutes(11));
    }

    #[test]
    fn test_manual_clock_never_goes_backward() {
        let clock = ManualClock::from_unix_secs(1_700_000_000);
        let start = clock.now();

        clock.advance_to(start - Duration::seconds(30));
        clock.advance_by(Duration::seconds(-5));
        assert_eq!(clock.now(), start);
    }

    #[test]
    fn test_remaining_until_clamps_at_zero() {
        let now = DateTime::<Utc>::from_timestamp(1_000, 0).unwrap();
        let later = now + Duration::seconds(90);

        assert_eq!(remaining_until(now, later).as_secs(), 90);
        assert_eq!(remaining_until(later, now), std::time::Duration::ZERO);
    }
}
