//! Clock abstraction for elapsed-time computations.

use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Hand-driven clock for deterministic tests.
///
/// Only moves forward: [`ManualClock::advance`] rejects negative steps so
/// elapsed time observed through it never decreases.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        if by < Duration::zero() {
            return;
        }
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl<C: Clock + ?Sized> Clock for std::sync::Arc<C> {
    fn now(&self) -> DateTime<Utc> {
        (**self).now()
    }
}

/// Far enough out to never fire, near enough to stay representable.
const FAR_FUTURE: std::time::Duration = std::time::Duration::from_secs(86_400 * 365 * 30);

/// `start + wait` on the monotonic clock, clamped to thirty years ahead when
/// the sum does not fit in an `Instant`.
pub fn deadline_after(
    start: tokio::time::Instant,
    wait: std::time::Duration,
) -> tokio::time::Instant {
    start
        .checked_add(wait)
        .unwrap_or_else(|| start + FAR_FUTURE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn huge_waits_clamp_instead_of_overflowing() {
        let start = tokio::time::Instant::now();
        assert_eq!(deadline_after(start, std::time::Duration::MAX), start + FAR_FUTURE);
        let second = std::time::Duration::from_secs(1);
        assert_eq!(deadline_after(start, second), start + second);
    }
}
