use std::sync::{Arc, Mutex};

use chrono::{DateTime, TimeDelta, Utc};

/// Source of wall-clock time for every window and expiry computation.
///
/// Production code uses [`SystemClock`]; tests drive time explicitly with
/// [`ManualClock`] so sliding-window behavior can be checked without sleeping.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to. Clones share the same instant.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    pub fn advance(&self, by: TimeDelta) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }

    pub fn advance_secs(&self, secs: i64) {
        self.advance(TimeDelta::seconds(secs));
    }

    pub fn set(&self, at: DateTime<Utc>) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now = at;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl<C: Clock + ?Sized> Clock for Arc<C> {
    fn now(&self) -> DateTime<Utc> {
        (**self).now()
    }
}

/// Start of the calendar hour containing `at` (UTC).
pub fn hour_floor(at: DateTime<Utc>) -> DateTime<Utc> {
    let ts = at.timestamp();
    DateTime::from_timestamp(ts - ts.rem_euclid(3600), 0).unwrap_or(at)
}

/// Hour bucket label used as the per-key quota window, e.g. `2026-10-16 14:00:00`.
pub fn hour_bucket(at: DateTime<Utc>) -> String {
    hour_floor(at).format("%Y-%m-%d %H:00:00").to_string()
}

/// Whole seconds from `at` until the top of the next hour. Always at least 1.
pub fn secs_until_next_hour(at: DateTime<Utc>) -> u64 {
    let next = hour_floor(at) + TimeDelta::hours(1);
    let secs = (next - at).num_seconds();
    secs.max(1) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn manual_clock_advances_shared_instant() {
        let start = Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap();
        let clock = ManualClock::new(start);
        let other = clock.clone();

        clock.advance_secs(90);
        assert_eq!(other.now(), start + TimeDelta::seconds(90));
    }

    #[test]
    fn hour_bucket_truncates_minutes_and_seconds() {
        let at = Utc.with_ymd_and_hms(2026, 3, 1, 14, 37, 12).unwrap();
        assert_eq!(hour_bucket(at), "2026-03-01 14:00:00");
    }

    #[test]
    fn next_hour_countdown() {
        let at = Utc.with_ymd_and_hms(2026, 3, 1, 14, 59, 30).unwrap();
        assert_eq!(secs_until_next_hour(at), 30);

        let on_the_hour = Utc.with_ymd_and_hms(2026, 3, 1, 15, 0, 0).unwrap();
        assert_eq!(secs_until_next_hour(on_the_hour), 3600);
    }
}
