use chrono::{DateTime, Duration, Utc};
use std::sync::{Arc, Mutex};

/// Monotonic counter of evaluated check cycles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Cycle {
    pub frame: u64,
}

impl Cycle {
    pub fn new() -> Self {
        Cycle { frame: 0 }
    }

    pub fn next(&self) -> Self {
        Cycle { frame: self.frame + 1 }
    }
}

/// Wall-clock source. The tracker never reads time itself; the driver asks
/// the clock and passes `now` in.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Hand-driven clock for replays and tests.
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

    pub fn advance(&self, by: Duration) {
        if let Ok(mut t) = self.current.lock() {
            *t += by;
        }
    }

    pub fn set(&self, to: DateTime<Utc>) {
        if let Ok(mut t) = self.current.lock() {
            *t = to;
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        match self.current.lock() {
            Ok(t) => *t,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}

/// Seconds elapsed between two instants, never negative.
pub fn elapsed_secs(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    let ms = (to - from).num_milliseconds().max(0);
    ms as f64 / 1000.0
}

/// ISO-8601 with millisecond precision and a `Z` suffix.
pub fn iso(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}
