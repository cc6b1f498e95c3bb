// ── Request clock ──
//
// Request timestamps are the optimistic-concurrency guard on feature
// state, so two requests must never share one. The clock hands out
// strictly increasing microsecond timestamps.

use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{DateTime, Utc};

#[derive(Debug, Default)]
pub struct RequestClock {
    last_micros: AtomicI64,
}

impl RequestClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current time, bumped past the previously issued timestamp.
    pub fn now(&self) -> DateTime<Utc> {
        let wall = Utc::now().timestamp_micros();
        let prev = self
            .last_micros
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |last| {
                Some(wall.max(last + 1))
            })
            .unwrap_or_else(|last| last);
        let issued = wall.max(prev + 1);
        DateTime::from_timestamp_micros(issued).unwrap_or_else(Utc::now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamps_strictly_increase() {
        let clock = RequestClock::new();
        let mut prev = clock.now();
        for _ in 0..1000 {
            let next = clock.now();
            assert!(next > prev, "{next} should be after {prev}");
            prev = next;
        }
    }
}
