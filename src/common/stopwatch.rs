/// Stupid and simple implementation of stopwatch, that also remembers the wall clock time it was
/// started at (monotonic clock for the elapsed time, wall clock to place it on the trace timeline).
use chrono::{DateTime, TimeDelta, Utc};
use std::time::{Duration, Instant};

pub struct Stopwatch {
    start_time: Instant,
    started_at: DateTime<Utc>,
}

impl Stopwatch {
    pub fn start_new() -> Stopwatch {
        Stopwatch {
            start_time: Instant::now(),
            started_at: Utc::now(),
        }
    }

    pub fn elapsed_ms(&self) -> i64 {
        return self.elapsed().as_millis() as i64;
    }

    pub fn elapsed(&self) -> Duration {
        return self.start_time.elapsed();
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        return self.started_at;
    }

    /// Wall clock "now" derived from the monotonic clock, so that the span is never negative even
    /// if the system clock jumps in the meantime.
    pub fn now(&self) -> DateTime<Utc> {
        return self.started_at + TimeDelta::milliseconds(self.elapsed_ms());
    }
}
