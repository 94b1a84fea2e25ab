//! A fixed-memory throughput counter, used by every stage for periodic
//! rate logging. Mirrors the original `rate` struct one for one: `start`,
//! `stop`, `count`, with `rate()` / `current_rate()` derived from them.

use std::time::Instant;

#[derive(Debug, Clone)]
pub struct RateMeter {
    start: Instant,
    stop: Instant,
    count: i64,
}

impl Default for RateMeter {
    fn default() -> Self {
        Self::new()
    }
}

impl RateMeter {
    pub fn new() -> Self {
        let now = Instant::now();
        RateMeter {
            start: now,
            stop: now,
            count: 0,
        }
    }

    pub fn restart(&mut self) {
        let now = Instant::now();
        self.start = now;
        self.stop = now;
        self.count = 0;
    }

    pub fn set_start_now(&mut self) {
        self.start = Instant::now();
    }

    pub fn set_stop_now(&mut self) {
        self.stop = Instant::now();
    }

    pub fn set_count(&mut self, n: i64) {
        self.count = n;
    }

    pub fn add_count(&mut self, n: i64) {
        self.count += n;
    }

    pub fn increment(&mut self) {
        self.add_count(1);
    }

    pub fn count(&self) -> i64 {
        self.count
    }

    /// Items per second over `[start, stop]`. An uninitialized or
    /// zero-duration window returns 0 rather than dividing by zero.
    pub fn rate(&self) -> f64 {
        let elapsed = self.stop.saturating_duration_since(self.start).as_secs_f64();
        if elapsed == 0.0 {
            return 0.0;
        }
        self.count as f64 / elapsed
    }

    /// Same as [`rate`](Self::rate) but stamps `stop = now` first.
    pub fn current_rate(&mut self) -> f64 {
        self.set_stop_now();
        self.rate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;
    use std::time::Duration;

    #[test]
    fn fresh_meter_does_not_divide_by_zero() {
        let mut m = RateMeter::new();
        assert_eq!(m.current_rate(), 0.0);
    }

    #[test]
    fn rate_reflects_count_over_elapsed() {
        let mut m = RateMeter::new();
        m.set_count(10);
        sleep(Duration::from_millis(20));
        let r = m.current_rate();
        assert!(r > 0.0, "expected a positive rate, got {r}");
    }

    #[test]
    fn increment_and_add_count() {
        let mut m = RateMeter::new();
        m.increment();
        m.add_count(4);
        assert_eq!(m.count(), 5);
    }
}
