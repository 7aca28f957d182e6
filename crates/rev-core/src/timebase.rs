use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Process-local time reference shared by the runtime threads.
#[derive(Debug, Clone, Copy)]
pub struct TimeBase {
    start: Instant,
}

impl TimeBase {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Monotonic microseconds since start.
    pub fn now_us(&self) -> u64 {
        self.start.elapsed().as_micros() as u64
    }

    /// Wall-clock microseconds since Unix epoch (for cross-process logs only).
    pub fn unix_us(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_micros() as u64
    }
}

impl Default for TimeBase {
    fn default() -> Self {
        Self::new()
    }
}

/// Simulated time at the end of `tick`.
pub fn simulated_seconds(tick: u64, tick_period: Duration) -> f64 {
    tick as f64 * tick_period.as_secs_f64()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simulated_time_scales_with_period() {
        assert_eq!(simulated_seconds(0, Duration::from_millis(1)), 0.0);
        assert!((simulated_seconds(2_500, Duration::from_millis(1)) - 2.5).abs() < 1e-12);
        assert!((simulated_seconds(100, Duration::from_micros(500)) - 0.05).abs() < 1e-12);
    }

    #[test]
    fn monotonic_clock_advances() {
        let tb = TimeBase::new();
        let a = tb.now_us();
        std::thread::sleep(Duration::from_millis(2));
        assert!(tb.now_us() > a);
        assert!(tb.unix_us() > 0);
    }
}
