//! Counter-based exponential backoff with jitter.

use std::time::Duration;

use rand::Rng;

/// `interval = clamp(uniform(0, (2^counter - 1) * ratio), min, max)`.
///
/// Used with two independent instances per session: one for connection
/// backoff (reconnect scheduling) and one for message backoff (delivery
/// throttling).
pub struct BackoffTimer {
    counter: u32,
    ratio: f64,
    min_interval: Option<Duration>,
    max_interval: Option<Duration>,
}

impl BackoffTimer {
    pub fn new(ratio: f64, min_interval: Option<Duration>, max_interval: Option<Duration>) -> Self {
        BackoffTimer {
            counter: 0,
            ratio,
            min_interval,
            max_interval,
        }
    }

    pub fn is_reset(&self) -> bool {
        self.counter == 0
    }

    pub fn reset(&mut self) -> &mut Self {
        self.counter = 0;
        self
    }

    pub fn success(&mut self) -> &mut Self {
        self.counter = self.counter.saturating_sub(1);
        self
    }

    pub fn failure(&mut self) -> &mut Self {
        self.counter += 1;
        self
    }

    pub fn counter(&self) -> u32 {
        self.counter
    }

    /// Draws a fresh interval from the current counter. Order of clamping
    /// matches the reference timer: max is applied before min, so a
    /// configured `min_interval` always wins even if it exceeds `max`.
    pub fn get_interval(&self) -> Duration {
        let k = 2f64.powi(self.counter as i32) - 1.0;
        let mut secs = rand::thread_rng().gen::<f64>() * k * self.ratio;

        if let Some(max) = self.max_interval {
            secs = secs.min(max.as_secs_f64());
        }
        if let Some(min) = self.min_interval {
            secs = secs.max(min.as_secs_f64());
        }

        Duration::from_secs_f64(secs.max(0.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_is_reset_initially() {
        let t = BackoffTimer::new(1.0, None, None);
        assert!(t.is_reset());
    }

    #[test]
    fn success_does_not_go_below_zero() {
        let mut t = BackoffTimer::new(1.0, None, None);
        t.success();
        assert_eq!(t.counter(), 0);
    }

    #[test]
    fn failure_increments() {
        let mut t = BackoffTimer::new(1.0, None, None);
        t.failure();
        t.failure();
        assert_eq!(t.counter(), 2);
    }

    #[test]
    fn interval_bounded_by_clamp_for_many_counters() {
        for counter in 0..=64u32 {
            let mut t = BackoffTimer::new(
                1.0,
                Some(Duration::from_millis(1)),
                Some(Duration::from_secs(60)),
            );
            for _ in 0..counter {
                t.failure();
            }
            for _ in 0..100 {
                let interval = t.get_interval();
                assert!(interval >= Duration::from_millis(1));
                assert!(interval <= Duration::from_secs(60));
            }
        }
    }

    #[test]
    fn min_wins_over_max_when_misconfigured() {
        let mut t = BackoffTimer::new(1.0, Some(Duration::from_secs(10)), Some(Duration::from_secs(1)));
        t.failure();
        let interval = t.get_interval();
        assert_eq!(interval, Duration::from_secs(10));
    }

    #[test]
    fn reset_zeroes_counter() {
        let mut t = BackoffTimer::new(1.0, None, None);
        t.failure();
        t.failure();
        t.reset();
        assert!(t.is_reset());
    }
}
