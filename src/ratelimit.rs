//! Token-bucket bandwidth shaping for simulated links.
//!
//! The allowance starts empty and refills continuously at `bandwidth` bytes
//! per second up to `max_burst`. Each write deducts its size, which may drive
//! the allowance negative; the write is then delayed until the debt would be
//! repaid. A bandwidth of zero disables shaping.

use tokio::time::{Duration, Instant};

/// Upper bound on any delay the limiter hands out. Tiny rates would
/// otherwise produce delays that overflow `Duration` or `Instant`.
pub const MAX_DELAY: Duration = Duration::from_secs(365 * 24 * 60 * 60);

#[derive(Debug, Clone)]
pub struct RateLimiter {
    /// Bytes per second.
    bandwidth: f64,
    allowance: f64,
    max_allowance: f64,
    last_update: Instant,
}

impl RateLimiter {
    pub fn new(bandwidth: f64, max_burst: Option<f64>) -> Self {
        let bandwidth = bandwidth.max(0.0);
        Self {
            bandwidth,
            allowance: 0.0,
            max_allowance: max_burst.unwrap_or(bandwidth).max(0.0),
            last_update: Instant::now(),
        }
    }

    /// Replace the rate. Accumulated allowance and debt are discarded.
    pub fn update_bandwidth(&mut self, bandwidth: f64, max_burst: Option<f64>) {
        *self = Self::new(bandwidth, max_burst);
    }

    pub fn bandwidth(&self) -> f64 {
        self.bandwidth
    }

    /// Account for `bytes` leaving now and return how long their delivery
    /// must be held back.
    pub fn limit(&mut self, bytes: usize) -> Duration {
        if self.bandwidth == 0.0 {
            return Duration::ZERO;
        }

        let now = Instant::now();
        let elapsed = now.duration_since(self.last_update).as_secs_f64();
        self.last_update = now;

        self.allowance = (self.allowance + elapsed * self.bandwidth).min(self.max_allowance);
        self.allowance -= bytes as f64;

        if self.allowance >= 0.0 {
            Duration::ZERO
        } else {
            Duration::try_from_secs_f64(-self.allowance / self.bandwidth)
                .unwrap_or(MAX_DELAY)
                .min(MAX_DELAY)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn zero_bandwidth_never_delays() {
        let mut limiter = RateLimiter::new(0.0, None);
        assert_eq!(limiter.limit(1_000_000), Duration::ZERO);
        assert_eq!(limiter.limit(1), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_bucket_delays_by_size_over_rate() {
        let mut limiter = RateLimiter::new(1000.0, None);
        let delay = limiter.limit(500);
        assert_eq!(delay, Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn debt_accumulates_across_writes() {
        let mut limiter = RateLimiter::new(1000.0, None);
        assert_eq!(limiter.limit(1000), Duration::from_secs(1));
        assert_eq!(limiter.limit(1000), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn refill_is_capped_at_burst() {
        let mut limiter = RateLimiter::new(1000.0, Some(200.0));
        tokio::time::advance(Duration::from_secs(10)).await;
        // Only 200 bytes of credit survive the idle period.
        assert_eq!(limiter.limit(200), Duration::ZERO);
        assert_eq!(limiter.limit(100), Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn elapsed_time_repays_debt() {
        let mut limiter = RateLimiter::new(1000.0, None);
        assert_eq!(limiter.limit(1000), Duration::from_secs(1));
        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(limiter.limit(0), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn tiny_bandwidth_delay_is_capped() {
        let mut limiter = RateLimiter::new(1e-20, None);
        assert_eq!(limiter.limit(1), MAX_DELAY);
        assert_eq!(limiter.limit(usize::MAX), MAX_DELAY);
    }

    #[tokio::test(start_paused = true)]
    async fn update_bandwidth_resets_state() {
        let mut limiter = RateLimiter::new(1000.0, None);
        let _ = limiter.limit(5000);
        limiter.update_bandwidth(0.0, None);
        assert_eq!(limiter.limit(5000), Duration::ZERO);
        assert_eq!(limiter.bandwidth(), 0.0);
    }
}
