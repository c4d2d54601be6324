use tokio::time::Instant;

use crate::config::RateLimitConfig;

/// Token bucket guarding a single client's chat messages.
///
/// Each registered client owns one bucket. A message is admitted when a whole
/// token is available; tokens accrue continuously at `refill_per_sec` up to
/// `capacity`. Admission never blocks.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    capacity: f64,
    refill_per_sec: f64,
    tokens: f64,
    last_refill: Instant,
}

impl RateLimiter {
    /// Creates a full bucket.
    pub fn new(config: RateLimitConfig) -> Self {
        let capacity = f64::from(config.capacity);
        Self {
            capacity,
            refill_per_sec: config.refill_per_sec,
            tokens: capacity,
            last_refill: Instant::now(),
        }
    }

    pub fn try_admit(&mut self) -> bool {
        self.try_admit_at(Instant::now())
    }

    /// Consumes one token if the bucket holds one at `now`.
    pub fn try_admit_at(&mut self, now: Instant) -> bool {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    fn refill(&mut self, now: Instant) {
        // Instants earlier than the last refill are treated as "no time passed".
        let elapsed = now.saturating_duration_since(self.last_refill);
        self.tokens = (self.tokens + elapsed.as_secs_f64() * self.refill_per_sec).min(self.capacity);
        self.last_refill = now.max(self.last_refill);
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(RateLimitConfig::default())
    }
}
