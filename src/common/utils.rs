//! Small shared helpers

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Get current Unix timestamp (milliseconds)
pub fn timestamp_now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Add up to `frac` of random jitter to a base duration.
/// Used to spread renewal attempts from competing candidates.
pub fn jittered(base: Duration, frac: f64) -> Duration {
    let extra = base.as_secs_f64() * frac * rand::random::<f64>();
    base + Duration::from_secs_f64(extra)
}

/// Exponential backoff with jitter for retry loops that cannot give up.
/// The delay doubles on every failure up to `cap` and resets on success.
#[derive(Debug)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap,
            current: base,
        }
    }

    /// Next delay to sleep before retrying, jittered to spread competing
    /// retriers
    pub fn next_delay(&mut self) -> Duration {
        let delay = jittered(self.current, 0.25);
        self.current = (self.current * 2).min(self.cap);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.base;
    }
}
