//! Process-wide request throttle
//!
//! One [`RateLimiter`] is built at startup and shared (`Arc`) by every client
//! and worker, so the minimum interval holds across all concurrent callers.
//!
//! The lock is held across the sleep. Waiters therefore queue up and each one
//! is granted exactly `min_interval` after the previous grant; concurrency is
//! traded for exact throttling.

use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{sleep_until, Instant};
use tracing::trace;

/// Default spacing: 500 requests per minute
pub const DEFAULT_MIN_INTERVAL: Duration = Duration::from_millis(120);

#[derive(Debug)]
pub struct RateLimiter {
    min_interval: Duration,
    last_grant: Mutex<Option<Instant>>,
}

impl RateLimiter {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_grant: Mutex::new(None),
        }
    }

    /// Build a limiter from a requests-per-minute quota
    pub fn per_minute(requests: u32) -> Self {
        let requests = requests.max(1);
        Self::new(Duration::from_secs(60) / requests)
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    /// Wait until at least `min_interval` has passed since the last grant,
    /// then record a new grant. Never fails.
    pub async fn acquire(&self) {
        let mut last_grant = self.last_grant.lock().await;

        if let Some(last) = *last_grant {
            let ready_at = last + self.min_interval;
            if ready_at > Instant::now() {
                trace!(wait_ms = (ready_at - Instant::now()).as_millis() as u64, "Throttling request");
                sleep_until(ready_at).await;
            }
        }

        // Read the clock after sleeping so oversleeping is not credited twice
        *last_grant = Some(Instant::now());
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_MIN_INTERVAL)
    }
}
