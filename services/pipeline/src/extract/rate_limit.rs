use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{sleep_until, Instant};

/// Enforces a minimum spacing between remote calls.
///
/// Shared by every extraction worker, so the spacing holds in aggregate
/// regardless of concurrency.
#[derive(Debug)]
pub struct RateLimiter {
    min_interval: Duration,
    last: Mutex<Option<Instant>>,
}

impl RateLimiter {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last: Mutex::new(None),
        }
    }

    /// Wait until the next call is allowed, then claim the slot.
    pub async fn acquire(&self) {
        if self.min_interval.is_zero() {
            return;
        }
        // Held across the sleep: waiters queue up behind the current slot.
        let mut last = self.last.lock().await;
        if let Some(previous) = *last {
            let ready = previous + self.min_interval;
            if ready > Instant::now() {
                sleep_until(ready).await;
            }
        }
        *last = Some(Instant::now());
    }
}
