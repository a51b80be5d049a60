use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Enforces a minimum spacing between outgoing calls from one `NasClient`
/// instance. Per-instance, not per-endpoint: every call, regardless of
/// which NAS operation it represents, shares the same clock.
pub struct RateLimiter {
    min_spacing: Duration,
    last_call: Arc<Mutex<Option<Instant>>>,
}

impl RateLimiter {
    pub fn new(min_spacing: Duration) -> Self {
        Self {
            min_spacing,
            last_call: Arc::new(Mutex::new(None)),
        }
    }

    /// Blocks until at least `min_spacing` has elapsed since the previous
    /// call returned from this method, then records the new call time.
    pub async fn acquire(&self) {
        let mut last = self.last_call.lock().await;
        let now = Instant::now();
        if let Some(prev) = *last {
            let elapsed = now.saturating_duration_since(prev);
            if elapsed < self.min_spacing {
                tokio::time::sleep(self.min_spacing - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }
}

/// Applies 10-20% jitter to a backoff delay, used for retry spacing (not
/// the baseline rate-limit spacing, which stays deterministic).
pub fn jittered(base: Duration) -> Duration {
    let factor = 1.0 + rand::random::<f64>() * 0.10 + 0.10;
    Duration::from_secs_f64(base.as_secs_f64() * factor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn acquire_enforces_minimum_spacing() {
        let limiter = RateLimiter::new(Duration::from_millis(50));
        let start = Instant::now();
        limiter.acquire().await;
        limiter.acquire().await;
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn jittered_stays_within_documented_band() {
        let base = Duration::from_secs(1);
        for _ in 0..50 {
            let d = jittered(base);
            assert!(d.as_secs_f64() >= 1.10);
            assert!(d.as_secs_f64() <= 1.20 + 1e-9);
        }
    }
}
