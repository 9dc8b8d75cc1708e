//! Per-origin minimum inter-request spacing.
//!
//! Each origin has its own delay and last-request timestamp, guarded by its
//! own lock so that requests to distinct origins never block each other.
//! `acquire` holds the origin's lock across the wait, which is what
//! serializes requests to the same origin.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

#[derive(Debug, Clone)]
struct OriginState {
    delay: Duration,
    last_request: Option<Instant>,
    /// Set on a 429 and persists until the next successful response; doubles
    /// the effective delay for this origin until cleared.
    backoff_multiplier: u32,
}

impl OriginState {
    fn new(default_delay: Duration) -> Self {
        Self {
            delay: default_delay,
            last_request: None,
            backoff_multiplier: 1,
        }
    }

    fn effective_delay(&self) -> Duration {
        self.delay * self.backoff_multiplier
    }
}

/// Per-origin rate limiter. `d0` is the default minimum spacing applied to
/// an origin before any robots `Crawl-delay` override or 429 backoff.
pub struct RateLimiter {
    default_delay: Duration,
    origins: Mutex<HashMap<String, Arc<Mutex<OriginState>>>>,
}

impl RateLimiter {
    pub fn new(default_delay: Duration) -> Self {
        Self {
            default_delay,
            origins: Mutex::new(HashMap::new()),
        }
    }

    async fn state_for(&self, origin: &str) -> Arc<Mutex<OriginState>> {
        let mut origins = self.origins.lock().await;
        origins
            .entry(origin.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(OriginState::new(self.default_delay))))
            .clone()
    }

    /// Wait until `origin`'s minimum spacing has elapsed, then record this
    /// request's timestamp. Returns the duration actually waited.
    pub async fn acquire(&self, origin: &str) -> Duration {
        let state = self.state_for(origin).await;
        let mut guard = state.lock().await;

        let delay = guard.effective_delay();
        let wait = match guard.last_request {
            Some(last) => delay.saturating_sub(last.elapsed()),
            None => Duration::ZERO,
        };
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
        guard.last_request = Some(Instant::now());
        wait
    }

    /// Override `origin`'s base delay (e.g. from a parsed `Crawl-delay`),
    /// clamped to never go below the configured default.
    pub async fn set_delay(&self, origin: &str, delay: Duration) {
        let state = self.state_for(origin).await;
        let mut guard = state.lock().await;
        guard.delay = delay.max(self.default_delay);
    }

    /// Double the effective backoff for `origin`. Persists across calls
    /// until [`RateLimiter::record_success`] clears it.
    pub async fn record_429(&self, origin: &str) {
        let state = self.state_for(origin).await;
        let mut guard = state.lock().await;
        guard.backoff_multiplier = (guard.backoff_multiplier * 2).max(2);
    }

    /// Clear any accumulated 429 backoff for `origin` after a success.
    pub async fn record_success(&self, origin: &str) {
        let state = self.state_for(origin).await;
        let mut guard = state.lock().await;
        guard.backoff_multiplier = 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn first_request_does_not_wait() {
        let limiter = RateLimiter::new(Duration::from_millis(50));
        let wait = limiter.acquire("https://ex.test").await;
        assert_eq!(wait, Duration::ZERO);
    }

    #[tokio::test]
    async fn second_request_waits_remaining_spacing() {
        let limiter = RateLimiter::new(Duration::from_millis(80));
        limiter.acquire("https://ex.test").await;
        let start = Instant::now();
        limiter.acquire("https://ex.test").await;
        assert!(start.elapsed() >= Duration::from_millis(40));
    }

    #[tokio::test]
    async fn distinct_origins_do_not_block_each_other() {
        let limiter = RateLimiter::new(Duration::from_millis(200));
        limiter.acquire("https://a.test").await;
        let start = Instant::now();
        limiter.acquire("https://b.test").await;
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test]
    async fn set_delay_never_drops_below_default() {
        let limiter = RateLimiter::new(Duration::from_millis(100));
        limiter.set_delay("https://ex.test", Duration::from_millis(10)).await;
        limiter.acquire("https://ex.test").await;
        let start = Instant::now();
        limiter.acquire("https://ex.test").await;
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn backoff_doubles_and_persists_until_success() {
        let limiter = RateLimiter::new(Duration::from_millis(20));
        limiter.acquire("https://ex.test").await;
        limiter.record_429("https://ex.test").await;
        let start = Instant::now();
        limiter.acquire("https://ex.test").await;
        // effective delay now 40ms, not the base 20ms
        assert!(start.elapsed() >= Duration::from_millis(30));

        limiter.record_success("https://ex.test").await;
        let start = Instant::now();
        limiter.acquire("https://ex.test").await;
        assert!(start.elapsed() < Duration::from_millis(15));
    }
}
