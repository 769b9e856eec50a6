use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use moka::future::Cache;
use tracing::warn;

use crate::errors::AppError;

const RATE_LIMIT_CACHE_MAX_CAPACITY: u64 = 10_000;

#[derive(Debug)]
struct Counter(AtomicU32);

impl Counter {
    fn new() -> Self {
        Self(AtomicU32::new(0))
    }

    fn increment(&self) -> u32 {
        self.0.fetch_add(1, Ordering::Relaxed) + 1
    }
}

/// Fixed-window request counter keyed by client address.
/// A client's window starts with its first request and expires with the
/// cache entry. A limit of zero disables it.
pub struct RateLimiter {
    limit: u32,
    window: Duration,
    counters: Cache<String, Arc<Counter>>,
}

impl RateLimiter {
    pub fn new(limit: u32, window: Duration) -> Self {
        let counters = Cache::builder()
            .time_to_live(window)
            .max_capacity(RATE_LIMIT_CACHE_MAX_CAPACITY)
            .build();
        Self { limit, window, counters }
    }

    pub fn disabled() -> Self {
        Self::new(0, Duration::from_secs(60))
    }

    pub fn is_enabled(&self) -> bool {
        self.limit > 0
    }

    pub async fn check(&self, client: &str) -> Result<(), AppError> {
        if !self.is_enabled() {
            return Ok(());
        }
        let counter = self
            .counters
            .get_with(client.to_string(), async { Arc::new(Counter::new()) })
            .await;

        let count = counter.increment();
        if count > self.limit {
            warn!("Rate limit exceeded for {client} ({count} requests)");
            return Err(AppError::RateLimited {
                limit: self.limit,
                window_secs: self.window.as_secs(),
            });
        }
        Ok(())
    }

    #[cfg(test)]
    async fn tracked_clients(&self) -> u64 {
        self.counters.run_pending_tasks().await;
        self.counters.entry_count()
    }
}
