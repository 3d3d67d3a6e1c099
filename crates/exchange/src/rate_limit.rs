use chrono::{DateTime, Utc};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use parking_lot::Mutex;
use std::num::NonZeroU32;

/// Request weights per endpoint family.
pub mod weight {
    pub const PRICE: u32 = 2;
    pub const KLINES: u32 = 2;
    pub const ACCOUNT: u32 = 20;
    pub const EXCHANGE_INFO: u32 = 10;
    pub const ORDER: u32 = 1;
    pub const MY_TRADES: u32 = 20;
    pub const TIME: u32 = 1;
}

/// Per-minute request weight budget.
///
/// Calls wait on a `governor` limiter sized to the budget, and the weight used
/// in the current wall-clock minute is tracked so that heavy usage can be
/// logged before the exchange starts refusing requests.
pub struct WeightBudget {
    limiter: DefaultDirectRateLimiter,
    capacity: NonZeroU32,
    warn_threshold: u32,
    used: Mutex<(i64, u32)>,
}

impl std::fmt::Debug for WeightBudget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WeightBudget")
            .field("capacity", &self.capacity)
            .field("warn_threshold", &self.warn_threshold)
            .finish_non_exhaustive()
    }
}

impl WeightBudget {
    #[must_use]
    pub fn new(per_minute: u32, warn_threshold: u32) -> Self {
        let capacity = NonZeroU32::new(per_minute.max(1)).unwrap_or(NonZeroU32::MIN);
        Self {
            limiter: RateLimiter::direct(Quota::per_minute(capacity)),
            capacity,
            warn_threshold,
            used: Mutex::new((0, 0)),
        }
    }

    /// Waits until `weight` units are available, then records them.
    pub async fn acquire(&self, weight: u32) {
        let n = NonZeroU32::new(weight.min(self.capacity.get())).unwrap_or(NonZeroU32::MIN);
        if let Err(e) = self.limiter.until_n_ready(n).await {
            tracing::warn!(weight, error = %e, "Request weight exceeds budget capacity");
        }
        self.record(weight, Utc::now());
    }

    fn record(&self, weight: u32, now: DateTime<Utc>) -> u32 {
        let minute = now.timestamp() / 60;
        let used = {
            let mut guard = self.used.lock();
            if guard.0 != minute {
                *guard = (minute, 0);
            }
            guard.1 = guard.1.saturating_add(weight);
            guard.1
        };
        if used > self.warn_threshold && used - weight <= self.warn_threshold {
            tracing::warn!(used, threshold = self.warn_threshold, "High request weight usage this minute");
        }
        used
    }

    /// Weight recorded in the current minute.
    #[must_use]
    pub fn used_this_minute(&self) -> u32 {
        let minute = Utc::now().timestamp() / 60;
        let guard = self.used.lock();
        if guard.0 == minute {
            guard.1
        } else {
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn usage_resets_each_minute() {
        let budget = WeightBudget::new(1200, 1000);
        let now = Utc::now();
        assert_eq!(budget.record(20, now), 20);
        assert_eq!(budget.record(2, now), 22);
        assert_eq!(budget.record(5, now + Duration::minutes(1)), 5);
    }

    #[tokio::test]
    async fn acquire_counts_weight() {
        let budget = WeightBudget::new(1200, 1000);
        budget.acquire(weight::ACCOUNT).await;
        budget.acquire(weight::PRICE).await;
        // may straddle a minute boundary
        assert!(budget.used_this_minute() <= 22);
    }
}
