use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use spotgrid_core::indicators::Trend;
use std::collections::{HashMap, VecDeque};

use crate::signal_engine::RejectReason;

/// Rolling inputs of the signal engine for one worker.
///
/// Price and volume buffers are append-only and evict their oldest sample
/// once `capacity` is reached.
#[derive(Debug, Clone)]
pub struct StrategyState {
    capacity: usize,
    prices: VecDeque<Decimal>,
    volumes: VecDeque<Decimal>,
    pub volatility: Option<Decimal>,
    pub htf_trend: Option<(Trend, DateTime<Utc>)>,
    pub last_stop_loss_at: Option<DateTime<Utc>>,
    pub last_dca_attempt_at: Option<DateTime<Utc>>,
    pub last_rejection: Option<RejectReason>,
    rejection_counts: HashMap<RejectReason, u64>,
}

impl StrategyState {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            prices: VecDeque::with_capacity(capacity),
            volumes: VecDeque::with_capacity(capacity),
            volatility: None,
            htf_trend: None,
            last_stop_loss_at: None,
            last_dca_attempt_at: None,
            last_rejection: None,
            rejection_counts: HashMap::new(),
        }
    }

    pub fn push(&mut self, price: Decimal, volume: Decimal) {
        if self.prices.len() == self.capacity {
            self.prices.pop_front();
        }
        if self.volumes.len() == self.capacity {
            self.volumes.pop_front();
        }
        self.prices.push_back(price);
        self.volumes.push_back(volume);
    }

    /// Replaces the buffers with historical samples, keeping the newest `capacity`.
    pub fn seed(&mut self, samples: impl IntoIterator<Item = (Decimal, Decimal)>) {
        self.prices.clear();
        self.volumes.clear();
        for (price, volume) in samples {
            self.push(price, volume);
        }
    }

    /// Drops the volume samples while keeping the price history.
    pub fn clear_volumes(&mut self) {
        self.volumes.clear();
    }

    /// Changes the buffer size, dropping the oldest samples if it shrinks.
    pub fn resize(&mut self, capacity: usize) {
        self.capacity = capacity.max(1);
        while self.prices.len() > self.capacity {
            self.prices.pop_front();
        }
        while self.volumes.len() > self.capacity {
            self.volumes.pop_front();
        }
    }

    #[must_use]
    pub fn prices(&self) -> Vec<Decimal> {
        self.prices.iter().copied().collect()
    }

    #[must_use]
    pub fn volumes(&self) -> Vec<Decimal> {
        self.volumes.iter().copied().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.prices.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.prices.is_empty()
    }

    #[must_use]
    pub fn last_price(&self) -> Option<Decimal> {
        self.prices.back().copied()
    }

    /// Cached higher-timeframe trend if it is younger than `ttl_secs`.
    #[must_use]
    pub fn fresh_htf_trend(&self, now: DateTime<Utc>, ttl_secs: u64) -> Option<Trend> {
        let (trend, at) = self.htf_trend?;
        let age = now.signed_duration_since(at).num_seconds();
        (age >= 0 && age.unsigned_abs() < ttl_secs).then_some(trend)
    }

    pub fn set_htf_trend(&mut self, trend: Trend, at: DateTime<Utc>) {
        self.htf_trend = Some((trend, at));
    }

    pub fn record_rejection(&mut self, reason: RejectReason) {
        self.last_rejection = Some(reason);
        *self.rejection_counts.entry(reason).or_insert(0) += 1;
    }

    #[must_use]
    pub fn rejection_count(&self, reason: RejectReason) -> u64 {
        self.rejection_counts.get(&reason).copied().unwrap_or(0)
    }

    #[must_use]
    pub fn rejection_counts(&self) -> &HashMap<RejectReason, u64> {
        &self.rejection_counts
    }
}
