//! Shared market data cache.
//!
//! One instance per process, injected into every worker. Prices prefer the
//! ticker stream, then a short REST cache, then a REST fetch; identical
//! concurrent fetches are coalesced behind a per-key async mutex.

use parking_lot::Mutex;
use rust_decimal::Decimal;
use spotgrid_core::config::MarketDataConfig;
use spotgrid_core::error::ExchangeResult;
use spotgrid_core::events::{AccountSnapshot, Kline, SymbolFilters, Ticker};
use spotgrid_core::indicators;
use spotgrid_core::traits::ExchangeClient;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub const VOLATILITY_INTERVAL: &str = "1d";
pub const VOLATILITY_PERIOD: usize = 14;

#[derive(Debug, Clone, Copy)]
struct StreamQuote {
    price: Decimal,
    volume: Decimal,
    at: Instant,
}

#[derive(Default)]
struct Caches {
    stream: HashMap<String, StreamQuote>,
    prices: HashMap<String, (Decimal, Instant)>,
    volatility: HashMap<String, (Decimal, Instant)>,
    account: Option<(AccountSnapshot, Instant)>,
    filters: HashMap<String, SymbolFilters>,
}

pub struct MarketDataCache {
    exchange: Arc<dyn ExchangeClient>,
    config: MarketDataConfig,
    caches: Mutex<Caches>,
    inflight: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl std::fmt::Debug for MarketDataCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MarketDataCache")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

fn fresh(at: Instant, ttl_secs: u64) -> bool {
    at.elapsed() < Duration::from_secs(ttl_secs)
}

impl MarketDataCache {
    #[must_use]
    pub fn new(exchange: Arc<dyn ExchangeClient>, config: MarketDataConfig) -> Self {
        Self {
            exchange,
            config,
            caches: Mutex::new(Caches::default()),
            inflight: Mutex::new(HashMap::new()),
        }
    }

    /// Exchange behind the cache, for order execution.
    #[must_use]
    pub fn exchange(&self) -> Arc<dyn ExchangeClient> {
        Arc::clone(&self.exchange)
    }

    fn key_lock(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut inflight = self.inflight.lock();
        Arc::clone(inflight.entry(key.to_string()).or_default())
    }

    pub fn record_ticker(&self, ticker: &Ticker) {
        self.caches.lock().stream.insert(
            ticker.symbol.clone(),
            StreamQuote {
                price: ticker.price,
                volume: ticker.volume,
                at: Instant::now(),
            },
        );
    }

    /// Feeds ticker updates from a stream into the cache until cancelled.
    pub fn attach_ticker_stream(
        self: &Arc<Self>,
        mut updates: broadcast::Receiver<Ticker>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    update = updates.recv() => match update {
                        Ok(ticker) => cache.record_ticker(&ticker),
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::debug!(skipped, "Ticker cache lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        })
    }

    fn stream_quote(&self, symbol: &str) -> Option<StreamQuote> {
        if !self.config.use_ticker_stream {
            return None;
        }
        self.caches
            .lock()
            .stream
            .get(symbol)
            .copied()
            .filter(|q| fresh(q.at, self.config.ticker_fresh_secs))
    }

    fn cached_price(&self, symbol: &str) -> Option<Decimal> {
        self.caches
            .lock()
            .prices
            .get(symbol)
            .filter(|(_, at)| fresh(*at, self.config.price_ttl_secs))
            .map(|(p, _)| *p)
    }

    /// Last known price within the configured staleness bounds.
    ///
    /// # Errors
    /// Propagates the exchange error when a fetch is needed and fails.
    pub async fn price(&self, symbol: &str) -> ExchangeResult<Decimal> {
        if let Some(quote) = self.stream_quote(symbol) {
            return Ok(quote.price);
        }
        if let Some(price) = self.cached_price(symbol) {
            return Ok(price);
        }

        let lock = self.key_lock(&format!("price:{symbol}"));
        let _guard = lock.lock().await;
        if let Some(price) = self.cached_price(symbol) {
            return Ok(price);
        }
        let price = self.exchange.get_price(symbol).await?;
        self.caches
            .lock()
            .prices
            .insert(symbol.to_string(), (price, Instant::now()));
        Ok(price)
    }

    /// 24h rolling volume from the ticker stream, when one is attached.
    #[must_use]
    pub fn stream_volume(&self, symbol: &str) -> Option<Decimal> {
        self.stream_quote(symbol).map(|q| q.volume)
    }

    /// Relative ATR over the last 14 daily klines, cached per symbol.
    ///
    /// # Errors
    /// Propagates kline fetch failures.
    pub async fn volatility(&self, symbol: &str) -> ExchangeResult<Option<Decimal>> {
        let cached = |caches: &Caches| {
            caches
                .volatility
                .get(symbol)
                .filter(|(_, at)| fresh(*at, self.config.volatility_ttl_secs))
                .map(|(v, _)| *v)
        };
        if let Some(v) = cached(&self.caches.lock()) {
            return Ok(Some(v));
        }

        let lock = self.key_lock(&format!("volatility:{symbol}"));
        let _guard = lock.lock().await;
        if let Some(v) = cached(&self.caches.lock()) {
            return Ok(Some(v));
        }
        let klines = self
            .exchange
            .get_klines(symbol, VOLATILITY_INTERVAL, VOLATILITY_PERIOD + 1)
            .await?;
        let volatility = indicators::relative_volatility(&klines, VOLATILITY_PERIOD);
        if let Some(v) = volatility {
            self.caches
                .lock()
                .volatility
                .insert(symbol.to_string(), (v, Instant::now()));
        }
        Ok(volatility)
    }

    /// Account snapshot, at most `account_ttl_secs` old unless `force` is set.
    ///
    /// # Errors
    /// Propagates the exchange error when a fetch is needed and fails.
    pub async fn account(&self, force: bool) -> ExchangeResult<AccountSnapshot> {
        let ttl = self.config.account_ttl_secs;
        let cached = |caches: &Caches| {
            caches
                .account
                .as_ref()
                .filter(|(_, at)| fresh(*at, ttl))
                .map(|(a, _)| a.clone())
        };
        if !force {
            if let Some(account) = cached(&self.caches.lock()) {
                return Ok(account);
            }
        }

        let lock = self.key_lock("account");
        let _guard = lock.lock().await;
        if !force {
            if let Some(account) = cached(&self.caches.lock()) {
                return Ok(account);
            }
        }
        let account = self.exchange.get_account().await?;
        self.caches.lock().account = Some((account.clone(), Instant::now()));
        Ok(account)
    }

    /// Drops the cached account snapshot; called after every order.
    pub fn invalidate_account(&self) {
        self.caches.lock().account = None;
    }

    /// Symbol filters, fetched once per process.
    ///
    /// # Errors
    /// Propagates the exchange error on first fetch.
    pub async fn symbol_filters(&self, symbol: &str) -> ExchangeResult<SymbolFilters> {
        let cached = self.caches.lock().filters.get(symbol).copied();
        if let Some(filters) = cached {
            return Ok(filters);
        }
        let filters = self.exchange.symbol_filters(symbol).await?;
        self.caches
            .lock()
            .filters
            .insert(symbol.to_string(), filters);
        Ok(filters)
    }

    /// Uncached kline fetch.
    ///
    /// # Errors
    /// Propagates the exchange error.
    pub async fn klines(&self, symbol: &str, interval: &str, limit: usize) -> ExchangeResult<Vec<Kline>> {
        self.exchange.get_klines(symbol, interval, limit).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paper::PaperExchange;
    use chrono::{TimeZone, Utc};
    use rust_decimal_macros::dec;

    fn cache_over(paper: &Arc<PaperExchange>, config: MarketDataConfig) -> MarketDataCache {
        MarketDataCache::new(Arc::clone(paper) as Arc<dyn ExchangeClient>, config)
    }

    #[tokio::test]
    async fn price_is_cached_within_ttl() {
        let paper = Arc::new(PaperExchange::new(dec!(0.001)));
        paper.set_price("ETHUSDT", dec!(3000));
        let cache = cache_over(&paper, MarketDataConfig::default());

        assert_eq!(cache.price("ETHUSDT").await.unwrap(), dec!(3000));
        paper.set_price("ETHUSDT", dec!(3100));
        assert_eq!(cache.price("ETHUSDT").await.unwrap(), dec!(3000));
    }

    #[tokio::test]
    async fn zero_ttl_always_fetches() {
        let paper = Arc::new(PaperExchange::new(dec!(0.001)));
        paper.set_price("ETHUSDT", dec!(3000));
        let cache = cache_over(
            &paper,
            MarketDataConfig {
                price_ttl_secs: 0,
                ..MarketDataConfig::default()
            },
        );
        cache.price("ETHUSDT").await.unwrap();
        paper.set_price("ETHUSDT", dec!(3100));
        assert_eq!(cache.price("ETHUSDT").await.unwrap(), dec!(3100));
    }

    #[tokio::test]
    async fn stream_price_wins_over_rest() {
        let paper = Arc::new(PaperExchange::new(dec!(0.001)));
        paper.set_price("ETHUSDT", dec!(3000));
        let cache = cache_over(&paper, MarketDataConfig::default());
        cache.record_ticker(&Ticker {
            symbol: "ETHUSDT".to_string(),
            price: dec!(3050),
            volume: dec!(12),
            timestamp: Utc::now(),
        });
        assert_eq!(cache.price("ETHUSDT").await.unwrap(), dec!(3050));
        assert_eq!(cache.stream_volume("ETHUSDT"), Some(dec!(12)));
    }

    #[tokio::test]
    async fn attached_stream_feeds_cache() {
        let paper = Arc::new(PaperExchange::new(dec!(0.001)));
        let cache = Arc::new(cache_over(&paper, MarketDataConfig::default()));
        let (tx, rx) = broadcast::channel(8);
        let cancel = CancellationToken::new();
        let handle = cache.attach_ticker_stream(rx, cancel.clone());

        tx.send(Ticker {
            symbol: "BTCUSDT".to_string(),
            price: dec!(60000),
            volume: dec!(1),
            timestamp: Utc::now(),
        })
        .unwrap();
        drop(tx);
        handle.await.unwrap();
        assert_eq!(cache.price("BTCUSDT").await.unwrap(), dec!(60000));
    }

    #[tokio::test]
    async fn account_cache_respects_force_and_invalidation() {
        let paper = Arc::new(PaperExchange::new(dec!(0.001)));
        paper.deposit("USDT", dec!(100));
        let cache = cache_over(&paper, MarketDataConfig::default());

        assert_eq!(cache.account(false).await.unwrap().free("USDT"), dec!(100));
        paper.deposit("USDT", dec!(50));
        assert_eq!(cache.account(false).await.unwrap().free("USDT"), dec!(100));
        assert_eq!(cache.account(true).await.unwrap().free("USDT"), dec!(150));

        paper.deposit("USDT", dec!(50));
        cache.invalidate_account();
        assert_eq!(cache.account(false).await.unwrap().free("USDT"), dec!(200));
    }

    #[tokio::test]
    async fn volatility_from_daily_klines() {
        let paper = Arc::new(PaperExchange::new(dec!(0.001)));
        let klines = (0..15)
            .map(|i| Kline {
                open_time: Utc.timestamp_opt(1_700_000_000 + i * 86_400, 0).unwrap(),
                open: dec!(100),
                high: dec!(102),
                low: dec!(98),
                close: dec!(100),
                volume: dec!(1),
            })
            .collect();
        paper.set_klines("ETHUSDT", klines);
        let cache = cache_over(&paper, MarketDataConfig::default());
        // true range 4 on each of 14 bars → ATR 4, relative 0.04
        assert_eq!(cache.volatility("ETHUSDT").await.unwrap(), Some(dec!(0.04)));
    }
}
