//! Retry decorator for any [`ExchangeClient`].
//!
//! Transient failures (network, timeout, rate limit) are retried with
//! exponential backoff bounded by a maximum elapsed time. A clock-skew error
//! triggers one `sync_time` and one more attempt. Order submissions only retry
//! on rate limiting, where the exchange is known to have refused the request.

use async_trait::async_trait;
use backoff::ExponentialBackoff;
use rust_decimal::Decimal;
use spotgrid_core::error::{ExchangeError, ExchangeResult};
use spotgrid_core::events::{
    AccountSnapshot, Kline, LimitOrder, MarketOrder, OrderAck, OrderFill, OrderStatus,
    SymbolFilters,
};
use spotgrid_core::traits::ExchangeClient;
use std::future::Future;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Idempotency {
    Safe,
    SubmitOnce,
}

pub struct RetryingExchange<E> {
    inner: E,
    initial_interval: Duration,
    max_elapsed: Duration,
}

impl<E: ExchangeClient> RetryingExchange<E> {
    #[must_use]
    pub const fn new(inner: E, max_elapsed: Duration) -> Self {
        Self {
            inner,
            initial_interval: Duration::from_millis(250),
            max_elapsed,
        }
    }

    #[must_use]
    pub const fn with_initial_interval(mut self, interval: Duration) -> Self {
        self.initial_interval = interval;
        self
    }

    #[must_use]
    pub const fn inner(&self) -> &E {
        &self.inner
    }

    fn policy(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            initial_interval: self.initial_interval,
            max_interval: self.max_elapsed.max(self.initial_interval),
            max_elapsed_time: Some(self.max_elapsed),
            ..ExponentialBackoff::default()
        }
    }

    async fn call<T, F, Fut>(&self, op: &'static str, idempotency: Idempotency, f: F) -> ExchangeResult<T>
    where
        F: Fn() -> Fut + Send + Sync,
        Fut: Future<Output = ExchangeResult<T>> + Send,
        T: Send,
    {
        let mut resynced = false;
        loop {
            let f = &f;
            let result = backoff::future::retry_notify(
                self.policy(),
                || {
                    let fut = f();
                    async move {
                        fut.await.map_err(|e| classify(e, idempotency))
                    }
                },
                |e: ExchangeError, wait: Duration| {
                    tracing::warn!(op, error = %e, wait = ?wait, "Transient exchange error, retrying");
                },
            )
            .await;

            match result {
                Err(e) if e.is_clock_skew() && !resynced => {
                    tracing::warn!(op, error = %e, "Clock skew detected, resyncing");
                    resynced = true;
                    self.inner.sync_time().await?;
                }
                other => return other,
            }
        }
    }
}

fn classify(e: ExchangeError, idempotency: Idempotency) -> backoff::Error<ExchangeError> {
    match (&e, idempotency) {
        (ExchangeError::RateLimited { retry_after_secs }, _) => {
            let wait = Duration::from_secs(*retry_after_secs);
            backoff::Error::retry_after(e, wait)
        }
        (_, Idempotency::Safe) if e.is_retryable() => backoff::Error::transient(e),
        _ => backoff::Error::permanent(e),
    }
}

#[async_trait]
impl<E: ExchangeClient> ExchangeClient for RetryingExchange<E> {
    async fn get_price(&self, symbol: &str) -> ExchangeResult<Decimal> {
        self.call("get_price", Idempotency::Safe, || self.inner.get_price(symbol))
            .await
    }

    async fn get_klines(&self, symbol: &str, interval: &str, limit: usize) -> ExchangeResult<Vec<Kline>> {
        self.call("get_klines", Idempotency::Safe, || {
            self.inner.get_klines(symbol, interval, limit)
        })
        .await
    }

    async fn get_account(&self) -> ExchangeResult<AccountSnapshot> {
        self.call("get_account", Idempotency::Safe, || self.inner.get_account())
            .await
    }

    async fn symbol_filters(&self, symbol: &str) -> ExchangeResult<SymbolFilters> {
        self.call("symbol_filters", Idempotency::Safe, || {
            self.inner.symbol_filters(symbol)
        })
        .await
    }

    async fn submit_market_order(&self, order: &MarketOrder) -> ExchangeResult<OrderFill> {
        self.call("submit_market_order", Idempotency::SubmitOnce, || {
            self.inner.submit_market_order(order)
        })
        .await
    }

    async fn submit_limit_order(&self, order: &LimitOrder) -> ExchangeResult<OrderAck> {
        self.call("submit_limit_order", Idempotency::SubmitOnce, || {
            self.inner.submit_limit_order(order)
        })
        .await
    }

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> ExchangeResult<()> {
        self.call("cancel_order", Idempotency::Safe, || {
            self.inner.cancel_order(symbol, order_id)
        })
        .await
    }

    async fn get_order_status(&self, symbol: &str, order_id: &str) -> ExchangeResult<OrderStatus> {
        self.call("get_order_status", Idempotency::Safe, || {
            self.inner.get_order_status(symbol, order_id)
        })
        .await
    }

    async fn order_commission(&self, symbol: &str, order_id: &str) -> ExchangeResult<Option<Decimal>> {
        self.call("order_commission", Idempotency::Safe, || {
            self.inner.order_commission(symbol, order_id)
        })
        .await
    }

    async fn sync_time(&self) -> ExchangeResult<()> {
        self.inner.sync_time().await
    }
}
