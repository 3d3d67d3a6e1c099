use crate::error::ExchangeResult;
use crate::events::{
    AccountSnapshot, Kline, LimitOrder, MarketOrder, OrderAck, OrderFill, OrderStatus,
    SymbolFilters,
};
use crate::state::{
    EquitySnapshot, LedgerSnapshot, TradeRecord, WorkerKey, WorkerSnapshot,
};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Spot exchange facade.
///
/// Order amounts and prices must already be rounded to the pair's
/// [`SymbolFilters`] before they reach an implementation.
#[async_trait]
pub trait ExchangeClient: Send + Sync {
    async fn get_price(&self, symbol: &str) -> ExchangeResult<Decimal>;

    async fn get_klines(
        &self,
        symbol: &str,
        interval: &str,
        limit: usize,
    ) -> ExchangeResult<Vec<Kline>>;

    async fn get_account(&self) -> ExchangeResult<AccountSnapshot>;

    async fn symbol_filters(&self, symbol: &str) -> ExchangeResult<SymbolFilters>;

    async fn submit_market_order(&self, order: &MarketOrder) -> ExchangeResult<OrderFill>;

    async fn submit_limit_order(&self, order: &LimitOrder) -> ExchangeResult<OrderAck>;

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> ExchangeResult<()>;

    async fn get_order_status(&self, symbol: &str, order_id: &str) -> ExchangeResult<OrderStatus>;

    /// Commission charged for a filled order, in the quote asset, when the
    /// exchange reports it.
    async fn order_commission(
        &self,
        _symbol: &str,
        _order_id: &str,
    ) -> ExchangeResult<Option<Decimal>> {
        Ok(None)
    }

    /// Re-aligns the local request clock with the exchange.
    async fn sync_time(&self) -> ExchangeResult<()> {
        Ok(())
    }
}

/// Load/save contract for worker and ledger state.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn save_worker_state(&self, snapshot: &WorkerSnapshot) -> Result<()>;

    async fn load_worker_state(&self, key: &WorkerKey) -> Result<Option<WorkerSnapshot>>;

    async fn delete_worker_state(&self, key: &WorkerKey) -> Result<()>;

    async fn list_worker_states(&self) -> Result<Vec<WorkerSnapshot>>;

    /// Persists the ledger unless the stored copy has a higher version.
    async fn save_ledger(&self, ledger: &LedgerSnapshot) -> Result<()>;

    async fn load_ledger(&self) -> Result<Option<LedgerSnapshot>>;
}

/// Append-only trade and equity history.
#[async_trait]
pub trait TradeJournal: Send + Sync {
    async fn record_trade(&self, trade: &TradeRecord) -> Result<()>;

    async fn record_equity(&self, snapshot: &EquitySnapshot) -> Result<()>;

    /// Trades with `start <= timestamp < end`, oldest first.
    async fn trades_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<TradeRecord>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationLevel {
    Info,
    Warning,
    Critical,
}

impl fmt::Display for NotificationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Info => write!(f, "INFO"),
            Self::Warning => write!(f, "WARNING"),
            Self::Critical => write!(f, "CRITICAL"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub level: NotificationLevel,
    pub title: String,
    pub body: String,
}

impl Notification {
    #[must_use]
    pub fn info(title: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            level: NotificationLevel::Info,
            title: title.into(),
            body: body.into(),
        }
    }

    #[must_use]
    pub fn warning(title: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            level: NotificationLevel::Warning,
            title: title.into(),
            body: body.into(),
        }
    }

    #[must_use]
    pub fn critical(title: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            level: NotificationLevel::Critical,
            title: title.into(),
            body: body.into(),
        }
    }
}

/// Outbound message sink. Delivery is best effort; callers never act on failure
/// beyond logging it.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: &Notification) -> Result<()>;

    fn name(&self) -> &str;
}
