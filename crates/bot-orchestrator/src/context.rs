//! Shared services handed to every worker.

use crate::capital::CapitalAllocator;
use crate::notifier::spawn_notify;
use spotgrid_core::state::{EquitySnapshot, TradeRecord, WorkerSnapshot};
use spotgrid_core::traits::{Notification, Notifier, StateStore, TradeJournal};
use spotgrid_exchange::MarketDataCache;
use spotgrid_strategy::ExternalScores;
use std::sync::Arc;
use tokio::sync::watch;

/// Everything a worker needs besides its own config and state.
///
/// Store and journal failures are logged and swallowed here; a worker never
/// stops trading because persistence is down.
#[derive(Clone)]
pub struct WorkerContext {
    pub market: Arc<MarketDataCache>,
    pub allocator: Arc<CapitalAllocator>,
    pub store: Option<Arc<dyn StateStore>>,
    pub journal: Option<Arc<dyn TradeJournal>>,
    pub notifier: Arc<dyn Notifier>,
    pub scores: watch::Receiver<ExternalScores>,
}

impl WorkerContext {
    pub async fn persist(&self, snapshot: &WorkerSnapshot) {
        let Some(store) = &self.store else {
            return;
        };
        if let Err(e) = store.save_worker_state(snapshot).await {
            tracing::warn!(worker = %snapshot.key(), error = %e, "Failed to persist worker state");
        }
    }

    pub async fn journal_trade(&self, trade: &TradeRecord) {
        let Some(journal) = &self.journal else {
            return;
        };
        if let Err(e) = journal.record_trade(trade).await {
            tracing::warn!(worker = %trade.worker, action = ?trade.action, error = %e, "Failed to journal trade");
        }
    }

    pub async fn journal_equity(&self, snapshot: &EquitySnapshot) {
        let Some(journal) = &self.journal else {
            return;
        };
        if let Err(e) = journal.record_equity(snapshot).await {
            tracing::warn!(worker = %snapshot.worker, error = %e, "Failed to journal equity");
        }
    }

    pub fn notify(&self, notification: Notification) {
        spawn_notify(&self.notifier, notification);
    }

    #[must_use]
    pub fn scores(&self) -> ExternalScores {
        *self.scores.borrow()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::notifier::LogNotifier;
    use rust_decimal::Decimal;
    use spotgrid_core::config::MarketDataConfig;
    use spotgrid_core::traits::ExchangeClient;
    use spotgrid_data::SqliteStore;
    use spotgrid_exchange::PaperExchange;

    /// Context over a standalone paper market with an in-memory store.
    pub async fn paper_context(
        market_feed: &Arc<PaperExchange>,
        total_capital: Decimal,
    ) -> (WorkerContext, Arc<SqliteStore>, watch::Sender<ExternalScores>) {
        context_over(Arc::clone(market_feed) as Arc<dyn ExchangeClient>, total_capital).await
    }

    /// Context whose shared exchange is `exchange`; live workers trade on it.
    pub async fn context_over(
        exchange: Arc<dyn ExchangeClient>,
        total_capital: Decimal,
    ) -> (WorkerContext, Arc<SqliteStore>, watch::Sender<ExternalScores>) {
        let store = Arc::new(SqliteStore::new_in_memory().await.unwrap());
        let config = MarketDataConfig {
            price_ttl_secs: 0,
            account_ttl_secs: 0,
            use_ticker_stream: false,
            ..MarketDataConfig::default()
        };
        let market = Arc::new(MarketDataCache::new(exchange, config));
        let allocator = Arc::new(CapitalAllocator::new(
            total_capital,
            false,
            Some(Arc::clone(&store) as Arc<dyn StateStore>),
        ));
        let (scores_tx, scores) = watch::channel(ExternalScores::default());
        let ctx = WorkerContext {
            market,
            allocator,
            store: Some(Arc::clone(&store) as Arc<dyn StateStore>),
            journal: Some(Arc::clone(&store) as Arc<dyn TradeJournal>),
            notifier: Arc::new(LogNotifier),
            scores,
        };
        (ctx, store, scores_tx)
    }
}
