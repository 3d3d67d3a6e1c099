//! Where a worker's orders go.
//!
//! Live workers share the process exchange client. Paper workers each own a
//! simulator that reads prices from the shared client, so simulated balances
//! never leak between workers.

use rust_decimal::Decimal;
use spotgrid_core::error::{ExchangeError, ExecutionOutcome};
use spotgrid_core::events::{AccountSnapshot, MarketOrder, TradeMode};
use spotgrid_core::traits::ExchangeClient;
use spotgrid_exchange::{MarketDataCache, PaperExchange};
use std::sync::Arc;

#[derive(Clone)]
pub enum OrderVenue {
    Live(Arc<dyn ExchangeClient>),
    Paper(Arc<PaperExchange>),
}

impl std::fmt::Debug for OrderVenue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Live(_) => f.write_str("OrderVenue::Live"),
            Self::Paper(paper) => f.debug_tuple("OrderVenue::Paper").field(paper).finish(),
        }
    }
}

impl OrderVenue {
    #[must_use]
    pub fn for_mode(mode: TradeMode, market: &MarketDataCache, fee_rate: Decimal) -> Self {
        match mode {
            TradeMode::Live => Self::Live(market.exchange()),
            TradeMode::Paper => Self::Paper(Arc::new(PaperExchange::with_upstream(
                fee_rate,
                market.exchange(),
            ))),
        }
    }

    #[must_use]
    pub fn client(&self) -> Arc<dyn ExchangeClient> {
        match self {
            Self::Live(client) => Arc::clone(client),
            Self::Paper(paper) => Arc::clone(paper) as Arc<dyn ExchangeClient>,
        }
    }

    #[must_use]
    pub fn paper(&self) -> Option<&Arc<PaperExchange>> {
        match self {
            Self::Live(_) => None,
            Self::Paper(paper) => Some(paper),
        }
    }

    #[must_use]
    pub const fn is_live(&self) -> bool {
        matches!(self, Self::Live(_))
    }

    /// Feeds the latest price to the simulator, filling crossed limit orders.
    /// Returns the filled order ids; always empty for live venues.
    pub fn mark(&self, symbol: &str, price: Decimal) -> Vec<String> {
        match self {
            Self::Live(_) => Vec::new(),
            Self::Paper(paper) => paper.set_price(symbol, price),
        }
    }

    /// Balances the worker trades against: the cached exchange account when
    /// live, the simulator's book when paper.
    ///
    /// # Errors
    /// Propagates the exchange error.
    pub async fn account(&self, market: &MarketDataCache) -> Result<AccountSnapshot, ExchangeError> {
        match self {
            Self::Live(_) => market.account(false).await,
            Self::Paper(paper) => paper.get_account().await,
        }
    }

    /// Submits a market order and classifies the result.
    ///
    /// Every submission invalidates the cached account, filled or not.
    pub async fn market_order(&self, order: &MarketOrder, market: &MarketDataCache) -> ExecutionOutcome {
        let result = self.client().submit_market_order(order).await;
        market.invalidate_account();
        match result {
            Ok(fill) => ExecutionOutcome::Filled(fill),
            Err(e) if e.is_insufficient_funds() => {
                tracing::warn!(symbol = %order.symbol, side = %order.side, error = %e, "Insufficient funds");
                ExecutionOutcome::InsufficientFunds
            }
            Err(e) => {
                tracing::error!(symbol = %order.symbol, side = %order.side, error = %e, "Order rejected");
                ExecutionOutcome::Rejected(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use spotgrid_core::config::MarketDataConfig;
    use spotgrid_core::events::{OrderAmount, Side};

    fn market(feed: &Arc<PaperExchange>) -> MarketDataCache {
        MarketDataCache::new(
            Arc::clone(feed) as Arc<dyn ExchangeClient>,
            MarketDataConfig::default(),
        )
    }

    #[tokio::test]
    async fn paper_venues_keep_separate_books() {
        let feed = Arc::new(PaperExchange::new(dec!(0.001)));
        feed.set_price("ETHUSDT", dec!(2000));
        let market = market(&feed);

        let a = OrderVenue::for_mode(TradeMode::Paper, &market, dec!(0.001));
        let b = OrderVenue::for_mode(TradeMode::Paper, &market, dec!(0.001));
        a.paper().unwrap().deposit("USDT", dec!(500));

        let order = MarketOrder {
            symbol: "ETHUSDT".to_string(),
            side: Side::Buy,
            amount: OrderAmount::Quote(dec!(100)),
        };
        let fill = a.market_order(&order, &market).await.fill().cloned().unwrap();
        assert_eq!(fill.executed_qty, dec!(0.05));
        assert!(matches!(
            b.market_order(&order, &market).await,
            ExecutionOutcome::InsufficientFunds
        ));

        let account = a.account(&market).await.unwrap();
        assert_eq!(account.free("ETH"), dec!(0.05));
        assert_eq!(account.free("USDT"), dec!(399.9));
    }

    #[tokio::test]
    async fn live_venue_ignores_marks() {
        let feed = Arc::new(PaperExchange::new(dec!(0.001)));
        let market = market(&feed);
        let venue = OrderVenue::for_mode(TradeMode::Live, &market, dec!(0.001));
        assert!(venue.is_live());
        assert!(venue.paper().is_none());
        assert!(venue.mark("ETHUSDT", dec!(1)).is_empty());
    }
}
