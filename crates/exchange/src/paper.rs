//! Simulated exchange for paper trading and tests.
//!
//! Balances live in memory. Market orders fill at the last known price,
//! resting limit orders fill at their own price once the market crosses them,
//! and every fill pays commission in the quote asset at `fee_rate`.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use spotgrid_core::error::{ExchangeError, ExchangeResult};
use spotgrid_core::events::{
    split_symbol, AccountSnapshot, AssetBalance, Kline, LimitOrder, MarketOrder, OrderAck,
    OrderAmount, OrderFill, OrderStatus, Side, SymbolFilters,
};
use spotgrid_core::traits::ExchangeClient;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone)]
struct RestingOrder {
    symbol: String,
    side: Side,
    price: Decimal,
    quantity: Decimal,
    status: OrderStatus,
}

#[derive(Debug, Default)]
struct Book {
    prices: HashMap<String, Decimal>,
    free: HashMap<String, Decimal>,
    locked: HashMap<String, Decimal>,
    orders: HashMap<String, RestingOrder>,
    commissions: HashMap<String, Decimal>,
    klines: HashMap<String, Vec<Kline>>,
    filters: HashMap<String, SymbolFilters>,
    next_id: u64,
}

impl Book {
    fn free(&self, asset: &str) -> Decimal {
        self.free.get(asset).copied().unwrap_or_default()
    }

    fn credit(&mut self, asset: &str, amount: Decimal) {
        *self.free.entry(asset.to_string()).or_default() += amount;
    }

    fn debit(&mut self, asset: &str, amount: Decimal) -> ExchangeResult<()> {
        let free = self.free(asset);
        if free < amount {
            return Err(ExchangeError::InsufficientFunds(format!(
                "{asset}: need {amount}, have {free}"
            )));
        }
        self.free.insert(asset.to_string(), free - amount);
        Ok(())
    }

    fn lock(&mut self, asset: &str, amount: Decimal) -> ExchangeResult<()> {
        self.debit(asset, amount)?;
        *self.locked.entry(asset.to_string()).or_default() += amount;
        Ok(())
    }

    fn release(&mut self, asset: &str, amount: Decimal) {
        if let Some(locked) = self.locked.get_mut(asset) {
            *locked = (*locked - amount).max(Decimal::ZERO);
        }
    }

    fn next_order_id(&mut self) -> String {
        self.next_id += 1;
        format!("paper-{}", self.next_id)
    }

    /// Fills resting orders crossed by `price`. Returns the filled order ids.
    fn match_orders(&mut self, symbol: &str, price: Decimal, fee_rate: Decimal) -> Vec<String> {
        let crossed: Vec<String> = self
            .orders
            .iter()
            .filter(|(_, o)| o.symbol == symbol && o.status == OrderStatus::Open)
            .filter(|(_, o)| match o.side {
                Side::Buy => price <= o.price,
                Side::Sell => price >= o.price,
            })
            .map(|(id, _)| id.clone())
            .collect();

        let (base, quote) = split_symbol(symbol);
        for id in &crossed {
            let Some(order) = self.orders.get_mut(id) else {
                continue;
            };
            order.status = OrderStatus::Filled;
            let (side, qty, value) = (order.side, order.quantity, order.price * order.quantity);
            let fee = value * fee_rate;
            match side {
                Side::Buy => {
                    self.release(&quote, value);
                    self.credit(&base, qty);
                    // fee taken from free quote where possible
                    let paid = fee.min(self.free(&quote));
                    self.credit(&quote, -paid);
                }
                Side::Sell => {
                    self.release(&base, qty);
                    self.credit(&quote, value - fee);
                }
            }
            self.commissions.insert(id.clone(), fee);
            tracing::debug!(order_id = %id, %symbol, %side, %qty, %price, "Paper limit order filled");
        }
        crossed
    }
}

pub struct PaperExchange {
    fee_rate: Decimal,
    upstream: Option<Arc<dyn ExchangeClient>>,
    book: Mutex<Book>,
}

impl std::fmt::Debug for PaperExchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PaperExchange")
            .field("fee_rate", &self.fee_rate)
            .field("upstream", &self.upstream.is_some())
            .finish_non_exhaustive()
    }
}

impl PaperExchange {
    /// Standalone simulator; prices come only from [`PaperExchange::set_price`].
    #[must_use]
    pub fn new(fee_rate: Decimal) -> Self {
        Self {
            fee_rate,
            upstream: None,
            book: Mutex::new(Book::default()),
        }
    }

    /// Simulator that reads market data from a real exchange.
    #[must_use]
    pub fn with_upstream(fee_rate: Decimal, upstream: Arc<dyn ExchangeClient>) -> Self {
        Self {
            upstream: Some(upstream),
            ..Self::new(fee_rate)
        }
    }

    pub fn deposit(&self, asset: &str, amount: Decimal) {
        self.book.lock().credit(asset, amount);
    }

    #[must_use]
    pub fn free_balance(&self, asset: &str) -> Decimal {
        self.book.lock().free(asset)
    }

    /// Moves the market and fills any crossed resting orders.
    pub fn set_price(&self, symbol: &str, price: Decimal) -> Vec<String> {
        let mut book = self.book.lock();
        book.prices.insert(symbol.to_string(), price);
        book.match_orders(symbol, price, self.fee_rate)
    }

    pub fn set_klines(&self, symbol: &str, klines: Vec<Kline>) {
        self.book.lock().klines.insert(symbol.to_string(), klines);
    }

    pub fn set_filters(&self, symbol: &str, filters: SymbolFilters) {
        self.book.lock().filters.insert(symbol.to_string(), filters);
    }

    #[must_use]
    pub fn open_orders(&self, symbol: &str) -> usize {
        self.book
            .lock()
            .orders
            .values()
            .filter(|o| o.symbol == symbol && o.status == OrderStatus::Open)
            .count()
    }

    fn last_price(&self, symbol: &str) -> Option<Decimal> {
        self.book.lock().prices.get(symbol).copied()
    }
}

#[async_trait]
impl ExchangeClient for PaperExchange {
    async fn get_price(&self, symbol: &str) -> ExchangeResult<Decimal> {
        if let Some(upstream) = &self.upstream {
            let price = upstream.get_price(symbol).await?;
            self.set_price(symbol, price);
            return Ok(price);
        }
        self.last_price(symbol)
            .ok_or_else(|| ExchangeError::UnknownSymbol(symbol.to_string()))
    }

    async fn get_klines(&self, symbol: &str, interval: &str, limit: usize) -> ExchangeResult<Vec<Kline>> {
        if let Some(upstream) = &self.upstream {
            return upstream.get_klines(symbol, interval, limit).await;
        }
        let book = self.book.lock();
        let klines = book.klines.get(symbol).cloned().unwrap_or_default();
        let skip = klines.len().saturating_sub(limit);
        Ok(klines.into_iter().skip(skip).collect())
    }

    async fn get_account(&self) -> ExchangeResult<AccountSnapshot> {
        let book = self.book.lock();
        let mut assets: Vec<&String> = book.free.keys().chain(book.locked.keys()).collect();
        assets.sort();
        assets.dedup();
        let balances = assets
            .into_iter()
            .map(|asset| AssetBalance {
                asset: asset.clone(),
                free: book.free(asset),
                locked: book.locked.get(asset).copied().unwrap_or_default(),
            })
            .collect();
        Ok(AccountSnapshot {
            balances,
            fetched_at: Utc::now(),
        })
    }

    async fn symbol_filters(&self, symbol: &str) -> ExchangeResult<SymbolFilters> {
        let cached = self.book.lock().filters.get(symbol).copied();
        if let Some(filters) = cached {
            return Ok(filters);
        }
        if let Some(upstream) = &self.upstream {
            return upstream.symbol_filters(symbol).await;
        }
        Ok(SymbolFilters::default())
    }

    async fn submit_market_order(&self, order: &MarketOrder) -> ExchangeResult<OrderFill> {
        let price = self.get_price(&order.symbol).await?;
        if price <= Decimal::ZERO {
            return Err(ExchangeError::OrderRejected("no market price".to_string()));
        }
        let (base, quote) = split_symbol(&order.symbol);
        let (qty, value) = match order.amount {
            OrderAmount::Quote(q) => (q / price, q),
            OrderAmount::Base(b) => (b, b * price),
        };
        if qty <= Decimal::ZERO {
            return Err(ExchangeError::OrderRejected("zero quantity".to_string()));
        }
        let fee = value * self.fee_rate;

        let mut book = self.book.lock();
        match order.side {
            Side::Buy => {
                book.debit(&quote, value + fee)?;
                book.credit(&base, qty);
            }
            Side::Sell => {
                book.debit(&base, qty)?;
                book.credit(&quote, value - fee);
            }
        }
        let order_id = book.next_order_id();
        book.commissions.insert(order_id.clone(), fee);
        drop(book);

        tracing::info!(
            symbol = %order.symbol,
            side = %order.side,
            %qty,
            %price,
            "Paper market order filled"
        );
        Ok(OrderFill::new(order_id, order.symbol.clone(), order.side, qty, value, fee))
    }

    async fn submit_limit_order(&self, order: &LimitOrder) -> ExchangeResult<OrderAck> {
        if order.quantity <= Decimal::ZERO || order.price <= Decimal::ZERO {
            return Err(ExchangeError::OrderRejected("non-positive price or quantity".to_string()));
        }
        let (base, quote) = split_symbol(&order.symbol);
        let mut book = self.book.lock();
        match order.side {
            Side::Buy => book.lock(&quote, order.price * order.quantity)?,
            Side::Sell => book.lock(&base, order.quantity)?,
        }
        let order_id = book.next_order_id();
        book.orders.insert(
            order_id.clone(),
            RestingOrder {
                symbol: order.symbol.clone(),
                side: order.side,
                price: order.price,
                quantity: order.quantity,
                status: OrderStatus::Open,
            },
        );
        if let Some(price) = book.prices.get(&order.symbol).copied() {
            book.match_orders(&order.symbol, price, self.fee_rate);
        }
        let status = book
            .orders
            .get(&order_id)
            .map_or(OrderStatus::Open, |o| o.status);
        Ok(OrderAck {
            order_id,
            symbol: order.symbol.clone(),
            status,
        })
    }

    async fn cancel_order(&self, _symbol: &str, order_id: &str) -> ExchangeResult<()> {
        let mut book = self.book.lock();
        let order = book
            .orders
            .get(order_id)
            .cloned()
            .ok_or_else(|| ExchangeError::OrderNotFound {
                order_id: order_id.to_string(),
            })?;
        if order.status != OrderStatus::Open {
            return Ok(());
        }
        let (base, quote) = split_symbol(&order.symbol);
        match order.side {
            Side::Buy => {
                let value = order.price * order.quantity;
                book.release(&quote, value);
                book.credit(&quote, value);
            }
            Side::Sell => {
                book.release(&base, order.quantity);
                book.credit(&base, order.quantity);
            }
        }
        if let Some(o) = book.orders.get_mut(order_id) {
            o.status = OrderStatus::Cancelled;
        }
        Ok(())
    }

    async fn get_order_status(&self, _symbol: &str, order_id: &str) -> ExchangeResult<OrderStatus> {
        self.book
            .lock()
            .orders
            .get(order_id)
            .map(|o| o.status)
            .ok_or_else(|| ExchangeError::OrderNotFound {
                order_id: order_id.to_string(),
            })
    }

    async fn order_commission(&self, _symbol: &str, order_id: &str) -> ExchangeResult<Option<Decimal>> {
        Ok(self.book.lock().commissions.get(order_id).copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn funded() -> PaperExchange {
        let exchange = PaperExchange::new(dec!(0.001));
        exchange.deposit("USDT", dec!(1000));
        exchange.set_price("ETHUSDT", dec!(3000));
        exchange
    }

    fn market(side: Side, amount: OrderAmount) -> MarketOrder {
        MarketOrder {
            symbol: "ETHUSDT".to_string(),
            side,
            amount,
        }
    }

    #[tokio::test]
    async fn market_round_trip_pays_fees() {
        let exchange = funded();
        let buy = exchange
            .submit_market_order(&market(Side::Buy, OrderAmount::Quote(dec!(300))))
            .await
            .unwrap();
        assert_eq!(buy.executed_qty, dec!(0.1));
        assert_eq!(buy.commission, dec!(0.3));
        assert_eq!(exchange.free_balance("USDT"), dec!(699.7));

        exchange.set_price("ETHUSDT", dec!(3100));
        let sell = exchange
            .submit_market_order(&market(Side::Sell, OrderAmount::Base(dec!(0.1))))
            .await
            .unwrap();
        assert_eq!(sell.cumulative_quote, dec!(310));
        assert_eq!(exchange.free_balance("USDT"), dec!(1009.39));
        assert_eq!(exchange.free_balance("ETH"), Decimal::ZERO);
    }

    #[tokio::test]
    async fn market_buy_beyond_balance_fails() {
        let exchange = funded();
        let err = exchange
            .submit_market_order(&market(Side::Buy, OrderAmount::Quote(dec!(1000))))
            .await
            .unwrap_err();
        assert!(err.is_insufficient_funds());
    }

    #[tokio::test]
    async fn limit_buy_fills_when_price_crosses() {
        let exchange = funded();
        let ack = exchange
            .submit_limit_order(&LimitOrder {
                symbol: "ETHUSDT".to_string(),
                side: Side::Buy,
                price: dec!(2900),
                quantity: dec!(0.1),
            })
            .await
            .unwrap();
        assert_eq!(ack.status, OrderStatus::Open);
        assert_eq!(exchange.free_balance("USDT"), dec!(710));

        exchange.set_price("ETHUSDT", dec!(2950));
        assert_eq!(exchange.get_order_status("ETHUSDT", &ack.order_id).await.unwrap(), OrderStatus::Open);

        let filled = exchange.set_price("ETHUSDT", dec!(2899));
        assert_eq!(filled, vec![ack.order_id.clone()]);
        assert_eq!(exchange.free_balance("ETH"), dec!(0.1));
        assert_eq!(
            exchange.order_commission("ETHUSDT", &ack.order_id).await.unwrap(),
            Some(dec!(0.29))
        );
    }

    #[tokio::test]
    async fn cancel_returns_locked_funds() {
        let exchange = funded();
        let ack = exchange
            .submit_limit_order(&LimitOrder {
                symbol: "ETHUSDT".to_string(),
                side: Side::Buy,
                price: dec!(2900),
                quantity: dec!(0.1),
            })
            .await
            .unwrap();
        exchange.cancel_order("ETHUSDT", &ack.order_id).await.unwrap();
        assert_eq!(exchange.free_balance("USDT"), dec!(1000));
        assert_eq!(exchange.open_orders("ETHUSDT"), 0);
        assert!(exchange.cancel_order("ETHUSDT", "missing").await.is_err());
    }

    #[tokio::test]
    async fn account_lists_locked_balances() {
        let exchange = funded();
        exchange
            .submit_limit_order(&LimitOrder {
                symbol: "ETHUSDT".to_string(),
                side: Side::Buy,
                price: dec!(2000),
                quantity: dec!(0.1),
            })
            .await
            .unwrap();
        let account = exchange.get_account().await.unwrap();
        assert_eq!(account.free("USDT"), dec!(800));
        assert_eq!(account.total("USDT"), dec!(1000));
    }
}
