use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Whether a worker trades real funds or simulated balances.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum TradeMode {
    Live,
    #[default]
    Paper,
}

impl TradeMode {
    #[must_use]
    pub const fn is_live(self) -> bool {
        matches!(self, Self::Live)
    }
}

impl fmt::Display for TradeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Live => write!(f, "live"),
            Self::Paper => write!(f, "paper"),
        }
    }
}

impl std::str::FromStr for TradeMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "live" => Ok(Self::Live),
            "paper" => Ok(Self::Paper),
            other => Err(format!("unknown trade mode: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    #[must_use]
    pub const fn opposite(self) -> Self {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Buy => "BUY",
            Self::Sell => "SELL",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Side {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "BUY" => Ok(Self::Buy),
            "SELL" => Ok(Self::Sell),
            other => Err(format!("unknown side: {other}")),
        }
    }
}

/// Lifecycle of a resting order. Exchange states such as partially filled or
/// expired collapse onto these three.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderStatus {
    Open,
    Filled,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Kline {
    pub open_time: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetBalance {
    pub asset: String,
    pub free: Decimal,
    pub locked: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountSnapshot {
    pub balances: Vec<AssetBalance>,
    pub fetched_at: DateTime<Utc>,
}

impl AccountSnapshot {
    #[must_use]
    pub fn free(&self, asset: &str) -> Decimal {
        self.balances
            .iter()
            .find(|b| b.asset == asset)
            .map_or(Decimal::ZERO, |b| b.free)
    }

    #[must_use]
    pub fn locked(&self, asset: &str) -> Decimal {
        self.balances
            .iter()
            .find(|b| b.asset == asset)
            .map_or(Decimal::ZERO, |b| b.locked)
    }

    #[must_use]
    pub fn total(&self, asset: &str) -> Decimal {
        self.free(asset) + self.locked(asset)
    }
}

/// Per-pair precision constraints published by the exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymbolFilters {
    pub tick_size: Decimal,
    pub step_size: Decimal,
    pub min_notional: Decimal,
}

impl Default for SymbolFilters {
    fn default() -> Self {
        Self {
            tick_size: Decimal::new(1, 2),
            step_size: Decimal::new(1, 4),
            min_notional: Decimal::TEN,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderAmount {
    /// Spend this much of the quote asset.
    Quote(Decimal),
    /// Trade this much of the base asset.
    Base(Decimal),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarketOrder {
    pub symbol: String,
    pub side: Side,
    pub amount: OrderAmount,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitOrder {
    pub symbol: String,
    pub side: Side,
    pub price: Decimal,
    pub quantity: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderAck {
    pub order_id: String,
    pub symbol: String,
    pub status: OrderStatus,
}

/// Confirmed execution of a market order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderFill {
    pub order_id: String,
    pub symbol: String,
    pub side: Side,
    pub executed_qty: Decimal,
    pub cumulative_quote: Decimal,
    pub avg_price: Decimal,
    /// Commission converted to the quote asset.
    pub commission: Decimal,
    pub timestamp: DateTime<Utc>,
}

impl OrderFill {
    /// Builds a fill, deriving the average price from the executed amounts.
    #[must_use]
    pub fn new(
        order_id: String,
        symbol: String,
        side: Side,
        executed_qty: Decimal,
        cumulative_quote: Decimal,
        commission: Decimal,
    ) -> Self {
        let avg_price = if executed_qty.is_zero() {
            Decimal::ZERO
        } else {
            cumulative_quote / executed_qty
        };
        Self {
            order_id,
            symbol,
            side,
            executed_qty,
            cumulative_quote,
            avg_price,
            commission,
            timestamp: Utc::now(),
        }
    }
}

/// Push-style price update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ticker {
    pub symbol: String,
    pub price: Decimal,
    pub volume: Decimal,
    pub timestamp: DateTime<Utc>,
}

/// Splits a pair such as `ETHUSDT` into base and quote assets.
///
/// Known quote assets are matched by suffix; unknown pairs fall back to
/// treating the whole symbol as base with `USDT` quote.
#[must_use]
pub fn split_symbol(symbol: &str) -> (String, String) {
    const QUOTES: [&str; 6] = ["USDT", "USDC", "FDUSD", "BUSD", "USD", "BTC"];
    for quote in QUOTES {
        if let Some(base) = symbol.strip_suffix(quote) {
            if !base.is_empty() {
                return (base.to_string(), quote.to_string());
            }
        }
    }
    (symbol.to_string(), "USDT".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn fill_derives_average_price() {
        let fill = OrderFill::new(
            "1".to_string(),
            "ETHUSDT".to_string(),
            Side::Buy,
            dec!(0.5),
            dec!(1500),
            dec!(1.5),
        );
        assert_eq!(fill.avg_price, dec!(3000));
    }

    #[test]
    fn zero_quantity_fill_has_zero_price() {
        let fill = OrderFill::new(
            "1".to_string(),
            "ETHUSDT".to_string(),
            Side::Sell,
            Decimal::ZERO,
            Decimal::ZERO,
            Decimal::ZERO,
        );
        assert_eq!(fill.avg_price, Decimal::ZERO);
    }

    #[test]
    fn account_totals_include_locked() {
        let account = AccountSnapshot {
            balances: vec![AssetBalance {
                asset: "USDT".to_string(),
                free: dec!(100),
                locked: dec!(25),
            }],
            fetched_at: Utc::now(),
        };
        assert_eq!(account.free("USDT"), dec!(100));
        assert_eq!(account.total("USDT"), dec!(125));
        assert_eq!(account.total("ETH"), Decimal::ZERO);
    }

    #[test]
    fn split_symbol_handles_common_quotes() {
        assert_eq!(split_symbol("ETHUSDT"), ("ETH".to_string(), "USDT".to_string()));
        assert_eq!(split_symbol("SOLUSDC"), ("SOL".to_string(), "USDC".to_string()));
        assert_eq!(split_symbol("ETHBTC"), ("ETH".to_string(), "BTC".to_string()));
    }
}
