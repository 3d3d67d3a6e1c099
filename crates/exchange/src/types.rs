//! Wire formats of the spot REST API and their conversion into core types.

use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use spotgrid_core::error::{ExchangeError, ExchangeResult};
use spotgrid_core::events::{
    AccountSnapshot, AssetBalance, Kline, OrderStatus, SymbolFilters,
};

#[derive(Debug, Deserialize)]
pub(crate) struct ApiErrorBody {
    pub code: i64,
    pub msg: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct TickerPrice {
    pub price: Decimal,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ServerTime {
    #[serde(rename = "serverTime")]
    pub server_time: i64,
}

#[derive(Debug, Deserialize)]
pub(crate) struct RawBalance {
    pub asset: String,
    pub free: Decimal,
    pub locked: Decimal,
}

#[derive(Debug, Deserialize)]
pub(crate) struct RawAccount {
    pub balances: Vec<RawBalance>,
}

impl From<RawAccount> for AccountSnapshot {
    fn from(raw: RawAccount) -> Self {
        Self {
            balances: raw
                .balances
                .into_iter()
                .filter(|b| !b.free.is_zero() || !b.locked.is_zero())
                .map(|b| AssetBalance {
                    asset: b.asset,
                    free: b.free,
                    locked: b.locked,
                })
                .collect(),
            fetched_at: Utc::now(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct RawFill {
    pub price: Decimal,
    pub commission: Decimal,
    #[serde(rename = "commissionAsset")]
    pub commission_asset: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct RawOrder {
    #[serde(rename = "orderId")]
    pub order_id: i64,
    pub status: String,
    #[serde(rename = "executedQty", default)]
    pub executed_qty: Decimal,
    #[serde(rename = "cummulativeQuoteQty", default)]
    pub cumulative_quote: Decimal,
    #[serde(default)]
    pub fills: Vec<RawFill>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct RawOrderStatus {
    pub status: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct RawTrade {
    pub price: Decimal,
    pub commission: Decimal,
    #[serde(rename = "commissionAsset")]
    pub commission_asset: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ExchangeInfo {
    pub symbols: Vec<RawSymbol>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct RawSymbol {
    pub symbol: String,
    pub filters: Vec<serde_json::Value>,
}

impl RawSymbol {
    /// Reads tick size, step size and minimum notional; missing filters keep defaults.
    pub fn filters(&self) -> SymbolFilters {
        let mut filters = SymbolFilters::default();
        for filter in &self.filters {
            let field = |name: &str| {
                filter
                    .get(name)
                    .and_then(serde_json::Value::as_str)
                    .and_then(|s| s.parse::<Decimal>().ok())
            };
            match filter.get("filterType").and_then(serde_json::Value::as_str) {
                Some("PRICE_FILTER") => {
                    if let Some(tick) = field("tickSize") {
                        filters.tick_size = tick.normalize();
                    }
                }
                Some("LOT_SIZE") => {
                    if let Some(step) = field("stepSize") {
                        filters.step_size = step.normalize();
                    }
                }
                Some("NOTIONAL" | "MIN_NOTIONAL") => {
                    if let Some(min) = field("minNotional") {
                        filters.min_notional = min.normalize();
                    }
                }
                _ => {}
            }
        }
        filters
    }
}

/// Maps an exchange order status onto the three lifecycle states.
pub(crate) fn parse_status(status: &str) -> OrderStatus {
    match status {
        "FILLED" => OrderStatus::Filled,
        "CANCELED" | "CANCELLED" | "EXPIRED" | "REJECTED" | "EXPIRED_IN_MATCH" => {
            OrderStatus::Cancelled
        }
        _ => OrderStatus::Open,
    }
}

/// Converts commissions to the quote asset. Fees paid in a third asset are
/// left out.
pub(crate) fn commission_in_quote<'a>(
    fills: impl IntoIterator<Item = (Decimal, Decimal, &'a str)>,
    base: &str,
    quote: &str,
) -> Decimal {
    fills
        .into_iter()
        .map(|(price, commission, asset)| {
            if asset == quote {
                commission
            } else if asset == base {
                commission * price
            } else {
                tracing::debug!(%asset, %commission, "Commission paid in third asset");
                Decimal::ZERO
            }
        })
        .sum()
}

/// Parses one kline row: `[open_time_ms, open, high, low, close, volume, ...]`.
pub(crate) fn parse_kline(row: &[serde_json::Value]) -> ExchangeResult<Kline> {
    let decimal = |idx: usize| -> ExchangeResult<Decimal> {
        row.get(idx)
            .and_then(serde_json::Value::as_str)
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| ExchangeError::Decode(format!("kline field {idx} missing")))
    };
    let open_ms = row
        .first()
        .and_then(serde_json::Value::as_i64)
        .ok_or_else(|| ExchangeError::Decode("kline open time missing".to_string()))?;
    Ok(Kline {
        open_time: millis_to_utc(open_ms)?,
        open: decimal(1)?,
        high: decimal(2)?,
        low: decimal(3)?,
        close: decimal(4)?,
        volume: decimal(5)?,
    })
}

pub(crate) fn millis_to_utc(millis: i64) -> ExchangeResult<DateTime<Utc>> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .ok_or_else(|| ExchangeError::Decode(format!("invalid timestamp {millis}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn symbol_filters_are_read() {
        let raw: RawSymbol = serde_json::from_value(serde_json::json!({
            "symbol": "ETHUSDT",
            "filters": [
                {"filterType": "PRICE_FILTER", "tickSize": "0.01000000"},
                {"filterType": "LOT_SIZE", "stepSize": "0.00010000"},
                {"filterType": "NOTIONAL", "minNotional": "5.00000000"}
            ]
        }))
        .unwrap();
        let filters = raw.filters();
        assert_eq!(filters.tick_size, dec!(0.01));
        assert_eq!(filters.step_size, dec!(0.0001));
        assert_eq!(filters.min_notional, dec!(5));
    }

    #[test]
    fn statuses_collapse() {
        assert_eq!(parse_status("NEW"), OrderStatus::Open);
        assert_eq!(parse_status("PARTIALLY_FILLED"), OrderStatus::Open);
        assert_eq!(parse_status("FILLED"), OrderStatus::Filled);
        assert_eq!(parse_status("EXPIRED"), OrderStatus::Cancelled);
    }

    #[test]
    fn commissions_convert_to_quote() {
        let fills = vec![
            (dec!(3000), dec!(0.0001), "ETH"),
            (dec!(3000), dec!(0.3), "USDT"),
            (dec!(3000), dec!(0.01), "BNB"),
        ];
        assert_eq!(commission_in_quote(fills, "ETH", "USDT"), dec!(0.6));
    }

    #[test]
    fn kline_rows_parse() {
        let row = serde_json::json!([1_700_000_000_000_i64, "1.0", "2.0", "0.5", "1.5", "100", 0]);
        let kline = parse_kline(row.as_array().unwrap()).unwrap();
        assert_eq!(kline.close, dec!(1.5));
        assert_eq!(kline.open_time.timestamp_millis(), 1_700_000_000_000);
    }
}
