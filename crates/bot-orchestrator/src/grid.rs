//! Grid ladder arithmetic. Pure functions; the grid worker owns all I/O.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::Serialize;
use spotgrid_core::config::GridWorkerConfig;
use spotgrid_core::events::{Kline, Side, SymbolFilters};
use spotgrid_core::indicators::relative_volatility;
use spotgrid_core::precision::round_step;
use spotgrid_core::state::{GridOrder, GridWorkerState};

/// Hourly klines used by auto-range.
pub const AUTO_RANGE_INTERVAL: &str = "1h";
pub const AUTO_RANGE_KLINES: usize = 24;
const AUTO_RANGE_ATR_PERIOD: usize = 14;
/// Per-level order value auto-range keeps above the exchange minimum.
const AUTO_RANGE_MIN_LEVEL_VALUE: u32 = 11;

/// `levels + 1` evenly spaced prices from `lower` to `upper`, each rounded
/// down to `tick`.
#[must_use]
pub fn calculate_grid_levels(lower: Decimal, upper: Decimal, levels: u32, tick: Decimal) -> Vec<Decimal> {
    if levels == 0 || upper <= lower {
        return Vec::new();
    }
    let step = (upper - lower) / Decimal::from(levels);
    (0..=levels)
        .map(|i| round_step(lower + step * Decimal::from(i), tick))
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GridParams {
    pub buffer_pct: Decimal,
    pub min_profitable_order: Decimal,
    pub min_notional: Decimal,
}

impl From<&GridWorkerConfig> for GridParams {
    fn from(config: &GridWorkerConfig) -> Self {
        Self {
            buffer_pct: config.buffer_pct,
            min_profitable_order: config.min_profitable_order,
            min_notional: config.min_notional,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlannedOrder {
    pub side: Side,
    pub price: Decimal,
    pub quantity: Decimal,
}

/// Lays out the initial ladder around `price`.
///
/// Levels inside the buffer are skipped. Buy levels are dropped from the
/// bottom until each buy is worth at least `min_profitable_order`; quote is
/// split evenly across the remaining buys and base across the sells.
#[must_use]
pub fn plan_orders(
    levels: &[Decimal],
    price: Decimal,
    quote: Decimal,
    base: Decimal,
    params: &GridParams,
    filters: &SymbolFilters,
) -> Vec<PlannedOrder> {
    let buy_below = price * (Decimal::ONE - params.buffer_pct);
    let sell_above = price * (Decimal::ONE + params.buffer_pct);

    let mut buys: Vec<Decimal> = levels.iter().copied().filter(|l| *l < buy_below).collect();
    let sells: Vec<Decimal> = levels.iter().copied().filter(|l| *l > sell_above).collect();

    while !buys.is_empty() && quote / Decimal::from(buys.len()) < params.min_profitable_order {
        buys.remove(0);
    }
    if buys.is_empty() {
        tracing::warn!(%quote, "No buy levels placed, insufficient quote for a profitable grid");
    }

    let min_notional = params.min_notional.max(filters.min_notional);
    let mut planned = Vec::with_capacity(buys.len() + sells.len());

    if !buys.is_empty() {
        let per_buy = quote / Decimal::from(buys.len());
        for level in buys {
            let quantity = filters.round_qty(per_buy / level);
            if quantity * level < min_notional {
                tracing::debug!(price = %level, %quantity, "Skipping buy level below minimum notional");
                continue;
            }
            planned.push(PlannedOrder {
                side: Side::Buy,
                price: level,
                quantity,
            });
        }
    }

    if !sells.is_empty() {
        let per_sell = filters.round_qty(base / Decimal::from(sells.len()));
        for level in sells {
            if per_sell * level < min_notional {
                tracing::debug!(price = %level, quantity = %per_sell, "Skipping sell level below minimum notional");
                continue;
            }
            planned.push(PlannedOrder {
                side: Side::Sell,
                price: level,
                quantity: per_sell,
            });
        }
    }

    planned
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct GridRange {
    pub lower: Decimal,
    pub upper: Decimal,
    pub levels: u32,
    pub volatility: Option<Decimal>,
    /// Half-width of the range as a fraction of price.
    pub range_pct: Decimal,
}

/// Picks bounds and a level count from recent hourly volatility, then caps
/// the level count so every level can hold a minimum-size order.
#[must_use]
pub fn auto_range(klines: &[Kline], price: Decimal, capital: Decimal) -> GridRange {
    let volatility = relative_volatility(klines, AUTO_RANGE_ATR_PERIOD);
    let (range_pct, recommended) = match volatility.map(|v| v * Decimal::ONE_HUNDRED) {
        Some(pct) if pct < Decimal::TWO => (Decimal::new(3, 2), 15u32),
        Some(pct) if pct > Decimal::from(4) => (Decimal::new(8, 2), 8),
        _ => (Decimal::new(5, 2), 10),
    };

    let max_levels = (capital / Decimal::from(AUTO_RANGE_MIN_LEVEL_VALUE))
        .floor()
        .max(Decimal::TWO);
    let levels = if Decimal::from(recommended) > max_levels {
        tracing::warn!(recommended, %max_levels, %capital, "Clamping grid levels to capital");
        max_levels.to_u32().unwrap_or(2).max(2)
    } else {
        recommended
    };

    let width = price * range_pct;
    GridRange {
        lower: (price - width).round_dp(2),
        upper: (price + width).round_dp(2),
        levels,
        volatility,
        range_pct,
    }
}

/// True when `price` has left `[lower, upper]` by more than `threshold`.
#[must_use]
pub fn is_breakout(lower: Decimal, upper: Decimal, price: Decimal, threshold: Decimal) -> bool {
    price < lower * (Decimal::ONE - threshold) || price > upper * (Decimal::ONE + threshold)
}

/// Same relative spread, centered on `price`.
#[must_use]
pub fn recenter(lower: Decimal, upper: Decimal, price: Decimal) -> (Decimal, Decimal) {
    if lower <= Decimal::ZERO {
        return (lower, upper);
    }
    let half = (upper - lower) / lower / Decimal::TWO;
    (price * (Decimal::ONE - half), price * (Decimal::ONE + half))
}

/// Price of the replacement order one step away from `filled`, or `None`
/// when it would land outside `[lower × 0.99, upper × 1.01]`.
#[must_use]
pub fn counter_price(
    filled: &GridOrder,
    step: Decimal,
    lower: Decimal,
    upper: Decimal,
    filters: &SymbolFilters,
) -> Option<(Side, Decimal)> {
    let side = filled.side.opposite();
    let raw = match side {
        Side::Sell => filled.price + step,
        Side::Buy => filled.price - step,
    };
    let price = filters.round_price(raw);
    let floor = lower * Decimal::new(99, 2);
    let ceiling = upper * Decimal::new(101, 2);
    (price >= floor && price <= ceiling && price > Decimal::ZERO).then_some((side, price))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GridPerformance {
    pub total_fills: u64,
    pub buy_fills: u64,
    pub sell_fills: u64,
    /// Sell fills over all fills; every completed cycle is a win.
    pub win_rate: Decimal,
    pub net_profit: Decimal,
    pub total_fees: Decimal,
    pub return_pct: Decimal,
    pub rebalances: u64,
}

impl GridPerformance {
    #[must_use]
    pub fn of(state: &GridWorkerState) -> Self {
        let total_fills = state.buy_fills + state.sell_fills;
        let win_rate = if total_fills == 0 {
            Decimal::ZERO
        } else {
            Decimal::from(state.sell_fills) / Decimal::from(total_fills)
        };
        let return_pct = if state.capital.is_zero() {
            Decimal::ZERO
        } else {
            state.total_profit / state.capital * Decimal::ONE_HUNDRED
        };
        Self {
            total_fills,
            buy_fills: state.buy_fills,
            sell_fills: state.sell_fills,
            win_rate,
            net_profit: state.total_profit,
            total_fees: state.total_fees,
            return_pct,
            rebalances: state.rebalance_count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal_macros::dec;
    use spotgrid_core::events::{OrderStatus, TradeMode};

    fn params() -> GridParams {
        GridParams::from(&GridWorkerConfig::new("ETHUSDT", TradeMode::Paper))
    }

    fn ladder() -> Vec<Decimal> {
        calculate_grid_levels(dec!(2800), dec!(3200), 4, dec!(0.01))
    }

    #[test]
    fn four_levels_give_five_points() {
        assert_eq!(
            ladder(),
            vec![dec!(2800), dec!(2900), dec!(3000), dec!(3100), dec!(3200)]
        );
        assert!(calculate_grid_levels(dec!(10), dec!(5), 4, dec!(0.01)).is_empty());
    }

    #[test]
    fn levels_are_rounded_down_to_tick() {
        let levels = calculate_grid_levels(dec!(100), dec!(101), 3, dec!(0.01));
        assert_eq!(levels, vec![dec!(100), dec!(100.33), dec!(100.66), dec!(101)]);
    }

    #[test]
    fn plan_skips_buffer_and_splits_funds() {
        let orders = plan_orders(&ladder(), dec!(3000), dec!(100), dec!(0.02), &params(), &SymbolFilters::default());
        let buys: Vec<_> = orders.iter().filter(|o| o.side == Side::Buy).collect();
        let sells: Vec<_> = orders.iter().filter(|o| o.side == Side::Sell).collect();

        assert_eq!(buys.len(), 2);
        assert_eq!(buys[0].price, dec!(2800));
        assert_eq!(buys[0].quantity, dec!(0.0178));
        assert_eq!(sells.len(), 2);
        assert!(sells.iter().all(|o| o.quantity == dec!(0.01)));
        assert!(orders.iter().all(|o| o.price != dec!(3000)));
    }

    #[test]
    fn thin_quote_drops_lowest_buys() {
        let orders = plan_orders(&ladder(), dec!(3000), dec!(25), Decimal::ZERO, &params(), &SymbolFilters::default());
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].price, dec!(2900));

        let none = plan_orders(&ladder(), dec!(3000), dec!(10), Decimal::ZERO, &params(), &SymbolFilters::default());
        assert!(none.is_empty());
    }

    fn flat_klines(close: Decimal, half_range: Decimal) -> Vec<Kline> {
        (0..AUTO_RANGE_KLINES)
            .map(|_| Kline {
                open_time: Utc::now(),
                open: close,
                high: close + half_range,
                low: close - half_range,
                close,
                volume: Decimal::ONE,
            })
            .collect()
    }

    #[test]
    fn auto_range_bands() {
        // 23 true ranges of 1 over period 14 on a close of 100: about 1.6%
        let low = auto_range(&flat_klines(dec!(100), dec!(0.5)), dec!(100), dec!(1000));
        assert_eq!(low.range_pct, dec!(0.03));
        assert_eq!(low.levels, 15);
        assert_eq!((low.lower, low.upper), (dec!(97), dec!(103)));

        let high = auto_range(&flat_klines(dec!(100), dec!(2)), dec!(100), dec!(1000));
        assert_eq!(high.range_pct, dec!(0.08));
        assert_eq!(high.levels, 8);

        let unknown = auto_range(&[], dec!(100), dec!(1000));
        assert_eq!(unknown.range_pct, dec!(0.05));
        assert_eq!(unknown.levels, 10);
    }

    #[test]
    fn auto_range_clamps_levels_to_capital() {
        let range = auto_range(&flat_klines(dec!(100), dec!(0.5)), dec!(100), dec!(100));
        assert_eq!(range.levels, 9);
        let tiny = auto_range(&[], dec!(100), dec!(5));
        assert_eq!(tiny.levels, 2);
    }

    #[test]
    fn recenter_keeps_relative_spread() {
        let (lower, upper) = recenter(dec!(2800), dec!(3200), dec!(3500));
        let half = dec!(400) / dec!(2800) / dec!(2);
        assert_eq!(lower, dec!(3500) * (Decimal::ONE - half));
        assert_eq!(upper, dec!(3500) * (Decimal::ONE + half));
        assert!(is_breakout(dec!(2800), dec!(3200), dec!(3500), dec!(0.005)));
        assert!(!is_breakout(dec!(2800), dec!(3200), dec!(3210), dec!(0.005)));
    }

    #[test]
    fn counter_order_stays_near_bounds() {
        let filled = GridOrder {
            price: dec!(2900),
            side: Side::Buy,
            quantity: dec!(0.01),
            order_id: Some("1".to_string()),
            status: OrderStatus::Filled,
            created_at: Utc::now(),
            filled_at: Some(Utc::now()),
            profit: Decimal::ZERO,
            fee: Decimal::ZERO,
        };
        let filters = SymbolFilters::default();
        assert_eq!(
            counter_price(&filled, dec!(100), dec!(2800), dec!(3200), &filters),
            Some((Side::Sell, dec!(3000)))
        );

        let top = GridOrder {
            price: dec!(3200),
            ..filled.clone()
        };
        assert_eq!(counter_price(&top, dec!(100), dec!(2800), dec!(3200), &filters), None);

        let bottom = GridOrder {
            price: dec!(2800),
            side: Side::Sell,
            ..filled
        };
        assert_eq!(counter_price(&bottom, dec!(100), dec!(2800), dec!(3200), &filters), None);
    }

    #[test]
    fn performance_counts_sells_as_wins() {
        let mut state = GridWorkerState::new(
            GridWorkerConfig::new("ETHUSDT", TradeMode::Paper),
            dec!(2800),
            dec!(3200),
            4,
        );
        state.buy_fills = 3;
        state.sell_fills = 1;
        state.total_profit = dec!(5);
        let perf = GridPerformance::of(&state);
        assert_eq!(perf.total_fills, 4);
        assert_eq!(perf.win_rate, dec!(0.25));
        assert_eq!(perf.return_pct, dec!(5));
    }
}
