//! Pure indicator functions over price, volume and kline series.
//!
//! None of these keep state between calls. Functions that need a minimum
//! amount of data return `None` until it is available.

use crate::events::Kline;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

const HUNDRED: Decimal = Decimal::ONE_HUNDRED;

/// Simple moving average of the last `period` samples.
#[must_use]
pub fn sma(prices: &[Decimal], period: usize) -> Option<Decimal> {
    if period == 0 || prices.len() < period {
        return None;
    }
    let sum: Decimal = prices[prices.len() - period..].iter().sum();
    Some(sum / Decimal::from(period))
}

/// Relative strength index with Wilder smoothing.
///
/// Needs `period + 1` samples. The seed averages are the plain mean of the
/// first `period` gains and losses. A series with no losses reads 100, a flat
/// series reads 50.
#[must_use]
pub fn rsi(prices: &[Decimal], period: usize) -> Option<Decimal> {
    if period == 0 || prices.len() < period + 1 {
        return None;
    }

    let p = Decimal::from(period);
    let mut avg_gain = Decimal::ZERO;
    let mut avg_loss = Decimal::ZERO;

    for window in prices[..=period].windows(2) {
        let change = window[1] - window[0];
        if change > Decimal::ZERO {
            avg_gain += change;
        } else {
            avg_loss -= change;
        }
    }
    avg_gain /= p;
    avg_loss /= p;

    for window in prices[period..].windows(2) {
        let change = window[1] - window[0];
        let (gain, loss) = if change > Decimal::ZERO {
            (change, Decimal::ZERO)
        } else {
            (Decimal::ZERO, -change)
        };
        avg_gain = (avg_gain * (p - Decimal::ONE) + gain) / p;
        avg_loss = (avg_loss * (p - Decimal::ONE) + loss) / p;
    }

    if avg_loss.is_zero() {
        return Some(if avg_gain.is_zero() {
            Decimal::from(50)
        } else {
            HUNDRED
        });
    }

    let rs = avg_gain / avg_loss;
    Some(HUNDRED - HUNDRED / (Decimal::ONE + rs))
}

/// Exponential moving average series seeded with the SMA of the first
/// `period` samples. The result starts at index `period - 1` of the input.
#[must_use]
pub fn ema_series(prices: &[Decimal], period: usize) -> Vec<Decimal> {
    if period == 0 || prices.len() < period {
        return Vec::new();
    }
    let alpha = Decimal::TWO / Decimal::from(period + 1);
    let seed: Decimal = prices[..period].iter().sum::<Decimal>() / Decimal::from(period);

    let mut out = Vec::with_capacity(prices.len() - period + 1);
    out.push(seed);
    let mut prev = seed;
    for price in &prices[period..] {
        prev = (*price - prev) * alpha + prev;
        out.push(prev);
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Macd {
    pub macd: Decimal,
    pub signal: Decimal,
    pub histogram: Decimal,
}

/// MACD line, signal line and histogram for the latest sample.
///
/// Requires at least `slow + signal` samples.
#[must_use]
pub fn macd(prices: &[Decimal], fast: usize, slow: usize, signal: usize) -> Option<Macd> {
    if fast == 0 || fast >= slow || prices.len() < slow + signal {
        return None;
    }

    let fast_ema = ema_series(prices, fast);
    let slow_ema = ema_series(prices, slow);
    // fast_ema starts at index fast-1, slow_ema at slow-1
    let offset = slow - fast;
    let macd_line: Vec<Decimal> = slow_ema
        .iter()
        .enumerate()
        .map(|(i, slow_value)| fast_ema[i + offset] - *slow_value)
        .collect();

    let signal_line = ema_series(&macd_line, signal);
    let macd_value = *macd_line.last()?;
    let signal_value = *signal_line.last()?;

    Some(Macd {
        macd: macd_value,
        signal: signal_value,
        histogram: macd_value - signal_value,
    })
}

/// Average true range: the true ranges of bars `1..n` summed and divided by
/// `period`.
#[must_use]
pub fn atr(klines: &[Kline], period: usize) -> Decimal {
    if klines.len() <= 1 || period == 0 {
        return Decimal::ZERO;
    }
    let total: Decimal = klines
        .windows(2)
        .map(|pair| {
            let prev_close = pair[0].close;
            let bar = &pair[1];
            (bar.high - bar.low)
                .abs()
                .max((bar.high - prev_close).abs())
                .max((bar.low - prev_close).abs())
        })
        .sum();
    total / Decimal::from(period)
}

/// ATR expressed as a fraction of the last close.
#[must_use]
pub fn relative_volatility(klines: &[Kline], period: usize) -> Option<Decimal> {
    let last_close = klines.last()?.close;
    if last_close <= Decimal::ZERO {
        return None;
    }
    Some(atr(klines, period) / last_close)
}

/// Latest volume divided by the mean of the `lookback` volumes before it.
#[must_use]
pub fn volume_ratio(volumes: &[Decimal], lookback: usize) -> Option<Decimal> {
    if lookback == 0 || volumes.len() < lookback + 1 {
        return None;
    }
    let current = *volumes.last()?;
    let history = &volumes[volumes.len() - 1 - lookback..volumes.len() - 1];
    let average = history.iter().sum::<Decimal>() / Decimal::from(lookback);
    if average.is_zero() {
        return None;
    }
    Some(current / average)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trend {
    Bullish,
    Bearish,
    Neutral,
}

/// Classifies a higher-timeframe trend from stacked moving averages.
#[must_use]
pub fn classify_trend(klines: &[Kline], fast: usize, slow: usize) -> Option<Trend> {
    let closes: Vec<Decimal> = klines.iter().map(|k| k.close).collect();
    let fast_ma = sma(&closes, fast)?;
    let slow_ma = sma(&closes, slow)?;
    let close = *closes.last()?;

    Some(if close > fast_ma && fast_ma > slow_ma {
        Trend::Bullish
    } else if close < fast_ma && fast_ma < slow_ma {
        Trend::Bearish
    } else {
        Trend::Neutral
    })
}

/// Stop-loss fraction widened by volatility: `base + volatility * multiplier`.
#[must_use]
pub fn dynamic_stop_loss(volatility: Option<Decimal>, base: Decimal, multiplier: Decimal) -> Decimal {
    volatility.map_or(base, |v| base + v * multiplier)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn kline(high: Decimal, low: Decimal, close: Decimal) -> Kline {
        Kline {
            open_time: Utc::now(),
            open: close,
            high,
            low,
            close,
            volume: Decimal::ONE,
        }
    }

    fn closes(values: &[i64]) -> Vec<Decimal> {
        values.iter().map(|v| Decimal::from(*v)).collect()
    }

    #[test]
    fn sma_uses_trailing_window() {
        let prices = closes(&[1, 2, 3, 4, 5]);
        assert_eq!(sma(&prices, 2), Some(dec!(4.5)));
        assert_eq!(sma(&prices, 5), Some(dec!(3)));
        assert_eq!(sma(&prices, 6), None);
    }

    #[test]
    fn rsi_requires_period_plus_one() {
        let prices = closes(&[1, 2, 3]);
        assert!(rsi(&prices, 3).is_none());
        assert!(rsi(&closes(&[1, 2, 3, 4]), 3).is_some());
    }

    #[test]
    fn rsi_wilder_smoothing() {
        // seed gains/losses 0.5/0.5, then +2 → 1.25/0.25 → RS 5
        let value = rsi(&closes(&[10, 11, 10, 12]), 2).unwrap();
        assert!(value > dec!(83.33) && value < dec!(83.34), "rsi = {value}");
    }

    #[test]
    fn rsi_extremes() {
        let rising: Vec<Decimal> = (1..=20).map(Decimal::from).collect();
        assert_eq!(rsi(&rising, 14), Some(dec!(100)));

        let falling: Vec<Decimal> = (1..=20).rev().map(Decimal::from).collect();
        assert_eq!(rsi(&falling, 14), Some(Decimal::ZERO));

        let flat = vec![dec!(5); 20];
        assert_eq!(rsi(&flat, 14), Some(dec!(50)));
    }

    #[test]
    fn ema_is_seeded_with_sma() {
        let series = ema_series(&closes(&[2, 4, 6, 8]), 3);
        assert_eq!(series.len(), 2);
        assert_eq!(series[0], dec!(4));
        // alpha = 0.5 → (8 - 4) * 0.5 + 4
        assert_eq!(series[1], dec!(6));
    }

    #[test]
    fn macd_needs_slow_plus_signal() {
        let prices: Vec<Decimal> = (1..=34).map(Decimal::from).collect();
        assert!(macd(&prices, 12, 26, 9).is_none());
        let prices: Vec<Decimal> = (1..=35).map(Decimal::from).collect();
        assert!(macd(&prices, 12, 26, 9).is_some());
    }

    #[test]
    fn macd_histogram_negative_in_selloff() {
        let mut prices: Vec<Decimal> = vec![dec!(100); 40];
        prices.extend((0..10).map(|i| Decimal::from(100 - 3 * i)));
        let result = macd(&prices, 12, 26, 9).unwrap();
        assert!(result.macd < Decimal::ZERO);
        assert!(result.histogram < Decimal::ZERO);
        assert_eq!(result.histogram, result.macd - result.signal);
    }

    #[test]
    fn atr_sums_true_ranges_over_period() {
        let klines = vec![
            kline(dec!(101), dec!(99), dec!(100)),
            kline(dec!(105), dec!(95), dec!(100)),
            kline(dec!(110), dec!(100), dec!(105)),
        ];
        assert_eq!(atr(&klines, 2), dec!(10));
        assert_eq!(atr(&klines[..1], 14), Decimal::ZERO);
        assert_eq!(relative_volatility(&klines, 2), Some(dec!(10) / dec!(105)));
    }

    #[test]
    fn volume_ratio_against_history() {
        let volumes = closes(&[10, 10, 10, 10, 30]);
        assert_eq!(volume_ratio(&volumes, 4), Some(dec!(3)));
        assert!(volume_ratio(&volumes, 5).is_none());
    }

    #[test]
    fn trend_classification() {
        let up: Vec<Kline> = (1..=60)
            .map(|i| kline(Decimal::from(i), Decimal::from(i), Decimal::from(i)))
            .collect();
        assert_eq!(classify_trend(&up, 20, 50), Some(Trend::Bullish));

        let down: Vec<Kline> = (1..=60)
            .rev()
            .map(|i| kline(Decimal::from(i), Decimal::from(i), Decimal::from(i)))
            .collect();
        assert_eq!(classify_trend(&down, 20, 50), Some(Trend::Bearish));

        assert!(classify_trend(&up[..10], 20, 50).is_none());
    }

    #[test]
    fn dynamic_stop_loss_widens_with_volatility() {
        assert_eq!(dynamic_stop_loss(None, dec!(0.01), dec!(0.1)), dec!(0.01));
        assert_eq!(
            dynamic_stop_loss(Some(dec!(0.05)), dec!(0.01), dec!(0.1)),
            dec!(0.015)
        );
    }
}
