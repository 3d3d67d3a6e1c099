//! Ordered buy filters. The first failing filter decides the rejection reason.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use spotgrid_core::config::StrategyConfig;
use spotgrid_core::indicators::{self, Macd, Trend};

use crate::signal_engine::{ExternalScores, RejectReason};
use crate::state::StrategyState;

/// Indicator values a buy decision was made on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntrySnapshot {
    pub rsi: Decimal,
    pub fast_ma: Decimal,
    pub slow_ma: Decimal,
    pub trend_ma: Option<Decimal>,
    pub macd: Option<Macd>,
    pub volume_ratio: Option<Decimal>,
}

impl EntrySnapshot {
    /// Computes every indicator the filters need, or `None` while RSI or the
    /// crossover averages lack history.
    #[must_use]
    pub fn compute(config: &StrategyConfig, state: &StrategyState) -> Option<Self> {
        let prices = state.prices();
        let rsi = indicators::rsi(&prices, config.rsi_period)?;
        let fast_ma = indicators::sma(&prices, config.fast_ma)?;
        let slow_ma = indicators::sma(&prices, config.slow_ma)?;
        Some(Self {
            rsi,
            fast_ma,
            slow_ma,
            trend_ma: indicators::sma(&prices, config.trend_ma),
            macd: indicators::macd(&prices, config.macd_fast, config.macd_slow, config.macd_signal),
            volume_ratio: indicators::volume_ratio(&state.volumes(), config.volume_lookback),
        })
    }
}

fn in_stop_loss_cooldown(config: &StrategyConfig, state: &StrategyState, now: DateTime<Utc>) -> bool {
    state.last_stop_loss_at.is_some_and(|at| {
        let elapsed = now.signed_duration_since(at).num_seconds();
        elapsed < i64::try_from(config.cooldown_after_stop_loss_secs).unwrap_or(i64::MAX)
    })
}

/// Runs the buy filters in order.
///
/// # Errors
///
/// Returns the reason of the first filter that fails.
pub fn check_entry(
    config: &StrategyConfig,
    state: &StrategyState,
    price: Decimal,
    scores: &ExternalScores,
    now: DateTime<Utc>,
) -> Result<EntrySnapshot, RejectReason> {
    if in_stop_loss_cooldown(config, state, now) {
        return Err(RejectReason::Cooldown);
    }

    let snapshot = EntrySnapshot::compute(config, state).ok_or(RejectReason::InsufficientData)?;
    let rsi = snapshot.rsi;
    let deep_dip = rsi < config.deep_dip_rsi;

    if config.use_multi_timeframe
        && state.fresh_htf_trend(now, config.htf_cache_ttl_secs) == Some(Trend::Bearish)
        && rsi >= config.htf_bypass_rsi
    {
        return Err(RejectReason::HtfBearish);
    }

    if config.use_volume_filter {
        if let Some(ratio) = snapshot.volume_ratio {
            if ratio < config.volume_multiplier {
                return Err(RejectReason::LowVolume);
            }
        }
    }

    if config.use_sentiment_filter {
        let score = scores.sentiment.ok_or(RejectReason::SentimentUnavailable)?;
        if score < config.sentiment_threshold {
            return Err(RejectReason::SentimentLow);
        }
    }

    if config.use_trend_filter {
        if let Some(trend_ma) = snapshot.trend_ma {
            if price <= trend_ma && !deep_dip {
                return Err(RejectReason::BelowTrend);
            }
        }
    }

    if rsi >= config.rsi_threshold_buy {
        return Err(RejectReason::RsiTooHigh);
    }

    if config.use_macd_filter {
        if let Some(macd) = snapshot.macd {
            if macd.histogram < Decimal::ZERO && !deep_dip {
                return Err(RejectReason::MacdBearish);
            }
        }
    }

    if snapshot.fast_ma <= snapshot.slow_ma {
        return Err(RejectReason::NoMaCross);
    }

    if config.use_ml_confirmation {
        let probability = scores.ml_probability.ok_or(RejectReason::MlUnavailable)?;
        if probability < config.ml_min_probability {
            return Err(RejectReason::MlLowConfidence);
        }
    }

    Ok(snapshot)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use rust_decimal_macros::dec;

    fn lean_config() -> StrategyConfig {
        StrategyConfig {
            fast_ma: 2,
            slow_ma: 4,
            trend_ma: 8,
            rsi_period: 4,
            history_capacity: 50,
            ..StrategyConfig::default()
        }
    }

    /// Steady decline: RSI at zero, price under every average.
    fn steady_decline(state: &mut StrategyState) {
        for p in [100, 98, 96, 94, 92, 90, 88, 86, 84, 82, 80, 78, 76, 74, 72, 70, 68, 66, 64, 62] {
            state.push(Decimal::from(p), Decimal::ONE);
        }
    }

    /// Choppy decline with RSI near 27, the last price under the trend
    /// average and a falling MACD histogram.
    fn choppy_decline(state: &mut StrategyState) {
        for p in [100, 98, 99, 97, 98, 96, 97, 95, 96, 94, 95, 93, 94, 92, 93, 91, 92, 90, 91, 89] {
            state.push(Decimal::from(p), Decimal::ONE);
        }
    }

    fn rsi_of(config: &StrategyConfig, state: &StrategyState) -> Decimal {
        indicators::rsi(&state.prices(), config.rsi_period).unwrap()
    }

    #[test]
    fn cooldown_blocks_first() {
        let config = lean_config();
        let mut state = StrategyState::new(50);
        let now = Utc::now();
        state.last_stop_loss_at = Some(now - Duration::minutes(10));
        let result = check_entry(&config, &state, dec!(100), &ExternalScores::default(), now);
        assert_eq!(result, Err(RejectReason::Cooldown));

        state.last_stop_loss_at = Some(now - Duration::minutes(31));
        let result = check_entry(&config, &state, dec!(100), &ExternalScores::default(), now);
        assert_eq!(result, Err(RejectReason::InsufficientData));
    }

    #[test]
    fn rising_market_is_too_hot() {
        let config = lean_config();
        let mut state = StrategyState::new(50);
        for p in 1..=20 {
            state.push(Decimal::from(100 + p), Decimal::ONE);
        }
        let result = check_entry(&config, &state, dec!(120), &ExternalScores::default(), Utc::now());
        assert_eq!(result, Err(RejectReason::RsiTooHigh));
    }

    #[test]
    fn falling_market_has_no_cross() {
        let config = lean_config();
        let mut state = StrategyState::new(50);
        steady_decline(&mut state);
        let result = check_entry(&config, &state, dec!(62), &ExternalScores::default(), Utc::now());
        // RSI 0 passes every RSI gate and the deep-dip exception skips the
        // trend and MACD filters; the averages still point down.
        assert_eq!(result, Err(RejectReason::NoMaCross));
    }

    #[test]
    fn sentiment_filter_requires_score() {
        let config = StrategyConfig {
            use_sentiment_filter: true,
            ..lean_config()
        };
        let mut state = StrategyState::new(50);
        steady_decline(&mut state);
        let result = check_entry(&config, &state, dec!(62), &ExternalScores::default(), Utc::now());
        assert_eq!(result, Err(RejectReason::SentimentUnavailable));

        let scores = ExternalScores {
            sentiment: Some(dec!(-0.5)),
            ..ExternalScores::default()
        };
        let result = check_entry(&config, &state, dec!(62), &scores, Utc::now());
        assert_eq!(result, Err(RejectReason::SentimentLow));
    }

    #[test]
    fn bearish_htf_is_bypassed_by_deep_dip() {
        let config = StrategyConfig {
            use_multi_timeframe: true,
            ..lean_config()
        };
        let mut state = StrategyState::new(50);
        steady_decline(&mut state);
        let now = Utc::now();
        state.set_htf_trend(Trend::Bearish, now);
        let result = check_entry(&config, &state, dec!(62), &ExternalScores::default(), now);
        // RSI is far below the bypass level, so evaluation moves past the HTF filter
        assert_eq!(result, Err(RejectReason::NoMaCross));
    }

    #[test]
    fn bearish_htf_blocks_from_bypass_level() {
        let mut state = StrategyState::new(50);
        choppy_decline(&mut state);
        let now = Utc::now();
        state.set_htf_trend(Trend::Bearish, now);
        let rsi = rsi_of(&lean_config(), &state);

        let at_level = StrategyConfig {
            use_multi_timeframe: true,
            htf_bypass_rsi: rsi,
            ..lean_config()
        };
        let result = check_entry(&at_level, &state, dec!(89), &ExternalScores::default(), now);
        assert_eq!(result, Err(RejectReason::HtfBearish));

        let above_level = StrategyConfig {
            htf_bypass_rsi: rsi + dec!(0.0001),
            ..at_level
        };
        let result = check_entry(&above_level, &state, dec!(89), &ExternalScores::default(), now);
        assert_ne!(result, Err(RejectReason::HtfBearish));
    }

    #[test]
    fn default_htf_bypass_level_is_thirty() {
        let config = StrategyConfig {
            use_multi_timeframe: true,
            ..lean_config()
        };
        let mut state = StrategyState::new(50);
        for p in 1..=20 {
            state.push(Decimal::from(100 + p), Decimal::ONE);
        }
        let now = Utc::now();
        state.set_htf_trend(Trend::Bearish, now);
        assert_eq!(config.htf_bypass_rsi, dec!(30));
        let result = check_entry(&config, &state, dec!(120), &ExternalScores::default(), now);
        assert_eq!(result, Err(RejectReason::HtfBearish));

        // a stale higher-timeframe reading is ignored
        state.set_htf_trend(Trend::Bearish, now - Duration::hours(2));
        let result = check_entry(&config, &state, dec!(120), &ExternalScores::default(), now);
        assert_eq!(result, Err(RejectReason::RsiTooHigh));
    }

    #[test]
    fn volume_below_multiplier_is_rejected() {
        let config = StrategyConfig {
            use_volume_filter: true,
            volume_lookback: 5,
            ..lean_config()
        };
        let with_last_volume = |last: Decimal| {
            let mut state = StrategyState::new(50);
            steady_decline(&mut state);
            state.push(dec!(60), last);
            state
        };

        let state = with_last_volume(dec!(1.19));
        let result = check_entry(&config, &state, dec!(60), &ExternalScores::default(), Utc::now());
        assert_eq!(result, Err(RejectReason::LowVolume));

        // exactly the multiplier passes
        let state = with_last_volume(dec!(1.2));
        let result = check_entry(&config, &state, dec!(60), &ExternalScores::default(), Utc::now());
        assert_eq!(result, Err(RejectReason::NoMaCross));
    }

    #[test]
    fn price_at_trend_average_is_rejected() {
        let mut state = StrategyState::new(50);
        choppy_decline(&mut state);
        let rsi = rsi_of(&lean_config(), &state);
        // no deep dip when RSI sits exactly on the level
        let config = StrategyConfig {
            deep_dip_rsi: rsi,
            ..lean_config()
        };
        let trend_ma = indicators::sma(&state.prices(), config.trend_ma).unwrap();
        assert_eq!(trend_ma, dec!(91.5));

        let result = check_entry(&config, &state, trend_ma, &ExternalScores::default(), Utc::now());
        assert_eq!(result, Err(RejectReason::BelowTrend));

        let result = check_entry(&config, &state, trend_ma + dec!(0.01), &ExternalScores::default(), Utc::now());
        assert_eq!(result, Err(RejectReason::NoMaCross));

        let deep = StrategyConfig {
            deep_dip_rsi: rsi + dec!(0.0001),
            ..config
        };
        let result = check_entry(&deep, &state, dec!(89), &ExternalScores::default(), Utc::now());
        assert_eq!(result, Err(RejectReason::NoMaCross));
    }

    fn fast_macd_config() -> StrategyConfig {
        StrategyConfig {
            use_trend_filter: false,
            macd_fast: 2,
            macd_slow: 4,
            macd_signal: 2,
            ..lean_config()
        }
    }

    #[test]
    fn bearish_macd_is_rejected_at_deep_dip_level() {
        let mut state = StrategyState::new(50);
        choppy_decline(&mut state);
        let rsi = rsi_of(&lean_config(), &state);
        let config = StrategyConfig {
            deep_dip_rsi: rsi,
            ..fast_macd_config()
        };
        let macd = indicators::macd(&state.prices(), 2, 4, 2).unwrap();
        assert!(macd.histogram < Decimal::ZERO);

        let result = check_entry(&config, &state, dec!(89), &ExternalScores::default(), Utc::now());
        assert_eq!(result, Err(RejectReason::MacdBearish));
    }

    #[test]
    fn deep_dip_skips_macd_filter() {
        let mut state = StrategyState::new(50);
        choppy_decline(&mut state);
        let rsi = rsi_of(&lean_config(), &state);
        let config = StrategyConfig {
            deep_dip_rsi: rsi + dec!(0.0001),
            ..fast_macd_config()
        };
        let result = check_entry(&config, &state, dec!(89), &ExternalScores::default(), Utc::now());
        assert_eq!(result, Err(RejectReason::NoMaCross));

        // the default level of 33 already counts this RSI as a deep dip
        let result = check_entry(&fast_macd_config(), &state, dec!(89), &ExternalScores::default(), Utc::now());
        assert_eq!(result, Err(RejectReason::NoMaCross));
    }
}
