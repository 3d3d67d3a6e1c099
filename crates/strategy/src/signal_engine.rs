use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use spotgrid_core::config::StrategyConfig;
use spotgrid_core::indicators::Trend;
use spotgrid_core::position::Position;
use std::fmt;

use crate::dynamic_settings::DynamicSettings;
use crate::entry_filters::check_entry;
use crate::exit_rules::{check_exit, stop_loss_price};
use crate::state::StrategyState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Decision {
    Buy,
    Hold,
    Sell,
    StopLoss,
    Dca,
}

impl Decision {
    #[must_use]
    pub const fn is_exit(self) -> bool {
        matches!(self, Self::Sell | Self::StopLoss)
    }
}

/// Why a buy was not taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    Cooldown,
    InsufficientData,
    HtfBearish,
    LowVolume,
    SentimentUnavailable,
    SentimentLow,
    BelowTrend,
    RsiTooHigh,
    MacdBearish,
    NoMaCross,
    MlUnavailable,
    MlLowConfidence,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Cooldown => "stop-loss cooldown active",
            Self::InsufficientData => "not enough price history",
            Self::HtfBearish => "higher timeframe bearish",
            Self::LowVolume => "volume below confirmation level",
            Self::SentimentUnavailable => "sentiment score unavailable",
            Self::SentimentLow => "sentiment below threshold",
            Self::BelowTrend => "price below trend average",
            Self::RsiTooHigh => "RSI above buy threshold",
            Self::MacdBearish => "MACD histogram negative",
            Self::NoMaCross => "fast average not above slow average",
            Self::MlUnavailable => "ML probability unavailable",
            Self::MlLowConfidence => "ML probability below minimum",
        };
        f.write_str(text)
    }
}

/// Scores supplied by external providers. Missing values only matter when
/// the matching filter is enabled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalScores {
    pub sentiment: Option<Decimal>,
    pub ml_probability: Option<Decimal>,
    /// Fear & greed index, 0-100.
    pub fear_greed: Option<u8>,
}

/// Signal engine for one worker: configuration plus rolling state.
///
/// The base config is what the operator set. With `dynamic_settings` on, the
/// effective config is the base with volatility-scaled thresholds swapped in.
#[derive(Debug, Clone)]
pub struct SignalEngine {
    base: StrategyConfig,
    effective: StrategyConfig,
    dynamic: Option<DynamicSettings>,
    state: StrategyState,
}

impl SignalEngine {
    #[must_use]
    pub fn new(config: StrategyConfig) -> Self {
        let state = StrategyState::new(config.history_capacity);
        Self {
            effective: config.clone(),
            base: config,
            dynamic: None,
            state,
        }
    }

    /// Config in effect for decisions.
    #[must_use]
    pub const fn config(&self) -> &StrategyConfig {
        &self.effective
    }

    #[must_use]
    pub const fn base_config(&self) -> &StrategyConfig {
        &self.base
    }

    #[must_use]
    pub const fn dynamic_settings(&self) -> Option<&DynamicSettings> {
        self.dynamic.as_ref()
    }

    #[must_use]
    pub const fn state(&self) -> &StrategyState {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut StrategyState {
        &mut self.state
    }

    /// Replaces the configuration wholesale. Enabling the volume filter
    /// restarts the volume history, since samples taken while it was off
    /// do not come from closed klines.
    pub fn update_config(&mut self, config: StrategyConfig) {
        self.state.resize(config.history_capacity);
        if config.use_volume_filter && !self.base.use_volume_filter {
            self.state.clear_volumes();
        }
        self.base = config;
        self.refresh_effective();
    }

    pub fn on_sample(&mut self, price: Decimal, volume: Decimal) {
        self.state.push(price, volume);
    }

    /// Stores the latest relative volatility and recomputes the dynamic
    /// thresholds when they are enabled.
    pub fn set_volatility(&mut self, volatility: Decimal, fear_greed: Option<u8>) {
        self.state.volatility = Some(volatility);
        self.dynamic = self
            .base
            .dynamic_settings
            .then(|| DynamicSettings::compute(volatility, fear_greed));
        self.refresh_effective();
    }

    fn refresh_effective(&mut self) {
        self.effective = match (&self.dynamic, self.base.dynamic_settings) {
            (Some(dynamic), true) => dynamic.apply(&self.base),
            _ => self.base.clone(),
        };
    }

    /// True when the multi-timeframe filter is on and its cached trend is stale.
    #[must_use]
    pub fn needs_htf_refresh(&self, now: DateTime<Utc>) -> bool {
        self.effective.use_multi_timeframe
            && self
                .state
                .fresh_htf_trend(now, self.effective.htf_cache_ttl_secs)
                .is_none()
    }

    pub fn set_htf_trend(&mut self, trend: Trend, now: DateTime<Utc>) {
        self.state.set_htf_trend(trend, now);
    }

    pub fn record_stop_loss(&mut self, now: DateTime<Utc>) {
        self.state.last_stop_loss_at = Some(now);
    }

    /// Stop price for a new entry at `price`.
    #[must_use]
    pub fn entry_stop_price(&self, price: Decimal) -> Decimal {
        stop_loss_price(price, self.effective.fixed_stop_loss_pct)
    }

    /// Decides what to do at `price`.
    ///
    /// Flat workers get `Buy` or `Hold`; workers holding a position get
    /// `Sell`, `StopLoss`, `Dca` or `Hold`. The position's peak and trailing
    /// flag are updated in place.
    pub fn evaluate(
        &mut self,
        position: Option<&mut Position>,
        price: Decimal,
        scores: &ExternalScores,
        now: DateTime<Utc>,
    ) -> Decision {
        if let Some(position) = position {
            let decision = check_exit(&self.effective, &self.state, position, price, now);
            if decision == Decision::Dca {
                self.state.last_dca_attempt_at = Some(now);
            }
            return decision;
        }

        match check_entry(&self.effective, &self.state, price, scores, now) {
            Ok(snapshot) => {
                tracing::info!(
                    %price,
                    rsi = %snapshot.rsi.round_dp(2),
                    fast_ma = %snapshot.fast_ma.round_dp(2),
                    slow_ma = %snapshot.slow_ma.round_dp(2),
                    histogram = ?snapshot.macd.map(|m| m.histogram.round_dp(4)),
                    "Buy signal"
                );
                self.state.last_rejection = None;
                Decision::Buy
            }
            Err(reason) => {
                tracing::debug!(%price, %reason, "Buy rejected");
                self.state.record_rejection(reason);
                Decision::Hold
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use spotgrid_core::events::{OrderFill, Side};

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

    /// Decline by 2 per bar, then two +1 bars: RSI(4) ≈ 28, fast MA above slow,
    /// price below the trend MA.
    fn capitulation_bounce(engine: &mut SignalEngine) -> Decimal {
        for p in (0..20).map(|i| 100 - 2 * i) {
            engine.on_sample(Decimal::from(p), Decimal::ONE);
        }
        engine.on_sample(dec!(63), Decimal::ONE);
        engine.on_sample(dec!(64), Decimal::ONE);
        dec!(64)
    }

    #[test]
    fn deep_dip_bypasses_trend_and_htf_filters() {
        let mut engine = SignalEngine::new(StrategyConfig {
            use_multi_timeframe: true,
            ..lean_config()
        });
        let price = capitulation_bounce(&mut engine);
        let now = Utc::now();
        engine.set_htf_trend(Trend::Bearish, now);

        let decision = engine.evaluate(None, price, &ExternalScores::default(), now);
        assert_eq!(decision, Decision::Buy);
        assert_eq!(engine.state().last_rejection, None);
    }

    #[test]
    fn ml_gate_applies_last() {
        let mut engine = SignalEngine::new(StrategyConfig {
            use_ml_confirmation: true,
            ..lean_config()
        });
        let price = capitulation_bounce(&mut engine);
        let low = ExternalScores {
            ml_probability: Some(dec!(0.4)),
            ..ExternalScores::default()
        };
        assert_eq!(engine.evaluate(None, price, &low, Utc::now()), Decision::Hold);
        assert_eq!(engine.state().last_rejection, Some(RejectReason::MlLowConfidence));

        let high = ExternalScores {
            ml_probability: Some(dec!(0.6)),
            ..ExternalScores::default()
        };
        assert_eq!(engine.evaluate(None, price, &high, Utc::now()), Decision::Buy);
    }

    #[test]
    fn stop_loss_scenario() {
        let mut engine = SignalEngine::new(StrategyConfig::default());
        let fill = OrderFill::new(
            "1".to_string(),
            "ETHUSDT".to_string(),
            Side::Buy,
            Decimal::ONE,
            dec!(3000),
            Decimal::ZERO,
        );
        let mut position = Position::open(&fill).unwrap();
        assert_eq!(engine.entry_stop_price(dec!(3000)), dec!(2940));
        let decision = engine.evaluate(
            Some(&mut position),
            dec!(2930),
            &ExternalScores::default(),
            Utc::now(),
        );
        assert_eq!(decision, Decision::StopLoss);
        assert!(decision.is_exit());
    }

    #[test]
    fn dynamic_settings_follow_volatility() {
        let mut engine = SignalEngine::new(StrategyConfig {
            dynamic_settings: true,
            ..StrategyConfig::default()
        });
        engine.set_volatility(dec!(0.02), None);
        assert_eq!(engine.config().fixed_stop_loss_pct, dec!(0.04));
        assert_eq!(engine.config().rsi_threshold_buy, dec!(37));
        assert_eq!(engine.base_config().fixed_stop_loss_pct, dec!(0.02));

        engine.update_config(StrategyConfig::default());
        assert_eq!(engine.config().fixed_stop_loss_pct, dec!(0.02));
    }

    #[test]
    fn dca_decision_arms_attempt_cooldown() {
        let mut engine = SignalEngine::new(StrategyConfig::default());
        for p in (0..30).rev() {
            engine.on_sample(Decimal::from(2900 + p * 5), Decimal::ONE);
        }
        let fill = OrderFill::new(
            "1".to_string(),
            "ETHUSDT".to_string(),
            Side::Buy,
            Decimal::ONE,
            dec!(3000),
            Decimal::ZERO,
        );
        let mut position = Position::open(&fill).unwrap();
        let now = Utc::now();
        let scores = ExternalScores::default();

        assert_eq!(engine.evaluate(Some(&mut position), dec!(2940), &scores, now), Decision::Dca);
        assert_eq!(engine.evaluate(Some(&mut position), dec!(2940), &scores, now), Decision::Hold);
    }

    #[test]
    fn enabling_volume_filter_restarts_volume_history() {
        let mut engine = SignalEngine::new(lean_config());
        for p in 0..10 {
            engine.on_sample(Decimal::from(100 + p), Decimal::ZERO);
        }

        engine.update_config(StrategyConfig {
            use_volume_filter: true,
            ..lean_config()
        });
        assert_eq!(engine.state().prices().len(), 10);
        assert!(engine.state().volumes().is_empty());

        engine.on_sample(dec!(111), dec!(5));
        engine.update_config(StrategyConfig {
            use_volume_filter: true,
            volume_lookback: 5,
            ..lean_config()
        });
        // already enabled, history kept
        assert_eq!(engine.state().volumes(), vec![dec!(5)]);
    }
}
