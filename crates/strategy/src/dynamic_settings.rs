//! Volatility- and sentiment-scaled strategy thresholds.
//!
//! All tuning values are named constants; percentages here are on the 0-100
//! scale until converted back into config fractions.

use rust_decimal::Decimal;
use spotgrid_core::config::StrategyConfig;

pub const STOP_LOSS_VOL_FACTOR: Decimal = Decimal::from_parts(2, 0, 0, false, 0);
pub const STOP_LOSS_MIN_PCT: Decimal = Decimal::from_parts(15, 0, 0, false, 1);
pub const STOP_LOSS_MAX_PCT: Decimal = Decimal::from_parts(8, 0, 0, false, 0);

pub const TRAIL_VOL_FACTOR: Decimal = Decimal::from_parts(15, 0, 0, false, 1);
pub const TRAIL_MIN_PCT: Decimal = Decimal::from_parts(1, 0, 0, false, 0);
pub const TRAIL_MAX_PCT: Decimal = Decimal::from_parts(5, 0, 0, false, 0);

pub const RSI_LOW_VOL_PCT: Decimal = Decimal::from_parts(1, 0, 0, false, 0);
pub const RSI_HIGH_VOL_PCT: Decimal = Decimal::from_parts(4, 0, 0, false, 0);
pub const RSI_LOW_VOL_THRESHOLD: i64 = 45;
pub const RSI_HIGH_VOL_THRESHOLD: i64 = 30;
pub const RSI_BASE_THRESHOLD: i64 = 40;
pub const RSI_VOL_SLOPE: Decimal = Decimal::from_parts(3, 0, 0, false, 0);
pub const RSI_MIN: i64 = 30;
pub const RSI_MAX: i64 = 50;
pub const RSI_SENTIMENT_MIN: i64 = 25;
pub const RSI_SENTIMENT_MAX: i64 = 60;

pub const EXTREME_FEAR: u8 = 25;
pub const FEAR: u8 = 40;
pub const GREED: u8 = 60;
pub const EXTREME_GREED: u8 = 75;

pub const EXTREME_FEAR_RSI_SHIFT: i64 = -8;
pub const FEAR_RSI_SHIFT: i64 = -3;
pub const GREED_RSI_SHIFT: i64 = -2;
pub const EXTREME_GREED_RSI_SHIFT: i64 = -5;

pub const DEFAULT_VOLUME_MULTIPLIER: Decimal = Decimal::from_parts(12, 0, 0, false, 1);
pub const EXTREME_FEAR_VOLUME_MULTIPLIER: Decimal = Decimal::from_parts(15, 0, 0, false, 1);
pub const FEAR_VOLUME_MULTIPLIER: Decimal = Decimal::from_parts(13, 0, 0, false, 1);

pub const BASE_RISK_PCT: Decimal = Decimal::from_parts(2, 0, 0, false, 2);
pub const GREED_RISK_PCT: Decimal = Decimal::from_parts(15, 0, 0, false, 3);

/// Thresholds derived from current market conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DynamicSettings {
    /// Fractions, e.g. `0.03` for 3%.
    pub stop_loss_pct: Decimal,
    pub trailing_stop_pct: Decimal,
    pub rsi_threshold_buy: Decimal,
    pub volume_multiplier: Decimal,
    pub risk_pct: Decimal,
}

impl DynamicSettings {
    /// Derives settings from relative volatility (ATR / price) and an optional
    /// fear & greed index (0-100).
    #[must_use]
    pub fn compute(volatility: Decimal, fear_greed: Option<u8>) -> Self {
        let vol_pct = volatility * Decimal::ONE_HUNDRED;

        let stop_pct = (vol_pct * STOP_LOSS_VOL_FACTOR)
            .max(STOP_LOSS_MIN_PCT)
            .min(STOP_LOSS_MAX_PCT);
        let trail_pct = (vol_pct * TRAIL_VOL_FACTOR)
            .max(TRAIL_MIN_PCT)
            .min(TRAIL_MAX_PCT);

        let mut rsi = if vol_pct < RSI_LOW_VOL_PCT {
            RSI_LOW_VOL_THRESHOLD
        } else if vol_pct > RSI_HIGH_VOL_PCT {
            RSI_HIGH_VOL_THRESHOLD
        } else {
            let drop = ((vol_pct - RSI_LOW_VOL_PCT) * RSI_VOL_SLOPE).round();
            RSI_BASE_THRESHOLD - i64::try_from(drop).unwrap_or(0)
        };
        rsi = rsi.clamp(RSI_MIN, RSI_MAX);

        let mut volume_multiplier = DEFAULT_VOLUME_MULTIPLIER;
        let mut risk_pct = BASE_RISK_PCT;
        if let Some(index) = fear_greed {
            let (shift, multiplier) = if index <= EXTREME_FEAR {
                (EXTREME_FEAR_RSI_SHIFT, EXTREME_FEAR_VOLUME_MULTIPLIER)
            } else if index <= FEAR {
                (FEAR_RSI_SHIFT, FEAR_VOLUME_MULTIPLIER)
            } else if index >= EXTREME_GREED {
                (EXTREME_GREED_RSI_SHIFT, DEFAULT_VOLUME_MULTIPLIER)
            } else if index >= GREED {
                (GREED_RSI_SHIFT, DEFAULT_VOLUME_MULTIPLIER)
            } else {
                (0, DEFAULT_VOLUME_MULTIPLIER)
            };
            rsi = (rsi + shift).clamp(RSI_SENTIMENT_MIN, RSI_SENTIMENT_MAX);
            volume_multiplier = multiplier;
            if index >= EXTREME_GREED {
                risk_pct = GREED_RISK_PCT;
            }
        }

        Self {
            stop_loss_pct: stop_pct / Decimal::ONE_HUNDRED,
            trailing_stop_pct: trail_pct / Decimal::ONE_HUNDRED,
            rsi_threshold_buy: Decimal::from(rsi),
            volume_multiplier,
            risk_pct,
        }
    }

    /// Returns a copy of `base` with the dynamic thresholds swapped in.
    ///
    /// The volume multiplier only changes when volume confirmation is on.
    #[must_use]
    pub fn apply(&self, base: &StrategyConfig) -> StrategyConfig {
        let mut config = base.clone();
        config.fixed_stop_loss_pct = self.stop_loss_pct;
        config.trailing_stop_pct = self.trailing_stop_pct;
        config.rsi_threshold_buy = self.rsi_threshold_buy;
        config.risk_pct = self.risk_pct;
        if config.use_volume_filter {
            config.volume_multiplier = self.volume_multiplier;
        }
        config
    }
}
