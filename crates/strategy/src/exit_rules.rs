//! Sell-side evaluation for an open position.
//!
//! Order: update peak, hard stop, trailing take-profit, legacy trailing stop,
//! defense buy, hold.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use spotgrid_core::config::StrategyConfig;
use spotgrid_core::indicators;
use spotgrid_core::position::Position;

use crate::signal_engine::Decision;
use crate::state::StrategyState;

/// RSI assumed for the defense check while history is too short.
const NEUTRAL_RSI: Decimal = Decimal::from_parts(50, 0, 0, false, 0);

#[must_use]
pub fn stop_loss_price(entry: Decimal, stop_loss_pct: Decimal) -> Decimal {
    entry * (Decimal::ONE - stop_loss_pct)
}

/// Entry plus buy and sell fees.
#[must_use]
pub fn break_even_price(entry: Decimal, fee_rate: Decimal) -> Decimal {
    entry * (Decimal::ONE + Decimal::TWO * fee_rate)
}

#[must_use]
pub fn trailing_trigger(peak: Decimal, callback_pct: Decimal) -> Decimal {
    peak * (Decimal::ONE - callback_pct)
}

/// Evaluates exits and defense buys, updating the position's peak and TTP flag.
pub fn check_exit(
    config: &StrategyConfig,
    state: &StrategyState,
    position: &mut Position,
    price: Decimal,
    now: DateTime<Utc>,
) -> Decision {
    let peak = position.update_peak(price);
    let entry = position.entry_price;

    if price < stop_loss_price(entry, config.fixed_stop_loss_pct) {
        return Decision::StopLoss;
    }

    let break_even = break_even_price(entry, config.fee_rate);
    if !position.ttp_armed
        && price > break_even
        && position.gain_fraction(price) >= config.ttp_activation_pct
    {
        position.ttp_armed = true;
        tracing::info!(
            symbol = %position.symbol,
            %price,
            %peak,
            "Trailing take-profit armed"
        );
    }

    if position.ttp_armed {
        if price <= trailing_trigger(peak, config.ttp_callback_pct) {
            return Decision::Sell;
        }
    } else if config.use_trailing_stop
        && price > break_even
        && price < trailing_trigger(peak, config.trailing_stop_pct)
    {
        return Decision::Sell;
    }

    if should_average_down(config, state, position, price, now) {
        return Decision::Dca;
    }

    Decision::Hold
}

fn should_average_down(
    config: &StrategyConfig,
    state: &StrategyState,
    position: &Position,
    price: Decimal,
    now: DateTime<Utc>,
) -> bool {
    if !config.dca_enabled || position.dca_count >= config.dca_max_levels {
        return false;
    }
    if price > position.entry_price * (Decimal::ONE - config.dca_drop_pct) {
        return false;
    }
    if let Some(at) = state.last_dca_attempt_at {
        let elapsed = now.signed_duration_since(at).num_seconds();
        if elapsed < i64::try_from(config.dca_attempt_cooldown_secs).unwrap_or(i64::MAX) {
            return false;
        }
    }
    let rsi = indicators::rsi(&state.prices(), config.rsi_period).unwrap_or(NEUTRAL_RSI);
    rsi < config.dca_rsi_threshold
}
