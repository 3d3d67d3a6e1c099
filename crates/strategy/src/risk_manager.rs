use rust_decimal::Decimal;
use spotgrid_core::config::StrategyConfig;
use spotgrid_core::position_sizing::{
    dca_order_value, fallback_order_value, risk_position_size,
};

/// Funds a worker may size against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizingInputs {
    pub price: Decimal,
    pub quote_balance: Decimal,
    pub base_balance: Decimal,
    /// Allocator reservation for this worker, if it has one.
    pub allocation: Option<Decimal>,
}

impl SizingInputs {
    /// Quote the worker may spend: its balance, capped by its reservation.
    #[must_use]
    pub fn spendable(&self) -> Decimal {
        let quote = self.quote_balance.max(Decimal::ZERO);
        self.allocation.map_or(quote, |alloc| quote.min(alloc.max(Decimal::ZERO)))
    }

    #[must_use]
    pub fn equity(&self) -> Decimal {
        self.quote_balance + self.base_balance * self.price
    }
}

/// How a buy amount was chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizingMethod {
    Risk,
    Fallback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuySize {
    pub quote_amount: Decimal,
    pub stop_price: Decimal,
    pub method: SizingMethod,
}

/// Turns strategy risk settings into order values.
#[derive(Debug, Clone)]
pub struct RiskSizer {
    risk_pct: Decimal,
    stop_loss_pct: Decimal,
    position_size_pct: Decimal,
    dca_multiplier: Decimal,
}

impl RiskSizer {
    #[must_use]
    pub const fn new(config: &StrategyConfig, position_size_pct: Decimal) -> Self {
        Self {
            risk_pct: config.risk_pct,
            stop_loss_pct: config.fixed_stop_loss_pct,
            position_size_pct,
            dca_multiplier: config.dca_multiplier,
        }
    }

    /// Quote amount for an entry at `inputs.price`.
    ///
    /// Sizes from the stop distance; falls back to a fixed share of the
    /// spendable funds when that cannot produce a positive amount.
    #[must_use]
    pub fn entry_size(&self, inputs: &SizingInputs) -> BuySize {
        let stop_price = inputs.price * (Decimal::ONE - self.stop_loss_pct);
        let spendable = inputs.spendable();

        match risk_position_size(
            inputs.equity(),
            self.risk_pct,
            inputs.price,
            stop_price,
            spendable,
        ) {
            Ok(units) if units > Decimal::ZERO => BuySize {
                quote_amount: units * inputs.price,
                stop_price,
                method: SizingMethod::Risk,
            },
            Ok(_) => self.fallback(spendable, stop_price),
            Err(e) => {
                tracing::debug!(error = %e, "Risk sizing unavailable, using fallback");
                self.fallback(spendable, stop_price)
            }
        }
    }

    fn fallback(&self, spendable: Decimal, stop_price: Decimal) -> BuySize {
        BuySize {
            quote_amount: fallback_order_value(spendable, self.position_size_pct),
            stop_price,
            method: SizingMethod::Fallback,
        }
    }

    /// Quote amount for the defense buy at `level` (the position's current DCA count).
    #[must_use]
    pub fn dca_size(&self, inputs: &SizingInputs, level: u32) -> Decimal {
        dca_order_value(
            inputs.spendable(),
            self.position_size_pct,
            self.dca_multiplier,
            level,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn inputs(quote: Decimal, allocation: Option<Decimal>) -> SizingInputs {
        SizingInputs {
            price: dec!(3000),
            quote_balance: quote,
            base_balance: Decimal::ZERO,
            allocation,
        }
    }

    #[test]
    fn risk_size_is_capped_by_allocation() {
        let sizer = RiskSizer::new(&StrategyConfig::default(), dec!(0.25));
        // equity 1000, risk 2% = 20, stop distance 60 → 0.3333 units ≈ 1000 quote,
        // capped at 600 / 3000 * 0.99 units
        let size = sizer.entry_size(&inputs(dec!(1000), Some(dec!(600))));
        assert_eq!(size.method, SizingMethod::Risk);
        assert_eq!(size.stop_price, dec!(2940));
        assert_eq!(size.quote_amount, dec!(594));
    }

    #[test]
    fn zero_stop_distance_falls_back() {
        let config = StrategyConfig {
            fixed_stop_loss_pct: Decimal::ZERO,
            ..StrategyConfig::default()
        };
        let sizer = RiskSizer::new(&config, dec!(0.25));
        let size = sizer.entry_size(&inputs(dec!(400), None));
        assert_eq!(size.method, SizingMethod::Fallback);
        assert_eq!(size.quote_amount, dec!(100));
    }

    #[test]
    fn dca_grows_with_multiplier() {
        let config = StrategyConfig {
            dca_multiplier: dec!(2),
            ..StrategyConfig::default()
        };
        let sizer = RiskSizer::new(&config, dec!(0.25));
        let funds = inputs(dec!(1000), None);
        assert_eq!(sizer.dca_size(&funds, 0), dec!(250));
        assert_eq!(sizer.dca_size(&funds, 1), dec!(500));
        // capped at 98% of spendable
        assert_eq!(sizer.dca_size(&funds, 3), dec!(980));
    }
}
