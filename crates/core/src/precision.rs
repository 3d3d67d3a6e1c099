use crate::events::SymbolFilters;
use rust_decimal::Decimal;

/// Rounds `value` down to the nearest multiple of `step`.
///
/// A non-positive step leaves the value untouched.
#[must_use]
pub fn round_step(value: Decimal, step: Decimal) -> Decimal {
    if step <= Decimal::ZERO {
        return value;
    }
    ((value / step).floor() * step).normalize()
}

impl SymbolFilters {
    #[must_use]
    pub fn round_price(&self, price: Decimal) -> Decimal {
        round_step(price, self.tick_size)
    }

    #[must_use]
    pub fn round_qty(&self, qty: Decimal) -> Decimal {
        round_step(qty, self.step_size)
    }

    /// True when `price * qty` meets the exchange minimum order value.
    #[must_use]
    pub fn meets_min_notional(&self, price: Decimal, qty: Decimal) -> bool {
        price * qty >= self.min_notional
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn rounds_down_to_step() {
        assert_eq!(round_step(dec!(0.123456), dec!(0.0001)), dec!(0.1234));
        assert_eq!(round_step(dec!(3084.567), dec!(0.01)), dec!(3084.56));
        assert_eq!(round_step(dec!(7), dec!(5)), dec!(5));
    }

    #[test]
    fn zero_step_is_identity() {
        assert_eq!(round_step(dec!(1.2345), Decimal::ZERO), dec!(1.2345));
    }

    #[test]
    fn filters_check_min_notional() {
        let filters = SymbolFilters::default();
        assert!(filters.meets_min_notional(dec!(3000), dec!(0.004)));
        assert!(!filters.meets_min_notional(dec!(3000), dec!(0.003)));
    }
}
