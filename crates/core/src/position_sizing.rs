use anyhow::Result;
use rust_decimal::Decimal;

/// Fraction of the spendable balance a buy may use, leaving room for fees.
pub const SPEND_HEADROOM: Decimal = Decimal::from_parts(99, 0, 0, false, 2);

/// Fraction of the spendable balance a defense buy may use.
pub const DCA_HEADROOM: Decimal = Decimal::from_parts(98, 0, 0, false, 2);

/// Calculate position size from the distance to the stop
///
/// # Arguments
/// * `account_equity` - Quote balance plus base balance valued at `entry_price`
/// * `risk_pct` - Fraction of equity lost if the stop is hit (0.0-1.0)
/// * `entry_price` - Expected entry price
/// * `stop_price` - Stop-loss price
/// * `spendable` - Quote funds available to this worker
///
/// # Returns
/// Base quantity, capped so that its cost stays within `spendable * 0.99`
///
/// # Errors
/// Returns error if the prices are not positive or the stop equals the entry
pub fn risk_position_size(
    account_equity: Decimal,
    risk_pct: Decimal,
    entry_price: Decimal,
    stop_price: Decimal,
    spendable: Decimal,
) -> Result<Decimal> {
    if entry_price <= Decimal::ZERO {
        anyhow::bail!("Entry price must be positive");
    }
    let stop_distance = (entry_price - stop_price).abs();
    if stop_distance.is_zero() {
        anyhow::bail!("Stop price equals entry price");
    }
    if risk_pct <= Decimal::ZERO || risk_pct >= Decimal::ONE {
        anyhow::bail!("Risk percent must be between 0 and 1");
    }

    let risk_amount = account_equity * risk_pct;
    let units = risk_amount / stop_distance;

    let max_units = spendable.max(Decimal::ZERO) / entry_price * SPEND_HEADROOM;
    Ok(units.min(max_units))
}

/// Quote amount spent when risk sizing cannot run.
#[must_use]
pub fn fallback_order_value(spendable: Decimal, position_size_pct: Decimal) -> Decimal {
    spendable.max(Decimal::ZERO) * position_size_pct
}

/// Quote amount for the next defense buy.
///
/// `spendable * pct * multiplier^level`, capped at 98% of the spendable balance.
#[must_use]
pub fn dca_order_value(
    spendable: Decimal,
    position_size_pct: Decimal,
    multiplier: Decimal,
    level: u32,
) -> Decimal {
    let spendable = spendable.max(Decimal::ZERO);
    let mut value = spendable * position_size_pct;
    for _ in 0..level {
        value *= multiplier;
    }
    value.min(spendable * DCA_HEADROOM)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_risk_sizing_uses_stop_distance() {
        // $1000 equity, 2% risk = $20; stop $60 away → 0.333.. units
        let units = risk_position_size(dec!(1000), dec!(0.02), dec!(3000), dec!(2940), dec!(10000))
            .unwrap();
        assert_eq!(units, dec!(20) / dec!(60));
    }

    #[test]
    fn test_cap_by_spendable() {
        // Risk sizing wants 0.333 units ($1000) but only $500 is spendable
        let units = risk_position_size(dec!(1000), dec!(0.02), dec!(3000), dec!(2940), dec!(500))
            .unwrap();
        assert_eq!(units, dec!(500) / dec!(3000) * dec!(0.99));
    }

    #[test]
    fn test_invalid_inputs() {
        assert!(risk_position_size(dec!(1000), dec!(0.02), dec!(0), dec!(1), dec!(100)).is_err());
        assert!(
            risk_position_size(dec!(1000), dec!(0.02), dec!(3000), dec!(3000), dec!(100)).is_err()
        );
        assert!(risk_position_size(dec!(1000), dec!(1.5), dec!(3000), dec!(2900), dec!(100)).is_err());
    }

    #[test]
    fn test_fallback_value() {
        assert_eq!(fallback_order_value(dec!(400), dec!(0.25)), dec!(100));
        assert_eq!(fallback_order_value(dec!(-5), dec!(0.25)), dec!(0));
    }

    #[test]
    fn test_dca_value_grows_with_level() {
        assert_eq!(dca_order_value(dec!(400), dec!(0.25), dec!(1.5), 0), dec!(100));
        assert_eq!(dca_order_value(dec!(400), dec!(0.25), dec!(1.5), 2), dec!(225));
        // 0.25 * 2^3 = 2.0 of spendable → capped at 98%
        assert_eq!(dca_order_value(dec!(400), dec!(0.25), dec!(2), 3), dec!(392));
    }
}
