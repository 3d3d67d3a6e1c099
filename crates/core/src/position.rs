use crate::events::{OrderFill, Side};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// An open spot position.
///
/// A worker either holds no `Position` (flat) or one with a positive quantity
/// and entry price; the constructors refuse anything else.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub entry_price: Decimal,
    pub quantity: Decimal,
    /// Number of defense buys made since entry.
    pub dca_count: u32,
    /// Highest price seen since entry. Never decreases until exit.
    pub peak_price: Decimal,
    /// Trailing take-profit armed flag; once set it stays set until exit.
    pub ttp_armed: bool,
    pub opened_at: DateTime<Utc>,
}

impl Position {
    /// Opens a position from a confirmed buy fill.
    ///
    /// Returns `None` for a sell fill or one with nothing executed.
    #[must_use]
    pub fn open(fill: &OrderFill) -> Option<Self> {
        if fill.side != Side::Buy
            || fill.executed_qty <= Decimal::ZERO
            || fill.avg_price <= Decimal::ZERO
        {
            return None;
        }
        Some(Self {
            symbol: fill.symbol.clone(),
            entry_price: fill.avg_price,
            quantity: fill.executed_qty,
            dca_count: 0,
            peak_price: fill.avg_price,
            ttp_armed: false,
            opened_at: fill.timestamp,
        })
    }

    /// Folds a defense buy into the position, re-averaging the entry price.
    ///
    /// The peak is left alone so a trailing stop armed before the dip keeps
    /// its reference.
    pub fn average_down(&mut self, fill: &OrderFill) {
        if fill.side != Side::Buy || fill.executed_qty <= Decimal::ZERO {
            return;
        }
        let total_qty = self.quantity + fill.executed_qty;
        self.entry_price = (self.quantity * self.entry_price + fill.cumulative_quote) / total_qty;
        self.quantity = total_qty;
        self.dca_count += 1;
    }

    /// Raises the peak if `price` exceeds it and returns the current peak.
    pub fn update_peak(&mut self, price: Decimal) -> Decimal {
        if price > self.peak_price {
            self.peak_price = price;
        }
        self.peak_price
    }

    #[must_use]
    pub fn cost_basis(&self) -> Decimal {
        self.quantity * self.entry_price
    }

    #[must_use]
    pub fn unrealized_pnl(&self, price: Decimal) -> Decimal {
        (price - self.entry_price) * self.quantity
    }

    /// Gain of `price` over entry as a fraction.
    #[must_use]
    pub fn gain_fraction(&self, price: Decimal) -> Decimal {
        (price - self.entry_price) / self.entry_price
    }

    /// Realized profit of an exit fill: revenue less the cost basis of the
    /// executed quantity and the exit commission.
    #[must_use]
    pub fn realized_pnl(&self, fill: &OrderFill) -> Decimal {
        fill.cumulative_quote - fill.executed_qty * self.entry_price - fill.commission
    }
}
