//! Persisted worker and ledger state.
//!
//! These are the blobs the store saves and the supervisor restores from.

use crate::config::{Allocation, GridWorkerConfig, SpotWorkerConfig};
use crate::events::{OrderStatus, Side, TradeMode};
use crate::metrics::WorkerMetrics;
use crate::position::Position;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum WorkerKind {
    Spot,
    Grid,
}

impl WorkerKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Spot => "spot",
            Self::Grid => "grid",
        }
    }
}

impl fmt::Display for WorkerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for WorkerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "spot" => Ok(Self::Spot),
            "grid" => Ok(Self::Grid),
            other => Err(format!("unknown worker kind: {other}")),
        }
    }
}

/// Identity of a worker. At most one running worker exists per key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct WorkerKey {
    pub kind: WorkerKind,
    pub mode: TradeMode,
    pub symbol: String,
}

impl WorkerKey {
    #[must_use]
    pub fn spot(mode: TradeMode, symbol: impl Into<String>) -> Self {
        Self {
            kind: WorkerKind::Spot,
            mode,
            symbol: symbol.into(),
        }
    }

    #[must_use]
    pub fn grid(mode: TradeMode, symbol: impl Into<String>) -> Self {
        Self {
            kind: WorkerKind::Grid,
            mode,
            symbol: symbol.into(),
        }
    }

    /// Ledger id used by the capital allocator.
    #[must_use]
    pub fn ledger_id(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for WorkerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.kind, self.mode, self.symbol)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpotWorkerState {
    pub symbol: String,
    pub mode: TradeMode,
    pub running: bool,
    pub paused: bool,
    pub position: Option<Position>,
    /// Simulated balances; live workers read balances from the exchange.
    pub quote_balance: Decimal,
    pub base_balance: Decimal,
    pub metrics: WorkerMetrics,
    pub consecutive_stop_losses: u32,
    pub last_stop_loss_at: Option<DateTime<Utc>>,
    pub last_dca_attempt_at: Option<DateTime<Utc>>,
    pub ban_until: Option<DateTime<Utc>>,
    pub config: SpotWorkerConfig,
    pub updated_at: DateTime<Utc>,
}

impl SpotWorkerState {
    #[must_use]
    pub fn new(config: SpotWorkerConfig) -> Self {
        Self {
            symbol: config.symbol.clone(),
            mode: config.mode,
            running: false,
            paused: false,
            position: None,
            quote_balance: Decimal::ZERO,
            base_balance: Decimal::ZERO,
            metrics: WorkerMetrics::default(),
            consecutive_stop_losses: 0,
            last_stop_loss_at: None,
            last_dca_attempt_at: None,
            ban_until: None,
            config,
            updated_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn key(&self) -> WorkerKey {
        WorkerKey::spot(self.mode, self.symbol.clone())
    }
}

/// One rung of the grid ladder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GridOrder {
    pub price: Decimal,
    pub side: Side,
    pub quantity: Decimal,
    pub order_id: Option<String>,
    pub status: OrderStatus,
    pub created_at: DateTime<Utc>,
    pub filled_at: Option<DateTime<Utc>>,
    /// Net profit booked by this fill (sell fills only).
    #[serde(default)]
    pub profit: Decimal,
    #[serde(default)]
    pub fee: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridWorkerState {
    pub symbol: String,
    pub mode: TradeMode,
    pub running: bool,
    pub paused: bool,
    pub lower: Decimal,
    pub upper: Decimal,
    pub levels: u32,
    pub capital: Decimal,
    pub active_orders: Vec<GridOrder>,
    /// Most recent fills, oldest first.
    pub filled_orders: Vec<GridOrder>,
    pub total_profit: Decimal,
    pub total_fees: Decimal,
    pub buy_fills: u64,
    pub sell_fills: u64,
    pub rebalance_count: u64,
    /// Base bought by the grid and not yet sold back.
    #[serde(default)]
    pub base_inventory: Decimal,
    /// Simulated quote balance, free plus locked. Unused in live mode.
    #[serde(default)]
    pub quote_balance: Decimal,
    pub ban_until: Option<DateTime<Utc>>,
    pub config: GridWorkerConfig,
    pub updated_at: DateTime<Utc>,
}

impl GridWorkerState {
    #[must_use]
    pub fn new(config: GridWorkerConfig, lower: Decimal, upper: Decimal, levels: u32) -> Self {
        Self {
            symbol: config.symbol.clone(),
            mode: config.mode,
            running: false,
            paused: false,
            lower,
            upper,
            levels,
            capital: config.capital,
            active_orders: Vec::new(),
            filled_orders: Vec::new(),
            total_profit: Decimal::ZERO,
            total_fees: Decimal::ZERO,
            buy_fills: 0,
            sell_fills: 0,
            rebalance_count: 0,
            base_inventory: Decimal::ZERO,
            quote_balance: Decimal::ZERO,
            ban_until: None,
            config,
            updated_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn key(&self) -> WorkerKey {
        WorkerKey::grid(self.mode, self.symbol.clone())
    }

    /// Distance between adjacent levels.
    #[must_use]
    pub fn step(&self) -> Decimal {
        if self.levels == 0 {
            return Decimal::ZERO;
        }
        (self.upper - self.lower) / Decimal::from(self.levels)
    }
}

/// Tagged persisted state of either worker kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum WorkerSnapshot {
    Spot(Box<SpotWorkerState>),
    Grid(Box<GridWorkerState>),
}

impl WorkerSnapshot {
    #[must_use]
    pub fn key(&self) -> WorkerKey {
        match self {
            Self::Spot(state) => state.key(),
            Self::Grid(state) => state.key(),
        }
    }

    #[must_use]
    pub fn running(&self) -> bool {
        match self {
            Self::Spot(state) => state.running,
            Self::Grid(state) => state.running,
        }
    }

    #[must_use]
    pub fn ban_until(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Spot(state) => state.ban_until,
            Self::Grid(state) => state.ban_until,
        }
    }
}

/// Realized performance of one worker as seen by the allocator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PnlStats {
    pub starting_basis: Decimal,
    pub realized_pnl: Decimal,
    pub trades: u64,
    pub wins: u64,
}

impl PnlStats {
    #[must_use]
    pub fn pnl_pct(&self) -> Decimal {
        if self.starting_basis.is_zero() {
            Decimal::ZERO
        } else {
            self.realized_pnl / self.starting_basis * Decimal::ONE_HUNDRED
        }
    }

    #[must_use]
    pub fn win_rate(&self) -> Decimal {
        if self.trades == 0 {
            Decimal::ZERO
        } else {
            Decimal::from(self.wins) / Decimal::from(self.trades)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub allocation: Allocation,
    pub reserved: Decimal,
}

/// Persisted form of the capital ledger.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerSnapshot {
    /// Monotonic mutation counter. A store never replaces a newer snapshot.
    pub version: u64,
    pub total_capital: Decimal,
    pub auto_compound: bool,
    pub reservations: BTreeMap<String, Reservation>,
    pub pnl: BTreeMap<String, PnlStats>,
    pub synced_balance: Option<Decimal>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TradeAction {
    Entry,
    Dca,
    Exit,
    StopLoss,
    Liquidation,
    GridBuy,
    GridSell,
}

impl TradeAction {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Entry => "entry",
            Self::Dca => "dca",
            Self::Exit => "exit",
            Self::StopLoss => "stop_loss",
            Self::Liquidation => "liquidation",
            Self::GridBuy => "grid_buy",
            Self::GridSell => "grid_sell",
        }
    }

    /// Actions that close out risk and carry a realized P&L.
    #[must_use]
    pub const fn is_closing(self) -> bool {
        matches!(
            self,
            Self::Exit | Self::StopLoss | Self::Liquidation | Self::GridSell
        )
    }
}

impl std::str::FromStr for TradeAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "entry" => Self::Entry,
            "dca" => Self::Dca,
            "exit" => Self::Exit,
            "stop_loss" => Self::StopLoss,
            "liquidation" => Self::Liquidation,
            "grid_buy" => Self::GridBuy,
            "grid_sell" => Self::GridSell,
            other => return Err(format!("unknown trade action: {other}")),
        })
    }
}

/// One journal row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradeRecord {
    pub worker: WorkerKey,
    pub action: TradeAction,
    pub side: Side,
    pub price: Decimal,
    pub quantity: Decimal,
    pub quote_amount: Decimal,
    pub fee: Decimal,
    /// Realized profit for closing actions.
    pub pnl: Option<Decimal>,
    pub order_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EquitySnapshot {
    pub worker: WorkerKey,
    pub equity: Decimal,
    pub quote_balance: Decimal,
    pub base_balance: Decimal,
    pub price: Decimal,
    pub timestamp: DateTime<Utc>,
}
