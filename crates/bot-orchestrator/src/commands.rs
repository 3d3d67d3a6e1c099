use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use spotgrid_core::config::{GridWorkerConfig, SpotWorkerConfig};
use spotgrid_core::position::Position;
use spotgrid_core::state::WorkerKey;
use tokio::sync::oneshot;

#[derive(Debug)]
pub enum WorkerCommand {
    Pause,
    Resume,
    UpdateSpotConfig(Box<SpotWorkerConfig>),
    UpdateGridConfig(Box<GridWorkerConfig>),
    GetStatus(oneshot::Sender<WorkerStatus>),
    /// Close everything at market, reply with realized profit, then exit.
    Liquidate(oneshot::Sender<anyhow::Result<Decimal>>),
    /// Exit without touching the persisted `running` flag so the worker is
    /// restored on the next start.
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerState {
    Starting,
    Running,
    Paused,
    Stopped,
    Banned,
    Failed,
}

impl WorkerState {
    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Starting | Self::Running | Self::Paused)
    }
}

/// Point-in-time view of a worker, published on every tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerStatus {
    pub key: WorkerKey,
    pub state: WorkerState,
    pub last_activity: DateTime<Utc>,
    pub last_price: Option<Decimal>,
    pub position: Option<Position>,
    pub equity: Decimal,
    pub realized_pnl: Decimal,
    pub trades: u64,
    pub open_orders: usize,
    pub ban_until: Option<DateTime<Utc>>,
    pub last_rejection: Option<String>,
    pub error: Option<String>,
}

impl WorkerStatus {
    #[must_use]
    pub fn new(key: WorkerKey) -> Self {
        Self {
            key,
            state: WorkerState::Starting,
            last_activity: Utc::now(),
            last_price: None,
            position: None,
            equity: Decimal::ZERO,
            realized_pnl: Decimal::ZERO,
            trades: 0,
            open_orders: 0,
            ban_until: None,
            last_rejection: None,
            error: None,
        }
    }
}
