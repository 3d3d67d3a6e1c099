pub mod config;
pub mod config_loader;
pub mod config_watcher;
pub mod error;
pub mod events;
pub mod indicators;
pub mod metrics;
pub mod metrics_formatter;
pub mod position;
pub mod position_sizing;
pub mod precision;
pub mod state;
pub mod summary;
pub mod traits;

pub use config::{
    Allocation, AppConfig, CapitalConfig, DatabaseConfig, ExchangeConfig, GridWorkerConfig,
    MarketDataConfig, NotifierConfig, SpotWorkerConfig, StrategyConfig, SupervisorConfig,
};
pub use config_loader::ConfigLoader;
pub use config_watcher::ConfigWatcher;
pub use error::{ExchangeError, ExchangeResult, ExecutionOutcome};
pub use events::{
    split_symbol, AccountSnapshot, AssetBalance, Kline, LimitOrder, MarketOrder, OrderAck,
    OrderAmount, OrderFill, OrderStatus, Side, SymbolFilters, Ticker, TradeMode,
};
pub use metrics::WorkerMetrics;
pub use metrics_formatter::MetricsFormatter;
pub use position::Position;
pub use precision::round_step;
pub use state::{
    EquitySnapshot, GridOrder, GridWorkerState, LedgerSnapshot, PnlStats, Reservation,
    SpotWorkerState, TradeAction, TradeRecord, WorkerKey, WorkerKind, WorkerSnapshot,
};
pub use summary::{PeriodSummary, SummaryPeriod};
pub use traits::{
    ExchangeClient, Notification, NotificationLevel, Notifier, StateStore, TradeJournal,
};
