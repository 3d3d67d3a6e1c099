pub mod capital;
pub mod commands;
pub mod context;
pub mod grid;
pub mod grid_worker;
pub mod notifier;
pub mod spot_worker;
pub mod supervisor;
pub mod venue;
pub mod worker_handle;

pub use capital::{AllocationCheck, AllocatorStatus, CapitalAllocator, WorkerAllocation};
pub use commands::{WorkerCommand, WorkerState, WorkerStatus};
pub use context::WorkerContext;
pub use grid::{auto_range, calculate_grid_levels, GridPerformance, GridRange};
pub use notifier::{FanoutNotifier, LogNotifier, TelegramNotifier};
pub use supervisor::{HealthReport, Supervisor};
pub use venue::OrderVenue;
pub use worker_handle::{StopOutcome, WorkerControl, WorkerExit, WorkerHandle, WorkerSpec};
