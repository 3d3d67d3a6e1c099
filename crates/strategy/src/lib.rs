pub mod dynamic_settings;
pub mod entry_filters;
pub mod exit_rules;
pub mod risk_manager;
pub mod signal_engine;
pub mod state;

pub use dynamic_settings::DynamicSettings;
pub use entry_filters::{check_entry, EntrySnapshot};
pub use exit_rules::{break_even_price, check_exit, stop_loss_price, trailing_trigger};
pub use risk_manager::{BuySize, RiskSizer, SizingInputs, SizingMethod};
pub use signal_engine::{Decision, ExternalScores, RejectReason, SignalEngine};
pub use state::StrategyState;
