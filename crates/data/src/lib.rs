//! Persistence for the trading engine.
//!
//! - [`SqliteStore`]: worker state, capital ledger, trade journal and equity
//!   snapshots in SQLite, with embedded migrations
//! - [`summary`]: calendar-period summaries computed from the journal

pub mod database;
pub mod error;
mod models;
pub mod summary;

pub use database::SqliteStore;
pub use error::{StoreError, StoreResult};
