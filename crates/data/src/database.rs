use crate::error::{StoreError, StoreResult};
use crate::models::{EquityRow, TradeRow};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use spotgrid_core::config::DatabaseConfig;
use spotgrid_core::state::{
    EquitySnapshot, LedgerSnapshot, TradeRecord, WorkerKey, WorkerSnapshot,
};
use spotgrid_core::traits::{StateStore, TradeJournal};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;

/// SQLite-backed [`StateStore`] and [`TradeJournal`].
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Opens (creating if missing) the database at `url` and applies migrations.
    ///
    /// # Errors
    /// Returns an error if the connection or a migration fails.
    pub async fn connect(url: &str, max_connections: u32) -> StoreResult<Self> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        tracing::info!(url, "Opened state store");
        Ok(store)
    }

    /// # Errors
    /// Returns an error if the connection or a migration fails.
    pub async fn from_config(config: &DatabaseConfig) -> StoreResult<Self> {
        Self::connect(&config.url, config.max_connections).await
    }

    /// Private in-memory database. Limited to one connection that is never
    /// recycled, since each SQLite memory connection is its own database.
    ///
    /// # Errors
    /// Returns an error if the connection or a migration fails.
    pub async fn new_in_memory() -> StoreResult<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> StoreResult<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    #[must_use]
    pub const fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Equity snapshots of one worker since `since`, oldest first.
    ///
    /// # Errors
    /// Returns an error if the query fails or a row cannot be decoded.
    pub async fn equity_history(
        &self,
        key: &WorkerKey,
        since: DateTime<Utc>,
    ) -> StoreResult<Vec<EquitySnapshot>> {
        let rows = sqlx::query_as::<_, EquityRow>(
            r"
            SELECT kind, mode, symbol, equity, quote_balance, base_balance, price, timestamp_ms
            FROM equity_snapshots
            WHERE kind = ? AND mode = ? AND symbol = ? AND timestamp_ms >= ?
            ORDER BY timestamp_ms ASC, id ASC
            ",
        )
        .bind(key.kind.as_str())
        .bind(key.mode.to_string())
        .bind(&key.symbol)
        .bind(since.timestamp_millis())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(EquityRow::into_snapshot).collect()
    }

    async fn upsert_worker(&self, snapshot: &WorkerSnapshot) -> StoreResult<()> {
        let key = snapshot.key();
        let state_json = serde_json::to_string(snapshot)?;
        sqlx::query(
            r"
            INSERT INTO worker_states (kind, mode, symbol, running, state_json, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT (kind, mode, symbol) DO UPDATE
            SET running = excluded.running,
                state_json = excluded.state_json,
                updated_at = excluded.updated_at
            ",
        )
        .bind(key.kind.as_str())
        .bind(key.mode.to_string())
        .bind(&key.symbol)
        .bind(snapshot.running())
        .bind(state_json)
        .bind(Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn select_worker(&self, key: &WorkerKey) -> StoreResult<Option<WorkerSnapshot>> {
        let row: Option<(String,)> = sqlx::query_as(
            "SELECT state_json FROM worker_states WHERE kind = ? AND mode = ? AND symbol = ?",
        )
        .bind(key.kind.as_str())
        .bind(key.mode.to_string())
        .bind(&key.symbol)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|(json,)| serde_json::from_str(&json).map_err(StoreError::from))
            .transpose()
    }

    async fn select_workers(&self) -> StoreResult<Vec<WorkerSnapshot>> {
        let rows: Vec<(String, String, String, String)> = sqlx::query_as(
            "SELECT kind, mode, symbol, state_json FROM worker_states ORDER BY kind, mode, symbol",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut snapshots = Vec::with_capacity(rows.len());
        for (kind, mode, symbol, json) in rows {
            match serde_json::from_str::<WorkerSnapshot>(&json) {
                Ok(snapshot) => snapshots.push(snapshot),
                Err(e) => {
                    tracing::warn!(kind = %kind, mode = %mode, symbol = %symbol, error = %e, "Skipping unreadable worker state");
                }
            }
        }
        Ok(snapshots)
    }

    async fn upsert_ledger(&self, ledger: &LedgerSnapshot) -> StoreResult<()> {
        let version = i64::try_from(ledger.version)
            .map_err(|_| StoreError::corrupt("capital_ledger", "version overflows i64"))?;
        let result = sqlx::query(
            r"
            INSERT INTO capital_ledger (id, version, ledger_json, updated_at)
            VALUES (1, ?, ?, ?)
            ON CONFLICT (id) DO UPDATE
            SET version = excluded.version,
                ledger_json = excluded.ledger_json,
                updated_at = excluded.updated_at
            WHERE excluded.version >= capital_ledger.version
            ",
        )
        .bind(version)
        .bind(serde_json::to_string(ledger)?)
        .bind(Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            tracing::debug!(version = ledger.version, "Ignored stale ledger snapshot");
        }
        Ok(())
    }

    async fn select_ledger(&self) -> StoreResult<Option<LedgerSnapshot>> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT ledger_json FROM capital_ledger WHERE id = 1")
                .fetch_optional(&self.pool)
                .await?;
        row.map(|(json,)| serde_json::from_str(&json).map_err(StoreError::from))
            .transpose()
    }

    async fn insert_trade(&self, trade: &TradeRecord) -> StoreResult<()> {
        sqlx::query(
            r"
            INSERT INTO trades
                (kind, mode, symbol, action, side, price, quantity, quote_amount, fee, pnl,
                 order_id, timestamp_ms)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ",
        )
        .bind(trade.worker.kind.as_str())
        .bind(trade.worker.mode.to_string())
        .bind(&trade.worker.symbol)
        .bind(trade.action.as_str())
        .bind(trade.side.as_str())
        .bind(trade.price.to_string())
        .bind(trade.quantity.to_string())
        .bind(trade.quote_amount.to_string())
        .bind(trade.fee.to_string())
        .bind(trade.pnl.map(|p| p.to_string()))
        .bind(&trade.order_id)
        .bind(trade.timestamp.timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn insert_equity(&self, snapshot: &EquitySnapshot) -> StoreResult<()> {
        sqlx::query(
            r"
            INSERT INTO equity_snapshots
                (kind, mode, symbol, equity, quote_balance, base_balance, price, timestamp_ms)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ",
        )
        .bind(snapshot.worker.kind.as_str())
        .bind(snapshot.worker.mode.to_string())
        .bind(&snapshot.worker.symbol)
        .bind(snapshot.equity.to_string())
        .bind(snapshot.quote_balance.to_string())
        .bind(snapshot.base_balance.to_string())
        .bind(snapshot.price.to_string())
        .bind(snapshot.timestamp.timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn select_trades(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StoreResult<Vec<TradeRecord>> {
        let rows = sqlx::query_as::<_, TradeRow>(
            r"
            SELECT kind, mode, symbol, action, side, price, quantity, quote_amount, fee, pnl,
                   order_id, timestamp_ms
            FROM trades
            WHERE timestamp_ms >= ? AND timestamp_ms < ?
            ORDER BY timestamp_ms ASC, id ASC
            ",
        )
        .bind(start.timestamp_millis())
        .bind(end.timestamp_millis())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(TradeRow::into_record).collect()
    }
}

#[async_trait]
impl StateStore for SqliteStore {
    async fn save_worker_state(&self, snapshot: &WorkerSnapshot) -> Result<()> {
        Ok(self.upsert_worker(snapshot).await?)
    }

    async fn load_worker_state(&self, key: &WorkerKey) -> Result<Option<WorkerSnapshot>> {
        Ok(self.select_worker(key).await?)
    }

    async fn delete_worker_state(&self, key: &WorkerKey) -> Result<()> {
        sqlx::query("DELETE FROM worker_states WHERE kind = ? AND mode = ? AND symbol = ?")
            .bind(key.kind.as_str())
            .bind(key.mode.to_string())
            .bind(&key.symbol)
            .execute(&self.pool)
            .await
            .map_err(StoreError::from)?;
        Ok(())
    }

    async fn list_worker_states(&self) -> Result<Vec<WorkerSnapshot>> {
        Ok(self.select_workers().await?)
    }

    async fn save_ledger(&self, ledger: &LedgerSnapshot) -> Result<()> {
        Ok(self.upsert_ledger(ledger).await?)
    }

    async fn load_ledger(&self) -> Result<Option<LedgerSnapshot>> {
        Ok(self.select_ledger().await?)
    }
}

#[async_trait]
impl TradeJournal for SqliteStore {
    async fn record_trade(&self, trade: &TradeRecord) -> Result<()> {
        Ok(self.insert_trade(trade).await?)
    }

    async fn record_equity(&self, snapshot: &EquitySnapshot) -> Result<()> {
        Ok(self.insert_equity(snapshot).await?)
    }

    async fn trades_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<TradeRecord>> {
        Ok(self.select_trades(start, end).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use rust_decimal_macros::dec;
    use spotgrid_core::config::{GridWorkerConfig, SpotWorkerConfig};
    use spotgrid_core::events::{Side, TradeMode};
    use spotgrid_core::state::{GridWorkerState, SpotWorkerState, TradeAction};

    fn spot_snapshot(symbol: &str, running: bool) -> WorkerSnapshot {
        let mut state = SpotWorkerState::new(SpotWorkerConfig::new(symbol, TradeMode::Paper));
        state.running = running;
        state.quote_balance = dec!(1000);
        WorkerSnapshot::Spot(Box::new(state))
    }

    fn trade(action: TradeAction, pnl: Option<rust_decimal::Decimal>, ts: DateTime<Utc>) -> TradeRecord {
        TradeRecord {
            worker: WorkerKey::spot(TradeMode::Paper, "ETHUSDT"),
            action,
            side: if action.is_closing() { Side::Sell } else { Side::Buy },
            price: dec!(3000.12),
            quantity: dec!(0.1),
            quote_amount: dec!(300.012),
            fee: dec!(0.300012),
            pnl,
            order_id: Some("42".to_string()),
            timestamp: ts,
        }
    }

    #[tokio::test]
    async fn worker_state_upsert_and_delete() {
        let store = SqliteStore::new_in_memory().await.unwrap();
        let key = WorkerKey::spot(TradeMode::Paper, "ETHUSDT");
        assert!(store.load_worker_state(&key).await.unwrap().is_none());

        store.save_worker_state(&spot_snapshot("ETHUSDT", false)).await.unwrap();
        store.save_worker_state(&spot_snapshot("ETHUSDT", true)).await.unwrap();

        let loaded = store.load_worker_state(&key).await.unwrap().unwrap();
        assert!(loaded.running());
        assert_eq!(loaded.key(), key);

        store.delete_worker_state(&key).await.unwrap();
        assert!(store.load_worker_state(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn lists_both_worker_kinds() {
        let store = SqliteStore::new_in_memory().await.unwrap();
        store.save_worker_state(&spot_snapshot("ETHUSDT", true)).await.unwrap();
        let grid = GridWorkerState::new(
            GridWorkerConfig::new("SOLUSDT", TradeMode::Paper),
            dec!(140),
            dec!(160),
            4,
        );
        store
            .save_worker_state(&WorkerSnapshot::Grid(Box::new(grid)))
            .await
            .unwrap();

        let all = store.list_worker_states().await.unwrap();
        assert_eq!(all.len(), 2);
        assert!(matches!(all[0], WorkerSnapshot::Grid(_)));
        assert!(matches!(all[1], WorkerSnapshot::Spot(_)));
    }

    #[tokio::test]
    async fn stale_ledger_never_overwrites_newer() {
        let store = SqliteStore::new_in_memory().await.unwrap();
        let newer = LedgerSnapshot {
            version: 5,
            total_capital: dec!(1200),
            ..LedgerSnapshot::default()
        };
        let stale = LedgerSnapshot {
            version: 3,
            total_capital: dec!(900),
            ..LedgerSnapshot::default()
        };

        store.save_ledger(&newer).await.unwrap();
        store.save_ledger(&stale).await.unwrap();
        assert_eq!(store.load_ledger().await.unwrap(), Some(newer.clone()));

        let next = LedgerSnapshot {
            version: 6,
            ..newer
        };
        store.save_ledger(&next).await.unwrap();
        assert_eq!(store.load_ledger().await.unwrap().unwrap().version, 6);
    }

    #[tokio::test]
    async fn trades_are_range_filtered_and_keep_precision() {
        let store = SqliteStore::new_in_memory().await.unwrap();
        let day = Utc.with_ymd_and_hms(2024, 5, 14, 0, 0, 0).unwrap();
        store.record_trade(&trade(TradeAction::Entry, None, day)).await.unwrap();
        store
            .record_trade(&trade(TradeAction::Exit, Some(dec!(-1.25)), day + Duration::hours(3)))
            .await
            .unwrap();
        store
            .record_trade(&trade(TradeAction::Exit, Some(dec!(4)), day + Duration::days(1)))
            .await
            .unwrap();

        let trades = store
            .trades_between(day, day + Duration::days(1))
            .await
            .unwrap();
        assert_eq!(trades.len(), 2);
        assert_eq!(trades[0], trade(TradeAction::Entry, None, day));
        assert_eq!(trades[1].pnl, Some(dec!(-1.25)));
        assert_eq!(trades[1].fee, dec!(0.300012));
    }

    #[tokio::test]
    async fn equity_history_is_per_worker() {
        let store = SqliteStore::new_in_memory().await.unwrap();
        let eth = WorkerKey::spot(TradeMode::Paper, "ETHUSDT");
        let now = Utc.with_ymd_and_hms(2024, 5, 14, 12, 0, 0).unwrap();
        for (worker, equity) in [
            (eth.clone(), dec!(1000)),
            (WorkerKey::grid(TradeMode::Paper, "ETHUSDT"), dec!(50)),
            (eth.clone(), dec!(1010)),
        ] {
            store
                .record_equity(&EquitySnapshot {
                    worker,
                    equity,
                    quote_balance: equity,
                    base_balance: dec!(0),
                    price: dec!(3000),
                    timestamp: now,
                })
                .await
                .unwrap();
        }

        let history = store.equity_history(&eth, now).await.unwrap();
        let values: Vec<_> = history.iter().map(|s| s.equity).collect();
        assert_eq!(values, vec![dec!(1000), dec!(1010)]);
    }

    #[tokio::test]
    async fn file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("state.db").display());

        {
            let store = SqliteStore::connect(&url, 2).await.unwrap();
            store.save_worker_state(&spot_snapshot("BTCUSDT", true)).await.unwrap();
            store.pool().close().await;
        }

        let store = SqliteStore::connect(&url, 2).await.unwrap();
        let all = store.list_worker_states().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].key().symbol, "BTCUSDT");
    }
}
