//! Row types and their conversion back into domain records.

use crate::error::{StoreError, StoreResult};
use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use spotgrid_core::state::{EquitySnapshot, TradeRecord, WorkerKey};
use std::str::FromStr;

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct TradeRow {
    pub kind: String,
    pub mode: String,
    pub symbol: String,
    pub action: String,
    pub side: String,
    pub price: String,
    pub quantity: String,
    pub quote_amount: String,
    pub fee: String,
    pub pnl: Option<String>,
    pub order_id: Option<String>,
    pub timestamp_ms: i64,
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct EquityRow {
    pub kind: String,
    pub mode: String,
    pub symbol: String,
    pub equity: String,
    pub quote_balance: String,
    pub base_balance: String,
    pub price: String,
    pub timestamp_ms: i64,
}

fn parse<T: FromStr>(table: &'static str, field: &str, raw: &str) -> StoreResult<T>
where
    T::Err: std::fmt::Display,
{
    raw.parse::<T>()
        .map_err(|e| StoreError::corrupt(table, format!("{field} = {raw:?}: {e}")))
}

fn decimal(table: &'static str, field: &str, raw: &str) -> StoreResult<Decimal> {
    parse::<Decimal>(table, field, raw)
}

pub(crate) fn timestamp(table: &'static str, millis: i64) -> StoreResult<DateTime<Utc>> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .ok_or_else(|| StoreError::corrupt(table, format!("timestamp {millis} out of range")))
}

fn worker_key(table: &'static str, kind: &str, mode: &str, symbol: String) -> StoreResult<WorkerKey> {
    Ok(WorkerKey {
        kind: parse(table, "kind", kind)?,
        mode: parse(table, "mode", mode)?,
        symbol,
    })
}

impl TradeRow {
    pub(crate) fn into_record(self) -> StoreResult<TradeRecord> {
        const T: &str = "trades";
        Ok(TradeRecord {
            worker: worker_key(T, &self.kind, &self.mode, self.symbol)?,
            action: parse(T, "action", &self.action)?,
            side: parse(T, "side", &self.side)?,
            price: decimal(T, "price", &self.price)?,
            quantity: decimal(T, "quantity", &self.quantity)?,
            quote_amount: decimal(T, "quote_amount", &self.quote_amount)?,
            fee: decimal(T, "fee", &self.fee)?,
            pnl: self.pnl.as_deref().map(|p| decimal(T, "pnl", p)).transpose()?,
            order_id: self.order_id,
            timestamp: timestamp(T, self.timestamp_ms)?,
        })
    }
}

impl EquityRow {
    pub(crate) fn into_snapshot(self) -> StoreResult<EquitySnapshot> {
        const T: &str = "equity_snapshots";
        Ok(EquitySnapshot {
            worker: worker_key(T, &self.kind, &self.mode, self.symbol)?,
            equity: decimal(T, "equity", &self.equity)?,
            quote_balance: decimal(T, "quote_balance", &self.quote_balance)?,
            base_balance: decimal(T, "base_balance", &self.base_balance)?,
            price: decimal(T, "price", &self.price)?,
            timestamp: timestamp(T, self.timestamp_ms)?,
        })
    }
}
