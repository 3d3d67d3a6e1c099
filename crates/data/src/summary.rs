//! Period summaries read from the trade journal.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use spotgrid_core::summary::{PeriodSummary, SummaryPeriod};
use spotgrid_core::traits::TradeJournal;

/// Summary of `[start, end)`.
///
/// # Errors
/// Returns an error if the journal query fails.
pub async fn summarize<J: TradeJournal + ?Sized>(
    journal: &J,
    period: SummaryPeriod,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Result<PeriodSummary> {
    let trades = journal
        .trades_between(start, end)
        .await
        .with_context(|| format!("Failed to read trades for {period} summary"))?;
    Ok(PeriodSummary::from_trades(period, start, end, &trades))
}

/// Summary of the last completed period before `now`.
///
/// # Errors
/// Returns an error if the period bounds cannot be computed or the query fails.
pub async fn previous_period<J: TradeJournal + ?Sized>(
    journal: &J,
    period: SummaryPeriod,
    now: DateTime<Utc>,
) -> Result<PeriodSummary> {
    let (start, end) = period
        .previous_bounds(now)
        .with_context(|| format!("No previous {period} before {now}"))?;
    summarize(journal, period, start, end).await
}

/// Summary of the period in progress, up to `now`.
///
/// # Errors
/// Returns an error if the period start cannot be computed or the query fails.
pub async fn period_to_date<J: TradeJournal + ?Sized>(
    journal: &J,
    period: SummaryPeriod,
    now: DateTime<Utc>,
) -> Result<PeriodSummary> {
    let start = period
        .current_start(now)
        .with_context(|| format!("No {period} start for {now}"))?;
    summarize(journal, period, start, now).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SqliteStore;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;
    use spotgrid_core::events::{Side, TradeMode};
    use spotgrid_core::state::{TradeAction, TradeRecord, WorkerKey};

    fn grid_sell(profit: rust_decimal::Decimal, ts: DateTime<Utc>) -> TradeRecord {
        TradeRecord {
            worker: WorkerKey::grid(TradeMode::Paper, "ETHUSDT"),
            action: TradeAction::GridSell,
            side: Side::Sell,
            price: dec!(3100),
            quantity: dec!(0.01),
            quote_amount: dec!(31),
            fee: dec!(0.031),
            pnl: Some(profit),
            order_id: None,
            timestamp: ts,
        }
    }

    #[tokio::test]
    async fn previous_day_summary_from_store() {
        let store = SqliteStore::new_in_memory().await.unwrap();
        let at = |d, h| Utc.with_ymd_and_hms(2024, 5, d, h, 0, 0).unwrap();
        store.record_trade(&grid_sell(dec!(0.9), at(14, 9))).await.unwrap();
        store.record_trade(&grid_sell(dec!(0.9), at(14, 18))).await.unwrap();
        store.record_trade(&grid_sell(dec!(0.9), at(15, 1))).await.unwrap();

        let summary = previous_period(&store, SummaryPeriod::Day, at(15, 10)).await.unwrap();
        assert_eq!(summary.trades, 2);
        assert_eq!(summary.wins, 2);
        assert_eq!(summary.net_pnl, dec!(1.8));

        let today = period_to_date(&store, SummaryPeriod::Day, at(15, 10)).await.unwrap();
        assert_eq!(today.trades, 1);
    }
}
