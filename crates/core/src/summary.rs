//! Calendar-period trade summaries.

use crate::state::TradeRecord;
use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SummaryPeriod {
    Day,
    Week,
    Month,
    Year,
}

impl SummaryPeriod {
    pub const ALL: [Self; 4] = [Self::Day, Self::Week, Self::Month, Self::Year];

    /// Start of the period containing `now`. Weeks start on Monday, all in UTC.
    #[must_use]
    pub fn current_start(self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let today = now.date_naive();
        let date = match self {
            Self::Day => today,
            Self::Week => {
                today - Duration::days(i64::from(today.weekday().num_days_from_monday()))
            }
            Self::Month => NaiveDate::from_ymd_opt(today.year(), today.month(), 1)?,
            Self::Year => NaiveDate::from_ymd_opt(today.year(), 1, 1)?,
        };
        Some(date.and_hms_opt(0, 0, 0)?.and_utc())
    }

    /// `[start, end)` of the last fully completed period before `now`.
    #[must_use]
    pub fn previous_bounds(self, now: DateTime<Utc>) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        let end = self.current_start(now)?;
        let start = self.current_start(end - Duration::seconds(1))?;
        Some((start, end))
    }

    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Day => "Daily",
            Self::Week => "Weekly",
            Self::Month => "Monthly",
            Self::Year => "Yearly",
        }
    }
}

impl fmt::Display for SummaryPeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Day => "day",
            Self::Week => "week",
            Self::Month => "month",
            Self::Year => "year",
        };
        f.write_str(name)
    }
}

impl FromStr for SummaryPeriod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "day" | "daily" => Ok(Self::Day),
            "week" | "weekly" => Ok(Self::Week),
            "month" | "monthly" => Ok(Self::Month),
            "year" | "yearly" => Ok(Self::Year),
            other => Err(format!("unknown period: {other}")),
        }
    }
}

/// Aggregate of the closing trades in one period.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeriodSummary {
    pub period: SummaryPeriod,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub trades: u64,
    pub wins: u64,
    pub losses: u64,
    pub net_pnl: Decimal,
    pub fees: Decimal,
    pub best: Option<Decimal>,
    pub worst: Option<Decimal>,
}

impl PeriodSummary {
    /// Summarizes `trades` that fall inside `[start, end)`.
    ///
    /// Only closing trades count toward wins and P&L; fees are summed over all.
    #[must_use]
    pub fn from_trades(
        period: SummaryPeriod,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        trades: &[TradeRecord],
    ) -> Self {
        let mut summary = Self {
            period,
            start,
            end,
            trades: 0,
            wins: 0,
            losses: 0,
            net_pnl: Decimal::ZERO,
            fees: Decimal::ZERO,
            best: None,
            worst: None,
        };

        for trade in trades
            .iter()
            .filter(|t| t.timestamp >= start && t.timestamp < end)
        {
            summary.fees += trade.fee;
            if !trade.action.is_closing() {
                continue;
            }
            let pnl = trade.pnl.unwrap_or(Decimal::ZERO);
            summary.trades += 1;
            if pnl > Decimal::ZERO {
                summary.wins += 1;
            } else {
                summary.losses += 1;
            }
            summary.net_pnl += pnl;
            summary.best = Some(summary.best.map_or(pnl, |b| b.max(pnl)));
            summary.worst = Some(summary.worst.map_or(pnl, |w| w.min(pnl)));
        }

        summary
    }

    #[must_use]
    pub fn win_rate(&self) -> Decimal {
        if self.trades == 0 {
            return Decimal::ZERO;
        }
        Decimal::from(self.wins) / Decimal::from(self.trades)
    }
}
