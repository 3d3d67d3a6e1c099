#![allow(clippy::format_push_string)]

use crate::metrics::WorkerMetrics;
use crate::summary::PeriodSummary;
use rust_decimal::Decimal;

const RULE: &str = "───────────────────────────────────────────────\n";

pub struct MetricsFormatter;

impl MetricsFormatter {
    /// Plain-text period report, suitable for a chat message or a terminal.
    #[must_use]
    pub fn format_summary(summary: &PeriodSummary) -> String {
        let mut output = String::new();

        output.push_str(&format!("{} summary\n", summary.period.label()));
        output.push_str(RULE);
        output.push_str(&format!(
            "Period:        {} → {}\n",
            summary.start.format("%Y-%m-%d"),
            summary.end.format("%Y-%m-%d")
        ));

        if summary.trades == 0 {
            output.push_str("No closed trades in this period.\n");
            if !summary.fees.is_zero() {
                output.push_str(&format!("Fees:          {:.4}\n", summary.fees));
            }
            return output;
        }

        output.push_str(&format!(
            "Trades:        {} ({} wins / {} losses)\n",
            summary.trades, summary.wins, summary.losses
        ));
        output.push_str(&format!(
            "Win rate:      {:.1}%\n",
            summary.win_rate() * Decimal::ONE_HUNDRED
        ));
        output.push_str(&format!("Net P&L:       {:+.2}\n", summary.net_pnl));
        output.push_str(&format!("Fees:          {:.4}\n", summary.fees));
        if let Some(best) = summary.best {
            output.push_str(&format!("Best trade:    {best:+.2}\n"));
        }
        if let Some(worst) = summary.worst {
            output.push_str(&format!("Worst trade:   {worst:+.2}\n"));
        }

        output
    }

    #[must_use]
    pub fn format_worker(name: &str, metrics: &WorkerMetrics) -> String {
        let mut output = String::new();

        output.push_str(&format!("{name}\n"));
        output.push_str(RULE);
        output.push_str(&format!("Trades:        {}\n", metrics.trades));
        if metrics.trades > 0 {
            output.push_str(&format!(
                "Win rate:      {:.1}%\n",
                metrics.win_rate() * Decimal::ONE_HUNDRED
            ));
        } else {
            output.push_str("Win rate:      N/A (no trades)\n");
        }
        output.push_str(&format!("Net P&L:       {:+.2}\n", metrics.net_pnl()));
        match metrics.profit_factor() {
            Some(pf) => output.push_str(&format!("Profit factor: {pf:.2}\n")),
            None => output.push_str("Profit factor: N/A\n"),
        }
        output.push_str(&format!(
            "Max drawdown:  {:.2}%\n",
            metrics.max_drawdown * Decimal::ONE_HUNDRED
        ));
        output.push_str(&format!("Sharpe:        {:.3}\n", metrics.sharpe_ratio()));
        output.push_str(&format!(
            "Fees/slippage: {:.4} / {:.4}\n",
            metrics.total_fees, metrics.total_slippage
        ));
        output.push_str(&format!(
            "Streaks:       {}W / {}L max\n",
            metrics.max_consecutive_wins, metrics.max_consecutive_losses
        ));

        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::summary::SummaryPeriod;
    use chrono::{TimeZone, Utc};
    use rust_decimal_macros::dec;

    #[test]
    fn empty_period_says_so() {
        let summary = PeriodSummary {
            period: SummaryPeriod::Day,
            start: Utc.with_ymd_and_hms(2024, 5, 14, 0, 0, 0).unwrap(),
            end: Utc.with_ymd_and_hms(2024, 5, 15, 0, 0, 0).unwrap(),
            trades: 0,
            wins: 0,
            losses: 0,
            net_pnl: Decimal::ZERO,
            fees: Decimal::ZERO,
            best: None,
            worst: None,
        };
        let text = MetricsFormatter::format_summary(&summary);
        assert!(text.starts_with("Daily summary"));
        assert!(text.contains("No closed trades"));
    }

    #[test]
    fn worker_report_includes_win_rate() {
        let mut metrics = WorkerMetrics::default();
        metrics.record_trade(dec!(10));
        metrics.record_trade(dec!(-5));
        let text = MetricsFormatter::format_worker("spot:paper:ETHUSDT", &metrics);
        assert!(text.contains("Win rate:      50.0%"));
        assert!(text.contains("Profit factor: 2.00"));
    }
}
