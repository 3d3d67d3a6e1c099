use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Equity points kept for the Sharpe estimate.
pub const EQUITY_HISTORY_CAPACITY: usize = 500;

/// Cumulative trading statistics for one worker.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerMetrics {
    pub trades: u64,
    pub wins: u64,
    pub losses: u64,
    pub gross_profit: Decimal,
    pub gross_loss: Decimal,
    pub consecutive_wins: u32,
    pub consecutive_losses: u32,
    pub max_consecutive_wins: u32,
    pub max_consecutive_losses: u32,
    pub total_fees: Decimal,
    pub total_slippage: Decimal,
    pub peak_equity: Decimal,
    /// Largest peak-to-trough decline as a fraction in `0..=1`.
    pub max_drawdown: Decimal,
    #[serde(default)]
    pub equity_history: VecDeque<Decimal>,
}

impl WorkerMetrics {
    /// Records a closed trade and updates the win/loss streaks.
    ///
    /// A break-even trade counts as a loss.
    pub fn record_trade(&mut self, pnl: Decimal) {
        self.trades += 1;
        if pnl > Decimal::ZERO {
            self.wins += 1;
            self.gross_profit += pnl;
            self.consecutive_wins += 1;
            self.consecutive_losses = 0;
            self.max_consecutive_wins = self.max_consecutive_wins.max(self.consecutive_wins);
        } else {
            self.losses += 1;
            self.gross_loss += pnl.abs();
            self.consecutive_losses += 1;
            self.consecutive_wins = 0;
            self.max_consecutive_losses = self.max_consecutive_losses.max(self.consecutive_losses);
        }
    }

    pub fn record_fee(&mut self, fee: Decimal) {
        self.total_fees += fee;
    }

    pub fn record_slippage(&mut self, slippage: Decimal) {
        self.total_slippage += slippage.abs();
    }

    /// Appends an equity observation, updating peak and drawdown.
    pub fn update_equity(&mut self, equity: Decimal) {
        if equity > self.peak_equity {
            self.peak_equity = equity;
        }
        if self.peak_equity > Decimal::ZERO {
            let drawdown = ((self.peak_equity - equity) / self.peak_equity)
                .max(Decimal::ZERO)
                .min(Decimal::ONE);
            if drawdown > self.max_drawdown {
                self.max_drawdown = drawdown;
            }
        }

        if self.equity_history.len() == EQUITY_HISTORY_CAPACITY {
            self.equity_history.pop_front();
        }
        self.equity_history.push_back(equity);
    }

    #[must_use]
    pub fn net_pnl(&self) -> Decimal {
        self.gross_profit - self.gross_loss
    }

    #[must_use]
    pub fn win_rate(&self) -> Decimal {
        if self.trades == 0 {
            return Decimal::ZERO;
        }
        Decimal::from(self.wins) / Decimal::from(self.trades)
    }

    /// Gross profit over gross loss; `None` without any losing trade.
    #[must_use]
    pub fn profit_factor(&self) -> Option<Decimal> {
        if self.gross_loss.is_zero() {
            return None;
        }
        Some(self.gross_profit / self.gross_loss)
    }

    /// Mean over standard deviation of the per-observation equity returns.
    #[must_use]
    pub fn sharpe_ratio(&self) -> f64 {
        let returns: Vec<f64> = self
            .equity_history
            .iter()
            .zip(self.equity_history.iter().skip(1))
            .filter(|(prev, _)| !prev.is_zero())
            .filter_map(|(prev, next)| ((*next - *prev) / *prev).to_f64())
            .collect();
        if returns.len() < 2 {
            return 0.0;
        }

        #[allow(clippy::cast_precision_loss)]
        let n = returns.len() as f64;
        let mean = returns.iter().sum::<f64>() / n;
        let variance = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / n;
        let std_dev = variance.sqrt();
        if std_dev > 0.0 {
            mean / std_dev
        } else {
            0.0
        }
    }
}
