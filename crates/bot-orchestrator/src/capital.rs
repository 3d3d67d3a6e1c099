//! Process-wide capital ledger shared by every worker.
//!
//! The ledger lives behind a `parking_lot` mutex that is never held across an
//! `.await`: each mutation bumps the version and clones the snapshot under the
//! lock, then the clone is flushed to the store after the lock is released.
//! The in-memory ledger is authoritative; the store is best effort.

use anyhow::Result;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::Serialize;
use spotgrid_core::config::{Allocation, CapitalConfig};
use spotgrid_core::events::AccountSnapshot;
use spotgrid_core::state::{LedgerSnapshot, PnlStats, Reservation};
use spotgrid_core::traits::StateStore;
use std::sync::Arc;

/// Result of comparing reservations against capital.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AllocationCheck {
    pub valid: bool,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerAllocation {
    pub worker: String,
    pub allocation: Option<Allocation>,
    pub reserved: Decimal,
    pub pnl: Option<PnlStats>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AllocatorStatus {
    pub total_capital: Decimal,
    pub reserved: Decimal,
    pub unallocated: Decimal,
    pub combined_pnl: Decimal,
    pub auto_compound: bool,
    pub synced_balance: Option<Decimal>,
    pub workers: Vec<WorkerAllocation>,
}

pub struct CapitalAllocator {
    ledger: Mutex<LedgerSnapshot>,
    store: Option<Arc<dyn StateStore>>,
}

impl std::fmt::Debug for CapitalAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapitalAllocator")
            .field("ledger", &*self.ledger.lock())
            .field("persistent", &self.store.is_some())
            .finish()
    }
}

fn reserve(allocation: Allocation, total: Decimal) -> Decimal {
    match allocation {
        Allocation::Percent(p) => total * p,
        Allocation::Fixed(amount) => amount.min(total),
    }
}

fn recalculate(ledger: &mut LedgerSnapshot) {
    let total = ledger.total_capital;
    for reservation in ledger.reservations.values_mut() {
        reservation.reserved = reserve(reservation.allocation, total);
    }
}

fn reserved_sum(ledger: &LedgerSnapshot) -> Decimal {
    ledger.reservations.values().map(|r| r.reserved).sum()
}

impl CapitalAllocator {
    #[must_use]
    pub fn new(total_capital: Decimal, auto_compound: bool, store: Option<Arc<dyn StateStore>>) -> Self {
        Self::from_snapshot(
            LedgerSnapshot {
                total_capital,
                auto_compound,
                ..LedgerSnapshot::default()
            },
            store,
        )
    }

    #[must_use]
    pub fn from_snapshot(snapshot: LedgerSnapshot, store: Option<Arc<dyn StateStore>>) -> Self {
        Self {
            ledger: Mutex::new(snapshot),
            store,
        }
    }

    /// Restores the persisted ledger, or starts a fresh one from `config`.
    ///
    /// The configured auto-compound flag always wins over the persisted one.
    /// A failing store is logged and treated as empty.
    pub async fn load(store: Arc<dyn StateStore>, config: &CapitalConfig) -> Self {
        let persisted = match store.load_ledger().await {
            Ok(ledger) => ledger,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to load capital ledger, starting fresh");
                None
            }
        };
        let snapshot = match persisted {
            Some(mut ledger) => {
                tracing::info!(
                    total = %ledger.total_capital,
                    reservations = ledger.reservations.len(),
                    version = ledger.version,
                    "Restored capital ledger"
                );
                ledger.auto_compound = config.auto_compound;
                ledger
            }
            None => LedgerSnapshot {
                total_capital: config.total_capital,
                auto_compound: config.auto_compound,
                ..LedgerSnapshot::default()
            },
        };
        Self::from_snapshot(snapshot, Some(store))
    }

    /// Applies `f` under the lock, bumps the version and flushes the result.
    async fn mutate<T>(&self, f: impl FnOnce(&mut LedgerSnapshot) -> T) -> T {
        let (out, snapshot) = {
            let mut ledger = self.ledger.lock();
            let out = f(&mut ledger);
            ledger.version += 1;
            (out, ledger.clone())
        };
        self.flush(&snapshot).await;
        out
    }

    async fn flush(&self, snapshot: &LedgerSnapshot) {
        if let Some(store) = &self.store {
            if let Err(e) = store.save_ledger(snapshot).await {
                tracing::warn!(version = snapshot.version, error = %e, "Failed to persist capital ledger");
            }
        }
    }

    #[must_use]
    pub fn snapshot(&self) -> LedgerSnapshot {
        self.ledger.lock().clone()
    }

    #[must_use]
    pub fn total_capital(&self) -> Decimal {
        self.ledger.lock().total_capital
    }

    /// Sets the capital pool and re-derives every reservation from it.
    ///
    /// # Errors
    /// Rejects a negative amount.
    pub async fn set_total(&self, amount: Decimal) -> Result<()> {
        if amount < Decimal::ZERO {
            anyhow::bail!("Total capital cannot be negative: {amount}");
        }
        self.mutate(|ledger| {
            ledger.total_capital = amount;
            recalculate(ledger);
        })
        .await;
        tracing::info!(total = %amount, "Total capital set");
        Ok(())
    }

    /// Reserves capital for `worker`, replacing any previous reservation.
    ///
    /// Returns the reserved amount.
    ///
    /// # Errors
    /// Rejects a percentage outside `0..=1` or a negative fixed amount.
    pub async fn allocate(&self, worker: &str, allocation: Allocation) -> Result<Decimal> {
        match allocation {
            Allocation::Percent(p) if p < Decimal::ZERO || p > Decimal::ONE => {
                anyhow::bail!("Allocation percent {p} for {worker} is outside 0..=1");
            }
            Allocation::Fixed(amount) if amount < Decimal::ZERO => {
                anyhow::bail!("Fixed allocation {amount} for {worker} is negative");
            }
            _ => {}
        }

        let reserved = self
            .mutate(|ledger| {
                let reserved = reserve(allocation, ledger.total_capital);
                ledger.reservations.insert(
                    worker.to_string(),
                    Reservation {
                        allocation,
                        reserved,
                    },
                );
                ledger
                    .pnl
                    .entry(worker.to_string())
                    .or_insert_with(|| PnlStats {
                        starting_basis: reserved,
                        ..PnlStats::default()
                    });
                reserved
            })
            .await;
        tracing::info!(%worker, ?allocation, %reserved, "Capital allocated");
        Ok(reserved)
    }

    /// Drops the reservation of `worker`. Returns false if there was none.
    pub async fn release(&self, worker: &str) -> bool {
        let exists = self.ledger.lock().reservations.contains_key(worker);
        if !exists {
            return false;
        }
        let removed = self
            .mutate(|ledger| ledger.reservations.remove(worker).is_some())
            .await;
        if removed {
            tracing::info!(%worker, "Capital released");
        }
        removed
    }

    /// Capital reserved for `worker`; zero without a reservation.
    #[must_use]
    pub fn available(&self, worker: &str) -> Decimal {
        self.ledger
            .lock()
            .reservations
            .get(worker)
            .map_or(Decimal::ZERO, |r| r.reserved)
    }

    #[must_use]
    pub fn reservation(&self, worker: &str) -> Option<Reservation> {
        self.ledger.lock().reservations.get(worker).cloned()
    }

    #[must_use]
    pub fn unallocated(&self) -> Decimal {
        let ledger = self.ledger.lock();
        (ledger.total_capital - reserved_sum(&ledger)).max(Decimal::ZERO)
    }

    /// Books a closed trade.
    ///
    /// With auto-compound on, a profit grows both the pool and the worker's
    /// reservation by exactly the profit. Percentage reservations of other
    /// workers follow the larger pool.
    pub async fn record_trade(&self, worker: &str, profit: Decimal, is_win: bool) {
        let compounded = self
            .mutate(|ledger| {
                let stats = ledger.pnl.entry(worker.to_string()).or_default();
                stats.realized_pnl += profit;
                stats.trades += 1;
                if is_win {
                    stats.wins += 1;
                }

                if !ledger.auto_compound || profit <= Decimal::ZERO {
                    return false;
                }
                let Some(current) = ledger.reservations.get(worker).cloned() else {
                    return false;
                };
                ledger.total_capital += profit;
                let grown = current.reserved + profit;
                let allocation = match current.allocation {
                    Allocation::Fixed(amount) => Allocation::Fixed(amount + profit),
                    Allocation::Percent(_) => Allocation::Percent(grown / ledger.total_capital),
                };
                ledger.reservations.insert(
                    worker.to_string(),
                    Reservation {
                        allocation,
                        reserved: grown,
                    },
                );
                recalculate(ledger);
                true
            })
            .await;

        tracing::debug!(%worker, %profit, is_win, compounded, "Trade recorded with allocator");
    }

    #[must_use]
    pub fn pnl(&self, worker: &str) -> Option<PnlStats> {
        self.ledger.lock().pnl.get(worker).cloned()
    }

    /// Zeroes the P&L of one worker, or of all workers with `None`. The new
    /// starting basis is the worker's current reservation.
    pub async fn reset_pnl(&self, worker: Option<&str>) {
        self.mutate(|ledger| {
            let reserved = |id: &str| {
                ledger
                    .reservations
                    .get(id)
                    .map_or(Decimal::ZERO, |r| r.reserved)
            };
            let ids: Vec<String> = match worker {
                Some(id) if ledger.pnl.contains_key(id) => vec![id.to_string()],
                Some(_) => Vec::new(),
                None => ledger.pnl.keys().cloned().collect(),
            };
            let fresh: Vec<(String, PnlStats)> = ids
                .into_iter()
                .map(|id| {
                    let stats = PnlStats {
                        starting_basis: reserved(&id),
                        ..PnlStats::default()
                    };
                    (id, stats)
                })
                .collect();
            ledger.pnl.extend(fresh);
        })
        .await;
    }

    pub async fn set_auto_compound(&self, enabled: bool) {
        self.mutate(|ledger| ledger.auto_compound = enabled).await;
        tracing::info!(enabled, "Auto-compound updated");
    }

    /// Adopts the account's quote holdings (free plus locked) as the pool.
    pub async fn sync_from_exchange(&self, account: &AccountSnapshot, quote_asset: &str) -> Decimal {
        let balance = account.total(quote_asset);
        self.mutate(|ledger| {
            ledger.synced_balance = Some(balance);
            ledger.total_capital = balance;
            recalculate(ledger);
        })
        .await;
        tracing::info!(asset = %quote_asset, %balance, "Capital synced from exchange");
        balance
    }

    /// Reports over-allocation against the pool and the last synced balance.
    /// Nothing is corrected.
    #[must_use]
    pub fn validate_allocation(&self) -> AllocationCheck {
        let ledger = self.ledger.lock();
        let reserved = reserved_sum(&ledger);
        if reserved > ledger.total_capital {
            return AllocationCheck {
                valid: false,
                message: format!(
                    "Over-allocated! Reserved {reserved} exceeds total capital {}",
                    ledger.total_capital
                ),
            };
        }
        match ledger.synced_balance {
            None => AllocationCheck {
                valid: true,
                message: "No exchange balance synced yet".to_string(),
            },
            Some(balance) if reserved > balance => AllocationCheck {
                valid: false,
                message: format!("Over-allocated! Reserved {reserved} exceeds exchange balance {balance}"),
            },
            Some(balance) => AllocationCheck {
                valid: true,
                message: format!("Reserved {reserved} of {balance} exchange balance"),
            },
        }
    }

    #[must_use]
    pub fn status(&self) -> AllocatorStatus {
        let ledger = self.ledger.lock();
        let reserved = reserved_sum(&ledger);

        let mut ids: Vec<&String> = ledger.reservations.keys().chain(ledger.pnl.keys()).collect();
        ids.sort();
        ids.dedup();
        let workers = ids
            .into_iter()
            .map(|id| {
                let reservation = ledger.reservations.get(id);
                WorkerAllocation {
                    worker: id.clone(),
                    allocation: reservation.map(|r| r.allocation),
                    reserved: reservation.map_or(Decimal::ZERO, |r| r.reserved),
                    pnl: ledger.pnl.get(id).cloned(),
                }
            })
            .collect();

        AllocatorStatus {
            total_capital: ledger.total_capital,
            reserved,
            unallocated: (ledger.total_capital - reserved).max(Decimal::ZERO),
            combined_pnl: ledger.pnl.values().map(|p| p.realized_pnl).sum(),
            auto_compound: ledger.auto_compound,
            synced_balance: ledger.synced_balance,
            workers,
        }
    }
}
