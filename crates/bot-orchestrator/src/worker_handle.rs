use crate::commands::{WorkerCommand, WorkerState, WorkerStatus};
use anyhow::Result;
use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use rust_decimal::Decimal;
use spotgrid_core::config::{GridWorkerConfig, SpotWorkerConfig};
use spotgrid_core::error::ExchangeError;
use spotgrid_core::state::WorkerKey;
use spotgrid_core::traits::{Notification, Notifier};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Why a worker loop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerExit {
    /// Cancelled by the supervisor.
    Stopped,
    /// Process shutdown; the worker is restored on the next start.
    Shutdown,
    Banned(DateTime<Utc>),
    InsufficientFunds,
    Liquidated,
    Failed(String),
}

pub(crate) fn ban_exit(e: &ExchangeError) -> Option<WorkerExit> {
    e.ban_until().map(WorkerExit::Banned)
}

/// Latest config of a worker, kept so it can be restarted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerSpec {
    Spot(SpotWorkerConfig),
    Grid(GridWorkerConfig),
}

impl WorkerSpec {
    #[must_use]
    pub fn key(&self) -> WorkerKey {
        match self {
            Self::Spot(c) => WorkerKey::spot(c.mode, c.symbol.clone()),
            Self::Grid(c) => WorkerKey::grid(c.mode, c.symbol.clone()),
        }
    }

    #[must_use]
    pub const fn enabled(&self) -> bool {
        match self {
            Self::Spot(c) => c.enabled,
            Self::Grid(c) => c.enabled,
        }
    }
}

/// Cloneable command sender for one worker.
#[derive(Clone)]
pub struct WorkerControl {
    key: WorkerKey,
    tx: mpsc::Sender<WorkerCommand>,
}

impl WorkerControl {
    #[must_use]
    pub const fn new(key: WorkerKey, tx: mpsc::Sender<WorkerCommand>) -> Self {
        Self { key, tx }
    }

    #[must_use]
    pub const fn key(&self) -> &WorkerKey {
        &self.key
    }

    /// Pauses trading; the worker keeps publishing status.
    ///
    /// # Errors
    /// Returns an error if the worker has exited.
    pub async fn pause(&self) -> Result<()> {
        self.tx.send(WorkerCommand::Pause).await?;
        Ok(())
    }

    /// # Errors
    /// Returns an error if the worker has exited.
    pub async fn resume(&self) -> Result<()> {
        self.tx.send(WorkerCommand::Resume).await?;
        Ok(())
    }

    /// # Errors
    /// Returns an error if the worker has exited.
    pub async fn update_spot_config(&self, config: SpotWorkerConfig) -> Result<()> {
        self.tx
            .send(WorkerCommand::UpdateSpotConfig(Box::new(config)))
            .await?;
        Ok(())
    }

    /// # Errors
    /// Returns an error if the worker has exited.
    pub async fn update_grid_config(&self, config: GridWorkerConfig) -> Result<()> {
        self.tx
            .send(WorkerCommand::UpdateGridConfig(Box::new(config)))
            .await?;
        Ok(())
    }

    /// Asks the worker for a fresh status.
    ///
    /// # Errors
    /// Returns an error if the worker has exited or dropped the reply.
    pub async fn status(&self) -> Result<WorkerStatus> {
        let (tx, rx) = oneshot::channel();
        self.tx.send(WorkerCommand::GetStatus(tx)).await?;
        Ok(rx.await?)
    }

    /// Sells everything at market and waits for the realized profit. The
    /// worker exits afterwards.
    ///
    /// # Errors
    /// Returns an error if the worker has exited or the liquidation failed.
    pub async fn liquidate(&self) -> Result<Decimal> {
        let (tx, rx) = oneshot::channel();
        self.tx.send(WorkerCommand::Liquidate(tx)).await?;
        rx.await?
    }

    /// # Errors
    /// Returns an error if the worker has already exited.
    pub async fn shutdown(&self) -> Result<()> {
        self.tx.send(WorkerCommand::Shutdown).await?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    Clean,
    /// The task outlived the stop timeout and was aborted.
    Zombie,
}

/// Supervisor-side handle of a running worker task.
pub struct WorkerHandle {
    pub control: WorkerControl,
    pub status_rx: watch::Receiver<WorkerStatus>,
    pub cancel: CancellationToken,
    pub join: JoinHandle<()>,
    pub spec: WorkerSpec,
}

impl WorkerHandle {
    #[must_use]
    pub fn latest_status(&self) -> WorkerStatus {
        self.status_rx.borrow().clone()
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Cancels the worker and waits up to `timeout` for it to exit.
    pub async fn stop(self, timeout: Duration) -> StopOutcome {
        self.cancel.cancel();
        self.join_within(timeout).await
    }

    /// Waits up to `timeout` for an already signalled worker, aborting it
    /// on expiry.
    pub async fn join_within(mut self, timeout: Duration) -> StopOutcome {
        match tokio::time::timeout(timeout, &mut self.join).await {
            Ok(Ok(())) => StopOutcome::Clean,
            Ok(Err(e)) => {
                tracing::warn!(worker = %self.control.key, error = %e, "Worker task ended abnormally");
                StopOutcome::Clean
            }
            Err(_) => {
                tracing::error!(
                    worker = %self.control.key,
                    timeout_secs = timeout.as_secs(),
                    "Worker did not stop in time, aborting zombie task"
                );
                self.join.abort();
                StopOutcome::Zombie
            }
        }
    }
}

/// Spawns a worker future, turning a panic into a logged failure and a
/// critical notification instead of a silent task death.
pub fn spawn_guarded<F>(
    key: WorkerKey,
    status_tx: watch::Sender<WorkerStatus>,
    notifier: Arc<dyn Notifier>,
    worker: F,
) -> JoinHandle<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(panic) = AssertUnwindSafe(worker).catch_unwind().await {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| (*s).to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            tracing::error!(worker = %key, panic = %message, "Worker panicked");
            status_tx.send_modify(|status| {
                status.state = WorkerState::Failed;
                status.error = Some(message.clone());
            });
            if let Err(e) = notifier
                .notify(&Notification::critical(
                    format!("Worker {key} crashed"),
                    message,
                ))
                .await
            {
                tracing::warn!(worker = %key, error = %e, "Failed to send crash notification");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifier::LogNotifier;
    use spotgrid_core::events::TradeMode;

    fn handle_for(join: JoinHandle<()>, cancel: CancellationToken) -> WorkerHandle {
        let key = WorkerKey::spot(TradeMode::Paper, "ETHUSDT");
        let (tx, _rx) = mpsc::channel(1);
        let (_status_tx, status_rx) = watch::channel(WorkerStatus::new(key.clone()));
        WorkerHandle {
            control: WorkerControl::new(key, tx),
            status_rx,
            cancel,
            join,
            spec: WorkerSpec::Spot(SpotWorkerConfig::new("ETHUSDT", TradeMode::Paper)),
        }
    }

    #[tokio::test]
    async fn cooperative_worker_stops_cleanly() {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let join = tokio::spawn(async move { token.cancelled().await });
        let handle = handle_for(join, cancel);
        assert_eq!(handle.stop(Duration::from_secs(1)).await, StopOutcome::Clean);
    }

    #[tokio::test]
    async fn stuck_worker_is_aborted() {
        let join = tokio::spawn(async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        });
        let handle = handle_for(join, CancellationToken::new());
        assert_eq!(handle.stop(Duration::from_millis(50)).await, StopOutcome::Zombie);
    }

    #[tokio::test]
    async fn panic_marks_status_failed() {
        let key = WorkerKey::grid(TradeMode::Paper, "SOLUSDT");
        let (status_tx, status_rx) = watch::channel(WorkerStatus::new(key.clone()));
        let join = spawn_guarded(key, status_tx, Arc::new(LogNotifier), async {
            panic!("boom");
        });
        join.await.unwrap();
        let status = status_rx.borrow().clone();
        assert_eq!(status.state, WorkerState::Failed);
        assert_eq!(status.error.as_deref(), Some("boom"));
    }
}
