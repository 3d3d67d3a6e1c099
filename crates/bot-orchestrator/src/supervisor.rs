//! Owns the worker registries and the shared services.
//!
//! One registry per worker kind, each behind its own async mutex. Commands
//! that only talk to a worker clone its control under the lock and send
//! outside it; stop holds the lock for the bounded join so a key cannot be
//! restarted while its old task is still winding down.

use crate::capital::CapitalAllocator;
use crate::commands::{WorkerState, WorkerStatus};
use crate::context::WorkerContext;
use crate::worker_handle::{StopOutcome, WorkerControl, WorkerHandle, WorkerSpec};
use crate::{grid_worker, spot_worker};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex as SyncMutex;
use rust_decimal::Decimal;
use spotgrid_core::config::{GridWorkerConfig, SpotWorkerConfig, SupervisorConfig};
use spotgrid_core::metrics_formatter::MetricsFormatter;
use spotgrid_core::state::{WorkerKey, WorkerKind, WorkerSnapshot};
use spotgrid_core::summary::{PeriodSummary, SummaryPeriod};
use spotgrid_core::traits::Notification;
use spotgrid_data::summary::previous_period;
use spotgrid_exchange::MarketDataCache;
use spotgrid_strategy::ExternalScores;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

type Registry = Mutex<HashMap<WorkerKey, WorkerHandle>>;

/// Result of one health scan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HealthReport {
    /// Workers that newly crossed the stall threshold.
    pub stalled: Vec<WorkerKey>,
    pub recovered: Vec<WorkerKey>,
    /// Banned workers restarted after their ban expired.
    pub restarted: Vec<WorkerKey>,
}

pub struct Supervisor {
    config: SupervisorConfig,
    ctx: WorkerContext,
    scores: watch::Sender<ExternalScores>,
    spot: Registry,
    grid: Registry,
    stalled: SyncMutex<HashSet<WorkerKey>>,
    summaries_sent: SyncMutex<HashMap<SummaryPeriod, DateTime<Utc>>>,
    background: CancellationToken,
}

impl Supervisor {
    #[must_use]
    pub fn new(config: SupervisorConfig, ctx: WorkerContext, scores: watch::Sender<ExternalScores>) -> Self {
        let now = Utc::now();
        let summaries_sent = SummaryPeriod::ALL
            .into_iter()
            .filter_map(|period| period.current_start(now).map(|start| (period, start)))
            .collect();
        Self {
            config,
            ctx,
            scores,
            spot: Mutex::new(HashMap::new()),
            grid: Mutex::new(HashMap::new()),
            stalled: SyncMutex::new(HashSet::new()),
            summaries_sent: SyncMutex::new(summaries_sent),
            background: CancellationToken::new(),
        }
    }

    #[must_use]
    pub fn allocator(&self) -> &Arc<CapitalAllocator> {
        &self.ctx.allocator
    }

    #[must_use]
    pub fn market(&self) -> &Arc<MarketDataCache> {
        &self.ctx.market
    }

    /// Publishes new sentiment, ML and fear & greed readings to every worker.
    pub fn publish_scores(&self, scores: ExternalScores) {
        self.scores.send_replace(scores);
    }

    const fn registry(&self, kind: WorkerKind) -> &Registry {
        match kind {
            WorkerKind::Spot => &self.spot,
            WorkerKind::Grid => &self.grid,
        }
    }

    /// Sets total capital from the exchange's quote balance.
    ///
    /// # Errors
    /// Returns an error if the account cannot be fetched.
    pub async fn sync_capital(&self, quote_asset: &str) -> Result<Decimal> {
        let account = self
            .ctx
            .market
            .account(true)
            .await
            .context("Failed to fetch account for capital sync")?;
        let balance = self.ctx.allocator.sync_from_exchange(&account, quote_asset).await;
        tracing::info!(%balance, %quote_asset, "Capital synced from exchange");
        Ok(balance)
    }

    async fn load_snapshot(&self, key: &WorkerKey) -> Option<WorkerSnapshot> {
        let store = self.ctx.store.as_ref()?;
        match store.load_worker_state(key).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::warn!(worker = %key, error = %e, "Failed to load persisted state, starting fresh");
                None
            }
        }
    }

    /// Starts a spot worker, resuming its persisted state when present.
    ///
    /// # Errors
    /// Returns an error if the config is invalid or the key is already running.
    pub async fn start_spot(&self, config: SpotWorkerConfig) -> Result<WorkerKey> {
        let problems = config.validate();
        if !problems.is_empty() {
            anyhow::bail!("Invalid spot config for {}: {}", config.symbol, problems.join("; "));
        }
        let key = WorkerKey::spot(config.mode, config.symbol.clone());
        let restored = match self.load_snapshot(&key).await {
            Some(WorkerSnapshot::Spot(state)) => Some(*state),
            _ => None,
        };
        self.insert(key.clone(), || spot_worker::spawn(config, restored, self.ctx.clone()))
            .await?;
        Ok(key)
    }

    /// # Errors
    /// Returns an error if the config is invalid or the key is already running.
    pub async fn start_grid(&self, config: GridWorkerConfig) -> Result<WorkerKey> {
        let problems = config.validate();
        if !problems.is_empty() {
            anyhow::bail!("Invalid grid config for {}: {}", config.symbol, problems.join("; "));
        }
        let key = WorkerKey::grid(config.mode, config.symbol.clone());
        let restored = match self.load_snapshot(&key).await {
            Some(WorkerSnapshot::Grid(state)) => Some(*state),
            _ => None,
        };
        self.insert(key.clone(), || grid_worker::spawn(config, restored, self.ctx.clone()))
            .await?;
        Ok(key)
    }

    /// # Errors
    /// Same as [`Self::start_spot`] and [`Self::start_grid`].
    pub async fn start(&self, spec: WorkerSpec) -> Result<WorkerKey> {
        match spec {
            WorkerSpec::Spot(config) => self.start_spot(config).await,
            WorkerSpec::Grid(config) => self.start_grid(config).await,
        }
    }

    async fn insert<F>(&self, key: WorkerKey, spawn: F) -> Result<()>
    where
        F: FnOnce() -> WorkerHandle,
    {
        let mut registry = self.registry(key.kind).lock().await;
        if let Some(existing) = registry.get(&key) {
            if !existing.is_finished() {
                anyhow::bail!("Worker {key} is already running");
            }
            tracing::info!(worker = %key, "Replacing finished worker handle");
        }
        registry.insert(key.clone(), spawn());
        drop(registry);
        self.stalled.lock().remove(&key);
        tracing::info!(worker = %key, "Worker started");
        Ok(())
    }

    async fn control(&self, key: &WorkerKey) -> Result<WorkerControl> {
        self.registry(key.kind)
            .lock()
            .await
            .get(key)
            .map(|handle| handle.control.clone())
            .with_context(|| format!("No worker {key}"))
    }

    /// Cancels a worker and waits for it to exit, then frees its capital.
    ///
    /// # Errors
    /// Returns an error if the worker is unknown.
    pub async fn stop(&self, key: &WorkerKey) -> Result<StopOutcome> {
        let mut registry = self.registry(key.kind).lock().await;
        let handle = registry
            .remove(key)
            .with_context(|| format!("No worker {key}"))?;
        let outcome = handle.stop(self.config.stop_timeout()).await;
        drop(registry);

        self.stalled.lock().remove(key);
        self.ctx.allocator.release(&key.ledger_id()).await;
        self.ctx.notify(Notification::info(
            format!("Worker stopped: {}", key.symbol),
            format!("{key} ({outcome:?})"),
        ));
        Ok(outcome)
    }

    /// # Errors
    /// Returns an error if the worker is unknown or has exited.
    pub async fn pause(&self, key: &WorkerKey) -> Result<()> {
        self.control(key).await?.pause().await
    }

    /// # Errors
    /// Returns an error if the worker is unknown or has exited.
    pub async fn resume(&self, key: &WorkerKey) -> Result<()> {
        self.control(key).await?.resume().await
    }

    /// Swaps a registered worker's config. The new config is kept on the
    /// handle, so a worker that has exited (e.g. banned) picks it up when it
    /// is restarted.
    ///
    /// # Errors
    /// Returns an error if the worker is unknown or exits while updating.
    pub async fn update_config(&self, spec: WorkerSpec) -> Result<()> {
        let key = spec.key();
        let control = {
            let mut registry = self.registry(key.kind).lock().await;
            let handle = registry.get_mut(&key).with_context(|| format!("No worker {key}"))?;
            handle.spec = spec.clone();
            if handle.is_finished() {
                tracing::info!(worker = %key, "Worker not running, config kept for its next start");
                return Ok(());
            }
            handle.control.clone()
        };
        match spec {
            WorkerSpec::Spot(config) => control.update_spot_config(config).await,
            WorkerSpec::Grid(config) => control.update_grid_config(config).await,
        }
    }

    /// # Errors
    /// See [`Self::update_config`].
    pub async fn update_spot_config(&self, config: SpotWorkerConfig) -> Result<()> {
        self.update_config(WorkerSpec::Spot(config)).await
    }

    /// # Errors
    /// See [`Self::update_config`].
    pub async fn update_grid_config(&self, config: GridWorkerConfig) -> Result<()> {
        self.update_config(WorkerSpec::Grid(config)).await
    }

    /// Live status from the worker, or its last published status once it
    /// has exited.
    ///
    /// # Errors
    /// Returns an error if the worker is unknown.
    pub async fn status(&self, key: &WorkerKey) -> Result<WorkerStatus> {
        let (control, latest) = {
            let registry = self.registry(key.kind).lock().await;
            let handle = registry.get(key).with_context(|| format!("No worker {key}"))?;
            (handle.control.clone(), handle.latest_status())
        };
        Ok(control.status().await.unwrap_or(latest))
    }

    /// Last published status of every registered worker.
    pub async fn list(&self) -> Vec<WorkerStatus> {
        let mut statuses: Vec<WorkerStatus> = self
            .spot
            .lock()
            .await
            .values()
            .map(WorkerHandle::latest_status)
            .collect();
        statuses.extend(self.grid.lock().await.values().map(WorkerHandle::latest_status));
        statuses.sort_by(|a, b| a.key.to_string().cmp(&b.key.to_string()));
        statuses
    }

    /// Stops a worker and forgets it: persisted state and capital
    /// reservation are deleted too.
    ///
    /// # Errors
    /// Returns an error if deleting the persisted state fails.
    pub async fn remove(&self, key: &WorkerKey) -> Result<()> {
        match self.stop(key).await {
            Ok(outcome) => tracing::info!(worker = %key, ?outcome, "Worker stopped for removal"),
            Err(e) => tracing::debug!(worker = %key, error = %e, "Removing a worker that is not registered"),
        }
        if let Some(store) = &self.ctx.store {
            store
                .delete_worker_state(key)
                .await
                .with_context(|| format!("Failed to delete state of {key}"))?;
        }
        self.ctx.allocator.reset_pnl(Some(&key.ledger_id())).await;
        tracing::info!(worker = %key, "Worker removed");
        Ok(())
    }

    async fn drain(&self) -> Vec<WorkerHandle> {
        let mut handles: Vec<WorkerHandle> = self.spot.lock().await.drain().map(|(_, h)| h).collect();
        handles.extend(self.grid.lock().await.drain().map(|(_, h)| h));
        handles
    }

    /// Liquidates every worker at market and stops them all. Returns the
    /// summed realized profit reported by the liquidations.
    pub async fn panic(&self) -> Decimal {
        tracing::warn!("Panic: liquidating all workers");
        let handles = self.drain().await;
        let mut total = Decimal::ZERO;
        let mut failures = Vec::new();

        for handle in handles {
            let key = handle.control.key().clone();
            if handle.is_finished() {
                continue;
            }
            match handle.control.liquidate().await {
                Ok(pnl) => {
                    tracing::info!(worker = %key, %pnl, "Worker liquidated");
                    total += pnl;
                }
                Err(e) => {
                    tracing::error!(worker = %key, error = %e, "Liquidation failed");
                    failures.push(format!("{key}: {e:#}"));
                }
            }
            if handle.stop(self.config.stop_timeout()).await == StopOutcome::Zombie {
                failures.push(format!("{key}: did not stop"));
            }
            self.ctx.allocator.release(&key.ledger_id()).await;
        }
        self.stalled.lock().clear();

        let body = if failures.is_empty() {
            format!("All workers liquidated. Realized: {}", total.round_dp(2))
        } else {
            format!(
                "Realized: {}\nFailures:\n{}",
                total.round_dp(2),
                failures.join("\n")
            )
        };
        self.ctx.notify(Notification::critical("PANIC liquidation", body));
        total
    }

    /// Restarts every persisted worker that was running, or that stopped
    /// under an exchange ban. Returns the restarted keys.
    ///
    /// A worker listed in `configured` runs with that config on top of its
    /// persisted state, or stays down if that config disables it. Unlisted
    /// workers keep their persisted config.
    ///
    /// # Errors
    /// Returns an error if the store cannot list worker states.
    pub async fn restore(&self, configured: &HashMap<WorkerKey, WorkerSpec>) -> Result<Vec<WorkerKey>> {
        let Some(store) = &self.ctx.store else {
            return Ok(Vec::new());
        };
        let snapshots = store
            .list_worker_states()
            .await
            .context("Failed to list persisted workers")?;

        let mut started = Vec::new();
        for snapshot in snapshots {
            if !snapshot.running() && snapshot.ban_until().is_none() {
                continue;
            }
            let key = snapshot.key();
            let startup = configured.get(&key);
            if startup.is_some_and(|spec| !spec.enabled()) {
                tracing::info!(worker = %key, "Persisted worker is disabled in the config, not restoring");
                continue;
            }
            let result = match snapshot {
                WorkerSnapshot::Spot(state) => {
                    let config = match startup {
                        Some(WorkerSpec::Spot(config)) => config.clone(),
                        _ => state.config.clone(),
                    };
                    self.insert(key.clone(), || spot_worker::spawn(config, Some(*state), self.ctx.clone()))
                        .await
                }
                WorkerSnapshot::Grid(state) => {
                    let config = match startup {
                        Some(WorkerSpec::Grid(config)) => config.clone(),
                        _ => state.config.clone(),
                    };
                    self.insert(key.clone(), || grid_worker::spawn(config, Some(*state), self.ctx.clone()))
                        .await
                }
            };
            match result {
                Ok(()) => started.push(key),
                Err(e) => tracing::warn!(worker = %key, error = %e, "Skipping restore"),
            }
        }
        tracing::info!(restored = started.len(), "Persisted workers restored");
        Ok(started)
    }

    /// Asks every worker to exit, keeping their persisted running flag so
    /// the next start restores them, and stops the background loops.
    pub async fn shutdown(&self) {
        self.background.cancel();
        let handles = self.drain().await;
        tracing::info!(workers = handles.len(), "Shutting down workers");
        for handle in handles {
            let key = handle.control.key().clone();
            if let Err(e) = handle.control.shutdown().await {
                tracing::debug!(worker = %key, error = %e, "Worker already exited");
            }
            if handle.join_within(self.config.stop_timeout()).await == StopOutcome::Zombie {
                tracing::error!(worker = %key, "Worker ignored shutdown");
            }
        }
    }

    /// Stall detection and ban-expiry restarts.
    ///
    /// A stall alert fires once when a running, unpaused worker goes quiet
    /// past the threshold and re-arms after it reports activity again.
    pub async fn health_check(&self, now: DateTime<Utc>) -> HealthReport {
        let threshold = chrono::Duration::from_std(self.config.stall_threshold())
            .unwrap_or_else(|_| chrono::Duration::minutes(5));
        let mut report = HealthReport::default();
        let mut expired_bans = Vec::new();

        for registry in [&self.spot, &self.grid] {
            let guard = registry.lock().await;
            for (key, handle) in guard.iter() {
                let status = handle.latest_status();
                if handle.is_finished() {
                    if status.state == WorkerState::Banned
                        && status.ban_until.map_or(false, |until| until <= now)
                    {
                        expired_bans.push(handle.spec.clone());
                    }
                    continue;
                }

                let quiet = status.state == WorkerState::Running && now - status.last_activity > threshold;
                let mut stalled = self.stalled.lock();
                if quiet {
                    if stalled.insert(key.clone()) {
                        report.stalled.push(key.clone());
                    }
                } else if stalled.remove(key) {
                    report.recovered.push(key.clone());
                }
            }
        }

        for key in &report.stalled {
            tracing::warn!(worker = %key, "Worker stalled");
            self.ctx.notify(Notification::warning(
                format!("Worker stalled: {}", key.symbol),
                format!("{key} has not reported activity for over {} minutes", threshold.num_minutes()),
            ));
        }
        for key in &report.recovered {
            tracing::info!(worker = %key, "Worker recovered from stall");
        }

        for spec in expired_bans {
            let key = spec.key();
            tracing::info!(worker = %key, "Ban expired, restarting worker");
            match self.start(spec).await {
                Ok(key) => {
                    self.ctx.notify(Notification::info(
                        format!("Worker restarted: {}", key.symbol),
                        format!("{key} resumed after its exchange ban expired"),
                    ));
                    report.restarted.push(key);
                }
                Err(e) => tracing::error!(worker = %key, error = %e, "Restart after ban failed"),
            }
        }
        report
    }

    /// Sends the summary of every period whose boundary passed since the
    /// last emission. Returns the summaries sent.
    ///
    /// # Errors
    /// Returns an error if the trade journal cannot be read.
    pub async fn emit_due_summaries(&self, now: DateTime<Utc>) -> Result<Vec<PeriodSummary>> {
        let Some(journal) = &self.ctx.journal else {
            return Ok(Vec::new());
        };
        let due: Vec<(SummaryPeriod, DateTime<Utc>)> = {
            let sent = self.summaries_sent.lock();
            SummaryPeriod::ALL
                .into_iter()
                .filter_map(|period| {
                    let start = period.current_start(now)?;
                    let last = sent.get(&period).copied();
                    (last.map_or(true, |last| start > last)).then_some((period, start))
                })
                .collect()
        };

        let mut emitted = Vec::with_capacity(due.len());
        for (period, start) in due {
            let summary = previous_period(journal.as_ref(), period, now).await?;
            tracing::info!(%period, trades = summary.trades, net_pnl = %summary.net_pnl, "Period summary");
            self.ctx.notify(Notification::info(
                format!("{} summary", period.label()),
                MetricsFormatter::format_summary(&summary),
            ));
            self.summaries_sent.lock().insert(period, start);
            emitted.push(summary);
        }
        Ok(emitted)
    }

    /// Spawns the health scan and the summary timer. Both stop on
    /// [`Self::shutdown`].
    pub fn spawn_background(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let mut tasks = Vec::with_capacity(2);

        let supervisor = Arc::clone(self);
        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(supervisor.config.health_interval());
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = supervisor.background.cancelled() => break,
                    _ = ticker.tick() => {
                        let report = supervisor.health_check(Utc::now()).await;
                        if report != HealthReport::default() {
                            tracing::debug!(?report, "Health scan");
                        }
                    }
                }
            }
            tracing::debug!("Health loop stopped");
        }));

        if self.config.summaries_enabled {
            let supervisor = Arc::clone(self);
            tasks.push(tokio::spawn(async move {
                let period = std::time::Duration::from_secs(supervisor.config.summary_check_secs.max(1));
                let mut ticker = tokio::time::interval(period);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        () = supervisor.background.cancelled() => break,
                        _ = ticker.tick() => {
                            if let Err(e) = supervisor.emit_due_summaries(Utc::now()).await {
                                tracing::warn!(error = %e, "Summary emission failed");
                            }
                        }
                    }
                }
                tracing::debug!("Summary loop stopped");
            }));
        }
        tasks
    }
}
