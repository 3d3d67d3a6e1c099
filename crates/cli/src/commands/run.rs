use anyhow::{Context, Result};
use spotgrid_core::config::{AppConfig, GridWorkerConfig, SpotWorkerConfig};
use spotgrid_core::events::TradeMode;
use spotgrid_core::state::WorkerKey;
use spotgrid_core::traits::{ExchangeClient, Notifier, StateStore, TradeJournal};
use spotgrid_core::ConfigWatcher;
use spotgrid_exchange::{BinanceClient, Credentials, MarketDataCache, RetryingExchange, TickerStream};
use spotgrid_orchestrator::{
    CapitalAllocator, FanoutNotifier, LogNotifier, Supervisor, TelegramNotifier, WorkerContext,
    WorkerSpec,
};
use spotgrid_strategy::ExternalScores;
use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Runs the engine until Ctrl-C.
pub async fn run(config_path: &Path, profile: Option<&str>) -> Result<()> {
    let config = super::load_config(config_path, profile)?;
    let cancel = CancellationToken::new();
    let mut tasks = Vec::new();

    let store = Arc::new(super::open_store(&config.database).await?);

    let credentials = match Credentials::from_env() {
        Ok(credentials) => Some(credentials),
        Err(e) if has_live_workers(&config) => {
            return Err(e).context("Live workers are configured but API credentials are missing");
        }
        Err(e) => {
            tracing::warn!(error = %e, "No API credentials, only public endpoints are available");
            None
        }
    };
    let client = BinanceClient::new(&config.exchange, &config.market_data, credentials)?;
    let exchange: Arc<dyn ExchangeClient> = Arc::new(RetryingExchange::new(
        client,
        Duration::from_secs(config.exchange.max_retry_elapsed_secs),
    ));
    let market = Arc::new(MarketDataCache::new(exchange, config.market_data.clone()));

    if config.market_data.use_ticker_stream {
        let symbols: BTreeSet<String> = config
            .spot_workers
            .iter()
            .map(|w| w.symbol.clone())
            .chain(config.grid_workers.iter().map(|w| w.symbol.clone()))
            .collect();
        if !symbols.is_empty() {
            let stream = TickerStream::new(
                config.exchange.ws_url.clone(),
                symbols.into_iter().collect(),
                cancel.child_token(),
            );
            tasks.push(market.attach_ticker_stream(stream.subscribe(), cancel.child_token()));
            tasks.push(tokio::spawn(stream.run()));
        }
    }

    let state_store: Arc<dyn StateStore> = store.clone();
    let allocator = Arc::new(CapitalAllocator::load(Arc::clone(&state_store), &config.capital).await);
    let notifier = build_notifier(&config)?;
    let (scores_tx, scores_rx) = watch::channel(ExternalScores::default());
    let journal: Arc<dyn TradeJournal> = store;
    let ctx = WorkerContext {
        market,
        allocator,
        store: Some(state_store),
        journal: Some(journal),
        notifier,
        scores: scores_rx,
    };
    let supervisor = Arc::new(Supervisor::new(config.supervisor.clone(), ctx, scores_tx));

    if config.capital.sync_from_exchange {
        match supervisor.sync_capital(&config.capital.quote_asset).await {
            Ok(total) => tracing::info!(%total, "Synced capital from exchange"),
            Err(e) => tracing::warn!(error = %e, "Capital sync failed, keeping ledger total"),
        }
    }

    let restored = if config.supervisor.restore_on_start {
        supervisor.restore(&configured_specs(&config)).await?
    } else {
        Vec::new()
    };
    start_configured(&supervisor, &config, &restored).await;
    tasks.extend(supervisor.spawn_background());

    let (watcher, mut updates) = ConfigWatcher::new(
        config.clone(),
        config_path.to_path_buf(),
        profile.map(str::to_string),
    );
    tokio::spawn(async move {
        if let Err(e) = watcher.watch().await {
            tracing::error!(error = %e, "Config watcher stopped");
        }
    });

    let mut current = config;
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal.context("Failed to listen for Ctrl-C")?;
                tracing::info!("Shutdown requested");
                break;
            }
            changed = updates.changed() => {
                if changed.is_err() {
                    tracing::warn!("Config watcher closed, hot reload disabled");
                    tokio::signal::ctrl_c().await.context("Failed to listen for Ctrl-C")?;
                    break;
                }
                let next = updates.borrow_and_update().clone();
                apply_reload(&supervisor, &current, &next).await;
                current = next;
            }
        }
    }

    supervisor.shutdown().await;
    cancel.cancel();
    for task in tasks {
        if let Err(e) = task.await {
            tracing::warn!(error = %e, "Background task ended abnormally");
        }
    }
    tracing::info!("Stopped");
    Ok(())
}

fn has_live_workers(config: &AppConfig) -> bool {
    config
        .spot_workers
        .iter()
        .any(|w| w.enabled && w.mode == TradeMode::Live)
        || config
            .grid_workers
            .iter()
            .any(|w| w.enabled && w.mode == TradeMode::Live)
}

fn build_notifier(config: &AppConfig) -> Result<Arc<dyn Notifier>> {
    let mut sinks: Vec<Arc<dyn Notifier>> = vec![Arc::new(LogNotifier)];
    if let Some(telegram) = TelegramNotifier::from_env(&config.notifier)? {
        tracing::info!("Telegram notifications enabled");
        sinks.push(Arc::new(telegram));
    }
    Ok(Arc::new(FanoutNotifier::new(sinks)))
}

async fn start_configured(supervisor: &Supervisor, config: &AppConfig, skip: &[WorkerKey]) {
    for worker in config.spot_workers.iter().filter(|w| w.enabled) {
        if skip.contains(&spot_key(worker)) {
            continue;
        }
        if let Err(e) = supervisor.start_spot(worker.clone()).await {
            tracing::error!(symbol = %worker.symbol, error = %e, "Failed to start spot worker");
        }
    }
    for worker in config.grid_workers.iter().filter(|w| w.enabled) {
        if skip.contains(&grid_key(worker)) {
            continue;
        }
        if let Err(e) = supervisor.start_grid(worker.clone()).await {
            tracing::error!(symbol = %worker.symbol, error = %e, "Failed to start grid worker");
        }
    }
}

/// Every worker in the file, enabled or not, keyed for restore.
fn configured_specs(config: &AppConfig) -> HashMap<WorkerKey, WorkerSpec> {
    config
        .spot_workers
        .iter()
        .cloned()
        .map(WorkerSpec::Spot)
        .chain(config.grid_workers.iter().cloned().map(WorkerSpec::Grid))
        .map(|spec| (spec.key(), spec))
        .collect()
}

fn spot_key(config: &SpotWorkerConfig) -> WorkerKey {
    WorkerKey::spot(config.mode, config.symbol.clone())
}

fn grid_key(config: &GridWorkerConfig) -> WorkerKey {
    WorkerKey::grid(config.mode, config.symbol.clone())
}

/// Worker-level difference between two configs.
#[derive(Debug, Default)]
struct ReloadPlan {
    stop: Vec<WorkerKey>,
    start_spot: Vec<SpotWorkerConfig>,
    start_grid: Vec<GridWorkerConfig>,
    update_spot: Vec<SpotWorkerConfig>,
    update_grid: Vec<GridWorkerConfig>,
}

fn plan_reload(old: &AppConfig, new: &AppConfig) -> ReloadPlan {
    let mut plan = ReloadPlan::default();

    let old_spot: HashMap<WorkerKey, &SpotWorkerConfig> =
        old.spot_workers.iter().filter(|w| w.enabled).map(|w| (spot_key(w), w)).collect();
    let new_spot: HashMap<WorkerKey, &SpotWorkerConfig> =
        new.spot_workers.iter().filter(|w| w.enabled).map(|w| (spot_key(w), w)).collect();
    for (key, config) in &new_spot {
        match old_spot.get(key) {
            None => plan.start_spot.push((*config).clone()),
            Some(previous) if previous != config => plan.update_spot.push((*config).clone()),
            Some(_) => {}
        }
    }
    plan.stop
        .extend(old_spot.keys().filter(|k| !new_spot.contains_key(*k)).cloned());

    let old_grid: HashMap<WorkerKey, &GridWorkerConfig> =
        old.grid_workers.iter().filter(|w| w.enabled).map(|w| (grid_key(w), w)).collect();
    let new_grid: HashMap<WorkerKey, &GridWorkerConfig> =
        new.grid_workers.iter().filter(|w| w.enabled).map(|w| (grid_key(w), w)).collect();
    for (key, config) in &new_grid {
        match old_grid.get(key) {
            None => plan.start_grid.push((*config).clone()),
            Some(previous) if previous != config => plan.update_grid.push((*config).clone()),
            Some(_) => {}
        }
    }
    plan.stop
        .extend(old_grid.keys().filter(|k| !new_grid.contains_key(*k)).cloned());

    plan
}

async fn apply_reload(supervisor: &Supervisor, old: &AppConfig, new: &AppConfig) {
    if old.capital.auto_compound != new.capital.auto_compound {
        supervisor.allocator().set_auto_compound(new.capital.auto_compound).await;
    }

    let plan = plan_reload(old, new);
    tracing::info!(
        stop = plan.stop.len(),
        start = plan.start_spot.len() + plan.start_grid.len(),
        update = plan.update_spot.len() + plan.update_grid.len(),
        "Applying config reload"
    );

    for key in &plan.stop {
        if let Err(e) = supervisor.stop(key).await {
            tracing::warn!(worker = %key, error = %e, "Failed to stop removed worker");
        }
    }
    for config in plan.update_spot {
        let key = spot_key(&config);
        if let Err(e) = supervisor.update_spot_config(config).await {
            tracing::warn!(worker = %key, error = %e, "Failed to update spot worker");
        }
    }
    for config in plan.update_grid {
        let key = grid_key(&config);
        if let Err(e) = supervisor.update_grid_config(config).await {
            tracing::warn!(worker = %key, error = %e, "Failed to update grid worker");
        }
    }
    for config in plan.start_spot {
        if let Err(e) = supervisor.start_spot(config).await {
            tracing::error!(error = %e, "Failed to start spot worker");
        }
    }
    for config in plan.start_grid {
        if let Err(e) = supervisor.start_grid(config).await {
            tracing::error!(error = %e, "Failed to start grid worker");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn base() -> AppConfig {
        let mut config = AppConfig::default();
        config.spot_workers.push(SpotWorkerConfig::new("ETHUSDT", TradeMode::Paper));
        config.grid_workers.push(GridWorkerConfig::new("BTCUSDT", TradeMode::Paper));
        config
    }

    #[test]
    fn unchanged_config_plans_nothing() {
        let plan = plan_reload(&base(), &base());
        assert!(plan.stop.is_empty());
        assert!(plan.start_spot.is_empty() && plan.start_grid.is_empty());
        assert!(plan.update_spot.is_empty() && plan.update_grid.is_empty());
    }

    #[test]
    fn detects_added_changed_and_disabled_workers() {
        let old = base();
        let mut new = base();
        new.spot_workers[0].strategy.rsi_threshold_buy = dec!(35);
        new.grid_workers[0].enabled = false;
        new.spot_workers.push(SpotWorkerConfig::new("SOLUSDT", TradeMode::Paper));

        let plan = plan_reload(&old, &new);
        assert_eq!(plan.stop, vec![WorkerKey::grid(TradeMode::Paper, "BTCUSDT")]);
        assert_eq!(plan.update_spot.len(), 1);
        assert_eq!(plan.update_spot[0].symbol, "ETHUSDT");
        assert_eq!(plan.start_spot.len(), 1);
        assert_eq!(plan.start_spot[0].symbol, "SOLUSDT");
        assert!(plan.start_grid.is_empty());
    }

    #[test]
    fn restore_sees_disabled_workers_too() {
        let mut config = base();
        config.grid_workers[0].enabled = false;
        let specs = configured_specs(&config);
        assert_eq!(specs.len(), 2);
        let grid = &specs[&WorkerKey::grid(TradeMode::Paper, "BTCUSDT")];
        assert!(!grid.enabled());
        assert!(specs[&WorkerKey::spot(TradeMode::Paper, "ETHUSDT")].enabled());
    }

    #[test]
    fn mode_change_restarts_under_new_key() {
        let old = base();
        let mut new = base();
        new.spot_workers[0].mode = TradeMode::Live;

        let plan = plan_reload(&old, &new);
        assert_eq!(plan.stop, vec![WorkerKey::spot(TradeMode::Paper, "ETHUSDT")]);
        assert_eq!(plan.start_spot.len(), 1);
        assert!(has_live_workers(&new));
        assert!(!has_live_workers(&old));
    }
}
