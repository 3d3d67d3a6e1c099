//! Directional spot worker: one actor per (mode, symbol).
//!
//! The actor owns its position, signal engine and persisted state. It reacts
//! to three inputs, checked in priority order on every loop turn: the
//! cancellation token, control commands, and the tick timer.

use spotgrid_core::ExchangeClient;
use crate::commands::{WorkerCommand, WorkerState, WorkerStatus};
use crate::context::WorkerContext;
use crate::venue::OrderVenue;
use crate::worker_handle::{ban_exit, spawn_guarded, WorkerControl, WorkerExit, WorkerHandle, WorkerSpec};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use spotgrid_core::config::SpotWorkerConfig;
use spotgrid_core::error::ExecutionOutcome;
use spotgrid_core::events::{split_symbol, MarketOrder, OrderAmount, OrderFill, Side, SymbolFilters};
use spotgrid_core::indicators::classify_trend;
use spotgrid_core::position::Position;
use spotgrid_core::state::{
    EquitySnapshot, SpotWorkerState, TradeAction, TradeRecord, WorkerKey, WorkerSnapshot,
};
use spotgrid_core::traits::Notification;
use spotgrid_strategy::{Decision, RiskSizer, SignalEngine, SizingInputs};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

const HTF_KLINES: usize = 60;
const HTF_FAST_MA: usize = 20;
const HTF_SLOW_MA: usize = 50;
const LOSS_STREAK_ALERT: u32 = 3;
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(3600);
const COMMAND_BUFFER: usize = 32;

/// Merges a persisted state into a fresh one for `config`.
///
/// A state for another symbol or mode is ignored. The startup config always
/// replaces the persisted config.
#[must_use]
pub fn adopt_restored(config: &SpotWorkerConfig, restored: Option<SpotWorkerState>) -> (SpotWorkerState, bool) {
    match restored {
        Some(mut state) if state.symbol == config.symbol && state.mode == config.mode => {
            state.config = config.clone();
            (state, true)
        }
        Some(state) => {
            tracing::warn!(
                persisted = %state.symbol,
                configured = %config.symbol,
                "Persisted spot state is for another worker, starting flat"
            );
            (SpotWorkerState::new(config.clone()), false)
        }
        None => (SpotWorkerState::new(config.clone()), false),
    }
}

pub struct SpotWorker {
    key: WorkerKey,
    ledger_id: String,
    config: SpotWorkerConfig,
    state: SpotWorkerState,
    restored: bool,
    engine: SignalEngine,
    ctx: WorkerContext,
    venue: OrderVenue,
    rx: mpsc::Receiver<WorkerCommand>,
    status_tx: watch::Sender<WorkerStatus>,
    cancel: CancellationToken,
    base_asset: String,
    quote_asset: String,
    filters: SymbolFilters,
    insufficient_funds_streak: u32,
    last_price: Option<Decimal>,
    last_equity: Decimal,
    last_volatility: Option<Decimal>,
    last_maintenance: Option<Instant>,
    last_heartbeat: Instant,
    last_activity: DateTime<Utc>,
}

/// Starts a spot worker task and returns its handle.
#[must_use]
pub fn spawn(config: SpotWorkerConfig, restored: Option<SpotWorkerState>, ctx: WorkerContext) -> WorkerHandle {
    let key = WorkerKey::spot(config.mode, config.symbol.clone());
    let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
    let (status_tx, status_rx) = watch::channel(WorkerStatus::new(key.clone()));
    let cancel = CancellationToken::new();
    let notifier = ctx.notifier.clone();

    let worker = SpotWorker::new(config.clone(), restored, ctx, rx, status_tx.clone(), cancel.clone());
    let join = spawn_guarded(key.clone(), status_tx, notifier, async move {
        let exit = worker.run().await;
        tracing::debug!(?exit, "Spot worker task finished");
    });

    WorkerHandle {
        control: WorkerControl::new(key, tx),
        status_rx,
        cancel,
        join,
        spec: WorkerSpec::Spot(config),
    }
}

impl SpotWorker {
    #[must_use]
    pub fn new(
        config: SpotWorkerConfig,
        restored: Option<SpotWorkerState>,
        ctx: WorkerContext,
        rx: mpsc::Receiver<WorkerCommand>,
        status_tx: watch::Sender<WorkerStatus>,
        cancel: CancellationToken,
    ) -> Self {
        let key = WorkerKey::spot(config.mode, config.symbol.clone());
        let (state, restored) = adopt_restored(&config, restored);
        let (base_asset, quote_asset) = split_symbol(&config.symbol);
        let venue = OrderVenue::for_mode(config.mode, &ctx.market, config.strategy.fee_rate);
        let filters = SymbolFilters {
            min_notional: config.min_notional,
            ..SymbolFilters::default()
        };

        Self {
            ledger_id: key.ledger_id(),
            key,
            engine: SignalEngine::new(config.strategy.clone()),
            config,
            state,
            restored,
            ctx,
            venue,
            rx,
            status_tx,
            cancel,
            base_asset,
            quote_asset,
            filters,
            insufficient_funds_streak: 0,
            last_price: None,
            last_equity: Decimal::ZERO,
            last_volatility: None,
            last_maintenance: None,
            last_heartbeat: Instant::now(),
            last_activity: Utc::now(),
        }
    }

    pub async fn run(mut self) -> WorkerExit {
        let exit = match self.startup().await {
            Ok(None) => self.event_loop().await,
            Ok(Some(exit)) => exit,
            Err(e) => {
                tracing::error!(worker = %self.key, error = %e, "Spot worker failed to start");
                WorkerExit::Failed(format!("{e:#}"))
            }
        };
        self.finish(&exit).await;
        exit
    }

    async fn event_loop(&mut self) -> WorkerExit {
        let mut period = self.config.tick_interval_secs.max(1);
        let mut ticker = tokio::time::interval(Duration::from_secs(period));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            let exit = tokio::select! {
                biased;
                () = self.cancel.cancelled() => Some(WorkerExit::Stopped),
                cmd = self.rx.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd).await,
                    None => Some(WorkerExit::Shutdown),
                },
                _ = ticker.tick() => self.tick().await,
            };
            if let Some(exit) = exit {
                return exit;
            }

            let wanted = self.config.tick_interval_secs.max(1);
            if wanted != period {
                period = wanted;
                ticker = tokio::time::interval(Duration::from_secs(period));
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            }
        }
    }

    /// Loads filters and funds, waits out a persisted ban, warms up the
    /// signal engine. Returns an exit if the worker should not trade.
    async fn startup(&mut self) -> Result<Option<WorkerExit>> {
        tracing::info!(
            worker = %self.key,
            restored = self.restored,
            position = self.state.position.is_some(),
            "Spot worker starting"
        );

        match self.ctx.market.symbol_filters(&self.config.symbol).await {
            Ok(filters) => {
                self.filters = SymbolFilters {
                    min_notional: filters.min_notional.max(self.config.min_notional),
                    ..filters
                };
            }
            Err(e) => {
                tracing::warn!(worker = %self.key, error = %e, "Symbol filters unavailable, using defaults");
            }
        }

        if let Some(allocation) = self.config.allocation {
            self.ctx
                .allocator
                .allocate(&self.ledger_id, allocation)
                .await
                .context("Failed to reserve capital")?;
        }

        if let Some(paper) = self.venue.paper() {
            if self.restored {
                paper.deposit(&self.quote_asset, self.state.quote_balance);
                paper.deposit(&self.base_asset, self.state.base_balance);
            } else {
                let reserved = self.ctx.allocator.available(&self.ledger_id);
                let funds = if self.config.allocation.is_some() && reserved > Decimal::ZERO {
                    reserved
                } else {
                    self.config.paper_starting_quote
                };
                paper.deposit(&self.quote_asset, funds);
                tracing::info!(worker = %self.key, %funds, "Paper balance funded");
            }
        }

        if let Some(until) = self.state.ban_until.filter(|until| *until > Utc::now()) {
            if let Some(exit) = self.wait_out_ban(until).await {
                return Ok(Some(exit));
            }
        }

        self.warm_up().await;

        self.engine.state_mut().last_stop_loss_at = self.state.last_stop_loss_at;
        self.engine.state_mut().last_dca_attempt_at = self.state.last_dca_attempt_at;

        self.state.running = true;
        self.state.ban_until = None;
        self.persist().await;
        self.publish();

        self.ctx.notify(Notification::info(
            format!("Spot worker started: {}", self.config.symbol),
            format!(
                "Mode: {}\nPosition: {}",
                self.config.mode,
                self.state
                    .position
                    .as_ref()
                    .map_or_else(|| "flat".to_string(), |p| format!("{} @ {}", p.quantity, p.entry_price))
            ),
        ));
        Ok(None)
    }

    async fn wait_out_ban(&mut self, until: DateTime<Utc>) -> Option<WorkerExit> {
        tracing::warn!(worker = %self.key, %until, "Exchange ban still active, waiting");
        self.status_tx.send_modify(|s| {
            s.state = WorkerState::Banned;
            s.ban_until = Some(until);
        });
        let wait = (until - Utc::now()).to_std().unwrap_or_default();
        tokio::select! {
            () = self.cancel.cancelled() => Some(WorkerExit::Stopped),
            () = tokio::time::sleep(wait) => None,
        }
    }

    async fn warm_up(&mut self) {
        let symbol = self.config.symbol.clone();
        match self
            .ctx
            .market
            .klines(&symbol, &self.config.kline_interval, self.config.warmup_klines)
            .await
        {
            Ok(klines) => {
                let samples = klines.len();
                self.engine
                    .state_mut()
                    .seed(klines.into_iter().map(|k| (k.close, k.volume)));
                tracing::info!(worker = %self.key, samples, "Price history warmed up");
            }
            Err(e) => {
                tracing::warn!(worker = %self.key, error = %e, "Warm-up klines unavailable, starting cold");
            }
        }

        match self.ctx.market.volatility(&symbol).await {
            Ok(Some(volatility)) => {
                self.last_volatility = Some(volatility);
                self.engine
                    .set_volatility(volatility, self.ctx.scores().fear_greed);
            }
            Ok(None) => {}
            Err(e) => tracing::warn!(worker = %self.key, error = %e, "Volatility unavailable"),
        }
    }

    async fn tick(&mut self) -> Option<WorkerExit> {
        let now = Utc::now();
        self.last_activity = now;
        let symbol = self.config.symbol.clone();

        let price = match self.ctx.market.price(&symbol).await {
            Ok(price) => price,
            Err(e) => {
                tracing::warn!(worker = %self.key, error = %e, "Price unavailable, no decision this cycle");
                self.publish();
                return ban_exit(&e);
            }
        };
        self.last_price = Some(price);
        self.venue.mark(&symbol, price);
        let volume = self.sample_volume().await;
        self.engine.on_sample(price, volume);

        if self.state.paused {
            self.publish();
            return None;
        }

        let due = self.last_maintenance.map_or(true, |at| {
            at.elapsed() >= Duration::from_secs(self.config.maintenance_interval_secs)
        });
        if due {
            self.maintenance(price).await;
        }
        self.refresh_htf_trend(now).await;

        let scores = self.ctx.scores();
        let decision = self
            .engine
            .evaluate(self.state.position.as_mut(), price, &scores, now);

        let outcome = match decision {
            Decision::Hold => None,
            Decision::Buy => Some(self.buy(price).await),
            Decision::Dca => Some(self.dca(price).await),
            Decision::Sell => Some(self.sell(price, TradeAction::Exit).await),
            Decision::StopLoss => Some(self.sell(price, TradeAction::StopLoss).await),
        };
        self.publish();

        match outcome {
            Some(ExecutionOutcome::Rejected(e)) => ban_exit(&e),
            _ if self.state.position.is_none()
                && self.insufficient_funds_streak >= self.config.insufficient_funds_limit =>
            {
                tracing::error!(
                    worker = %self.key,
                    attempts = self.insufficient_funds_streak,
                    "Balance stays below the minimum order, stopping"
                );
                self.ctx.notify(Notification::warning(
                    format!("{} stopped: insufficient funds", self.config.symbol),
                    format!("{} consecutive buy attempts without enough {}", self.insufficient_funds_streak, self.quote_asset),
                ));
                Some(WorkerExit::InsufficientFunds)
            }
            _ => None,
        }
    }

    async fn sample_volume(&self) -> Decimal {
        if self.engine.config().use_volume_filter {
            match self
                .ctx
                .market
                .klines(&self.config.symbol, &self.config.kline_interval, 1)
                .await
            {
                Ok(klines) => return klines.last().map_or(Decimal::ZERO, |k| k.volume),
                Err(e) => tracing::debug!(worker = %self.key, error = %e, "Volume sample unavailable"),
            }
        }
        self.ctx
            .market
            .stream_volume(&self.config.symbol)
            .unwrap_or(Decimal::ZERO)
    }

    async fn refresh_htf_trend(&mut self, now: DateTime<Utc>) {
        if !self.engine.needs_htf_refresh(now) {
            return;
        }
        let interval = self.engine.config().htf_interval.clone();
        match self
            .ctx
            .market
            .klines(&self.config.symbol, &interval, HTF_KLINES)
            .await
        {
            Ok(klines) => {
                if let Some(trend) = classify_trend(&klines, HTF_FAST_MA, HTF_SLOW_MA) {
                    tracing::debug!(worker = %self.key, %interval, ?trend, "Higher-timeframe trend refreshed");
                    self.engine.set_htf_trend(trend, now);
                }
            }
            Err(e) => tracing::warn!(worker = %self.key, error = %e, "Higher-timeframe klines unavailable"),
        }
    }

    /// Free quote and base balances the worker trades against.
    async fn balances(&self) -> Option<(Decimal, Decimal)> {
        match self.venue.account(&self.ctx.market).await {
            Ok(account) => Some((account.free(&self.quote_asset), account.free(&self.base_asset))),
            Err(e) => {
                tracing::warn!(worker = %self.key, error = %e, "Account unavailable");
                None
            }
        }
    }

    fn sizing_inputs(&self, price: Decimal, quote: Decimal, base: Decimal) -> SizingInputs {
        SizingInputs {
            price,
            quote_balance: quote,
            base_balance: base,
            allocation: self
                .config
                .allocation
                .map(|_| self.ctx.allocator.available(&self.ledger_id)),
        }
    }

    async fn buy(&mut self, price: Decimal) -> ExecutionOutcome {
        let Some((quote, base)) = self.balances().await else {
            return ExecutionOutcome::InsufficientFunds;
        };
        let inputs = self.sizing_inputs(price, quote, base);

        if inputs.spendable() < self.filters.min_notional {
            self.insufficient_funds_streak += 1;
            tracing::warn!(
                worker = %self.key,
                spendable = %inputs.spendable(),
                streak = self.insufficient_funds_streak,
                "Buy signal without enough funds"
            );
            return ExecutionOutcome::InsufficientFunds;
        }

        let size = RiskSizer::new(self.engine.config(), self.config.position_size_pct).entry_size(&inputs);
        let amount = self.filters.round_price(size.quote_amount);
        if amount < self.filters.min_notional {
            tracing::info!(worker = %self.key, %amount, "Buy size below exchange minimum, skipping");
            return ExecutionOutcome::BelowMinimum;
        }

        tracing::info!(
            worker = %self.key,
            %price,
            %amount,
            stop = %size.stop_price,
            method = ?size.method,
            "Submitting entry"
        );
        let order = MarketOrder {
            symbol: self.config.symbol.clone(),
            side: Side::Buy,
            amount: OrderAmount::Quote(amount),
        };
        let outcome = self.venue.market_order(&order, &self.ctx.market).await;
        match &outcome {
            ExecutionOutcome::Filled(fill) => {
                self.insufficient_funds_streak = 0;
                self.on_entry(fill, price).await;
            }
            ExecutionOutcome::InsufficientFunds => self.insufficient_funds_streak += 1,
            _ => {}
        }
        outcome
    }

    async fn on_entry(&mut self, fill: &OrderFill, expected: Decimal) {
        let Some(position) = Position::open(fill) else {
            tracing::error!(worker = %self.key, order_id = %fill.order_id, "Entry fill did not open a position");
            return;
        };
        let slippage = (expected - fill.avg_price).abs() * fill.executed_qty;
        self.state.metrics.record_fee(fill.commission);
        self.state.metrics.record_slippage(slippage);

        tracing::info!(
            worker = %self.key,
            entry = %position.entry_price,
            quantity = %position.quantity,
            fee = %fill.commission,
            %slippage,
            "Position opened"
        );
        self.ctx.notify(Notification::info(
            format!("BUY {}", self.config.symbol),
            format!(
                "Price: {}\nQty: {}\nSpent: {}\nStop: {}",
                position.entry_price.round_dp(4),
                position.quantity,
                fill.cumulative_quote.round_dp(2),
                self.engine.entry_stop_price(position.entry_price).round_dp(4)
            ),
        ));
        self.state.position = Some(position);
        self.journal(TradeAction::Entry, fill, None).await;
        self.persist().await;
    }

    async fn dca(&mut self, price: Decimal) -> ExecutionOutcome {
        let Some(level) = self.state.position.as_ref().map(|p| p.dca_count) else {
            return ExecutionOutcome::NoPosition;
        };
        let Some((quote, base)) = self.balances().await else {
            return ExecutionOutcome::InsufficientFunds;
        };
        let inputs = self.sizing_inputs(price, quote, base);
        let value = RiskSizer::new(self.engine.config(), self.config.position_size_pct)
            .dca_size(&inputs, level)
            .min(inputs.spendable() * Decimal::new(98, 2));
        let amount = self.filters.round_price(value);
        if amount <= self.filters.min_notional {
            tracing::info!(worker = %self.key, %amount, level, "Defense buy too small, skipping");
            return ExecutionOutcome::BelowMinimum;
        }

        let order = MarketOrder {
            symbol: self.config.symbol.clone(),
            side: Side::Buy,
            amount: OrderAmount::Quote(amount),
        };
        let outcome = self.venue.market_order(&order, &self.ctx.market).await;
        if let ExecutionOutcome::Filled(fill) = &outcome {
            let slippage = (price - fill.avg_price).abs() * fill.executed_qty;
            self.state.metrics.record_fee(fill.commission);
            self.state.metrics.record_slippage(slippage);
            if let Some(position) = self.state.position.as_mut() {
                position.average_down(fill);
                tracing::info!(
                    worker = %self.key,
                    level = position.dca_count,
                    entry = %position.entry_price,
                    quantity = %position.quantity,
                    "Defense buy filled"
                );
                self.ctx.notify(Notification::info(
                    format!("DCA {} #{}", self.config.symbol, position.dca_count),
                    format!(
                        "Price: {}\nNew entry: {}\nQty: {}",
                        fill.avg_price.round_dp(4),
                        position.entry_price.round_dp(4),
                        position.quantity
                    ),
                ));
            }
            self.journal(TradeAction::Dca, fill, None).await;
            self.persist().await;
        }
        outcome
    }

    /// Closes the whole position at market.
    async fn sell(&mut self, price: Decimal, action: TradeAction) -> ExecutionOutcome {
        let Some(position) = self.state.position.clone() else {
            tracing::warn!(worker = %self.key, ?action, "Exit requested without a position");
            return ExecutionOutcome::NoPosition;
        };
        let Some((_, base)) = self.balances().await else {
            return ExecutionOutcome::InsufficientFunds;
        };

        let quantity = self.filters.round_qty(position.quantity.min(base));
        if quantity <= Decimal::ZERO || !self.filters.meets_min_notional(price, quantity) {
            tracing::warn!(
                worker = %self.key,
                held = %position.quantity,
                %base,
                "Position below minimum order value, clearing dust"
            );
            self.close_dust(&position, price, action).await;
            return ExecutionOutcome::BelowMinimum;
        }

        let order = MarketOrder {
            symbol: self.config.symbol.clone(),
            side: Side::Sell,
            amount: OrderAmount::Base(quantity),
        };
        let outcome = self.venue.market_order(&order, &self.ctx.market).await;
        if let ExecutionOutcome::Filled(fill) = &outcome {
            self.on_exit(&position, fill, price, action).await;
        }
        outcome
    }

    /// Books an unsellable position as closed with no proceeds, so its cost
    /// basis shows up as a realized loss.
    async fn close_dust(&mut self, position: &Position, price: Decimal, action: TradeAction) {
        let pnl = -position.cost_basis();
        self.state.metrics.record_trade(pnl);
        self.state.position = None;
        self.ctx.allocator.record_trade(&self.ledger_id, pnl, false).await;
        self.ctx
            .journal_trade(&TradeRecord {
                worker: self.key.clone(),
                action,
                side: Side::Sell,
                price,
                quantity: position.quantity,
                quote_amount: Decimal::ZERO,
                fee: Decimal::ZERO,
                pnl: Some(pnl),
                order_id: None,
                timestamp: Utc::now(),
            })
            .await;
        self.persist().await;
    }

    async fn on_exit(&mut self, position: &Position, fill: &OrderFill, expected: Decimal, action: TradeAction) {
        let pnl = position.realized_pnl(fill);
        let slippage = (expected - fill.avg_price).abs() * fill.executed_qty;
        let metrics = &mut self.state.metrics;
        metrics.record_trade(pnl);
        metrics.record_fee(fill.commission);
        metrics.record_slippage(slippage);
        self.state.position = None;
        self.ctx
            .allocator
            .record_trade(&self.ledger_id, pnl, pnl > Decimal::ZERO)
            .await;

        tracing::info!(
            worker = %self.key,
            ?action,
            entry = %position.entry_price,
            exit = %fill.avg_price,
            quantity = %fill.executed_qty,
            %pnl,
            "Position closed"
        );

        let title = match action {
            TradeAction::StopLoss => format!("STOP LOSS {}", self.config.symbol),
            TradeAction::Liquidation => format!("LIQUIDATED {}", self.config.symbol),
            _ => format!("SELL {}", self.config.symbol),
        };
        let body = format!(
            "Entry: {}\nExit: {}\nP&L: {}\nTrades: {} | Win rate: {}%",
            position.entry_price.round_dp(4),
            fill.avg_price.round_dp(4),
            pnl.round_dp(2),
            self.state.metrics.trades,
            (self.state.metrics.win_rate() * Decimal::ONE_HUNDRED).round_dp(1)
        );
        if action == TradeAction::StopLoss {
            self.ctx.notify(Notification::warning(title, body));
        } else {
            self.ctx.notify(Notification::info(title, body));
        }

        if action == TradeAction::StopLoss {
            let now = Utc::now();
            self.engine.record_stop_loss(now);
            self.state.last_stop_loss_at = Some(now);
            self.state.consecutive_stop_losses += 1;
            if self.state.consecutive_stop_losses >= self.config.max_consecutive_stop_losses {
                self.state.paused = true;
                tracing::warn!(
                    worker = %self.key,
                    stop_losses = self.state.consecutive_stop_losses,
                    "Consecutive stop-loss limit reached, pausing"
                );
                self.ctx.notify(Notification::warning(
                    format!("{} auto-paused", self.config.symbol),
                    format!(
                        "{} consecutive stop-losses. Resume manually once conditions improve.",
                        self.state.consecutive_stop_losses
                    ),
                ));
            }
        } else if pnl > Decimal::ZERO {
            self.state.consecutive_stop_losses = 0;
        }

        if self.state.metrics.consecutive_losses == LOSS_STREAK_ALERT {
            self.ctx.notify(Notification::warning(
                format!("{} loss streak", self.config.symbol),
                format!("{LOSS_STREAK_ALERT} losing trades in a row"),
            ));
        }

        self.journal(action, fill, Some(pnl)).await;
        self.persist().await;
    }

    async fn maintenance(&mut self, price: Decimal) {
        self.last_maintenance = Some(Instant::now());

        match self.ctx.market.volatility(&self.config.symbol).await {
            Ok(Some(volatility)) => {
                if let Some(previous) = self.last_volatility.filter(|v| *v > Decimal::ZERO) {
                    let shift = (volatility - previous).abs() / previous;
                    if shift > self.config.volatility_shift_alert {
                        tracing::info!(worker = %self.key, %previous, %volatility, "Volatility shift");
                        self.ctx.notify(Notification::info(
                            format!("{} volatility shift", self.config.symbol),
                            format!(
                                "{}% -> {}%",
                                (previous * Decimal::ONE_HUNDRED).round_dp(2),
                                (volatility * Decimal::ONE_HUNDRED).round_dp(2)
                            ),
                        ));
                    }
                }
                self.last_volatility = Some(volatility);
                self.engine
                    .set_volatility(volatility, self.ctx.scores().fear_greed);
            }
            Ok(None) => {}
            Err(e) => tracing::warn!(worker = %self.key, error = %e, "Volatility refresh failed"),
        }

        if let Some((quote, base)) = self.balances().await {
            let equity = quote + base * price;
            self.last_equity = equity;
            self.state.metrics.update_equity(equity);
            self.ctx
                .journal_equity(&EquitySnapshot {
                    worker: self.key.clone(),
                    equity,
                    quote_balance: quote,
                    base_balance: base,
                    price,
                    timestamp: Utc::now(),
                })
                .await;

            if self.venue.is_live()
                && self.state.position.is_none()
                && quote < self.config.low_balance_alert
            {
                tracing::warn!(worker = %self.key, %quote, "Low quote balance");
                self.ctx.notify(Notification::warning(
                    format!("{} low balance", self.config.symbol),
                    format!("Free {}: {}", self.quote_asset, quote.round_dp(2)),
                ));
            }
        }

        if self.last_heartbeat.elapsed() >= HEARTBEAT_INTERVAL {
            self.last_heartbeat = Instant::now();
            tracing::info!(
                worker = %self.key,
                %price,
                equity = %self.last_equity,
                trades = self.state.metrics.trades,
                net_pnl = %self.state.metrics.net_pnl(),
                paused = self.state.paused,
                "Heartbeat"
            );
        }

        self.persist().await;
    }

    async fn handle_command(&mut self, cmd: WorkerCommand) -> Option<WorkerExit> {
        match cmd {
            WorkerCommand::Pause => {
                if self.state.paused {
                    tracing::warn!(worker = %self.key, "Already paused, ignoring pause");
                } else {
                    self.state.paused = true;
                    tracing::info!(worker = %self.key, "Paused");
                    self.persist().await;
                }
            }
            WorkerCommand::Resume => {
                if self.state.paused {
                    self.state.paused = false;
                    self.state.consecutive_stop_losses = 0;
                    tracing::info!(worker = %self.key, "Resumed");
                    self.persist().await;
                } else {
                    tracing::warn!(worker = %self.key, "Not paused, ignoring resume");
                }
            }
            WorkerCommand::UpdateSpotConfig(config) => self.apply_config(*config).await,
            WorkerCommand::UpdateGridConfig(_) => {
                tracing::warn!(worker = %self.key, "Grid config sent to a spot worker, ignoring");
            }
            WorkerCommand::GetStatus(reply) => {
                let _ = reply.send(self.status());
            }
            WorkerCommand::Liquidate(reply) => {
                let result = self.liquidate().await;
                let _ = reply.send(result);
                return Some(WorkerExit::Liquidated);
            }
            WorkerCommand::Shutdown => return Some(WorkerExit::Shutdown),
        }
        self.publish();
        None
    }

    async fn apply_config(&mut self, config: SpotWorkerConfig) {
        if config.symbol != self.config.symbol || config.mode != self.config.mode {
            tracing::warn!(
                worker = %self.key,
                symbol = %config.symbol,
                "Config update for a different worker, ignoring"
            );
            return;
        }
        if config == self.config {
            return;
        }

        if config.allocation != self.config.allocation {
            match config.allocation {
                Some(allocation) => {
                    if let Err(e) = self.ctx.allocator.allocate(&self.ledger_id, allocation).await {
                        tracing::warn!(worker = %self.key, error = %e, "Rejected allocation change");
                        return;
                    }
                }
                None => {
                    self.ctx.allocator.release(&self.ledger_id).await;
                }
            }
        }

        self.engine.update_config(config.strategy.clone());
        if let Some(volatility) = self.last_volatility {
            self.engine
                .set_volatility(volatility, self.ctx.scores().fear_greed);
        }
        self.state.config = config.clone();
        self.config = config;
        tracing::info!(worker = %self.key, "Config updated");
        self.persist().await;
    }

    async fn liquidate(&mut self) -> Result<Decimal> {
        if self.state.position.is_none() {
            tracing::info!(worker = %self.key, "Liquidation requested while flat");
            return Ok(Decimal::ZERO);
        }
        let price = self
            .ctx
            .market
            .price(&self.config.symbol)
            .await
            .context("No price for liquidation")?;
        self.venue.mark(&self.config.symbol, price);

        let before = self.state.metrics.net_pnl();
        match self.sell(price, TradeAction::Liquidation).await {
            ExecutionOutcome::Filled(_) | ExecutionOutcome::BelowMinimum => {
                Ok(self.state.metrics.net_pnl() - before)
            }
            ExecutionOutcome::NoPosition => Ok(Decimal::ZERO),
            ExecutionOutcome::InsufficientFunds => {
                anyhow::bail!("Not enough {} to liquidate", self.base_asset)
            }
            ExecutionOutcome::Rejected(e) => Err(e).context("Liquidation order rejected"),
        }
    }

    async fn finish(&mut self, exit: &WorkerExit) {
        let state = match exit {
            WorkerExit::Shutdown => WorkerState::Stopped,
            WorkerExit::Banned(until) => {
                self.state.running = false;
                self.state.ban_until = Some(*until);
                tracing::error!(worker = %self.key, %until, "Exchange ban, worker stopped");
                self.ctx.notify(Notification::critical(
                    format!("{} banned by exchange", self.config.symbol),
                    format!("Trading halted until {until}. The supervisor restarts the worker afterwards."),
                ));
                WorkerState::Banned
            }
            WorkerExit::Failed(message) => {
                self.ctx.notify(Notification::critical(
                    format!("{} failed", self.config.symbol),
                    message.clone(),
                ));
                WorkerState::Failed
            }
            WorkerExit::Stopped | WorkerExit::InsufficientFunds | WorkerExit::Liquidated => {
                self.state.running = false;
                WorkerState::Stopped
            }
        };

        if !matches!(exit, WorkerExit::Failed(_)) {
            self.persist().await;
        }
        let status = WorkerStatus {
            state,
            error: match exit {
                WorkerExit::Failed(message) => Some(message.clone()),
                _ => None,
            },
            ..self.status()
        };
        self.status_tx.send_replace(status);
        tracing::info!(worker = %self.key, ?exit, "Spot worker exited");
    }

    async fn journal(&self, action: TradeAction, fill: &OrderFill, pnl: Option<Decimal>) {
        self.ctx
            .journal_trade(&TradeRecord {
                worker: self.key.clone(),
                action,
                side: fill.side,
                price: fill.avg_price,
                quantity: fill.executed_qty,
                quote_amount: fill.cumulative_quote,
                fee: fill.commission,
                pnl,
                order_id: Some(fill.order_id.clone()),
                timestamp: fill.timestamp,
            })
            .await;
    }

    async fn persist(&mut self) {
        if let Some(paper) = self.venue.paper() {
            if let Ok(account) = paper.get_account().await {
                self.state.quote_balance = account.total(&self.quote_asset);
                self.state.base_balance = account.total(&self.base_asset);
            }
        }
        self.state.last_dca_attempt_at = self.engine.state().last_dca_attempt_at;
        self.state.updated_at = Utc::now();
        self.ctx
            .persist(&WorkerSnapshot::Spot(Box::new(self.state.clone())))
            .await;
    }

    fn status(&self) -> WorkerStatus {
        WorkerStatus {
            key: self.key.clone(),
            state: if self.state.paused {
                WorkerState::Paused
            } else {
                WorkerState::Running
            },
            last_activity: self.last_activity,
            last_price: self.last_price,
            position: self.state.position.clone(),
            equity: self.last_equity,
            realized_pnl: self.state.metrics.net_pnl(),
            trades: self.state.metrics.trades,
            open_orders: 0,
            ban_until: self.state.ban_until,
            last_rejection: self.engine.state().last_rejection.map(|r| r.to_string()),
            error: None,
        }
    }

    fn publish(&self) {
        self.status_tx.send_replace(self.status());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::test_support::paper_context;
    use crate::worker_handle::StopOutcome;
    use rust_decimal_macros::dec;
    use spotgrid_core::config::Allocation;
    use spotgrid_core::events::TradeMode;
    use spotgrid_core::traits::{StateStore, TradeJournal};
    use spotgrid_exchange::PaperExchange;
    use std::sync::Arc;

    fn config() -> SpotWorkerConfig {
        SpotWorkerConfig {
            tick_interval_secs: 1,
            warmup_klines: 10,
            ..SpotWorkerConfig::new("ETHUSDT", TradeMode::Paper)
        }
    }

    fn holding(config: &SpotWorkerConfig) -> SpotWorkerState {
        let fill = OrderFill::new(
            "seed".to_string(),
            "ETHUSDT".to_string(),
            Side::Buy,
            dec!(0.1),
            dec!(300),
            Decimal::ZERO,
        );
        let mut state = SpotWorkerState::new(config.clone());
        state.position = Position::open(&fill);
        state.quote_balance = dec!(700);
        state.base_balance = dec!(0.1);
        state.running = true;
        state
    }

    async fn wait_for<F>(handle: &WorkerHandle, mut done: F) -> WorkerStatus
    where
        F: FnMut(&WorkerStatus) -> bool,
    {
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                if let Ok(status) = handle.control.status().await {
                    if done(&status) {
                        return status;
                    }
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap()
    }

    #[test]
    fn restored_state_for_other_symbol_is_ignored() {
        let config = config();
        let other = SpotWorkerState::new(SpotWorkerConfig::new("SOLUSDT", TradeMode::Paper));
        let (state, restored) = adopt_restored(&config, Some(other));
        assert!(!restored);
        assert_eq!(state.symbol, "ETHUSDT");

        let mut persisted = holding(&config);
        persisted.config.tick_interval_secs = 99;
        let (state, restored) = adopt_restored(&config, Some(persisted));
        assert!(restored);
        assert!(state.position.is_some());
        assert_eq!(state.config.tick_interval_secs, 1);
    }

    #[tokio::test]
    async fn stop_loss_closes_position_and_pauses() {
        let feed = Arc::new(PaperExchange::new(dec!(0.001)));
        feed.set_price("ETHUSDT", dec!(2930));
        let (ctx, store, _scores) = paper_context(&feed, dec!(1000)).await;

        let config = SpotWorkerConfig {
            max_consecutive_stop_losses: 1,
            ..config()
        };
        let handle = spawn(config.clone(), Some(holding(&config)), ctx.clone());
        let status = wait_for(&handle, |s| s.trades == 1).await;

        assert!(status.position.is_none());
        assert_eq!(status.state, WorkerState::Paused);
        // 0.1 sold at 2930 against a 3000 entry, less the 0.293 commission
        assert_eq!(status.realized_pnl, dec!(-7.293));

        let ledger_id = handle.control.key().ledger_id();
        assert_eq!(ctx.allocator.pnl(&ledger_id).unwrap().realized_pnl, dec!(-7.293));

        let trades = store
            .trades_between(Utc::now() - chrono::Duration::hours(1), Utc::now() + chrono::Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].action, TradeAction::StopLoss);

        assert_eq!(handle.stop(Duration::from_secs(5)).await, StopOutcome::Clean);
        let persisted = store
            .load_worker_state(&WorkerKey::spot(TradeMode::Paper, "ETHUSDT"))
            .await
            .unwrap()
            .unwrap();
        let WorkerSnapshot::Spot(state) = persisted else {
            panic!("expected spot state");
        };
        assert!(!state.running);
        assert!(state.paused);
        assert_eq!(state.consecutive_stop_losses, 1);
        assert!(state.last_stop_loss_at.is_some());
    }

    #[tokio::test]
    async fn liquidate_sells_and_exits() {
        let feed = Arc::new(PaperExchange::new(dec!(0.001)));
        feed.set_price("ETHUSDT", dec!(3010));
        let (ctx, store, _scores) = paper_context(&feed, dec!(1000)).await;

        let config = config();
        let handle = spawn(config.clone(), Some(holding(&config)), ctx);
        wait_for(&handle, |s| s.state == WorkerState::Running && s.last_price.is_some()).await;

        let pnl = handle.control.liquidate().await.unwrap();
        assert_eq!(pnl, dec!(0.699));
        assert_eq!(handle.stop(Duration::from_secs(5)).await, StopOutcome::Clean);

        let Some(WorkerSnapshot::Spot(state)) = store
            .load_worker_state(&WorkerKey::spot(TradeMode::Paper, "ETHUSDT"))
            .await
            .unwrap()
        else {
            panic!("expected spot state");
        };
        assert!(state.position.is_none());
        assert!(!state.running);
        assert_eq!(state.base_balance, Decimal::ZERO);
    }

    #[tokio::test]
    async fn dust_position_is_booked_as_total_loss() {
        let feed = Arc::new(PaperExchange::new(dec!(0.001)));
        feed.set_price("ETHUSDT", dec!(3010));
        let (ctx, store, _scores) = paper_context(&feed, dec!(1000)).await;

        let config = config();
        let mut state = holding(&config);
        state.position = Position::open(&OrderFill::new(
            "seed".to_string(),
            "ETHUSDT".to_string(),
            Side::Buy,
            dec!(0.001),
            dec!(3),
            Decimal::ZERO,
        ));
        state.base_balance = dec!(0.001);
        let handle = spawn(config, Some(state), ctx.clone());
        wait_for(&handle, |s| s.state == WorkerState::Running && s.last_price.is_some()).await;

        // 0.001 at 3010 is under the 10 USDT minimum order value
        let pnl = handle.control.liquidate().await.unwrap();
        assert_eq!(pnl, dec!(-3));
        assert_eq!(handle.stop(Duration::from_secs(5)).await, StopOutcome::Clean);

        let ledger_id = WorkerKey::spot(TradeMode::Paper, "ETHUSDT").ledger_id();
        let ledger = ctx.allocator.pnl(&ledger_id).unwrap();
        assert_eq!(ledger.realized_pnl, dec!(-3));

        let trades = store
            .trades_between(Utc::now() - chrono::Duration::hours(1), Utc::now() + chrono::Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].action, TradeAction::Liquidation);
        assert_eq!(trades[0].quantity, dec!(0.001));
        assert_eq!(trades[0].quote_amount, Decimal::ZERO);
        assert_eq!(trades[0].pnl, Some(dec!(-3)));
        assert!(trades[0].order_id.is_none());
    }

    #[tokio::test]
    async fn fresh_paper_worker_is_funded_from_reservation() {
        let feed = Arc::new(PaperExchange::new(dec!(0.001)));
        feed.set_price("ETHUSDT", dec!(3000));
        let (ctx, store, _scores) = paper_context(&feed, dec!(1000)).await;

        let config = SpotWorkerConfig {
            allocation: Some(Allocation::Percent(dec!(0.5))),
            ..config()
        };
        let handle = spawn(config, None, ctx.clone());
        wait_for(&handle, |s| s.state == WorkerState::Running).await;
        assert_eq!(ctx.allocator.available(&handle.control.key().ledger_id()), dec!(500));

        handle.control.shutdown().await.unwrap();
        assert_eq!(handle.join_within(Duration::from_secs(5)).await, StopOutcome::Clean);

        let Some(WorkerSnapshot::Spot(state)) = store
            .load_worker_state(&WorkerKey::spot(TradeMode::Paper, "ETHUSDT"))
            .await
            .unwrap()
        else {
            panic!("expected spot state");
        };
        // shutdown keeps the running flag so the worker is restored
        assert!(state.running);
        assert_eq!(state.quote_balance, dec!(500));
    }

    #[tokio::test]
    async fn pause_and_resume_round_trip() {
        let feed = Arc::new(PaperExchange::new(dec!(0.001)));
        feed.set_price("ETHUSDT", dec!(3000));
        let (ctx, _store, _scores) = paper_context(&feed, dec!(1000)).await;

        let handle = spawn(config(), None, ctx);
        wait_for(&handle, |s| s.state == WorkerState::Running).await;

        handle.control.pause().await.unwrap();
        assert_eq!(handle.control.status().await.unwrap().state, WorkerState::Paused);
        handle.control.resume().await.unwrap();
        assert_eq!(handle.control.status().await.unwrap().state, WorkerState::Running);
        assert_eq!(handle.stop(Duration::from_secs(5)).await, StopOutcome::Clean);
    }
}
