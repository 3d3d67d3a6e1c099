//! Grid trading worker.
//!
//! Keeps a ladder of resting limit orders between two bounds. Every fill is
//! answered with the opposite order one grid step away, so each completed
//! buy/sell pair books one step of profit.

use spotgrid_core::ExchangeClient;
use crate::commands::{WorkerCommand, WorkerState, WorkerStatus};
use crate::context::WorkerContext;
use crate::grid::{
    auto_range, calculate_grid_levels, counter_price, is_breakout, plan_orders, recenter, GridParams,
    AUTO_RANGE_INTERVAL, AUTO_RANGE_KLINES,
};
use crate::venue::OrderVenue;
use crate::worker_handle::{ban_exit, spawn_guarded, WorkerControl, WorkerExit, WorkerHandle, WorkerSpec};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use spotgrid_core::config::GridWorkerConfig;
use spotgrid_core::error::{ExchangeError, ExecutionOutcome};
use spotgrid_core::events::{
    split_symbol, LimitOrder, MarketOrder, OrderAmount, OrderStatus, Side, SymbolFilters,
};
use spotgrid_core::state::{
    EquitySnapshot, GridOrder, GridWorkerState, TradeAction, TradeRecord, WorkerKey, WorkerSnapshot,
};
use spotgrid_core::traits::Notification;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

const COMMAND_BUFFER: usize = 32;

pub struct GridWorker {
    key: WorkerKey,
    ledger_id: String,
    config: GridWorkerConfig,
    state: GridWorkerState,
    restored: bool,
    ctx: WorkerContext,
    venue: OrderVenue,
    rx: mpsc::Receiver<WorkerCommand>,
    status_tx: watch::Sender<WorkerStatus>,
    cancel: CancellationToken,
    base_asset: String,
    quote_asset: String,
    filters: SymbolFilters,
    /// Set by any exchange error carrying a ban; checked at the end of a tick.
    ban: Option<DateTime<Utc>>,
    last_price: Option<Decimal>,
    last_equity: Decimal,
    last_activity: DateTime<Utc>,
}

#[must_use]
pub fn spawn(config: GridWorkerConfig, restored: Option<GridWorkerState>, ctx: WorkerContext) -> WorkerHandle {
    let key = WorkerKey::grid(config.mode, config.symbol.clone());
    let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
    let (status_tx, status_rx) = watch::channel(WorkerStatus::new(key.clone()));
    let cancel = CancellationToken::new();
    let notifier = ctx.notifier.clone();

    let worker = GridWorker::new(config.clone(), restored, ctx, rx, status_tx.clone(), cancel.clone());
    let join = spawn_guarded(key.clone(), status_tx, notifier, async move {
        let exit = worker.run().await;
        tracing::debug!(?exit, "Grid worker task finished");
    });

    WorkerHandle {
        control: WorkerControl::new(key, tx),
        status_rx,
        cancel,
        join,
        spec: WorkerSpec::Grid(config),
    }
}

/// True when `config` asks for other bounds or another level count than
/// the grid in `state` is laid out with.
fn layout_changed(config: &GridWorkerConfig, state: &GridWorkerState) -> bool {
    match (config.lower, config.upper) {
        (Some(lower), Some(upper)) => {
            lower != state.lower || upper != state.upper || config.levels != state.levels
        }
        _ => config.levels != state.levels,
    }
}

impl GridWorker {
    #[must_use]
    pub fn new(
        config: GridWorkerConfig,
        restored: Option<GridWorkerState>,
        ctx: WorkerContext,
        rx: mpsc::Receiver<WorkerCommand>,
        status_tx: watch::Sender<WorkerStatus>,
        cancel: CancellationToken,
    ) -> Self {
        let key = WorkerKey::grid(config.mode, config.symbol.clone());
        let (state, restored) = match restored {
            Some(mut state) if state.symbol == config.symbol && state.mode == config.mode => {
                state.config = config.clone();
                (state, true)
            }
            Some(state) => {
                tracing::warn!(
                    persisted = %state.symbol,
                    configured = %config.symbol,
                    "Persisted grid state is for another worker, starting fresh"
                );
                (GridWorkerState::new(config.clone(), Decimal::ZERO, Decimal::ZERO, config.levels), false)
            }
            None => (GridWorkerState::new(config.clone(), Decimal::ZERO, Decimal::ZERO, config.levels), false),
        };
        let (base_asset, quote_asset) = split_symbol(&config.symbol);
        let venue = OrderVenue::for_mode(config.mode, &ctx.market, config.fee_rate);

        Self {
            ledger_id: key.ledger_id(),
            key,
            filters: SymbolFilters {
                min_notional: config.min_notional,
                ..SymbolFilters::default()
            },
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
            ban: None,
            last_price: None,
            last_equity: Decimal::ZERO,
            last_activity: Utc::now(),
        }
    }

    pub async fn run(mut self) -> WorkerExit {
        let exit = match self.startup().await {
            Ok(None) => self.event_loop().await,
            Ok(Some(exit)) => exit,
            Err(e) => {
                tracing::error!(worker = %self.key, error = %e, "Grid worker failed to start");
                WorkerExit::Failed(format!("{e:#}"))
            }
        };
        self.finish(&exit).await;
        exit
    }

    async fn event_loop(&mut self) -> WorkerExit {
        let mut period = self.config.poll_interval_secs.max(1);
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
            if let Some(until) = self.ban.take() {
                return WorkerExit::Banned(until);
            }

            let wanted = self.config.poll_interval_secs.max(1);
            if wanted != period {
                period = wanted;
                ticker = tokio::time::interval(Duration::from_secs(period));
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            }
        }
    }

    async fn startup(&mut self) -> Result<Option<WorkerExit>> {
        tracing::info!(worker = %self.key, restored = self.restored, "Grid worker starting");

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
            let reserved = self
                .ctx
                .allocator
                .allocate(&self.ledger_id, allocation)
                .await
                .context("Failed to reserve capital")?;
            if !self.restored {
                self.state.capital = reserved;
            }
        }

        if let Some(until) = self.state.ban_until.filter(|until| *until > Utc::now()) {
            tracing::warn!(worker = %self.key, %until, "Exchange ban still active, waiting");
            self.status_tx.send_modify(|s| {
                s.state = WorkerState::Banned;
                s.ban_until = Some(until);
            });
            let wait = (until - Utc::now()).to_std().unwrap_or_default();
            tokio::select! {
                () = self.cancel.cancelled() => return Ok(Some(WorkerExit::Stopped)),
                () = tokio::time::sleep(wait) => {}
            }
        }

        let price = self
            .ctx
            .market
            .price(&self.config.symbol)
            .await
            .context("No price to lay out the grid")?;
        self.last_price = Some(price);

        let mut relaid = false;
        if !self.restored {
            self.choose_range(price).await;
        } else if layout_changed(&self.config, &self.state) {
            tracing::info!(worker = %self.key, "Configured layout differs from the persisted grid, re-laying");
            self.cancel_all().await;
            self.state.levels = self.config.levels;
            self.choose_range(price).await;
            relaid = true;
        }

        if let Some(paper) = self.venue.paper() {
            let quote = if self.restored {
                self.state.quote_balance
            } else {
                self.state.capital
            };
            paper.deposit(&self.quote_asset, quote);
            paper.deposit(&self.base_asset, self.state.base_inventory);
            // simulated orders do not survive a restart
            self.state.active_orders.clear();
        }
        self.venue.mark(&self.config.symbol, price);

        if relaid || self.state.active_orders.is_empty() {
            self.place_grid(price).await;
        } else {
            tracing::info!(
                worker = %self.key,
                orders = self.state.active_orders.len(),
                "Resuming with persisted live orders"
            );
        }

        self.state.running = true;
        self.state.ban_until = None;
        self.persist().await;
        self.publish();

        self.ctx.notify(Notification::info(
            format!("Grid started: {}", self.config.symbol),
            format!(
                "Mode: {}\nRange: {} - {}\nLevels: {}\nCapital: {}\nOrders: {}",
                self.config.mode,
                self.state.lower,
                self.state.upper,
                self.state.levels,
                self.state.capital.round_dp(2),
                self.state.active_orders.len()
            ),
        ));

        Ok(self.ban.take().map(WorkerExit::Banned))
    }

    /// Explicit bounds from the config, otherwise auto-range around `price`.
    async fn choose_range(&mut self, price: Decimal) {
        if let (Some(lower), Some(upper)) = (self.config.lower, self.config.upper) {
            self.state.lower = lower;
            self.state.upper = upper;
            self.state.levels = self.config.levels;
            return;
        }
        let klines = match self
            .ctx
            .market
            .klines(&self.config.symbol, AUTO_RANGE_INTERVAL, AUTO_RANGE_KLINES)
            .await
        {
            Ok(klines) => klines,
            Err(e) => {
                tracing::warn!(worker = %self.key, error = %e, "Hourly klines unavailable, using the medium band");
                Vec::new()
            }
        };
        let range = auto_range(&klines, price, self.state.capital);
        tracing::info!(
            worker = %self.key,
            lower = %range.lower,
            upper = %range.upper,
            levels = range.levels,
            volatility = ?range.volatility,
            "Auto-range computed"
        );
        self.state.lower = range.lower;
        self.state.upper = range.upper;
        self.state.levels = range.levels;
    }

    fn note_error(&mut self, e: &ExchangeError) {
        if let Some(WorkerExit::Banned(until)) = ban_exit(e) {
            self.ban = Some(until);
        }
    }

    /// Quote and base the ladder may commit.
    ///
    /// Live quote is capped at the grid's own capital plus booked profit less
    /// the inventory it holds; live base is capped at that inventory.
    async fn tradable(&mut self, price: Decimal) -> Option<(Decimal, Decimal)> {
        let account = match self.venue.account(&self.ctx.market).await {
            Ok(account) => account,
            Err(e) => {
                tracing::warn!(worker = %self.key, error = %e, "Account unavailable");
                self.note_error(&e);
                return None;
            }
        };
        let quote = account.free(&self.quote_asset);
        let base = account.free(&self.base_asset);
        if self.venue.is_live() {
            let budget = (self.state.capital + self.state.total_profit - self.state.base_inventory * price)
                .max(Decimal::ZERO);
            Some((quote.min(budget), base.min(self.state.base_inventory)))
        } else {
            Some((quote, base))
        }
    }

    async fn place_grid(&mut self, price: Decimal) {
        let Some((quote, base)) = self.tradable(price).await else {
            return;
        };
        let levels = calculate_grid_levels(
            self.state.lower,
            self.state.upper,
            self.state.levels,
            self.filters.tick_size,
        );
        let plan = plan_orders(&levels, price, quote, base, &GridParams::from(&self.config), &self.filters);
        tracing::info!(
            worker = %self.key,
            %price,
            %quote,
            %base,
            planned = plan.len(),
            "Placing grid"
        );

        for order in plan {
            if let Some(placed) = self.place_limit(order.side, order.price, order.quantity).await {
                self.state.active_orders.push(placed);
            }
            if self.ban.is_some() {
                break;
            }
        }
    }

    async fn place_limit(&mut self, side: Side, price: Decimal, quantity: Decimal) -> Option<GridOrder> {
        let order = LimitOrder {
            symbol: self.config.symbol.clone(),
            side,
            price,
            quantity,
        };
        let result = self.venue.client().submit_limit_order(&order).await;
        self.ctx.market.invalidate_account();
        match result {
            Ok(ack) => Some(GridOrder {
                price,
                side,
                quantity,
                order_id: Some(ack.order_id),
                status: OrderStatus::Open,
                created_at: Utc::now(),
                filled_at: None,
                profit: Decimal::ZERO,
                fee: Decimal::ZERO,
            }),
            Err(e) => {
                if e.is_insufficient_funds() {
                    tracing::warn!(worker = %self.key, %side, %price, %quantity, "Not enough balance for grid order");
                } else {
                    tracing::error!(worker = %self.key, %side, %price, error = %e, "Grid order rejected");
                }
                self.note_error(&e);
                None
            }
        }
    }

    async fn tick(&mut self) -> Option<WorkerExit> {
        self.last_activity = Utc::now();
        let price = match self.ctx.market.price(&self.config.symbol).await {
            Ok(price) => price,
            Err(e) => {
                tracing::warn!(worker = %self.key, error = %e, "Price unavailable, skipping grid check");
                self.publish();
                return ban_exit(&e);
            }
        };
        self.last_price = Some(price);
        self.venue.mark(&self.config.symbol, price);

        if self.state.paused {
            self.publish();
            return None;
        }

        let fills = self.check_fills().await;
        if fills > 0 {
            self.record_equity(price).await;
            self.persist().await;
        }

        if self.config.auto_rebalance
            && self.ban.is_none()
            && is_breakout(self.state.lower, self.state.upper, price, self.config.rebalance_threshold)
        {
            self.rebalance(price).await;
        }

        self.publish();
        None
    }

    /// Polls every resting order and handles the filled ones. Returns the
    /// number of fills.
    async fn check_fills(&mut self) -> usize {
        let client = self.venue.client();
        let mut filled = Vec::new();
        let mut gone = Vec::new();

        for order in &self.state.active_orders {
            let Some(order_id) = order.order_id.as_deref() else {
                continue;
            };
            match client.get_order_status(&self.config.symbol, order_id).await {
                Ok(OrderStatus::Filled) => filled.push(order_id.to_string()),
                Ok(OrderStatus::Cancelled) => gone.push(order_id.to_string()),
                Ok(OrderStatus::Open) => {}
                Err(ExchangeError::OrderNotFound { .. }) => gone.push(order_id.to_string()),
                Err(e) => {
                    tracing::warn!(worker = %self.key, %order_id, error = %e, "Order status check failed");
                    if let Some(WorkerExit::Banned(until)) = ban_exit(&e) {
                        self.ban = Some(until);
                        break;
                    }
                }
            }
        }

        if !gone.is_empty() {
            tracing::warn!(worker = %self.key, orders = ?gone, "Grid orders cancelled outside the worker");
            self.state
                .active_orders
                .retain(|o| o.order_id.as_ref().map_or(true, |id| !gone.contains(id)));
        }

        let count = filled.len();
        for order_id in filled {
            let Some(index) = self
                .state
                .active_orders
                .iter()
                .position(|o| o.order_id.as_deref() == Some(order_id.as_str()))
            else {
                continue;
            };
            let order = self.state.active_orders.remove(index);
            self.on_fill(order).await;
        }
        if count > 0 {
            self.ctx.market.invalidate_account();
        }
        count
    }

    async fn on_fill(&mut self, mut order: GridOrder) {
        let value = order.price * order.quantity;
        let reported = match order.order_id.as_deref() {
            Some(id) => match self.venue.client().order_commission(&self.config.symbol, id).await {
                Ok(commission) => commission,
                Err(e) => {
                    tracing::debug!(worker = %self.key, order_id = %id, error = %e, "Commission lookup failed");
                    None
                }
            },
            None => None,
        };
        let fee = reported.unwrap_or(value * self.config.fee_rate);
        let step = self.state.step();

        order.status = OrderStatus::Filled;
        order.filled_at = Some(Utc::now());
        order.fee = fee;
        self.state.total_fees += fee;

        let (action, pnl) = match order.side {
            Side::Buy => {
                self.state.buy_fills += 1;
                self.state.base_inventory += order.quantity;
                tracing::info!(worker = %self.key, price = %order.price, quantity = %order.quantity, %fee, "Grid buy filled");
                self.ctx.notify(Notification::info(
                    format!("GRID BUY {}", self.config.symbol),
                    format!("Price: {}\nQty: {}\nFee: {}", order.price, order.quantity, fee.round_dp(4)),
                ));
                (TradeAction::GridBuy, None)
            }
            Side::Sell => {
                let profit = order.quantity * step - Decimal::TWO * fee;
                order.profit = profit;
                self.state.sell_fills += 1;
                self.state.base_inventory = (self.state.base_inventory - order.quantity).max(Decimal::ZERO);
                self.state.total_profit += profit;
                self.ctx.allocator.record_trade(&self.ledger_id, profit, true).await;
                tracing::info!(
                    worker = %self.key,
                    price = %order.price,
                    quantity = %order.quantity,
                    %profit,
                    total_profit = %self.state.total_profit,
                    "Grid sell filled"
                );
                self.ctx.notify(Notification::info(
                    format!("GRID PROFIT {}", self.config.symbol),
                    format!(
                        "Sold {} @ {}\nProfit: {}\nTotal: {}",
                        order.quantity,
                        order.price,
                        profit.round_dp(4),
                        self.state.total_profit.round_dp(2)
                    ),
                ));
                (TradeAction::GridSell, Some(profit))
            }
        };

        self.ctx
            .journal_trade(&TradeRecord {
                worker: self.key.clone(),
                action,
                side: order.side,
                price: order.price,
                quantity: order.quantity,
                quote_amount: value,
                fee,
                pnl,
                order_id: order.order_id.clone(),
                timestamp: Utc::now(),
            })
            .await;

        if let Some((side, price)) = counter_price(&order, step, self.state.lower, self.state.upper, &self.filters) {
            if let Some(counter) = self.place_limit(side, price, order.quantity).await {
                tracing::debug!(worker = %self.key, %side, %price, "Counter order placed");
                self.state.active_orders.push(counter);
            }
        } else {
            tracing::debug!(worker = %self.key, price = %order.price, "Counter order would leave the range");
        }

        self.state.filled_orders.push(order);
        let excess = self
            .state
            .filled_orders
            .len()
            .saturating_sub(self.config.fill_history);
        self.state.filled_orders.drain(..excess);
    }

    /// Cancels every resting order. Orders the exchange no longer knows are
    /// dropped silently.
    /// Cancels every tracked order. Orders whose cancel fails stay tracked so
    /// their fills are still booked by later ticks.
    async fn cancel_all(&mut self) {
        let client = self.venue.client();
        let mut still_open = Vec::new();
        for order in std::mem::take(&mut self.state.active_orders) {
            let Some(order_id) = order.order_id.clone() else {
                continue;
            };
            match client.cancel_order(&self.config.symbol, &order_id).await {
                Ok(()) | Err(ExchangeError::OrderNotFound { .. }) => {}
                Err(e) => {
                    tracing::warn!(worker = %self.key, %order_id, error = %e, "Cancel failed, keeping order tracked");
                    self.note_error(&e);
                    still_open.push(order);
                }
            }
        }
        self.state.active_orders = still_open;
        self.ctx.market.invalidate_account();
    }

    async fn rebalance(&mut self, price: Decimal) {
        let (old_lower, old_upper) = (self.state.lower, self.state.upper);
        self.cancel_all().await;

        if self.config.volatility_spacing {
            self.config.lower = None;
            self.config.upper = None;
            self.choose_range(price).await;
        } else {
            let (lower, upper) = recenter(old_lower, old_upper, price);
            self.state.lower = self.filters.round_price(lower);
            self.state.upper = self.filters.round_price(upper);
        }
        self.state.rebalance_count += 1;
        tracing::warn!(
            worker = %self.key,
            %price,
            %old_lower,
            %old_upper,
            lower = %self.state.lower,
            upper = %self.state.upper,
            "Price left the grid, rebalancing"
        );

        self.place_grid(price).await;
        self.ctx.notify(Notification::warning(
            format!("Grid rebalanced: {}", self.config.symbol),
            format!(
                "Price: {price}\nOld: {old_lower} - {old_upper}\nNew: {} - {}",
                self.state.lower, self.state.upper
            ),
        ));
        self.persist().await;
    }

    async fn liquidate(&mut self) -> Result<Decimal> {
        self.check_fills().await;
        self.cancel_all().await;

        let price = match self.last_price {
            Some(price) => price,
            None => self.ctx.market.price(&self.config.symbol).await?,
        };
        let account = self.venue.account(&self.ctx.market).await?;
        let quantity = self
            .filters
            .round_qty(self.state.base_inventory.min(account.free(&self.base_asset)));

        if quantity > Decimal::ZERO && self.filters.meets_min_notional(price, quantity) {
            let order = MarketOrder {
                symbol: self.config.symbol.clone(),
                side: Side::Sell,
                amount: OrderAmount::Base(quantity),
            };
            match self.venue.market_order(&order, &self.ctx.market).await {
                ExecutionOutcome::Filled(fill) => {
                    self.state.total_fees += fill.commission;
                    self.ctx
                        .journal_trade(&TradeRecord {
                            worker: self.key.clone(),
                            action: TradeAction::Liquidation,
                            side: Side::Sell,
                            price: fill.avg_price,
                            quantity: fill.executed_qty,
                            quote_amount: fill.cumulative_quote,
                            fee: fill.commission,
                            pnl: None,
                            order_id: Some(fill.order_id.clone()),
                            timestamp: fill.timestamp,
                        })
                        .await;
                    tracing::info!(worker = %self.key, quantity = %fill.executed_qty, price = %fill.avg_price, "Grid inventory sold");
                }
                ExecutionOutcome::Rejected(e) => return Err(e).context("Inventory sale rejected"),
                other => anyhow::bail!("Inventory sale not executed: {other:?}"),
            }
        } else if quantity > Decimal::ZERO {
            tracing::warn!(worker = %self.key, %quantity, "Grid inventory below minimum order, left in place");
        }
        self.state.base_inventory = Decimal::ZERO;

        self.ctx.notify(Notification::warning(
            format!("Grid liquidated: {}", self.config.symbol),
            format!("Total profit: {}", self.state.total_profit.round_dp(2)),
        ));
        Ok(self.state.total_profit)
    }

    async fn handle_command(&mut self, cmd: WorkerCommand) -> Option<WorkerExit> {
        match cmd {
            WorkerCommand::Pause => {
                if self.state.paused {
                    tracing::warn!(worker = %self.key, "Already paused, ignoring pause");
                } else {
                    self.state.paused = true;
                    tracing::info!(worker = %self.key, "Grid paused, resting orders stay on the book");
                    self.persist().await;
                }
            }
            WorkerCommand::Resume => {
                if self.state.paused {
                    self.state.paused = false;
                    tracing::info!(worker = %self.key, "Grid resumed");
                    self.persist().await;
                } else {
                    tracing::warn!(worker = %self.key, "Not paused, ignoring resume");
                }
            }
            WorkerCommand::UpdateGridConfig(config) => self.apply_config(*config).await,
            WorkerCommand::UpdateSpotConfig(_) => {
                tracing::warn!(worker = %self.key, "Spot config sent to a grid worker, ignoring");
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

    async fn apply_config(&mut self, config: GridWorkerConfig) {
        if config.symbol != self.config.symbol || config.mode != self.config.mode {
            tracing::warn!(worker = %self.key, symbol = %config.symbol, "Config update for a different worker, ignoring");
            return;
        }
        if config == self.config {
            return;
        }

        if config.allocation != self.config.allocation {
            match config.allocation {
                Some(allocation) => match self.ctx.allocator.allocate(&self.ledger_id, allocation).await {
                    Ok(reserved) => self.state.capital = reserved,
                    Err(e) => {
                        tracing::warn!(worker = %self.key, error = %e, "Rejected allocation change");
                        return;
                    }
                },
                None => {
                    self.ctx.allocator.release(&self.ledger_id).await;
                    self.state.capital = config.capital;
                }
            }
        } else if config.allocation.is_none() {
            self.state.capital = config.capital;
        }

        let reset = layout_changed(&config, &self.state);

        self.state.config = config.clone();
        self.config = config;

        if reset {
            if let Some(price) = self.last_price {
                tracing::info!(worker = %self.key, "Grid layout changed, re-placing orders");
                self.cancel_all().await;
                self.state.levels = self.config.levels;
                self.choose_range(price).await;
                self.place_grid(price).await;
            }
        }
        tracing::info!(worker = %self.key, "Grid config updated");
        self.persist().await;
    }

    async fn record_equity(&mut self, price: Decimal) {
        let Ok(account) = self.venue.account(&self.ctx.market).await else {
            return;
        };
        let quote = account.total(&self.quote_asset);
        let base = if self.venue.is_live() {
            self.state.base_inventory
        } else {
            account.total(&self.base_asset)
        };
        self.last_equity = quote + base * price;
        self.ctx
            .journal_equity(&EquitySnapshot {
                worker: self.key.clone(),
                equity: self.last_equity,
                quote_balance: quote,
                base_balance: base,
                price,
                timestamp: Utc::now(),
            })
            .await;
    }

    async fn finish(&mut self, exit: &WorkerExit) {
        let state = match exit {
            WorkerExit::Shutdown => WorkerState::Stopped,
            WorkerExit::Banned(until) => {
                self.state.running = false;
                self.state.ban_until = Some(*until);
                tracing::error!(worker = %self.key, %until, "Exchange ban, grid stopped");
                self.ctx.notify(Notification::critical(
                    format!("Grid {} banned by exchange", self.config.symbol),
                    format!("Trading halted until {until}. Resting orders were left in place."),
                ));
                WorkerState::Banned
            }
            WorkerExit::Failed(message) => {
                self.ctx.notify(Notification::critical(
                    format!("Grid {} failed", self.config.symbol),
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
        tracing::info!(worker = %self.key, ?exit, "Grid worker exited");
    }

    async fn persist(&mut self) {
        if let Some(paper) = self.venue.paper() {
            if let Ok(account) = paper.get_account().await {
                self.state.quote_balance = account.total(&self.quote_asset);
            }
        }
        self.state.updated_at = Utc::now();
        self.ctx
            .persist(&WorkerSnapshot::Grid(Box::new(self.state.clone())))
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
            position: None,
            equity: self.last_equity,
            realized_pnl: self.state.total_profit,
            trades: self.state.buy_fills + self.state.sell_fills,
            open_orders: self.state.active_orders.len(),
            ban_until: self.state.ban_until,
            last_rejection: None,
            error: None,
        }
    }

    fn publish(&self) {
        self.status_tx.send_replace(self.status());
    }
}
