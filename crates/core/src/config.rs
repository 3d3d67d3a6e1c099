use crate::events::TradeMode;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub exchange: ExchangeConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub market_data: MarketDataConfig,
    #[serde(default)]
    pub capital: CapitalConfig,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    #[serde(default)]
    pub notifier: NotifierConfig,
    #[serde(default)]
    pub spot_workers: Vec<SpotWorkerConfig>,
    #[serde(default)]
    pub grid_workers: Vec<GridWorkerConfig>,
}

impl AppConfig {
    /// Checks cross-field constraints that serde cannot express.
    ///
    /// Returns one message per problem; an empty list means the config is usable.
    #[must_use]
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();

        for worker in &self.spot_workers {
            problems.extend(
                worker
                    .validate()
                    .into_iter()
                    .map(|p| format!("spot {}: {p}", worker.symbol)),
            );
        }
        for worker in &self.grid_workers {
            problems.extend(
                worker
                    .validate()
                    .into_iter()
                    .map(|p| format!("grid {}: {p}", worker.symbol)),
            );
        }

        let percent_total: Decimal = self
            .spot_workers
            .iter()
            .filter_map(|w| w.allocation)
            .chain(self.grid_workers.iter().filter_map(|w| w.allocation))
            .filter_map(|a| match a {
                Allocation::Percent(p) => Some(p),
                Allocation::Fixed(_) => None,
            })
            .sum();
        if percent_total > Decimal::ONE {
            problems.push(format!(
                "percentage allocations sum to {percent_total}, above 100%"
            ));
        }

        if self.market_data.requests_per_minute == 0 {
            problems.push("market_data.requests_per_minute must be positive".to_string());
        }

        problems
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeConfig {
    #[serde(default = "default_rest_url")]
    pub rest_url: String,
    #[serde(default = "default_ws_url")]
    pub ws_url: String,
    #[serde(default = "default_recv_window")]
    pub recv_window_ms: u64,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// Upper bound on the time spent retrying one transient failure.
    #[serde(default = "default_max_retry_elapsed")]
    pub max_retry_elapsed_secs: u64,
}

fn default_rest_url() -> String {
    "https://api.binance.com".to_string()
}

fn default_ws_url() -> String {
    "wss://stream.binance.com:9443/ws".to_string()
}

const fn default_recv_window() -> u64 {
    5000
}

const fn default_request_timeout() -> u64 {
    10
}

const fn default_max_retry_elapsed() -> u64 {
    30
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            rest_url: default_rest_url(),
            ws_url: default_ws_url(),
            recv_window_ms: default_recv_window(),
            request_timeout_secs: default_request_timeout(),
            max_retry_elapsed_secs: default_max_retry_elapsed(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_url")]
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_database_url() -> String {
    "sqlite://spotgrid.db".to_string()
}

const fn default_max_connections() -> u32 {
    5
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            max_connections: default_max_connections(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketDataConfig {
    /// Request weight budget per minute.
    #[serde(default = "default_requests_per_minute")]
    pub requests_per_minute: u32,
    /// Used weight per minute above which a warning is logged.
    #[serde(default = "default_weight_warn")]
    pub weight_warn_threshold: u32,
    #[serde(default = "default_price_ttl")]
    pub price_ttl_secs: u64,
    /// Ticker stream prices older than this fall back to REST.
    #[serde(default = "default_ticker_fresh")]
    pub ticker_fresh_secs: u64,
    #[serde(default = "default_account_ttl")]
    pub account_ttl_secs: u64,
    #[serde(default = "default_volatility_ttl")]
    pub volatility_ttl_secs: u64,
    #[serde(default = "default_true")]
    pub use_ticker_stream: bool,
}

const fn default_requests_per_minute() -> u32 {
    1200
}

const fn default_weight_warn() -> u32 {
    1000
}

const fn default_price_ttl() -> u64 {
    5
}

const fn default_ticker_fresh() -> u64 {
    10
}

const fn default_account_ttl() -> u64 {
    30
}

const fn default_volatility_ttl() -> u64 {
    3600
}

const fn default_true() -> bool {
    true
}

impl Default for MarketDataConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: default_requests_per_minute(),
            weight_warn_threshold: default_weight_warn(),
            price_ttl_secs: default_price_ttl(),
            ticker_fresh_secs: default_ticker_fresh(),
            account_ttl_secs: default_account_ttl(),
            volatility_ttl_secs: default_volatility_ttl(),
            use_ticker_stream: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapitalConfig {
    /// Starting total capital when nothing is persisted and no exchange sync happens.
    #[serde(default = "default_total_capital")]
    pub total_capital: Decimal,
    #[serde(default)]
    pub auto_compound: bool,
    /// Replace total capital with the live quote balance at startup.
    #[serde(default)]
    pub sync_from_exchange: bool,
    #[serde(default = "default_quote_asset")]
    pub quote_asset: String,
}

fn default_total_capital() -> Decimal {
    Decimal::from(1000)
}

fn default_quote_asset() -> String {
    "USDT".to_string()
}

impl Default for CapitalConfig {
    fn default() -> Self {
        Self {
            total_capital: default_total_capital(),
            auto_compound: false,
            sync_from_exchange: false,
            quote_asset: default_quote_asset(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    #[serde(default = "default_health_interval")]
    pub health_interval_secs: u64,
    #[serde(default = "default_stall_threshold")]
    pub stall_threshold_secs: u64,
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout_secs: u64,
    #[serde(default = "default_summary_check")]
    pub summary_check_secs: u64,
    #[serde(default = "default_true")]
    pub summaries_enabled: bool,
    /// Restart workers whose persisted state says they were running.
    #[serde(default = "default_true")]
    pub restore_on_start: bool,
}

const fn default_health_interval() -> u64 {
    60
}

const fn default_stall_threshold() -> u64 {
    300 // 5 minutes
}

const fn default_stop_timeout() -> u64 {
    10
}

const fn default_summary_check() -> u64 {
    3600
}

impl SupervisorConfig {
    #[must_use]
    pub const fn health_interval(&self) -> Duration {
        Duration::from_secs(self.health_interval_secs)
    }

    #[must_use]
    pub const fn stall_threshold(&self) -> Duration {
        Duration::from_secs(self.stall_threshold_secs)
    }

    #[must_use]
    pub const fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            health_interval_secs: default_health_interval(),
            stall_threshold_secs: default_stall_threshold(),
            stop_timeout_secs: default_stop_timeout(),
            summary_check_secs: default_summary_check(),
            summaries_enabled: true,
            restore_on_start: true,
        }
    }
}

/// Telegram delivery settings. The bot token and chat id are read from
/// `SPOTGRID_TELEGRAM_TOKEN` / `SPOTGRID_TELEGRAM_CHAT_ID` at runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifierConfig {
    #[serde(default)]
    pub telegram_enabled: bool,
    #[serde(default = "default_telegram_url")]
    pub telegram_api_url: String,
}

fn default_telegram_url() -> String {
    "https://api.telegram.org".to_string()
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            telegram_enabled: false,
            telegram_api_url: default_telegram_url(),
        }
    }
}

/// Share of total capital reserved for one worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Allocation {
    /// Fraction of total capital in `0..=1`; follows total capital changes.
    Percent(Decimal),
    /// Fixed quote amount, capped at total capital.
    Fixed(Decimal),
}

/// Signal engine parameters.
///
/// Percentages are fractions (`0.02` = 2%); RSI thresholds are on the 0-100 scale.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrategyConfig {
    #[serde(default = "default_fast_ma")]
    pub fast_ma: usize,
    #[serde(default = "default_slow_ma")]
    pub slow_ma: usize,
    #[serde(default = "default_trend_ma")]
    pub trend_ma: usize,
    #[serde(default = "default_true")]
    pub use_trend_filter: bool,
    #[serde(default = "default_rsi_period")]
    pub rsi_period: usize,
    #[serde(default = "default_rsi_buy")]
    pub rsi_threshold_buy: Decimal,
    /// RSI below this skips the long-MA trend filter and the MACD filter.
    #[serde(default = "default_deep_dip_rsi")]
    pub deep_dip_rsi: Decimal,
    /// RSI below this skips the higher-timeframe filter.
    #[serde(default = "default_htf_bypass_rsi")]
    pub htf_bypass_rsi: Decimal,
    #[serde(default = "default_true")]
    pub use_macd_filter: bool,
    #[serde(default = "default_macd_fast")]
    pub macd_fast: usize,
    #[serde(default = "default_macd_slow")]
    pub macd_slow: usize,
    #[serde(default = "default_macd_signal")]
    pub macd_signal: usize,
    #[serde(default = "default_fee_rate")]
    pub fee_rate: Decimal,

    #[serde(default = "default_true")]
    pub use_trailing_stop: bool,
    #[serde(default = "default_trailing_stop")]
    pub trailing_stop_pct: Decimal,
    #[serde(default = "default_stop_loss")]
    pub fixed_stop_loss_pct: Decimal,
    #[serde(default = "default_ttp_activation")]
    pub ttp_activation_pct: Decimal,
    #[serde(default = "default_ttp_callback")]
    pub ttp_callback_pct: Decimal,

    #[serde(default = "default_true")]
    pub dca_enabled: bool,
    #[serde(default = "default_dca_rsi")]
    pub dca_rsi_threshold: Decimal,
    #[serde(default = "default_dca_levels")]
    pub dca_max_levels: u32,
    #[serde(default = "default_dca_multiplier")]
    pub dca_multiplier: Decimal,
    /// Price must be at or below `entry * (1 - dca_drop_pct)` to average down.
    #[serde(default = "default_dca_drop")]
    pub dca_drop_pct: Decimal,
    #[serde(default = "default_dca_cooldown")]
    pub dca_attempt_cooldown_secs: u64,

    #[serde(default = "default_stop_loss_cooldown")]
    pub cooldown_after_stop_loss_secs: u64,

    #[serde(default)]
    pub use_volume_filter: bool,
    #[serde(default = "default_volume_multiplier")]
    pub volume_multiplier: Decimal,
    #[serde(default = "default_volume_lookback")]
    pub volume_lookback: usize,

    #[serde(default)]
    pub use_sentiment_filter: bool,
    #[serde(default)]
    pub sentiment_threshold: Decimal,

    #[serde(default)]
    pub use_multi_timeframe: bool,
    #[serde(default = "default_htf_interval")]
    pub htf_interval: String,
    #[serde(default = "default_htf_ttl")]
    pub htf_cache_ttl_secs: u64,

    #[serde(default)]
    pub use_ml_confirmation: bool,
    #[serde(default = "default_ml_probability")]
    pub ml_min_probability: Decimal,

    /// Volatility-scaled stop, trail and RSI thresholds.
    #[serde(default)]
    pub dynamic_settings: bool,
    #[serde(default = "default_risk_pct")]
    pub risk_pct: Decimal,
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,
}

const fn default_fast_ma() -> usize {
    7
}

const fn default_slow_ma() -> usize {
    25
}

const fn default_trend_ma() -> usize {
    200
}

const fn default_rsi_period() -> usize {
    14
}

fn default_rsi_buy() -> Decimal {
    Decimal::from(40)
}

fn default_deep_dip_rsi() -> Decimal {
    Decimal::from(33)
}

fn default_htf_bypass_rsi() -> Decimal {
    Decimal::from(30)
}

const fn default_macd_fast() -> usize {
    12
}

const fn default_macd_slow() -> usize {
    26
}

const fn default_macd_signal() -> usize {
    9
}

fn default_fee_rate() -> Decimal {
    Decimal::new(1, 3) // 0.1% taker fee
}

fn default_trailing_stop() -> Decimal {
    Decimal::new(3, 2)
}

fn default_stop_loss() -> Decimal {
    Decimal::new(2, 2)
}

fn default_ttp_activation() -> Decimal {
    Decimal::new(15, 3)
}

fn default_ttp_callback() -> Decimal {
    Decimal::new(5, 3)
}

fn default_dca_rsi() -> Decimal {
    Decimal::from(30)
}

const fn default_dca_levels() -> u32 {
    3
}

fn default_dca_multiplier() -> Decimal {
    Decimal::ONE
}

fn default_dca_drop() -> Decimal {
    Decimal::new(2, 2)
}

const fn default_dca_cooldown() -> u64 {
    60
}

const fn default_stop_loss_cooldown() -> u64 {
    1800 // 30 minutes
}

fn default_volume_multiplier() -> Decimal {
    Decimal::new(12, 1)
}

const fn default_volume_lookback() -> usize {
    20
}

fn default_htf_interval() -> String {
    "4h".to_string()
}

const fn default_htf_ttl() -> u64 {
    900 // 15 minutes
}

fn default_ml_probability() -> Decimal {
    Decimal::new(5, 1)
}

fn default_risk_pct() -> Decimal {
    Decimal::new(2, 2)
}

const fn default_history_capacity() -> usize {
    250
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            fast_ma: default_fast_ma(),
            slow_ma: default_slow_ma(),
            trend_ma: default_trend_ma(),
            use_trend_filter: true,
            rsi_period: default_rsi_period(),
            rsi_threshold_buy: default_rsi_buy(),
            deep_dip_rsi: default_deep_dip_rsi(),
            htf_bypass_rsi: default_htf_bypass_rsi(),
            use_macd_filter: true,
            macd_fast: default_macd_fast(),
            macd_slow: default_macd_slow(),
            macd_signal: default_macd_signal(),
            fee_rate: default_fee_rate(),
            use_trailing_stop: true,
            trailing_stop_pct: default_trailing_stop(),
            fixed_stop_loss_pct: default_stop_loss(),
            ttp_activation_pct: default_ttp_activation(),
            ttp_callback_pct: default_ttp_callback(),
            dca_enabled: true,
            dca_rsi_threshold: default_dca_rsi(),
            dca_max_levels: default_dca_levels(),
            dca_multiplier: default_dca_multiplier(),
            dca_drop_pct: default_dca_drop(),
            dca_attempt_cooldown_secs: default_dca_cooldown(),
            cooldown_after_stop_loss_secs: default_stop_loss_cooldown(),
            use_volume_filter: false,
            volume_multiplier: default_volume_multiplier(),
            volume_lookback: default_volume_lookback(),
            use_sentiment_filter: false,
            sentiment_threshold: Decimal::ZERO,
            use_multi_timeframe: false,
            htf_interval: default_htf_interval(),
            htf_cache_ttl_secs: default_htf_ttl(),
            use_ml_confirmation: false,
            ml_min_probability: default_ml_probability(),
            dynamic_settings: false,
            risk_pct: default_risk_pct(),
            history_capacity: default_history_capacity(),
        }
    }
}

impl StrategyConfig {
    #[must_use]
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if self.fast_ma == 0 || self.fast_ma >= self.slow_ma {
            problems.push("fast_ma must be positive and below slow_ma".to_string());
        }
        if self.macd_fast == 0 || self.macd_fast >= self.macd_slow {
            problems.push("macd_fast must be positive and below macd_slow".to_string());
        }
        let longest = self
            .trend_ma
            .max(self.slow_ma)
            .max(self.macd_slow + self.macd_signal)
            .max(self.rsi_period + 1);
        if self.history_capacity < longest {
            problems.push(format!(
                "history_capacity {} is shorter than the longest indicator window {longest}",
                self.history_capacity
            ));
        }
        for (name, value) in [
            ("fixed_stop_loss_pct", self.fixed_stop_loss_pct),
            ("trailing_stop_pct", self.trailing_stop_pct),
            ("ttp_activation_pct", self.ttp_activation_pct),
            ("ttp_callback_pct", self.ttp_callback_pct),
            ("risk_pct", self.risk_pct),
        ] {
            if value <= Decimal::ZERO || value >= Decimal::ONE {
                problems.push(format!("{name} must be between 0 and 1, got {value}"));
            }
        }
        problems
    }
}

/// One directional spot worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpotWorkerConfig {
    pub symbol: String,
    #[serde(default)]
    pub mode: TradeMode,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub allocation: Option<Allocation>,
    #[serde(default)]
    pub strategy: StrategyConfig,
    #[serde(default = "default_tick_interval")]
    pub tick_interval_secs: u64,
    #[serde(default = "default_kline_interval")]
    pub kline_interval: String,
    #[serde(default = "default_warmup_klines")]
    pub warmup_klines: usize,
    /// Fraction of the spendable balance used when risk sizing cannot run,
    /// and the base size of each defense buy.
    #[serde(default = "default_position_size_pct")]
    pub position_size_pct: Decimal,
    #[serde(default = "default_min_notional")]
    pub min_notional: Decimal,
    #[serde(default = "default_insufficient_limit")]
    pub insufficient_funds_limit: u32,
    #[serde(default = "default_max_stop_losses")]
    pub max_consecutive_stop_losses: u32,
    #[serde(default = "default_maintenance_interval")]
    pub maintenance_interval_secs: u64,
    /// Relative volatility change that triggers an alert.
    #[serde(default = "default_volatility_shift")]
    pub volatility_shift_alert: Decimal,
    #[serde(default = "default_low_balance")]
    pub low_balance_alert: Decimal,
    #[serde(default = "default_paper_quote")]
    pub paper_starting_quote: Decimal,
}

const fn default_tick_interval() -> u64 {
    5
}

fn default_kline_interval() -> String {
    "1m".to_string()
}

const fn default_warmup_klines() -> usize {
    250
}

fn default_position_size_pct() -> Decimal {
    Decimal::new(25, 2)
}

fn default_min_notional() -> Decimal {
    Decimal::TEN
}

const fn default_insufficient_limit() -> u32 {
    3
}

const fn default_max_stop_losses() -> u32 {
    3
}

const fn default_maintenance_interval() -> u64 {
    300
}

fn default_volatility_shift() -> Decimal {
    Decimal::new(2, 1)
}

fn default_low_balance() -> Decimal {
    Decimal::from(15)
}

fn default_paper_quote() -> Decimal {
    Decimal::from(1000)
}

impl SpotWorkerConfig {
    #[must_use]
    pub fn new(symbol: impl Into<String>, mode: TradeMode) -> Self {
        Self {
            symbol: symbol.into(),
            mode,
            enabled: true,
            allocation: None,
            strategy: StrategyConfig::default(),
            tick_interval_secs: default_tick_interval(),
            kline_interval: default_kline_interval(),
            warmup_klines: default_warmup_klines(),
            position_size_pct: default_position_size_pct(),
            min_notional: default_min_notional(),
            insufficient_funds_limit: default_insufficient_limit(),
            max_consecutive_stop_losses: default_max_stop_losses(),
            maintenance_interval_secs: default_maintenance_interval(),
            volatility_shift_alert: default_volatility_shift(),
            low_balance_alert: default_low_balance(),
            paper_starting_quote: default_paper_quote(),
        }
    }

    #[must_use]
    pub fn validate(&self) -> Vec<String> {
        let mut problems = self.strategy.validate();
        if self.symbol.is_empty() {
            problems.push("symbol is empty".to_string());
        }
        if self.tick_interval_secs == 0 {
            problems.push("tick_interval_secs must be positive".to_string());
        }
        if self.position_size_pct <= Decimal::ZERO || self.position_size_pct > Decimal::ONE {
            problems.push("position_size_pct must be in (0, 1]".to_string());
        }
        problems.extend(validate_allocation(self.allocation));
        problems
    }
}

/// One grid worker. Missing bounds are computed by auto-range at start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GridWorkerConfig {
    pub symbol: String,
    #[serde(default)]
    pub mode: TradeMode,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub allocation: Option<Allocation>,
    #[serde(default)]
    pub lower: Option<Decimal>,
    #[serde(default)]
    pub upper: Option<Decimal>,
    #[serde(default = "default_grid_levels")]
    pub levels: u32,
    #[serde(default = "default_grid_capital")]
    pub capital: Decimal,
    #[serde(default = "default_true")]
    pub auto_rebalance: bool,
    /// Re-run auto-range on rebalance instead of re-centering the same spread.
    #[serde(default)]
    pub volatility_spacing: bool,
    #[serde(default = "default_grid_buffer")]
    pub buffer_pct: Decimal,
    #[serde(default = "default_min_profitable_order")]
    pub min_profitable_order: Decimal,
    #[serde(default = "default_min_notional")]
    pub min_notional: Decimal,
    #[serde(default = "default_fee_rate")]
    pub fee_rate: Decimal,
    /// Breakout beyond the bounds, as a fraction, that triggers a rebalance.
    #[serde(default = "default_grid_buffer")]
    pub rebalance_threshold: Decimal,
    #[serde(default = "default_grid_poll")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_fill_history")]
    pub fill_history: usize,
}

const fn default_grid_levels() -> u32 {
    10
}

fn default_grid_capital() -> Decimal {
    Decimal::from(100)
}

fn default_grid_buffer() -> Decimal {
    Decimal::new(5, 3) // 0.5%
}

fn default_min_profitable_order() -> Decimal {
    Decimal::from(15)
}

const fn default_grid_poll() -> u64 {
    10
}

const fn default_fill_history() -> usize {
    100
}

impl GridWorkerConfig {
    #[must_use]
    pub fn new(symbol: impl Into<String>, mode: TradeMode) -> Self {
        Self {
            symbol: symbol.into(),
            mode,
            enabled: true,
            allocation: None,
            lower: None,
            upper: None,
            levels: default_grid_levels(),
            capital: default_grid_capital(),
            auto_rebalance: true,
            volatility_spacing: false,
            buffer_pct: default_grid_buffer(),
            min_profitable_order: default_min_profitable_order(),
            min_notional: default_min_notional(),
            fee_rate: default_fee_rate(),
            rebalance_threshold: default_grid_buffer(),
            poll_interval_secs: default_grid_poll(),
            fill_history: default_fill_history(),
        }
    }

    #[must_use]
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if self.symbol.is_empty() {
            problems.push("symbol is empty".to_string());
        }
        if self.levels < 2 {
            problems.push("levels must be at least 2".to_string());
        }
        if self.capital <= Decimal::ZERO {
            problems.push("capital must be positive".to_string());
        }
        match (self.lower, self.upper) {
            (Some(lower), Some(upper)) if lower <= Decimal::ZERO || lower >= upper => {
                problems.push(format!("bounds [{lower}, {upper}] are not increasing and positive"));
            }
            (Some(_), None) | (None, Some(_)) => {
                problems.push("set both lower and upper or neither".to_string());
            }
            _ => {}
        }
        problems.extend(validate_allocation(self.allocation));
        problems
    }
}

fn validate_allocation(allocation: Option<Allocation>) -> Option<String> {
    match allocation? {
        Allocation::Percent(p) if p < Decimal::ZERO || p > Decimal::ONE => {
            Some(format!("allocation percent {p} is outside 0..=1"))
        }
        Allocation::Fixed(amount) if amount < Decimal::ZERO => {
            Some(format!("fixed allocation {amount} is negative"))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::providers::{Format, Toml};
    use figment::Figment;
    use rust_decimal_macros::dec;

    #[test]
    fn strategy_defaults_match_documented_values() {
        let config = StrategyConfig::default();
        assert_eq!(config.fast_ma, 7);
        assert_eq!(config.slow_ma, 25);
        assert_eq!(config.trend_ma, 200);
        assert_eq!(config.rsi_threshold_buy, dec!(40));
        assert_eq!(config.fixed_stop_loss_pct, dec!(0.02));
        assert_eq!(config.ttp_activation_pct, dec!(0.015));
        assert_eq!(config.ttp_callback_pct, dec!(0.005));
        assert_eq!(config.dca_max_levels, 3);
        assert_eq!(config.cooldown_after_stop_loss_secs, 1800);
        assert!(config.validate().is_empty());
    }

    #[test]
    fn minimal_toml_fills_defaults() {
        let raw = r#"
            [[spot_workers]]
            symbol = "ETHUSDT"
            allocation = { percent = 0.5 }

            [[grid_workers]]
            symbol = "SOLUSDT"
            mode = "live"
            lower = 140
            upper = 160
        "#;
        let config: AppConfig = Figment::new()
            .merge(Toml::string(raw))
            .extract()
            .unwrap();

        let spot = &config.spot_workers[0];
        assert_eq!(spot.mode, TradeMode::Paper);
        assert_eq!(spot.allocation, Some(Allocation::Percent(dec!(0.5))));
        assert_eq!(spot.strategy, StrategyConfig::default());

        let grid = &config.grid_workers[0];
        assert_eq!(grid.mode, TradeMode::Live);
        assert_eq!(grid.levels, 10);
        assert_eq!(grid.lower, Some(dec!(140)));
        assert!(config.validate().is_empty());
    }

    #[test]
    fn over_allocation_is_reported() {
        let mut config = AppConfig::default();
        let mut a = SpotWorkerConfig::new("ETHUSDT", TradeMode::Paper);
        a.allocation = Some(Allocation::Percent(dec!(0.7)));
        let mut b = GridWorkerConfig::new("ETHUSDT", TradeMode::Paper);
        b.allocation = Some(Allocation::Percent(dec!(0.5)));
        config.spot_workers.push(a);
        config.grid_workers.push(b);

        let problems = config.validate();
        assert_eq!(problems.len(), 1);
        assert!(problems[0].contains("above 100%"));
    }

    #[test]
    fn grid_bounds_must_be_paired_and_ordered() {
        let mut grid = GridWorkerConfig::new("ETHUSDT", TradeMode::Paper);
        grid.lower = Some(dec!(3200));
        assert_eq!(grid.validate().len(), 1);
        grid.upper = Some(dec!(2800));
        assert_eq!(grid.validate().len(), 1);
        grid.upper = Some(dec!(3400));
        assert!(grid.validate().is_empty());
    }

    #[test]
    fn short_history_is_flagged() {
        let config = StrategyConfig {
            history_capacity: 50,
            ..StrategyConfig::default()
        };
        assert!(config
            .validate()
            .iter()
            .any(|p| p.contains("history_capacity")));
    }
}
