//! Binance spot connectivity: signed REST client, ticker stream, retry
//! decorator, paper exchange and the shared market data cache.

pub mod client;
pub mod market_data;
pub mod paper;
pub mod rate_limit;
pub mod retry;
pub mod signing;
mod types;
pub mod websocket;

pub use client::BinanceClient;
pub use market_data::MarketDataCache;
pub use paper::PaperExchange;
pub use rate_limit::WeightBudget;
pub use retry::RetryingExchange;
pub use signing::Credentials;
pub use websocket::{parse_mini_ticker, TickerStream};
