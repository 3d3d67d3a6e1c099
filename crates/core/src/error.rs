//! Error types for exchange interaction and order execution.

use crate::events::OrderFill;
use chrono::{DateTime, TimeZone, Utc};
use thiserror::Error;

/// Errors surfaced by an exchange facade.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExchangeError {
    /// Connection failure or reset.
    #[error("network error: {0}")]
    Network(String),

    /// Request timed out.
    #[error("request timeout: {0}")]
    Timeout(String),

    /// Rate limit hit; back off before retrying.
    #[error("rate limit exceeded, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    /// Request timestamp outside the exchange's receive window.
    #[error("timestamp outside receive window: {0}")]
    ClockSkew(String),

    /// IP or account locked out until the given instant.
    #[error("banned by exchange until {until}")]
    Banned { until: DateTime<Utc> },

    #[error("insufficient funds: {0}")]
    InsufficientFunds(String),

    #[error("order rejected: {0}")]
    OrderRejected(String),

    #[error("order not found: {order_id}")]
    OrderNotFound { order_id: String },

    #[error("unknown symbol: {0}")]
    UnknownSymbol(String),

    /// Any other API error with the exchange's numeric code.
    #[error("API error {code}: {message}")]
    Api { code: i64, message: String },

    /// Response body could not be decoded.
    #[error("decode error: {0}")]
    Decode(String),

    /// Missing credentials or bad client configuration.
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl ExchangeError {
    /// Classifies an exchange error code and message.
    ///
    /// Codes follow the Binance convention: `-1021` clock skew, `-1003` too many
    /// requests (a ban when the message carries `until <ms>`), `-2010` insufficient
    /// balance, `-2011`/`-2013` unknown order.
    #[must_use]
    pub fn from_api(code: i64, message: impl Into<String>) -> Self {
        let message = message.into();
        match code {
            -1021 => Self::ClockSkew(message),
            -1003 => parse_ban_until(&message).map_or(
                Self::RateLimited {
                    retry_after_secs: 60,
                },
                |until| Self::Banned { until },
            ),
            -1121 => Self::UnknownSymbol(message),
            -2010 if message.to_lowercase().contains("insufficient") => {
                Self::InsufficientFunds(message)
            }
            -2010 => Self::OrderRejected(message),
            -2011 | -2013 => Self::OrderNotFound { order_id: message },
            _ => Self::Api { code, message },
        }
    }

    /// Returns true for transient failures worth a bounded retry.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Network(_) | Self::Timeout(_) | Self::RateLimited { .. }
        )
    }

    #[must_use]
    pub const fn is_clock_skew(&self) -> bool {
        matches!(self, Self::ClockSkew(_))
    }

    #[must_use]
    pub fn ban_until(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Banned { until } => Some(*until),
            _ => None,
        }
    }

    #[must_use]
    pub const fn is_insufficient_funds(&self) -> bool {
        matches!(self, Self::InsufficientFunds(_))
    }
}

/// Extracts the millisecond timestamp following `until` in a ban message.
#[must_use]
pub fn parse_ban_until(message: &str) -> Option<DateTime<Utc>> {
    let idx = message.find("until")?;
    let digits: String = message[idx + "until".len()..]
        .trim_start()
        .chars()
        .take_while(char::is_ascii_digit)
        .collect();
    let millis: i64 = digits.parse().ok()?;
    Utc.timestamp_millis_opt(millis).single()
}

/// Outcome of one execution attempt.
///
/// Expected no-op conditions are values here rather than errors, so a worker
/// can log and move on without unwinding its loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    Filled(OrderFill),
    /// Asked to sell or average down without an open position.
    NoPosition,
    InsufficientFunds,
    /// Order value below the exchange minimum after rounding.
    BelowMinimum,
    Rejected(ExchangeError),
}

impl ExecutionOutcome {
    #[must_use]
    pub const fn fill(&self) -> Option<&OrderFill> {
        match self {
            Self::Filled(fill) => Some(fill),
            _ => None,
        }
    }
}

pub type ExchangeResult<T> = std::result::Result<T, ExchangeError>;
