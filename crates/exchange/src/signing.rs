//! HMAC-SHA256 request signing for the spot REST API.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use spotgrid_core::error::{ExchangeError, ExchangeResult};

type HmacSha256 = Hmac<Sha256>;

/// API credentials. The secret never appears in `Debug` output.
#[derive(Clone)]
pub struct Credentials {
    pub api_key: String,
    api_secret: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &self.api_key)
            .finish_non_exhaustive()
    }
}

pub const API_KEY_ENV: &str = "SPOTGRID_API_KEY";
pub const API_SECRET_ENV: &str = "SPOTGRID_API_SECRET";

impl Credentials {
    #[must_use]
    pub fn new(api_key: impl Into<String>, api_secret: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            api_secret: api_secret.into(),
        }
    }

    /// Reads credentials from `SPOTGRID_API_KEY` / `SPOTGRID_API_SECRET`.
    ///
    /// # Errors
    /// Returns a configuration error when either variable is missing or empty.
    pub fn from_env() -> ExchangeResult<Self> {
        let read = |name: &str| {
            std::env::var(name)
                .ok()
                .filter(|v| !v.is_empty())
                .ok_or_else(|| ExchangeError::Configuration(format!("{name} is not set")))
        };
        Ok(Self::new(read(API_KEY_ENV)?, read(API_SECRET_ENV)?))
    }

    /// Hex-encoded HMAC-SHA256 of `payload` keyed by the API secret.
    ///
    /// # Errors
    /// Returns a configuration error if the key is rejected by the MAC.
    pub fn sign(&self, payload: &str) -> ExchangeResult<String> {
        let mut mac = HmacSha256::new_from_slice(self.api_secret.as_bytes())
            .map_err(|e| ExchangeError::Configuration(format!("invalid API secret: {e}")))?;
        mac.update(payload.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }
}

/// Joins `params` into a query string, appends `timestamp` and `recvWindow`,
/// and signs the result.
///
/// # Errors
/// Propagates signing failures.
pub fn signed_query(
    credentials: &Credentials,
    params: &[(&str, String)],
    timestamp_ms: i64,
    recv_window_ms: u64,
) -> ExchangeResult<String> {
    let mut query: Vec<String> = params.iter().map(|(k, v)| format!("{k}={v}")).collect();
    query.push(format!("timestamp={timestamp_ms}"));
    query.push(format!("recvWindow={recv_window_ms}"));
    let query = query.join("&");
    let signature = credentials.sign(&query)?;
    Ok(format!("{query}&signature={signature}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_matches_reference_vector() {
        // Reference request from the public Binance API documentation.
        let creds = Credentials::new(
            "vmPUZE6mv9SD5VNHk4HlWFsOr6aKE2zvsw0MuIgwCIPy6utIco14y7Ju91duEh8A",
            "NhqPtmdSJYdKjVHjA7PZj4Mge3R5YNiP1e3UZjInClVN65XAbvqqM6A7H5fATj0j",
        );
        let payload = "symbol=LTCBTC&side=BUY&type=LIMIT&timeInForce=GTC&quantity=1&price=0.1&recvWindow=5000&timestamp=1499827319559";
        assert_eq!(
            creds.sign(payload).unwrap(),
            "c8db56825ae71d6d79447849e617115f4a920fa2acdcab2b053c4b2838bd6b71"
        );
    }

    #[test]
    fn signed_query_appends_timestamp_and_signature() {
        let creds = Credentials::new("key", "secret");
        let query = signed_query(&creds, &[("symbol", "ETHUSDT".to_string())], 1000, 5000).unwrap();
        assert!(query.starts_with("symbol=ETHUSDT&timestamp=1000&recvWindow=5000&signature="));
        assert_eq!(query.rsplit('=').next().unwrap().len(), 64);
    }

    #[test]
    fn debug_hides_secret() {
        let creds = Credentials::new("key", "very-secret");
        assert!(!format!("{creds:?}").contains("very-secret"));
    }
}
