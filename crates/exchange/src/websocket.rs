//! Push-style ticker stream over the exchange WebSocket.

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use futures_util::{SinkExt, StreamExt};
use rust_decimal::Decimal;
use serde::Deserialize;
use spotgrid_core::events::Ticker;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;

use crate::types::millis_to_utc;

#[derive(Debug, Deserialize)]
struct MiniTicker {
    #[serde(rename = "E")]
    event_time: i64,
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "c")]
    close: Decimal,
    #[serde(rename = "v")]
    volume: Decimal,
}

/// Parses a `24hrMiniTicker` event; anything else yields `None`.
#[must_use]
pub fn parse_mini_ticker(text: &str) -> Option<Ticker> {
    let value: serde_json::Value = serde_json::from_str(text).ok()?;
    // combined-stream envelope: {"stream": "...", "data": {...}}
    let event = value.get("data").cloned().unwrap_or(value);
    if event.get("e").and_then(serde_json::Value::as_str) != Some("24hrMiniTicker") {
        return None;
    }
    let raw: MiniTicker = serde_json::from_value(event).ok()?;
    Some(Ticker {
        symbol: raw.symbol,
        price: raw.close,
        volume: raw.volume,
        timestamp: millis_to_utc(raw.event_time).ok()?,
    })
}

/// Mini-ticker subscription for a fixed set of pairs, fanned out over a
/// broadcast channel. Reconnects with exponential backoff until cancelled.
pub struct TickerStream {
    ws_url: String,
    symbols: Vec<String>,
    sender: broadcast::Sender<Ticker>,
    cancel: CancellationToken,
}

impl TickerStream {
    #[must_use]
    pub fn new(ws_url: impl Into<String>, symbols: Vec<String>, cancel: CancellationToken) -> Self {
        let (sender, _) = broadcast::channel(1024);
        Self {
            ws_url: ws_url.into(),
            symbols,
            sender,
            cancel,
        }
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Ticker> {
        self.sender.subscribe()
    }

    fn subscription(&self) -> String {
        let params: Vec<String> = self
            .symbols
            .iter()
            .map(|s| format!("{}@miniTicker", s.to_lowercase()))
            .collect();
        serde_json::json!({ "method": "SUBSCRIBE", "params": params, "id": 1 }).to_string()
    }

    /// Runs until the cancellation token fires.
    pub async fn run(self) {
        if self.symbols.is_empty() {
            return;
        }
        let mut backoff = ExponentialBackoff {
            initial_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(60),
            max_elapsed_time: None,
            ..ExponentialBackoff::default()
        };

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => break,
                result = self.session(&mut backoff) => {
                    if let Err(e) = result {
                        tracing::warn!(error = %e, "Ticker stream disconnected");
                    }
                }
            }

            let delay = backoff.next_backoff().unwrap_or(Duration::from_secs(60));
            tokio::select! {
                () = self.cancel.cancelled() => break,
                () = tokio::time::sleep(delay) => {}
            }
        }
        tracing::info!("Ticker stream stopped");
    }

    async fn session(&self, backoff: &mut ExponentialBackoff) -> anyhow::Result<()> {
        let (mut ws, _) = connect_async(self.ws_url.as_str()).await?;
        ws.send(Message::Text(self.subscription())).await?;
        tracing::info!(url = %self.ws_url, symbols = ?self.symbols, "Ticker stream connected");
        backoff.reset();

        while let Some(msg) = ws.next().await {
            match msg? {
                Message::Text(text) => {
                    if let Some(ticker) = parse_mini_ticker(&text) {
                        // no receivers is fine
                        let _ = self.sender.send(ticker);
                    }
                }
                Message::Ping(payload) => ws.send(Message::Pong(payload)).await?,
                Message::Close(frame) => {
                    tracing::debug!(?frame, "Ticker stream closed by server");
                    break;
                }
                _ => {}
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn parses_mini_ticker() {
        let text = r#"{"e":"24hrMiniTicker","E":1700000000000,"s":"ETHUSDT","c":"3001.25","o":"2950","h":"3010","l":"2940","v":"1234.5","q":"3700000"}"#;
        let ticker = parse_mini_ticker(text).unwrap();
        assert_eq!(ticker.symbol, "ETHUSDT");
        assert_eq!(ticker.price, dec!(3001.25));
        assert_eq!(ticker.volume, dec!(1234.5));
    }

    #[test]
    fn parses_combined_envelope() {
        let text = r#"{"stream":"ethusdt@miniTicker","data":{"e":"24hrMiniTicker","E":1700000000000,"s":"ETHUSDT","c":"3000","v":"1"}}"#;
        assert_eq!(parse_mini_ticker(text).unwrap().price, dec!(3000));
    }

    #[test]
    fn ignores_subscription_ack() {
        assert!(parse_mini_ticker(r#"{"result":null,"id":1}"#).is_none());
    }

    #[test]
    fn subscription_lowercases_symbols() {
        let stream = TickerStream::new(
            "wss://example.invalid/ws",
            vec!["ETHUSDT".to_string(), "BTCUSDT".to_string()],
            CancellationToken::new(),
        );
        let sub: serde_json::Value = serde_json::from_str(&stream.subscription()).unwrap();
        assert_eq!(sub["params"][0], "ethusdt@miniTicker");
        assert_eq!(sub["params"][1], "btcusdt@miniTicker");
    }
}
