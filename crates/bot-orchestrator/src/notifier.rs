//! Outbound notification sinks.
//!
//! Delivery is fire-and-forget from the worker's point of view: use
//! [`spawn_notify`] so a slow chat API never stalls a trading loop.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::json;
use spotgrid_core::config::NotifierConfig;
use spotgrid_core::traits::{Notification, NotificationLevel, Notifier};
use std::sync::Arc;
use std::time::Duration;

pub const TELEGRAM_TOKEN_ENV: &str = "SPOTGRID_TELEGRAM_TOKEN";
pub const TELEGRAM_CHAT_ENV: &str = "SPOTGRID_TELEGRAM_CHAT_ID";

/// Writes notifications to the tracing log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, n: &Notification) -> Result<()> {
        match n.level {
            NotificationLevel::Info => tracing::info!(title = %n.title, "{}", n.body),
            NotificationLevel::Warning => tracing::warn!(title = %n.title, "{}", n.body),
            NotificationLevel::Critical => tracing::error!(title = %n.title, "{}", n.body),
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "log"
    }
}

/// Sends HTML-formatted messages through the Telegram Bot API.
pub struct TelegramNotifier {
    http: reqwest::Client,
    api_url: String,
    token: String,
    chat_id: String,
}

impl TelegramNotifier {
    /// # Errors
    /// Fails on an empty token or chat id, or if the HTTP client cannot be built.
    pub fn new(api_url: impl Into<String>, token: impl Into<String>, chat_id: impl Into<String>) -> Result<Self> {
        let token = token.into();
        let chat_id = chat_id.into();
        anyhow::ensure!(!token.is_empty(), "Telegram bot token is empty");
        anyhow::ensure!(!chat_id.is_empty(), "Telegram chat id is empty");

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("Failed to build Telegram HTTP client")?;

        Ok(Self {
            http,
            api_url: api_url.into().trim_end_matches('/').to_string(),
            token,
            chat_id,
        })
    }

    /// Builds a notifier from config plus the token and chat id environment
    /// variables. Returns `None` when Telegram is disabled.
    ///
    /// # Errors
    /// Fails when Telegram is enabled but a variable is missing.
    pub fn from_env(config: &NotifierConfig) -> Result<Option<Self>> {
        if !config.telegram_enabled {
            return Ok(None);
        }
        let token = std::env::var(TELEGRAM_TOKEN_ENV)
            .with_context(|| format!("{TELEGRAM_TOKEN_ENV} must be set when Telegram is enabled"))?;
        let chat_id = std::env::var(TELEGRAM_CHAT_ENV)
            .with_context(|| format!("{TELEGRAM_CHAT_ENV} must be set when Telegram is enabled"))?;
        Self::new(config.telegram_api_url.clone(), token, chat_id).map(Some)
    }

    fn render(n: &Notification) -> String {
        let icon = match n.level {
            NotificationLevel::Info => "ℹ️",
            NotificationLevel::Warning => "⚠️",
            NotificationLevel::Critical => "🚨",
        };
        format!("{icon} <b>{}</b>\n{}", escape_html(&n.title), escape_html(&n.body))
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn notify(&self, n: &Notification) -> Result<()> {
        let url = format!("{}/bot{}/sendMessage", self.api_url, self.token);
        let payload = json!({
            "chat_id": self.chat_id,
            "text": Self::render(n),
            "parse_mode": "HTML",
            "disable_web_page_preview": true,
        });

        self.http
            .post(&url)
            .json(&payload)
            .send()
            .await
            .context("Telegram request failed")?
            .error_for_status()
            .context("Telegram rejected message")?;

        tracing::debug!(title = %n.title, level = %n.level, "Sent Telegram notification");
        Ok(())
    }

    fn name(&self) -> &str {
        "telegram"
    }
}

/// Delivers to every sink; one failing sink does not block the others.
pub struct FanoutNotifier {
    sinks: Vec<Arc<dyn Notifier>>,
}

impl FanoutNotifier {
    #[must_use]
    pub fn new(sinks: Vec<Arc<dyn Notifier>>) -> Self {
        Self { sinks }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

#[async_trait]
impl Notifier for FanoutNotifier {
    async fn notify(&self, n: &Notification) -> Result<()> {
        let mut failed = Vec::new();
        for sink in &self.sinks {
            if let Err(e) = sink.notify(n).await {
                tracing::warn!(sink = sink.name(), error = %e, "Notification sink failed");
                failed.push(sink.name().to_string());
            }
        }
        if failed.is_empty() {
            Ok(())
        } else {
            anyhow::bail!("Notification failed for: {}", failed.join(", "))
        }
    }

    fn name(&self) -> &str {
        "fanout"
    }
}

/// Sends `notification` on a detached task and logs a delivery failure.
pub fn spawn_notify(notifier: &Arc<dyn Notifier>, notification: Notification) {
    let notifier = Arc::clone(notifier);
    tokio::spawn(async move {
        if let Err(e) = notifier.notify(&notification).await {
            tracing::warn!(
                notifier = notifier.name(),
                title = %notification.title,
                error = %e,
                "Failed to deliver notification"
            );
        }
    });
}

/// Escapes the characters Telegram's HTML parse mode treats as markup.
#[must_use]
pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[derive(Default)]
    struct Recording {
        seen: Mutex<Vec<Notification>>,
        fail: bool,
    }

    #[async_trait]
    impl Notifier for Recording {
        async fn notify(&self, n: &Notification) -> Result<()> {
            self.seen.lock().push(n.clone());
            if self.fail {
                anyhow::bail!("down");
            }
            Ok(())
        }

        fn name(&self) -> &str {
            "recording"
        }
    }

    #[test]
    fn html_is_escaped() {
        assert_eq!(escape_html("a<b> & c"), "a&lt;b&gt; &amp; c");
        assert_eq!(escape_html("plain"), "plain");
    }

    #[tokio::test]
    async fn telegram_posts_html_message() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/botTOKEN/sendMessage"))
            .and(body_partial_json(json!({
                "chat_id": "42",
                "parse_mode": "HTML",
                "text": "🚨 <b>Worker banned</b>\nETHUSDT &lt;418&gt;",
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
            .expect(1)
            .mount(&server)
            .await;

        let notifier = TelegramNotifier::new(server.uri(), "TOKEN", "42").unwrap();
        notifier
            .notify(&Notification::critical("Worker banned", "ETHUSDT <418>"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn telegram_error_status_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let notifier = TelegramNotifier::new(server.uri(), "TOKEN", "42").unwrap();
        assert!(notifier.notify(&Notification::info("t", "b")).await.is_err());
    }

    #[test]
    fn disabled_telegram_builds_nothing() {
        let config = NotifierConfig::default();
        assert!(TelegramNotifier::from_env(&config).unwrap().is_none());
        assert!(TelegramNotifier::new("http://x", "", "1").is_err());
    }

    #[tokio::test]
    async fn fanout_reaches_every_sink() {
        let failing = Arc::new(Recording {
            fail: true,
            ..Recording::default()
        });
        let healthy = Arc::new(Recording::default());
        let fanout = FanoutNotifier::new(vec![
            Arc::clone(&failing) as Arc<dyn Notifier>,
            Arc::clone(&healthy) as Arc<dyn Notifier>,
        ]);

        assert!(fanout.notify(&Notification::warning("t", "b")).await.is_err());
        assert_eq!(failing.seen.lock().len(), 1);
        assert_eq!(healthy.seen.lock().len(), 1);
    }
}
