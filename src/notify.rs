// =============================================================================
// Notification Sink — outbound-only alerts, never blocking the pipeline
// =============================================================================
//
// Every send is fire-and-forget: the HTTP post runs on its own task and
// failures only log. Without a configured channel the sink degrades to
// structured log lines, so callers never need to care.
// =============================================================================

use std::time::Duration;

use tracing::{debug, info, warn};

/// Outbound message channel (Telegram-style bot API, or log-only).
pub struct Notifier {
    http: reqwest::Client,
    bot_token: Option<String>,
    chat_id: Option<String>,
}

impl Notifier {
    pub fn new(bot_token: Option<String>, chat_id: Option<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        if bot_token.is_none() || chat_id.is_none() {
            info!("no notification channel configured — alerts go to the log only");
        }

        Self {
            http,
            bot_token,
            chat_id,
        }
    }

    pub fn send_trade_alert(&self, text: impl Into<String>) {
        self.dispatch("trade", text.into());
    }

    pub fn send_status_update(&self, text: impl Into<String>) {
        self.dispatch("status", text.into());
    }

    pub fn send_error_alert(&self, text: impl Into<String>) {
        self.dispatch("error", text.into());
    }

    pub fn send_general_alert(&self, text: impl Into<String>) {
        self.dispatch("general", text.into());
    }

    fn dispatch(&self, kind: &'static str, text: String) {
        info!(kind, "{text}");

        let (Some(token), Some(chat_id)) = (self.bot_token.clone(), self.chat_id.clone()) else {
            return;
        };

        let http = self.http.clone();
        tokio::spawn(async move {
            let url = format!("https://api.telegram.org/bot{token}/sendMessage");
            let body = serde_json::json!({ "chat_id": chat_id, "text": text });
            match http.post(&url).json(&body).send().await {
                Ok(resp) if resp.status().is_success() => {
                    debug!(kind, "notification delivered");
                }
                Ok(resp) => warn!(kind, status = %resp.status(), "notification rejected"),
                Err(e) => warn!(kind, error = %e, "notification send failed"),
            }
        });
    }
}

impl std::fmt::Debug for Notifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Notifier")
            .field("configured", &self.bot_token.is_some())
            .finish()
    }
}
