// =============================================================================
// Notifier — best-effort Telegram alerts, decoupled from the trading path
// =============================================================================
//
// Ported from `tools/notifier_tools.py`: sends/photo calls never propagate
// errors into the caller — a missing bot token or a failed HTTP call logs a
// warning and returns `false`, it never blocks an order from going out.
// =============================================================================

use std::path::Path;
use std::time::Duration;

use tracing::{debug, warn};

pub struct Notifier {
    bot_token: String,
    chat_id: String,
    http: reqwest::Client,
}

impl Notifier {
    pub fn from_env() -> Self {
        let bot_token = std::env::var("TELEGRAM_BOT_TOKEN").unwrap_or_default();
        let chat_id = std::env::var("TELEGRAM_CHAT_ID").unwrap_or_default();
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");
        Self { bot_token, chat_id, http }
    }

    fn configured(&self) -> bool {
        !self.bot_token.is_empty() && !self.chat_id.is_empty()
    }

    /// Send a plain-text message. Never returns an error; failures are
    /// logged and swallowed so a notification outage never halts trading.
    pub async fn send(&self, text: &str) -> bool {
        if !self.configured() {
            debug!(preview = %text.chars().take(60).collect::<String>(), "notifier unconfigured, logging only");
            return false;
        }
        let url = format!("https://api.telegram.org/bot{}/sendMessage", self.bot_token);
        let body = serde_json::json!({
            "chat_id": self.chat_id,
            "text": text,
            "parse_mode": "HTML",
        });
        match self.http.post(&url).json(&body).send().await {
            Ok(resp) if resp.status().is_success() => true,
            Ok(resp) => {
                warn!(status = %resp.status(), "telegram send failed");
                false
            }
            Err(e) => {
                warn!(error = %e, "telegram send request failed");
                false
            }
        }
    }

    /// Send an image file with an optional caption (used for dashboard
    /// snapshot pushes). Same best-effort contract as `send`.
    pub async fn send_image(&self, image_path: &Path, caption: &str) -> bool {
        if !self.configured() {
            return false;
        }
        if !image_path.exists() {
            warn!(path = %image_path.display(), "notifier image path missing");
            return false;
        }
        let bytes = match tokio::fs::read(image_path).await {
            Ok(b) => b,
            Err(e) => {
                warn!(error = %e, "failed to read notifier image");
                return false;
            }
        };
        let file_name = image_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "snapshot.png".to_string());
        let part = reqwest::multipart::Part::bytes(bytes).file_name(file_name);
        let mut form = reqwest::multipart::Form::new()
            .text("chat_id", self.chat_id.clone())
            .part("photo", part);
        if !caption.is_empty() {
            form = form.text("caption", caption.to_string()).text("parse_mode", "HTML");
        }
        let url = format!("https://api.telegram.org/bot{}/sendPhoto", self.bot_token);
        match self.http.post(&url).multipart(form).send().await {
            Ok(resp) if resp.status().is_success() => true,
            Ok(resp) => {
                warn!(status = %resp.status(), "telegram image send failed");
                false
            }
            Err(e) => {
                warn!(error = %e, "telegram image send request failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unconfigured_notifier_returns_false_without_network() {
        std::env::remove_var("TELEGRAM_BOT_TOKEN");
        std::env::remove_var("TELEGRAM_CHAT_ID");
        let notifier = Notifier::from_env();
        assert!(!notifier.send("test message").await);
    }
}
