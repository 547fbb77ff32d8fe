//! Telegram Bot API notifier.
//!
//! All requests go out over IPv4; some hosts resolve api.telegram.org to an
//! IPv6 address they cannot route.

use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

use crate::config::TelegramConfig;
use crate::error::NotifyError;
use crate::notify::{Notifier, error_report};

const TELEGRAM_API_BASE: &str = "https://api.telegram.org";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
const STARTUP_MESSAGE: &str = "🤖 Email monitoring service started!\nWaiting for emails...";

/// Sends messages and documents to one chat.
pub struct TelegramNotifier {
    bot_token: SecretString,
    chat_id: String,
    api_base: String,
    client: reqwest::Client,
}

/// `getMe` result.
#[derive(Debug, Clone, Deserialize)]
pub struct BotIdentity {
    pub id: i64,
    #[serde(default)]
    pub username: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
}

impl TelegramNotifier {
    pub fn new(config: &TelegramConfig) -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder()
            .local_address(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            bot_token: config.bot_token.clone(),
            chat_id: config.chat_id.clone(),
            api_base: TELEGRAM_API_BASE.to_string(),
            client,
        })
    }

    /// Point the client at a different Bot API server.
    pub fn with_api_base(mut self, base: impl Into<String>) -> Self {
        self.api_base = base.into().trim_end_matches('/').to_string();
        self
    }

    fn api_url(&self, method: &str) -> String {
        format!(
            "{}/bot{}/{method}",
            self.api_base,
            self.bot_token.expose_secret()
        )
    }

    /// Verify the token with `getMe` and announce startup in the chat.
    pub async fn initialize(&self) -> Result<BotIdentity, NotifyError> {
        let resp = self
            .client
            .get(self.api_url("getMe"))
            .send()
            .await
            .map_err(|e| NotifyError::AuthFailed {
                name: "telegram".into(),
                reason: e.to_string(),
            })?;

        let status = resp.status();
        let body: ApiResponse<BotIdentity> = resp.json().await?;
        let me = match body.result {
            Some(me) if body.ok && status.is_success() => me,
            _ => {
                return Err(NotifyError::AuthFailed {
                    name: "telegram".into(),
                    reason: body
                        .description
                        .unwrap_or_else(|| format!("getMe returned {status}")),
                });
            }
        };

        tracing::info!(
            bot_name = me.username.as_deref().unwrap_or_default(),
            bot_id = me.id,
            "Telegram bot connected successfully"
        );

        self.send_message(STARTUP_MESSAGE).await?;
        Ok(me)
    }

    async fn check(&self, method: &str, resp: reqwest::Response) -> Result<(), NotifyError> {
        if resp.status().is_success() {
            return Ok(());
        }
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        Err(NotifyError::SendFailed {
            name: "telegram".into(),
            method: method.into(),
            reason: format!("{status}: {body}"),
        })
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn send_message(&self, text: &str) -> Result<(), NotifyError> {
        let body = serde_json::json!({
            "chat_id": self.chat_id,
            "text": text,
            "parse_mode": "HTML"
        });

        let resp = self
            .client
            .post(self.api_url("sendMessage"))
            .json(&body)
            .send()
            .await
            .map_err(|e| NotifyError::SendFailed {
                name: "telegram".into(),
                method: "sendMessage".into(),
                reason: e.to_string(),
            })?;
        self.check("sendMessage", resp).await?;

        let preview: String = text.chars().take(50).collect();
        tracing::info!(message = %preview, "Telegram message sent");
        Ok(())
    }

    async fn send_document(&self, path: &Path, caption: &str) -> Result<(), NotifyError> {
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("document.pdf")
            .to_string();

        let file_bytes = tokio::fs::read(path).await?;
        tracing::info!(
            file = %file_name,
            size_kb = file_bytes.len() / 1024,
            "Sending PDF to Telegram"
        );

        let part = Part::bytes(file_bytes)
            .file_name(file_name.clone())
            .mime_str("application/pdf")?;
        let form = Form::new()
            .text("chat_id", self.chat_id.clone())
            .part("document", part)
            .text("caption", caption.to_string());

        let resp = self
            .client
            .post(self.api_url("sendDocument"))
            .multipart(form)
            .send()
            .await?;
        self.check("sendDocument", resp).await?;

        tracing::info!(file = %file_name, "PDF sent successfully to Telegram");
        Ok(())
    }

    async fn send_error(&self, message: &str, context: &serde_json::Value) {
        if let Err(e) = self.send_message(&error_report(message, context)).await {
            tracing::error!(error = %e, "Failed to send error notification");
        }
    }
}
