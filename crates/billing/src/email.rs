//! Outbound email delivery
//!
//! Thin client for the transactional email API. Without an API key the
//! client runs in disabled mode: sends are logged and skipped so local
//! environments work without credentials.

use async_trait::async_trait;
use serde_json::json;

use crate::error::{BillingError, BillingResult};

const DEFAULT_API_URL: &str = "https://www.unosend.co/api/v1/emails";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailMessage {
    pub to: String,
    pub subject: String,
    pub html: String,
}

#[async_trait]
pub trait EmailSender: Send + Sync {
    async fn send(&self, message: &EmailMessage) -> BillingResult<()>;
}

#[derive(Debug, Clone)]
pub struct EmailConfig {
    pub api_key: Option<String>,
    pub from: String,
    pub api_url: String,
}

impl EmailConfig {
    pub fn new(api_key: Option<String>, from: String) -> Self {
        Self {
            api_key,
            from,
            api_url: DEFAULT_API_URL.to_string(),
        }
    }

    pub fn disabled() -> Self {
        Self::new(None, "noreply@localhost".to_string())
    }
}

pub struct EmailClient {
    http: reqwest::Client,
    config: EmailConfig,
}

impl EmailClient {
    pub fn new(config: EmailConfig) -> Self {
        if config.api_key.is_none() {
            tracing::warn!("Email API key not set, notifications will be logged and skipped");
        }
        Self {
            http: reqwest::Client::new(),
            config,
        }
    }
}

#[async_trait]
impl EmailSender for EmailClient {
    async fn send(&self, message: &EmailMessage) -> BillingResult<()> {
        let Some(api_key) = &self.config.api_key else {
            tracing::info!(
                to = %message.to,
                subject = %message.subject,
                "Email delivery disabled, skipping send"
            );
            return Ok(());
        };

        let response = self
            .http
            .post(&self.config.api_url)
            .bearer_auth(api_key)
            .json(&json!({
                "from": self.config.from,
                "to": [message.to],
                "subject": message.subject,
                "html": message.html,
            }))
            .send()
            .await
            .map_err(|e| BillingError::Email(format!("email request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BillingError::Email(format!(
                "email API returned {status}: {body}"
            )));
        }

        tracing::debug!(to = %message.to, subject = %message.subject, "Email sent");
        Ok(())
    }
}
