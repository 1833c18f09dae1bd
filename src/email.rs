// src/email.rs

use async_trait::async_trait;
use serde_json::json;

use crate::error::{AppError, AppResult};

pub const SENDGRID_API_BASE: &str = "https://api.sendgrid.com";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailMessage {
    pub to: String,
    pub subject: String,
    pub text: String,
    pub html: Option<String>,
}

impl EmailMessage {
    pub fn payment_failed(to: &str) -> Self {
        Self {
            to: to.to_string(),
            subject: "Payment failed - NanoBanana".to_string(),
            text: "Your payment could not be processed. Please check your payment method or try again."
                .to_string(),
            html: Some(
                "<p>Hello,</p><p>Your last payment could not be processed. Please check your payment method or try again.</p>"
                    .to_string(),
            ),
        }
    }

    pub fn subscription_cancelled(to: &str) -> Self {
        Self {
            to: to.to_string(),
            subject: "Subscription cancelled - NanoBanana".to_string(),
            text: "Your subscription has been cancelled. Thank you for using NanoBanana.".to_string(),
            html: Some(
                "<p>Hello,</p><p>Your subscription has been cancelled. We hope to see you again soon!</p>"
                    .to_string(),
            ),
        }
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, message: &EmailMessage) -> AppResult<()>;
}

/// Used when no mail provider is configured.
pub struct LogOnlyNotifier;

#[async_trait]
impl Notifier for LogOnlyNotifier {
    async fn send(&self, message: &EmailMessage) -> AppResult<()> {
        log::warn!(
            "mail provider not configured, email not sent to={} subject={}",
            message.to,
            message.subject
        );
        Ok(())
    }
}

pub struct SendGridNotifier {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    from_email: String,
}

impl SendGridNotifier {
    pub fn new(base_url: impl Into<String>, api_key: String, from_email: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            from_email,
        }
    }
}

#[async_trait]
impl Notifier for SendGridNotifier {
    async fn send(&self, message: &EmailMessage) -> AppResult<()> {
        let mut content = vec![json!({ "type": "text/plain", "value": message.text })];
        if let Some(html) = &message.html {
            content.push(json!({ "type": "text/html", "value": html }));
        }

        let body = json!({
            "personalizations": [{ "to": [{ "email": message.to }] }],
            "from": { "email": self.from_email },
            "subject": message.subject,
            "content": content,
        });

        let resp = self
            .http
            .post(format!("{}/v3/mail/send", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| AppError::Notification(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(AppError::Notification(format!("status={status} body={body}")));
        }

        log::info!("email sent to={} subject={}", message.to, message.subject);
        Ok(())
    }
}
