// src/config.rs

use std::env;
use std::time::Duration;

use crate::api::stripe_client::STRIPE_API_BASE;
use crate::email::SENDGRID_API_BASE;
use crate::error::{AppError, AppResult};
use crate::inference::{PollPolicy, DEFAULT_API_BASE};
use crate::storage::Buckets;

#[derive(Debug, Clone)]
pub struct SendGridConfig {
    pub api_key: String,
    pub from_email: String,
    pub base_url: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub jwt_secret: String,
    pub bind_addr: String,
    pub s3_endpoint: Option<String>,
    pub s3_public_base_url: String,
    pub buckets: Buckets,
    pub replicate_api_token: String,
    pub replicate_api_base_url: String,
    pub stripe_secret_key: String,
    pub stripe_webhook_secret: String,
    pub stripe_api_base_url: String,
    pub public_base_url: String,
    pub sendgrid: Option<SendGridConfig>,
    pub poll_policy: PollPolicy,
}

impl Config {
    /// Loads `.env` (if present) and reads the process environment.
    pub fn from_env() -> AppResult<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> AppResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let required = |key: &str| {
            get(key).ok_or_else(|| AppError::Config(format!("{key} must be set")))
        };
        let or_default = |key: &str, default: &str| get(key).unwrap_or_else(|| default.to_string());

        let defaults = PollPolicy::default();
        let max_attempts = match get("GENERATION_POLL_MAX_ATTEMPTS") {
            Some(v) => v
                .parse::<u32>()
                .ok()
                .filter(|n| *n > 0)
                .ok_or_else(|| AppError::Config("GENERATION_POLL_MAX_ATTEMPTS must be a positive integer".into()))?,
            None => defaults.max_attempts,
        };
        let interval = match get("GENERATION_POLL_INTERVAL_SECS") {
            Some(v) => v
                .parse::<u64>()
                .map(Duration::from_secs)
                .map_err(|_| AppError::Config("GENERATION_POLL_INTERVAL_SECS must be an integer".into()))?,
            None => defaults.interval,
        };

        let sendgrid = match (get("SENDGRID_API_KEY"), get("SENDGRID_FROM_EMAIL")) {
            (Some(api_key), Some(from_email)) => Some(SendGridConfig {
                api_key,
                from_email,
                base_url: or_default("SENDGRID_API_BASE_URL", SENDGRID_API_BASE),
            }),
            _ => None,
        };

        Ok(Self {
            database_url: required("DATABASE_URL")?,
            jwt_secret: required("JWT_SECRET")?,
            bind_addr: or_default("BIND_ADDR", "0.0.0.0:8065"),
            s3_endpoint: get("S3_ENDPOINT"),
            s3_public_base_url: or_default(
                "S3_PUBLIC_BASE_URL",
                "https://{bucket}.s3.amazonaws.com/{key}",
            ),
            buckets: Buckets {
                input: or_default("INPUT_BUCKET", "input-images"),
                output: or_default("OUTPUT_BUCKET", "output-images"),
            },
            replicate_api_token: required("REPLICATE_API_TOKEN")?,
            replicate_api_base_url: or_default("REPLICATE_API_BASE_URL", DEFAULT_API_BASE),
            stripe_secret_key: required("STRIPE_SECRET_KEY")?,
            stripe_webhook_secret: required("STRIPE_WEBHOOK_SECRET")?,
            stripe_api_base_url: or_default("STRIPE_API_BASE_URL", STRIPE_API_BASE),
            public_base_url: or_default("PUBLIC_BASE_URL", "http://localhost:3000"),
            sendgrid,
            poll_policy: PollPolicy {
                max_attempts,
                interval,
            },
        })
    }
}
