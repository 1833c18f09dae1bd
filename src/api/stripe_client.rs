// src/api/stripe_client.rs
//
// Minimal client for the Stripe REST API (https://api.stripe.com)
// Auth: `Authorization: Bearer <secret key>`, form-encoded bodies.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::Deserialize;
use uuid::Uuid;

use crate::error::PaymentGatewayError;

pub const STRIPE_API_BASE: &str = "https://api.stripe.com";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckoutSessionRequest {
    pub customer_id: String,
    pub amount_cents: i64,
    pub currency: String,
    pub product_name: String,
    pub success_url: String,
    pub cancel_url: String,
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CheckoutSession {
    pub id: String,
    pub url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CheckoutSessionDetails {
    pub id: String,
    /// `paid`, `unpaid` or `no_payment_required`.
    pub payment_status: String,
    #[serde(default)]
    pub payment_intent: Option<String>,
    #[serde(default)]
    pub customer: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl CheckoutSessionDetails {
    pub fn is_paid(&self) -> bool {
        self.payment_status == "paid"
    }
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Creates a customer and returns its id.
    async fn create_customer(
        &self,
        user_id: Uuid,
        email: Option<&str>,
    ) -> Result<String, PaymentGatewayError>;

    async fn create_checkout_session(
        &self,
        request: &CheckoutSessionRequest,
    ) -> Result<CheckoutSession, PaymentGatewayError>;

    async fn retrieve_session(
        &self,
        session_id: &str,
    ) -> Result<CheckoutSessionDetails, PaymentGatewayError>;
}

#[derive(Debug, Deserialize)]
struct CreatedCustomer {
    id: String,
}

pub struct StripeClient {
    http: reqwest::Client,
    base_url: String,
    secret_key: String,
}

impl StripeClient {
    pub fn new(base_url: impl Into<String>, secret_key: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            secret_key: secret_key.into(),
        }
    }

    async fn read_json<T: for<'de> Deserialize<'de>>(
        resp: reqwest::Response,
    ) -> Result<T, PaymentGatewayError> {
        let status = resp.status();
        let body = resp.text().await?;

        if !status.is_success() {
            return Err(PaymentGatewayError::Api {
                status: status.as_u16(),
                body,
            });
        }

        serde_json::from_str::<T>(&body)
            .map_err(|e| PaymentGatewayError::InvalidResponse(format!("{e}; body={body}")))
    }
}

/// Flattens a checkout request into Stripe's bracketed form keys.
pub fn checkout_form(request: &CheckoutSessionRequest) -> Vec<(String, String)> {
    let mut form = vec![
        ("mode".to_string(), "payment".to_string()),
        ("customer".to_string(), request.customer_id.clone()),
        ("success_url".to_string(), request.success_url.clone()),
        ("cancel_url".to_string(), request.cancel_url.clone()),
        ("line_items[0][quantity]".to_string(), "1".to_string()),
        (
            "line_items[0][price_data][currency]".to_string(),
            request.currency.clone(),
        ),
        (
            "line_items[0][price_data][unit_amount]".to_string(),
            request.amount_cents.to_string(),
        ),
        (
            "line_items[0][price_data][product_data][name]".to_string(),
            request.product_name.clone(),
        ),
    ];
    form.extend(
        request
            .metadata
            .iter()
            .map(|(k, v)| (format!("metadata[{k}]"), v.clone())),
    );
    form
}

#[async_trait]
impl PaymentGateway for StripeClient {
    async fn create_customer(
        &self,
        user_id: Uuid,
        email: Option<&str>,
    ) -> Result<String, PaymentGatewayError> {
        let mut form = vec![("metadata[user_id]".to_string(), user_id.to_string())];
        if let Some(email) = email {
            form.push(("email".to_string(), email.to_string()));
        }

        let resp = self
            .http
            .post(format!("{}/v1/customers", self.base_url))
            .bearer_auth(&self.secret_key)
            .form(&form)
            .send()
            .await?;

        let customer: CreatedCustomer = Self::read_json(resp).await?;
        Ok(customer.id)
    }

    async fn create_checkout_session(
        &self,
        request: &CheckoutSessionRequest,
    ) -> Result<CheckoutSession, PaymentGatewayError> {
        let resp = self
            .http
            .post(format!("{}/v1/checkout/sessions", self.base_url))
            .bearer_auth(&self.secret_key)
            .form(&checkout_form(request))
            .send()
            .await?;

        Self::read_json(resp).await
    }

    async fn retrieve_session(
        &self,
        session_id: &str,
    ) -> Result<CheckoutSessionDetails, PaymentGatewayError> {
        let resp = self
            .http
            .get(format!("{}/v1/checkout/sessions/{}", self.base_url, session_id))
            .bearer_auth(&self.secret_key)
            .send()
            .await?;

        Self::read_json(resp).await
    }
}
