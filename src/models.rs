// src/models.rs

use chrono::{DateTime, Utc};
use serde::Serialize;
use utoipa::ToSchema;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, sqlx::Type, ToSchema)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ProjectStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, sqlx::Type, ToSchema)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Paid,
    NotRequired,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow, ToSchema)]
pub struct Project {
    pub id: Uuid,
    pub user_id: Uuid,
    pub input_image_url: String,
    pub output_image_url: Option<String>,
    pub prompt: String,
    pub model_key: String,
    pub status: ProjectStatus,
    pub payment_status: PaymentStatus,
    /// Minor currency units.
    pub payment_amount: i64,
    pub stripe_checkout_session_id: Option<String>,
    pub stripe_payment_intent_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Values for a project row that is about to be inserted.
#[derive(Debug, Clone)]
pub struct NewProject {
    pub user_id: Uuid,
    pub input_image_url: String,
    pub prompt: String,
    pub model_key: String,
    pub status: ProjectStatus,
    pub payment_status: PaymentStatus,
    pub payment_amount: i64,
}

impl NewProject {
    pub fn into_project(self, id: Uuid, now: DateTime<Utc>) -> Project {
        Project {
            id,
            user_id: self.user_id,
            input_image_url: self.input_image_url,
            output_image_url: None,
            prompt: self.prompt,
            model_key: self.model_key,
            status: self.status,
            payment_status: self.payment_status,
            payment_amount: self.payment_amount,
            stripe_checkout_session_id: None,
            stripe_payment_intent_id: None,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BillingProfile {
    pub user_id: Uuid,
    pub stripe_customer_id: String,
    pub email: Option<String>,
}

/// The caller identity placed in request extensions by the JWT middleware.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthUser {
    pub id: Uuid,
    pub email: Option<String>,
}
