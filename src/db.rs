// src/db.rs

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::error::AppResult;
use crate::models::{BillingProfile, NewProject, Project};

const PROJECT_COLUMNS: &str = r#"id, user_id, input_image_url, output_image_url, prompt, model_key,
       status, payment_status, payment_amount, stripe_checkout_session_id,
       stripe_payment_intent_id, created_at, updated_at"#;

/// Project rows. Methods taking a `user_id` are scoped to the owner; the others
/// are administrative paths used by webhooks and compensation.
#[async_trait]
pub trait ProjectRepository: Send + Sync {
    async fn insert(&self, project: NewProject) -> AppResult<Project>;

    async fn find(&self, id: Uuid, user_id: Uuid) -> AppResult<Option<Project>>;

    async fn list(&self, user_id: Uuid) -> AppResult<Vec<Project>>;

    async fn set_checkout_session(&self, id: Uuid, session_id: &str) -> AppResult<()>;

    /// Moves a paid `pending`/`failed` project to `processing`. `None` if the
    /// project was not in a launchable state.
    async fn begin_processing(&self, id: Uuid, user_id: Uuid) -> AppResult<Option<Project>>;

    async fn mark_completed(&self, id: Uuid, output_image_url: &str) -> AppResult<Project>;

    async fn mark_failed(&self, id: Uuid) -> AppResult<()>;

    /// Returns false when no project has this id.
    async fn mark_paid(
        &self,
        id: Uuid,
        session_id: &str,
        payment_intent_id: Option<&str>,
    ) -> AppResult<bool>;

    async fn delete(&self, id: Uuid, user_id: Uuid) -> AppResult<bool>;

    async fn delete_by_id(&self, id: Uuid) -> AppResult<bool>;
}

#[async_trait]
pub trait BillingProfiles: Send + Sync {
    async fn find_by_user(&self, user_id: Uuid) -> AppResult<Option<BillingProfile>>;

    async fn find_by_customer(&self, customer_id: &str) -> AppResult<Option<BillingProfile>>;

    /// Inserts the profile unless the user already has one; returns the stored profile.
    async fn insert_if_absent(&self, profile: BillingProfile) -> AppResult<BillingProfile>;
}

/// Webhook event ids that have already been applied.
#[async_trait]
pub trait PaymentEventLog: Send + Sync {
    /// Returns false if the event was claimed before.
    async fn claim(&self, event_id: &str, event_type: &str) -> AppResult<bool>;

    async fn release(&self, event_id: &str) -> AppResult<()>;
}

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ProjectRepository for PgStore {
    async fn insert(&self, project: NewProject) -> AppResult<Project> {
        let project = project.into_project(Uuid::new_v4(), Utc::now());
        let sql = format!(
            r#"INSERT INTO projects
                   (id, user_id, input_image_url, prompt, model_key, status, payment_status,
                    payment_amount, created_at, updated_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $9)
               RETURNING {PROJECT_COLUMNS}"#
        );
        let row = sqlx::query_as::<_, Project>(&sql)
            .bind(project.id)
            .bind(project.user_id)
            .bind(&project.input_image_url)
            .bind(&project.prompt)
            .bind(&project.model_key)
            .bind(project.status)
            .bind(project.payment_status)
            .bind(project.payment_amount)
            .bind(project.created_at)
            .fetch_one(&self.pool)
            .await?;
        Ok(row)
    }

    async fn find(&self, id: Uuid, user_id: Uuid) -> AppResult<Option<Project>> {
        let sql = format!("SELECT {PROJECT_COLUMNS} FROM projects WHERE id = $1 AND user_id = $2");
        let row = sqlx::query_as::<_, Project>(&sql)
            .bind(id)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn list(&self, user_id: Uuid) -> AppResult<Vec<Project>> {
        let sql = format!(
            "SELECT {PROJECT_COLUMNS} FROM projects WHERE user_id = $1 ORDER BY created_at DESC"
        );
        let rows = sqlx::query_as::<_, Project>(&sql)
            .bind(user_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    async fn set_checkout_session(&self, id: Uuid, session_id: &str) -> AppResult<()> {
        sqlx::query(
            r#"UPDATE projects
               SET stripe_checkout_session_id = $1, updated_at = NOW()
               WHERE id = $2"#,
        )
        .bind(session_id)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn begin_processing(&self, id: Uuid, user_id: Uuid) -> AppResult<Option<Project>> {
        let sql = format!(
            r#"UPDATE projects
               SET status = 'processing', updated_at = NOW()
               WHERE id = $1 AND user_id = $2
                 AND status IN ('pending', 'failed')
                 AND payment_status = 'paid'
               RETURNING {PROJECT_COLUMNS}"#
        );
        let row = sqlx::query_as::<_, Project>(&sql)
            .bind(id)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn mark_completed(&self, id: Uuid, output_image_url: &str) -> AppResult<Project> {
        let sql = format!(
            r#"UPDATE projects
               SET status = 'completed', output_image_url = $1, updated_at = NOW()
               WHERE id = $2
               RETURNING {PROJECT_COLUMNS}"#
        );
        let row = sqlx::query_as::<_, Project>(&sql)
            .bind(output_image_url)
            .bind(id)
            .fetch_one(&self.pool)
            .await?;
        Ok(row)
    }

    async fn mark_failed(&self, id: Uuid) -> AppResult<()> {
        sqlx::query(
            r#"UPDATE projects
               SET status = 'failed', updated_at = NOW()
               WHERE id = $1 AND status != 'completed'"#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_paid(
        &self,
        id: Uuid,
        session_id: &str,
        payment_intent_id: Option<&str>,
    ) -> AppResult<bool> {
        let result = sqlx::query(
            r#"UPDATE projects
               SET payment_status = 'paid',
                   stripe_checkout_session_id = $1,
                   stripe_payment_intent_id = $2,
                   updated_at = NOW()
               WHERE id = $3 AND payment_status != 'not_required'"#,
        )
        .bind(session_id)
        .bind(payment_intent_id)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete(&self, id: Uuid, user_id: Uuid) -> AppResult<bool> {
        let result = sqlx::query("DELETE FROM projects WHERE id = $1 AND user_id = $2")
            .bind(id)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_by_id(&self, id: Uuid) -> AppResult<bool> {
        let result = sqlx::query("DELETE FROM projects WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

fn profile_from_row(row: &sqlx::postgres::PgRow) -> BillingProfile {
    BillingProfile {
        user_id: row.get("user_id"),
        stripe_customer_id: row.get("stripe_customer_id"),
        email: row.get("email"),
    }
}

#[async_trait]
impl BillingProfiles for PgStore {
    async fn find_by_user(&self, user_id: Uuid) -> AppResult<Option<BillingProfile>> {
        let row = sqlx::query(
            "SELECT user_id, stripe_customer_id, email FROM billing_profiles WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(profile_from_row))
    }

    async fn find_by_customer(&self, customer_id: &str) -> AppResult<Option<BillingProfile>> {
        let row = sqlx::query(
            r#"SELECT user_id, stripe_customer_id, email
               FROM billing_profiles
               WHERE stripe_customer_id = $1"#,
        )
        .bind(customer_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(profile_from_row))
    }

    async fn insert_if_absent(&self, profile: BillingProfile) -> AppResult<BillingProfile> {
        sqlx::query(
            r#"INSERT INTO billing_profiles (user_id, stripe_customer_id, email)
               VALUES ($1, $2, $3)
               ON CONFLICT (user_id) DO NOTHING"#,
        )
        .bind(profile.user_id)
        .bind(&profile.stripe_customer_id)
        .bind(profile.email.as_deref())
        .execute(&self.pool)
        .await?;

        // A concurrent request may have won the insert; the stored row is authoritative.
        Ok(self.find_by_user(profile.user_id).await?.unwrap_or(profile))
    }
}

#[async_trait]
impl PaymentEventLog for PgStore {
    async fn claim(&self, event_id: &str, event_type: &str) -> AppResult<bool> {
        let result = sqlx::query(
            r#"INSERT INTO processed_payment_events (event_id, event_type)
               VALUES ($1, $2)
               ON CONFLICT (event_id) DO NOTHING"#,
        )
        .bind(event_id)
        .bind(event_type)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn release(&self, event_id: &str) -> AppResult<()> {
        sqlx::query("DELETE FROM processed_payment_events WHERE event_id = $1")
            .bind(event_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
