// src/billing.rs

use async_trait::async_trait;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::error::{AppError, AppResult};

/// Balance after applying `delta`, or `InsufficientCredits` if it would drop below zero.
pub fn next_balance(current: i32, delta: i32) -> AppResult<i32> {
    match current.checked_add(delta) {
        Some(next) if next >= 0 => Ok(next),
        Some(_) => Err(AppError::InsufficientCredits),
        None => Err(AppError::Validation("credit adjustment out of range".into())),
    }
}

/// Per-user credit balances. The only writer of `credits.credits_remaining`.
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Creates a zero balance for the user if none exists.
    async fn ensure_account(&self, user_id: Uuid) -> AppResult<()>;

    /// Atomically applies `delta` and returns the new balance.
    async fn adjust(&self, user_id: Uuid, delta: i32) -> AppResult<i32>;

    /// Missing accounts read as zero.
    async fn balance(&self, user_id: Uuid) -> AppResult<i32>;
}

pub struct PgLedger {
    pool: PgPool,
}

impl PgLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Ledger for PgLedger {
    async fn ensure_account(&self, user_id: Uuid) -> AppResult<()> {
        sqlx::query(
            r#"INSERT INTO credits (user_id, credits_remaining)
               VALUES ($1, 0)
               ON CONFLICT (user_id) DO NOTHING"#,
        )
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn adjust(&self, user_id: Uuid, delta: i32) -> AppResult<i32> {
        // Single conditional UPDATE: concurrent adjustments serialize on the row lock.
        let row = sqlx::query(
            r#"UPDATE credits
               SET credits_remaining = credits_remaining + $2, updated_at = NOW()
               WHERE user_id = $1 AND credits_remaining + $2 >= 0
               RETURNING credits_remaining"#,
        )
        .bind(user_id)
        .bind(delta)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = row {
            let balance: i32 = row.get("credits_remaining");
            log::info!("credits adjusted user_id={} delta={} balance={}", user_id, delta, balance);
            return Ok(balance);
        }

        let exists = sqlx::query("SELECT 1 FROM credits WHERE user_id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?
            .is_some();

        if exists {
            Err(AppError::InsufficientCredits)
        } else {
            Err(AppError::NotFound)
        }
    }

    async fn balance(&self, user_id: Uuid) -> AppResult<i32> {
        let row = sqlx::query("SELECT credits_remaining FROM credits WHERE user_id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get("credits_remaining")).unwrap_or(0))
    }
}
