//! PostgreSQL implementation of [`RefreshTokenStore`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Pool, Postgres};

use super::{RefreshTokenStore, TokenOwner};
use crate::error::Result;

/// PostgreSQL refresh token store over the `refresh_tokens` table.
#[derive(Clone)]
pub struct PgTokenStore {
    pool: Pool<Postgres>,
}

impl PgTokenStore {
    /// Create a new [`PgTokenStore`].
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RefreshTokenStore for PgTokenStore {
    async fn add(&self, identity_id: &str, token: &str, created_at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO refresh_tokens (token, identity_id, created_at) VALUES ($1, $2, $3)"#,
        )
        .bind(token)
        .bind(identity_id)
        .bind(created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn find_owner(&self, token: &str) -> Result<Option<TokenOwner>> {
        let row = sqlx::query_as::<_, (String, DateTime<Utc>)>(
            r#"SELECT identity_id, created_at FROM refresh_tokens WHERE token = $1"#,
        )
        .bind(token)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(identity_id, created_at)| TokenOwner {
            identity_id,
            created_at,
        }))
    }

    async fn remove(&self, identity_id: &str, token: &str) -> Result<()> {
        sqlx::query(r#"DELETE FROM refresh_tokens WHERE token = $1 AND identity_id = $2"#)
            .bind(token)
            .bind(identity_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn remove_all(&self, identity_id: &str) -> Result<u64> {
        let result = sqlx::query(r#"DELETE FROM refresh_tokens WHERE identity_id = $1"#)
            .bind(identity_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    async fn remove_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(r#"DELETE FROM refresh_tokens WHERE created_at < $1"#)
            .bind(cutoff)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    async fn rotate(
        &self,
        presented: &str,
        successor: &str,
        created_at: DateTime<Utc>,
    ) -> Result<Option<String>> {
        let mut tx = self.pool.begin().await?;

        // The row lock taken by DELETE makes concurrent rotations of the same
        // token wait, then find nothing once the winner commits.
        let owner = sqlx::query_as::<_, (String,)>(
            r#"DELETE FROM refresh_tokens WHERE token = $1 RETURNING identity_id"#,
        )
        .bind(presented)
        .fetch_optional(&mut *tx)
        .await?;

        let Some((identity_id,)) = owner else {
            tx.rollback().await?;
            return Ok(None);
        };

        sqlx::query(
            r#"INSERT INTO refresh_tokens (token, identity_id, created_at) VALUES ($1, $2, $3)"#,
        )
        .bind(successor)
        .bind(&identity_id)
        .bind(created_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(Some(identity_id))
    }
}
