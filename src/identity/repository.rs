//! Identity backends.

use async_trait::async_trait;
use dashmap::DashMap;
use sqlx::{Pool, Postgres};

use super::{Identity, IdentityRecord, IdentityRepository, Role};
use crate::error::{Result, ServerError};

/// In-memory identity directory, used without PostgreSQL and in tests.
#[derive(Debug, Default)]
pub struct MemoryIdentities {
    records: DashMap<String, IdentityRecord>,
}

impl MemoryIdentities {
    /// Create a new [`MemoryIdentities`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace an identity.
    pub fn insert(&self, record: IdentityRecord) {
        self.records.insert(record.identity.id.clone(), record);
    }

    /// Forget an identity.
    pub fn remove(&self, id: &str) -> Option<IdentityRecord> {
        self.records.remove(id).map(|(_, record)| record)
    }

    /// Change the role of an identity.
    pub fn set_role(&self, id: &str, role: Role) {
        if let Some(mut record) = self.records.get_mut(id) {
            record.identity.role = role;
        }
    }
}

#[async_trait]
impl IdentityRepository for MemoryIdentities {
    async fn find_by_id(&self, id: &str) -> Result<Option<Identity>> {
        Ok(self.records.get(id).map(|r| r.identity.clone()))
    }

    async fn find_by_email(&self, email: &str) -> Result<Option<IdentityRecord>> {
        Ok(self
            .records
            .iter()
            .find(|r| r.identity.email.eq_ignore_ascii_case(email))
            .map(|r| r.value().clone()))
    }
}

/// PostgreSQL identity directory over the `users` table.
#[derive(Clone)]
pub struct PgIdentities {
    pool: Pool<Postgres>,
}

impl PgIdentities {
    /// Create a new [`PgIdentities`].
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }
}

type UserRow = (String, String, String, String, String);

fn into_record(row: UserRow) -> Result<IdentityRecord> {
    let (id, email, name, role, password_hash) = row;
    let role = role.parse::<Role>().map_err(|err| ServerError::Internal {
        details: format!("user `{id}` has an invalid role"),
        source: Some(Box::new(err)),
    })?;

    Ok(IdentityRecord {
        identity: Identity {
            id,
            email,
            name,
            role,
        },
        password_hash,
    })
}

#[async_trait]
impl IdentityRepository for PgIdentities {
    async fn find_by_id(&self, id: &str) -> Result<Option<Identity>> {
        let row = sqlx::query_as::<_, UserRow>(
            r#"SELECT id, email, name, role, password FROM users WHERE id = $1"#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(into_record)
            .transpose()
            .map(|r| r.map(|r| r.identity))
    }

    async fn find_by_email(&self, email: &str) -> Result<Option<IdentityRecord>> {
        let row = sqlx::query_as::<_, UserRow>(
            r#"SELECT id, email, name, role, password FROM users WHERE lower(email) = lower($1)"#,
        )
        .bind(email)
        .fetch_optional(&self.pool)
        .await?;

        row.map(into_record).transpose()
    }
}
