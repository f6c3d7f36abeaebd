//! Refresh token persistence.
//!
//! Stores only ever see token digests; hashing happens in the issuer and the
//! rotator.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use super::TokenOwner;
use crate::error::{Result, ServerError};

/// Port for refresh token persistence.
#[async_trait]
pub trait RefreshTokenStore: Send + Sync {
    /// Store a new refresh token for `identity_id`.
    async fn add(&self, identity_id: &str, token: &str, created_at: DateTime<Utc>) -> Result<()>;

    /// Find which identity owns a refresh token.
    async fn find_owner(&self, token: &str) -> Result<Option<TokenOwner>>;

    /// Delete one refresh token. Deleting an absent token is not an error.
    async fn remove(&self, identity_id: &str, token: &str) -> Result<()>;

    /// Delete every refresh token of `identity_id`.
    async fn remove_all(&self, identity_id: &str) -> Result<u64>;

    /// Delete every refresh token created strictly before `cutoff`.
    async fn remove_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64>;

    /// Replace `presented` with `successor` for the same owner.
    ///
    /// The successor is only stored when this call is the one that deleted
    /// `presented`. Concurrent calls with the same `presented` value get
    /// exactly one `Some`.
    async fn rotate(
        &self,
        presented: &str,
        successor: &str,
        created_at: DateTime<Utc>,
    ) -> Result<Option<String>>;
}

/// In-memory refresh token store keyed by token digest.
///
/// Entries live in a sharded map: operations on distinct tokens only contend
/// when they hash to the same shard.
#[derive(Debug, Default)]
pub struct MemoryTokenStore {
    tokens: DashMap<String, TokenOwner>,
}

impl MemoryTokenStore {
    /// Create a new [`MemoryTokenStore`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored tokens.
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    fn retain_counting(&self, mut keep: impl FnMut(&TokenOwner) -> bool) -> u64 {
        let mut removed = 0;
        self.tokens.retain(|_, owner| {
            let kept = keep(owner);
            if !kept {
                removed += 1;
            }
            kept
        });
        removed
    }
}

#[async_trait]
impl RefreshTokenStore for MemoryTokenStore {
    async fn add(&self, identity_id: &str, token: &str, created_at: DateTime<Utc>) -> Result<()> {
        match self.tokens.entry(token.to_owned()) {
            Entry::Occupied(_) => Err(ServerError::Internal {
                details: "refresh token collision".into(),
                source: None,
            }),
            Entry::Vacant(entry) => {
                entry.insert(TokenOwner {
                    identity_id: identity_id.to_owned(),
                    created_at,
                });
                Ok(())
            },
        }
    }

    async fn find_owner(&self, token: &str) -> Result<Option<TokenOwner>> {
        Ok(self.tokens.get(token).map(|owner| owner.clone()))
    }

    async fn remove(&self, identity_id: &str, token: &str) -> Result<()> {
        self.tokens
            .remove_if(token, |_, owner| owner.identity_id == identity_id);
        Ok(())
    }

    async fn remove_all(&self, identity_id: &str) -> Result<u64> {
        Ok(self.retain_counting(|owner| owner.identity_id != identity_id))
    }

    async fn remove_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        Ok(self.retain_counting(|owner| owner.created_at >= cutoff))
    }

    async fn rotate(
        &self,
        presented: &str,
        successor: &str,
        created_at: DateTime<Utc>,
    ) -> Result<Option<String>> {
        let Some((_, owner)) = self.tokens.remove(presented) else {
            return Ok(None);
        };

        self.add(&owner.identity_id, successor, created_at).await?;
        Ok(Some(owner.identity_id))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::TimeDelta;

    use super::*;

    #[tokio::test]
    async fn test_add_find_remove() {
        let store = MemoryTokenStore::new();
        let now = Utc::now();

        store.add("alice", "t1", now).await.unwrap();
        store.add("alice", "t2", now).await.unwrap();
        store.add("bob", "t3", now).await.unwrap();

        let owner = store.find_owner("t1").await.unwrap().unwrap();
        assert_eq!(owner.identity_id, "alice");
        assert_eq!(owner.created_at, now);
        assert!(store.find_owner("unknown").await.unwrap().is_none());

        // Wrong owner leaves the token alone.
        store.remove("bob", "t1").await.unwrap();
        assert!(store.find_owner("t1").await.unwrap().is_some());

        store.remove("alice", "t1").await.unwrap();
        store.remove("alice", "t1").await.unwrap();
        assert!(store.find_owner("t1").await.unwrap().is_none());

        assert_eq!(store.remove_all("alice").await.unwrap(), 1);
        assert_eq!(store.len(), 1);
        assert!(store.find_owner("t3").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_duplicate_value_rejected() {
        let store = MemoryTokenStore::new();
        store.add("alice", "t1", Utc::now()).await.unwrap();

        assert!(store.add("bob", "t1", Utc::now()).await.is_err());
        let owner = store.find_owner("t1").await.unwrap().unwrap();
        assert_eq!(owner.identity_id, "alice");
    }

    #[tokio::test]
    async fn test_retention_boundary() {
        let store = MemoryTokenStore::new();
        let now = Utc::now();

        store.add("alice", "old", now - TimeDelta::days(8)).await.unwrap();
        store.add("alice", "recent", now - TimeDelta::days(6)).await.unwrap();

        let removed = store
            .remove_older_than(now - TimeDelta::days(7))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert!(store.find_owner("old").await.unwrap().is_none());
        assert!(store.find_owner("recent").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_rotate_once() {
        let store = MemoryTokenStore::new();
        let now = Utc::now();
        store.add("alice", "t1", now).await.unwrap();

        let owner = store.rotate("t1", "t2", now).await.unwrap();
        assert_eq!(owner.as_deref(), Some("alice"));
        assert!(store.rotate("t1", "t3", now).await.unwrap().is_none());
        assert!(store.find_owner("t3").await.unwrap().is_none());
        assert_eq!(
            store.find_owner("t2").await.unwrap().unwrap().identity_id,
            "alice"
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_rotate_single_winner() {
        let store = Arc::new(MemoryTokenStore::new());
        store.add("alice", "presented", Utc::now()).await.unwrap();

        let handles = (0..32)
            .map(|i| {
                let store = Arc::clone(&store);
                tokio::spawn(async move {
                    store
                        .rotate("presented", &format!("successor-{i}"), Utc::now())
                        .await
                        .unwrap()
                })
            })
            .collect::<Vec<_>>();

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap().is_some() {
                winners += 1;
            }
        }

        assert_eq!(winners, 1);
        assert_eq!(store.len(), 1);
    }
}
