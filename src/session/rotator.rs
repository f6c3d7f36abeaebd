//! Exchange refresh tokens and revoke sessions.

use std::sync::Arc;

use chrono::TimeDelta;

use crate::crypto;
use crate::error::{Result, ServerError};
use crate::identity::{Identity, IdentityRepository};
use crate::session::{Session, SessionIssuer};

/// Single-use exchange of refresh tokens.
#[derive(Clone)]
pub struct SessionRotator {
    issuer: SessionIssuer,
    identities: Arc<dyn IdentityRepository>,
    refresh_ttl: TimeDelta,
}

impl SessionRotator {
    /// Create a new [`SessionRotator`].
    pub fn new(
        issuer: SessionIssuer,
        identities: Arc<dyn IdentityRepository>,
        refresh_ttl: TimeDelta,
    ) -> Self {
        Self {
            issuer,
            identities,
            refresh_ttl,
        }
    }

    /// Consume `presented` and open a successor session for its owner.
    ///
    /// Never-issued, already rotated, revoked, swept and outdated tokens all
    /// give [`ServerError::RefreshTokenUnknown`].
    pub async fn rotate(&self, presented: &str) -> Result<(Identity, Session)> {
        self.rotate_owned(presented, None).await
    }

    /// Like [`SessionRotator::rotate`], but only when `identity_id` owns
    /// `presented`. A token of someone else is left untouched.
    pub async fn rotate_for(
        &self,
        presented: &str,
        identity_id: &str,
    ) -> Result<(Identity, Session)> {
        self.rotate_owned(presented, Some(identity_id)).await
    }

    async fn rotate_owned(
        &self,
        presented: &str,
        expected_owner: Option<&str>,
    ) -> Result<(Identity, Session)> {
        let store = &self.issuer.store;
        let presented = self.issuer.digest(presented);

        let owner = store
            .find_owner(&presented)
            .await?
            .ok_or(ServerError::RefreshTokenUnknown)?;

        if let Some(expected) = expected_owner.filter(|id| *id != owner.identity_id) {
            tracing::warn!(
                identity_id = %expected,
                owner_id = %owner.identity_id,
                "refresh token presented for another identity"
            );
            return Err(ServerError::RefreshTokenUnknown);
        }

        let now = self.issuer.clock.now();
        if owner.created_at + self.refresh_ttl <= now {
            store.remove(&owner.identity_id, &presented).await?;
            return Err(ServerError::RefreshTokenUnknown);
        }

        // Role may have changed since the previous credential was minted.
        let Some(identity) = self.identities.find_by_id(&owner.identity_id).await? else {
            let removed = store.remove_all(&owner.identity_id).await?;
            tracing::info!(
                identity_id = %owner.identity_id,
                removed,
                "dropped sessions of a deleted identity"
            );
            return Err(ServerError::IdentityNotFound);
        };

        let refresh_token = crypto::refresh_token()?;
        let rotated = store
            .rotate(&presented, &self.issuer.digest(&refresh_token), now)
            .await?;

        match rotated {
            Some(identity_id) if identity_id == identity.id => (),
            Some(identity_id) => {
                // Cannot happen with unique token values.
                return Err(ServerError::Internal {
                    details: format!("refresh token changed owner to `{identity_id}`"),
                    source: None,
                });
            },
            None => {
                tracing::warn!(
                    identity_id = %identity.id,
                    "refresh token presented twice concurrently"
                );
                return Err(ServerError::RefreshTokenUnknown);
            },
        }

        let access_token = self.issuer.token.issue(&identity.id, identity.role)?;

        metrics::counter!("sessions_rotated_total").increment(1);
        tracing::debug!(identity_id = %identity.id, "session rotated");

        Ok((
            identity,
            Session {
                access_token,
                refresh_token,
                expires_in: self.issuer.token.expires_in(),
            },
        ))
    }

    /// Close the session of `presented`. Unknown tokens are ignored.
    pub async fn revoke(&self, presented: &str) -> Result<()> {
        let store = &self.issuer.store;
        let presented = self.issuer.digest(presented);

        if let Some(owner) = store.find_owner(&presented).await? {
            store.remove(&owner.identity_id, &presented).await?;
            tracing::debug!(identity_id = %owner.identity_id, "session revoked");
        }

        Ok(())
    }

    /// Close every session of the owner of `presented`.
    pub async fn revoke_all(&self, presented: &str) -> Result<u64> {
        let store = &self.issuer.store;
        let presented = self.issuer.digest(presented);

        match store.find_owner(&presented).await? {
            Some(owner) => self.revoke_identity(&owner.identity_id).await,
            None => Ok(0),
        }
    }

    /// Close every session of `identity_id`.
    pub async fn revoke_identity(&self, identity_id: &str) -> Result<u64> {
        let removed = self.issuer.store.remove_all(identity_id).await?;
        tracing::info!(%identity_id, removed, "all sessions revoked");
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::crypto::Crypto;
    use crate::identity::{IdentityRecord, MemoryIdentities, Role};
    use crate::session::MemoryTokenStore;
    use crate::token::TokenManager;

    struct Fixture {
        clock: Arc<ManualClock>,
        identities: Arc<MemoryIdentities>,
        issuer: SessionIssuer,
        rotator: SessionRotator,
    }

    fn identity(id: &str, role: Role) -> IdentityRecord {
        IdentityRecord {
            identity: Identity {
                id: id.into(),
                email: format!("{id}@example.com"),
                name: id.into(),
                role,
            },
            password_hash: String::default(),
        }
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let dyn_clock: Arc<dyn Clock> = clock.clone();
        let identities = Arc::new(MemoryIdentities::new());
        identities.insert(identity("alice", Role::User));
        identities.insert(identity("bob", Role::User));

        let issuer = SessionIssuer::new(
            Arc::new(MemoryTokenStore::new()),
            TokenManager::new("https://auth.example.com/", "secret", dyn_clock.clone()),
            Arc::new(Crypto::new(None, "pepper").unwrap()),
            dyn_clock,
        );
        let rotator = SessionRotator::new(issuer.clone(), identities.clone(), TimeDelta::days(7));

        Fixture {
            clock,
            identities,
            issuer,
            rotator,
        }
    }

    #[tokio::test]
    async fn test_rotation_is_single_use() {
        let f = fixture();
        let session = f.issuer.issue_session("alice", Role::User).await.unwrap();

        let (identity, next) = f.rotator.rotate(&session.refresh_token).await.unwrap();
        assert_eq!(identity.id, "alice");
        assert_ne!(next.refresh_token, session.refresh_token);

        let replay = f.rotator.rotate(&session.refresh_token).await;
        assert!(matches!(replay, Err(ServerError::RefreshTokenUnknown)));

        // Successor keeps working.
        assert!(f.rotator.rotate(&next.refresh_token).await.is_ok());
    }

    #[tokio::test]
    async fn test_rotation_preserves_identity() {
        let f = fixture();
        let alice = f.issuer.issue_session("alice", Role::User).await.unwrap();
        let bob = f.issuer.issue_session("bob", Role::User).await.unwrap();

        let (_, next) = f.rotator.rotate(&bob.refresh_token).await.unwrap();
        let subject = f.issuer.token().verify(&next.access_token).unwrap();
        assert_eq!(subject.identity_id, "bob");

        let (_, next) = f.rotator.rotate(&alice.refresh_token).await.unwrap();
        let subject = f.issuer.token().verify(&next.access_token).unwrap();
        assert_eq!(subject.identity_id, "alice");
    }

    #[tokio::test]
    async fn test_rotation_reloads_role() {
        let f = fixture();
        let session = f.issuer.issue_session("alice", Role::User).await.unwrap();
        f.identities.set_role("alice", Role::Admin);

        let (_, next) = f.rotator.rotate(&session.refresh_token).await.unwrap();
        let subject = f.issuer.token().verify(&next.access_token).unwrap();
        assert_eq!(subject.role, Role::Admin);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_rotation() {
        let f = fixture();
        let session = f.issuer.issue_session("alice", Role::User).await.unwrap();

        let handles = (0..16)
            .map(|_| {
                let rotator = f.rotator.clone();
                let token = session.refresh_token.clone();
                tokio::spawn(async move { rotator.rotate(&token).await })
            })
            .collect::<Vec<_>>();

        let mut successes = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => successes += 1,
                Err(err) => assert!(matches!(err, ServerError::RefreshTokenUnknown)),
            }
        }
        assert_eq!(successes, 1);
    }

    #[tokio::test]
    async fn test_logout_is_selective() {
        let f = fixture();
        let first = f.issuer.issue_session("alice", Role::User).await.unwrap();
        let second = f.issuer.issue_session("alice", Role::User).await.unwrap();

        f.rotator.revoke(&first.refresh_token).await.unwrap();
        // Idempotent.
        f.rotator.revoke(&first.refresh_token).await.unwrap();

        assert!(matches!(
            f.rotator.rotate(&first.refresh_token).await,
            Err(ServerError::RefreshTokenUnknown)
        ));
        assert!(f.rotator.rotate(&second.refresh_token).await.is_ok());
    }

    #[tokio::test]
    async fn test_logout_all_revokes_siblings() {
        let f = fixture();
        let sessions = [
            f.issuer.issue_session("alice", Role::User).await.unwrap(),
            f.issuer.issue_session("alice", Role::User).await.unwrap(),
            f.issuer.issue_session("alice", Role::User).await.unwrap(),
        ];
        let bob = f.issuer.issue_session("bob", Role::User).await.unwrap();

        let removed = f.rotator.revoke_all(&sessions[1].refresh_token).await.unwrap();
        assert_eq!(removed, 3);

        for session in &sessions {
            assert!(f.rotator.rotate(&session.refresh_token).await.is_err());
        }
        assert!(f.rotator.rotate(&bob.refresh_token).await.is_ok());
        assert_eq!(f.rotator.revoke_all("unknown").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_rotate_for_checks_owner() {
        let f = fixture();
        let bob = f.issuer.issue_session("bob", Role::User).await.unwrap();

        assert!(matches!(
            f.rotator.rotate_for(&bob.refresh_token, "alice").await,
            Err(ServerError::RefreshTokenUnknown)
        ));
        // Bob's token survives the attempt.
        let (identity, _) = f.rotator.rotate_for(&bob.refresh_token, "bob").await.unwrap();
        assert_eq!(identity.id, "bob");
    }

    #[tokio::test]
    async fn test_outdated_token_rejected() {
        let f = fixture();
        let session = f.issuer.issue_session("alice", Role::User).await.unwrap();

        f.clock.advance(TimeDelta::days(7));
        assert!(matches!(
            f.rotator.rotate(&session.refresh_token).await,
            Err(ServerError::RefreshTokenUnknown)
        ));
    }

    #[tokio::test]
    async fn test_deleted_identity() {
        let f = fixture();
        let session = f.issuer.issue_session("alice", Role::User).await.unwrap();
        let other = f.issuer.issue_session("alice", Role::User).await.unwrap();
        f.identities.remove("alice");

        assert!(matches!(
            f.rotator.rotate(&session.refresh_token).await,
            Err(ServerError::IdentityNotFound)
        ));
        assert!(matches!(
            f.rotator.rotate(&other.refresh_token).await,
            Err(ServerError::RefreshTokenUnknown)
        ));
    }
}
