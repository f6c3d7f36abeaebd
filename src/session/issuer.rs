//! Mint new sessions.

use std::sync::Arc;
use std::time::Duration;

use chrono::TimeDelta;

use crate::clock::Clock;
use crate::crypto::{self, Crypto};
use crate::error::Result;
use crate::identity::Role;
use crate::session::{ExpirySweeper, RefreshTokenStore, Session};
use crate::token::TokenManager;

/// Creates (access, refresh) pairs and persists the refresh half.
#[derive(Clone)]
pub struct SessionIssuer {
    pub(super) store: Arc<dyn RefreshTokenStore>,
    pub(super) token: TokenManager,
    pub(super) crypto: Arc<Crypto>,
    pub(super) clock: Arc<dyn Clock>,
}

impl SessionIssuer {
    /// Create a new [`SessionIssuer`].
    pub fn new(
        store: Arc<dyn RefreshTokenStore>,
        token: TokenManager,
        crypto: Arc<Crypto>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            token,
            crypto,
            clock,
        }
    }

    /// Credential codec used by this issuer.
    pub fn token(&self) -> &TokenManager {
        &self.token
    }

    /// Sweeper bound to the same store and clock.
    pub fn sweeper(&self, retention: TimeDelta, interval: Duration) -> ExpirySweeper {
        ExpirySweeper::new(Arc::clone(&self.store), Arc::clone(&self.clock), retention, interval)
    }

    /// Store digest of a refresh token.
    pub(super) fn digest(&self, refresh_token: &str) -> String {
        self.crypto.hasher.digest(refresh_token)
    }

    /// Open a new session for an identity.
    ///
    /// Other sessions of the same identity are left untouched.
    pub async fn issue_session(&self, identity_id: &str, role: Role) -> Result<Session> {
        let refresh_token = crypto::refresh_token()?;
        self.store
            .add(identity_id, &self.digest(&refresh_token), self.clock.now())
            .await?;

        let access_token = self.token.issue(identity_id, role)?;

        metrics::counter!("sessions_issued_total").increment(1);
        tracing::debug!(%identity_id, "session issued");

        Ok(Session {
            access_token,
            refresh_token,
            expires_in: self.token.expires_in(),
        })
    }
}
