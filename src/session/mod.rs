//! Session lifecycle: issuance, rotation, revocation and sweeping of
//! refresh tokens.
//!
//! A session is not stored as such. It is the pairing of one refresh token
//! with its owner, so logging out of one device means deleting one token and
//! logging out everywhere means deleting every token of the owner.
mod issuer;
mod postgres;
mod rotator;
mod store;
mod sweeper;

use chrono::{DateTime, Utc};
use serde::Serialize;

pub use issuer::SessionIssuer;
pub use postgres::PgTokenStore;
pub use rotator::SessionRotator;
pub use store::{MemoryTokenStore, RefreshTokenStore};
pub use sweeper::ExpirySweeper;

/// Owner of a stored refresh token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenOwner {
    pub identity_id: String,
    pub created_at: DateTime<Utc>,
}

/// Freshly minted credentials handed to a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Session {
    pub access_token: String,
    pub refresh_token: String,
    /// Access credential lifetime, in seconds.
    pub expires_in: u64,
}
