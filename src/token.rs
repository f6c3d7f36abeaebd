//! Manage access credentials (json web tokens).

use std::sync::Arc;

use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use rand::distributions::{Alphanumeric, DistString};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

use crate::clock::Clock;
use crate::identity::Role;

const DEFAULT_AUDIENCE: &str = "warden";
const JTI_LENGTH: usize = 12;
/// Lifetime of an access credential, in seconds.
pub const EXPIRATION_TIME: u64 = 60 * 15; // 15 minutes.

/// Failures while handling an access credential.
#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("credential cannot be parsed")]
    Malformed,
    #[error("credential signature does not match")]
    SignatureInvalid,
    #[error("credential has expired")]
    Expired,
    #[error("cannot sign credential: {0}")]
    Signing(#[source] jsonwebtoken::errors::Error),
}

/// Pieces of information asserted on a JWT.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Claims {
    /// Recipients that the JWT is intended for.
    pub aud: String,
    /// Identifies the expiration time on or after which the JWT must not be
    /// accepted for processing.
    pub exp: u64,
    /// Identifies the time at which the JWT was issued.
    pub iat: u64,
    /// Identifies the instance that issued the JWT.
    pub iss: String,
    /// Unique identifier of this credential.
    pub jti: String,
    /// Identity ID.
    pub sub: String,
    /// Role of the identity when the JWT was minted.
    pub role: Role,
}

/// Identity asserted by a verified credential.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Subject {
    pub identity_id: String,
    pub role: Role,
}

/// Encode and verify access credentials.
#[derive(Clone)]
pub struct TokenManager {
    algorithm: Algorithm,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    issuer: String,
    audience: String,
    lifetime: u64,
    clock: Arc<dyn Clock>,
}

impl TokenManager {
    /// Create a new [`TokenManager`] signing with HMAC-SHA256.
    pub fn new(issuer: &str, secret: impl AsRef<[u8]>, clock: Arc<dyn Clock>) -> Self {
        Self {
            algorithm: Algorithm::HS256,
            encoding_key: EncodingKey::from_secret(secret.as_ref()),
            decoding_key: DecodingKey::from_secret(secret.as_ref()),
            issuer: issuer.to_owned(),
            audience: DEFAULT_AUDIENCE.to_string(),
            lifetime: EXPIRATION_TIME,
            clock,
        }
    }

    /// Set `audience` field on JWT.
    pub fn audience(mut self, audience: &str) -> Self {
        self.audience = audience.to_owned();
        self
    }

    /// Change credential lifetime, in seconds.
    pub fn lifetime(mut self, seconds: u64) -> Self {
        self.lifetime = seconds;
        self
    }

    /// Lifetime of issued credentials, in seconds.
    pub fn expires_in(&self) -> u64 {
        self.lifetime
    }

    /// Create a new signed credential for `identity_id`.
    pub fn issue(&self, identity_id: &str, role: Role) -> Result<String, CredentialError> {
        let now = self.clock.timestamp();
        let claims = Claims {
            aud: self.audience.clone(),
            exp: now + self.lifetime,
            iat: now,
            iss: self.issuer.clone(),
            jti: Alphanumeric.sample_string(&mut OsRng, JTI_LENGTH),
            sub: identity_id.to_owned(),
            role,
        };

        encode(&Header::new(self.algorithm), &claims, &self.encoding_key)
            .map_err(CredentialError::Signing)
    }

    /// Decode a credential, checking signature and expiry.
    pub fn verify(&self, token: &str) -> Result<Subject, CredentialError> {
        let claims = self.decode(token)?;

        if self.clock.timestamp() >= claims.exp {
            return Err(CredentialError::Expired);
        }

        Ok(Subject {
            identity_id: claims.sub,
            role: claims.role,
        })
    }

    /// Decode a credential without checking expiry.
    pub fn decode(&self, token: &str) -> Result<Claims, CredentialError> {
        let mut validation = Validation::new(self.algorithm);
        // Expiry is compared against our own clock.
        validation.validate_exp = false;
        validation.set_audience(&[&self.audience]);
        validation.set_issuer(&[&self.issuer]);

        decode::<Claims>(token, &self.decoding_key, &validation)
            .map(|data| data.claims)
            .map_err(|err| match err.kind() {
                ErrorKind::InvalidSignature
                | ErrorKind::InvalidIssuer
                | ErrorKind::InvalidAudience => CredentialError::SignatureInvalid,
                _ => CredentialError::Malformed,
            })
    }
}
