//! Open a session with email and password.

use axum::Json;
use axum::extract::State;
use axum_extra::extract::CookieJar;
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::AppState;
use crate::error::{Result, ServerError};
use crate::router::{Response, Valid, set_session_cookies};

#[derive(Debug, Serialize, Deserialize, Validate)]
pub struct Body {
    #[validate(email(message = "Email must be formatted."))]
    pub email: String,
    #[validate(length(min = 1, max = 255, message = "Password must be provided."))]
    pub password: String,
}

/// Handler to log in.
///
/// Every failure answers [`ServerError::InvalidCredentials`] so callers cannot
/// tell an unknown email from a wrong password.
pub async fn handler(
    State(state): State<AppState>,
    jar: CookieJar,
    Valid(body): Valid<Body>,
) -> Result<(CookieJar, Json<Response>)> {
    let record = state.identities.find_by_email(&body.email).await?;

    // Unknown emails pay for one verification too.
    let hash = record
        .as_ref()
        .map_or(state.crypto.pwd.decoy(), |record| record.password_hash.as_str());
    let verified = state.crypto.pwd.verify_password(&body.password, hash);

    let record = match record {
        Some(record) if verified => record,
        Some(record) => {
            tracing::debug!(identity_id = %record.identity.id, "login attempt with wrong password");
            return Err(ServerError::InvalidCredentials);
        },
        None => {
            tracing::debug!("login attempt on unknown email");
            return Err(ServerError::InvalidCredentials);
        },
    };

    let identity = record.identity;
    let session = state.issuer.issue_session(&identity.id, identity.role).await?;
    tracing::info!(identity_id = %identity.id, "identity logged in");

    let jar = set_session_cookies(jar, &state.config, &session);
    Ok((jar, Json(Response::new(session, identity))))
}
