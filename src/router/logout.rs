//! Close one or every session.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum_extra::extract::CookieJar;

use crate::AppState;
use crate::error::Result;
use crate::router::{clear_session_cookies, presented_refresh_token};

/// Handler closing the session of the presented refresh token.
pub async fn handler(
    State(state): State<AppState>,
    jar: CookieJar,
    body: Bytes,
) -> Result<(CookieJar, StatusCode)> {
    if let Some(presented) = presented_refresh_token(&jar, &body) {
        state.rotator.revoke(&presented).await?;
    }

    Ok((clear_session_cookies(jar, &state.config), StatusCode::NO_CONTENT))
}

/// Handler closing every session of the presented refresh token's owner.
pub async fn all(
    State(state): State<AppState>,
    jar: CookieJar,
    body: Bytes,
) -> Result<(CookieJar, StatusCode)> {
    if let Some(presented) = presented_refresh_token(&jar, &body) {
        state.rotator.revoke_all(&presented).await?;
    }

    Ok((clear_session_cookies(jar, &state.config), StatusCode::NO_CONTENT))
}
