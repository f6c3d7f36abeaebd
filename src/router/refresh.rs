//! Exchange a refresh token for a new session.

use axum::Json;
use axum::body::Bytes;
use axum::extract::State;
use axum_extra::extract::CookieJar;

use crate::AppState;
use crate::error::{Result, ServerError};
use crate::router::{Response, presented_refresh_token, set_session_cookies};

pub async fn handler(
    State(state): State<AppState>,
    jar: CookieJar,
    body: Bytes,
) -> Result<(CookieJar, Json<Response>)> {
    let presented =
        presented_refresh_token(&jar, &body).ok_or(ServerError::NoCredentialPresented)?;

    let (identity, session) = state.rotator.rotate(&presented).await?;

    let jar = set_session_cookies(jar, &state.config, &session);
    Ok((jar, Json(Response::new(session, identity))))
}
