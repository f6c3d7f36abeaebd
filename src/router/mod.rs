//! HTTP API under `/auth`.
pub mod admin;
pub mod login;
pub mod logout;
pub mod metrics;
pub mod profile;
pub mod refresh;

use axum::Json;
use axum::extract::{FromRequest, Request};
use axum_extra::extract::CookieJar;
use axum_extra::extract::cookie::{Cookie, SameSite};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::config::Configuration;
use crate::error::ServerError;
use crate::identity::Identity;
use crate::middleware::{ACCESS_COOKIE, LEGACY_COOKIE, REFRESH_COOKIE};
use crate::session::Session;

pub const TOKEN_TYPE: &str = "Bearer";

/// JSON body validated with [`validator`].
#[derive(Debug, Clone, Copy, Default)]
pub struct Valid<T>(pub T);

impl<T, S> FromRequest<S> for Valid<T>
where
    T: DeserializeOwned + Validate,
    S: Send + Sync,
{
    type Rejection = ServerError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(req, state).await?;
        value.validate()?;
        Ok(Valid(value))
    }
}

/// Body returned by every route opening a session.
#[derive(Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    pub token_type: String,
    pub access_token: String,
    pub refresh_token: String,
    /// Ready to use `Authorization` header value.
    pub bearer: String,
    pub expires_in: u64,
    pub user: Identity,
}

impl Response {
    pub fn new(session: Session, user: Identity) -> Self {
        Self {
            token_type: TOKEN_TYPE.to_owned(),
            bearer: format!("{TOKEN_TYPE} {}", session.access_token),
            access_token: session.access_token,
            refresh_token: session.refresh_token,
            expires_in: session.expires_in,
            user,
        }
    }
}

fn cookie(
    config: &Configuration,
    name: &'static str,
    value: String,
    max_age: time::Duration,
) -> Cookie<'static> {
    let builder = Cookie::build((name, value))
        .http_only(true)
        .secure(config.cookie.secure)
        .same_site(SameSite::Lax)
        .path("/")
        .max_age(max_age);

    match &config.cookie.domain {
        Some(domain) => builder.domain(domain.clone()).build(),
        None => builder.build(),
    }
}

/// Attach both session cookies to `jar`.
pub fn set_session_cookies(jar: CookieJar, config: &Configuration, session: &Session) -> CookieJar {
    let access_ttl = i64::try_from(session.expires_in).unwrap_or(i64::MAX);

    jar.add(cookie(
        config,
        ACCESS_COOKIE,
        session.access_token.clone(),
        time::Duration::seconds(access_ttl),
    ))
    .add(cookie(
        config,
        REFRESH_COOKIE,
        session.refresh_token.clone(),
        time::Duration::days(config.token.refresh_ttl_days),
    ))
}

/// Expire every session cookie on the client, legacy one included.
pub fn clear_session_cookies(jar: CookieJar, config: &Configuration) -> CookieJar {
    [ACCESS_COOKIE, REFRESH_COOKIE, LEGACY_COOKIE]
        .into_iter()
        .fold(jar, |jar, name| {
            let mut removal = cookie(config, name, String::new(), time::Duration::ZERO);
            removal.make_removal();
            jar.add(removal)
        })
}

/// Refresh token from the cookie, else from a `{"refreshToken": ..}` body.
pub(crate) fn presented_refresh_token(jar: &CookieJar, body: &[u8]) -> Option<String> {
    #[derive(Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct Body {
        refresh_token: Option<String>,
    }

    jar.get(REFRESH_COOKIE)
        .map(|cookie| cookie.value().to_owned())
        .or_else(|| {
            serde_json::from_slice::<Body>(body)
                .ok()
                .and_then(|body| body.refresh_token)
        })
        .filter(|token| !token.is_empty())
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Arc;

    use axum::http::HeaderMap;
    use axum::response::IntoResponse;
    use chrono::Utc;

    use super::*;
    use crate::AppState;
    use crate::clock::{Clock, ManualClock};
    use crate::config::Argon2;
    use crate::crypto::Crypto;
    use crate::identity::{IdentityRecord, MemoryIdentities, Role};
    use crate::session::MemoryTokenStore;

    pub const PASSWORD: &str = "correct horse battery staple";

    /// Handles on the in-memory backends behind a test [`AppState`].
    pub struct Harness {
        pub state: AppState,
        pub clock: Arc<ManualClock>,
        pub identities: Arc<MemoryIdentities>,
        pub store: Arc<MemoryTokenStore>,
    }

    /// Build a state with `alice` (user) and `root` (admin).
    pub fn state() -> Harness {
        state_with(Argon2 {
            memory_cost: 1024,
            iterations: 1,
            parallelism: 1,
            hash_length: 32,
        })
    }

    pub fn state_with(argon2: Argon2) -> Harness {
        let mut config = Configuration::default();
        config.argon2 = Some(argon2.clone());
        config.token.secret = "router-tests-secret".into();
        config.token.pepper = "router-tests-pepper".into();

        let crypto = Crypto::new(Some(argon2), &config.token.pepper).unwrap();
        let password_hash = crypto.pwd.hash_password(PASSWORD).unwrap();

        let identities = Arc::new(MemoryIdentities::new());
        for (id, role) in [("alice", Role::User), ("root", Role::Admin)] {
            identities.insert(IdentityRecord {
                identity: Identity {
                    id: id.into(),
                    email: format!("{id}@example.com"),
                    name: id.into(),
                    role,
                },
                password_hash: password_hash.clone(),
            });
        }

        let clock = Arc::new(ManualClock::new(Utc::now()));
        let store = Arc::new(MemoryTokenStore::new());
        let dyn_clock: Arc<dyn Clock> = clock.clone();
        let state = AppState::new(
            Arc::new(config),
            identities.clone(),
            store.clone(),
            dyn_clock,
            None,
        )
        .unwrap();

        Harness {
            state,
            clock,
            identities,
            store,
        }
    }

    #[test]
    fn test_session_cookies() {
        let harness = state();
        let session = Session {
            access_token: "access".into(),
            refresh_token: "refresh".into(),
            expires_in: 900,
        };

        let jar = set_session_cookies(CookieJar::new(), &harness.state.config, &session);
        let access = jar.get(ACCESS_COOKIE).unwrap();
        assert_eq!(access.value(), "access");
        assert_eq!(access.http_only(), Some(true));
        assert_eq!(access.same_site(), Some(SameSite::Lax));
        assert_eq!(access.path(), Some("/"));
        assert_eq!(access.max_age(), Some(time::Duration::minutes(15)));

        let refresh = jar.get(REFRESH_COOKIE).unwrap();
        assert_eq!(refresh.max_age(), Some(time::Duration::days(7)));

        let response = clear_session_cookies(jar, &harness.state.config).into_response();
        let cleared = response
            .headers()
            .get_all(axum::http::header::SET_COOKIE)
            .iter()
            .filter(|value| value.to_str().unwrap().contains("Max-Age=0"))
            .count();
        assert_eq!(cleared, 3);
    }

    #[test]
    fn test_cookie_domain() {
        let mut config = Configuration::default();
        config.cookie.domain = Some("example.com".into());
        config.cookie.secure = true;

        let access = cookie(&config, ACCESS_COOKIE, "v".into(), time::Duration::minutes(15));
        assert_eq!(access.domain(), Some("example.com"));
        assert_eq!(access.secure(), Some(true));

        let jar = clear_session_cookies(CookieJar::new(), &config);
        assert_eq!(jar.get(LEGACY_COOKIE).unwrap().domain(), Some("example.com"));
    }

    #[test]
    fn test_refresh_token_sources() {
        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::COOKIE,
            "refreshToken=from-cookie".parse().unwrap(),
        );
        let jar = CookieJar::from_headers(&headers);
        let body = br#"{"refreshToken":"from-body"}"#;

        assert_eq!(presented_refresh_token(&jar, body).as_deref(), Some("from-cookie"));
        assert_eq!(
            presented_refresh_token(&CookieJar::new(), body).as_deref(),
            Some("from-body")
        );
        assert_eq!(presented_refresh_token(&CookieJar::new(), b""), None);
        assert_eq!(
            presented_refresh_token(&CookieJar::new(), br#"{"refreshToken":""}"#),
            None
        );
    }
}
