//! Middlewares for routes: access credential gate and role gate.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{HeaderMap, header};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Extension;
use axum_extra::extract::CookieJar;

use crate::AppState;
use crate::error::{Result, ServerError};
use crate::identity::{Identity, IdentityRepository, Role};
use crate::token::TokenManager;

pub const ACCESS_COOKIE: &str = "accessToken";
pub const REFRESH_COOKIE: &str = "refreshToken";
/// Cookie name used by older clients.
pub const LEGACY_COOKIE: &str = "token";
const BODY_FIELD: &str = "accessToken";
const QUERY_PARAMETER: &str = "access_token";
const BEARER: &str = "Bearer";
const BODY_LIMIT: usize = 30_000;

/// Where an access credential was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialSource {
    Header,
    Cookie,
    LegacyCookie,
    Body,
    Query,
}

/// Parts of a request that may carry an access credential.
pub struct Presented<'a> {
    headers: &'a HeaderMap,
    query: Option<&'a str>,
    body: &'a [u8],
}

impl<'a> Presented<'a> {
    pub fn new(headers: &'a HeaderMap, query: Option<&'a str>, body: &'a [u8]) -> Self {
        Self {
            headers,
            query,
            body,
        }
    }
}

type Extractor = fn(&Presented<'_>) -> Option<String>;

fn from_header(presented: &Presented<'_>) -> Option<String> {
    presented
        .headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split_once(' '))
        .filter(|(scheme, _)| scheme.eq_ignore_ascii_case(BEARER))
        .map(|(_, token)| token.trim().to_owned())
}

fn cookie(presented: &Presented<'_>, name: &str) -> Option<String> {
    CookieJar::from_headers(presented.headers)
        .get(name)
        .map(|cookie| cookie.value().to_owned())
}

fn from_cookie(presented: &Presented<'_>) -> Option<String> {
    cookie(presented, ACCESS_COOKIE)
}

fn from_legacy_cookie(presented: &Presented<'_>) -> Option<String> {
    cookie(presented, LEGACY_COOKIE)
}

fn from_body(presented: &Presented<'_>) -> Option<String> {
    if presented.body.is_empty() {
        return None;
    }

    serde_json::from_slice::<serde_json::Value>(presented.body)
        .ok()?
        .get(BODY_FIELD)?
        .as_str()
        .map(ToOwned::to_owned)
}

fn from_query(presented: &Presented<'_>) -> Option<String> {
    url::form_urlencoded::parse(presented.query?.as_bytes())
        .find(|(key, _)| key == QUERY_PARAMETER)
        .map(|(_, value)| value.into_owned())
}

/// Credential sources, most tamper-resistant first.
pub const EXTRACTORS: [(CredentialSource, Extractor); 5] = [
    (CredentialSource::Header, from_header),
    (CredentialSource::Cookie, from_cookie),
    (CredentialSource::LegacyCookie, from_legacy_cookie),
    (CredentialSource::Body, from_body),
    (CredentialSource::Query, from_query),
];

/// Find the first access credential presented. Empty values are skipped.
pub fn extract(presented: &Presented<'_>) -> Option<(CredentialSource, String)> {
    EXTRACTORS.iter().find_map(|(source, extractor)| {
        extractor(presented)
            .filter(|token| !token.is_empty())
            .map(|token| (*source, token))
    })
}

/// Request-time authentication.
#[derive(Clone)]
pub struct AuthGate {
    token: TokenManager,
    identities: Arc<dyn IdentityRepository>,
}

impl AuthGate {
    /// Create a new [`AuthGate`].
    pub fn new(token: TokenManager, identities: Arc<dyn IdentityRepository>) -> Self {
        Self { token, identities }
    }

    /// Resolve the identity behind the presented access credential.
    ///
    /// An expired credential gives [`ServerError::CredentialExpired`], for
    /// which [`ServerError::should_refresh`] is true.
    pub async fn authenticate(&self, presented: &Presented<'_>) -> Result<Identity> {
        let (source, token) = extract(presented).ok_or(ServerError::NoCredentialPresented)?;

        let subject = self.token.verify(&token).map_err(|err| {
            tracing::debug!(?source, error = %err, "access credential rejected");
            ServerError::from(err)
        })?;

        self.identities
            .find_by_id(&subject.identity_id)
            .await?
            .ok_or(ServerError::IdentityNotFound)
    }

    /// Identity named by the presented credential, ignoring expiry.
    ///
    /// Signature, issuer and audience are still checked.
    pub fn expired_subject(&self, presented: &Presented<'_>) -> Option<String> {
        let (_, token) = extract(presented)?;
        self.token.decode(&token).ok().map(|claims| claims.sub)
    }
}

/// Custom middleware for authentication.
///
/// Inserts the resolved [`Identity`] into request extensions.
pub async fn auth(State(state): State<AppState>, req: Request, next: Next) -> Result<Response> {
    let (parts, body) = req.into_parts();
    let body_bytes = axum::body::to_bytes(body, BODY_LIMIT)
        .await
        .map_err(|err| ServerError::ParsingForm(Box::new(err)))?;

    let (outcome, subject) = {
        let presented = Presented::new(&parts.headers, parts.uri.query(), &body_bytes);
        let outcome = state.gate.authenticate(&presented).await;
        let subject = match &outcome {
            Err(err) if err.should_refresh() => state.gate.expired_subject(&presented),
            _ => None,
        };
        (outcome, subject)
    };

    let mut req = Request::from_parts(parts, Body::from(body_bytes));

    match (outcome, subject) {
        (Ok(identity), _) => {
            req.extensions_mut().insert(identity);
            Ok(next.run(req).await)
        },
        (Err(err), Some(subject)) if state.config.silent_refresh => {
            silent_refresh(state, req, next, err, &subject).await
        },
        (Err(err), _) => Err(err),
    }
}

/// Rotate the refresh cookie once, then serve the request with the new
/// identity. The cookie must belong to `subject`, the owner of the expired
/// credential.
async fn silent_refresh(
    state: AppState,
    mut req: Request,
    next: Next,
    expired: ServerError,
    subject: &str,
) -> Result<Response> {
    let jar = CookieJar::from_headers(req.headers());
    let Some(refresh_token) = jar.get(REFRESH_COOKIE).map(|c| c.value().to_owned()) else {
        return Err(expired);
    };

    let (identity, session) = state.rotator.rotate_for(&refresh_token, subject).await?;
    tracing::debug!(identity_id = %identity.id, "access credential refreshed silently");

    req.extensions_mut().insert(identity);
    let response = next.run(req).await;

    let jar = crate::router::set_session_cookies(jar, &state.config, &session);
    Ok((jar, response).into_response())
}

/// Check that `identity` holds at least `role`.
pub fn require_role(identity: &Identity, role: Role) -> Result<()> {
    if identity.role >= role {
        Ok(())
    } else {
        Err(ServerError::InsufficientRole)
    }
}

/// Middleware restricting a route to administrators.
///
/// Must be layered inside [`auth`].
pub async fn admin_only(
    Extension(identity): Extension<Identity>,
    req: Request,
    next: Next,
) -> Result<Response> {
    require_role(&identity, Role::Admin).inspect_err(|_| {
        tracing::info!(identity_id = %identity.id, "admin route refused");
    })?;
    Ok(next.run(req).await)
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    fn headers(pairs: &[(header::HeaderName, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.append(name.clone(), HeaderValue::from_str(value).unwrap());
        }
        map
    }

    #[test]
    fn test_each_source_alone() {
        let empty = HeaderMap::new();

        let map = headers(&[(header::AUTHORIZATION, "Bearer h")]);
        assert_eq!(from_header(&Presented::new(&map, None, b"")), Some("h".into()));

        let map = headers(&[(header::COOKIE, "accessToken=c; other=x")]);
        assert_eq!(from_cookie(&Presented::new(&map, None, b"")), Some("c".into()));

        let map = headers(&[(header::COOKIE, "token=l")]);
        assert_eq!(from_legacy_cookie(&Presented::new(&map, None, b"")), Some("l".into()));

        let body = br#"{"accessToken":"b"}"#;
        assert_eq!(from_body(&Presented::new(&empty, None, body)), Some("b".into()));
        assert_eq!(from_body(&Presented::new(&empty, None, b"not json")), None);

        let presented = Presented::new(&empty, Some("page=2&access_token=q"), b"");
        assert_eq!(from_query(&presented), Some("q".into()));

        assert!(extract(&Presented::new(&empty, None, b"")).is_none());
    }

    #[test]
    fn test_precedence() {
        let map = headers(&[
            (header::AUTHORIZATION, "Bearer h"),
            (header::COOKIE, "accessToken=c; token=l"),
        ]);
        let body = br#"{"accessToken":"b"}"#;

        let all = Presented::new(&map, Some("access_token=q"), body);
        assert_eq!(extract(&all), Some((CredentialSource::Header, "h".into())));

        let map = headers(&[(header::COOKIE, "token=l; accessToken=c")]);
        let no_header = Presented::new(&map, Some("access_token=q"), body);
        assert_eq!(extract(&no_header), Some((CredentialSource::Cookie, "c".into())));

        let map = headers(&[(header::COOKIE, "token=l")]);
        let legacy = Presented::new(&map, Some("access_token=q"), body);
        assert_eq!(extract(&legacy), Some((CredentialSource::LegacyCookie, "l".into())));

        let empty = HeaderMap::new();
        let body_only = Presented::new(&empty, Some("access_token=q"), body);
        assert_eq!(extract(&body_only), Some((CredentialSource::Body, "b".into())));

        let query_only = Presented::new(&empty, Some("access_token=q"), b"");
        assert_eq!(extract(&query_only), Some((CredentialSource::Query, "q".into())));
    }

    #[test]
    fn test_bearer_scheme_is_case_insensitive() {
        for value in ["bearer h", "BEARER h", "Bearer  h"] {
            let map = headers(&[
                (header::AUTHORIZATION, value),
                (header::COOKIE, "accessToken=c"),
            ]);
            let presented = Presented::new(&map, None, b"");
            assert_eq!(extract(&presented), Some((CredentialSource::Header, "h".into())));
        }

        let map = headers(&[(header::AUTHORIZATION, "Basic h")]);
        assert_eq!(from_header(&Presented::new(&map, None, b"")), None);
    }

    #[test]
    fn test_empty_bearer_falls_through() {
        let map = headers(&[
            (header::AUTHORIZATION, "Bearer "),
            (header::COOKIE, "accessToken=c"),
        ]);
        let presented = Presented::new(&map, None, b"");
        assert_eq!(extract(&presented), Some((CredentialSource::Cookie, "c".into())));
    }

    #[test]
    fn test_require_role() {
        let mut identity = Identity {
            id: "alice".into(),
            email: "alice@example.com".into(),
            name: "Alice".into(),
            role: Role::User,
        };

        assert!(require_role(&identity, Role::User).is_ok());
        assert!(matches!(
            require_role(&identity, Role::Admin),
            Err(ServerError::InsufficientRole)
        ));

        identity.role = Role::Admin;
        assert!(require_role(&identity, Role::Admin).is_ok());
        assert!(require_role(&identity, Role::User).is_ok());
    }
}
