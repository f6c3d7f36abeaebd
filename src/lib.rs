//! Warden issues, rotates and revokes login sessions.

#![forbid(unsafe_code)]
pub mod clock;
pub mod config;
pub mod crypto;
mod database;
pub mod error;
pub mod identity;
pub mod middleware;
mod router;
pub mod session;
pub mod telemetry;
pub mod token;

use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::http::{Method, StatusCode, header};
use axum::routing::{get, post};
use axum::{Router, middleware as AxumMiddleware};
use chrono::TimeDelta;
use metrics_exporter_prometheus::PrometheusHandle;
use tower::ServiceBuilder;
use tower_http::LatencyUnit;
use tower_http::cors::{Any, CorsLayer};
use tower_http::sensitive_headers::SetSensitiveHeadersLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer};

use clock::{Clock, SystemClock};
use crypto::{Crypto, CryptoError};
use identity::IdentityRepository;
use middleware::AuthGate;
use session::{ExpirySweeper, RefreshTokenStore, SessionIssuer, SessionRotator};

pub use error::ServerError;

const CONFIG_PATH_VARIABLE: &str = "WARDEN_CONFIG";

/// MUST NEVER be used in production.
#[cfg(test)]
pub async fn make_request(
    app: Router,
    method: Method,
    path: &str,
    headers: &[(header::HeaderName, &str)],
    body: String,
) -> axum::http::Response<axum::body::Body> {
    use axum::extract::Request;
    use tower::util::ServiceExt;

    let mut request = Request::builder()
        .method(method)
        .uri(path)
        .header(header::CONTENT_TYPE, "application/json");
    for (name, value) in headers {
        request = request.header(name, *value);
    }

    app.oneshot(request.body(axum::body::Body::from(body)).unwrap())
        .await
        .unwrap()
}

/// State sharing between routes.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<config::Configuration>,
    pub identities: Arc<dyn IdentityRepository>,
    pub crypto: Arc<Crypto>,
    pub gate: AuthGate,
    pub issuer: SessionIssuer,
    pub rotator: SessionRotator,
    pub metrics: Option<PrometheusHandle>,
}

impl AppState {
    /// Wire session services over the given backends.
    pub fn new(
        config: Arc<config::Configuration>,
        identities: Arc<dyn IdentityRepository>,
        store: Arc<dyn RefreshTokenStore>,
        clock: Arc<dyn Clock>,
        metrics: Option<PrometheusHandle>,
    ) -> Result<Self, CryptoError> {
        let crypto = Arc::new(Crypto::new(config.argon2.clone(), &config.token.pepper)?);

        let mut token =
            token::TokenManager::new(&config.url, &config.token.secret, Arc::clone(&clock))
                .lifetime(config.token.access_ttl);
        if let Some(audience) = &config.token.audience {
            token = token.audience(audience);
        }

        let gate = AuthGate::new(token.clone(), Arc::clone(&identities));
        let issuer = SessionIssuer::new(store, token, Arc::clone(&crypto), clock);
        let rotator = SessionRotator::new(
            issuer.clone(),
            Arc::clone(&identities),
            TimeDelta::days(config.token.refresh_ttl_days),
        );

        Ok(Self {
            config,
            identities,
            crypto,
            gate,
            issuer,
            rotator,
            metrics,
        })
    }

    /// Sweeper for the refresh token store of this state.
    pub fn sweeper(&self) -> ExpirySweeper {
        self.issuer.sweeper(
            TimeDelta::days(self.config.sweeper.retention_days),
            self.config.sweeper.interval(),
        )
    }
}

/// Create router.
pub fn app(state: AppState) -> Router {
    let middleware = ServiceBuilder::new()
        // Add high level tracing/logging to all requests.
        .layer(
            TraceLayer::new_for_http()
                .on_body_chunk(|chunk: &Bytes, latency: Duration, _span: &tracing::Span| {
                    tracing::trace!(size_bytes = chunk.len(), latency = ?latency, "sending body chunk")
                })
                .make_span_with(DefaultMakeSpan::new().include_headers(true).level(tracing::Level::INFO))
                .on_request(DefaultOnRequest::new())
                .on_response(DefaultOnResponse::new().include_headers(true).latency_unit(LatencyUnit::Micros)),
        )
        // Set a timeout.
        .layer(TimeoutLayer::with_status_code(StatusCode::REQUEST_TIMEOUT, Duration::from_secs(10)))
        // Remove sensitive headers from trace.
        .layer(SetSensitiveHeadersLayer::new([header::AUTHORIZATION, header::COOKIE]))
        // Add CORS preflight support.
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
                .allow_headers(Any)
                .vary([header::AUTHORIZATION]),
        );

    let protected = Router::new()
        // `GET /auth/profile` goes to `profile`.
        .route("/profile", get(router::profile::handler))
        // `POST /auth/sessions/{identity_id}/revoke` goes to `admin`. Admin only.
        .route(
            "/sessions/{identity_id}/revoke",
            post(router::admin::revoke)
                .route_layer(AxumMiddleware::from_fn(middleware::admin_only)),
        )
        .route_layer(AxumMiddleware::from_fn_with_state(
            state.clone(),
            middleware::auth,
        ));

    let auth = Router::new()
        .route("/login", post(router::login::handler))
        .route("/refresh", post(router::refresh::handler))
        .route("/logout", post(router::logout::handler))
        .route("/logout-all", post(router::logout::all))
        .merge(protected);

    Router::new()
        .nest("/auth", auth)
        // `GET /metrics` goes to Prometheus exposition.
        .route("/metrics", get(router::metrics::handler))
        .with_state(state)
        .route_layer(AxumMiddleware::from_fn(telemetry::track))
        .layer(middleware)
}

/// Initialize the application state.
pub async fn initialize_state() -> Result<AppState, Box<dyn std::error::Error>> {
    // read configuration file. let it in memory.
    let mut config = config::Configuration::default();
    if let Ok(path) = std::env::var(CONFIG_PATH_VARIABLE) {
        config = config.path(path.into());
    }
    let config = config.read()?;

    if config.token.secret.is_empty() {
        return Err("missing `token.secret` entry or `TOKEN_SECRET` variable".into());
    }
    if config.token.pepper.is_empty() {
        tracing::warn!("no refresh token pepper set, digests are plain SHA-256");
    }

    let (identities, store): (Arc<dyn IdentityRepository>, Arc<dyn RefreshTokenStore>) =
        match &config.postgres {
            Some(postgres) => {
                let db = database::Database::new(postgres).await?;
                (
                    Arc::new(identity::PgIdentities::new(db.postgres.clone())),
                    Arc::new(session::PgTokenStore::new(db.postgres)),
                )
            },
            None => {
                tracing::warn!(
                    "missing `postgres` entry on `config.yaml` file, sessions are kept in memory"
                );
                (
                    Arc::new(identity::MemoryIdentities::new()),
                    Arc::new(session::MemoryTokenStore::new()),
                )
            },
        };

    let metrics = telemetry::setup_metrics_recorder()
        .inspect_err(|err| tracing::warn!(error = %err, "prometheus recorder not installed"))
        .ok();

    Ok(AppState::new(
        config,
        identities,
        store,
        Arc::new(SystemClock),
        metrics,
    )?)
}
