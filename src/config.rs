//! Configuration manager for warden.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

const DEFAULT_CONFIG_PATH: &str = "config.yaml";
const DEFAULT_LISTEN: &str = "0.0.0.0:8888";
const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Configuration {
    /// Instance name.
    pub name: String,
    /// Public URL of this instance, used as credential issuer.
    pub url: String,
    /// Socket address to bind.
    pub listen: String,
    /// Rotate an expired access credential transparently when the request
    /// also carries a refresh cookie.
    pub silent_refresh: bool,
    #[serde(skip_deserializing)]
    version: String,
    #[serde(skip)]
    path: PathBuf,
    /// Related to access and refresh tokens.
    #[serde(skip_serializing)]
    pub token: Token,
    /// Related to session cookies.
    pub cookie: Cookie,
    /// Related to the expired refresh token sweeper.
    pub sweeper: Sweeper,
    /// Related to PostgreSQL configuration.
    #[serde(skip_serializing)]
    pub postgres: Option<Postgres>,
    /// Related to Argon2 configuration.
    #[serde(skip_serializing)]
    pub argon2: Option<Argon2>,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            name: "warden".into(),
            url: "http://localhost:8888/".into(),
            listen: DEFAULT_LISTEN.into(),
            silent_refresh: true,
            version: VERSION.to_owned(),
            path: PathBuf::default(),
            token: Token::default(),
            cookie: Cookie::default(),
            sweeper: Sweeper::default(),
            postgres: None,
            argon2: None,
        }
    }
}

/// Token configuration.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Token {
    /// HMAC secret signing access credentials.
    /// Overridden by the `TOKEN_SECRET` environment variable.
    pub secret: String,
    /// Pepper mixed into stored refresh token digests.
    /// Overridden by the `TOKEN_PEPPER` environment variable.
    pub pepper: String,
    /// Update token audience.
    pub audience: Option<String>,
    /// Access credential lifetime, in seconds.
    pub access_ttl: u64,
    /// Refresh token lifetime, in days.
    pub refresh_ttl_days: i64,
}

impl Default for Token {
    fn default() -> Self {
        Self {
            secret: String::default(),
            pepper: String::default(),
            audience: None,
            access_ttl: crate::token::EXPIRATION_TIME,
            refresh_ttl_days: 7,
        }
    }
}

/// Cookie configuration.
#[derive(Debug, Default, PartialEq, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Cookie {
    /// Only send cookies over HTTPS. Must be set in production.
    pub secure: bool,
    /// Domain attribute.
    pub domain: Option<String>,
}

/// Sweeper configuration.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Sweeper {
    /// Seconds between two sweeps.
    pub interval: u64,
    /// Refresh tokens older than this are deleted.
    pub retention_days: i64,
}

impl Default for Sweeper {
    fn default() -> Self {
        Self {
            interval: 60 * 60 * 24, // 24 hours.
            retention_days: 7,
        }
    }
}

impl Sweeper {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval.max(1))
    }
}

/// PostgreSQL configuration.
#[derive(Debug, Default, PartialEq, Clone, Serialize, Deserialize)]
pub struct Postgres {
    /// Hostname:(?port) for PostgreSQL instance.
    pub address: String,
    /// Database name.
    pub database: Option<String>,
    /// Username credential to connect.
    pub username: Option<String>,
    /// Password credential to connect.
    pub password: Option<String>,
    /// Maximum pool connections.
    pub pool_size: Option<u32>,
}

/// Argon2 configuration.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct Argon2 {
    /// Memory used while hashing.
    pub memory_cost: u32,
    /// Iterations of hash.
    pub iterations: u32,
    /// Parallelism degree.
    pub parallelism: u32,
    /// Output hash length.
    pub hash_length: usize,
}

impl Default for Argon2 {
    fn default() -> Self {
        Self {
            memory_cost: 1024 * 64, // 64 MiB.
            iterations: 4,
            parallelism: 2,
            hash_length: 32,
        }
    }
}

/// Normalizes a URL string by ensuring it starts with a valid scheme
/// (`http` or `https`).
fn normalize_url(url: &str) -> Result<String, url::ParseError> {
    let url_with_scheme = if url.starts_with("http://") || url.starts_with("https://") {
        url.to_string()
    } else {
        format!("https://{url}")
    };

    let parsed_url = Url::parse(&url_with_scheme)?;
    Ok(parsed_url.to_string())
}

impl Configuration {
    pub fn path(mut self, path: PathBuf) -> Self {
        self.path = path;
        self
    }

    /// Reads the `config.yaml` file from the specified path or the default
    /// location.
    pub fn read(self) -> Result<Arc<Self>, url::ParseError> {
        let file_path = if self.path.is_file() {
            &self.path
        } else {
            &Path::new(DEFAULT_CONFIG_PATH).to_path_buf()
        };

        let mut config = match File::open(file_path) {
            Ok(file) => match serde_yaml::from_reader::<_, Configuration>(file) {
                Ok(config) => config,
                Err(err) => self.error(err),
            },
            Err(err) => self.error(err),
        };

        // set app version.
        config.version = VERSION.to_owned();
        config.url = normalize_url(&config.url)?;

        if let Ok(secret) = std::env::var("TOKEN_SECRET") {
            config.token.secret = secret;
        }
        if let Ok(pepper) = std::env::var("TOKEN_PEPPER") {
            config.token.pepper = pepper;
        }

        Ok(Arc::new(config))
    }

    /// Return a default configuration as fallback.
    fn error(&self, err: impl std::error::Error) -> Self {
        tracing::error!(error = %err, "`config.yaml` file not found or invalid");
        Self::default()
    }
}
