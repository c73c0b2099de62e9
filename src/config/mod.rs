//! Tracker construction options.
//!
//! A config names one backend (embedded SQLite file, Postgres, or MySQL) plus
//! its connection parameters. A bare path is shorthand for SQLite. Configs
//! load from code, a TOML file, or environment variables; the password is
//! wrapped in `secrecy::SecretString` so it never shows up in logs.

pub mod secrets;

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use secrets::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default delay between the first buffered step and its flush.
pub const DEFAULT_BATCH_DELAY_MS: u64 = 100;

const MEMORY_PATH: &str = ":memory:";

/// Which relational engine backs the tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    Sqlite,
    Postgres,
    Mysql,
}

impl Backend {
    pub fn default_port(self) -> Option<u16> {
        match self {
            Backend::Sqlite => None,
            Backend::Postgres => Some(5432),
            Backend::Mysql => Some(3306),
        }
    }
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Backend::Sqlite => "sqlite",
            Backend::Postgres => "postgres",
            Backend::Mysql => "mysql",
        };
        f.write_str(s)
    }
}

impl FromStr for Backend {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "sqlite" | "sqlite3" | "better-sqlite3" => Ok(Backend::Sqlite),
            "postgres" | "postgresql" | "pg" => Ok(Backend::Postgres),
            "mysql" | "mysql2" => Ok(Backend::Mysql),
            other => Err(Error::Config(format!("unknown database client: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TrackerConfig {
    pub backend: Backend,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub password: Option<SecretString>,
    #[serde(default)]
    pub database: Option<String>,
    /// SQLite file path, or `:memory:`.
    #[serde(default)]
    pub filename: Option<String>,
    /// Legacy mode: absent step payloads are written as SQL NULL rather than JSON `null`.
    #[serde(default)]
    pub use_null_as_default: bool,
    #[serde(default = "default_batch_delay_ms")]
    pub batch_delay_ms: u64,
    /// Upper bound on each buffer flush write. A timed-out batch is dropped.
    #[serde(default)]
    pub flush_timeout_ms: Option<u64>,
    #[serde(default)]
    pub max_connections: Option<u32>,
    /// Full connection URL. Overrides host, port, user, password, database
    /// and filename.
    #[serde(default)]
    pub url: Option<SecretString>,
}

fn default_batch_delay_ms() -> u64 {
    DEFAULT_BATCH_DELAY_MS
}

impl TrackerConfig {
    fn empty(backend: Backend) -> Self {
        Self {
            backend,
            host: None,
            port: None,
            user: None,
            password: None,
            database: None,
            filename: None,
            use_null_as_default: false,
            batch_delay_ms: DEFAULT_BATCH_DELAY_MS,
            flush_timeout_ms: None,
            max_connections: None,
            url: None,
        }
    }

    /// Use a full connection URL (`postgres://`, `mysql://` or `sqlite:`).
    /// The backend is taken from the scheme.
    pub fn from_url(raw: &str) -> Result<Self> {
        let parsed = url::Url::parse(raw)
            .map_err(|e| Error::Config(format!("invalid connection url: {e}")))?;
        let backend: Backend = parsed.scheme().parse()?;
        Ok(Self {
            url: Some(SecretString::from(raw.to_string())),
            ..Self::empty(backend)
        })
    }

    /// Embedded SQLite at `path` (created if missing). `:memory:` is accepted.
    pub fn sqlite(path: impl Into<String>) -> Self {
        Self {
            filename: Some(path.into()),
            ..Self::empty(Backend::Sqlite)
        }
    }

    /// In-memory SQLite, mostly for tests.
    pub fn in_memory() -> Self {
        Self::sqlite(MEMORY_PATH)
    }

    pub fn postgres(
        host: impl Into<String>,
        user: impl Into<String>,
        password: impl Into<String>,
        database: impl Into<String>,
    ) -> Self {
        Self::client_server(Backend::Postgres, host, user, password, database)
    }

    pub fn mysql(
        host: impl Into<String>,
        user: impl Into<String>,
        password: impl Into<String>,
        database: impl Into<String>,
    ) -> Self {
        Self::client_server(Backend::Mysql, host, user, password, database)
    }

    fn client_server(
        backend: Backend,
        host: impl Into<String>,
        user: impl Into<String>,
        password: impl Into<String>,
        database: impl Into<String>,
    ) -> Self {
        Self {
            host: Some(host.into()),
            user: Some(user.into()),
            password: Some(SecretString::from(password.into())),
            database: Some(database.into()),
            ..Self::empty(backend)
        }
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn batch_delay(mut self, delay: Duration) -> Self {
        self.batch_delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn flush_timeout(mut self, timeout: Duration) -> Self {
        self.flush_timeout_ms = Some(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX));
        self
    }

    pub fn use_null_as_default(mut self, enabled: bool) -> Self {
        self.use_null_as_default = enabled;
        self
    }

    pub fn max_connections(mut self, n: u32) -> Self {
        self.max_connections = Some(n);
        self
    }

    pub fn batch_delay_duration(&self) -> Duration {
        Duration::from_millis(self.batch_delay_ms)
    }

    pub fn flush_timeout_duration(&self) -> Option<Duration> {
        self.flush_timeout_ms.map(Duration::from_millis)
    }

    /// True for SQLite `:memory:` databases, which live in a single connection.
    pub fn is_in_memory(&self) -> bool {
        if let Some(url) = &self.url {
            return url.expose_secret().contains(":memory:");
        }
        self.backend == Backend::Sqlite
            && self
                .filename
                .as_deref()
                .is_none_or(|f| f == MEMORY_PATH || f.is_empty())
    }

    /// Parse a TOML document with the same field names as this struct.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| Error::Config(format!("bad tracker config: {e}")))
    }

    /// Load a TOML config file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read tracker config {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&text)
    }

    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        let backend: Backend = std::env::var("TRACKER_DB_CLIENT")
            .unwrap_or_else(|_| "sqlite".to_string())
            .parse()?;

        let mut config = match backend {
            Backend::Sqlite => Self::sqlite(required_var("TRACKER_DB_FILE")?),
            Backend::Postgres | Backend::Mysql => Self::client_server(
                backend,
                required_var("TRACKER_DB_HOST")?,
                required_var("TRACKER_DB_USER")?,
                std::env::var("TRACKER_DB_PASSWORD").unwrap_or_default(),
                required_var("TRACKER_DB_NAME")?,
            ),
        };

        if let Ok(port) = std::env::var("TRACKER_DB_PORT") {
            config.port = Some(
                port.parse()
                    .map_err(|_| Error::Config(format!("invalid TRACKER_DB_PORT: {port}")))?,
            );
        }
        if let Ok(delay) = std::env::var("TRACKER_BATCH_DELAY_MS") {
            config.batch_delay_ms = delay
                .parse()
                .map_err(|_| Error::Config(format!("invalid TRACKER_BATCH_DELAY_MS: {delay}")))?;
        }
        if let Ok(flag) = std::env::var("TRACKER_NULL_AS_DEFAULT") {
            config.use_null_as_default = matches!(flag.as_str(), "1" | "true" | "yes");
        }
        Ok(config)
    }

    /// Build the sqlx connection URL for this backend.
    pub fn connection_url(&self) -> Result<String> {
        if let Some(url) = &self.url {
            return Ok(url.expose_secret().to_string());
        }
        match self.backend {
            Backend::Sqlite => {
                if self.is_in_memory() {
                    return Ok("sqlite::memory:".to_string());
                }
                let file = self.filename.as_deref().unwrap_or_default();
                Ok(format!("sqlite://{file}?mode=rwc"))
            }
            Backend::Postgres | Backend::Mysql => {
                let host = self
                    .host
                    .as_deref()
                    .ok_or_else(|| Error::Config(format!("{} requires a host", self.backend)))?;
                let mut url = url::Url::parse(&format!("{}://{host}", self.backend))
                    .map_err(|e| Error::Config(format!("invalid host {host:?}: {e}")))?;

                let port = self.port.or(self.backend.default_port());
                url.set_port(port)
                    .map_err(|_| Error::Config("cannot set port on url".into()))?;
                if let Some(user) = &self.user {
                    url.set_username(user)
                        .map_err(|_| Error::Config("cannot set user on url".into()))?;
                }
                if let Some(password) = &self.password {
                    url.set_password(Some(password.expose_secret()))
                        .map_err(|_| Error::Config("cannot set password on url".into()))?;
                }
                if let Some(database) = &self.database {
                    url.set_path(database);
                }
                Ok(url.to_string())
            }
        }
    }
}

/// A bare path is the backward-compatible SQLite shorthand.
impl From<&str> for TrackerConfig {
    fn from(path: &str) -> Self {
        Self::sqlite(path)
    }
}

impl From<String> for TrackerConfig {
    fn from(path: String) -> Self {
        Self::sqlite(path)
    }
}

fn required_var(name: &str) -> Result<String> {
    std::env::var(name)
        .map_err(|_| Error::Config(format!("required environment variable {name} is not set")))
}
