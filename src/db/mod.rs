//! Database connection pool, schema, and health check.
//!
//! One `sqlx` `AnyPool` per tracker reaches SQLite, Postgres, or MySQL. SQL
//! that differs between them goes through the [`Dialect`] picked at connect
//! time.

pub mod dialect;
pub mod query;
pub mod step;
pub mod workflow;

use std::sync::Arc;

use sqlx::AnyPool;
use sqlx::any::AnyPoolOptions;
use tracing::{debug, info};

use crate::config::{Backend, TrackerConfig};
use crate::error::Result;

pub use dialect::{Dialect, MySqlDialect, PostgresDialect, SqliteDialect, dialect_for};

/// Database handle. Owns the connection pool and the backend dialect.
///
/// Clones share the pool.
#[derive(Clone)]
pub struct Db {
    pool: AnyPool,
    dialect: Arc<dyn Dialect>,
    null_as_default: bool,
}

impl Db {
    /// Connect and create the schema if it does not exist yet.
    pub async fn connect(config: &TrackerConfig) -> Result<Self> {
        sqlx::any::install_default_drivers();

        let url = config.connection_url()?;
        let mut options = AnyPoolOptions::new();
        if config.is_in_memory() {
            // An in-memory SQLite database lives and dies with its connection.
            options = options
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None);
        } else {
            options = options.max_connections(config.max_connections.unwrap_or(10));
        }
        let pool = options.connect(&url).await?;

        let db = Self {
            pool,
            dialect: dialect_for(config.backend),
            null_as_default: config.use_null_as_default,
        };
        db.create_schema().await?;
        info!(backend = %config.backend, "tracker database ready");
        Ok(db)
    }

    /// Create both tables and their indexes if absent. Never alters existing tables.
    pub async fn create_schema(&self) -> Result<()> {
        for statement in self.dialect.schema() {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        debug!(backend = %self.backend(), "schema ensured");
        Ok(())
    }

    /// Simple health check: run a SELECT 1.
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    /// Close every pooled connection. Later queries fail with `PoolClosed`.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    pub fn is_closed(&self) -> bool {
        self.pool.is_closed()
    }

    pub fn backend(&self) -> Backend {
        self.dialect.backend()
    }

    pub fn dialect(&self) -> &dyn Dialect {
        self.dialect.as_ref()
    }

    pub(crate) fn pool(&self) -> &AnyPool {
        &self.pool
    }

    pub(crate) fn null_as_default(&self) -> bool {
        self.null_as_default
    }
}

impl std::fmt::Debug for Db {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Db")
            .field("backend", &self.backend())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}
