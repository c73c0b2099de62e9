//! Per-backend SQL differences.
//!
//! The query builder and the tracker only talk to [`Dialect`]. Supporting
//! another engine means one more implementation of this trait; no call site
//! branches on the backend.

use std::sync::Arc;

use crate::config::Backend;
use crate::model::Identifier;

use super::query::SqlBuilder;

/// SQL capabilities that differ between backends.
pub trait Dialect: Send + Sync + std::fmt::Debug {
    fn backend(&self) -> Backend;

    /// Placeholder text for the 1-based bind `index`.
    fn placeholder(&self, index: usize) -> String;

    /// `CREATE ... IF NOT EXISTS` statements, executed in order at connect time.
    fn schema(&self) -> &'static [&'static str];

    /// Append a predicate that holds when the JSON identifier list in
    /// `column` contains an entry with exactly this key and value.
    fn push_identifier_predicate(
        &self,
        sql: &mut SqlBuilder<'_>,
        column: &str,
        identifier: &Identifier,
    );

    /// Append a predicate that holds when the workflow whose id is in
    /// `workflow_column` has at least one step named `step`.
    fn push_step_membership_predicate(
        &self,
        sql: &mut SqlBuilder<'_>,
        workflow_column: &str,
        step: &str,
    ) {
        sql.push("EXISTS (SELECT 1 FROM workflow_step AS member WHERE member.workflow_id = ")
            .push(workflow_column)
            .push(" AND member.step = ")
            .push_bind(step)
            .push(")");
    }

    /// Suffix that write-locks the rows a `SELECT` returns until the
    /// transaction ends. SQLite serializes writers on its own.
    fn row_lock_suffix(&self) -> &'static str {
        ""
    }
}

/// Pick the dialect for a backend.
pub fn dialect_for(backend: Backend) -> Arc<dyn Dialect> {
    match backend {
        Backend::Sqlite => Arc::new(SqliteDialect),
        Backend::Postgres => Arc::new(PostgresDialect),
        Backend::Mysql => Arc::new(MySqlDialect),
    }
}

// ---------------------------------------------------------------------------
// SQLite
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteDialect;

impl Dialect for SqliteDialect {
    fn backend(&self) -> Backend {
        Backend::Sqlite
    }

    fn placeholder(&self, _index: usize) -> String {
        "?".to_string()
    }

    fn schema(&self) -> &'static [&'static str] {
        &[
            "CREATE TABLE IF NOT EXISTS workflow (
                id          TEXT PRIMARY KEY,
                name        TEXT NOT NULL,
                identifiers TEXT NOT NULL DEFAULT '[]',
                status      TEXT NOT NULL DEFAULT 'pending',
                started_at  TEXT NOT NULL,
                ended_at    TEXT
            )",
            "CREATE TABLE IF NOT EXISTS workflow_step (
                id          TEXT PRIMARY KEY,
                workflow_id TEXT NOT NULL,
                step        TEXT NOT NULL,
                data        TEXT,
                created_at  TEXT NOT NULL
            )",
            "CREATE INDEX IF NOT EXISTS idx_workflow_started ON workflow(started_at)",
            "CREATE INDEX IF NOT EXISTS idx_workflow_step_workflow ON workflow_step(workflow_id, created_at)",
        ]
    }

    fn push_identifier_predicate(
        &self,
        sql: &mut SqlBuilder<'_>,
        column: &str,
        identifier: &Identifier,
    ) {
        sql.push("EXISTS (SELECT 1 FROM json_each(")
            .push(column)
            .push(") AS ident WHERE json_extract(ident.value, '$.key') = ")
            .push_bind(identifier.key.as_str())
            .push(" AND json_extract(ident.value, '$.value') = ")
            .push_bind(identifier.value.as_str())
            .push(")");
    }
}

// ---------------------------------------------------------------------------
// Postgres
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default)]
pub struct PostgresDialect;

impl Dialect for PostgresDialect {
    fn backend(&self) -> Backend {
        Backend::Postgres
    }

    fn row_lock_suffix(&self) -> &'static str {
        " FOR UPDATE"
    }

    fn placeholder(&self, index: usize) -> String {
        format!("${index}")
    }

    fn schema(&self) -> &'static [&'static str] {
        &[
            "CREATE TABLE IF NOT EXISTS workflow (
                id          TEXT PRIMARY KEY,
                name        TEXT NOT NULL,
                identifiers TEXT NOT NULL DEFAULT '[]',
                status      TEXT NOT NULL DEFAULT 'pending',
                started_at  TEXT NOT NULL,
                ended_at    TEXT
            )",
            "CREATE TABLE IF NOT EXISTS workflow_step (
                id          TEXT PRIMARY KEY,
                workflow_id TEXT NOT NULL,
                step        TEXT NOT NULL,
                data        TEXT,
                created_at  TEXT NOT NULL
            )",
            "CREATE INDEX IF NOT EXISTS idx_workflow_started ON workflow(started_at)",
            "CREATE INDEX IF NOT EXISTS idx_workflow_step_workflow ON workflow_step(workflow_id, created_at)",
        ]
    }

    fn push_identifier_predicate(
        &self,
        sql: &mut SqlBuilder<'_>,
        column: &str,
        identifier: &Identifier,
    ) {
        let candidate = serde_json::json!([{
            "key": identifier.key,
            "value": identifier.value,
        }]);
        sql.push("CAST(")
            .push(column)
            .push(" AS jsonb) @> CAST(")
            .push_bind(candidate.to_string())
            .push(" AS jsonb)");
    }
}

// ---------------------------------------------------------------------------
// MySQL
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default)]
pub struct MySqlDialect;

impl Dialect for MySqlDialect {
    fn backend(&self) -> Backend {
        Backend::Mysql
    }

    fn row_lock_suffix(&self) -> &'static str {
        " FOR UPDATE"
    }

    fn placeholder(&self, _index: usize) -> String {
        "?".to_string()
    }

    // MySQL has no CREATE INDEX IF NOT EXISTS, so indexes are declared inline.
    fn schema(&self) -> &'static [&'static str] {
        &[
            "CREATE TABLE IF NOT EXISTS workflow (
                id          VARCHAR(36) PRIMARY KEY,
                name        VARCHAR(255) NOT NULL,
                identifiers TEXT NOT NULL,
                status      VARCHAR(16) NOT NULL DEFAULT 'pending',
                started_at  VARCHAR(32) NOT NULL,
                ended_at    VARCHAR(32) NULL,
                INDEX idx_workflow_started (started_at)
            )",
            "CREATE TABLE IF NOT EXISTS workflow_step (
                id          VARCHAR(36) PRIMARY KEY,
                workflow_id VARCHAR(36) NOT NULL,
                step        VARCHAR(255) NOT NULL,
                data        LONGTEXT NULL,
                created_at  VARCHAR(32) NOT NULL,
                INDEX idx_workflow_step_workflow (workflow_id, created_at)
            )",
        ]
    }

    fn push_identifier_predicate(
        &self,
        sql: &mut SqlBuilder<'_>,
        column: &str,
        identifier: &Identifier,
    ) {
        let candidate = serde_json::json!({
            "key": identifier.key,
            "value": identifier.value,
        });
        sql.push("JSON_CONTAINS(")
            .push(column)
            .push(", CAST(")
            .push_bind(candidate.to_string())
            .push(" AS JSON))");
    }
}
