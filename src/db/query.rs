//! SQL assembly and workflow listing queries.
//!
//! [`SqlBuilder`] appends SQL text and bind values together so placeholder
//! numbering always matches the bind order, whatever the dialect's
//! placeholder syntax. The listing query builds its predicate set once and
//! applies it to both the `COUNT(*)` and the page `SELECT`.

use std::str::FromStr;

use sqlx::Any;
use sqlx::any::AnyArguments;
use sqlx::query::Query;

use crate::error::{Error, Result};
use crate::model::{DEFAULT_PAGE_SIZE, WorkflowFilter, format_timestamp};

use super::dialect::Dialect;

/// A bind value. Covers every column type the tracker writes.
#[derive(Debug, Clone, PartialEq)]
pub enum Param {
    Text(String),
    NullableText(Option<String>),
    Int(i64),
}

impl From<&str> for Param {
    fn from(s: &str) -> Self {
        Param::Text(s.to_string())
    }
}

impl From<String> for Param {
    fn from(s: String) -> Self {
        Param::Text(s)
    }
}

impl From<Option<String>> for Param {
    fn from(s: Option<String>) -> Self {
        Param::NullableText(s)
    }
}

impl From<i64> for Param {
    fn from(n: i64) -> Self {
        Param::Int(n)
    }
}

/// SQL text plus its bind values.
pub struct SqlBuilder<'d> {
    dialect: &'d dyn Dialect,
    sql: String,
    params: Vec<Param>,
}

impl<'d> SqlBuilder<'d> {
    pub fn new(dialect: &'d dyn Dialect) -> Self {
        Self {
            dialect,
            sql: String::new(),
            params: Vec::new(),
        }
    }

    pub fn push(&mut self, text: &str) -> &mut Self {
        self.sql.push_str(text);
        self
    }

    pub fn push_bind(&mut self, value: impl Into<Param>) -> &mut Self {
        self.params.push(value.into());
        let placeholder = self.dialect.placeholder(self.params.len());
        self.sql.push_str(&placeholder);
        self
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn param_count(&self) -> usize {
        self.params.len()
    }

    pub fn params(&self) -> &[Param] {
        &self.params
    }

    /// Build an executable query borrowing this builder.
    pub fn build(&self) -> Query<'_, Any, AnyArguments<'_>> {
        let mut query = sqlx::query(&self.sql);
        for param in &self.params {
            query = match param {
                Param::Text(s) => query.bind(s.as_str()),
                Param::NullableText(s) => query.bind(s.as_deref()),
                Param::Int(n) => query.bind(*n),
            };
        }
        query
    }
}

// ---------------------------------------------------------------------------
// Sorting
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortField {
    StartedAt,
    EndedAt,
}

impl SortField {
    fn column(self) -> &'static str {
        match self {
            SortField::StartedAt => "started_at",
            SortField::EndedAt => "ended_at",
        }
    }
}

impl FromStr for SortField {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "started_at" => Ok(SortField::StartedAt),
            "ended_at" => Ok(SortField::EndedAt),
            _ => Err(Error::Validation(format!("cannot order workflows by {s:?}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Asc,
    Desc,
}

impl SortOrder {
    fn keyword(self) -> &'static str {
        match self {
            SortOrder::Asc => "ASC",
            SortOrder::Desc => "DESC",
        }
    }
}

impl FromStr for SortOrder {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "asc" => Ok(SortOrder::Asc),
            "desc" => Ok(SortOrder::Desc),
            _ => Err(Error::Validation(format!("unknown sort order {s:?}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Listing
// ---------------------------------------------------------------------------

/// Validated paging and sorting derived from a [`WorkflowFilter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Paging {
    pub page: i64,
    pub page_size: i64,
    pub sort: SortField,
    pub order: SortOrder,
}

impl Paging {
    pub fn from_filter(filter: &WorkflowFilter) -> Result<Self> {
        let page = filter.page.unwrap_or(1);
        let page_size = filter.page_size.unwrap_or(DEFAULT_PAGE_SIZE);
        if page < 1 {
            return Err(Error::Validation(format!("page must be >= 1, got {page}")));
        }
        if page_size < 1 {
            return Err(Error::Validation(format!(
                "page size must be >= 1, got {page_size}"
            )));
        }
        let sort = filter.order_by.as_deref().unwrap_or("started_at").parse()?;
        let order = filter.order.as_deref().unwrap_or("desc").parse()?;
        Ok(Self {
            page,
            page_size,
            sort,
            order,
        })
    }

    pub fn offset(&self) -> i64 {
        (self.page - 1).saturating_mul(self.page_size)
    }

    /// `ceil(total / page_size)`, zero when there is nothing to show.
    pub fn total_pages(&self, total: i64) -> i64 {
        if total <= 0 {
            0
        } else {
            (total - 1) / self.page_size + 1
        }
    }
}

/// Escape character for LIKE patterns. Backslash is avoided because MySQL
/// and Postgres disagree about it inside string literals.
const LIKE_ESCAPE: char = '!';

/// `%value%` with the value's own wildcards taken literally.
fn contains_pattern(value: &str) -> String {
    let mut pattern = String::with_capacity(value.len() + 2);
    pattern.push('%');
    for c in value.chars() {
        if matches!(c, '%' | '_') || c == LIKE_ESCAPE {
            pattern.push(LIKE_ESCAPE);
        }
        pattern.push(c);
    }
    pattern.push('%');
    pattern
}

pub(crate) const WORKFLOW_COLUMNS: &str = "id, name, identifiers, status, started_at, ended_at";

/// Append ` WHERE ...` for every set filter field. Appends nothing when no
/// field is set.
pub fn push_workflow_predicates(
    sql: &mut SqlBuilder<'_>,
    dialect: &dyn Dialect,
    filter: &WorkflowFilter,
) {
    let mut first = true;

    if let Some(status) = filter.status {
        conjunction(sql, &mut first);
        sql.push("status = ").push_bind(status.as_str());
    }
    if let Some(identifier) = &filter.identifier {
        conjunction(sql, &mut first);
        dialect.push_identifier_predicate(sql, "identifiers", identifier);
    }
    if let Some(name) = &filter.name {
        conjunction(sql, &mut first);
        sql.push("name LIKE ")
            .push_bind(contains_pattern(name))
            .push(" ESCAPE '!'");
    }
    if let Some(start) = &filter.start_date {
        conjunction(sql, &mut first);
        sql.push("started_at >= ").push_bind(format_timestamp(start));
    }
    if let Some(end) = &filter.end_date {
        conjunction(sql, &mut first);
        sql.push("started_at < ").push_bind(format_timestamp(end));
    }
    if let Some(step) = &filter.step {
        conjunction(sql, &mut first);
        dialect.push_step_membership_predicate(sql, "workflow.id", step);
    }
}

fn conjunction(sql: &mut SqlBuilder<'_>, first: &mut bool) {
    sql.push(if *first { " WHERE " } else { " AND " });
    *first = false;
}

/// `SELECT COUNT(*)` under the filter.
pub fn count_query<'d>(dialect: &'d dyn Dialect, filter: &WorkflowFilter) -> SqlBuilder<'d> {
    let mut sql = SqlBuilder::new(dialect);
    sql.push("SELECT COUNT(*) AS total FROM workflow");
    push_workflow_predicates(&mut sql, dialect, filter);
    sql
}

/// One page of workflow rows under the same filter as [`count_query`].
pub fn page_query<'d>(
    dialect: &'d dyn Dialect,
    filter: &WorkflowFilter,
    paging: &Paging,
) -> SqlBuilder<'d> {
    let mut sql = SqlBuilder::new(dialect);
    sql.push("SELECT ").push(WORKFLOW_COLUMNS).push(" FROM workflow");
    push_workflow_predicates(&mut sql, dialect, filter);

    let column = paging.sort.column();
    let direction = paging.order.keyword();
    // NULL ended_at rows sort last in both directions, on every backend.
    sql.push(" ORDER BY CASE WHEN ")
        .push(column)
        .push(" IS NULL THEN 1 ELSE 0 END, ")
        .push(column)
        .push(" ")
        .push(direction)
        .push(", id ")
        .push(direction)
        .push(" LIMIT ")
        .push_bind(paging.page_size)
        .push(" OFFSET ")
        .push_bind(paging.offset());
    sql
}
