//! Core data model.
//!
//! A workflow is a named, identifier-tagged unit of tracked work. It moves
//! from `pending` to exactly one of `completed` or `failed`. Steps are
//! timestamped payloads recorded against a workflow.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

// ---------------------------------------------------------------------------
// Timestamps
// ---------------------------------------------------------------------------

/// Storage format for timestamps. Fixed width, so lexical order is time order
/// on every backend.
const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6fZ";

pub(crate) fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

pub(crate) fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| Error::Other(format!("invalid timestamp {s:?}: {e}")))
}

// ---------------------------------------------------------------------------
// Ids
// ---------------------------------------------------------------------------

/// Newtype for workflow IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkflowId(pub Uuid);

impl WorkflowId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// First 8 chars of the UUID, for tables and logs.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for WorkflowId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for WorkflowId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for WorkflowId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| Error::Validation(format!("invalid workflow id {s:?}: {e}")))
    }
}

/// Newtype for step IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StepId(pub Uuid);

impl StepId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for StepId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for StepId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Lifecycle status of a workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    /// Started, not yet resolved.
    Pending,
    /// Finished successfully. Terminal.
    Completed,
    /// Finished with a failure. Terminal.
    Failed,
}

impl Status {
    pub fn can_transition_to(self, to: Status) -> bool {
        matches!(
            (self, to),
            (Status::Pending, Status::Completed) | (Status::Pending, Status::Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Completed | Status::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Status::Pending => "pending",
            Status::Completed => "completed",
            Status::Failed => "failed",
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Status::Pending),
            "completed" => Ok(Status::Completed),
            "failed" => Ok(Status::Failed),
            _ => Err(Error::Validation(format!("unknown status: {s}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Workflow
// ---------------------------------------------------------------------------

/// An alternate lookup key for a workflow.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identifier {
    pub key: String,
    pub value: String,
}

impl Identifier {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// A tracked workflow row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub id: WorkflowId,
    /// Free-form label. Not unique.
    pub name: String,
    pub identifiers: Vec<Identifier>,
    pub status: Status,
    pub started_at: DateTime<Utc>,
    /// Set once, on the transition out of `pending`.
    pub ended_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Steps
// ---------------------------------------------------------------------------

/// A step recorded against a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub id: StepId,
    pub workflow_id: WorkflowId,
    pub step: String,
    /// Arbitrary payload. Absent payloads read back as `Value::Null`.
    pub data: serde_json::Value,
    /// When the step was accepted by the tracker, not when it became durable.
    pub created_at: DateTime<Utc>,
}

/// A step to record. Used by batch inserts.
#[derive(Debug, Clone)]
pub struct NewStep {
    pub step: String,
    pub data: Option<serde_json::Value>,
}

impl NewStep {
    pub fn new(step: impl Into<String>) -> Self {
        Self {
            step: step.into(),
            data: None,
        }
    }

    pub fn data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }
}

// ---------------------------------------------------------------------------
// Aggregates
// ---------------------------------------------------------------------------

/// Aggregate counts over all workflows.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStats {
    pub total: i64,
    pub completed: i64,
    pub pending: i64,
    /// `total - completed - pending`.
    pub failed: i64,
    /// Mean steps per workflow, two decimals. Workflows without steps count as zero.
    pub avg_steps: f64,
}

/// How often a step name occurs across all workflows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepFrequency {
    pub step: String,
    pub count: i64,
}

/// Per-workflow step count and the span between its first and last step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDuration {
    pub workflow_id: WorkflowId,
    pub name: String,
    pub step_count: i64,
    pub first_step_at: Option<DateTime<Utc>>,
    pub last_step_at: Option<DateTime<Utc>>,
    /// `None` when the workflow has no steps.
    pub duration_ms: Option<i64>,
}

// ---------------------------------------------------------------------------
// Listing
// ---------------------------------------------------------------------------

/// Filter, sort and pagination options for [`get_workflows`].
///
/// `order_by` and `order` stay strings so the filter can be deserialized
/// straight from a query string; unknown values are rejected at query time.
///
/// [`get_workflows`]: crate::tracker::WorkflowTracker::get_workflows
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct WorkflowFilter {
    pub status: Option<Status>,
    pub identifier: Option<Identifier>,
    /// Substring match on the workflow name.
    pub name: Option<String>,
    /// Inclusive lower bound on `started_at`.
    pub start_date: Option<DateTime<Utc>>,
    /// Exclusive upper bound on `started_at`.
    pub end_date: Option<DateTime<Utc>>,
    /// Workflow must have at least one step with this name.
    pub step: Option<String>,
    /// 1-based. Defaults to 1.
    pub page: Option<i64>,
    /// Defaults to 10.
    pub page_size: Option<i64>,
    /// `started_at` (default) or `ended_at`.
    pub order_by: Option<String>,
    /// `asc` or `desc` (default).
    pub order: Option<String>,
}

impl WorkflowFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(mut self, status: Status) -> Self {
        self.status = Some(status);
        self
    }

    pub fn identifier(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.identifier = Some(Identifier::new(key, value));
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn started_between(
        mut self,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Self {
        self.start_date = start;
        self.end_date = end;
        self
    }

    pub fn step(mut self, step: impl Into<String>) -> Self {
        self.step = Some(step.into());
        self
    }

    pub fn page(mut self, page: i64, page_size: i64) -> Self {
        self.page = Some(page);
        self.page_size = Some(page_size);
        self
    }

    pub fn order_by(mut self, field: impl Into<String>, order: impl Into<String>) -> Self {
        self.order_by = Some(field.into());
        self.order = Some(order.into());
        self
    }
}

pub const DEFAULT_PAGE_SIZE: i64 = 10;

/// One page of workflows plus the total count under the same filter.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowPage {
    pub workflows: Vec<Workflow>,
    pub total: i64,
    pub page: i64,
    pub page_size: i64,
    pub total_pages: i64,
}

impl WorkflowPage {
    /// The page returned when listing fails.
    pub fn empty() -> Self {
        Self {
            workflows: Vec::new(),
            total: 0,
            page: 1,
            page_size: DEFAULT_PAGE_SIZE,
            total_pages: 0,
        }
    }
}

impl Default for WorkflowPage {
    fn default() -> Self {
        Self::empty()
    }
}
