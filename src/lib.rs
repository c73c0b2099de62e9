//! # workflow-tracker
//!
//! Records the lifecycle of named workflows (start, steps, completion or
//! failure) in SQLite, Postgres, or MySQL, with lookup by key/value
//! identifiers and aggregate statistics.
//!
//! Steps are buffered and written in batches; see [`tracker`] for the
//! consistency rules that follow from that.

pub mod buffer;
pub mod config;
pub mod db;
pub mod error;
pub mod event;
pub mod handle;
pub mod identifier;
pub mod model;
pub mod telemetry;
pub mod tracker;

pub use buffer::FlushReport;
pub use config::{Backend, TrackerConfig};
pub use error::{Error, Result};
pub use event::{Event, EventClass, EventKind};
pub use handle::WorkflowHandle;
pub use model::{
    Identifier, NewStep, Status, StepDuration, StepFrequency, StepId, Workflow, WorkflowFilter,
    WorkflowId, WorkflowPage, WorkflowStats, WorkflowStep,
};
pub use tracker::{WorkflowTracker, WriteTicket};
