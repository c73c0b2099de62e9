//! The workflow tracker: the single entry point for every workflow operation.
//!
//! A [`WorkflowTracker`] owns one database pool, one step [`BatchBuffer`],
//! and one [`Notifier`]. It is cheap to clone; clones share all three.
//!
//! Apart from [`WorkflowTracker::connect`] and
//! [`WorkflowTracker::start_workflow`], no method returns an error. Failures
//! are logged with the operation name and turned into a fallback value:
//!
//! | Operation | Fallback |
//! |---|---|
//! | `get_workflows` | empty page: total 0, page 1, page size 10, 0 pages |
//! | `get_steps`, `get_steps_by_identifier` | empty list |
//! | `get_workflow_stats` | all-zero stats |
//! | `get_most_frequent_steps`, `get_average_step_duration` | empty list |
//! | `attach_identifier`, `delete_workflow`, `delete_all_workflows` | `false` |
//! | `get_workflow`, `get_workflow_by_identifier` | `None` |
//!
//! # Write semantics
//!
//! `add_step` only buffers. A buffered step becomes visible to reads after
//! the next flush (timer, [`WorkflowTracker::flush_batch_inserts`], or
//! [`WorkflowTracker::destroy`]). A flush that fails drops its steps:
//! buffered writes are at-most-once and best effort. `add_steps` writes
//! directly and is durable once it returns `true`.
//!
//! `complete_workflow` and `fail_workflow` run in the background and return
//! a [`WriteTicket`]. They do not flush the buffer, so a reader may see a
//! workflow completed while one of its earlier steps is still buffered.
//!
//! Only `pending` workflows move: a second complete or fail is a no-op, and
//! `ended_at` is written once.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde_json::Value;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;
use tracing::{Instrument, error, info, warn};

use crate::buffer::{BatchBuffer, FlushReport, StepClock};
use crate::config::TrackerConfig;
use crate::db::Db;
use crate::error::{Error, Result};
use crate::event::{Event, EventClass, EventKind, Notifier};
use crate::handle::WorkflowHandle;
use crate::model::*;
use crate::telemetry::{metrics, workflow as spans};

/// Outcome of a background status write.
///
/// Dropping the ticket does not cancel the write.
#[derive(Debug)]
#[must_use = "drop the ticket to fire and forget, or call `wait` for the outcome"]
pub struct WriteTicket {
    task: Option<JoinHandle<bool>>,
}

impl WriteTicket {
    fn rejected() -> Self {
        Self { task: None }
    }

    /// Wait for the write. `true` only if the workflow actually transitioned.
    pub async fn wait(self) -> bool {
        let Some(task) = self.task else {
            return false;
        };
        match task.await {
            Ok(transitioned) => transitioned,
            Err(e) => {
                error!(error = %e, "status write task failed");
                false
            }
        }
    }
}

struct Inner {
    db: Db,
    buffer: Arc<BatchBuffer<Db>>,
    notifier: Notifier,
    clock: StepClock,
    /// Background status writes.
    writes: TaskTracker,
    runtime: Handle,
    destroyed: AtomicBool,
}

#[derive(Clone)]
pub struct WorkflowTracker {
    inner: Arc<Inner>,
}

impl WorkflowTracker {
    /// Connect to the configured backend and create the schema if needed.
    ///
    /// Accepts a [`TrackerConfig`] or a SQLite path (`":memory:"` included).
    pub async fn connect(config: impl Into<TrackerConfig>) -> Result<Self> {
        let config = config.into();
        let runtime = Handle::current();
        let db = Db::connect(&config).await?;

        // The buffer writes through its own pool handle; AnyPool clones share
        // connections.
        let sink = Arc::new(db.clone());
        let buffer = BatchBuffer::new(sink, config.batch_delay_duration(), runtime.clone())
            .with_flush_timeout(config.flush_timeout_duration());

        info!(
            backend = %config.backend,
            batch_delay_ms = config.batch_delay_ms,
            "workflow tracker started"
        );

        Ok(Self {
            inner: Arc::new(Inner {
                db,
                buffer: Arc::new(buffer),
                notifier: Notifier::new(),
                clock: StepClock::new(),
                writes: TaskTracker::new(),
                runtime,
                destroyed: AtomicBool::new(false),
            }),
        })
    }

    // -----------------------------------------------------------------------
    // Writes
    // -----------------------------------------------------------------------

    /// Insert a new pending workflow and return a handle to it.
    ///
    /// The only operation that reports storage failure to the caller: there
    /// is no sensible fallback id.
    pub async fn start_workflow(
        &self,
        name: &str,
        identifiers: Vec<Identifier>,
    ) -> Result<WorkflowHandle> {
        if self.is_destroyed() {
            return Err(Error::Other("tracker has been destroyed".into()));
        }

        let workflow = Workflow {
            id: WorkflowId::new(),
            name: name.to_string(),
            identifiers,
            status: Status::Pending,
            started_at: self.inner.clock.now(),
            ended_at: None,
        };

        let span = spans::workflow_span("start_workflow", workflow.id);
        self.inner
            .db
            .insert_workflow(&workflow)
            .instrument(span)
            .await?;

        metrics::workflows_started().add(
            1,
            &[opentelemetry::KeyValue::new("workflow", workflow.name.clone())],
        );
        info!(workflow_id = %workflow.id, name, "workflow started");

        let id = workflow.id;
        self.inner
            .notifier
            .notify(EventKind::WorkflowStarted { workflow });
        Ok(WorkflowHandle::new(id, self.clone()))
    }

    /// Buffer one step. Returns its id once accepted, without waiting for
    /// storage.
    ///
    /// The parent workflow is not checked. Returns `None` for a blank step
    /// name or after [`destroy`](Self::destroy).
    pub fn add_step(
        &self,
        workflow_id: impl Into<WorkflowId>,
        step: &str,
        data: Option<Value>,
    ) -> Option<StepId> {
        let workflow_id = workflow_id.into();
        if step.trim().is_empty() {
            warn!(operation = "add_step", workflow_id = %workflow_id, "step name is blank");
            return None;
        }

        let record = WorkflowStep {
            id: StepId::new(),
            workflow_id,
            step: step.to_string(),
            data: data.unwrap_or(Value::Null),
            created_at: self.inner.clock.now(),
        };
        let id = record.id;

        if !self.inner.buffer.enqueue(record.clone()) {
            return None;
        }
        self.inner
            .notifier
            .notify(EventKind::StepAdded { step: record });
        Some(id)
    }

    /// Write a batch of steps directly, bypassing the buffer.
    ///
    /// Returns `true` once every step is durable. A blank step name rejects
    /// the whole batch.
    pub async fn add_steps(&self, workflow_id: impl Into<WorkflowId>, steps: Vec<NewStep>) -> bool {
        let workflow_id = workflow_id.into();
        if let Some(blank) = steps.iter().position(|s| s.step.trim().is_empty()) {
            warn!(
                operation = "add_steps",
                workflow_id = %workflow_id,
                index = blank,
                "step name is blank, batch rejected"
            );
            return false;
        }

        let records: Vec<WorkflowStep> = steps
            .into_iter()
            .map(|s| WorkflowStep {
                id: StepId::new(),
                workflow_id,
                step: s.step,
                data: s.data.unwrap_or(Value::Null),
                created_at: self.inner.clock.now(),
            })
            .collect();

        let span = spans::workflow_span("add_steps", workflow_id);
        match self.inner.db.insert_steps(&records).instrument(span).await {
            Ok(()) => {
                for step in records {
                    self.inner.notifier.notify(EventKind::StepAdded { step });
                }
                true
            }
            Err(e) => {
                log_failure("add_steps", &e);
                false
            }
        }
    }

    /// Mark a pending workflow completed, in the background.
    pub fn complete_workflow(&self, workflow_id: impl Into<WorkflowId>) -> WriteTicket {
        self.finish(workflow_id.into(), Status::Completed, None)
    }

    /// Mark a pending workflow failed, in the background.
    pub fn fail_workflow(
        &self,
        workflow_id: impl Into<WorkflowId>,
        reason: Option<&str>,
    ) -> WriteTicket {
        self.finish(workflow_id.into(), Status::Failed, reason.map(str::to_string))
    }

    fn finish(&self, id: WorkflowId, to: Status, reason: Option<String>) -> WriteTicket {
        let operation = match to {
            Status::Failed => "fail_workflow",
            _ => "complete_workflow",
        };
        if self.is_destroyed() {
            warn!(operation, workflow_id = %id, "tracker has been destroyed");
            return WriteTicket::rejected();
        }

        let inner = Arc::clone(&self.inner);
        let ended_at = inner.clock.now();
        let span = spans::workflow_span(operation, id);
        let task = inner.writes.spawn_on(
            {
                let inner = Arc::clone(&inner);
                async move {
                    let outcome = inner.db.transition_status(id, to, ended_at).await;
                    let result = match &outcome {
                        Ok(true) => "ok",
                        Ok(false) => "noop",
                        Err(_) => "error",
                    };
                    metrics::workflow_transitions().add(
                        1,
                        &[
                            opentelemetry::KeyValue::new("to", to.as_str()),
                            opentelemetry::KeyValue::new("result", result),
                        ],
                    );

                    match outcome {
                        Ok(true) => {
                            spans::record_transition(&tracing::Span::current(), Status::Pending, to);
                            let kind = match to {
                                Status::Failed => EventKind::WorkflowFailed { id, reason },
                                _ => EventKind::WorkflowCompleted { id },
                            };
                            inner.notifier.notify(kind);
                            true
                        }
                        Ok(false) => {
                            warn!(
                                operation,
                                workflow_id = %id,
                                "workflow is missing or no longer pending"
                            );
                            false
                        }
                        Err(e) => {
                            log_failure(operation, &e);
                            false
                        }
                    }
                }
                .instrument(span)
            },
            &inner.runtime,
        );
        WriteTicket { task: Some(task) }
    }

    /// Add `new` to the workflow carrying `key=value`.
    ///
    /// `false` if no workflow matches, `new` is blank, or it is already
    /// attached.
    pub async fn attach_identifier(&self, key: &str, value: &str, new: Identifier) -> bool {
        let existing = Identifier::new(key, value);
        contained(
            "attach_identifier",
            self.inner.db.attach_identifier(&existing, new).await,
        )
    }

    pub(crate) async fn attach_identifier_to(&self, id: WorkflowId, new: Identifier) -> bool {
        contained(
            "attach_identifier",
            self.inner.db.attach_identifier_to(id, new).await,
        )
    }

    /// Delete a workflow and its steps. `true` only if the workflow existed.
    pub async fn delete_workflow(&self, workflow_id: impl Into<WorkflowId>) -> bool {
        contained(
            "delete_workflow",
            self.inner.db.delete_workflow(workflow_id.into()).await,
        )
    }

    /// Delete every workflow and step.
    pub async fn delete_all_workflows(&self) -> bool {
        contained(
            "delete_all_workflows",
            self.inner.db.delete_all_workflows().await.map(|()| true),
        )
    }

    // -----------------------------------------------------------------------
    // Reads
    //
    // Reads go straight to storage. Buffered steps are not visible until
    // flushed.
    // -----------------------------------------------------------------------

    pub async fn get_workflow(&self, workflow_id: impl Into<WorkflowId>) -> Option<Workflow> {
        contained(
            "get_workflow",
            self.inner.db.get_workflow(workflow_id.into()).await,
        )
    }

    /// The oldest workflow carrying `key=value`.
    pub async fn get_workflow_by_identifier(&self, key: &str, value: &str) -> Option<Workflow> {
        let ident = Identifier::new(key, value);
        contained(
            "get_workflow_by_identifier",
            self.inner.db.find_workflow_by_identifier(&ident).await,
        )
    }

    /// Persisted steps of a workflow in the order they were added.
    pub async fn get_steps(&self, workflow_id: impl Into<WorkflowId>) -> Vec<WorkflowStep> {
        contained(
            "get_steps",
            self.inner.db.steps_for_workflow(workflow_id.into()).await,
        )
    }

    /// Persisted steps of every workflow carrying `key=value`, grouped by
    /// workflow.
    pub async fn get_steps_by_identifier(&self, key: &str, value: &str) -> Vec<WorkflowStep> {
        let ident = Identifier::new(key, value);
        contained(
            "get_steps_by_identifier",
            self.inner.db.steps_by_identifier(&ident).await,
        )
    }

    pub async fn get_workflow_stats(&self) -> WorkflowStats {
        contained("get_workflow_stats", self.inner.db.workflow_stats().await)
    }

    /// The `limit` most frequent step names. Empty for `limit <= 0`.
    pub async fn get_most_frequent_steps(&self, limit: i64) -> Vec<StepFrequency> {
        contained(
            "get_most_frequent_steps",
            self.inner.db.most_frequent_steps(limit).await,
        )
    }

    pub async fn get_average_step_duration(&self) -> Vec<StepDuration> {
        contained(
            "get_average_step_duration",
            self.inner.db.step_durations().await,
        )
    }

    /// One page of workflows matching `filter`, with the total match count.
    pub async fn get_workflows(&self, filter: &WorkflowFilter) -> WorkflowPage {
        contained("get_workflows", self.inner.db.list_workflows(filter).await)
    }

    pub async fn health_check(&self) -> bool {
        contained(
            "health_check",
            self.inner.db.health_check().await.map(|()| true),
        )
    }

    // -----------------------------------------------------------------------
    // Buffer control and lifecycle
    // -----------------------------------------------------------------------

    /// Write every buffered step now.
    pub async fn flush_batch_inserts(&self) -> FlushReport {
        self.inner.buffer.flush().await
    }

    /// Steps accepted but not yet flushed.
    pub fn pending_steps(&self) -> usize {
        self.inner.buffer.pending_len()
    }

    /// Wait for every background status write issued so far.
    ///
    /// Buffered steps are not written; use
    /// [`flush_batch_inserts`](Self::flush_batch_inserts) for those.
    pub async fn wait_for_pending_writes(&self) {
        let writes = &self.inner.writes;
        writes.close();
        writes.wait().await;
        if !self.is_destroyed() {
            writes.reopen();
        }
    }

    /// Wait for status writes, flush the buffer, and close the pool.
    ///
    /// Calling it again is a no-op that reports nothing flushed. Afterwards
    /// writes are rejected and reads return their fallbacks.
    pub async fn destroy(&self) -> FlushReport {
        if self.inner.destroyed.swap(true, Ordering::AcqRel) {
            return FlushReport::default();
        }

        self.inner.writes.close();
        self.inner.writes.wait().await;
        let report = self.inner.buffer.shutdown().await;
        self.inner.db.close().await;

        info!(
            persisted = report.persisted,
            dropped = report.dropped,
            "workflow tracker destroyed"
        );
        report
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.load(Ordering::Acquire)
    }

    // -----------------------------------------------------------------------
    // Subscriptions
    // -----------------------------------------------------------------------

    /// Register a subscriber for one event class.
    ///
    /// Subscribers run synchronously, in registration order, right after the
    /// change is accepted. A panicking subscriber is logged and skipped.
    pub fn subscribe<F>(&self, class: EventClass, f: F)
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.inner.notifier.subscribe(class, f);
    }

    pub fn on_workflow_started<F>(&self, f: F)
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.subscribe(EventClass::WorkflowStarted, f);
    }

    /// Fires when a step is accepted, before it is durable.
    pub fn on_step_added<F>(&self, f: F)
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.subscribe(EventClass::StepAdded, f);
    }

    pub fn on_workflow_completed<F>(&self, f: F)
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.subscribe(EventClass::WorkflowCompleted, f);
    }

    pub fn on_workflow_failed<F>(&self, f: F)
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.subscribe(EventClass::WorkflowFailed, f);
    }
}

impl std::fmt::Debug for WorkflowTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowTracker")
            .field("db", &self.inner.db)
            .field("pending_steps", &self.pending_steps())
            .field("destroyed", &self.is_destroyed())
            .finish_non_exhaustive()
    }
}

/// Unwrap `result`, or log it and fall back to the operation's default.
fn contained<T: Default>(operation: &'static str, result: Result<T>) -> T {
    match result {
        Ok(value) => value,
        Err(e) => {
            log_failure(operation, &e);
            T::default()
        }
    }
}

fn log_failure(operation: &'static str, e: &Error) {
    match e {
        Error::NotFound(_) | Error::Validation(_) => {
            warn!(operation, error = %e, "tracker operation rejected");
        }
        _ => error!(operation, error = %e, "tracker operation failed"),
    }
}
