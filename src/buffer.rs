//! Batched step writes.
//!
//! `add_step` must not wait on storage. Steps are accepted into an in-memory
//! list and written as one multi-row insert when a one-shot timer fires, on
//! an explicit flush, or at shutdown.
//!
//! Flushing swaps the pending list for an empty one before writing, so
//! steps accepted during a write land in the next batch. One flush is in
//! flight per buffer at a time, so batches reach storage in acceptance
//! order. A failed write drops its batch: buffered steps are at-most-once.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{Instrument, debug, error, warn};

use crate::error::{Error, Result};
use crate::model::WorkflowStep;
use crate::telemetry::{metrics, workflow as spans};

/// Where flushed batches go.
pub trait StepSink: Send + Sync + 'static {
    /// Persist a batch of steps in order, all or nothing.
    fn write_steps(&self, steps: Vec<WorkflowStep>) -> impl Future<Output = Result<()>> + Send;
}

/// Outcome of one flush.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Steps written by this flush.
    pub persisted: usize,
    /// Steps lost because the write failed or timed out.
    pub dropped: usize,
}

impl FlushReport {
    pub fn is_empty(&self) -> bool {
        self.persisted == 0 && self.dropped == 0
    }
}

// ---------------------------------------------------------------------------
// Step clock
// ---------------------------------------------------------------------------

/// Hands out strictly increasing microsecond timestamps.
///
/// Steps accepted in the same microsecond still get distinct `created_at`
/// values, so ordering by `created_at` reproduces acceptance order.
#[derive(Debug, Default)]
pub struct StepClock {
    last_micros: AtomicI64,
}

impl StepClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn now(&self) -> DateTime<Utc> {
        let wall = Utc::now().timestamp_micros();
        let previous = self
            .last_micros
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |last| {
                Some(wall.max(last + 1))
            })
            .unwrap_or(wall);
        let micros = wall.max(previous + 1);
        DateTime::from_timestamp_micros(micros).unwrap_or_else(Utc::now)
    }
}

// ---------------------------------------------------------------------------
// Buffer
// ---------------------------------------------------------------------------

pub struct BatchBuffer<S: StepSink> {
    sink: Arc<S>,
    pending: Mutex<Vec<WorkflowStep>>,
    /// Held across swap-and-write so only one batch is in flight.
    flush_lock: tokio::sync::Mutex<()>,
    delay: Duration,
    flush_timeout: Option<Duration>,
    timer_armed: AtomicBool,
    shutdown: CancellationToken,
    tasks: TaskTracker,
    runtime: Handle,
}

impl<S: StepSink> BatchBuffer<S> {
    /// Create a buffer that writes to `sink` `delay` after the first
    /// unflushed step. Timer tasks run on `runtime`.
    pub fn new(sink: Arc<S>, delay: Duration, runtime: Handle) -> Self {
        Self {
            sink,
            pending: Mutex::new(Vec::new()),
            flush_lock: tokio::sync::Mutex::new(()),
            delay,
            flush_timeout: None,
            timer_armed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
            runtime,
        }
    }

    /// Bound every write issued by a flush. A timed-out batch counts as dropped.
    pub fn with_flush_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.flush_timeout = timeout;
        self
    }

    /// Accept a fully formed step. Never waits on storage.
    ///
    /// Returns `false` once the buffer has been shut down.
    pub fn enqueue(self: &Arc<Self>, step: WorkflowStep) -> bool {
        {
            // Shutdown cancels under this lock, so a step is either pushed
            // before the final swap or rejected.
            let mut pending = self.pending.lock();
            if self.shutdown.is_cancelled() {
                drop(pending);
                warn!(
                    workflow_id = %step.workflow_id,
                    step = %step.step,
                    "buffer is shut down, step rejected"
                );
                return false;
            }
            pending.push(step);
        }
        metrics::steps_buffered().add(1, &[]);
        self.schedule_flush();
        true
    }

    /// Arm the one-shot flush timer unless it is already armed.
    pub fn schedule_flush(self: &Arc<Self>) {
        if self.shutdown.is_cancelled() || self.timer_armed.swap(true, Ordering::AcqRel) {
            return;
        }

        let buffer = Arc::clone(self);
        let delay = self.delay;
        self.tasks.spawn_on(
            async move {
                tokio::select! {
                    () = tokio::time::sleep(delay) => {
                        // Disarm before the swap: a step accepted after this
                        // point arms a fresh timer, one accepted before it is
                        // in this flush.
                        buffer.timer_armed.store(false, Ordering::Release);
                        buffer.flush().await;
                    }
                    () = buffer.shutdown.cancelled() => {
                        buffer.timer_armed.store(false, Ordering::Release);
                    }
                }
            },
            &self.runtime,
        );
    }

    /// Swap out the pending steps and write them as one batch.
    ///
    /// An empty buffer performs no write. A failed write is logged and its
    /// steps are dropped, not requeued.
    pub async fn flush(&self) -> FlushReport {
        let _in_flight = self.flush_lock.lock().await;

        let batch = std::mem::take(&mut *self.pending.lock());
        if batch.is_empty() {
            return FlushReport::default();
        }

        let count = batch.len();
        let started = Instant::now();
        let span = spans::flush_span(count);
        let result = self.write_batch(batch).instrument(span).await;
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        metrics::flush_duration_ms().record(elapsed_ms, &[]);

        match result {
            Ok(()) => {
                metrics::steps_persisted().add(count as u64, &[]);
                debug!(count, elapsed_ms, "step batch flushed");
                FlushReport {
                    persisted: count,
                    dropped: 0,
                }
            }
            Err(e) => {
                metrics::steps_dropped().add(count as u64, &[]);
                error!(count, error = %e, "step batch lost: flush failed");
                FlushReport {
                    persisted: 0,
                    dropped: count,
                }
            }
        }
    }

    async fn write_batch(&self, batch: Vec<WorkflowStep>) -> Result<()> {
        let write = self.sink.write_steps(batch);
        match self.flush_timeout {
            None => write.await,
            Some(limit) => tokio::time::timeout(limit, write)
                .await
                .map_err(|_| Error::Other(format!("flush timed out after {limit:?}")))?,
        }
    }

    /// Cancel the timer, flush what is left, and wait for timer tasks.
    ///
    /// Steps offered after this call are rejected.
    pub async fn shutdown(&self) -> FlushReport {
        {
            let _pending = self.pending.lock();
            self.shutdown.cancel();
        }
        let report = self.flush().await;
        self.tasks.close();
        self.tasks.wait().await;
        report
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Steps accepted but not yet handed to a flush.
    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }
}
