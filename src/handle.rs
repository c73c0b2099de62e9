//! Per-workflow convenience wrapper.

use serde_json::Value;

use crate::model::{Identifier, NewStep, StepId, Workflow, WorkflowId, WorkflowStep};
use crate::tracker::{WorkflowTracker, WriteTicket};

/// A workflow id bound to the tracker that started it.
///
/// Every method delegates to the tracker and has the same fallback
/// behavior.
#[derive(Clone)]
pub struct WorkflowHandle {
    id: WorkflowId,
    tracker: WorkflowTracker,
}

impl WorkflowHandle {
    pub(crate) fn new(id: WorkflowId, tracker: WorkflowTracker) -> Self {
        Self { id, tracker }
    }

    pub fn id(&self) -> WorkflowId {
        self.id
    }

    /// Buffer a step. See [`WorkflowTracker::add_step`].
    pub fn add_step(&self, step: &str, data: Option<Value>) -> Option<StepId> {
        self.tracker.add_step(self.id, step, data)
    }

    /// Write steps directly. See [`WorkflowTracker::add_steps`].
    pub async fn add_steps(&self, steps: Vec<NewStep>) -> bool {
        self.tracker.add_steps(self.id, steps).await
    }

    pub fn complete(&self) -> WriteTicket {
        self.tracker.complete_workflow(self.id)
    }

    pub fn fail(&self, reason: Option<&str>) -> WriteTicket {
        self.tracker.fail_workflow(self.id, reason)
    }

    /// Current row, or `None` if deleted.
    pub async fn workflow(&self) -> Option<Workflow> {
        self.tracker.get_workflow(self.id).await
    }

    /// Persisted steps. Buffered steps show up after a flush.
    pub async fn steps(&self) -> Vec<WorkflowStep> {
        self.tracker.get_steps(self.id).await
    }

    /// Attach another lookup identifier to this workflow.
    pub async fn attach_identifier(&self, new: Identifier) -> bool {
        self.tracker.attach_identifier_to(self.id, new).await
    }

    pub async fn delete(&self) -> bool {
        self.tracker.delete_workflow(self.id).await
    }
}

impl std::fmt::Debug for WorkflowHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowHandle")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

impl From<&WorkflowHandle> for WorkflowId {
    fn from(handle: &WorkflowHandle) -> Self {
        handle.id
    }
}

impl From<&Workflow> for WorkflowId {
    fn from(workflow: &Workflow) -> Self {
        workflow.id
    }
}
