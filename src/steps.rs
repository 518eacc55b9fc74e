//! Step sequencing within a task.
//!
//! Steps record what a worker actually did while executing a task. Numbers
//! are assigned per task, starting at 1 with no gaps, and a step links to at
//! most one reasoning trace.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{Error, Result, TaskError};
use crate::store::Store;
use crate::store::types::{Reasoning, ReasoningKind, Step, StepStatus};

pub struct StepSequencer {
    store: Arc<dyn Store>,
}

impl StepSequencer {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Append a new pending step to `task_id`, numbered one past the task's
    /// current highest step.
    pub async fn append_step(
        &self,
        task_id: Uuid,
        step_type_name: &str,
        parent_step_id: Option<Uuid>,
        input: Value,
    ) -> Result<Step> {
        let step_type = self
            .store
            .find_step_type(step_type_name)
            .await?
            .ok_or_else(|| TaskError::UnknownStepType(step_type_name.to_string()))?;

        let number = self.store.max_step_number(task_id).await? + 1;
        let step = self
            .store
            .insert_step(task_id, number, step_type.id, parent_step_id, input)
            .await?;
        debug!(step_id = %step.id, task_id = %task_id, number, step_type = step_type_name,
            "Step appended");
        Ok(step)
    }

    pub async fn start(&self, id: Uuid) -> Result<()> {
        if self.store.start_step(id).await? {
            return Ok(());
        }
        Err(self.transition_error(id, StepStatus::Running).await)
    }

    pub async fn complete(&self, id: Uuid, output: &Value) -> Result<()> {
        if self.store.complete_step(id, output).await? {
            debug!(step_id = %id, "Step completed");
            return Ok(());
        }
        Err(self.transition_error(id, StepStatus::Completed).await)
    }

    pub async fn fail(&self, id: Uuid, error_module: &str, error_message: &str) -> Result<()> {
        if self.store.fail_step(id, error_module, error_message).await? {
            warn!(step_id = %id, module = error_module, error = error_message, "Step failed");
            return Ok(());
        }
        Err(self.transition_error(id, StepStatus::Failed).await)
    }

    /// Save a reasoning trace and link it to the step. A step accepts a
    /// single reasoning link for its lifetime.
    pub async fn attach_reasoning(
        &self,
        step_id: Uuid,
        content: &str,
        kind: ReasoningKind,
    ) -> Result<Reasoning> {
        let reasoning = self.store.insert_reasoning(step_id, content, kind).await?;
        if !self.store.set_step_reasoning(step_id, reasoning.id).await? {
            return Err(TaskError::ReasoningAlreadyAttached { step_id }.into());
        }
        Ok(reasoning)
    }

    pub async fn list(&self, task_id: Uuid) -> Result<Vec<Step>> {
        Ok(self.store.list_steps(task_id).await?)
    }

    async fn transition_error(&self, id: Uuid, to: StepStatus) -> Error {
        match self.store.get_step(id).await {
            Ok(Some(step)) => TaskError::InvalidStepTransition {
                id,
                from: step.status,
                to,
            }
            .into(),
            Ok(None) => TaskError::NotFound { id }.into(),
            Err(e) => e.into(),
        }
    }
}
