//! Task queue over the persistent store.
//!
//! Tasks are rows: enqueue inserts a `pending` row, workers claim with an
//! atomic status swap, and terminal transitions are guarded so a row settles
//! exactly once. Claim order is priority (descending) then age (oldest
//! first).

use std::sync::Arc;

use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{Error, Result, TaskError};
use crate::store::Store;
use crate::store::types::{Task, TaskStatus};

/// Error module recorded on rows failed by startup recovery.
pub const RECOVERY_MODULE: &str = "startup_recovery";

pub struct TaskQueue {
    store: Arc<dyn Store>,
}

impl TaskQueue {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Insert a new pending task.
    ///
    /// `priority` must be within `[0.0, 1.0]`; `type_name` must exist in the
    /// task type dictionary.
    pub async fn enqueue(
        &self,
        type_name: &str,
        parent_task_id: Option<Uuid>,
        input: Value,
        priority: f64,
    ) -> Result<Task> {
        if !(0.0..=1.0).contains(&priority) || priority.is_nan() {
            return Err(TaskError::PriorityOutOfRange(priority).into());
        }
        let task_type = self
            .store
            .find_task_type(type_name)
            .await?
            .ok_or_else(|| TaskError::UnknownTaskType(type_name.to_string()))?;

        let task = self
            .store
            .insert_task(task_type.id, parent_task_id, input, priority)
            .await?;
        info!(task_id = %task.id, task_type = type_name, priority, "Task enqueued");
        Ok(task)
    }

    /// Claim the highest-priority pending task, if any. The returned task is
    /// already `running` and stamped with `worker_token`.
    pub async fn claim_next(&self, worker_token: &str) -> Result<Option<Task>> {
        let task = self.store.claim_next_task(worker_token).await?;
        if let Some(task) = &task {
            info!(task_id = %task.id, task_type = %task.type_name, worker = worker_token,
                "Task claimed");
        }
        Ok(task)
    }

    /// Move a running task to `completed`, recording its output and latencies.
    pub async fn complete(&self, id: Uuid, output: &Value) -> Result<()> {
        if self.store.complete_task(id, output).await? {
            info!(task_id = %id, "Task completed");
            return Ok(());
        }
        Err(self.transition_error(id, TaskStatus::Completed).await)
    }

    /// Move a running task to `failed`, recording where and why.
    pub async fn fail(&self, id: Uuid, error_module: &str, error_message: &str) -> Result<()> {
        if self.store.fail_task(id, error_module, error_message).await? {
            warn!(task_id = %id, module = error_module, error = error_message, "Task failed");
            return Ok(());
        }
        Err(self.transition_error(id, TaskStatus::Failed).await)
    }

    /// Fail every task and step left non-terminal by a previous process.
    /// Called once at startup, before any worker runs. Returns
    /// (tasks recovered, steps recovered).
    pub async fn recover_orphans(&self) -> Result<(u64, u64)> {
        let steps = self.store.recover_orphan_steps(RECOVERY_MODULE).await?;
        let tasks = self.store.recover_orphan_tasks(RECOVERY_MODULE).await?;
        if tasks > 0 || steps > 0 {
            warn!(tasks, steps, "Recovered orphaned work from previous run");
        }
        Ok((tasks, steps))
    }

    async fn transition_error(&self, id: Uuid, to: TaskStatus) -> Error {
        match self.store.get_task(id).await {
            Ok(Some(task)) => TaskError::InvalidTransition {
                id,
                from: task.status,
                to,
            }
            .into(),
            Ok(None) => TaskError::NotFound { id }.into(),
            Err(e) => e.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::LibSqlStore;
    use serde_json::json;

    async fn queue_with_type() -> TaskQueue {
        let store = LibSqlStore::new_memory().await.unwrap();
        store
            .insert_task_type("answer_generation", "reply to an incoming message")
            .await
            .unwrap();
        TaskQueue::new(Arc::new(store))
    }

    #[tokio::test]
    async fn priority_bounds_are_enforced() {
        let queue = queue_with_type().await;
        for bad in [-0.1, 1.1, f64::NAN] {
            let err = queue
                .enqueue("answer_generation", None, json!({}), bad)
                .await
                .unwrap_err();
            assert!(matches!(
                err,
                Error::Task(TaskError::PriorityOutOfRange(_))
            ));
        }
        // Boundaries are valid.
        queue.enqueue("answer_generation", None, json!({}), 0.0).await.unwrap();
        queue.enqueue("answer_generation", None, json!({}), 1.0).await.unwrap();
    }

    #[tokio::test]
    async fn unknown_type_is_rejected() {
        let queue = queue_with_type().await;
        let err = queue
            .enqueue("reindex_archives", None, json!({}), 0.5)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Task(TaskError::UnknownTaskType(_))));
    }

    #[tokio::test]
    async fn claims_by_priority_then_age() {
        let queue = queue_with_type().await;
        let low = queue.enqueue("answer_generation", None, json!({"n": 1}), 0.2).await.unwrap();
        let high = queue.enqueue("answer_generation", None, json!({"n": 2}), 0.9).await.unwrap();
        let mid_a = queue.enqueue("answer_generation", None, json!({"n": 3}), 0.5).await.unwrap();
        let mid_b = queue.enqueue("answer_generation", None, json!({"n": 4}), 0.5).await.unwrap();

        let order: Vec<Uuid> = [
            queue.claim_next("w").await.unwrap().unwrap().id,
            queue.claim_next("w").await.unwrap().unwrap().id,
            queue.claim_next("w").await.unwrap().unwrap().id,
            queue.claim_next("w").await.unwrap().unwrap().id,
        ]
        .into();
        assert_eq!(order, vec![high.id, mid_a.id, mid_b.id, low.id]);
        assert!(queue.claim_next("w").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn claimed_task_is_running_with_worker_token() {
        let queue = queue_with_type().await;
        queue.enqueue("answer_generation", None, json!({}), 0.5).await.unwrap();

        let task = queue.claim_next("worker-7").await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Running);
        assert_eq!(task.worker_token.as_deref(), Some("worker-7"));
        assert!(task.started_at.is_some());
    }

    #[tokio::test]
    async fn settle_requires_running_state() {
        let queue = queue_with_type().await;
        let task = queue.enqueue("answer_generation", None, json!({}), 0.5).await.unwrap();

        let err = queue.complete(task.id, &json!({})).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Task(TaskError::InvalidTransition { from: TaskStatus::Pending, .. })
        ));

        queue.claim_next("w").await.unwrap().unwrap();
        queue.complete(task.id, &json!({"answer": "ok"})).await.unwrap();

        // Terminal rows never transition again.
        let err = queue.fail(task.id, "m", "late failure").await.unwrap_err();
        assert!(matches!(
            err,
            Error::Task(TaskError::InvalidTransition { from: TaskStatus::Completed, .. })
        ));
    }

    #[tokio::test]
    async fn settling_missing_task_is_not_found() {
        let queue = queue_with_type().await;
        let err = queue.complete(Uuid::new_v4(), &json!({})).await.unwrap_err();
        assert!(matches!(err, Error::Task(TaskError::NotFound { .. })));
    }

    #[tokio::test]
    async fn recovery_fails_interrupted_work() {
        let queue = queue_with_type().await;
        let running = queue.enqueue("answer_generation", None, json!({}), 0.5).await.unwrap();
        let pending = queue.enqueue("answer_generation", None, json!({}), 0.4).await.unwrap();
        queue.claim_next("w").await.unwrap().unwrap();

        let (tasks, steps) = queue.recover_orphans().await.unwrap();
        assert_eq!(tasks, 1);
        assert_eq!(steps, 0);

        let recovered = queue.store.get_task(running.id).await.unwrap().unwrap();
        assert_eq!(recovered.status, TaskStatus::Failed);
        assert_eq!(recovered.error_module.as_deref(), Some(RECOVERY_MODULE));

        // Pending tasks survive recovery untouched.
        let untouched = queue.store.get_task(pending.id).await.unwrap().unwrap();
        assert_eq!(untouched.status, TaskStatus::Pending);
    }
}
