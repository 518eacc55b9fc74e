//! Task workers.
//!
//! Each worker polls the queue, claims one task at a time under its own
//! token, and dispatches by task type. A handler error fails the task; the
//! worker itself keeps running.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::orchestrator::composer::{COMPOSER_MODULE, ResponseComposer};
use crate::queue::TaskQueue;
use crate::session::ANSWER_TASK_TYPE;
use crate::store::types::Task;

pub struct Worker {
    token: String,
    queue: TaskQueue,
    composer: Arc<ResponseComposer>,
    poll_interval: Duration,
}

impl Worker {
    pub fn new(
        index: usize,
        queue: TaskQueue,
        composer: Arc<ResponseComposer>,
        poll_interval: Duration,
    ) -> Self {
        // Unique per process lifetime, so a restarted process never matches
        // tokens stamped by its previous incarnation.
        let token = format!("worker-{index}-{}", Uuid::new_v4());
        Self {
            token,
            queue,
            composer,
            poll_interval,
        }
    }

    /// Poll until `shutdown` flips to true.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(worker = %self.token, "Worker started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            match self.tick().await {
                Ok(true) => {} // worked; immediately look for more
                Ok(false) => {
                    tokio::select! {
                        _ = tokio::time::sleep(self.poll_interval) => {}
                        _ = shutdown.changed() => {}
                    }
                }
                Err(e) => {
                    error!(worker = %self.token, error = %e, "Worker iteration failed");
                    tokio::time::sleep(self.poll_interval).await;
                }
            }
        }
        info!(worker = %self.token, "Worker stopped");
    }

    /// Claim and process at most one task. Returns whether a task was found.
    pub async fn tick(&self) -> Result<bool> {
        let Some(task) = self.queue.claim_next(&self.token).await? else {
            return Ok(false);
        };
        self.dispatch(task).await?;
        Ok(true)
    }

    async fn dispatch(&self, task: Task) -> Result<()> {
        match task.type_name.as_str() {
            ANSWER_TASK_TYPE => match self.composer.handle(&task).await {
                Ok(output) => self.queue.complete(task.id, &output).await,
                Err(e) => {
                    warn!(task_id = %task.id, error = %e, "Answer task failed");
                    self.queue.fail(task.id, COMPOSER_MODULE, &e.to_string()).await
                }
            },
            other => {
                // A claimed task must settle; an unroutable type fails here
                // rather than sitting in `running` forever.
                self.queue
                    .fail(task.id, "worker", &format!("no handler for task type '{other}'"))
                    .await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LlmConfig;
    use crate::error::LlmError;
    use crate::llm::{GenerationOutcome, GenerationRequest, InferenceBackend};
    use crate::session::{SessionManager, bootstrap};
    use crate::store::types::{ExternalSource, GenerationMetric, TaskStatus};
    use crate::store::{LibSqlStore, Store};
    use crate::vector::DisabledVectorIndex;
    use async_trait::async_trait;
    use serde_json::json;

    struct EchoBackend;

    #[async_trait]
    impl InferenceBackend for EchoBackend {
        async fn generate(
            &self,
            _request: GenerationRequest,
        ) -> std::result::Result<GenerationOutcome, LlmError> {
            Ok(GenerationOutcome {
                text: "ok".to_string(),
                reasoning: None,
                metric: GenerationMetric::default(),
            })
        }
    }

    async fn worker_over(store: Arc<LibSqlStore>) -> Worker {
        let composer = ResponseComposer::new(
            store.clone(),
            Arc::new(EchoBackend),
            Arc::new(DisabledVectorIndex),
            LlmConfig {
                base_url: "http://localhost:8080".to_string(),
                model: "local".to_string(),
                n_ctx: 8192,
                max_tokens: 1024,
                request_timeout_secs: 60,
            },
            7,
        );
        Worker::new(
            0,
            TaskQueue::new(store.clone()),
            Arc::new(composer),
            Duration::from_millis(10),
        )
    }

    #[tokio::test]
    async fn empty_queue_ticks_idle() {
        let store = Arc::new(LibSqlStore::new_memory().await.unwrap());
        bootstrap(store.as_ref()).await.unwrap();
        let worker = worker_over(store).await;
        assert!(!worker.tick().await.unwrap());
    }

    #[tokio::test]
    async fn answer_task_runs_to_completion() {
        let store = Arc::new(LibSqlStore::new_memory().await.unwrap());
        bootstrap(store.as_ref()).await.unwrap();

        let mut mgr = SessionManager::new(store.clone(), ExternalSource::Console)
            .await
            .unwrap();
        mgr.link_identity("tty0").await.unwrap();
        mgr.open_session().await.unwrap();
        let (message, task) = mgr.save_incoming("hello", 0.5).await.unwrap();

        let worker = worker_over(store.clone()).await;
        assert!(worker.tick().await.unwrap());

        let task = store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        let output = task.output.unwrap();
        assert_eq!(output["message_id"], json!(message.id));
    }

    #[tokio::test]
    async fn unroutable_type_settles_as_failed() {
        let store = Arc::new(LibSqlStore::new_memory().await.unwrap());
        bootstrap(store.as_ref()).await.unwrap();
        store
            .insert_task_type("nightly_reflection", "not yet handled")
            .await
            .unwrap();

        let queue = TaskQueue::new(store.clone());
        let task = queue
            .enqueue("nightly_reflection", None, json!({}), 0.9)
            .await
            .unwrap();

        let worker = worker_over(store.clone()).await;
        assert!(worker.tick().await.unwrap());

        let task = store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.error_module.as_deref(), Some("worker"));
    }
}
