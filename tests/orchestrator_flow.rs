//! End-to-end flows over an in-memory store: claim exclusivity, the full
//! message-to-reply pipeline, and startup recovery.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use uuid::Uuid;

use hearth::config::LlmConfig;
use hearth::error::LlmError;
use hearth::llm::{GenerationOutcome, GenerationRequest, InferenceBackend};
use hearth::orchestrator::{ResponseComposer, Worker};
use hearth::queue::{RECOVERY_MODULE, TaskQueue};
use hearth::session::{ANSWER_TASK_TYPE, SessionManager, bootstrap};
use hearth::steps::StepSequencer;
use hearth::store::types::{ExternalSource, GenerationMetric, TaskStatus};
use hearth::store::{LibSqlStore, Store};
use hearth::vector::DisabledVectorIndex;

/// Backend that answers from a script and records every request it saw.
struct RecordingBackend {
    seen: Mutex<Vec<GenerationRequest>>,
}

impl RecordingBackend {
    fn new() -> Self {
        Self {
            seen: Mutex::new(Vec::new()),
        }
    }

    fn request_sizes(&self) -> Vec<usize> {
        self.seen.lock().unwrap().iter().map(|r| r.messages.len()).collect()
    }
}

#[async_trait]
impl InferenceBackend for RecordingBackend {
    async fn generate(&self, request: GenerationRequest) -> Result<GenerationOutcome, LlmError> {
        let n = {
            let mut seen = self.seen.lock().unwrap();
            seen.push(request);
            seen.len()
        };
        Ok(GenerationOutcome {
            text: format!("reply {n}"),
            reasoning: None,
            metric: GenerationMetric {
                completion_tokens: 5,
                ..Default::default()
            },
        })
    }
}

fn llm_config() -> LlmConfig {
    LlmConfig {
        base_url: "http://localhost:8080".to_string(),
        model: "local".to_string(),
        n_ctx: 8192,
        max_tokens: 1024,
        request_timeout_secs: 60,
    }
}

async fn seeded_store() -> Arc<LibSqlStore> {
    let store = Arc::new(LibSqlStore::new_memory().await.unwrap());
    bootstrap(store.as_ref()).await.unwrap();
    store
}

fn worker_with(store: Arc<LibSqlStore>, backend: Arc<dyn InferenceBackend>, index: usize) -> Worker {
    let composer = ResponseComposer::new(
        store.clone(),
        backend,
        Arc::new(DisabledVectorIndex),
        llm_config(),
        7,
    );
    Worker::new(
        index,
        TaskQueue::new(store),
        Arc::new(composer),
        Duration::from_millis(10),
    )
}

#[tokio::test]
async fn concurrent_claims_are_disjoint() {
    let store = seeded_store().await;
    let queue = Arc::new(TaskQueue::new(store.clone()));

    for i in 0..5 {
        queue
            .enqueue(ANSWER_TASK_TYPE, None, json!({"n": i}), 0.5)
            .await
            .unwrap();
    }

    // More claimants than tasks: every task goes to exactly one claimant.
    let mut handles = Vec::new();
    for i in 0..8 {
        let queue = queue.clone();
        handles.push(tokio::spawn(async move {
            queue.claim_next(&format!("worker-{i}")).await.unwrap()
        }));
    }

    let mut claimed: Vec<Uuid> = Vec::new();
    for handle in handles {
        if let Some(task) = handle.await.unwrap() {
            claimed.push(task.id);
        }
    }
    claimed.sort();
    let before = claimed.len();
    claimed.dedup();
    assert_eq!(before, 5);
    assert_eq!(claimed.len(), 5, "a task was claimed twice");
}

#[tokio::test]
async fn dialogue_grows_the_model_context() {
    let store = seeded_store().await;
    let backend = Arc::new(RecordingBackend::new());
    let worker = worker_with(store.clone(), backend.clone(), 0);

    let mut mgr = SessionManager::new(store.clone(), ExternalSource::Console)
        .await
        .unwrap();
    mgr.link_identity("tty0").await.unwrap();
    mgr.open_session().await.unwrap();

    mgr.save_incoming("first question", 0.5).await.unwrap();
    assert!(worker.tick().await.unwrap());
    mgr.save_incoming("second question", 0.5).await.unwrap();
    assert!(worker.tick().await.unwrap());

    // First call: system prompt + the question. Second call additionally
    // carries the first exchange (question + reply).
    assert_eq!(backend.request_sizes(), vec![2, 4]);
}

#[tokio::test]
async fn replies_are_threaded_and_linked() {
    let store = seeded_store().await;
    let backend = Arc::new(RecordingBackend::new());
    let worker = worker_with(store.clone(), backend, 0);

    let mut mgr = SessionManager::new(store.clone(), ExternalSource::Console)
        .await
        .unwrap();
    mgr.link_identity("tty0").await.unwrap();
    mgr.open_session().await.unwrap();

    let (message, task) = mgr.save_incoming("hello there", 0.5).await.unwrap();
    assert!(worker.tick().await.unwrap());

    let task = store.get_task(task.id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert!(task.run_latency.is_some());

    let output = task.output.unwrap();
    let reply_id = Uuid::parse_str(output["reply_id"].as_str().unwrap()).unwrap();
    let reply = store.get_message(reply_id).await.unwrap().unwrap();
    assert_eq!(reply.parent_id, Some(message.id));
    assert!(reply.step_id.is_some());
    assert!(reply.llm_metric_id.is_some());

    let steps = store.list_steps(task.id).await.unwrap();
    assert_eq!(steps.len(), 3);
    assert!(steps.iter().all(|s| s.status == TaskStatus::Completed));
    assert!(steps.iter().all(|s| s.task_type_name == ANSWER_TASK_TYPE));
}

#[tokio::test]
async fn restart_recovery_settles_interrupted_work() {
    let store = seeded_store().await;
    let queue = TaskQueue::new(store.clone());
    let steps = StepSequencer::new(store.clone());

    // A task mid-flight with an open step, plus one still pending.
    let interrupted = queue
        .enqueue(ANSWER_TASK_TYPE, None, json!({}), 0.8)
        .await
        .unwrap();
    let pending = queue
        .enqueue(ANSWER_TASK_TYPE, None, json!({}), 0.3)
        .await
        .unwrap();
    queue.claim_next("w-before-crash").await.unwrap().unwrap();
    let open_step = steps
        .append_step(interrupted.id, "generate_answer", None, json!({}))
        .await
        .unwrap();

    // "Restart".
    let (tasks, step_count) = queue.recover_orphans().await.unwrap();
    assert_eq!((tasks, step_count), (1, 1));

    let interrupted = store.get_task(interrupted.id).await.unwrap().unwrap();
    assert_eq!(interrupted.status, TaskStatus::Failed);
    assert_eq!(interrupted.error_module.as_deref(), Some(RECOVERY_MODULE));
    assert!(interrupted.error_timestamp.is_some());

    let open_step = store.get_step(open_step.id).await.unwrap().unwrap();
    assert_eq!(open_step.status, TaskStatus::Failed);
    assert_eq!(open_step.error_module.as_deref(), Some(RECOVERY_MODULE));

    // Pending work survives and is immediately claimable again.
    let pending = store.get_task(pending.id).await.unwrap().unwrap();
    assert_eq!(pending.status, TaskStatus::Pending);
    let next = queue.claim_next("w-after-restart").await.unwrap().unwrap();
    assert_eq!(next.id, pending.id);
}

#[tokio::test]
async fn stale_sessions_close_on_startup() {
    let store = seeded_store().await;
    let mut mgr = SessionManager::new(store.clone(), ExternalSource::Console)
        .await
        .unwrap();
    mgr.link_identity("tty0").await.unwrap();
    let session_id = mgr.open_session().await.unwrap().id;

    // Process dies without close(); next startup sweeps the session.
    let closed = store.close_stale_sessions().await.unwrap();
    assert_eq!(closed, 1);
    let session = store.get_session(session_id).await.unwrap().unwrap();
    assert!(session.closed_at.is_some());

    // Second sweep finds nothing.
    assert_eq!(store.close_stale_sessions().await.unwrap(), 0);
}

#[tokio::test]
async fn priority_round_trips_exactly() {
    let store = seeded_store().await;
    let queue = TaskQueue::new(store.clone());
    for priority in [0.0, 0.25, 0.5, 0.75, 1.0] {
        let task = queue
            .enqueue(ANSWER_TASK_TYPE, None, json!({}), priority)
            .await
            .unwrap();
        let stored = store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(stored.priority, priority);
    }
}
