//! Unified `Store` trait — single async interface for all persistence.
//!
//! The durable store is the only coordination medium between workers, so
//! everything that must be atomic (the task claim, terminal transitions,
//! the reasoning link) is expressed as one guarded statement behind this
//! trait rather than as read-modify-write in the callers.

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::store::types::{
    Actor, ActorKind, EmbeddingMetric, ExternalIdentity, ExternalSource, GenerationMetric,
    Message, NewMessage, Prompt, PromptStatus, Reasoning, ReasoningKind, Room, Session, Step,
    StepType, Task, TaskType,
};

/// Backend-agnostic persistence trait covering all four schema partitions:
/// actors/identities, dialogue, orchestration, and call metrics.
#[async_trait]
pub trait Store: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    // ── Actors & identities ─────────────────────────────────────────

    /// Insert a new actor.
    async fn insert_actor(
        &self,
        kind: ActorKind,
        access: bool,
        verified: bool,
        settings: serde_json::Value,
    ) -> Result<Actor, DatabaseError>;

    /// Get an actor by ID.
    async fn get_actor(&self, id: Uuid) -> Result<Option<Actor>, DatabaseError>;

    /// Find the oldest actor of a given kind.
    async fn find_actor_by_kind(&self, kind: ActorKind) -> Result<Option<Actor>, DatabaseError>;

    /// Look up an external identity by its `(source, external_id)` pair.
    async fn find_identity(
        &self,
        source: ExternalSource,
        external_id: &str,
    ) -> Result<Option<ExternalIdentity>, DatabaseError>;

    /// Bind an external identity to an actor.
    /// Fails with `Constraint` if the `(source, external_id)` pair exists.
    async fn insert_identity(
        &self,
        actor_id: Uuid,
        source: ExternalSource,
        external_id: &str,
        authorized: bool,
    ) -> Result<ExternalIdentity, DatabaseError>;

    /// Whether the actor already has any identity bound for this source.
    async fn actor_has_identity(
        &self,
        actor_id: Uuid,
        source: ExternalSource,
    ) -> Result<bool, DatabaseError>;

    // ── Rooms ───────────────────────────────────────────────────────

    /// Create a room. Fails with `Constraint` on a duplicate name.
    async fn insert_room(&self, name: &str) -> Result<Room, DatabaseError>;

    /// Find a room by name, regardless of status.
    async fn find_room(&self, name: &str) -> Result<Option<Room>, DatabaseError>;

    /// Soft-retire a room.
    async fn retire_room(&self, id: Uuid) -> Result<(), DatabaseError>;

    // ── Sessions ────────────────────────────────────────────────────

    /// Open a new session for an actor.
    async fn insert_session(
        &self,
        actor_id: Uuid,
        external_identity_id: Option<Uuid>,
        room_id: Uuid,
    ) -> Result<Session, DatabaseError>;

    /// Get a session by ID.
    async fn get_session(&self, id: Uuid) -> Result<Option<Session>, DatabaseError>;

    /// Bump `updated_at` and record the last-used room.
    async fn touch_session(&self, id: Uuid, room_id: Uuid) -> Result<(), DatabaseError>;

    /// Close a session (`active -> completed`, stamps `closed_at`).
    async fn close_session(&self, id: Uuid) -> Result<(), DatabaseError>;

    /// Close every session still marked active (startup sweep after a crash).
    /// Returns the number of sessions closed.
    async fn close_stale_sessions(&self) -> Result<u64, DatabaseError>;

    // ── Messages ────────────────────────────────────────────────────

    /// Append a message to the dialogue log.
    async fn insert_message(&self, msg: NewMessage) -> Result<Message, DatabaseError>;

    /// Get a message by ID.
    async fn get_message(&self, id: Uuid) -> Result<Option<Message>, DatabaseError>;

    /// Back-fill the normalized text of a message.
    async fn set_message_normalized(&self, id: Uuid, text: &str) -> Result<(), DatabaseError>;

    /// The most recent `window` messages authored by `actor_id` within
    /// `(session_id, room_id)`, plus every agent message that is a direct
    /// reply to one of them, ordered ascending by time. `exclude` removes
    /// the in-flight message from its own context.
    async fn recent_exchange(
        &self,
        session_id: Uuid,
        room_id: Uuid,
        actor_id: Uuid,
        window: usize,
        exclude: Option<Uuid>,
    ) -> Result<Vec<Message>, DatabaseError>;

    // ── Task dictionaries ───────────────────────────────────────────

    /// Register a task type. Fails with `Constraint` on a duplicate name.
    async fn insert_task_type(&self, name: &str, description: &str)
    -> Result<TaskType, DatabaseError>;

    async fn find_task_type(&self, name: &str) -> Result<Option<TaskType>, DatabaseError>;

    /// Register a step type. Fails with `Constraint` on a duplicate name.
    async fn insert_step_type(&self, name: &str, description: &str)
    -> Result<StepType, DatabaseError>;

    async fn find_step_type(&self, name: &str) -> Result<Option<StepType>, DatabaseError>;

    // ── Tasks ───────────────────────────────────────────────────────

    /// Insert a pending task.
    async fn insert_task(
        &self,
        task_type_id: Uuid,
        parent_task_id: Option<Uuid>,
        input: serde_json::Value,
        priority: f64,
    ) -> Result<Task, DatabaseError>;

    /// Get a task by ID (with its type name joined in).
    async fn get_task(&self, id: Uuid) -> Result<Option<Task>, DatabaseError>;

    /// Atomically claim the next pending task: highest priority first, then
    /// oldest creation time. Stamps `running`, `started_at`, and the caller's
    /// owner token in one compare-and-swap statement so concurrent claimers
    /// each get a distinct task or none.
    async fn claim_next_task(&self, worker_token: &str) -> Result<Option<Task>, DatabaseError>;

    /// `running -> completed` with output and latencies.
    /// Returns false when the task was not in `running`.
    async fn complete_task(
        &self,
        id: Uuid,
        output: &serde_json::Value,
    ) -> Result<bool, DatabaseError>;

    /// `running -> failed` with error fields and latencies.
    /// Returns false when the task was not in `running`.
    async fn fail_task(
        &self,
        id: Uuid,
        error_module: &str,
        error_message: &str,
    ) -> Result<bool, DatabaseError>;

    /// Force-fail every task left in `running` (crash recovery).
    /// Returns the number of tasks failed.
    async fn recover_orphan_tasks(&self, error_module: &str) -> Result<u64, DatabaseError>;

    /// Force-fail every step left in `pending`/`running` (crash recovery).
    /// Returns the number of steps failed.
    async fn recover_orphan_steps(&self, error_module: &str) -> Result<u64, DatabaseError>;

    // ── Steps ───────────────────────────────────────────────────────

    /// Insert a step with an explicit step number, denormalizing the step
    /// name and the owning task's type name into the row. Fails with
    /// `Constraint` when `(task_id, step_number)` already exists.
    async fn insert_step(
        &self,
        task_id: Uuid,
        step_number: i64,
        step_type_id: Uuid,
        parent_step_id: Option<Uuid>,
        input: serde_json::Value,
    ) -> Result<Step, DatabaseError>;

    /// Highest step number used by a task, or 0 if it has no steps.
    async fn max_step_number(&self, task_id: Uuid) -> Result<i64, DatabaseError>;

    async fn get_step(&self, id: Uuid) -> Result<Option<Step>, DatabaseError>;

    /// All steps of a task in step-number order.
    async fn list_steps(&self, task_id: Uuid) -> Result<Vec<Step>, DatabaseError>;

    /// `pending -> running`. Returns false when the step was not pending.
    async fn start_step(&self, id: Uuid) -> Result<bool, DatabaseError>;

    /// `running -> completed` with output and latency.
    async fn complete_step(
        &self,
        id: Uuid,
        output: &serde_json::Value,
    ) -> Result<bool, DatabaseError>;

    /// `running -> failed` with error fields and latency.
    async fn fail_step(
        &self,
        id: Uuid,
        error_module: &str,
        error_message: &str,
    ) -> Result<bool, DatabaseError>;

    /// Link a reasoning to a step. Returns false when the step already has
    /// one (the linking UPDATE is guarded by `reasoning_id IS NULL`).
    async fn set_step_reasoning(
        &self,
        step_id: Uuid,
        reasoning_id: Uuid,
    ) -> Result<bool, DatabaseError>;

    // ── Reasonings & metrics ────────────────────────────────────────

    /// Persist a captured deliberation.
    async fn insert_reasoning(
        &self,
        step_id: Uuid,
        content: &str,
        kind: ReasoningKind,
    ) -> Result<Reasoning, DatabaseError>;

    /// Back-fill the vector-index point on a reasoning.
    async fn set_reasoning_vector_point(
        &self,
        id: Uuid,
        point_id: &str,
        embedding_metric_id: Option<Uuid>,
    ) -> Result<(), DatabaseError>;

    /// Record a generative call. The store assigns the ID.
    async fn insert_generation_metric(
        &self,
        metric: &GenerationMetric,
    ) -> Result<Uuid, DatabaseError>;

    /// Record an embedding call. The store assigns the ID.
    async fn insert_embedding_metric(
        &self,
        metric: &EmbeddingMetric,
    ) -> Result<Uuid, DatabaseError>;

    // ── Prompts ─────────────────────────────────────────────────────

    /// Register a prompt version. Fails with `Constraint` on a duplicate
    /// `(name, version)`.
    async fn insert_prompt(
        &self,
        name: &str,
        version: i64,
        text: &str,
        params: serde_json::Value,
        status: PromptStatus,
    ) -> Result<Prompt, DatabaseError>;

    /// The active prompt with the highest version for a name.
    async fn active_prompt(&self, name: &str) -> Result<Option<Prompt>, DatabaseError>;
}
