//! Entity records and status machines.
//!
//! Pure data: rows as they exist in the store, plus the status enums with
//! their transition-validation logic. All mutation goes through the
//! coordinator/sequencer APIs, never by writing these structs back directly.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Kind of dialogue participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorKind {
    /// The agent itself. Exactly one exists after bootstrap.
    System,
    /// The privileged human bootstrap identity.
    Owner,
    /// A regular human participant.
    User,
    /// Another agent reaching in from outside.
    ExternalAgent,
}

impl ActorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::Owner => "owner",
            Self::User => "user",
            Self::ExternalAgent => "external_agent",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "system" => Some(Self::System),
            "owner" => Some(Self::Owner),
            "user" => Some(Self::User),
            "external_agent" => Some(Self::ExternalAgent),
            _ => None,
        }
    }
}

impl std::fmt::Display for ActorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A dialogue participant.
#[derive(Debug, Clone)]
pub struct Actor {
    pub id: Uuid,
    pub kind: ActorKind,
    pub access: bool,
    pub verified: bool,
    pub settings: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Front-end a participant arrived through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExternalSource {
    Console,
    VoiceConsole,
    Messenger,
    Rest,
}

impl ExternalSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Console => "console",
            Self::VoiceConsole => "voice_console",
            Self::Messenger => "messenger",
            Self::Rest => "rest",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "console" => Some(Self::Console),
            "voice_console" => Some(Self::VoiceConsole),
            "messenger" => Some(Self::Messenger),
            "rest" => Some(Self::Rest),
            _ => None,
        }
    }
}

impl std::fmt::Display for ExternalSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Mapping from an actor to its identifier in an external front-end.
/// `(source, external_id)` is globally unique.
#[derive(Debug, Clone)]
pub struct ExternalIdentity {
    pub id: Uuid,
    pub actor_id: Uuid,
    pub source: ExternalSource,
    pub external_id: String,
    pub authorized: bool,
    pub created_at: DateTime<Utc>,
}

/// Room lifecycle. Rooms are soft-retired, never hard-deleted while referenced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomStatus {
    Active,
    Retired,
}

impl RoomStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Retired => "retired",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Self::Active),
            "retired" => Some(Self::Retired),
            _ => None,
        }
    }
}

/// A named topical partition of dialogue.
#[derive(Debug, Clone)]
pub struct Room {
    pub id: Uuid,
    pub name: String,
    pub status: RoomStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Active,
    Completed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Completed => "completed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Self::Active),
            "completed" => Some(Self::Completed),
            _ => None,
        }
    }
}

/// One continuous interaction between an actor and the agent.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: Uuid,
    pub actor_id: Uuid,
    pub external_identity_id: Option<Uuid>,
    pub status: SessionStatus,
    pub last_room_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

/// One turn in a dialogue.
///
/// Immutable once written except `normalized_text`, `step_id`, and
/// `llm_metric_id`, which are back-filled asynchronously.
#[derive(Debug, Clone)]
pub struct Message {
    pub id: Uuid,
    pub parent_id: Option<Uuid>,
    pub actor_id: Uuid,
    /// Denormalized from Actor for fast filtering.
    pub actor_kind: ActorKind,
    pub session_id: Uuid,
    pub room_id: Uuid,
    pub text: String,
    pub normalized_text: Option<String>,
    pub token_count: i64,
    /// Seconds between this message and its parent, for agent replies.
    pub answer_latency: Option<f64>,
    pub step_id: Option<Uuid>,
    pub llm_metric_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

/// Fields for inserting a new message; the store assigns id and timestamp.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub parent_id: Option<Uuid>,
    pub actor_id: Uuid,
    pub actor_kind: ActorKind,
    pub session_id: Uuid,
    pub room_id: Uuid,
    pub text: String,
    pub token_count: i64,
    pub answer_latency: Option<f64>,
    pub step_id: Option<Uuid>,
    pub llm_metric_id: Option<Uuid>,
}

/// Status shared by tasks and steps.
///
/// Transitions are only `pending -> running -> {completed|failed}`; terminal
/// states are final and there is no automatic retry path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

/// Steps run the same state machine as tasks.
pub type StepStatus = TaskStatus;

impl TaskStatus {
    pub fn can_transition_to(&self, target: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, target),
            (Pending, Running) | (Running, Completed) | (Running, Failed)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Dictionary entry describing a kind of task. Append-only once referenced.
#[derive(Debug, Clone)]
pub struct TaskType {
    pub id: Uuid,
    pub name: String,
    pub description: String,
}

/// Dictionary entry describing a kind of step. Append-only once referenced.
#[derive(Debug, Clone)]
pub struct StepType {
    pub id: Uuid,
    pub name: String,
    pub description: String,
}

/// A unit of asynchronous work.
#[derive(Debug, Clone)]
pub struct Task {
    pub id: Uuid,
    pub task_type_id: Uuid,
    /// Joined from the dictionary at read time for dispatch.
    pub type_name: String,
    pub parent_task_id: Option<Uuid>,
    pub input: serde_json::Value,
    pub output: Option<serde_json::Value>,
    pub priority: f64,
    pub status: TaskStatus,
    /// Owner token stamped by the claiming worker.
    pub worker_token: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Seconds from start to completion.
    pub run_latency: Option<f64>,
    /// Seconds from creation to completion.
    pub total_latency: Option<f64>,
    pub error_module: Option<String>,
    pub error_message: Option<String>,
    pub error_timestamp: Option<DateTime<Utc>>,
}

/// An ordered phase within a task.
///
/// `step_name` and `task_type_name` are copied from the dictionaries at
/// creation time and never re-derived, so history stays stable.
#[derive(Debug, Clone)]
pub struct Step {
    pub id: Uuid,
    pub task_id: Uuid,
    pub step_number: i64,
    pub step_type_id: Uuid,
    pub step_name: String,
    pub task_type_name: String,
    pub parent_step_id: Option<Uuid>,
    pub status: StepStatus,
    pub input: serde_json::Value,
    pub output: Option<serde_json::Value>,
    pub reasoning_id: Option<Uuid>,
    /// Seconds from creation to completion.
    pub latency: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_module: Option<String>,
    pub error_message: Option<String>,
    pub error_timestamp: Option<DateTime<Utc>>,
}

/// Where a captured deliberation came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReasoningKind {
    /// Produced while answering dialogue.
    Dialogue,
    /// Produced during self-reflection.
    Reflection,
}

impl ReasoningKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Dialogue => "dialogue",
            Self::Reflection => "reflection",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "dialogue" => Some(Self::Dialogue),
            "reflection" => Some(Self::Reflection),
            _ => None,
        }
    }
}

/// Captured internal deliberation text tied to a step.
#[derive(Debug, Clone)]
pub struct Reasoning {
    pub id: Uuid,
    pub step_id: Uuid,
    pub content: String,
    pub kind: ReasoningKind,
    pub vector_point_id: Option<String>,
    pub embedding_metric_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

/// One record per generative inference call. Immutable once written.
#[derive(Debug, Clone, Default)]
pub struct GenerationMetric {
    pub id: Uuid,
    pub step_id: Option<Uuid>,
    pub prompt_id: Option<Uuid>,
    pub host: String,
    pub model: String,
    pub params: serde_json::Value,
    pub cache_tokens: i64,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub total_tokens: i64,
    pub host_ctx: i64,
    pub prompt_ms: f64,
    pub prompt_per_token_ms: f64,
    pub prompt_per_second: f64,
    pub predicted_per_second: f64,
    pub response_secs: f64,
    pub net_latency_secs: f64,
    pub total_secs: f64,
    pub error_status: bool,
    pub error_message: Option<String>,
}

/// One record per embedding call. Immutable once written.
#[derive(Debug, Clone, Default)]
pub struct EmbeddingMetric {
    pub id: Uuid,
    pub step_id: Option<Uuid>,
    pub host: String,
    pub model: String,
    pub tokens: i64,
    pub duration_ms: f64,
    pub error_status: bool,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptStatus {
    Draft,
    Active,
    Retired,
}

impl PromptStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Active => "active",
            Self::Retired => "retired",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "draft" => Some(Self::Draft),
            "active" => Some(Self::Active),
            "retired" => Some(Self::Retired),
            _ => None,
        }
    }
}

/// A named, versioned system prompt with its generation parameters.
/// `(name, version)` is unique.
#[derive(Debug, Clone)]
pub struct Prompt {
    pub id: Uuid,
    pub name: String,
    pub version: i64,
    pub text: String,
    pub params: serde_json::Value,
    pub status: PromptStatus,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_machine_allows_only_forward_transitions() {
        use TaskStatus::*;
        assert!(Pending.can_transition_to(Running));
        assert!(Running.can_transition_to(Completed));
        assert!(Running.can_transition_to(Failed));

        assert!(!Pending.can_transition_to(Completed));
        assert!(!Pending.can_transition_to(Failed));
        assert!(!Completed.can_transition_to(Running));
        assert!(!Failed.can_transition_to(Pending));
        assert!(!Failed.can_transition_to(Running));
        assert!(!Running.can_transition_to(Pending));
    }

    #[test]
    fn terminal_states_are_terminal() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
    }

    #[test]
    fn status_round_trips_through_strings() {
        for s in [
            TaskStatus::Pending,
            TaskStatus::Running,
            TaskStatus::Completed,
            TaskStatus::Failed,
        ] {
            assert_eq!(TaskStatus::parse(s.as_str()), Some(s));
        }
        assert_eq!(TaskStatus::parse("cancelled"), None);
    }

    #[test]
    fn actor_kind_strings() {
        assert_eq!(ActorKind::parse("system"), Some(ActorKind::System));
        assert_eq!(ActorKind::parse("owner"), Some(ActorKind::Owner));
        assert_eq!(ActorKind::System.to_string(), "system");
        assert_eq!(ActorKind::parse("robot"), None);
    }
}
