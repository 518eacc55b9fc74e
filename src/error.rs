//! Error types for hearth.

use uuid::Uuid;

use crate::store::types::{StepStatus, TaskStatus};

/// Top-level error type for the agent core.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Task error: {0}")]
    Task(#[from] TaskError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Task/step orchestration errors.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("Task {id} not found")]
    NotFound { id: Uuid },

    #[error("Task {id} cannot transition {from} -> {to}")]
    InvalidTransition {
        id: Uuid,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("Step {id} cannot transition {from} -> {to}")]
    InvalidStepTransition {
        id: Uuid,
        from: StepStatus,
        to: StepStatus,
    },

    #[error("Priority {0} outside [0.0, 1.0]")]
    PriorityOutOfRange(f64),

    #[error("Step {step_id} already has a reasoning attached")]
    ReasoningAlreadyAttached { step_id: Uuid },

    #[error("Unknown task type: {0}")]
    UnknownTaskType(String),

    #[error("Unknown step type: {0}")]
    UnknownStepType(String),

    #[error("Task {id} input is malformed: {reason}")]
    BadInput { id: Uuid, reason: String },
}

/// Session/actor lifecycle errors.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Room '{0}' not found or retired")]
    RoomNotFound(String),

    #[error("No actor linked for this manager; call link_identity() first")]
    ActorNotLinked,

    #[error("Session already active: {0}")]
    AlreadyActive(Uuid),

    #[error("No active session; call open_session() first")]
    NoActiveSession,

    #[error("Bootstrap incomplete: {0}")]
    BootstrapIncomplete(String),
}

/// Inference backend errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Backend request failed: {0}")]
    RequestFailed(String),

    #[error("Backend returned HTTP {status}: {body}")]
    HttpStatus { status: u16, body: String },

    #[error("Invalid response from backend: {0}")]
    InvalidResponse(String),

    #[error("Request timed out after {0} seconds")]
    Timeout(u64),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for the agent core.
pub type Result<T> = std::result::Result<T, Error>;
