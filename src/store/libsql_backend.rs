//! libSQL backend — async `Store` trait implementation.
//!
//! Supports local file and in-memory databases. The claim path and every
//! terminal transition are single guarded UPDATE statements, which is what
//! lets the table double as a work queue: SQLite serializes writers, so a
//! compare-and-swap on the status column gives at-most-one-claimant without
//! any application-level lock.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::info;
use uuid::Uuid;

use crate::AGENT_VERSION;
use crate::error::DatabaseError;
use crate::store::migrations;
use crate::store::traits::Store;
use crate::store::types::{
    Actor, ActorKind, EmbeddingMetric, ExternalIdentity, ExternalSource, GenerationMetric,
    Message, NewMessage, Prompt, PromptStatus, Reasoning, ReasoningKind, Room, RoomStatus,
    Session, SessionStatus, Step, StepType, Task, TaskStatus, TaskType,
};

/// libSQL store backend.
///
/// Holds a single connection reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlStore {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlStore {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let store = Self::from_database(db).await?;
        info!(path = %path.display(), "Database opened");
        Ok(store)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to create in-memory database: {e}")))?;
        Self::from_database(db).await
    }

    async fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        conn.execute("PRAGMA foreign_keys = ON", ())
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to enable foreign keys: {e}")))?;

        let store = Self {
            db: Arc::new(db),
            conn,
        };
        store.run_migrations().await?;
        Ok(store)
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Canonical timestamp write format: RFC 3339 UTC with microseconds.
/// Fixed width, so lexicographic ORDER BY equals chronological order, and
/// SQLite's julianday() can parse it for latency math.
fn now_str() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: Option<String>) -> Option<DateTime<Utc>> {
    s.map(|s| parse_datetime(&s))
}

fn parse_uuid(s: &str) -> Uuid {
    Uuid::parse_str(s).unwrap_or_else(|_| Uuid::nil())
}

fn parse_optional_uuid(s: Option<String>) -> Option<Uuid> {
    s.map(|s| parse_uuid(&s))
}

fn parse_json(s: &str) -> serde_json::Value {
    serde_json::from_str(s).unwrap_or(serde_json::Value::Null)
}

/// Classify libsql write errors so constraint violations surface as their
/// own variant (callers distinguish "pick another value" from "store broke").
fn map_db_err(e: libsql::Error) -> DatabaseError {
    let msg = e.to_string();
    if msg.contains("UNIQUE constraint failed") || msg.contains("constraint failed") {
        DatabaseError::Constraint(msg)
    } else {
        DatabaseError::Query(msg)
    }
}

// ── Row mappers ─────────────────────────────────────────────────────

const ACTOR_COLUMNS: &str = "id, kind, access, verified, settings, created_at";

fn row_to_actor(row: &libsql::Row) -> Result<Actor, libsql::Error> {
    let id: String = row.get(0)?;
    let kind: String = row.get(1)?;
    let access: i64 = row.get(2)?;
    let verified: i64 = row.get(3)?;
    let settings: String = row.get(4)?;
    let created: String = row.get(5)?;
    Ok(Actor {
        id: parse_uuid(&id),
        kind: ActorKind::parse(&kind).unwrap_or(ActorKind::User),
        access: access != 0,
        verified: verified != 0,
        settings: parse_json(&settings),
        created_at: parse_datetime(&created),
    })
}

const IDENTITY_COLUMNS: &str = "id, actor_id, source, external_id, authorized, created_at";

fn row_to_identity(row: &libsql::Row) -> Result<ExternalIdentity, libsql::Error> {
    let id: String = row.get(0)?;
    let actor_id: String = row.get(1)?;
    let source: String = row.get(2)?;
    let external_id: String = row.get(3)?;
    let authorized: i64 = row.get(4)?;
    let created: String = row.get(5)?;
    Ok(ExternalIdentity {
        id: parse_uuid(&id),
        actor_id: parse_uuid(&actor_id),
        source: ExternalSource::parse(&source).unwrap_or(ExternalSource::Console),
        external_id,
        authorized: authorized != 0,
        created_at: parse_datetime(&created),
    })
}

fn row_to_room(row: &libsql::Row) -> Result<Room, libsql::Error> {
    let id: String = row.get(0)?;
    let name: String = row.get(1)?;
    let status: String = row.get(2)?;
    let created: String = row.get(3)?;
    Ok(Room {
        id: parse_uuid(&id),
        name,
        status: RoomStatus::parse(&status).unwrap_or(RoomStatus::Active),
        created_at: parse_datetime(&created),
    })
}

const SESSION_COLUMNS: &str =
    "id, actor_id, external_identity_id, status, last_room_id, created_at, updated_at, closed_at";

fn row_to_session(row: &libsql::Row) -> Result<Session, libsql::Error> {
    let id: String = row.get(0)?;
    let actor_id: String = row.get(1)?;
    let identity: Option<String> = row.get(2).ok();
    let status: String = row.get(3)?;
    let last_room: Option<String> = row.get(4).ok();
    let created: String = row.get(5)?;
    let updated: String = row.get(6)?;
    let closed: Option<String> = row.get(7).ok();
    Ok(Session {
        id: parse_uuid(&id),
        actor_id: parse_uuid(&actor_id),
        external_identity_id: parse_optional_uuid(identity),
        status: SessionStatus::parse(&status).unwrap_or(SessionStatus::Active),
        last_room_id: parse_optional_uuid(last_room),
        created_at: parse_datetime(&created),
        updated_at: parse_datetime(&updated),
        closed_at: parse_optional_datetime(closed),
    })
}

const MESSAGE_COLUMNS: &str = "id, parent_id, actor_id, actor_kind, session_id, room_id, \
     text, normalized_text, token_count, answer_latency, step_id, llm_metric_id, created_at";

fn row_to_message(row: &libsql::Row) -> Result<Message, libsql::Error> {
    let id: String = row.get(0)?;
    let parent: Option<String> = row.get(1).ok();
    let actor_id: String = row.get(2)?;
    let actor_kind: String = row.get(3)?;
    let session_id: String = row.get(4)?;
    let room_id: String = row.get(5)?;
    let text: String = row.get(6)?;
    let normalized: Option<String> = row.get(7).ok();
    let token_count: i64 = row.get(8)?;
    let answer_latency: Option<f64> = row.get(9).ok();
    let step_id: Option<String> = row.get(10).ok();
    let metric_id: Option<String> = row.get(11).ok();
    let created: String = row.get(12)?;
    Ok(Message {
        id: parse_uuid(&id),
        parent_id: parse_optional_uuid(parent),
        actor_id: parse_uuid(&actor_id),
        actor_kind: ActorKind::parse(&actor_kind).unwrap_or(ActorKind::User),
        session_id: parse_uuid(&session_id),
        room_id: parse_uuid(&room_id),
        text,
        normalized_text: normalized,
        token_count,
        answer_latency,
        step_id: parse_optional_uuid(step_id),
        llm_metric_id: parse_optional_uuid(metric_id),
        created_at: parse_datetime(&created),
    })
}

/// Task columns, `type_name` joined from `task_types`.
const TASK_COLUMNS: &str = "t.id, t.task_type_id, tt.name, t.parent_task_id, t.input, t.output, \
     t.priority, t.status, t.worker_token, t.created_at, t.started_at, t.completed_at, \
     t.run_latency, t.total_latency, t.error_module, t.error_message, t.error_timestamp";

fn row_to_task(row: &libsql::Row) -> Result<Task, libsql::Error> {
    let id: String = row.get(0)?;
    let type_id: String = row.get(1)?;
    let type_name: String = row.get(2)?;
    let parent: Option<String> = row.get(3).ok();
    let input: String = row.get(4)?;
    let output: Option<String> = row.get(5).ok();
    let priority: f64 = row.get(6)?;
    let status: String = row.get(7)?;
    let worker_token: Option<String> = row.get(8).ok();
    let created: String = row.get(9)?;
    let started: Option<String> = row.get(10).ok();
    let completed: Option<String> = row.get(11).ok();
    let run_latency: Option<f64> = row.get(12).ok();
    let total_latency: Option<f64> = row.get(13).ok();
    let error_module: Option<String> = row.get(14).ok();
    let error_message: Option<String> = row.get(15).ok();
    let error_ts: Option<String> = row.get(16).ok();
    Ok(Task {
        id: parse_uuid(&id),
        task_type_id: parse_uuid(&type_id),
        type_name,
        parent_task_id: parse_optional_uuid(parent),
        input: parse_json(&input),
        output: output.map(|s| parse_json(&s)),
        priority,
        status: TaskStatus::parse(&status).unwrap_or(TaskStatus::Pending),
        worker_token,
        created_at: parse_datetime(&created),
        started_at: parse_optional_datetime(started),
        completed_at: parse_optional_datetime(completed),
        run_latency,
        total_latency,
        error_module,
        error_message,
        error_timestamp: parse_optional_datetime(error_ts),
    })
}

const STEP_COLUMNS: &str = "id, task_id, step_number, step_type_id, step_name, task_type_name, \
     parent_step_id, status, input, output, reasoning_id, latency, created_at, started_at, \
     completed_at, error_module, error_message, error_timestamp";

fn row_to_step(row: &libsql::Row) -> Result<Step, libsql::Error> {
    let id: String = row.get(0)?;
    let task_id: String = row.get(1)?;
    let step_number: i64 = row.get(2)?;
    let step_type_id: String = row.get(3)?;
    let step_name: String = row.get(4)?;
    let task_type_name: String = row.get(5)?;
    let parent: Option<String> = row.get(6).ok();
    let status: String = row.get(7)?;
    let input: String = row.get(8)?;
    let output: Option<String> = row.get(9).ok();
    let reasoning: Option<String> = row.get(10).ok();
    let latency: Option<f64> = row.get(11).ok();
    let created: String = row.get(12)?;
    let started: Option<String> = row.get(13).ok();
    let completed: Option<String> = row.get(14).ok();
    let error_module: Option<String> = row.get(15).ok();
    let error_message: Option<String> = row.get(16).ok();
    let error_ts: Option<String> = row.get(17).ok();
    Ok(Step {
        id: parse_uuid(&id),
        task_id: parse_uuid(&task_id),
        step_number,
        step_type_id: parse_uuid(&step_type_id),
        step_name,
        task_type_name,
        parent_step_id: parse_optional_uuid(parent),
        status: TaskStatus::parse(&status).unwrap_or(TaskStatus::Pending),
        input: parse_json(&input),
        output: output.map(|s| parse_json(&s)),
        reasoning_id: parse_optional_uuid(reasoning),
        latency,
        created_at: parse_datetime(&created),
        started_at: parse_optional_datetime(started),
        completed_at: parse_optional_datetime(completed),
        error_module,
        error_message,
        error_timestamp: parse_optional_datetime(error_ts),
    })
}

fn row_to_reasoning(row: &libsql::Row) -> Result<Reasoning, libsql::Error> {
    let id: String = row.get(0)?;
    let step_id: String = row.get(1)?;
    let content: String = row.get(2)?;
    let kind: String = row.get(3)?;
    let vector_point: Option<String> = row.get(4).ok();
    let embedding_metric: Option<String> = row.get(5).ok();
    let created: String = row.get(6)?;
    Ok(Reasoning {
        id: parse_uuid(&id),
        step_id: parse_uuid(&step_id),
        content,
        kind: ReasoningKind::parse(&kind).unwrap_or(ReasoningKind::Dialogue),
        vector_point_id: vector_point,
        embedding_metric_id: parse_optional_uuid(embedding_metric),
        created_at: parse_datetime(&created),
    })
}

fn row_to_prompt(row: &libsql::Row) -> Result<Prompt, libsql::Error> {
    let id: String = row.get(0)?;
    let name: String = row.get(1)?;
    let version: i64 = row.get(2)?;
    let text: String = row.get(3)?;
    let params: String = row.get(4)?;
    let status: String = row.get(5)?;
    let created: String = row.get(6)?;
    Ok(Prompt {
        id: parse_uuid(&id),
        name,
        version,
        text,
        params: parse_json(&params),
        status: PromptStatus::parse(&status).unwrap_or(PromptStatus::Draft),
        created_at: parse_datetime(&created),
    })
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl Store for LibSqlStore {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    async fn insert_actor(
        &self,
        kind: ActorKind,
        access: bool,
        verified: bool,
        settings: serde_json::Value,
    ) -> Result<Actor, DatabaseError> {
        let id = Uuid::new_v4();
        let created = now_str();
        self.conn()
            .execute(
                "INSERT INTO actors (id, kind, access, verified, settings, agent_version, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    id.to_string(),
                    kind.as_str(),
                    access as i64,
                    verified as i64,
                    settings.to_string(),
                    AGENT_VERSION,
                    created.clone()
                ],
            )
            .await
            .map_err(map_db_err)?;
        Ok(Actor {
            id,
            kind,
            access,
            verified,
            settings,
            created_at: parse_datetime(&created),
        })
    }

    async fn get_actor(&self, id: Uuid) -> Result<Option<Actor>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {ACTOR_COLUMNS} FROM actors WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(map_db_err)?;
        match rows.next().await.map_err(map_db_err)? {
            Some(row) => Ok(Some(row_to_actor(&row).map_err(map_db_err)?)),
            None => Ok(None),
        }
    }

    async fn find_actor_by_kind(&self, kind: ActorKind) -> Result<Option<Actor>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {ACTOR_COLUMNS} FROM actors WHERE kind = ?1
                     ORDER BY created_at ASC LIMIT 1"
                ),
                params![kind.as_str()],
            )
            .await
            .map_err(map_db_err)?;
        match rows.next().await.map_err(map_db_err)? {
            Some(row) => Ok(Some(row_to_actor(&row).map_err(map_db_err)?)),
            None => Ok(None),
        }
    }

    async fn find_identity(
        &self,
        source: ExternalSource,
        external_id: &str,
    ) -> Result<Option<ExternalIdentity>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {IDENTITY_COLUMNS} FROM actor_identities
                     WHERE source = ?1 AND external_id = ?2"
                ),
                params![source.as_str(), external_id],
            )
            .await
            .map_err(map_db_err)?;
        match rows.next().await.map_err(map_db_err)? {
            Some(row) => Ok(Some(row_to_identity(&row).map_err(map_db_err)?)),
            None => Ok(None),
        }
    }

    async fn insert_identity(
        &self,
        actor_id: Uuid,
        source: ExternalSource,
        external_id: &str,
        authorized: bool,
    ) -> Result<ExternalIdentity, DatabaseError> {
        let id = Uuid::new_v4();
        let created = now_str();
        self.conn()
            .execute(
                "INSERT INTO actor_identities
                 (id, actor_id, source, external_id, authorized, agent_version, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    id.to_string(),
                    actor_id.to_string(),
                    source.as_str(),
                    external_id,
                    authorized as i64,
                    AGENT_VERSION,
                    created.clone()
                ],
            )
            .await
            .map_err(map_db_err)?;
        Ok(ExternalIdentity {
            id,
            actor_id,
            source,
            external_id: external_id.to_string(),
            authorized,
            created_at: parse_datetime(&created),
        })
    }

    async fn actor_has_identity(
        &self,
        actor_id: Uuid,
        source: ExternalSource,
    ) -> Result<bool, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT COUNT(*) FROM actor_identities WHERE actor_id = ?1 AND source = ?2",
                params![actor_id.to_string(), source.as_str()],
            )
            .await
            .map_err(map_db_err)?;
        let row = rows
            .next()
            .await
            .map_err(map_db_err)?
            .ok_or_else(|| DatabaseError::Query("COUNT returned no row".into()))?;
        let count: i64 = row.get(0).map_err(map_db_err)?;
        Ok(count > 0)
    }

    async fn insert_room(&self, name: &str) -> Result<Room, DatabaseError> {
        let id = Uuid::new_v4();
        let created = now_str();
        self.conn()
            .execute(
                "INSERT INTO rooms (id, name, status, created_at) VALUES (?1, ?2, 'active', ?3)",
                params![id.to_string(), name, created.clone()],
            )
            .await
            .map_err(map_db_err)?;
        Ok(Room {
            id,
            name: name.to_string(),
            status: RoomStatus::Active,
            created_at: parse_datetime(&created),
        })
    }

    async fn find_room(&self, name: &str) -> Result<Option<Room>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id, name, status, created_at FROM rooms WHERE name = ?1",
                params![name],
            )
            .await
            .map_err(map_db_err)?;
        match rows.next().await.map_err(map_db_err)? {
            Some(row) => Ok(Some(row_to_room(&row).map_err(map_db_err)?)),
            None => Ok(None),
        }
    }

    async fn retire_room(&self, id: Uuid) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE rooms SET status = 'retired' WHERE id = ?1",
                params![id.to_string()],
            )
            .await
            .map_err(map_db_err)?;
        Ok(())
    }

    async fn insert_session(
        &self,
        actor_id: Uuid,
        external_identity_id: Option<Uuid>,
        room_id: Uuid,
    ) -> Result<Session, DatabaseError> {
        let id = Uuid::new_v4();
        let created = now_str();
        self.conn()
            .execute(
                "INSERT INTO sessions
                 (id, actor_id, external_identity_id, status, last_room_id,
                  agent_version, created_at, updated_at)
                 VALUES (?1, ?2, ?3, 'active', ?4, ?5, ?6, ?6)",
                params![
                    id.to_string(),
                    actor_id.to_string(),
                    external_identity_id.map(|u| u.to_string()),
                    room_id.to_string(),
                    AGENT_VERSION,
                    created.clone()
                ],
            )
            .await
            .map_err(map_db_err)?;
        Ok(Session {
            id,
            actor_id,
            external_identity_id,
            status: SessionStatus::Active,
            last_room_id: Some(room_id),
            created_at: parse_datetime(&created),
            updated_at: parse_datetime(&created),
            closed_at: None,
        })
    }

    async fn get_session(&self, id: Uuid) -> Result<Option<Session>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(map_db_err)?;
        match rows.next().await.map_err(map_db_err)? {
            Some(row) => Ok(Some(row_to_session(&row).map_err(map_db_err)?)),
            None => Ok(None),
        }
    }

    async fn touch_session(&self, id: Uuid, room_id: Uuid) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE sessions SET updated_at = ?1, last_room_id = ?2 WHERE id = ?3",
                params![now_str(), room_id.to_string(), id.to_string()],
            )
            .await
            .map_err(map_db_err)?;
        Ok(())
    }

    async fn close_session(&self, id: Uuid) -> Result<(), DatabaseError> {
        let now = now_str();
        self.conn()
            .execute(
                "UPDATE sessions SET status = 'completed', closed_at = ?1, updated_at = ?1
                 WHERE id = ?2 AND status = 'active'",
                params![now, id.to_string()],
            )
            .await
            .map_err(map_db_err)?;
        Ok(())
    }

    async fn close_stale_sessions(&self) -> Result<u64, DatabaseError> {
        let now = now_str();
        let changed = self
            .conn()
            .execute(
                "UPDATE sessions SET status = 'completed', closed_at = ?1, updated_at = ?1
                 WHERE status = 'active'",
                params![now],
            )
            .await
            .map_err(map_db_err)?;
        Ok(changed)
    }

    async fn insert_message(&self, msg: NewMessage) -> Result<Message, DatabaseError> {
        let id = Uuid::new_v4();
        let created = now_str();
        self.conn()
            .execute(
                "INSERT INTO messages
                 (id, parent_id, actor_id, actor_kind, session_id, room_id, text,
                  token_count, answer_latency, step_id, llm_metric_id,
                  agent_version, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                params![
                    id.to_string(),
                    msg.parent_id.map(|u| u.to_string()),
                    msg.actor_id.to_string(),
                    msg.actor_kind.as_str(),
                    msg.session_id.to_string(),
                    msg.room_id.to_string(),
                    msg.text.clone(),
                    msg.token_count,
                    msg.answer_latency,
                    msg.step_id.map(|u| u.to_string()),
                    msg.llm_metric_id.map(|u| u.to_string()),
                    AGENT_VERSION,
                    created.clone()
                ],
            )
            .await
            .map_err(map_db_err)?;
        Ok(Message {
            id,
            parent_id: msg.parent_id,
            actor_id: msg.actor_id,
            actor_kind: msg.actor_kind,
            session_id: msg.session_id,
            room_id: msg.room_id,
            text: msg.text,
            normalized_text: None,
            token_count: msg.token_count,
            answer_latency: msg.answer_latency,
            step_id: msg.step_id,
            llm_metric_id: msg.llm_metric_id,
            created_at: parse_datetime(&created),
        })
    }

    async fn get_message(&self, id: Uuid) -> Result<Option<Message>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(map_db_err)?;
        match rows.next().await.map_err(map_db_err)? {
            Some(row) => Ok(Some(row_to_message(&row).map_err(map_db_err)?)),
            None => Ok(None),
        }
    }

    async fn set_message_normalized(&self, id: Uuid, text: &str) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE messages SET normalized_text = ?1 WHERE id = ?2",
                params![text, id.to_string()],
            )
            .await
            .map_err(map_db_err)?;
        Ok(())
    }

    async fn recent_exchange(
        &self,
        session_id: Uuid,
        room_id: Uuid,
        actor_id: Uuid,
        window: usize,
        exclude: Option<Uuid>,
    ) -> Result<Vec<Message>, DatabaseError> {
        // The CTE picks the actor's own most recent turns; the outer query
        // widens to agent replies whose parent is one of those turns. The
        // window bounds actor turns, not the combined total.
        let sql = format!(
            "WITH actor_turns AS (
                SELECT id FROM messages
                WHERE session_id = ?1 AND room_id = ?2 AND actor_id = ?3
                  AND (?4 IS NULL OR id != ?4)
                ORDER BY created_at DESC, rowid DESC
                LIMIT ?5
            )
            SELECT {MESSAGE_COLUMNS} FROM messages
            WHERE id IN (SELECT id FROM actor_turns)
               OR (actor_kind = 'system'
                   AND parent_id IN (SELECT id FROM actor_turns))
            ORDER BY created_at ASC, rowid ASC"
        );
        let mut rows = self
            .conn()
            .query(
                &sql,
                params![
                    session_id.to_string(),
                    room_id.to_string(),
                    actor_id.to_string(),
                    exclude.map(|u| u.to_string()),
                    window as i64
                ],
            )
            .await
            .map_err(map_db_err)?;

        let mut messages = Vec::new();
        while let Some(row) = rows.next().await.map_err(map_db_err)? {
            messages.push(row_to_message(&row).map_err(map_db_err)?);
        }
        Ok(messages)
    }

    async fn insert_task_type(
        &self,
        name: &str,
        description: &str,
    ) -> Result<TaskType, DatabaseError> {
        let id = Uuid::new_v4();
        self.conn()
            .execute(
                "INSERT INTO task_types (id, name, description) VALUES (?1, ?2, ?3)",
                params![id.to_string(), name, description],
            )
            .await
            .map_err(map_db_err)?;
        Ok(TaskType {
            id,
            name: name.to_string(),
            description: description.to_string(),
        })
    }

    async fn find_task_type(&self, name: &str) -> Result<Option<TaskType>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id, name, description FROM task_types WHERE name = ?1",
                params![name],
            )
            .await
            .map_err(map_db_err)?;
        match rows.next().await.map_err(map_db_err)? {
            Some(row) => {
                let id: String = row.get(0).map_err(map_db_err)?;
                let name: String = row.get(1).map_err(map_db_err)?;
                let description: String = row.get(2).map_err(map_db_err)?;
                Ok(Some(TaskType {
                    id: parse_uuid(&id),
                    name,
                    description,
                }))
            }
            None => Ok(None),
        }
    }

    async fn insert_step_type(
        &self,
        name: &str,
        description: &str,
    ) -> Result<StepType, DatabaseError> {
        let id = Uuid::new_v4();
        self.conn()
            .execute(
                "INSERT INTO step_types (id, name, description) VALUES (?1, ?2, ?3)",
                params![id.to_string(), name, description],
            )
            .await
            .map_err(map_db_err)?;
        Ok(StepType {
            id,
            name: name.to_string(),
            description: description.to_string(),
        })
    }

    async fn find_step_type(&self, name: &str) -> Result<Option<StepType>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id, name, description FROM step_types WHERE name = ?1",
                params![name],
            )
            .await
            .map_err(map_db_err)?;
        match rows.next().await.map_err(map_db_err)? {
            Some(row) => {
                let id: String = row.get(0).map_err(map_db_err)?;
                let name: String = row.get(1).map_err(map_db_err)?;
                let description: String = row.get(2).map_err(map_db_err)?;
                Ok(Some(StepType {
                    id: parse_uuid(&id),
                    name,
                    description,
                }))
            }
            None => Ok(None),
        }
    }

    async fn insert_task(
        &self,
        task_type_id: Uuid,
        parent_task_id: Option<Uuid>,
        input: serde_json::Value,
        priority: f64,
    ) -> Result<Task, DatabaseError> {
        let id = Uuid::new_v4();
        let created = now_str();
        self.conn()
            .execute(
                "INSERT INTO tasks
                 (id, task_type_id, parent_task_id, input, priority, status,
                  agent_version, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, 'pending', ?6, ?7)",
                params![
                    id.to_string(),
                    task_type_id.to_string(),
                    parent_task_id.map(|u| u.to_string()),
                    input.to_string(),
                    priority,
                    AGENT_VERSION,
                    created
                ],
            )
            .await
            .map_err(map_db_err)?;
        self.get_task(id).await?.ok_or(DatabaseError::NotFound {
            entity: "task".into(),
            id: id.to_string(),
        })
    }

    async fn get_task(&self, id: Uuid) -> Result<Option<Task>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {TASK_COLUMNS} FROM tasks t
                     JOIN task_types tt ON t.task_type_id = tt.id
                     WHERE t.id = ?1"
                ),
                params![id.to_string()],
            )
            .await
            .map_err(map_db_err)?;
        match rows.next().await.map_err(map_db_err)? {
            Some(row) => Ok(Some(row_to_task(&row).map_err(map_db_err)?)),
            None => Ok(None),
        }
    }

    async fn claim_next_task(&self, worker_token: &str) -> Result<Option<Task>, DatabaseError> {
        // Single-statement compare-and-swap: the inner SELECT and the status
        // guard are evaluated under SQLite's write lock, so two concurrent
        // claimers can never move the same row to `running`. The loser's
        // subquery re-evaluates and picks the next pending row, or none.
        let sql = "UPDATE tasks
            SET status = 'running', started_at = ?1, worker_token = ?2
            WHERE id = (
                SELECT id FROM tasks WHERE status = 'pending'
                ORDER BY priority DESC, created_at ASC, rowid ASC
                LIMIT 1
            ) AND status = 'pending'
            RETURNING id";
        let mut rows = self
            .conn()
            .query(sql, params![now_str(), worker_token])
            .await
            .map_err(map_db_err)?;

        let claimed = match rows.next().await.map_err(map_db_err)? {
            Some(row) => {
                let id: String = row.get(0).map_err(map_db_err)?;
                parse_uuid(&id)
            }
            None => return Ok(None),
        };
        self.get_task(claimed).await
    }

    async fn complete_task(
        &self,
        id: Uuid,
        output: &serde_json::Value,
    ) -> Result<bool, DatabaseError> {
        let now = now_str();
        let changed = self
            .conn()
            .execute(
                "UPDATE tasks SET
                    status = 'completed',
                    completed_at = ?1,
                    output = ?2,
                    run_latency = (julianday(?1) - julianday(started_at)) * 86400.0,
                    total_latency = (julianday(?1) - julianday(created_at)) * 86400.0
                 WHERE id = ?3 AND status = 'running'",
                params![now, output.to_string(), id.to_string()],
            )
            .await
            .map_err(map_db_err)?;
        Ok(changed > 0)
    }

    async fn fail_task(
        &self,
        id: Uuid,
        error_module: &str,
        error_message: &str,
    ) -> Result<bool, DatabaseError> {
        let now = now_str();
        let changed = self
            .conn()
            .execute(
                "UPDATE tasks SET
                    status = 'failed',
                    completed_at = ?1,
                    error_module = ?2,
                    error_message = ?3,
                    error_timestamp = ?1,
                    run_latency = (julianday(?1) - julianday(started_at)) * 86400.0,
                    total_latency = (julianday(?1) - julianday(created_at)) * 86400.0
                 WHERE id = ?4 AND status = 'running'",
                params![now, error_module, error_message, id.to_string()],
            )
            .await
            .map_err(map_db_err)?;
        Ok(changed > 0)
    }

    async fn recover_orphan_tasks(&self, error_module: &str) -> Result<u64, DatabaseError> {
        let now = now_str();
        let changed = self
            .conn()
            .execute(
                "UPDATE tasks SET
                    status = 'failed',
                    completed_at = ?1,
                    error_module = ?2,
                    error_message = 'Process restart: task interrupted',
                    error_timestamp = ?1,
                    run_latency = (julianday(?1) - julianday(started_at)) * 86400.0,
                    total_latency = (julianday(?1) - julianday(created_at)) * 86400.0
                 WHERE status = 'running'",
                params![now, error_module],
            )
            .await
            .map_err(map_db_err)?;
        Ok(changed)
    }

    async fn recover_orphan_steps(&self, error_module: &str) -> Result<u64, DatabaseError> {
        let now = now_str();
        let changed = self
            .conn()
            .execute(
                "UPDATE steps SET
                    status = 'failed',
                    completed_at = ?1,
                    error_module = ?2,
                    error_message = 'Process restart: step interrupted',
                    error_timestamp = ?1,
                    latency = (julianday(?1) - julianday(created_at)) * 86400.0
                 WHERE status IN ('pending', 'running')",
                params![now, error_module],
            )
            .await
            .map_err(map_db_err)?;
        Ok(changed)
    }

    async fn insert_step(
        &self,
        task_id: Uuid,
        step_number: i64,
        step_type_id: Uuid,
        parent_step_id: Option<Uuid>,
        input: serde_json::Value,
    ) -> Result<Step, DatabaseError> {
        // One-time copy of the dictionary names into the row. Historical
        // steps stay stable even if the dictionaries change later.
        let mut rows = self
            .conn()
            .query(
                "SELECT st.name, tt.name FROM step_types st, tasks t
                 JOIN task_types tt ON t.task_type_id = tt.id
                 WHERE st.id = ?1 AND t.id = ?2",
                params![step_type_id.to_string(), task_id.to_string()],
            )
            .await
            .map_err(map_db_err)?;
        let row = rows
            .next()
            .await
            .map_err(map_db_err)?
            .ok_or(DatabaseError::NotFound {
                entity: "task or step type".into(),
                id: task_id.to_string(),
            })?;
        let step_name: String = row.get(0).map_err(map_db_err)?;
        let task_type_name: String = row.get(1).map_err(map_db_err)?;

        let id = Uuid::new_v4();
        let created = now_str();
        self.conn()
            .execute(
                "INSERT INTO steps
                 (id, task_id, step_number, step_type_id, step_name, task_type_name,
                  parent_step_id, status, input, agent_version, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'pending', ?8, ?9, ?10)",
                params![
                    id.to_string(),
                    task_id.to_string(),
                    step_number,
                    step_type_id.to_string(),
                    step_name.clone(),
                    task_type_name.clone(),
                    parent_step_id.map(|u| u.to_string()),
                    input.to_string(),
                    AGENT_VERSION,
                    created.clone()
                ],
            )
            .await
            .map_err(map_db_err)?;

        Ok(Step {
            id,
            task_id,
            step_number,
            step_type_id,
            step_name,
            task_type_name,
            parent_step_id,
            status: TaskStatus::Pending,
            input,
            output: None,
            reasoning_id: None,
            latency: None,
            created_at: parse_datetime(&created),
            started_at: None,
            completed_at: None,
            error_module: None,
            error_message: None,
            error_timestamp: None,
        })
    }

    async fn max_step_number(&self, task_id: Uuid) -> Result<i64, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT COALESCE(MAX(step_number), 0) FROM steps WHERE task_id = ?1",
                params![task_id.to_string()],
            )
            .await
            .map_err(map_db_err)?;
        let row = rows
            .next()
            .await
            .map_err(map_db_err)?
            .ok_or_else(|| DatabaseError::Query("MAX returned no row".into()))?;
        row.get(0).map_err(map_db_err)
    }

    async fn get_step(&self, id: Uuid) -> Result<Option<Step>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {STEP_COLUMNS} FROM steps WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(map_db_err)?;
        match rows.next().await.map_err(map_db_err)? {
            Some(row) => Ok(Some(row_to_step(&row).map_err(map_db_err)?)),
            None => Ok(None),
        }
    }

    async fn list_steps(&self, task_id: Uuid) -> Result<Vec<Step>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {STEP_COLUMNS} FROM steps
                     WHERE task_id = ?1 ORDER BY step_number ASC"
                ),
                params![task_id.to_string()],
            )
            .await
            .map_err(map_db_err)?;
        let mut steps = Vec::new();
        while let Some(row) = rows.next().await.map_err(map_db_err)? {
            steps.push(row_to_step(&row).map_err(map_db_err)?);
        }
        Ok(steps)
    }

    async fn start_step(&self, id: Uuid) -> Result<bool, DatabaseError> {
        let changed = self
            .conn()
            .execute(
                "UPDATE steps SET status = 'running', started_at = ?1
                 WHERE id = ?2 AND status = 'pending'",
                params![now_str(), id.to_string()],
            )
            .await
            .map_err(map_db_err)?;
        Ok(changed > 0)
    }

    async fn complete_step(
        &self,
        id: Uuid,
        output: &serde_json::Value,
    ) -> Result<bool, DatabaseError> {
        let now = now_str();
        let changed = self
            .conn()
            .execute(
                "UPDATE steps SET
                    status = 'completed',
                    completed_at = ?1,
                    output = ?2,
                    latency = (julianday(?1) - julianday(created_at)) * 86400.0
                 WHERE id = ?3 AND status = 'running'",
                params![now, output.to_string(), id.to_string()],
            )
            .await
            .map_err(map_db_err)?;
        Ok(changed > 0)
    }

    async fn fail_step(
        &self,
        id: Uuid,
        error_module: &str,
        error_message: &str,
    ) -> Result<bool, DatabaseError> {
        let now = now_str();
        let changed = self
            .conn()
            .execute(
                "UPDATE steps SET
                    status = 'failed',
                    completed_at = ?1,
                    error_module = ?2,
                    error_message = ?3,
                    error_timestamp = ?1,
                    latency = (julianday(?1) - julianday(created_at)) * 86400.0
                 WHERE id = ?4 AND status = 'running'",
                params![now, error_module, error_message, id.to_string()],
            )
            .await
            .map_err(map_db_err)?;
        Ok(changed > 0)
    }

    async fn set_step_reasoning(
        &self,
        step_id: Uuid,
        reasoning_id: Uuid,
    ) -> Result<bool, DatabaseError> {
        let changed = self
            .conn()
            .execute(
                "UPDATE steps SET reasoning_id = ?1
                 WHERE id = ?2 AND reasoning_id IS NULL",
                params![reasoning_id.to_string(), step_id.to_string()],
            )
            .await
            .map_err(map_db_err)?;
        Ok(changed > 0)
    }

    async fn insert_reasoning(
        &self,
        step_id: Uuid,
        content: &str,
        kind: ReasoningKind,
    ) -> Result<Reasoning, DatabaseError> {
        let id = Uuid::new_v4();
        let created = now_str();
        self.conn()
            .execute(
                "INSERT INTO reasonings
                 (id, step_id, content, kind, agent_version, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    id.to_string(),
                    step_id.to_string(),
                    content,
                    kind.as_str(),
                    AGENT_VERSION,
                    created.clone()
                ],
            )
            .await
            .map_err(map_db_err)?;
        Ok(Reasoning {
            id,
            step_id,
            content: content.to_string(),
            kind,
            vector_point_id: None,
            embedding_metric_id: None,
            created_at: parse_datetime(&created),
        })
    }

    async fn set_reasoning_vector_point(
        &self,
        id: Uuid,
        point_id: &str,
        embedding_metric_id: Option<Uuid>,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE reasonings SET vector_point_id = ?1, embedding_metric_id = ?2
                 WHERE id = ?3",
                params![
                    point_id,
                    embedding_metric_id.map(|u| u.to_string()),
                    id.to_string()
                ],
            )
            .await
            .map_err(map_db_err)?;
        Ok(())
    }

    async fn insert_generation_metric(
        &self,
        metric: &GenerationMetric,
    ) -> Result<Uuid, DatabaseError> {
        let id = Uuid::new_v4();
        let now = now_str();
        let error_at = metric.error_status.then(|| now.clone());
        self.conn()
            .execute(
                "INSERT INTO generation_metrics
                 (id, step_id, prompt_id, host, model, params, cache_tokens,
                  prompt_tokens, completion_tokens, total_tokens, host_ctx,
                  prompt_ms, prompt_per_token_ms, prompt_per_second,
                  predicted_per_second, response_secs, net_latency_secs, total_secs,
                  error_status, error_message, error_at, agent_version, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13,
                         ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23)",
                params![
                    id.to_string(),
                    metric.step_id.map(|u| u.to_string()),
                    metric.prompt_id.map(|u| u.to_string()),
                    metric.host.clone(),
                    metric.model.clone(),
                    metric.params.to_string(),
                    metric.cache_tokens,
                    metric.prompt_tokens,
                    metric.completion_tokens,
                    metric.total_tokens,
                    metric.host_ctx,
                    metric.prompt_ms,
                    metric.prompt_per_token_ms,
                    metric.prompt_per_second,
                    metric.predicted_per_second,
                    metric.response_secs,
                    metric.net_latency_secs,
                    metric.total_secs,
                    metric.error_status as i64,
                    metric.error_message.clone(),
                    error_at,
                    AGENT_VERSION,
                    now.clone()
                ],
            )
            .await
            .map_err(map_db_err)?;
        Ok(id)
    }

    async fn insert_embedding_metric(
        &self,
        metric: &EmbeddingMetric,
    ) -> Result<Uuid, DatabaseError> {
        let id = Uuid::new_v4();
        let now = now_str();
        let error_at = metric.error_status.then(|| now.clone());
        self.conn()
            .execute(
                "INSERT INTO embedding_metrics
                 (id, step_id, host, model, tokens, duration_ms,
                  error_status, error_message, error_at, agent_version, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    id.to_string(),
                    metric.step_id.map(|u| u.to_string()),
                    metric.host.clone(),
                    metric.model.clone(),
                    metric.tokens,
                    metric.duration_ms,
                    metric.error_status as i64,
                    metric.error_message.clone(),
                    error_at,
                    AGENT_VERSION,
                    now.clone()
                ],
            )
            .await
            .map_err(map_db_err)?;
        Ok(id)
    }

    async fn insert_prompt(
        &self,
        name: &str,
        version: i64,
        text: &str,
        params_value: serde_json::Value,
        status: PromptStatus,
    ) -> Result<Prompt, DatabaseError> {
        let id = Uuid::new_v4();
        let created = now_str();
        self.conn()
            .execute(
                "INSERT INTO prompts (id, name, version, text, params, status, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    id.to_string(),
                    name,
                    version,
                    text,
                    params_value.to_string(),
                    status.as_str(),
                    created.clone()
                ],
            )
            .await
            .map_err(map_db_err)?;
        Ok(Prompt {
            id,
            name: name.to_string(),
            version,
            text: text.to_string(),
            params: params_value,
            status,
            created_at: parse_datetime(&created),
        })
    }

    async fn active_prompt(&self, name: &str) -> Result<Option<Prompt>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id, name, version, text, params, status, created_at
                 FROM prompts WHERE name = ?1 AND status = 'active'
                 ORDER BY version DESC LIMIT 1",
                params![name],
            )
            .await
            .map_err(map_db_err)?;
        match rows.next().await.map_err(map_db_err)? {
            Some(row) => Ok(Some(row_to_prompt(&row).map_err(map_db_err)?)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn open_creates_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let db_path = tmp.path().join("nested").join("dir").join("hearth.db");
        let store = LibSqlStore::new_local(&db_path).await.unwrap();
        assert!(db_path.exists());
        drop(store);
    }

    #[tokio::test]
    async fn duplicate_identity_is_constraint_error() {
        let store = LibSqlStore::new_memory().await.unwrap();
        let actor = store
            .insert_actor(ActorKind::Owner, true, true, serde_json::json!({}))
            .await
            .unwrap();

        store
            .insert_identity(actor.id, ExternalSource::Console, "console:alice", true)
            .await
            .unwrap();
        let dup = store
            .insert_identity(actor.id, ExternalSource::Console, "console:alice", true)
            .await;
        assert!(matches!(dup, Err(DatabaseError::Constraint(_))));
    }

    #[tokio::test]
    async fn duplicate_room_name_is_constraint_error() {
        let store = LibSqlStore::new_memory().await.unwrap();
        store.insert_room("finance").await.unwrap();
        let dup = store.insert_room("finance").await;
        assert!(matches!(dup, Err(DatabaseError::Constraint(_))));
    }

    #[tokio::test]
    async fn rooms_are_soft_retired() {
        let store = LibSqlStore::new_memory().await.unwrap();
        let room = store.insert_room("finance").await.unwrap();
        store.retire_room(room.id).await.unwrap();

        let room = store.find_room("finance").await.unwrap().unwrap();
        assert_eq!(room.status, RoomStatus::Retired);
    }

    #[tokio::test]
    async fn duplicate_prompt_version_is_constraint_error() {
        let store = LibSqlStore::new_memory().await.unwrap();
        store
            .insert_prompt("core_identity", 1, "You are hearth.", serde_json::json!({}),
                PromptStatus::Active)
            .await
            .unwrap();
        let dup = store
            .insert_prompt("core_identity", 1, "Other text", serde_json::json!({}),
                PromptStatus::Draft)
            .await;
        assert!(matches!(dup, Err(DatabaseError::Constraint(_))));
    }

    #[tokio::test]
    async fn active_prompt_picks_highest_version() {
        let store = LibSqlStore::new_memory().await.unwrap();
        store
            .insert_prompt("core_identity", 1, "v1", serde_json::json!({}), PromptStatus::Active)
            .await
            .unwrap();
        store
            .insert_prompt("core_identity", 2, "v2", serde_json::json!({}), PromptStatus::Active)
            .await
            .unwrap();
        store
            .insert_prompt("core_identity", 3, "draft", serde_json::json!({}), PromptStatus::Draft)
            .await
            .unwrap();

        let prompt = store.active_prompt("core_identity").await.unwrap().unwrap();
        assert_eq!(prompt.version, 2);
        assert_eq!(prompt.text, "v2");
    }

    #[tokio::test]
    async fn step_reasoning_link_is_one_shot() {
        let store = LibSqlStore::new_memory().await.unwrap();
        let tt = store.insert_task_type("answer_generation", "").await.unwrap();
        let st = store.insert_step_type("generate_answer", "").await.unwrap();
        let task = store
            .insert_task(tt.id, None, serde_json::json!({}), 0.5)
            .await
            .unwrap();
        let step = store
            .insert_step(task.id, 1, st.id, None, serde_json::json!({}))
            .await
            .unwrap();

        let r1 = store
            .insert_reasoning(step.id, "first thought", ReasoningKind::Dialogue)
            .await
            .unwrap();
        let r2 = store
            .insert_reasoning(step.id, "second thought", ReasoningKind::Dialogue)
            .await
            .unwrap();

        assert!(store.set_step_reasoning(step.id, r1.id).await.unwrap());
        assert!(!store.set_step_reasoning(step.id, r2.id).await.unwrap());

        let step = store.get_step(step.id).await.unwrap().unwrap();
        assert_eq!(step.reasoning_id, Some(r1.id));
    }

    #[tokio::test]
    async fn step_denormalizes_dictionary_names() {
        let store = LibSqlStore::new_memory().await.unwrap();
        let tt = store.insert_task_type("answer_generation", "").await.unwrap();
        let st = store.insert_step_type("assemble_context", "").await.unwrap();
        let task = store
            .insert_task(tt.id, None, serde_json::json!({}), 0.5)
            .await
            .unwrap();
        let step = store
            .insert_step(task.id, 1, st.id, None, serde_json::json!({}))
            .await
            .unwrap();

        assert_eq!(step.step_name, "assemble_context");
        assert_eq!(step.task_type_name, "answer_generation");
    }

    #[tokio::test]
    async fn complete_guard_rejects_non_running_tasks() {
        let store = LibSqlStore::new_memory().await.unwrap();
        let tt = store.insert_task_type("answer_generation", "").await.unwrap();
        let task = store
            .insert_task(tt.id, None, serde_json::json!({}), 0.5)
            .await
            .unwrap();

        // Still pending: the guarded UPDATE must not fire.
        assert!(!store.complete_task(task.id, &serde_json::json!({})).await.unwrap());
        assert!(!store.fail_task(task.id, "m", "boom").await.unwrap());

        store.claim_next_task("w1").await.unwrap().unwrap();
        assert!(store.complete_task(task.id, &serde_json::json!({"ok": true})).await.unwrap());

        let task = store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert!(task.run_latency.is_some());
        assert!(task.total_latency.is_some());
    }
}
