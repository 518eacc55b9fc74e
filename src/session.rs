//! Actor identities, session lifecycle, and first-run bootstrap.
//!
//! An actor is a durable person (or the agent itself); an identity is one
//! external handle they connect through. The first identity seen on a source
//! is claimed by the owner, so the owner's first console login does not spawn
//! a stranger account. Every connection opens a fresh session.

use std::sync::Arc;
use std::sync::LazyLock;

use regex::Regex;
use serde_json::json;
use tracing::info;
use uuid::Uuid;

use crate::error::{Result, SessionError};
use crate::queue::TaskQueue;
use crate::store::Store;
use crate::store::types::{
    Actor, ActorKind, ExternalIdentity, ExternalSource, Message, NewMessage, PromptStatus, Room,
    Session, Task,
};
use crate::tokens::estimate_tokens;

/// Room every conversation lands in unless routed elsewhere.
pub const DEFAULT_ROOM: &str = "open_dialogue";

/// Task type for answering an incoming message.
pub const ANSWER_TASK_TYPE: &str = "answer_generation";

pub const STEP_ASSEMBLE_CONTEXT: &str = "assemble_context";
pub const STEP_GENERATE_ANSWER: &str = "generate_answer";
pub const STEP_COMPOSE_REPLY: &str = "compose_reply";

/// Name of the system prompt governing dialogue answers.
pub const CORE_PROMPT: &str = "core_identity";

const DEFAULT_CORE_PROMPT: &str = "You are Hearth, a personal assistant with a persistent \
memory. Answer plainly and honestly. If you do not know something, say so.";

static WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());

/// Lowercase and collapse runs of whitespace. Stored alongside the raw text
/// for lookups that should not care about casing or layout.
pub fn normalize_text(text: &str) -> String {
    WHITESPACE.replace_all(text.trim(), " ").to_lowercase()
}

/// Seed the dictionaries and singleton rows an empty database needs.
/// Safe to call on every startup; existing rows are left alone.
pub async fn bootstrap(store: &dyn Store) -> Result<()> {
    if store.find_actor_by_kind(ActorKind::System).await?.is_none() {
        store
            .insert_actor(ActorKind::System, true, true, json!({"name": "hearth"}))
            .await?;
        info!("Seeded system actor");
    }
    if store.find_actor_by_kind(ActorKind::Owner).await?.is_none() {
        store
            .insert_actor(ActorKind::Owner, true, true, json!({}))
            .await?;
        info!("Seeded owner actor");
    }
    if store.find_room(DEFAULT_ROOM).await?.is_none() {
        store.insert_room(DEFAULT_ROOM).await?;
    }
    if store.find_task_type(ANSWER_TASK_TYPE).await?.is_none() {
        store
            .insert_task_type(ANSWER_TASK_TYPE, "Answer an incoming dialogue message")
            .await?;
    }
    for (name, description) in [
        (STEP_ASSEMBLE_CONTEXT, "Collect recent dialogue into model context"),
        (STEP_GENERATE_ANSWER, "Run the inference backend"),
        (STEP_COMPOSE_REPLY, "Persist the agent reply"),
    ] {
        if store.find_step_type(name).await?.is_none() {
            store.insert_step_type(name, description).await?;
        }
    }
    if store.active_prompt(CORE_PROMPT).await?.is_none() {
        store
            .insert_prompt(
                CORE_PROMPT,
                1,
                DEFAULT_CORE_PROMPT,
                json!({"temperature": 0.7}),
                PromptStatus::Active,
            )
            .await?;
        info!(prompt = CORE_PROMPT, "Seeded default prompt");
    }
    Ok(())
}

/// One connected conversation: resolves who is talking, opens a session for
/// them, and turns their messages into queued answer tasks.
pub struct SessionManager {
    store: Arc<dyn Store>,
    queue: TaskQueue,
    source: ExternalSource,
    room: Room,
    identity: Option<ExternalIdentity>,
    actor: Option<Actor>,
    session: Option<Session>,
}

impl SessionManager {
    pub async fn new(store: Arc<dyn Store>, source: ExternalSource) -> Result<Self> {
        let room = store
            .find_room(DEFAULT_ROOM)
            .await?
            .ok_or_else(|| SessionError::RoomNotFound(DEFAULT_ROOM.to_string()))?;
        Ok(Self {
            queue: TaskQueue::new(store.clone()),
            store,
            source,
            room,
            identity: None,
            actor: None,
            session: None,
        })
    }

    /// Resolve `external_id` on this manager's source to a durable actor.
    ///
    /// Known identities map to their existing actor. An unknown identity goes
    /// to the owner if the owner has no identity on this source yet;
    /// otherwise a new unverified `user` actor is created for it.
    pub async fn link_identity(&mut self, external_id: &str) -> Result<&Actor> {
        if let Some(identity) = self.store.find_identity(self.source, external_id).await? {
            let actor = self
                .store
                .get_actor(identity.actor_id)
                .await?
                .ok_or_else(|| {
                    SessionError::BootstrapIncomplete(format!(
                        "identity {} points at a missing actor",
                        identity.id
                    ))
                })?;
            self.identity = Some(identity);
            self.actor = Some(actor);
        } else {
            let owner = self
                .store
                .find_actor_by_kind(ActorKind::Owner)
                .await?
                .ok_or_else(|| {
                    SessionError::BootstrapIncomplete("no owner actor seeded".to_string())
                })?;
            let actor = if !self.store.actor_has_identity(owner.id, self.source).await? {
                owner
            } else {
                self.store
                    .insert_actor(ActorKind::User, true, false, json!({}))
                    .await?
            };
            let authorized = actor.kind == ActorKind::Owner;
            let identity = self
                .store
                .insert_identity(actor.id, self.source, external_id, authorized)
                .await?;
            info!(actor_id = %actor.id, kind = %actor.kind, source = %self.source,
                "Linked new identity");
            self.identity = Some(identity);
            self.actor = Some(actor);
        }
        Ok(self.actor.as_ref().ok_or(SessionError::ActorNotLinked)?)
    }

    /// Open a fresh session for the linked actor in the default room.
    pub async fn open_session(&mut self) -> Result<&Session> {
        let actor = self.actor.as_ref().ok_or(SessionError::ActorNotLinked)?;
        if let Some(session) = &self.session {
            return Err(SessionError::AlreadyActive(session.id).into());
        }
        let session = self
            .store
            .insert_session(actor.id, self.identity.as_ref().map(|i| i.id), self.room.id)
            .await?;
        info!(session_id = %session.id, actor_id = %actor.id, "Session opened");
        self.session = Some(session);
        Ok(self.session.as_ref().ok_or(SessionError::NoActiveSession)?)
    }

    pub fn session(&self) -> Result<&Session> {
        Ok(self.session.as_ref().ok_or(SessionError::NoActiveSession)?)
    }

    pub fn actor(&self) -> Result<&Actor> {
        Ok(self.actor.as_ref().ok_or(SessionError::ActorNotLinked)?)
    }

    /// Persist an incoming message and enqueue the task that will answer it.
    pub async fn save_incoming(&self, text: &str, priority: f64) -> Result<(Message, Task)> {
        let actor = self.actor()?;
        let session = self.session()?;

        let message = self
            .store
            .insert_message(NewMessage {
                parent_id: None,
                actor_id: actor.id,
                actor_kind: actor.kind,
                session_id: session.id,
                room_id: self.room.id,
                text: text.to_string(),
                token_count: estimate_tokens(text),
                answer_latency: None,
                step_id: None,
                llm_metric_id: None,
            })
            .await?;
        self.store
            .set_message_normalized(message.id, &normalize_text(text))
            .await?;
        self.store.touch_session(session.id, self.room.id).await?;

        let task = self
            .queue
            .enqueue(
                ANSWER_TASK_TYPE,
                None,
                json!({ "message_id": message.id }),
                priority,
            )
            .await?;
        Ok((message, task))
    }

    /// Close the active session. Idempotent at the store level, but this
    /// manager forgets the session either way.
    pub async fn close(&mut self) -> Result<()> {
        if let Some(session) = self.session.take() {
            self.store.close_session(session.id).await?;
            info!(session_id = %session.id, "Session closed");
        }
        Ok(())
    }

    pub fn room(&self) -> &Room {
        &self.room
    }
}
