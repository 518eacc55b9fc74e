//! Answer composition: the handler behind `answer_generation` tasks.
//!
//! Runs the three recorded steps of answering a message: assemble the
//! dialogue context, call the inference backend, persist the agent reply.
//! Each step settles before the next is created, so a crash leaves an exact
//! record of how far the answer got.

use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use serde_json::{Value, json};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::LlmConfig;
use crate::context::ContextAssembler;
use crate::error::{Result, SessionError, TaskError};
use crate::llm::{ChatMessage, GenerationOutcome, GenerationRequest, InferenceBackend};
use crate::session::{CORE_PROMPT, STEP_ASSEMBLE_CONTEXT, STEP_COMPOSE_REPLY, STEP_GENERATE_ANSWER};
use crate::steps::StepSequencer;
use crate::store::Store;
use crate::store::types::{
    ActorKind, Message, NewMessage, Prompt, ReasoningKind, Step, Task,
};
use crate::tokens::estimate_tokens;
use crate::vector::VectorIndex;

/// Error module recorded on steps and tasks failed in this path.
pub const COMPOSER_MODULE: &str = "response_composer";

pub struct ResponseComposer {
    store: Arc<dyn Store>,
    steps: StepSequencer,
    assembler: ContextAssembler,
    backend: Arc<dyn InferenceBackend>,
    vector: Arc<dyn VectorIndex>,
    llm: LlmConfig,
}

impl ResponseComposer {
    pub fn new(
        store: Arc<dyn Store>,
        backend: Arc<dyn InferenceBackend>,
        vector: Arc<dyn VectorIndex>,
        llm: LlmConfig,
        context_window: usize,
    ) -> Self {
        Self {
            steps: StepSequencer::new(store.clone()),
            assembler: ContextAssembler::new(store.clone(), context_window),
            store,
            backend,
            vector,
            llm,
        }
    }

    /// Execute an `answer_generation` task. Returns the task output on
    /// success; on error the current step is already failed and the caller
    /// settles the task.
    pub async fn handle(&self, task: &Task) -> Result<Value> {
        let message = self.load_subject(task).await?;
        let prompt = self
            .store
            .active_prompt(CORE_PROMPT)
            .await?
            .ok_or_else(|| {
                SessionError::BootstrapIncomplete(format!("no active '{CORE_PROMPT}' prompt"))
            })?;

        // Step 1: context.
        let step = self
            .steps
            .append_step(
                task.id,
                STEP_ASSEMBLE_CONTEXT,
                None,
                json!({ "message_id": message.id }),
            )
            .await?;
        let context = self
            .guard(&step, self.assemble(&step, &message, &prompt))
            .await?;

        // Step 2: inference.
        let step = self
            .steps
            .append_step(
                task.id,
                STEP_GENERATE_ANSWER,
                Some(step.id),
                json!({ "context_messages": context.len() }),
            )
            .await?;
        let (outcome, metric_id) = self
            .guard(&step, self.generate(&step, &message, &prompt, context))
            .await?;

        // Step 3: reply.
        let generation_step_id = step.id;
        let step = self
            .steps
            .append_step(
                task.id,
                STEP_COMPOSE_REPLY,
                Some(step.id),
                json!({ "metric_id": metric_id }),
            )
            .await?;
        let reply = self
            .guard(
                &step,
                self.compose(&step, &message, &outcome, generation_step_id, metric_id),
            )
            .await?;

        info!(task_id = %task.id, reply_id = %reply.id, "Answer composed");
        Ok(json!({
            "reply_id": reply.id,
            "message_id": message.id,
            "completion_tokens": outcome.metric.completion_tokens,
        }))
    }

    /// Resolve the incoming message this task answers.
    async fn load_subject(&self, task: &Task) -> Result<Message> {
        let message_id = task
            .input
            .get("message_id")
            .and_then(Value::as_str)
            .and_then(|s| Uuid::parse_str(s).ok())
            .ok_or_else(|| TaskError::BadInput {
                id: task.id,
                reason: "missing or malformed message_id".to_string(),
            })?;
        self.store
            .get_message(message_id)
            .await?
            .ok_or_else(|| {
                TaskError::BadInput {
                    id: task.id,
                    reason: format!("message {message_id} does not exist"),
                }
                .into()
            })
    }

    async fn assemble(
        &self,
        step: &Step,
        message: &Message,
        prompt: &Prompt,
    ) -> Result<Vec<Message>> {
        self.steps.start(step.id).await?;
        let history = self
            .assembler
            .assemble(
                message.session_id,
                message.room_id,
                message.actor_id,
                Some(message.id),
            )
            .await?;

        // The system prompt and the message being answered consume part of
        // the window before any history does.
        let budget = self.llm.context_budget()
            - estimate_tokens(&prompt.text)
            - message.token_count.max(estimate_tokens(&message.text));
        let loaded = history.len();
        let kept = ContextAssembler::fit_to_budget(history, budget.max(0));

        self.steps
            .complete(
                step.id,
                &json!({ "loaded": loaded, "kept": kept.len(), "budget": budget.max(0) }),
            )
            .await?;
        Ok(kept)
    }

    async fn generate(
        &self,
        step: &Step,
        message: &Message,
        prompt: &Prompt,
        context: Vec<Message>,
    ) -> Result<(GenerationOutcome, Uuid)> {
        self.steps.start(step.id).await?;

        let mut messages = Vec::with_capacity(context.len() + 2);
        messages.push(ChatMessage::system(prompt.text.clone()));
        for turn in &context {
            messages.push(match turn.actor_kind {
                ActorKind::System => ChatMessage::assistant(turn.text.clone()),
                _ => ChatMessage::user(turn.text.clone()),
            });
        }
        messages.push(ChatMessage::user(message.text.clone()));

        let request = GenerationRequest {
            messages,
            params: prompt.params.clone(),
            max_tokens: self.llm.max_tokens,
        };

        match self.backend.generate(request).await {
            Ok(mut outcome) => {
                outcome.metric.step_id = Some(step.id);
                outcome.metric.prompt_id = Some(prompt.id);
                let metric_id = self.store.insert_generation_metric(&outcome.metric).await?;

                if let Some(reasoning_text) = &outcome.reasoning {
                    self.save_reasoning(step.id, reasoning_text).await?;
                }

                self.steps
                    .complete(
                        step.id,
                        &json!({
                            "metric_id": metric_id,
                            "completion_tokens": outcome.metric.completion_tokens,
                        }),
                    )
                    .await?;
                Ok((outcome, metric_id))
            }
            Err(e) => {
                // Failed calls still leave a metric row.
                let metric = crate::store::types::GenerationMetric {
                    step_id: Some(step.id),
                    prompt_id: Some(prompt.id),
                    host: self.llm.base_url.clone(),
                    model: self.llm.model.clone(),
                    params: prompt.params.clone(),
                    host_ctx: self.llm.n_ctx,
                    error_status: true,
                    error_message: Some(e.to_string()),
                    ..Default::default()
                };
                self.store.insert_generation_metric(&metric).await?;
                Err(e.into())
            }
        }
    }

    async fn save_reasoning(&self, step_id: Uuid, content: &str) -> Result<()> {
        let reasoning = self
            .steps
            .attach_reasoning(step_id, content, ReasoningKind::Dialogue)
            .await?;

        // Indexing is best-effort; a broken index never fails the answer.
        match self.vector.index_reasoning(reasoning.id, content).await {
            Ok(Some(point)) => {
                let metric_id = self.store.insert_embedding_metric(&point.metric).await?;
                self.store
                    .set_reasoning_vector_point(reasoning.id, &point.point_id, Some(metric_id))
                    .await?;
            }
            Ok(None) => {}
            Err(e) => {
                warn!(reasoning_id = %reasoning.id, error = %e, "Reasoning indexing failed");
            }
        }
        Ok(())
    }

    async fn compose(
        &self,
        step: &Step,
        message: &Message,
        outcome: &GenerationOutcome,
        generation_step_id: Uuid,
        metric_id: Uuid,
    ) -> Result<Message> {
        self.steps.start(step.id).await?;

        let agent = self
            .store
            .find_actor_by_kind(ActorKind::System)
            .await?
            .ok_or_else(|| {
                SessionError::BootstrapIncomplete("no system actor seeded".to_string())
            })?;

        let answer_latency = (Utc::now() - message.created_at).num_milliseconds() as f64 / 1000.0;
        let token_count = if outcome.metric.completion_tokens > 0 {
            outcome.metric.completion_tokens
        } else {
            estimate_tokens(&outcome.text)
        };

        let reply = self
            .store
            .insert_message(NewMessage {
                parent_id: Some(message.id),
                actor_id: agent.id,
                actor_kind: ActorKind::System,
                session_id: message.session_id,
                room_id: message.room_id,
                text: outcome.text.clone(),
                token_count,
                answer_latency: Some(answer_latency.max(0.0)),
                step_id: Some(generation_step_id),
                llm_metric_id: Some(metric_id),
            })
            .await?;

        self.steps
            .complete(step.id, &json!({ "reply_id": reply.id }))
            .await?;
        Ok(reply)
    }

    /// Run a stage; if it errors, fail its step before propagating.
    async fn guard<T>(
        &self,
        step: &Step,
        work: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        match work.await {
            Ok(value) => Ok(value),
            Err(e) => {
                if let Err(fail_err) = self.steps.fail(step.id, COMPOSER_MODULE, &e.to_string()).await
                {
                    warn!(step_id = %step.id, error = %fail_err, "Could not mark step failed");
                }
                Err(e)
            }
        }
    }
}
