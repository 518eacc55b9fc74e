//! Conversation context assembly.
//!
//! The model sees a sliding window over the dialogue: the speaker's most
//! recent turns plus the agent replies addressed to them, in chronological
//! order. The window counts the speaker's turns only, so an agent that
//! answers every message does not halve the usable history. A second pass
//! trims the window to a token budget, dropping from the oldest end.

use std::sync::Arc;

use uuid::Uuid;

use crate::error::Result;
use crate::store::Store;
use crate::store::types::Message;
use crate::tokens::estimate_tokens;

pub struct ContextAssembler {
    store: Arc<dyn Store>,
    window: usize,
}

impl ContextAssembler {
    pub fn new(store: Arc<dyn Store>, window: usize) -> Self {
        Self { store, window }
    }

    /// Load the context for one speaker in one room of one session, oldest
    /// first. `exclude` removes the message currently being answered, so the
    /// history never contains the turn the model is about to see as its
    /// prompt. A fresh conversation yields an empty vector.
    pub async fn assemble(
        &self,
        session_id: Uuid,
        room_id: Uuid,
        actor_id: Uuid,
        exclude: Option<Uuid>,
    ) -> Result<Vec<Message>> {
        let messages = self
            .store
            .recent_exchange(session_id, room_id, actor_id, self.window, exclude)
            .await?;
        Ok(messages)
    }

    /// Trim `messages` (oldest first) until the estimated total fits within
    /// `budget_tokens`. The newest message always survives, even if it alone
    /// exceeds the budget.
    pub fn fit_to_budget(mut messages: Vec<Message>, budget_tokens: i64) -> Vec<Message> {
        let mut total: i64 = messages.iter().map(message_tokens).sum();
        while messages.len() > 1 && total > budget_tokens {
            let dropped = messages.remove(0);
            total -= message_tokens(&dropped);
        }
        messages
    }
}

/// Prefer the token count recorded at save time; fall back to estimating
/// from the text for rows written before counting existed.
fn message_tokens(msg: &Message) -> i64 {
    if msg.token_count > 0 {
        msg.token_count
    } else {
        estimate_tokens(&msg.text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::LibSqlStore;
    use crate::store::types::{ActorKind, NewMessage};

    struct Fixture {
        store: Arc<LibSqlStore>,
        agent_id: Uuid,
        user_id: Uuid,
        session_id: Uuid,
        room_id: Uuid,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(LibSqlStore::new_memory().await.unwrap());
        let agent = store
            .insert_actor(ActorKind::System, true, true, serde_json::json!({}))
            .await
            .unwrap();
        let user = store
            .insert_actor(ActorKind::Owner, true, true, serde_json::json!({}))
            .await
            .unwrap();
        let room = store.insert_room("open_dialogue").await.unwrap();
        let session = store.insert_session(user.id, None, room.id).await.unwrap();
        Fixture {
            store,
            agent_id: agent.id,
            user_id: user.id,
            session_id: session.id,
            room_id: room.id,
        }
    }

    impl Fixture {
        async fn user_turn(&self, text: &str) -> Message {
            self.turn(self.session_id, self.room_id, self.user_id, ActorKind::Owner, None, text)
                .await
        }

        async fn agent_reply(&self, parent: Uuid, text: &str) -> Message {
            self.turn(
                self.session_id,
                self.room_id,
                self.agent_id,
                ActorKind::System,
                Some(parent),
                text,
            )
            .await
        }

        async fn turn(
            &self,
            session_id: Uuid,
            room_id: Uuid,
            actor_id: Uuid,
            actor_kind: ActorKind,
            parent_id: Option<Uuid>,
            text: &str,
        ) -> Message {
            self.store
                .insert_message(NewMessage {
                    parent_id,
                    actor_id,
                    actor_kind,
                    session_id,
                    room_id,
                    text: text.to_string(),
                    token_count: estimate_tokens(text),
                    answer_latency: None,
                    step_id: None,
                    llm_metric_id: None,
                })
                .await
                .unwrap()
        }
    }

    fn msg_with_tokens(text: &str, tokens: i64) -> Message {
        Message {
            id: Uuid::new_v4(),
            parent_id: None,
            actor_id: Uuid::new_v4(),
            actor_kind: ActorKind::User,
            session_id: Uuid::new_v4(),
            room_id: Uuid::new_v4(),
            text: text.to_string(),
            normalized_text: None,
            token_count: tokens,
            answer_latency: None,
            step_id: None,
            llm_metric_id: None,
            created_at: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn empty_history_is_ok() {
        let fx = fixture().await;
        let assembler = ContextAssembler::new(fx.store.clone(), 7);
        let ctx = assembler
            .assemble(fx.session_id, fx.room_id, fx.user_id, None)
            .await
            .unwrap();
        assert!(ctx.is_empty());
    }

    #[tokio::test]
    async fn window_counts_speaker_turns_not_replies() {
        let fx = fixture().await;
        for i in 0..10 {
            let m = fx.user_turn(&format!("question {i}")).await;
            fx.agent_reply(m.id, &format!("answer {i}")).await;
        }

        let assembler = ContextAssembler::new(fx.store.clone(), 7);
        let ctx = assembler
            .assemble(fx.session_id, fx.room_id, fx.user_id, None)
            .await
            .unwrap();

        // 7 speaker turns plus their 7 replies, interleaved ascending.
        assert_eq!(ctx.len(), 14);
        assert_eq!(ctx.first().unwrap().text, "question 3");
        assert_eq!(ctx.last().unwrap().text, "answer 9");
        for pair in ctx.chunks(2) {
            assert_eq!(pair[0].actor_kind, ActorKind::Owner);
            assert_eq!(pair[1].actor_kind, ActorKind::System);
            assert_eq!(pair[1].parent_id, Some(pair[0].id));
        }
    }

    #[tokio::test]
    async fn exclude_removes_the_turn_being_answered() {
        let fx = fixture().await;
        let old = fx.user_turn("earlier question").await;
        fx.agent_reply(old.id, "earlier answer").await;
        let current = fx.user_turn("current question").await;

        let assembler = ContextAssembler::new(fx.store.clone(), 7);
        let ctx = assembler
            .assemble(fx.session_id, fx.room_id, fx.user_id, Some(current.id))
            .await
            .unwrap();

        let texts: Vec<&str> = ctx.iter().map(|m| m.text.as_str()).collect();
        assert_eq!(texts, vec!["earlier question", "earlier answer"]);
    }

    #[tokio::test]
    async fn other_rooms_actors_and_sessions_are_invisible() {
        let fx = fixture().await;
        fx.user_turn("in scope").await;

        // Same session, different room.
        let other_room = fx.store.insert_room("workshop").await.unwrap();
        fx.turn(fx.session_id, other_room.id, fx.user_id, ActorKind::Owner, None, "other room")
            .await;

        // Same room, different actor.
        let stranger = fx
            .store
            .insert_actor(ActorKind::User, true, false, serde_json::json!({}))
            .await
            .unwrap();
        fx.turn(fx.session_id, fx.room_id, stranger.id, ActorKind::User, None, "stranger")
            .await;

        // Different session entirely.
        let other_session = fx
            .store
            .insert_session(fx.user_id, None, fx.room_id)
            .await
            .unwrap();
        fx.turn(other_session.id, fx.room_id, fx.user_id, ActorKind::Owner, None, "other session")
            .await;

        let assembler = ContextAssembler::new(fx.store.clone(), 7);
        let ctx = assembler
            .assemble(fx.session_id, fx.room_id, fx.user_id, None)
            .await
            .unwrap();
        let texts: Vec<&str> = ctx.iter().map(|m| m.text.as_str()).collect();
        assert_eq!(texts, vec!["in scope"]);
    }

    #[test]
    fn budget_drops_oldest_first() {
        let messages = vec![
            msg_with_tokens("oldest", 100),
            msg_with_tokens("middle", 100),
            msg_with_tokens("newest", 100),
        ];
        let kept = ContextAssembler::fit_to_budget(messages, 250);
        let texts: Vec<&str> = kept.iter().map(|m| m.text.as_str()).collect();
        assert_eq!(texts, vec!["middle", "newest"]);
    }

    #[test]
    fn newest_survives_even_over_budget() {
        let messages = vec![
            msg_with_tokens("oldest", 500),
            msg_with_tokens("newest", 500),
        ];
        let kept = ContextAssembler::fit_to_budget(messages, 10);
        let texts: Vec<&str> = kept.iter().map(|m| m.text.as_str()).collect();
        assert_eq!(texts, vec!["newest"]);
    }

    #[test]
    fn under_budget_is_untouched() {
        let messages = vec![
            msg_with_tokens("a", 10),
            msg_with_tokens("b", 10),
        ];
        let kept = ContextAssembler::fit_to_budget(messages, 100);
        assert_eq!(kept.len(), 2);
    }
}
