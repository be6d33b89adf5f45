//! Bounded per-conversation context.
//!
//! Each conversation (one Slack channel) owns an ordered list of turns that is
//! sent in full to the completion API. A fresh conversation starts with a
//! single system turn carrying the persona; every append is followed by a
//! trim back down to `max_turns`.
//!
//! Conversations live in a [`DashMap`] keyed by channel ID. The map is only
//! locked for lookup and insert; mutation of one conversation is serialized by
//! its own async mutex, so different channels never wait on each other.

use cine_common::config::{ContextConfig, TrimPolicyKind};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Opaque conversation key (the chat channel ID).
pub type ConversationId = String;

/// Speaker of a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One message in a conversation context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub content: String,
}

impl Turn {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

// ============================================================================
// Trim policies
// ============================================================================

/// Strategy that shrinks a context back to its retention window.
pub trait TrimPolicy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Shrink `turns` so that `turns.len() <= max_turns`.
    fn trim(&self, turns: &mut Vec<Turn>, max_turns: usize);
}

/// Keep the newest `max_turns` turns counted from the end.
///
/// Once a conversation overflows, the persona turn is evicted like any other.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeepLatest;

impl TrimPolicy for KeepLatest {
    fn name(&self) -> &'static str {
        "keep_latest"
    }

    fn trim(&self, turns: &mut Vec<Turn>, max_turns: usize) {
        if turns.len() > max_turns {
            let excess = turns.len() - max_turns;
            turns.drain(..excess);
        }
    }
}

/// Keep a leading system turn and the newest `max_turns - 1` other turns.
#[derive(Debug, Clone, Copy, Default)]
pub struct PreservePersona;

impl TrimPolicy for PreservePersona {
    fn name(&self) -> &'static str {
        "preserve_persona"
    }

    fn trim(&self, turns: &mut Vec<Turn>, max_turns: usize) {
        if turns.len() <= max_turns {
            return;
        }

        let pinned = usize::from(turns.first().is_some_and(|t| t.role == Role::System));
        if pinned == 0 || max_turns <= pinned {
            KeepLatest.trim(turns, max_turns);
            return;
        }

        let excess = turns.len() - max_turns;
        turns.drain(pinned..pinned + excess);
    }
}

/// Resolve a configured policy name to its implementation.
pub fn trim_policy(kind: TrimPolicyKind) -> Arc<dyn TrimPolicy> {
    match kind {
        TrimPolicyKind::KeepLatest => Arc::new(KeepLatest),
        TrimPolicyKind::PreservePersona => Arc::new(PreservePersona),
    }
}

// ============================================================================
// Store
// ============================================================================

type SharedContext = Arc<Mutex<Vec<Turn>>>;

/// Process-wide map from conversation ID to its bounded context.
pub struct ContextStore {
    conversations: DashMap<ConversationId, SharedContext>,
    persona: String,
    max_turns: usize,
    policy: Arc<dyn TrimPolicy>,
}

impl ContextStore {
    /// Create a store with the default keep-latest policy.
    pub fn new(persona: impl Into<String>, max_turns: usize) -> Self {
        Self::with_policy(persona, max_turns, Arc::new(KeepLatest))
    }

    /// Create a store with an explicit trim policy. `max_turns` is clamped to 1.
    pub fn with_policy(
        persona: impl Into<String>,
        max_turns: usize,
        policy: Arc<dyn TrimPolicy>,
    ) -> Self {
        Self {
            conversations: DashMap::new(),
            persona: persona.into(),
            max_turns: max_turns.max(1),
            policy,
        }
    }

    pub fn from_config(config: &ContextConfig) -> Self {
        Self::with_policy(
            config.persona.clone(),
            config.max_turns,
            trim_policy(config.trim_policy),
        )
    }

    pub fn max_turns(&self) -> usize {
        self.max_turns
    }

    pub fn policy_name(&self) -> &'static str {
        self.policy.name()
    }

    /// Number of conversations tracked.
    pub fn len(&self) -> usize {
        self.conversations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conversations.is_empty()
    }

    pub fn contains(&self, conversation_id: &str) -> bool {
        self.conversations.contains_key(conversation_id)
    }

    fn entry(&self, conversation_id: &str) -> SharedContext {
        self.conversations
            .entry(conversation_id.to_string())
            .or_insert_with(|| {
                tracing::debug!(conversation_id, "Creating conversation context");
                Arc::new(Mutex::new(vec![Turn::system(self.persona.clone())]))
            })
            .value()
            .clone()
    }

    /// Snapshot of a conversation, creating it with the persona turn if absent.
    pub async fn get_or_create(&self, conversation_id: &str) -> Vec<Turn> {
        self.entry(conversation_id).lock().await.clone()
    }

    /// Snapshot of a conversation without creating it.
    pub async fn snapshot(&self, conversation_id: &str) -> Option<Vec<Turn>> {
        let shared = self
            .conversations
            .get(conversation_id)
            .map(|entry| entry.value().clone())?;
        let turns = shared.lock().await.clone();
        Some(turns)
    }

    /// Append one turn and trim to the retention window.
    pub async fn append(&self, conversation_id: &str, turn: Turn) {
        self.lock(conversation_id).await.append(turn);
    }

    /// Take exclusive access to one conversation until the guard is dropped.
    ///
    /// Waiters are served in the order they started waiting.
    pub async fn lock(&self, conversation_id: &str) -> ConversationGuard {
        let turns = self.entry(conversation_id).lock_owned().await;
        ConversationGuard {
            turns,
            max_turns: self.max_turns,
            policy: self.policy.clone(),
        }
    }
}

/// Exclusive handle to one conversation's context.
pub struct ConversationGuard {
    turns: OwnedMutexGuard<Vec<Turn>>,
    max_turns: usize,
    policy: Arc<dyn TrimPolicy>,
}

impl ConversationGuard {
    pub fn append(&mut self, turn: Turn) {
        self.turns.push(turn);
        self.policy.trim(&mut self.turns, self.max_turns);
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PERSONA: &str = "You recommend films.";

    fn numbered(n: usize) -> Vec<Turn> {
        (0..n)
            .map(|i| {
                if i % 2 == 0 {
                    Turn::user(format!("u{i}"))
                } else {
                    Turn::assistant(format!("a{i}"))
                }
            })
            .collect()
    }

    #[tokio::test]
    async fn test_fresh_context_is_single_persona_turn() {
        let store = ContextStore::new(PERSONA, 11);
        for id in ["C1", "C2", "D0042"] {
            let ctx = store.get_or_create(id).await;
            assert_eq!(ctx, vec![Turn::system(PERSONA)]);
        }
        assert_eq!(store.len(), 3);
    }

    #[tokio::test]
    async fn test_get_or_create_is_idempotent() {
        let store = ContextStore::new(PERSONA, 11);
        store.append("C1", Turn::user("hello")).await;

        let first = store.get_or_create("C1").await;
        let second = store.get_or_create("C1").await;
        assert_eq!(first, second);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_snapshot_does_not_create() {
        let store = ContextStore::new(PERSONA, 11);
        assert!(store.snapshot("C1").await.is_none());
        assert!(!store.contains("C1"));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_append_on_unknown_conversation_seeds_persona() {
        let store = ContextStore::new(PERSONA, 11);
        store.append("C1", Turn::user("hi")).await;

        let ctx = store.snapshot("C1").await.unwrap();
        assert_eq!(ctx, vec![Turn::system(PERSONA), Turn::user("hi")]);
    }

    #[tokio::test]
    async fn test_keep_latest_trims_from_the_end() {
        let max = 11;
        let store = ContextStore::new(PERSONA, max);
        let appended = numbered(25);
        for turn in &appended {
            store.append("C1", turn.clone()).await;
        }

        let mut logical = vec![Turn::system(PERSONA)];
        logical.extend(appended);
        let expected = logical[logical.len() - max..].to_vec();

        let ctx = store.get_or_create("C1").await;
        assert_eq!(ctx.len(), max);
        assert_eq!(ctx, expected);
        assert!(ctx.iter().all(|t| t.role != Role::System));
    }

    #[tokio::test]
    async fn test_keep_latest_boundary_keeps_persona_until_overflow() {
        let store = ContextStore::new(PERSONA, 3);
        store.append("C1", Turn::user("one")).await;
        store.append("C1", Turn::assistant("two")).await;
        assert_eq!(store.get_or_create("C1").await[0], Turn::system(PERSONA));

        store.append("C1", Turn::user("three")).await;
        let ctx = store.get_or_create("C1").await;
        assert_eq!(
            ctx,
            vec![Turn::user("one"), Turn::assistant("two"), Turn::user("three")]
        );
    }

    #[tokio::test]
    async fn test_preserve_persona_pins_system_turn() {
        let store = ContextStore::with_policy(PERSONA, 5, Arc::new(PreservePersona));
        let appended = numbered(10);
        for turn in &appended {
            store.append("C1", turn.clone()).await;
        }

        let ctx = store.get_or_create("C1").await;
        assert_eq!(ctx.len(), 5);
        assert_eq!(ctx[0], Turn::system(PERSONA));
        assert_eq!(&ctx[1..], &appended[6..]);
    }

    #[test]
    fn test_preserve_persona_without_leading_system_falls_back() {
        let mut turns = numbered(6);
        PreservePersona.trim(&mut turns, 4);
        assert_eq!(turns, numbered(6)[2..].to_vec());
    }

    #[test]
    fn test_preserve_persona_with_single_slot() {
        let mut turns = vec![Turn::system(PERSONA), Turn::user("a"), Turn::user("b")];
        PreservePersona.trim(&mut turns, 1);
        assert_eq!(turns, vec![Turn::user("b")]);
    }

    #[test]
    fn test_trim_policy_from_config_kind() {
        assert_eq!(trim_policy(TrimPolicyKind::KeepLatest).name(), "keep_latest");
        assert_eq!(
            trim_policy(TrimPolicyKind::PreservePersona).name(),
            "preserve_persona"
        );
    }

    #[test]
    fn test_from_config_clamps_zero_max_turns() {
        let config = ContextConfig {
            max_turns: 0,
            ..ContextConfig::default()
        };
        let store = ContextStore::from_config(&config);
        assert_eq!(store.max_turns(), 1);
        assert_eq!(store.policy_name(), "keep_latest");
    }

    #[tokio::test]
    async fn test_conversations_are_independent() {
        let store = ContextStore::new(PERSONA, 11);
        store.append("C1", Turn::user("parasite")).await;
        store.append("C2", Turn::user("heat")).await;

        assert_eq!(store.get_or_create("C1").await[1], Turn::user("parasite"));
        assert_eq!(store.get_or_create("C2").await[1], Turn::user("heat"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_guard_serializes_read_modify_write() {
        let store = Arc::new(ContextStore::new(PERSONA, 1000));
        let mut handles = Vec::new();
        for worker in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                for i in 0..20 {
                    let mut guard = store.lock("C1").await;
                    guard.append(Turn::user(format!("w{worker}-{i}")));
                    tokio::task::yield_now().await;
                    guard.append(Turn::assistant(format!("w{worker}-{i}")));
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let ctx = store.get_or_create("C1").await;
        assert_eq!(ctx.len(), 1 + 8 * 20 * 2);
        for pair in ctx[1..].chunks(2) {
            assert_eq!(pair[0].role, Role::User);
            assert_eq!(pair[1].role, Role::Assistant);
            assert_eq!(pair[0].content, pair[1].content);
        }
    }

    #[test]
    fn test_turn_serializes_in_completion_format() {
        let json = serde_json::to_value(Turn::assistant("Try Memories of Murder")).unwrap();
        assert_eq!(json["role"], "assistant");
        assert_eq!(json["content"], "Try Memories of Murder");
    }
}
