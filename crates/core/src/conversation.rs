//! Conversation turns and history
//!
//! The history is owned exclusively by the dialogue manager, which is the
//! single writer; everything here is plain data.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier for one user-utterance/assistant-response exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TurnId(pub Uuid);

impl TurnId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TurnId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TurnId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Role of a message within a turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnRole {
    User,
    Assistant,
}

/// Lifecycle of a turn's assistant response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnStatus {
    /// Response still streaming
    InProgress,
    /// Response streamed to completion
    Completed,
    /// User barged in; spoken prefix retained, the rest discarded
    Cancelled,
    /// LLM failed; assistant text is the configured fallback
    Fallback,
}

/// An ordered fragment of assistant output text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseChunk {
    pub turn: TurnId,
    /// Monotonic index within the turn
    pub index: u32,
    pub text: String,
    /// Marks the last chunk of the turn
    pub is_final: bool,
}

impl ResponseChunk {
    pub fn new(turn: TurnId, index: u32, text: impl Into<String>) -> Self {
        Self {
            turn,
            index,
            text: text.into(),
            is_final: false,
        }
    }

    pub fn final_chunk(turn: TurnId, index: u32, text: impl Into<String>) -> Self {
        Self {
            turn,
            index,
            text: text.into(),
            is_final: true,
        }
    }
}

/// One exchange unit: a user utterance paired with the assistant response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub id: TurnId,
    /// Final user transcript; empty for an assistant-initiated greeting turn
    pub user_text: String,
    /// Assistant response accumulated so far (only spoken chunks survive a
    /// cancellation)
    pub assistant_text: String,
    pub status: TurnStatus,
    pub created_at: DateTime<Utc>,
}

impl Turn {
    pub fn new(user_text: impl Into<String>) -> Self {
        Self {
            id: TurnId::new(),
            user_text: user_text.into(),
            assistant_text: String::new(),
            status: TurnStatus::InProgress,
            created_at: Utc::now(),
        }
    }
}

/// Ordered conversation history for one session.
///
/// Turns are appended strictly in the order their defining event occurs.
/// Finalized turns are immutable except for cancellation marking.
#[derive(Debug, Default)]
pub struct ConversationHistory {
    turns: Vec<Turn>,
}

impl ConversationHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, turn: Turn) -> TurnId {
        let id = turn.id;
        self.turns.push(turn);
        id
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn get_mut(&mut self, id: TurnId) -> Option<&mut Turn> {
        self.turns.iter_mut().find(|t| t.id == id)
    }

    pub fn last(&self) -> Option<&Turn> {
        self.turns.last()
    }

    /// Append text a synthesis stage has actually spoken for a turn
    pub fn record_spoken(&mut self, id: TurnId, text: &str) {
        if let Some(turn) = self.get_mut(id) {
            turn.assistant_text.push_str(text);
        }
    }

    /// Mark a turn cancelled, keeping whatever was already spoken
    pub fn mark_cancelled(&mut self, id: TurnId) {
        if let Some(turn) = self.get_mut(id) {
            turn.status = TurnStatus::Cancelled;
        }
    }

    pub fn mark_completed(&mut self, id: TurnId) {
        if let Some(turn) = self.get_mut(id) {
            turn.status = TurnStatus::Completed;
        }
    }
}
