//! Language-model capability trait and request types

use crate::conversation::{Turn, TurnRole, TurnStatus};
use crate::error::Result;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

/// Role of a message in a completion request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl From<TurnRole> for Role {
    fn from(role: TurnRole) -> Self {
        match role {
            TurnRole::User => Role::User,
            TurnRole::Assistant => Role::Assistant,
        }
    }
}

/// One message in the ordered completion context
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
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

/// Ordered conversation context for one completion call.
#[derive(Debug, Clone, Default)]
pub struct CompletionRequest {
    pub messages: Vec<Message>,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl CompletionRequest {
    pub fn new(system_prompt: impl Into<String>) -> Self {
        Self {
            messages: vec![Message::system(system_prompt)],
            max_tokens: 256,
            temperature: 0.7,
        }
    }

    /// Append completed turns from history in order.
    ///
    /// A cancelled turn contributes only the text actually spoken before the
    /// user barged in; a fallback turn contributes its apology text.
    pub fn with_history(mut self, turns: &[Turn]) -> Self {
        for turn in turns {
            if !turn.user_text.is_empty() {
                self.messages.push(Message::user(&turn.user_text));
            }
            if !turn.assistant_text.is_empty()
                && matches!(
                    turn.status,
                    TurnStatus::Completed | TurnStatus::Cancelled | TurnStatus::Fallback
                )
            {
                self.messages.push(Message::assistant(&turn.assistant_text));
            }
        }
        self
    }

    pub fn with_user_message(mut self, content: impl Into<String>) -> Self {
        self.messages.push(Message::user(content));
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }
}

/// Incremental completion output
#[derive(Debug, Clone)]
pub struct CompletionChunk {
    /// New text since the previous chunk
    pub delta: String,
    /// Marks the end of the completion
    pub is_final: bool,
}

/// Streaming language-model completion.
pub trait LlmCapability: Send + Sync + 'static {
    /// Stream a completion for the given ordered context.
    ///
    /// Cancelling the token must abort generation promptly and end the
    /// stream; resources are freed, not merely ignored.
    fn complete(
        &self,
        request: CompletionRequest,
        cancel: CancellationToken,
    ) -> BoxStream<'static, Result<CompletionChunk>>;

    /// Model name for logging
    fn model_name(&self) -> &str;
}
