//! Sampling and completion params.
//!
//! `sampling/createMessage` travels server → client; `completion/complete`
//! travels client → server.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Role of a sampling message author.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[allow(missing_docs)]
pub enum Role {
    User,
    Assistant,
}

/// One message in a sampling conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplingMessage {
    /// Author
    pub role: Role,

    /// Content block (`{"type": "text", "text": ...}` and friends)
    pub content: Value,
}

impl SamplingMessage {
    /// A plain-text user message.
    pub fn user_text(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: serde_json::json!({"type": "text", "text": text.into()}),
        }
    }
}

/// Params of `sampling/createMessage`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateMessageParams {
    /// Conversation so far
    pub messages: Vec<SamplingMessage>,

    /// Upper bound on generated tokens
    pub max_tokens: u32,

    /// Optional system prompt
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,

    /// Optional sampling temperature
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,

    /// Model preferences, stop sequences, metadata and the like
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl CreateMessageParams {
    /// Sample from `messages` with a token budget.
    pub fn new(messages: Vec<SamplingMessage>, max_tokens: u32) -> Self {
        Self {
            messages,
            max_tokens,
            system_prompt: None,
            temperature: None,
            extra: Map::new(),
        }
    }
}

/// Params of `completion/complete`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompleteParams {
    /// What is being completed (`ref/prompt` or `ref/resource`)
    #[serde(rename = "ref")]
    pub reference: Value,

    /// Argument being completed
    pub argument: CompletionArgument,
}

/// The argument a completion is requested for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionArgument {
    /// Argument name
    pub name: String,

    /// Partial value typed so far
    pub value: String,
}
