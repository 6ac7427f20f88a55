//! Provider-agnostic seam to the LLM backend.
//!
//! The core never talks to a vendor API directly. The runtime and the
//! analysis worker drive turns through the [`LlmClient`] trait and the
//! lightweight data types in this module; the concrete adapter lives
//! outside the core and is injected at construction time.
//!
//! All implementations must be thread-safe (`Send + Sync`) so they can be
//! shared between instance workers.

use async_trait::async_trait;
use std::error::Error;
use std::sync::Arc;

/// Conversation roles for a chat turn.
#[derive(Debug, Clone, PartialEq)]
pub enum Role {
    /// Primes or constrains assistant behaviour.
    System,
    /// A human-authored (or synthetic) request turn.
    User,
    /// A model response turn.
    Assistant,
    /// A tool-result turn correlating with a prior assistant [`ToolCallRequest`].
    Tool { call_id: String },
}

/// A single chat message. Content is `Arc<str>` so histories clone cheaply.
#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub role: Role,
    pub content: Arc<str>,
    /// Tool calls requested by the assistant; non-empty only on assistant
    /// messages returned by [`LlmClient::complete`].
    pub tool_calls: Vec<ToolCallRequest>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self::plain(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::plain(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::plain(Role::Assistant, content)
    }

    pub fn tool_result(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self::plain(
            Role::Tool {
                call_id: call_id.into(),
            },
            content,
        )
    }

    fn plain(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: Arc::from(content.into().as_str()),
            tool_calls: Vec::new(),
        }
    }
}

/// A tool invocation requested by the model in a native function-calling
/// response. The provider-assigned `id` correlates the eventual result.
#[derive(Debug, Clone)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
}

/// Tool schema forwarded to the provider with a chat request.
///
/// `prompt_cache` marks the entry for the provider's upstream prompt cache;
/// the flag is sourced from the active skill's per-tool cache policy.
#[derive(Debug, Clone)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters_schema: serde_json::Value,
    pub prompt_cache: bool,
}

/// Why the model stopped generating.
#[derive(Debug, Clone, PartialEq)]
pub enum StopReason {
    /// Natural end of the assistant turn.
    EndTurn,
    /// The model stopped to request tool execution.
    ToolUse,
    /// Output budget exhausted mid-generation.
    MaxTokens,
    /// Provider-specific reason the core treats as terminal.
    Other(String),
}

/// Prompt vs. completion token accounting for one provider round-trip.
#[derive(Debug, Clone, Default)]
pub struct TokenUsage {
    pub input_tokens: usize,
    pub output_tokens: usize,
    pub total_tokens: usize,
}

impl TokenUsage {
    /// Fold another round-trip's usage into this accumulator.
    pub fn absorb(&mut self, other: &TokenUsage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.total_tokens += other.total_tokens;
    }
}

/// One full provider response: text, any tool calls, the stop reason, and
/// token accounting when the provider reports it.
#[derive(Debug, Clone)]
pub struct LlmResponse {
    pub content: String,
    pub tool_calls: Vec<ToolCallRequest>,
    pub stop_reason: StopReason,
    pub usage: Option<TokenUsage>,
}

impl LlmResponse {
    /// True when the provider produced neither text nor tool calls. The task
    /// loop treats this with `stop_reason == EndTurn` as a hard failure
    /// rather than retrying blindly.
    pub fn is_empty(&self) -> bool {
        self.content.trim().is_empty() && self.tool_calls.is_empty()
    }
}

/// Trait-driven abstraction for the concrete LLM provider.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Send a full request/response chat completion. The `messages` slice
    /// includes any system priming the caller wishes to send; `tools`
    /// carries the active mode's tool catalog.
    async fn complete(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolSpec],
    ) -> Result<LlmResponse, Box<dyn Error + Send + Sync>>;

    /// Identifier used to select the upstream model (e.g. `"gpt-4.1"`).
    fn model_name(&self) -> &str;
}
