//! Reasoning-backend clients.
//!
//! All three backends speak the OpenAI chat-completions dialect; they differ only in how their
//! streaming chunks are shaped, which `sources` normalizes.

use std::fmt;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

mod http;
mod sources;
mod sse;

pub use http::HttpBackend;
pub use sources::{source_for, DeepSeekSource, OpenAiSource, StreamSource, XaiSource};
pub use sse::{sse_data_stream, SseReadError};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EngineId {
    #[serde(rename = "openai")]
    Primary,
    #[serde(rename = "deepseek")]
    Analyst,
    #[serde(rename = "xai")]
    Critic,
}

impl EngineId {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Primary => "openai",
            Self::Analyst => "deepseek",
            Self::Critic => "xai",
        }
    }

    pub fn from_path(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "openai" => Some(Self::Primary),
            "deepseek" => Some(Self::Analyst),
            "xai" => Some(Self::Critic),
            _ => None,
        }
    }
}

impl fmt::Display for EngineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A chat-completions message in wire format.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self::text(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::text(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::text(Role::Assistant, content)
    }

    /// The assistant turn that requested `calls`, replayed so tool results have a parent.
    pub fn assistant_tool_calls(content: Option<String>, calls: Vec<ToolCallRequest>) -> Self {
        Self { role: Role::Assistant, content, tool_calls: calls, tool_call_id: None }
    }

    pub fn tool_result(call_id: impl Into<String>, payload: &Value) -> Self {
        Self {
            role: Role::Tool,
            content: Some(payload.to_string()),
            tool_calls: Vec::new(),
            tool_call_id: Some(call_id.into()),
        }
    }

    fn text(role: Role, content: impl Into<String>) -> Self {
        Self { role, content: Some(content.into()), tool_calls: Vec::new(), tool_call_id: None }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type", default = "function_kind")]
    pub kind: String,
    pub function: FunctionCall,
}

impl ToolCallRequest {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        arguments: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            kind: function_kind(),
            function: FunctionCall { name: name.into(), arguments: arguments.into() },
        }
    }
}

fn function_kind() -> String {
    "function".to_string()
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    /// JSON-encoded object, exactly as the backend produced it.
    #[serde(default)]
    pub arguments: String,
}

/// A function the backend may call.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ToolSpec {
    pub name: &'static str,
    pub description: &'static str,
    pub parameters: Value,
}

#[derive(Clone, Debug, Default)]
pub struct CompletionRequest {
    pub messages: Vec<ChatMessage>,
    /// Empty disables tool use for the call.
    pub tools: Vec<ToolSpec>,
}

impl CompletionRequest {
    pub fn text_only(messages: Vec<ChatMessage>) -> Self {
        Self { messages, tools: Vec::new() }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    #[serde(default)]
    pub prompt_tokens: u32,
    #[serde(default)]
    pub completion_tokens: u32,
    #[serde(default)]
    pub total_tokens: u32,
}

impl TokenUsage {
    pub fn add(&mut self, other: TokenUsage) {
        self.prompt_tokens = self.prompt_tokens.saturating_add(other.prompt_tokens);
        self.completion_tokens = self.completion_tokens.saturating_add(other.completion_tokens);
        self.total_tokens = self.total_tokens.saturating_add(other.total());
    }

    /// Some backends omit `total_tokens`.
    pub fn total(&self) -> u32 {
        if self.total_tokens > 0 {
            self.total_tokens
        } else {
            self.prompt_tokens.saturating_add(self.completion_tokens)
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ModelReply {
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCallRequest>,
    pub usage: TokenUsage,
}

/// One normalized streaming delta.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StreamChunk {
    pub text: Option<String>,
    pub tool_call_seen: bool,
    pub usage: Option<TokenUsage>,
    pub finished: bool,
}

pub type ChunkStream = BoxStream<'static, Result<StreamChunk, BackendError>>;

#[async_trait]
pub trait ReasoningBackend: Send + Sync {
    fn engine(&self) -> EngineId;

    /// `false` when no credential is configured. Callers degrade instead of calling out.
    fn is_available(&self) -> bool;

    async fn complete(&self, request: &CompletionRequest) -> Result<ModelReply, BackendError>;

    async fn stream(&self, request: &CompletionRequest) -> Result<ChunkStream, BackendError>;
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("{engine} backend has no credential configured")]
    NotConfigured { engine: EngineId },
    #[error("{engine} backend timed out after {duration_secs}s")]
    Timeout { engine: EngineId, duration_secs: u64 },
    #[error("{engine} backend unreachable: {reason}")]
    Transport { engine: EngineId, reason: String },
    #[error("{engine} backend returned HTTP {status}: {body}")]
    UpstreamStatus { engine: EngineId, status: u16, body: String },
    #[error("{engine} backend sent a malformed response: {reason}")]
    MalformedResponse { engine: EngineId, reason: String },
    #[error("malformed stream chunk: {reason}")]
    MalformedChunk { reason: String },
}

impl BackendError {
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::NotConfigured { .. } => "backend_not_configured",
            Self::Timeout { .. } => "backend_timeout",
            Self::Transport { .. } => "backend_unreachable",
            Self::UpstreamStatus { .. } => "backend_http_status",
            Self::MalformedResponse { .. } => "backend_malformed_response",
            Self::MalformedChunk { .. } => "backend_malformed_chunk",
        }
    }
}
