//! Per-backend streaming chunk adapters.
//!
//! Every backend streams `choices[0].delta` objects, but they disagree on where usage arrives,
//! whether reasoning text is interleaved, and whether `stream_options` is accepted.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;

use super::{BackendError, EngineId, StreamChunk, TokenUsage};

pub trait StreamSource: Send + Sync {
    fn engine(&self) -> EngineId;

    /// Whether the request may carry `stream_options.include_usage`.
    fn request_usage_option(&self) -> bool;

    /// Normalizes one SSE `data:` payload. `Ok(None)` means the chunk carried nothing to relay.
    fn parse_chunk(&self, data: &str) -> Result<Option<StreamChunk>, BackendError>;
}

pub fn source_for(engine: EngineId) -> Arc<dyn StreamSource> {
    match engine {
        EngineId::Primary => Arc::new(OpenAiSource),
        EngineId::Analyst => Arc::new(DeepSeekSource),
        EngineId::Critic => Arc::new(XaiSource),
    }
}

#[derive(Debug, Deserialize)]
struct CompletionChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
    #[serde(default)]
    usage: Option<TokenUsage>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    reasoning_content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<Value>>,
}

fn decode(data: &str) -> Result<CompletionChunk, BackendError> {
    serde_json::from_str(data).map_err(|error| BackendError::MalformedChunk {
        reason: format!("{error} (data: {})", truncate(data, 160)),
    })
}

fn truncate(data: &str, max_chars: usize) -> String {
    data.chars().take(max_chars).collect()
}

fn normalize(chunk: CompletionChunk) -> Option<StreamChunk> {
    let mut normalized = StreamChunk { usage: chunk.usage, ..StreamChunk::default() };
    if let Some(choice) = chunk.choices.into_iter().next() {
        normalized.text = choice.delta.content.filter(|content| !content.is_empty());
        normalized.tool_call_seen =
            choice.delta.tool_calls.is_some_and(|calls| !calls.is_empty());
        normalized.finished = choice.finish_reason.is_some();
    }

    let empty = normalized.text.is_none()
        && !normalized.tool_call_seen
        && normalized.usage.is_none()
        && !normalized.finished;
    (!empty).then_some(normalized)
}

/// Usage arrives once, on a trailing chunk with no choices.
#[derive(Clone, Copy, Debug, Default)]
pub struct OpenAiSource;

impl StreamSource for OpenAiSource {
    fn engine(&self) -> EngineId {
        EngineId::Primary
    }

    fn request_usage_option(&self) -> bool {
        true
    }

    fn parse_chunk(&self, data: &str) -> Result<Option<StreamChunk>, BackendError> {
        decode(data).map(normalize)
    }
}

/// Reasoning text arrives in `reasoning_content` ahead of the answer and is never relayed.
#[derive(Clone, Copy, Debug, Default)]
pub struct DeepSeekSource;

impl StreamSource for DeepSeekSource {
    fn engine(&self) -> EngineId {
        EngineId::Analyst
    }

    fn request_usage_option(&self) -> bool {
        true
    }

    fn parse_chunk(&self, data: &str) -> Result<Option<StreamChunk>, BackendError> {
        let mut chunk = decode(data)?;
        for choice in &mut chunk.choices {
            choice.delta.reasoning_content = None;
        }
        Ok(normalize(chunk))
    }
}

/// Rejects `stream_options`; every chunk carries the running usage total, so the last one wins.
#[derive(Clone, Copy, Debug, Default)]
pub struct XaiSource;

impl StreamSource for XaiSource {
    fn engine(&self) -> EngineId {
        EngineId::Critic
    }

    fn request_usage_option(&self) -> bool {
        false
    }

    fn parse_chunk(&self, data: &str) -> Result<Option<StreamChunk>, BackendError> {
        let chunk = decode(data)?;
        // running totals on content chunks would be double counted if summed downstream
        let finished = chunk.choices.iter().any(|choice| choice.finish_reason.is_some());
        let usage = if finished || chunk.choices.is_empty() { chunk.usage } else { None };
        Ok(normalize(CompletionChunk { usage, ..chunk }))
    }
}
