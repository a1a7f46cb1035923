//! Client-facing stream protocol.
//!
//! Every request ends with exactly one terminal event (`done` or `error`). `StreamWriter`
//! enforces that by consuming itself in `done` and `fail`.

use std::time::Duration;

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use pulse_core::config::AgentConfig;
use pulse_core::domain::conversation::ConversationId;

use crate::llm::{
    BackendError, ChunkStream, CompletionRequest, EngineId, ReasoningBackend, TokenUsage,
};
use crate::tool_loop::{EvidenceEntry, LoopOutcome};

pub const DEGRADED_MESSAGE: &str = "This analysis is temporarily unavailable, \
     so I could not finish the answer. Please try again in a moment.";
pub const CANCELLED_MESSAGE: &str = "Request cancelled because a newer message arrived.";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StreamEvent {
    Token { content: String },
    Done(DonePayload),
    Error { message: String },
}

impl StreamEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Token { .. } => "token",
            Self::Done(_) => "done",
            Self::Error { .. } => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Token { .. })
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DonePayload {
    pub conversation_id: Option<ConversationId>,
    pub engine: EngineId,
    pub reply: String,
    pub tokens_used: u32,
    pub data_sources: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_results_for_engines: Option<Vec<EvidenceEntry>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub degraded: bool,
}

/// What the caller knows at the end of a request, beyond the streamed text.
#[derive(Clone, Debug, Default)]
pub struct DoneMeta {
    pub conversation_id: Option<ConversationId>,
    pub tokens_used: u32,
    pub data_sources: Vec<String>,
    pub evidence: Option<Vec<EvidenceEntry>>,
    pub system_prompt: Option<String>,
}

/// Why a stream stopped before its terminal event.
#[derive(Debug, Error)]
pub enum StreamAbort {
    #[error("stream cancelled")]
    Cancelled,
    #[error("client disconnected")]
    Disconnected,
    #[error(transparent)]
    Upstream(#[from] BackendError),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Pacing {
    pub chunk_chars: usize,
    pub delay: Duration,
}

impl Pacing {
    pub fn from_config(config: &AgentConfig) -> Self {
        Self {
            chunk_chars: config.synthetic_chunk_chars.max(1),
            delay: Duration::from_millis(config.synthetic_chunk_delay_ms),
        }
    }

    pub fn immediate(chunk_chars: usize) -> Self {
        Self { chunk_chars: chunk_chars.max(1), delay: Duration::ZERO }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RelayOutcome {
    pub usage: Option<TokenUsage>,
    pub tool_call_seen: bool,
}

pub struct StreamWriter {
    sender: mpsc::Sender<StreamEvent>,
    engine: EngineId,
    pacing: Pacing,
    cancel: CancellationToken,
    text: String,
    degraded: bool,
}

impl StreamWriter {
    pub fn new(
        sender: mpsc::Sender<StreamEvent>,
        engine: EngineId,
        pacing: Pacing,
        cancel: CancellationToken,
    ) -> Self {
        Self { sender, engine, pacing, cancel, text: String::new(), degraded: false }
    }

    pub fn channel(
        engine: EngineId,
        pacing: Pacing,
        cancel: CancellationToken,
        capacity: usize,
    ) -> (Self, mpsc::Receiver<StreamEvent>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self::new(sender, engine, pacing, cancel), receiver)
    }

    pub fn engine(&self) -> EngineId {
        self.engine
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Everything emitted as `token` so far.
    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    pub async fn token(&mut self, content: impl Into<String>) -> Result<(), StreamAbort> {
        let content = content.into();
        if content.is_empty() {
            return Ok(());
        }
        if self.cancel.is_cancelled() {
            return Err(StreamAbort::Cancelled);
        }
        self.text.push_str(&content);
        self.sender
            .send(StreamEvent::Token { content })
            .await
            .map_err(|_| StreamAbort::Disconnected)
    }

    /// Emits an already-known answer as paced `token` events.
    pub async fn synthetic(&mut self, text: &str) -> Result<(), StreamAbort> {
        let chars: Vec<char> = text.chars().collect();
        for (index, chunk) in chars.chunks(self.pacing.chunk_chars).enumerate() {
            if index > 0 && !self.pacing.delay.is_zero() {
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => return Err(StreamAbort::Cancelled),
                    _ = tokio::time::sleep(self.pacing.delay) => {}
                }
            }
            self.token(chunk.iter().collect::<String>()).await?;
        }
        Ok(())
    }

    /// Forwards backend chunks as they arrive, in order.
    pub async fn relay(&mut self, mut chunks: ChunkStream) -> Result<RelayOutcome, StreamAbort> {
        let mut outcome = RelayOutcome::default();
        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(StreamAbort::Cancelled),
                next = chunks.next() => next,
            };
            let Some(chunk) = next else { break };
            let chunk = chunk?;
            if chunk.usage.is_some() {
                outcome.usage = chunk.usage;
            }
            outcome.tool_call_seen |= chunk.tool_call_seen;
            if let Some(text) = chunk.text {
                self.token(text).await?;
            }
        }
        Ok(outcome)
    }

    /// Appends one explanatory token for a failed backend. The request still ends with `done`.
    pub async fn explain_unavailable(&mut self, error: &BackendError) {
        warn!(
            event_name = "agent.stream.degraded",
            engine = %self.engine,
            reason_code = error.reason_code(),
            error = %error,
            partial_chars = self.text.len(),
            "backend unavailable, degrading"
        );
        let content = if self.text.is_empty() {
            DEGRADED_MESSAGE.to_string()
        } else {
            format!("\n\n{DEGRADED_MESSAGE}")
        };
        self.text.push_str(&content);
        self.degraded = true;
        if self.sender.send(StreamEvent::Token { content }).await.is_err() {
            debug!(event_name = "agent.stream.receiver_gone", engine = %self.engine, "client gone");
        }
    }

    pub async fn done(self, meta: DoneMeta) -> DonePayload {
        let payload = DonePayload {
            conversation_id: meta.conversation_id,
            engine: self.engine,
            reply: self.text,
            tokens_used: meta.tokens_used,
            data_sources: meta.data_sources,
            tool_results_for_engines: meta.evidence,
            system_prompt: meta.system_prompt,
            degraded: self.degraded,
        };
        if self.sender.send(StreamEvent::Done(payload.clone())).await.is_err() {
            debug!(event_name = "agent.stream.receiver_gone", engine = %self.engine, "client gone");
        }
        payload
    }

    pub async fn fail(self, message: impl Into<String>) {
        let message = message.into();
        debug!(event_name = "agent.stream.failed", engine = %self.engine, message = %message);
        let _ = self.sender.send(StreamEvent::Error { message }).await;
    }
}

/// Streams a text-only completion. A backend that answers with a tool call instead of text gets
/// one forced non-streaming completion whose text is emitted synthetically.
pub async fn stream_text_only(
    writer: &mut StreamWriter,
    backend: &dyn ReasoningBackend,
    request: &CompletionRequest,
) -> Result<TokenUsage, StreamAbort> {
    let chunks = backend.stream(request).await?;
    let before = writer.text().len();
    let relayed = writer.relay(chunks).await?;
    let mut usage = relayed.usage.unwrap_or_default();
    if writer.text().len() > before {
        return Ok(usage);
    }

    if relayed.tool_call_seen {
        debug!(
            event_name = "agent.stream.tool_branch_ignored",
            engine = %backend.engine(),
            "tool call on a text-only stream, forcing completion"
        );
    }
    let reply = backend.complete(&CompletionRequest::text_only(request.messages.clone())).await?;
    usage.add(reply.usage);
    match reply.content.filter(|content| !content.trim().is_empty()) {
        Some(content) => {
            writer.synthetic(&content).await?;
            Ok(usage)
        }
        None => Err(StreamAbort::Upstream(BackendError::MalformedResponse {
            engine: backend.engine(),
            reason: "text-only completion carried no content".to_string(),
        })),
    }
}

/// Emits the answer of a finished loop: paced synthetic tokens when the loop already holds the
/// text, otherwise a streamed text-only final call.
pub async fn deliver_answer(
    writer: &mut StreamWriter,
    backend: &dyn ReasoningBackend,
    outcome: &LoopOutcome,
) -> Result<TokenUsage, StreamAbort> {
    let mut usage = outcome.usage;
    match outcome.final_text() {
        Some(text) => writer.synthetic(text).await?,
        None => usage.add(stream_text_only(writer, backend, &outcome.final_text_request()).await?),
    }
    Ok(usage)
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tokio_util::sync::CancellationToken;

    use super::{stream_text_only, DoneMeta, Pacing, StreamAbort, StreamEvent, StreamWriter};
    use crate::llm::{BackendError, ChatMessage, CompletionRequest, EngineId, StreamChunk};
    use crate::test_support::{drain, text_chunks, text_reply, ScriptedBackend};

    fn writer(chunk_chars: usize) -> (StreamWriter, tokio::sync::mpsc::Receiver<StreamEvent>) {
        StreamWriter::channel(
            EngineId::Primary,
            Pacing::immediate(chunk_chars),
            CancellationToken::new(),
            64,
        )
    }

    fn tokens(events: &[StreamEvent]) -> String {
        events
            .iter()
            .filter_map(|event| match event {
                StreamEvent::Token { content } => Some(content.as_str()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn events_serialize_with_a_type_tag() {
        let token = StreamEvent::Token { content: "Hi".to_string() };
        assert_eq!(
            serde_json::to_value(&token).expect("json"),
            json!({ "type": "token", "content": "Hi" })
        );
        let error = StreamEvent::Error { message: "boom".to_string() };
        assert_eq!(serde_json::to_value(&error).expect("json")["type"], "error");
    }

    #[tokio::test]
    async fn synthetic_tokens_concatenate_to_the_done_reply() {
        let (mut writer, receiver) = writer(4);
        writer.synthetic("Your total is 1,200.00 this month.").await.expect("synthetic");
        let done = writer.done(DoneMeta { tokens_used: 42, ..DoneMeta::default() }).await;

        let events = drain(receiver).await;
        assert!(events.len() > 2);
        assert_eq!(tokens(&events), done.reply);
        assert_eq!(events.iter().filter(|event| event.is_terminal()).count(), 1);
        assert!(matches!(
            events.last(),
            Some(StreamEvent::Done(payload)) if payload.tokens_used == 42
        ));
    }

    #[tokio::test]
    async fn degraded_stream_is_one_token_then_done() {
        let (mut writer, receiver) = writer(8);
        writer.explain_unavailable(&BackendError::NotConfigured { engine: EngineId::Critic }).await;
        let done = writer.done(DoneMeta::default()).await;

        let events = drain(receiver).await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind(), "token");
        assert!(done.degraded);
        assert_eq!(tokens(&events), done.reply);
    }

    #[tokio::test]
    async fn cancelled_writer_stops_emitting_tokens() {
        let (mut writer, receiver) = writer(2);
        writer.cancel_token().cancel();
        let error = writer.token("late").await.expect_err("cancelled");
        assert!(matches!(error, StreamAbort::Cancelled));
        writer.fail("cancelled").await;

        let events = drain(receiver).await;
        assert_eq!(events, vec![StreamEvent::Error { message: "cancelled".to_string() }]);
    }

    #[tokio::test]
    async fn relayed_chunks_keep_order_and_last_usage() {
        let backend = ScriptedBackend::new(EngineId::Analyst);
        backend.push_stream(text_chunks(&["One ", "two ", "three"], 17));
        let (mut writer, receiver) = writer(8);

        let request = CompletionRequest::text_only(vec![ChatMessage::user("count")]);
        let usage = stream_text_only(&mut writer, &backend, &request).await.expect("stream");
        writer.done(DoneMeta { tokens_used: usage.total(), ..DoneMeta::default() }).await;

        let events = drain(receiver).await;
        assert_eq!(tokens(&events), "One two three");
        assert_eq!(usage.total(), 17);
        assert!(backend.requests().is_empty());
    }

    #[tokio::test]
    async fn tool_branch_on_text_only_stream_forces_a_completion() {
        let backend = ScriptedBackend::new(EngineId::Critic);
        backend.push_stream(vec![Ok(StreamChunk {
            tool_call_seen: true,
            finished: true,
            ..StreamChunk::default()
        })]);
        backend.push_reply(text_reply("Independent view: growth is flat.", 9));
        let (mut writer, receiver) = writer(64);

        let request = CompletionRequest::text_only(vec![ChatMessage::user("critique")]);
        stream_text_only(&mut writer, &backend, &request).await.expect("forced");
        writer.done(DoneMeta::default()).await;

        let events = drain(receiver).await;
        assert_eq!(tokens(&events), "Independent view: growth is flat.");
        assert!(backend.requests().iter().all(|request| request.tools.is_empty()));
    }

    #[tokio::test]
    async fn upstream_errors_mid_stream_abort_the_relay() {
        let backend = ScriptedBackend::new(EngineId::Analyst);
        let mut chunks = text_chunks(&["partial"], 0);
        chunks.insert(
            1,
            Err(BackendError::Transport { engine: EngineId::Analyst, reason: "reset".to_string() }),
        );
        backend.push_stream(chunks);
        let (mut writer, _receiver) = writer(8);

        let request = CompletionRequest::text_only(vec![ChatMessage::user("count")]);
        let error = stream_text_only(&mut writer, &backend, &request).await.expect_err("abort");
        assert!(matches!(error, StreamAbort::Upstream(BackendError::Transport { .. })));
        assert_eq!(writer.text(), "partial");
    }
}
