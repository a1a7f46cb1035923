//! Secondary engines.
//!
//! After the primary `done`, the client may replay the primary's instructions and evidence trail
//! to the analyst (own tool loop, same grant) and the critic (text only). Each runs as its own
//! request and degrades on its own.

use std::sync::Arc;

use chrono::Utc;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use pulse_core::config::AgentConfig;
use pulse_core::domain::conversation::{ConversationId, TurnRole};

use crate::access::{AccessResolver, ResolvedAccess};
use crate::llm::{
    BackendError, ChatMessage, CompletionRequest, EngineId, ReasoningBackend, TokenUsage, ToolSpec,
};
use crate::prompt::{build_instructions, engine_overlay, evidence_context, InstructionConfig};
use crate::stream::{
    deliver_answer, stream_text_only, DoneMeta, DonePayload, Pacing, StreamAbort, StreamEvent,
    StreamWriter, CANCELLED_MESSAGE,
};
use crate::tool_loop::{data_sources, EvidenceEntry, ToolLoop};
use crate::tools::{list_tools, ToolExecutor};
use crate::{AgentError, CallerIdentity};

const STREAM_CAPACITY: usize = 64;

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct HistoryMessage {
    pub role: TurnRole,
    pub content: String,
}

#[derive(Clone, Debug)]
pub struct SecondaryRequest {
    pub identity: CallerIdentity,
    pub engine: EngineId,
    pub messages: Vec<HistoryMessage>,
    pub system_prompt: String,
    pub user_message: String,
    pub conversation_id: Option<ConversationId>,
    pub evidence: Vec<EvidenceEntry>,
}

/// A secondary request that passed authorization and is ready to stream.
pub struct PreparedSecondary {
    pub engine: EngineId,
    pub access: ResolvedAccess,
    pub conversation_id: Option<ConversationId>,
    messages: Vec<ChatMessage>,
    tools: Vec<ToolSpec>,
}

impl PreparedSecondary {
    pub fn system_prompt(&self) -> Option<&str> {
        self.messages.first().and_then(|message| message.content.as_deref())
    }

    pub fn tool_names(&self) -> Vec<&'static str> {
        self.tools.iter().map(|spec| spec.name).collect()
    }
}

pub struct SecondaryStream {
    prepared: PreparedSecondary,
    writer: StreamWriter,
}

pub struct EngineCoordinator {
    resolver: Arc<AccessResolver>,
    executor: Arc<ToolExecutor>,
    analyst: Arc<dyn ReasoningBackend>,
    critic: Arc<dyn ReasoningBackend>,
    config: AgentConfig,
}

impl EngineCoordinator {
    pub fn new(
        resolver: Arc<AccessResolver>,
        executor: Arc<ToolExecutor>,
        analyst: Arc<dyn ReasoningBackend>,
        critic: Arc<dyn ReasoningBackend>,
        config: AgentConfig,
    ) -> Self {
        Self { resolver, executor, analyst, critic, config }
    }

    fn backend(&self, engine: EngineId) -> Option<&dyn ReasoningBackend> {
        match engine {
            EngineId::Primary => None,
            EngineId::Analyst => Some(self.analyst.as_ref()),
            EngineId::Critic => Some(self.critic.as_ref()),
        }
    }

    /// Authorizes the caller and assembles the engine's messages. Fails before any stream opens.
    pub async fn prepare(
        &self,
        request: SecondaryRequest,
    ) -> Result<PreparedSecondary, AgentError> {
        if self.backend(request.engine).is_none() {
            return Err(AgentError::UnsupportedEngine(request.engine));
        }
        let user_message = request.user_message.trim();
        if user_message.is_empty() {
            return Err(AgentError::InvalidRequest("userMessage must not be empty".to_string()));
        }

        let access = self.resolver.resolve(request.identity).await?;
        let tools = match request.engine {
            EngineId::Analyst => list_tools(&access.grant),
            _ => Vec::new(),
        };

        let base = if request.system_prompt.trim().is_empty() {
            build_instructions(&InstructionConfig {
                caller: &access.caller,
                grant: &access.grant,
                visible_count: access.visible.len(),
                persona: access.persona.as_ref(),
                memories: &[],
                today: Utc::now().date_naive(),
                is_proactive: false,
                tool_names: tools.iter().map(|spec| spec.name).collect(),
            })
        } else {
            request.system_prompt.trim().to_string()
        };
        let system = format!(
            "{base}\n\n{}\n\n{}",
            engine_overlay(request.engine),
            evidence_context(&request.evidence)
        );

        let history = request.messages.len().saturating_sub(self.config.history_turns as usize);
        let mut messages = Vec::with_capacity(request.messages.len() + 2);
        messages.push(ChatMessage::system(system));
        messages.extend(request.messages[history..].iter().map(|message| match message.role {
            TurnRole::User => ChatMessage::user(message.content.clone()),
            TurnRole::Assistant => ChatMessage::assistant(message.content.clone()),
        }));
        messages.push(ChatMessage::user(user_message));

        Ok(PreparedSecondary {
            engine: request.engine,
            access,
            conversation_id: request.conversation_id,
            messages,
            tools,
        })
    }

    pub fn open_stream(
        &self,
        prepared: PreparedSecondary,
    ) -> (SecondaryStream, mpsc::Receiver<StreamEvent>) {
        let (writer, receiver) = StreamWriter::channel(
            prepared.engine,
            Pacing::from_config(&self.config),
            CancellationToken::new(),
            STREAM_CAPACITY,
        );
        (SecondaryStream { prepared, writer }, receiver)
    }

    /// Drives one secondary stream to its terminal event. Returns the `done` payload, if sent.
    pub async fn run(&self, stream: SecondaryStream) -> Option<DonePayload> {
        let SecondaryStream { prepared, mut writer } = stream;
        let engine = prepared.engine;
        let backend = self.backend(engine)?;

        let mut sources = Vec::new();
        let mut usage = TokenUsage::default();
        if !backend.is_available() {
            writer.explain_unavailable(&BackendError::NotConfigured { engine }).await;
        } else {
            let answered = self
                .answer(&mut writer, backend, prepared.messages, prepared.tools, &prepared.access)
                .await;
            match answered {
                Ok((used, consulted)) => {
                    usage = used;
                    sources = consulted;
                }
                Err(StreamAbort::Upstream(error)) => writer.explain_unavailable(&error).await,
                Err(abort @ (StreamAbort::Cancelled | StreamAbort::Disconnected)) => {
                    info!(event_name = "agent.engine.aborted", engine = %engine, reason = %abort);
                    writer.fail(CANCELLED_MESSAGE).await;
                    return None;
                }
            }
        }

        let done = writer
            .done(DoneMeta {
                conversation_id: prepared.conversation_id,
                tokens_used: usage.total(),
                data_sources: sources,
                evidence: None,
                system_prompt: None,
            })
            .await;
        info!(
            event_name = "agent.engine.finished",
            engine = %engine,
            caller_id = %prepared.access.caller.id,
            degraded = done.degraded,
            tokens_used = done.tokens_used,
            "secondary engine finished"
        );
        Some(done)
    }

    async fn answer(
        &self,
        writer: &mut StreamWriter,
        backend: &dyn ReasoningBackend,
        messages: Vec<ChatMessage>,
        tools: Vec<ToolSpec>,
        access: &ResolvedAccess,
    ) -> Result<(TokenUsage, Vec<String>), StreamAbort> {
        if tools.is_empty() {
            let usage =
                stream_text_only(writer, backend, &CompletionRequest::text_only(messages)).await?;
            return Ok((usage, Vec::new()));
        }

        let ctx = access.tool_context(Utc::now().date_naive());
        let tool_loop = ToolLoop::new(
            backend,
            &self.executor,
            self.config.max_tool_rounds,
            self.config.max_calls_per_round,
        );
        let cancel = writer.cancel_token().clone();
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(StreamAbort::Cancelled),
            outcome = tool_loop.run(messages, tools, &ctx) => outcome?,
        };
        let usage = deliver_answer(writer, backend, &outcome).await?;
        Ok((usage, data_sources(&outcome.evidence)))
    }
}
