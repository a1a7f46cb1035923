//! Primary chat requests.
//!
//! `prepare` does every check that can fail the request outright (caller, grant, proactive
//! capability, session lookup). Everything after it ends in exactly one terminal event, or in a
//! `ChatReply` for non-streaming callers.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{info, warn};

use pulse_core::config::AgentConfig;
use pulse_core::domain::conversation::{
    title_from_message, ConversationId, ConversationSession, SessionSummary, Turn, TurnRole,
};
use pulse_core::errors::StoreError;
use pulse_core::ports::{ConversationStore, MemoryStore};

use crate::access::{AccessResolver, ResolvedAccess};
use crate::cancel::{InFlightRegistry, InFlightTicket};
use crate::llm::{BackendError, ChatMessage, EngineId, ReasoningBackend, TokenUsage, ToolSpec};
use crate::prompt::{build_instructions, InstructionConfig};
use crate::stream::{
    deliver_answer, DoneMeta, DonePayload, Pacing, StreamAbort, StreamEvent, StreamWriter,
    CANCELLED_MESSAGE, DEGRADED_MESSAGE,
};
use crate::tool_loop::{data_sources, EvidenceEntry, ToolLoop};
use crate::tools::{list_tools, ToolExecutor};
use crate::{AgentError, CallerIdentity};

const STREAM_CAPACITY: usize = 64;
const RECENT_SESSIONS: u32 = 20;

#[derive(Clone, Debug)]
pub struct ChatRequest {
    pub identity: CallerIdentity,
    pub message: String,
    pub conversation_id: Option<ConversationId>,
    pub is_proactive: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatReply {
    pub reply: String,
    pub conversation_id: ConversationId,
    pub tokens_used: u32,
    pub data_sources: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum HistoryView {
    Session(ConversationSession),
    #[serde(rename = "sessions")]
    Recent(Vec<SessionSummary>),
}

/// An authorized request with its instructions assembled.
#[derive(Clone, Debug)]
pub struct PreparedChat {
    pub access: ResolvedAccess,
    pub conversation_id: ConversationId,
    pub message: String,
    pub is_proactive: bool,
    pub system_prompt: String,
    messages: Vec<ChatMessage>,
    tools: Vec<ToolSpec>,
}

impl PreparedChat {
    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }
}

pub struct ActiveStream {
    prepared: PreparedChat,
    writer: StreamWriter,
    ticket: InFlightTicket,
}

#[derive(Default)]
struct Answer {
    usage: TokenUsage,
    evidence: Vec<EvidenceEntry>,
}

pub struct AgentRuntime {
    resolver: Arc<AccessResolver>,
    executor: Arc<ToolExecutor>,
    primary: Arc<dyn ReasoningBackend>,
    conversations: Arc<dyn ConversationStore>,
    memories: Arc<dyn MemoryStore>,
    in_flight: InFlightRegistry,
    config: AgentConfig,
}

impl AgentRuntime {
    pub fn new(
        resolver: Arc<AccessResolver>,
        executor: Arc<ToolExecutor>,
        primary: Arc<dyn ReasoningBackend>,
        conversations: Arc<dyn ConversationStore>,
        memories: Arc<dyn MemoryStore>,
        config: AgentConfig,
    ) -> Self {
        Self {
            resolver,
            executor,
            primary,
            conversations,
            memories,
            in_flight: InFlightRegistry::default(),
            config,
        }
    }

    pub fn primary_available(&self) -> bool {
        self.primary.is_available()
    }

    pub async fn prepare(&self, request: ChatRequest) -> Result<PreparedChat, AgentError> {
        let message = request.message.trim();
        if message.is_empty() {
            return Err(AgentError::InvalidRequest("message must not be empty".to_string()));
        }

        let access = self.resolver.resolve(request.identity).await?;
        if request.is_proactive {
            access.grant.require_proactive()?;
        }

        let owner = access.caller.id;
        let conversation_id = self
            .conversations
            .get_or_create(owner, request.conversation_id.as_ref(), &title_from_message(message))
            .await?;
        let history = self
            .conversations
            .load_recent_turns(&conversation_id, self.config.history_turns)
            .await?;
        let memories = self.memories.live_memories(owner, Utc::now()).await?;

        let tools = list_tools(&access.grant);
        let system_prompt = build_instructions(&InstructionConfig {
            caller: &access.caller,
            grant: &access.grant,
            visible_count: access.visible.len(),
            persona: access.persona.as_ref(),
            memories: &memories,
            today: Utc::now().date_naive(),
            is_proactive: request.is_proactive,
            tool_names: tools.iter().map(|spec| spec.name).collect(),
        });

        let mut messages = Vec::with_capacity(history.len() + 2);
        messages.push(ChatMessage::system(system_prompt.clone()));
        messages.extend(history.into_iter().map(|turn| match turn.role {
            TurnRole::User => ChatMessage::user(turn.content),
            TurnRole::Assistant => ChatMessage::assistant(turn.content),
        }));
        messages.push(ChatMessage::user(message));

        Ok(PreparedChat {
            access,
            conversation_id,
            message: message.to_string(),
            is_proactive: request.is_proactive,
            system_prompt,
            messages,
            tools,
        })
    }

    fn tool_loop(&self) -> ToolLoop<'_> {
        ToolLoop::new(
            self.primary.as_ref(),
            &self.executor,
            self.config.max_tool_rounds,
            self.config.max_calls_per_round,
        )
    }

    async fn append_user_turn(&self, prepared: &PreparedChat) -> Result<(), StoreError> {
        let turn = Turn::user(&prepared.message, prepared.is_proactive);
        self.conversations
            .append_turn(&prepared.conversation_id, turn)
            .await
            .map(|_| ())
    }

    /// Non-streaming chat: the whole loop runs before the reply is returned.
    pub async fn chat(&self, prepared: PreparedChat) -> Result<ChatReply, AgentError> {
        let key = prepared.conversation_id.0.clone();
        let ticket = self.in_flight.begin(&key);
        let reply = self.answer_to_text(prepared).await;
        self.in_flight.finish(&key, &ticket);
        reply
    }

    async fn answer_to_text(&self, prepared: PreparedChat) -> Result<ChatReply, AgentError> {
        self.append_user_turn(&prepared).await?;

        let answered = if self.primary.is_available() {
            let ctx = prepared.access.tool_context(Utc::now().date_naive());
            self.tool_loop()
                .run_to_text(prepared.messages.clone(), prepared.tools.clone(), &ctx)
                .await
        } else {
            Err(BackendError::NotConfigured { engine: EngineId::Primary })
        };

        let (reply, tokens_used, sources) = match answered {
            Ok(outcome) => (
                outcome.final_text().unwrap_or_default().to_string(),
                outcome.usage.total(),
                outcome.data_sources(),
            ),
            Err(error) => {
                warn!(
                    event_name = "agent.chat.degraded",
                    conversation_id = %prepared.conversation_id,
                    reason_code = error.reason_code(),
                    error = %error,
                    "primary backend unavailable"
                );
                (DEGRADED_MESSAGE.to_string(), 0, Vec::new())
            }
        };

        self.conversations
            .append_turn(
                &prepared.conversation_id,
                Turn::assistant(reply.clone(), tokens_used, sources.clone()),
            )
            .await?;

        Ok(ChatReply {
            reply,
            conversation_id: prepared.conversation_id,
            tokens_used,
            data_sources: sources,
        })
    }

    /// Registers the request as the conversation's in-flight stream, cancelling any earlier one.
    pub fn open_stream(
        &self,
        prepared: PreparedChat,
    ) -> (ActiveStream, mpsc::Receiver<StreamEvent>) {
        let ticket = self.in_flight.begin(&prepared.conversation_id.0);
        let (writer, receiver) = StreamWriter::channel(
            EngineId::Primary,
            Pacing::from_config(&self.config),
            ticket.token().clone(),
            STREAM_CAPACITY,
        );
        (ActiveStream { prepared, writer, ticket }, receiver)
    }

    /// Drives one primary stream to its terminal event. The assistant turn is stored before
    /// `done` is sent; cancelled streams store nothing.
    pub async fn run_stream(&self, active: ActiveStream) -> Option<DonePayload> {
        let ActiveStream { prepared, mut writer, ticket } = active;
        let key = prepared.conversation_id.0.clone();
        let done = self.drive(&prepared, &mut writer).await;

        let result = match done {
            Ok(meta) => Some(writer.done(meta).await),
            Err(message) => {
                writer.fail(message).await;
                None
            }
        };
        self.in_flight.finish(&key, &ticket);
        result
    }

    async fn drive(
        &self,
        prepared: &PreparedChat,
        writer: &mut StreamWriter,
    ) -> Result<DoneMeta, String> {
        if writer.cancel_token().is_cancelled() {
            return Err(self.superseded(prepared));
        }
        if let Err(error) = self.append_user_turn(prepared).await {
            warn!(event_name = "agent.chat.persist_failed", error = %error);
            return Err(error.to_string());
        }

        let (Answer { usage, evidence }, delivered) = self.stream_answer(prepared, writer).await;
        match delivered {
            Ok(()) => {}
            Err(StreamAbort::Upstream(error)) => writer.explain_unavailable(&error).await,
            Err(abort) => {
                info!(
                    event_name = "agent.chat.aborted",
                    conversation_id = %prepared.conversation_id,
                    reason = %abort,
                    "stream stopped before completion"
                );
                return Err(CANCELLED_MESSAGE.to_string());
            }
        }
        // A newer message may have arrived while the last tokens were going out.
        if writer.cancel_token().is_cancelled() {
            return Err(self.superseded(prepared));
        }

        let sources = data_sources(&evidence);
        let tokens_used = usage.total();
        let turn = Turn::assistant(writer.text(), tokens_used, sources.clone());
        if let Err(error) = self.conversations.append_turn(&prepared.conversation_id, turn).await {
            warn!(event_name = "agent.chat.persist_failed", error = %error);
            return Err(error.to_string());
        }

        info!(
            event_name = "agent.chat.completed",
            conversation_id = %prepared.conversation_id,
            caller_id = %prepared.access.caller.id,
            tokens_used,
            evidence = evidence.len(),
            degraded = writer.is_degraded(),
            "primary stream completed"
        );
        Ok(DoneMeta {
            conversation_id: Some(prepared.conversation_id.clone()),
            tokens_used,
            data_sources: sources,
            evidence: Some(evidence),
            system_prompt: Some(prepared.system_prompt.clone()),
        })
    }

    fn superseded(&self, prepared: &PreparedChat) -> String {
        info!(
            event_name = "agent.chat.superseded",
            conversation_id = %prepared.conversation_id,
            "newer message on the conversation, dropping this stream"
        );
        CANCELLED_MESSAGE.to_string()
    }

    /// Usage and evidence are returned even when the answer could not be delivered.
    async fn stream_answer(
        &self,
        prepared: &PreparedChat,
        writer: &mut StreamWriter,
    ) -> (Answer, Result<(), StreamAbort>) {
        if !self.primary.is_available() {
            let unavailable = BackendError::NotConfigured { engine: EngineId::Primary };
            return (Answer::default(), Err(StreamAbort::Upstream(unavailable)));
        }

        let ctx = prepared.access.tool_context(Utc::now().date_naive());
        let tool_loop = self.tool_loop();
        let cancel = writer.cancel_token().clone();
        let messages = prepared.messages.clone();
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return (Answer::default(), Err(StreamAbort::Cancelled)),
            outcome = tool_loop.run(messages, prepared.tools.clone(), &ctx) => outcome,
        };
        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(error) => return (Answer::default(), Err(StreamAbort::Upstream(error))),
        };

        let delivered = deliver_answer(writer, self.primary.as_ref(), &outcome).await;
        match delivered {
            Ok(usage) => (Answer { usage, evidence: outcome.evidence }, Ok(())),
            Err(abort) => (Answer { usage: outcome.usage, evidence: outcome.evidence }, Err(abort)),
        }
    }

    /// One owned session with its turns, or the caller's most recent sessions.
    pub async fn history(
        &self,
        identity: CallerIdentity,
        conversation_id: Option<&ConversationId>,
    ) -> Result<HistoryView, AgentError> {
        let caller = self.resolver.resolve_caller(identity).await?;
        match conversation_id {
            Some(id) => self
                .conversations
                .session(caller.id, id)
                .await?
                .map(HistoryView::Session)
                .ok_or_else(|| StoreError::NotFound(format!("conversation `{id}`")).into()),
            None => Ok(HistoryView::Recent(
                self.conversations.recent_sessions(caller.id, RECENT_SESSIONS).await?,
            )),
        }
    }

    pub async fn archive(
        &self,
        identity: CallerIdentity,
        conversation_id: &ConversationId,
    ) -> Result<(), AgentError> {
        let caller = self.resolver.resolve_caller(identity).await?;
        if !self.conversations.archive(caller.id, conversation_id).await? {
            return Err(StoreError::NotFound(format!("conversation `{conversation_id}`")).into());
        }
        self.in_flight.cancel(&conversation_id.0);
        info!(event_name = "agent.history.archived", conversation_id = %conversation_id);
        Ok(())
    }
}
