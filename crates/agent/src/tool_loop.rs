//! Bounded tool-calling loop.
//!
//! `AwaitingModel -> (ToolCallsRequested -> Executing -> AwaitingModel)*`, ending in
//! `FinalText` or `RoundsExhausted`.
//! Model calls are non-streaming while tools are offered. The budget is checked before every
//! model call, so one loop never makes more than `max_rounds + 1` calls including the forced
//! text-only answer.

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::llm::{
    BackendError, ChatMessage, CompletionRequest, ReasoningBackend, TokenUsage, ToolSpec,
};
use crate::tools::{ToolCall, ToolContext, ToolError, ToolExecutor, ToolResult};

const BUDGET_EXHAUSTED_NOTE: &str = "The tool budget for this request is exhausted. Answer now \
     using only the evidence above, and say plainly if it is incomplete.";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoopTerminal {
    FinalText,
    RoundsExhausted,
}

impl LoopTerminal {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FinalText => "final_text",
            Self::RoundsExhausted => "rounds_exhausted",
        }
    }
}

/// One tool invocation and its result, in the order the loop executed them.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvidenceEntry {
    pub round: u32,
    pub call_id: String,
    pub tool: String,
    pub arguments: Value,
    pub result: Value,
    #[serde(default)]
    pub is_error: bool,
}

impl EvidenceEntry {
    fn from_result(round: u32, result: &ToolResult) -> Self {
        Self {
            round,
            call_id: result.call_id.clone(),
            tool: result.name.clone(),
            arguments: result.arguments.clone(),
            result: result.payload(),
            is_error: result.is_error(),
        }
    }
}

/// Unique names of tools that returned data, in first-use order.
pub fn data_sources(evidence: &[EvidenceEntry]) -> Vec<String> {
    let mut sources: Vec<String> = Vec::new();
    for entry in evidence.iter().filter(|entry| !entry.is_error) {
        if !sources.contains(&entry.tool) {
            sources.push(entry.tool.clone());
        }
    }
    sources
}

#[derive(Clone, Debug)]
pub struct LoopOutcome {
    pub terminal: LoopTerminal,
    pub text: Option<String>,
    /// Input messages followed by every assistant tool request and tool result.
    pub transcript: Vec<ChatMessage>,
    pub evidence: Vec<EvidenceEntry>,
    pub usage: TokenUsage,
    pub rounds: u32,
    pub model_calls: u32,
}

impl LoopOutcome {
    /// The answer, when the loop already holds one.
    pub fn final_text(&self) -> Option<&str> {
        self.text.as_deref().filter(|text| !text.trim().is_empty())
    }

    pub fn data_sources(&self) -> Vec<String> {
        data_sources(&self.evidence)
    }

    /// The last call of an exhausted loop: full transcript, tool use disabled.
    pub fn final_text_request(&self) -> CompletionRequest {
        let mut messages = self.transcript.clone();
        if self.terminal == LoopTerminal::RoundsExhausted {
            messages.push(ChatMessage::system(BUDGET_EXHAUSTED_NOTE));
        }
        CompletionRequest::text_only(messages)
    }
}

pub struct ToolLoop<'a> {
    backend: &'a dyn ReasoningBackend,
    executor: &'a ToolExecutor,
    max_rounds: u32,
    max_calls_per_round: u32,
}

impl<'a> ToolLoop<'a> {
    pub fn new(
        backend: &'a dyn ReasoningBackend,
        executor: &'a ToolExecutor,
        max_rounds: u32,
        max_calls_per_round: u32,
    ) -> Self {
        Self {
            backend,
            executor,
            max_rounds: max_rounds.max(1),
            max_calls_per_round: max_calls_per_round.max(1),
        }
    }

    pub async fn run(
        &self,
        messages: Vec<ChatMessage>,
        tools: Vec<ToolSpec>,
        ctx: &ToolContext,
    ) -> Result<LoopOutcome, BackendError> {
        let engine = self.backend.engine();
        let mut outcome = LoopOutcome {
            terminal: LoopTerminal::RoundsExhausted,
            text: None,
            transcript: messages,
            evidence: Vec::new(),
            usage: TokenUsage::default(),
            rounds: 0,
            model_calls: 0,
        };

        loop {
            if outcome.rounds >= self.max_rounds {
                break;
            }

            debug!(
                event_name = "agent.loop.round_started",
                engine = %engine,
                round = outcome.rounds + 1,
                "awaiting model"
            );
            let request =
                CompletionRequest { messages: outcome.transcript.clone(), tools: tools.clone() };
            let reply = self.backend.complete(&request).await?;
            outcome.model_calls += 1;
            outcome.usage.add(reply.usage);

            if reply.tool_calls.is_empty() {
                outcome.terminal = LoopTerminal::FinalText;
                outcome.text = reply.content;
                break;
            }

            outcome.rounds += 1;
            let round = outcome.rounds;
            let requested = reply.tool_calls.len();
            let budget = (self.max_calls_per_round as usize).min(requested);
            let calls: Vec<ToolCall> = reply.tool_calls.iter().map(ToolCall::from).collect();
            outcome
                .transcript
                .push(ChatMessage::assistant_tool_calls(reply.content, reply.tool_calls));

            let mut results =
                join_all(calls[..budget].iter().map(|call| self.executor.execute(call, ctx)))
                    .await;
            results.extend(calls[budget..].iter().map(|call| {
                ToolResult::failed(call, ToolError::CallBudgetExceeded(self.max_calls_per_round))
            }));

            for result in &results {
                let message = ChatMessage::tool_result(&result.call_id, &result.payload());
                outcome.transcript.push(message);
                outcome.evidence.push(EvidenceEntry::from_result(round, result));
            }

            debug!(
                event_name = "agent.loop.round_finished",
                engine = %engine,
                round,
                requested,
                executed = budget,
                failed = results.iter().filter(|result| result.is_error()).count(),
                "tool round finished"
            );
        }

        info!(
            event_name = "agent.loop.finished",
            engine = %engine,
            terminal = outcome.terminal.as_str(),
            rounds = outcome.rounds,
            model_calls = outcome.model_calls,
            evidence = outcome.evidence.len(),
            total_tokens = outcome.usage.total(),
            "tool loop finished"
        );
        Ok(outcome)
    }

    /// Runs the loop and, if it ends without text, makes the forced text-only call.
    pub async fn run_to_text(
        &self,
        messages: Vec<ChatMessage>,
        tools: Vec<ToolSpec>,
        ctx: &ToolContext,
    ) -> Result<LoopOutcome, BackendError> {
        let mut outcome = self.run(messages, tools, ctx).await?;
        if outcome.final_text().is_some() {
            return Ok(outcome);
        }

        let reply = self.backend.complete(&outcome.final_text_request()).await?;
        outcome.model_calls += 1;
        outcome.usage.add(reply.usage);
        outcome.text = reply.content;
        if outcome.final_text().is_none() {
            return Err(BackendError::MalformedResponse {
                engine: self.backend.engine(),
                reason: "text-only completion carried no content".to_string(),
            });
        }
        Ok(outcome)
    }
}
