//! Shared fixtures for unit tests: a small named org, grants, ledger rows and a scripted backend.

use std::collections::{BTreeSet, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::NaiveDate;
use futures::stream;
use rust_decimal::Decimal;
use tokio::sync::mpsc;

use pulse_core::domain::access::{AccessGrant, Capabilities, Persona, RowScope, VisibleSet};
use pulse_core::domain::employee::{Employee, EmployeeId};
use pulse_core::domain::sales::{first_of_month, last_of_month, SalesRecord, SalesTarget};
use pulse_core::org::IdentityGraph;
use pulse_db::repositories::InMemoryAccessRepository;

use crate::llm::{
    BackendError, ChunkStream, CompletionRequest, EngineId, ModelReply, ReasoningBackend,
    StreamChunk, TokenUsage, ToolCallRequest,
};
use crate::stream::StreamEvent;
use crate::tools::ToolContext;

pub fn date(year: i32, month: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(year, month, day).expect("valid date")
}

pub fn today() -> NaiveDate {
    date(2026, 5, 14)
}

pub fn employee(id: i64, manager: Option<i64>, division: &str) -> Employee {
    Employee {
        id: EmployeeId(id),
        name: format!("Employee {id}"),
        title: "Account Executive".to_string(),
        division: division.to_string(),
        unit: None,
        manager_id: manager.map(EmployeeId),
        active: true,
    }
}

fn named(id: i64, manager: Option<i64>, name: &str, title: &str, division: &str) -> Employee {
    Employee {
        name: name.to_string(),
        title: title.to_string(),
        ..employee(id, manager, division)
    }
}

pub fn grant(id: i64, scope: RowScope) -> AccessGrant {
    AccessGrant {
        employee_id: EmployeeId(id),
        division: "North".to_string(),
        unit: None,
        role_name: scope.as_str().to_string(),
        row_scope: scope,
        capabilities: Capabilities::default(),
        table_allow: Vec::new(),
        table_deny: Vec::new(),
        persona_id: None,
    }
}

pub fn record(
    id: i64,
    division: &str,
    sold_on: NaiveDate,
    product_line: &str,
    whole_amount: i64,
) -> SalesRecord {
    SalesRecord {
        employee_id: EmployeeId(id),
        division: division.to_string(),
        sold_on,
        product_line: product_line.to_string(),
        amount: Decimal::new(whole_amount * 100, 2),
        units: 1,
    }
}

pub fn target(id: i64, year: i32, month: u32, whole_amount: i64) -> SalesTarget {
    SalesTarget {
        employee_id: EmployeeId(id),
        period_start: first_of_month(year, month).expect("valid month"),
        period_end: last_of_month(year, month).expect("valid month"),
        amount: Decimal::new(whole_amount * 100, 2),
    }
}

/// Dana runs the company; Tom manages Aisha and Liam; Ken has left.
pub fn demo_employees() -> Vec<Employee> {
    let mut ken = named(8, Some(3), "Ken", "Account Executive", "South");
    ken.active = false;
    vec![
        named(1, None, "Dana", "Chief Revenue Officer", "North"),
        named(2, Some(1), "Marcus", "VP Sales North", "North"),
        named(3, Some(1), "Priya", "VP Sales South", "South"),
        named(4, Some(2), "Tom", "Sales Manager", "North"),
        named(5, Some(4), "Aisha", "Account Executive", "North"),
        named(6, Some(4), "Liam", "Account Executive", "North"),
        named(7, Some(3), "Sofia", "Account Executive", "South"),
        ken,
        named(9, Some(1), "Elena", "Revenue Analyst", "North"),
        named(10, Some(3), "Rafael", "Account Executive", "South"),
    ]
}

pub fn demo_graph() -> Arc<IdentityGraph> {
    Arc::new(IdentityGraph::build(demo_employees()))
}

fn visible(ids: &[i64]) -> VisibleSet {
    VisibleSet::Only(ids.iter().copied().map(EmployeeId).collect::<BTreeSet<_>>())
}

fn context(caller: i64, grant: AccessGrant, visible: VisibleSet) -> ToolContext {
    let graph = demo_graph();
    let caller = graph.employee(EmployeeId(caller)).cloned().expect("demo employee");
    ToolContext { caller, grant, visible, graph, today: today() }
}

pub fn ic_grant() -> AccessGrant {
    grant(5, RowScope::OwnOnly)
}

pub fn manager_grant() -> AccessGrant {
    AccessGrant { role_name: "sales_manager".to_string(), ..grant(4, RowScope::OwnAndSubtree) }
}

pub fn analyst_grant() -> AccessGrant {
    AccessGrant {
        role_name: "revenue_analyst".to_string(),
        capabilities: Capabilities {
            free_query: true,
            forecasting: true,
            org_structure: true,
            ..Capabilities::default()
        },
        table_allow: vec!["sales".to_string(), "sales_targets".to_string()],
        table_deny: vec!["employees".to_string()],
        ..grant(9, RowScope::All)
    }
}

pub fn ic_context() -> ToolContext {
    context(5, ic_grant(), visible(&[5]))
}

pub fn manager_context() -> ToolContext {
    context(4, manager_grant(), visible(&[4, 5, 6]))
}

pub fn analyst_context() -> ToolContext {
    context(9, analyst_grant(), VisibleSet::All)
}

/// The demo org with grants for Aisha (5), Tom (4) and Elena (9). Tom has a persona.
pub async fn demo_access() -> InMemoryAccessRepository {
    let repo = InMemoryAccessRepository::default();
    for employee in demo_employees() {
        repo.insert_employee(employee).await;
    }
    repo.insert_grant(ic_grant()).await;
    repo.insert_grant(AccessGrant {
        persona_id: Some("coach".to_string()),
        capabilities: Capabilities { proactive_insights: true, ..Capabilities::default() },
        ..manager_grant()
    })
    .await;
    repo.insert_grant(analyst_grant()).await;
    repo.insert_persona(Persona {
        id: "coach".to_string(),
        name: "Coach".to_string(),
        tone: "encouraging".to_string(),
        format_guidance: "Lead with the single most important number.".to_string(),
    })
    .await;
    repo
}

/// A senior manager (100) with twelve reports where two rows loop back above the caller,
/// plus an unrelated two-row cycle.
pub async fn senior_manager_org() -> InMemoryAccessRepository {
    let repo = InMemoryAccessRepository::default();
    repo.insert_employee(employee(100, Some(112), "North")).await;
    for id in 101..=111 {
        repo.insert_employee(employee(id, Some(100), "North")).await;
    }
    repo.insert_employee(employee(112, Some(111), "North")).await;
    repo.insert_employee(employee(200, Some(201), "South")).await;
    repo.insert_employee(employee(201, Some(200), "South")).await;
    repo.insert_grant(grant(100, RowScope::OwnAndSubtree)).await;
    repo
}

pub fn text_reply(text: &str, tokens: u32) -> ModelReply {
    ModelReply {
        content: Some(text.to_string()),
        tool_calls: Vec::new(),
        usage: TokenUsage { total_tokens: tokens, ..TokenUsage::default() },
    }
}

pub fn tool_reply(calls: &[(&str, &str, &str)]) -> ModelReply {
    ModelReply {
        content: None,
        tool_calls: calls
            .iter()
            .map(|(id, name, arguments)| ToolCallRequest::new(*id, *name, *arguments))
            .collect(),
        usage: TokenUsage { total_tokens: 5, ..TokenUsage::default() },
    }
}

/// Text deltas followed by a finishing chunk carrying the usage.
pub fn text_chunks(parts: &[&str], tokens: u32) -> Vec<Result<StreamChunk, BackendError>> {
    let mut chunks: Vec<Result<StreamChunk, BackendError>> = parts
        .iter()
        .map(|part| Ok(StreamChunk { text: Some(part.to_string()), ..StreamChunk::default() }))
        .collect();
    chunks.push(Ok(StreamChunk {
        usage: Some(TokenUsage { total_tokens: tokens, ..TokenUsage::default() }),
        finished: true,
        ..StreamChunk::default()
    }));
    chunks
}

pub async fn drain(mut receiver: mpsc::Receiver<StreamEvent>) -> Vec<StreamEvent> {
    let mut events = Vec::new();
    while let Some(event) = receiver.recv().await {
        events.push(event);
    }
    events
}

const FALLBACK_TEXT: &str = "Nothing further to add.";

#[derive(Default)]
struct Script {
    replies: VecDeque<Result<ModelReply, BackendError>>,
    streams: VecDeque<Vec<Result<StreamChunk, BackendError>>>,
    requests: Vec<CompletionRequest>,
    stream_requests: Vec<CompletionRequest>,
}

/// Backend that replays queued replies and records every request it receives.
///
/// An empty queue answers with a short fallback text, so tests only script what they assert on.
pub struct ScriptedBackend {
    engine: EngineId,
    available: bool,
    script: Mutex<Script>,
}

impl ScriptedBackend {
    pub fn new(engine: EngineId) -> Self {
        Self { engine, available: true, script: Mutex::new(Script::default()) }
    }

    pub fn unavailable(engine: EngineId) -> Self {
        Self { available: false, ..Self::new(engine) }
    }

    pub fn push_reply(&self, reply: ModelReply) {
        self.script.lock().expect("script lock").replies.push_back(Ok(reply));
    }

    pub fn push_error(&self, error: BackendError) {
        self.script.lock().expect("script lock").replies.push_back(Err(error));
    }

    pub fn push_stream(&self, chunks: Vec<Result<StreamChunk, BackendError>>) {
        self.script.lock().expect("script lock").streams.push_back(chunks);
    }

    /// Requests passed to `complete`, in order.
    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.script.lock().expect("script lock").requests.clone()
    }

    pub fn stream_requests(&self) -> Vec<CompletionRequest> {
        self.script.lock().expect("script lock").stream_requests.clone()
    }
}

#[async_trait]
impl ReasoningBackend for ScriptedBackend {
    fn engine(&self) -> EngineId {
        self.engine
    }

    fn is_available(&self) -> bool {
        self.available
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<ModelReply, BackendError> {
        let mut script = self.script.lock().expect("script lock");
        script.requests.push(request.clone());
        script.replies.pop_front().unwrap_or_else(|| Ok(text_reply(FALLBACK_TEXT, 1)))
    }

    async fn stream(&self, request: &CompletionRequest) -> Result<ChunkStream, BackendError> {
        let chunks = {
            let mut script = self.script.lock().expect("script lock");
            script.stream_requests.push(request.clone());
            script.streams.pop_front().unwrap_or_else(|| text_chunks(&[FALLBACK_TEXT], 1))
        };
        Ok(Box::pin(stream::iter(chunks)))
    }
}
