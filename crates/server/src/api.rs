//! HTTP surface for the assistant.
//!
//! - `POST /api/chat`: chat; JSON reply, or SSE when `stream` is set
//! - `POST /api/engines/{engine}`: secondary engine (`deepseek`, `xai`), SSE
//! - `GET /api/history`: one session (`?conversationId=`) or recent ones
//! - `POST /api/history/{conversationId}/archive`: archive a session
//!
//! The caller arrives as `x-employee-id` from the session layer in front of this service.
//! Authorization failures are answered as HTTP errors before any stream opens.

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    extract::{FromRequestParts, Path, Query, State},
    http::{request::Parts, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures::{Stream, StreamExt};
use pulse_agent::llm::EngineId;
use pulse_agent::tool_loop::EvidenceEntry;
use pulse_agent::{
    AgentError, AgentRuntime, CallerIdentity, ChatRequest, EngineCoordinator, HistoryMessage,
    HistoryView, SecondaryRequest, StreamEvent,
};
use pulse_core::domain::conversation::ConversationId;
use pulse_core::domain::employee::EmployeeId;
use pulse_core::errors::{ApplicationError, InterfaceError};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub const EMPLOYEE_HEADER: &str = "x-employee-id";

#[derive(Clone)]
pub struct ApiState {
    pub runtime: Arc<AgentRuntime>,
    pub engines: Arc<EngineCoordinator>,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/api/chat", post(chat))
        .route("/api/engines/{engine}", post(secondary_engine))
        .route("/api/history", get(history))
        .route("/api/history/{conversation_id}/archive", post(archive))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Request / Response types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatBody {
    pub message: String,
    #[serde(default)]
    pub conversation_id: Option<ConversationId>,
    #[serde(default)]
    pub is_proactive: bool,
    #[serde(default)]
    pub stream: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineBody {
    #[serde(default)]
    pub messages: Vec<HistoryMessage>,
    #[serde(default)]
    pub system_prompt: String,
    pub user_message: String,
    #[serde(default)]
    pub conversation_id: Option<ConversationId>,
    /// The primary's `toolResultsForEngines`, replayed verbatim.
    #[serde(default)]
    pub tool_results: Vec<EvidenceEntry>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryQuery {
    pub conversation_id: Option<ConversationId>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveResponse {
    pub conversation_id: ConversationId,
    pub archived: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    pub error: String,
    pub correlation_id: String,
}

// ---------------------------------------------------------------------------
// Caller and errors
// ---------------------------------------------------------------------------

/// The authenticated caller plus the correlation id carried through this request's logs.
#[derive(Clone, Debug)]
pub struct Caller {
    pub identity: CallerIdentity,
    pub correlation_id: String,
}

impl<S: Send + Sync> FromRequestParts<S> for Caller {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let correlation_id = Uuid::new_v4().to_string();
        let employee_id = parts
            .headers
            .get(EMPLOYEE_HEADER)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse::<i64>().ok());

        match employee_id {
            Some(id) => Ok(Self { identity: CallerIdentity(EmployeeId(id)), correlation_id }),
            None => Err(ApiError(InterfaceError::Unauthorized {
                message: format!("missing or malformed `{EMPLOYEE_HEADER}` header"),
                correlation_id,
            })),
        }
    }
}

#[derive(Debug)]
pub struct ApiError(pub InterfaceError);

impl ApiError {
    fn agent(error: AgentError, caller: &Caller) -> Self {
        Self(ApplicationError::from(error).into_interface(caller.correlation_id.clone()))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            InterfaceError::BadRequest { .. } => StatusCode::BAD_REQUEST,
            InterfaceError::Unauthorized { .. } => StatusCode::UNAUTHORIZED,
            InterfaceError::Forbidden { .. } => StatusCode::FORBIDDEN,
            InterfaceError::NotFound { .. } => StatusCode::NOT_FOUND,
            InterfaceError::ServiceUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            InterfaceError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        };
        warn!(
            event_name = "api.request.rejected",
            correlation_id = %self.0.correlation_id(),
            status = status.as_u16(),
            error = %self.0,
            "request rejected"
        );
        let body = ErrorBody {
            error: self.0.user_message().to_string(),
            correlation_id: self.0.correlation_id().to_string(),
        };
        (status, Json(body)).into_response()
    }
}

// ---------------------------------------------------------------------------
// Streaming
// ---------------------------------------------------------------------------

fn sse_event(event: StreamEvent) -> Event {
    match Event::default().event(event.kind()).json_data(&event) {
        Ok(encoded) => encoded,
        Err(error) => Event::default()
            .event("error")
            .data(format!(r#"{{"type":"error","message":"event encoding failed: {error}"}}"#)),
    }
}

fn sse_response(
    receiver: mpsc::Receiver<StreamEvent>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let events = ReceiverStream::new(receiver).map(|event| Ok(sse_event(event)));
    Sse::new(events).keep_alive(KeepAlive::default())
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn chat(
    State(state): State<ApiState>,
    caller: Caller,
    Json(body): Json<ChatBody>,
) -> Result<Response, ApiError> {
    let span = info_span!("api.chat", correlation_id = %caller.correlation_id);
    let request = ChatRequest {
        identity: caller.identity,
        message: body.message,
        conversation_id: body.conversation_id,
        is_proactive: body.is_proactive,
    };
    let prepared = state
        .runtime
        .prepare(request)
        .instrument(span.clone())
        .await
        .map_err(|error| ApiError::agent(error, &caller))?;

    if !body.stream {
        let reply = state
            .runtime
            .chat(prepared)
            .instrument(span)
            .await
            .map_err(|error| ApiError::agent(error, &caller))?;
        return Ok(Json(reply).into_response());
    }

    info!(
        parent: &span,
        event_name = "api.chat.stream_opened",
        conversation_id = %prepared.conversation_id,
        "chat stream opened"
    );
    let (active, receiver) = state.runtime.open_stream(prepared);
    let runtime = Arc::clone(&state.runtime);
    tokio::spawn(async move { runtime.run_stream(active).await }.instrument(span));
    Ok(sse_response(receiver).into_response())
}

async fn secondary_engine(
    State(state): State<ApiState>,
    Path(engine): Path<String>,
    caller: Caller,
    Json(body): Json<EngineBody>,
) -> Result<Response, ApiError> {
    let span = info_span!("api.engine", correlation_id = %caller.correlation_id, engine = %engine);
    let engine = EngineId::from_path(&engine).ok_or_else(|| {
        ApiError::agent(AgentError::InvalidRequest(format!("unknown engine `{engine}`")), &caller)
    })?;

    let request = SecondaryRequest {
        identity: caller.identity,
        engine,
        messages: body.messages,
        system_prompt: body.system_prompt,
        user_message: body.user_message,
        conversation_id: body.conversation_id,
        evidence: body.tool_results,
    };
    let prepared = state
        .engines
        .prepare(request)
        .instrument(span.clone())
        .await
        .map_err(|error| ApiError::agent(error, &caller))?;

    let (stream, receiver) = state.engines.open_stream(prepared);
    let engines = Arc::clone(&state.engines);
    tokio::spawn(async move { engines.run(stream).await }.instrument(span));
    Ok(sse_response(receiver).into_response())
}

async fn history(
    State(state): State<ApiState>,
    caller: Caller,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<HistoryView>, ApiError> {
    state
        .runtime
        .history(caller.identity, query.conversation_id.as_ref())
        .await
        .map(Json)
        .map_err(|error| ApiError::agent(error, &caller))
}

async fn archive(
    State(state): State<ApiState>,
    Path(conversation_id): Path<String>,
    caller: Caller,
) -> Result<Json<ArchiveResponse>, ApiError> {
    let conversation_id = ConversationId(conversation_id);
    state
        .runtime
        .archive(caller.identity, &conversation_id)
        .await
        .map_err(|error| ApiError::agent(error, &caller))?;
    Ok(Json(ArchiveResponse { conversation_id, archived: true }))
}
