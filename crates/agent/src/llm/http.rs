use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client as HttpClient;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};
use uuid::Uuid;

use pulse_core::config::BackendConfig;

use super::sources::{source_for, StreamSource};
use super::sse::sse_data_stream;
use super::{
    BackendError, ChunkStream, CompletionRequest, EngineId, ModelReply, ReasoningBackend,
    TokenUsage, ToolCallRequest,
};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const ERROR_BODY_MAX_CHARS: usize = 512;

/// OpenAI-compatible chat-completions client for one backend.
pub struct HttpBackend {
    engine: EngineId,
    endpoint: String,
    model: String,
    api_key: Option<SecretString>,
    /// Bounded by `timeout_secs`.
    http: HttpClient,
    /// Bounded by `stream_timeout_secs`.
    http_stream: HttpClient,
    timeout_secs: u64,
    stream_timeout_secs: u64,
    source: Arc<dyn StreamSource>,
}

impl HttpBackend {
    pub fn new(engine: EngineId, config: &BackendConfig) -> Result<Self, BackendError> {
        let build = |timeout_secs: u64| {
            HttpClient::builder()
                .connect_timeout(CONNECT_TIMEOUT)
                .timeout(Duration::from_secs(timeout_secs))
                .build()
                .map_err(|error| BackendError::Transport { engine, reason: error.to_string() })
        };

        Ok(Self {
            engine,
            endpoint: format!("{}/chat/completions", config.base_url.trim_end_matches('/')),
            model: config.model.clone(),
            api_key: config.is_configured().then(|| config.api_key.clone()).flatten(),
            http: build(config.timeout_secs)?,
            http_stream: build(config.stream_timeout_secs)?,
            timeout_secs: config.timeout_secs,
            stream_timeout_secs: config.stream_timeout_secs,
            source: source_for(engine),
        })
    }

    fn body(&self, request: &CompletionRequest, stream: bool) -> Value {
        let mut body = json!({
            "model": self.model,
            "messages": request.messages,
            "stream": stream,
        });

        if !request.tools.is_empty() {
            let tools: Vec<Value> = request
                .tools
                .iter()
                .map(|spec| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": spec.name,
                            "description": spec.description,
                            "parameters": spec.parameters,
                        }
                    })
                })
                .collect();
            body["tools"] = Value::Array(tools);
            body["tool_choice"] = json!("auto");
        }

        if stream && self.source.request_usage_option() {
            body["stream_options"] = json!({ "include_usage": true });
        }

        body
    }

    async fn send(
        &self,
        client: &HttpClient,
        body: &Value,
        timeout_secs: u64,
    ) -> Result<reqwest::Response, BackendError> {
        let api_key =
            self.api_key.as_ref().ok_or(BackendError::NotConfigured { engine: self.engine })?;

        let response = client
            .post(&self.endpoint)
            .bearer_auth(api_key.expose_secret())
            .json(body)
            .send()
            .await
            .map_err(|error| self.transport_error(error, timeout_secs))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BackendError::UpstreamStatus {
                engine: self.engine,
                status: status.as_u16(),
                body: body.chars().take(ERROR_BODY_MAX_CHARS).collect(),
            });
        }

        Ok(response)
    }

    fn transport_error(&self, error: reqwest::Error, timeout_secs: u64) -> BackendError {
        if error.is_timeout() {
            BackendError::Timeout { engine: self.engine, duration_secs: timeout_secs }
        } else {
            BackendError::Transport { engine: self.engine, reason: error.to_string() }
        }
    }
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<ResponseChoice>,
    #[serde(default)]
    usage: Option<TokenUsage>,
}

#[derive(Debug, Deserialize)]
struct ResponseChoice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<ToolCallRequest>,
}

fn into_reply(engine: EngineId, response: CompletionResponse) -> Result<ModelReply, BackendError> {
    let choice = response.choices.into_iter().next().ok_or_else(|| BackendError::MalformedResponse {
        engine,
        reason: "response carried no choices".to_string(),
    })?;

    let tool_calls = choice
        .message
        .tool_calls
        .into_iter()
        .map(|mut call| {
            if call.id.trim().is_empty() {
                call.id = format!("call_{}", Uuid::new_v4().simple());
            }
            call
        })
        .collect();

    Ok(ModelReply {
        content: choice.message.content.filter(|content| !content.trim().is_empty()),
        tool_calls,
        usage: response.usage.unwrap_or_default(),
    })
}

#[async_trait]
impl ReasoningBackend for HttpBackend {
    fn engine(&self) -> EngineId {
        self.engine
    }

    fn is_available(&self) -> bool {
        self.api_key.is_some()
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<ModelReply, BackendError> {
        let body = self.body(request, false);
        let response = self.send(&self.http, &body, self.timeout_secs).await?;
        let parsed: CompletionResponse = response.json().await.map_err(|error| {
            if error.is_timeout() {
                BackendError::Timeout { engine: self.engine, duration_secs: self.timeout_secs }
            } else {
                BackendError::MalformedResponse { engine: self.engine, reason: error.to_string() }
            }
        })?;

        let reply = into_reply(self.engine, parsed)?;
        debug!(
            event_name = "agent.backend.completed",
            engine = %self.engine,
            tool_calls = reply.tool_calls.len(),
            total_tokens = reply.usage.total(),
            "backend completion received"
        );
        Ok(reply)
    }

    async fn stream(&self, request: &CompletionRequest) -> Result<ChunkStream, BackendError> {
        let body = self.body(request, true);
        let response = self.send(&self.http_stream, &body, self.stream_timeout_secs).await?;

        let engine = self.engine;
        let source = Arc::clone(&self.source);
        let chunks = sse_data_stream(response.bytes_stream()).filter_map(move |event| {
            let source = Arc::clone(&source);
            async move {
                match event {
                    Ok(data) => match source.parse_chunk(&data) {
                        Ok(chunk) => chunk.map(Ok),
                        Err(error) => {
                            warn!(
                                event_name = "agent.stream.malformed_chunk",
                                engine = %engine,
                                error = %error,
                                "dropping malformed stream chunk"
                            );
                            None
                        }
                    },
                    Err(error) => Some(Err(BackendError::Transport { engine, reason: error.0 })),
                }
            }
        });

        Ok(chunks.boxed())
    }
}
