//! Agent orchestration for the sales-performance assistant.
//!
//! A chat request flows through these stages:
//! 1. **Access** (`access`) - resolve the caller, their grant and the identities they may see
//! 2. **Instructions** (`prompt`) - assemble system instructions from grant, persona and memory
//! 3. **Tool loop** (`tool_loop`) - let the primary backend fetch data through `tools`
//! 4. **Streaming** (`stream`) - emit `token`/`done`/`error` events to the client
//! 5. **Secondary engines** (`engines`) - replay the evidence trail to two independent backends
//!
//! The model never reads data directly. Every row it sees comes from a tool handler that has
//! re-applied the caller's visible identity set.

use thiserror::Error;

use pulse_core::domain::employee::EmployeeId;
use pulse_core::errors::{ApplicationError, AuthorizationError, StoreError};

use crate::llm::EngineId;

pub mod access;
pub mod cancel;
pub mod engines;
pub mod llm;
pub mod prompt;
pub mod runtime;
pub mod stream;
pub mod tool_loop;
pub mod tools;

#[cfg(test)]
mod test_support;

pub use access::{AccessResolver, ResolvedAccess};
pub use engines::{
    EngineCoordinator, HistoryMessage, PreparedSecondary, SecondaryRequest, SecondaryStream,
};
pub use runtime::{ActiveStream, AgentRuntime, ChatReply, ChatRequest, HistoryView, PreparedChat};
pub use stream::{DonePayload, StreamEvent, StreamWriter};

/// Opaque identity handed over by the session layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CallerIdentity(pub EmployeeId);

#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Authorization(#[from] AuthorizationError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("engine `{0}` cannot be invoked as a secondary engine")]
    UnsupportedEngine(EngineId),
}

impl From<AgentError> for ApplicationError {
    fn from(error: AgentError) -> Self {
        match error {
            AgentError::Authorization(error) => ApplicationError::Authorization(error),
            AgentError::Store(error) => ApplicationError::Store(error),
            AgentError::InvalidRequest(message) => ApplicationError::InvalidRequest(message),
            AgentError::UnsupportedEngine(engine) => {
                ApplicationError::InvalidRequest(format!("unsupported engine `{engine}`"))
            }
        }
    }
}
