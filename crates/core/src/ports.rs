//! Contracts the orchestrator needs from its external collaborators.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::access::{AccessGrant, Persona, VisibleSet};
use crate::domain::conversation::{
    ConversationId, ConversationSession, MemoryItem, SessionSummary, Turn,
};
use crate::domain::employee::{Employee, EmployeeId};
use crate::domain::sales::{DateRange, SalesQuery, SalesRecord, SalesTarget, TableQuery, TableRows};
use crate::errors::StoreError;

#[async_trait]
pub trait IdentityDirectory: Send + Sync {
    /// Every employee record, active or not.
    async fn load_identity_graph(&self) -> Result<Vec<Employee>, StoreError>;
    async fn find_employee(&self, id: EmployeeId) -> Result<Option<Employee>, StoreError>;
}

#[async_trait]
pub trait GrantStore: Send + Sync {
    async fn grant_for(&self, employee: &Employee) -> Result<Option<AccessGrant>, StoreError>;
    async fn persona(&self, persona_id: &str) -> Result<Option<Persona>, StoreError>;
}

#[async_trait]
pub trait SalesStore: Send + Sync {
    async fn sales_records(&self, query: &SalesQuery) -> Result<Vec<SalesRecord>, StoreError>;
    async fn sales_targets(
        &self,
        visible: &VisibleSet,
        range: &DateRange,
    ) -> Result<Vec<SalesTarget>, StoreError>;
    async fn read_table(&self, query: &TableQuery) -> Result<TableRows, StoreError>;
}

#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Reuses `id` when it names a live session owned by `owner`, otherwise opens a new one.
    async fn get_or_create(
        &self,
        owner: EmployeeId,
        id: Option<&ConversationId>,
        title: &str,
    ) -> Result<ConversationId, StoreError>;

    /// Appends one immutable turn and returns the session's new message count.
    async fn append_turn(&self, id: &ConversationId, turn: Turn) -> Result<u32, StoreError>;

    /// The latest `limit` turns in chronological order.
    async fn load_recent_turns(
        &self,
        id: &ConversationId,
        limit: u32,
    ) -> Result<Vec<Turn>, StoreError>;

    async fn session(
        &self,
        owner: EmployeeId,
        id: &ConversationId,
    ) -> Result<Option<ConversationSession>, StoreError>;

    async fn recent_sessions(
        &self,
        owner: EmployeeId,
        limit: u32,
    ) -> Result<Vec<SessionSummary>, StoreError>;

    /// Returns `false` when no such session belongs to `owner`.
    async fn archive(&self, owner: EmployeeId, id: &ConversationId) -> Result<bool, StoreError>;
}

#[async_trait]
pub trait MemoryStore: Send + Sync {
    async fn live_memories(
        &self,
        owner: EmployeeId,
        now: DateTime<Utc>,
    ) -> Result<Vec<MemoryItem>, StoreError>;
}
