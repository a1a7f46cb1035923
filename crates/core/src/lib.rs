pub mod config;
pub mod domain;
pub mod errors;
pub mod org;
pub mod ports;

pub use domain::access::{AccessGrant, Capabilities, Persona, RowScope, VisibleSet};
pub use domain::conversation::{
    ConversationId, ConversationSession, MemoryItem, SessionSummary, Turn, TurnRole,
};
pub use domain::employee::{Employee, EmployeeId};
pub use domain::sales::{DateRange, PeriodPreset, SalesRecord, SalesTarget};
pub use errors::{ApplicationError, AuthorizationError, InterfaceError, StoreError};
pub use org::IdentityGraph;
