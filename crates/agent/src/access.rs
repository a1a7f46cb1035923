use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::NaiveDate;
use tokio::sync::RwLock;
use tracing::{debug, info};

use pulse_core::domain::access::{AccessGrant, Persona, RowScope, VisibleSet};
use pulse_core::domain::employee::{Employee, EmployeeId};
use pulse_core::errors::{AuthorizationError, StoreError};
use pulse_core::org::IdentityGraph;
use pulse_core::ports::{GrantStore, IdentityDirectory};

use crate::tools::ToolContext;
use crate::{AgentError, CallerIdentity};

struct CachedGraph {
    graph: Arc<IdentityGraph>,
    loaded_at: Instant,
}

/// Everything the request needs to know about the caller, computed once before any backend call.
#[derive(Clone, Debug)]
pub struct ResolvedAccess {
    pub caller: Employee,
    pub grant: AccessGrant,
    pub persona: Option<Persona>,
    pub visible: VisibleSet,
    pub graph: Arc<IdentityGraph>,
}

impl ResolvedAccess {
    pub fn tool_context(&self, today: NaiveDate) -> ToolContext {
        ToolContext {
            caller: self.caller.clone(),
            grant: self.grant.clone(),
            visible: self.visible.clone(),
            graph: Arc::clone(&self.graph),
            today,
        }
    }
}

pub struct AccessResolver {
    directory: Arc<dyn IdentityDirectory>,
    grants: Arc<dyn GrantStore>,
    cache: RwLock<Option<CachedGraph>>,
    ttl: Duration,
}

impl AccessResolver {
    pub fn new(
        directory: Arc<dyn IdentityDirectory>,
        grants: Arc<dyn GrantStore>,
        ttl: Duration,
    ) -> Self {
        Self { directory, grants, cache: RwLock::new(None), ttl }
    }

    /// Resolves caller, grant, persona and visible identities. Fails before any backend work.
    pub async fn resolve(&self, identity: CallerIdentity) -> Result<ResolvedAccess, AgentError> {
        let caller = self.resolve_caller(identity).await?;
        let grant = self.resolve_scope(&caller).await?;
        let persona = match grant.persona_id.as_deref() {
            Some(persona_id) => self.grants.persona(persona_id).await?,
            None => None,
        };
        let graph = self.identity_graph().await?;
        let visible = graph.expand(caller.id, grant.row_scope);

        info!(
            event_name = "agent.access.resolved",
            employee_id = %caller.id,
            row_scope = grant.row_scope.as_str(),
            visible_count = visible.len().map(|n| n as i64).unwrap_or(-1),
            "resolved caller access"
        );

        Ok(ResolvedAccess { caller, grant, persona, visible, graph })
    }

    pub async fn resolve_caller(&self, identity: CallerIdentity) -> Result<Employee, AgentError> {
        let employee = self
            .directory
            .find_employee(identity.0)
            .await?
            .ok_or(AuthorizationError::UnknownCaller(identity.0))?;
        if !employee.active {
            return Err(AuthorizationError::InactiveCaller(employee.id).into());
        }
        Ok(employee)
    }

    pub async fn resolve_scope(&self, employee: &Employee) -> Result<AccessGrant, AgentError> {
        self.grants
            .grant_for(employee)
            .await?
            .ok_or_else(|| AuthorizationError::MissingGrant(employee.id).into())
    }

    /// `own_only` and `all` never touch the identity graph.
    pub async fn expand_visible_identities(
        &self,
        caller: EmployeeId,
        scope: RowScope,
    ) -> Result<VisibleSet, AgentError> {
        match scope {
            RowScope::OwnOnly => Ok(VisibleSet::only_self(caller)),
            RowScope::All => Ok(VisibleSet::All),
            RowScope::OwnAndSubtree | RowScope::DivisionOnly => {
                let graph = self.identity_graph().await?;
                Ok(graph.expand(caller, scope))
            }
        }
    }

    pub async fn identity_graph(&self) -> Result<Arc<IdentityGraph>, StoreError> {
        {
            let cache = self.cache.read().await;
            if let Some(cached) = cache.as_ref() {
                if cached.loaded_at.elapsed() < self.ttl {
                    return Ok(Arc::clone(&cached.graph));
                }
            }
        }

        let mut cache = self.cache.write().await;
        if let Some(cached) = cache.as_ref() {
            if cached.loaded_at.elapsed() < self.ttl {
                return Ok(Arc::clone(&cached.graph));
            }
        }

        let graph = Arc::new(IdentityGraph::build(self.directory.load_identity_graph().await?));
        debug!(
            event_name = "agent.access.graph_loaded",
            employees = graph.len(),
            "loaded identity graph"
        );
        *cache = Some(CachedGraph { graph: Arc::clone(&graph), loaded_at: Instant::now() });
        Ok(graph)
    }
}
