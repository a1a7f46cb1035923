use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tokio::sync::RwLock;

use pulse_core::domain::access::{AccessGrant, Persona, VisibleSet};
use pulse_core::domain::conversation::{
    ConversationId, ConversationSession, MemoryItem, SessionSummary, Turn,
};
use pulse_core::domain::employee::{Employee, EmployeeId};
use pulse_core::domain::sales::{
    DateRange, SalesQuery, SalesRecord, SalesTarget, TableQuery, TableRows,
};
use pulse_core::errors::StoreError;
use pulse_core::ports::{ConversationStore, GrantStore, IdentityDirectory, MemoryStore, SalesStore};

use super::sales::{owner_column_for, MAX_TABLE_ROWS};

#[derive(Default)]
pub struct InMemoryAccessRepository {
    employees: RwLock<HashMap<EmployeeId, Employee>>,
    grants: RwLock<HashMap<EmployeeId, AccessGrant>>,
    personas: RwLock<HashMap<String, Persona>>,
}

impl InMemoryAccessRepository {
    pub async fn insert_employee(&self, employee: Employee) {
        self.employees.write().await.insert(employee.id, employee);
    }

    pub async fn insert_grant(&self, grant: AccessGrant) {
        self.grants.write().await.insert(grant.employee_id, grant);
    }

    pub async fn insert_persona(&self, persona: Persona) {
        self.personas.write().await.insert(persona.id.clone(), persona);
    }
}

#[async_trait]
impl IdentityDirectory for InMemoryAccessRepository {
    async fn load_identity_graph(&self) -> Result<Vec<Employee>, StoreError> {
        let employees = self.employees.read().await;
        let mut all: Vec<Employee> = employees.values().cloned().collect();
        all.sort_by_key(|employee| employee.id);
        Ok(all)
    }

    async fn find_employee(&self, id: EmployeeId) -> Result<Option<Employee>, StoreError> {
        Ok(self.employees.read().await.get(&id).cloned())
    }
}

#[async_trait]
impl GrantStore for InMemoryAccessRepository {
    async fn grant_for(&self, employee: &Employee) -> Result<Option<AccessGrant>, StoreError> {
        Ok(self.grants.read().await.get(&employee.id).cloned())
    }

    async fn persona(&self, persona_id: &str) -> Result<Option<Persona>, StoreError> {
        Ok(self.personas.read().await.get(persona_id).cloned())
    }
}

/// Sales ledger held in memory. Every query is recorded so tests can assert on what was asked.
#[derive(Default)]
pub struct InMemorySalesRepository {
    records: RwLock<Vec<SalesRecord>>,
    targets: RwLock<Vec<SalesTarget>>,
    employees: RwLock<Vec<Employee>>,
    queries: RwLock<Vec<SalesQuery>>,
    unavailable: AtomicBool,
}

impl InMemorySalesRepository {
    pub async fn insert_record(&self, record: SalesRecord) {
        self.records.write().await.push(record);
    }

    pub async fn insert_target(&self, target: SalesTarget) {
        self.targets.write().await.push(target);
    }

    /// Employees exposed through `read_table("employees")`.
    pub async fn insert_employee(&self, employee: Employee) {
        self.employees.write().await.push(employee);
    }

    pub async fn recorded_queries(&self) -> Vec<SalesQuery> {
        self.queries.read().await.clone()
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("sales store is offline".to_string()));
        }
        Ok(())
    }
}

fn to_row<T: serde::Serialize>(value: &T) -> Result<Map<String, Value>, StoreError> {
    match serde_json::to_value(value) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(StoreError::Decode("row did not serialize to an object".to_string())),
        Err(error) => Err(StoreError::Decode(error.to_string())),
    }
}

fn employee_row(employee: &Employee) -> Map<String, Value> {
    let mut map = Map::new();
    map.insert("id".to_string(), Value::from(employee.id.0));
    map.insert("name".to_string(), Value::from(employee.name.clone()));
    map.insert("title".to_string(), Value::from(employee.title.clone()));
    map.insert("division".to_string(), Value::from(employee.division.clone()));
    map.insert("unit".to_string(), employee.unit.clone().map(Value::from).unwrap_or(Value::Null));
    map.insert(
        "manager_id".to_string(),
        employee.manager_id.map(|id| Value::from(id.0)).unwrap_or(Value::Null),
    );
    map.insert("active".to_string(), Value::from(i64::from(employee.active)));
    map
}

#[async_trait]
impl SalesStore for InMemorySalesRepository {
    async fn sales_records(&self, query: &SalesQuery) -> Result<Vec<SalesRecord>, StoreError> {
        self.queries.write().await.push(query.clone());
        self.check_available()?;
        let records = self.records.read().await;
        let mut matched: Vec<SalesRecord> = records
            .iter()
            .filter(|record| query.range.contains(record.sold_on))
            .filter(|record| query.employee.map_or(true, |id| record.employee_id == id))
            .filter(|record| query.visible.contains(record.employee_id))
            .cloned()
            .collect();
        matched.sort_by_key(|record| record.sold_on);
        Ok(matched)
    }

    async fn sales_targets(
        &self,
        visible: &VisibleSet,
        range: &DateRange,
    ) -> Result<Vec<SalesTarget>, StoreError> {
        self.check_available()?;
        let targets = self.targets.read().await;
        Ok(targets
            .iter()
            .filter(|target| range.overlaps(target.period_start, target.period_end))
            .filter(|target| visible.contains(target.employee_id))
            .cloned()
            .collect())
    }

    async fn read_table(&self, query: &TableQuery) -> Result<TableRows, StoreError> {
        self.check_available()?;
        let owner = owner_column_for(&query.table).ok_or_else(|| {
            StoreError::Rejected(format!("table `{}` is not queryable", query.table))
        })?;

        let rows: Vec<(EmployeeId, Map<String, Value>)> = match query.table.as_str() {
            "sales" => {
                let records = self.records.read().await;
                records
                    .iter()
                    .map(|record| Ok((record.employee_id, to_row(record)?)))
                    .collect::<Result<_, StoreError>>()?
            }
            "sales_targets" => {
                let targets = self.targets.read().await;
                targets
                    .iter()
                    .map(|target| Ok((target.employee_id, to_row(target)?)))
                    .collect::<Result<_, StoreError>>()?
            }
            _ => {
                let employees = self.employees.read().await;
                employees.iter().map(|employee| (employee.id, employee_row(employee))).collect()
            }
        };

        let limit = query.limit.clamp(1, MAX_TABLE_ROWS) as usize;
        let mut selected = Vec::new();
        for (owner_id, row) in rows {
            if !query.visible.contains(owner_id) {
                continue;
            }
            for filter in &query.filters {
                if !row.contains_key(&filter.column) {
                    return Err(StoreError::Rejected(format!(
                        "unknown filter column `{}` on `{}`",
                        filter.column, query.table
                    )));
                }
            }
            if !query.filters.iter().all(|filter| row.get(&filter.column) == Some(&filter.value)) {
                continue;
            }
            let projected = if query.columns.is_empty() {
                row
            } else {
                let mut projected = Map::new();
                for column in query.columns.iter().map(String::as_str).chain([owner]) {
                    let value = row.get(column).cloned().ok_or_else(|| {
                        StoreError::Rejected(format!(
                            "unknown column `{column}` on `{}`",
                            query.table
                        ))
                    })?;
                    projected.insert(column.to_string(), value);
                }
                projected
            };
            selected.push(projected);
            if selected.len() >= limit {
                break;
            }
        }

        Ok(TableRows { owner_column: Some(owner.to_string()), rows: selected })
    }
}

#[derive(Default)]
pub struct InMemoryConversationRepository {
    sessions: RwLock<HashMap<String, ConversationSession>>,
}

#[async_trait]
impl ConversationStore for InMemoryConversationRepository {
    async fn get_or_create(
        &self,
        owner: EmployeeId,
        id: Option<&ConversationId>,
        title: &str,
    ) -> Result<ConversationId, StoreError> {
        let mut sessions = self.sessions.write().await;
        if let Some(id) = id {
            if sessions.get(&id.0).is_some_and(|s| s.owner == owner && !s.archived) {
                return Ok(id.clone());
            }
        }

        let now = Utc::now();
        let created = ConversationId::generate();
        sessions.insert(
            created.0.clone(),
            ConversationSession {
                id: created.clone(),
                owner,
                title: title.to_string(),
                turns: Vec::new(),
                message_count: 0,
                created_at: now,
                last_active_at: now,
                archived: false,
            },
        );
        Ok(created)
    }

    async fn append_turn(&self, id: &ConversationId, turn: Turn) -> Result<u32, StoreError> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(&id.0)
            .ok_or_else(|| StoreError::NotFound(format!("conversation `{id}` not found")))?;
        session.last_active_at = turn.created_at;
        session.turns.push(turn);
        session.message_count += 1;
        Ok(session.message_count)
    }

    async fn load_recent_turns(
        &self,
        id: &ConversationId,
        limit: u32,
    ) -> Result<Vec<Turn>, StoreError> {
        let sessions = self.sessions.read().await;
        let Some(session) = sessions.get(&id.0) else {
            return Ok(Vec::new());
        };
        let skip = session.turns.len().saturating_sub(limit as usize);
        Ok(session.turns[skip..].to_vec())
    }

    async fn session(
        &self,
        owner: EmployeeId,
        id: &ConversationId,
    ) -> Result<Option<ConversationSession>, StoreError> {
        let sessions = self.sessions.read().await;
        Ok(sessions.get(&id.0).filter(|session| session.owner == owner).cloned())
    }

    async fn recent_sessions(
        &self,
        owner: EmployeeId,
        limit: u32,
    ) -> Result<Vec<SessionSummary>, StoreError> {
        let sessions = self.sessions.read().await;
        let mut owned: Vec<&ConversationSession> = sessions
            .values()
            .filter(|session| session.owner == owner && !session.archived)
            .collect();
        owned.sort_by(|a, b| b.last_active_at.cmp(&a.last_active_at));
        Ok(owned
            .into_iter()
            .take(limit as usize)
            .map(|session| SessionSummary {
                id: session.id.clone(),
                title: session.title.clone(),
                last_active_at: session.last_active_at,
                message_count: session.message_count,
            })
            .collect())
    }

    async fn archive(&self, owner: EmployeeId, id: &ConversationId) -> Result<bool, StoreError> {
        let mut sessions = self.sessions.write().await;
        match sessions.get_mut(&id.0) {
            Some(session) if session.owner == owner => {
                session.archived = true;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[derive(Default)]
pub struct InMemoryMemoryRepository {
    items: RwLock<HashMap<EmployeeId, Vec<MemoryItem>>>,
}

impl InMemoryMemoryRepository {
    pub async fn insert(&self, owner: EmployeeId, item: MemoryItem) {
        let mut items = self.items.write().await;
        let owned = items.entry(owner).or_default();
        owned.retain(|existing| existing.key != item.key);
        owned.push(item);
        owned.sort_by(|a, b| a.key.cmp(&b.key));
    }
}

#[async_trait]
impl MemoryStore for InMemoryMemoryRepository {
    async fn live_memories(
        &self,
        owner: EmployeeId,
        now: DateTime<Utc>,
    ) -> Result<Vec<MemoryItem>, StoreError> {
        let items = self.items.read().await;
        Ok(items
            .get(&owner)
            .map(|owned| owned.iter().filter(|item| item.is_live(now)).cloned().collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use chrono::{Duration, NaiveDate, Utc};
    use rust_decimal::Decimal;
    use serde_json::json;

    use pulse_core::domain::access::VisibleSet;
    use pulse_core::domain::conversation::{MemoryItem, Turn};
    use pulse_core::domain::employee::EmployeeId;
    use pulse_core::domain::sales::{ColumnFilter, DateRange, SalesQuery, SalesRecord, TableQuery};
    use pulse_core::errors::StoreError;
    use pulse_core::ports::{ConversationStore, MemoryStore, SalesStore};

    use crate::repositories::{
        InMemoryConversationRepository, InMemoryMemoryRepository, InMemorySalesRepository,
    };

    fn date(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, d).expect("date")
    }

    fn record(employee: i64, day: u32, amount: i64) -> SalesRecord {
        SalesRecord {
            employee_id: EmployeeId(employee),
            division: "North".to_string(),
            sold_on: date(day),
            product_line: "Platform".to_string(),
            amount: Decimal::new(amount, 0),
            units: 1,
        }
    }

    #[tokio::test]
    async fn in_memory_sales_respects_visibility_and_records_queries() {
        let repo = InMemorySalesRepository::default();
        repo.insert_record(record(1, 3, 100)).await;
        repo.insert_record(record(2, 4, 200)).await;

        let query = SalesQuery {
            visible: VisibleSet::only_self(EmployeeId(1)),
            employee: None,
            range: DateRange::new(date(1), date(31)).expect("range"),
        };
        let found = repo.sales_records(&query).await.expect("records");

        assert_eq!(found.len(), 1);
        assert_eq!(found[0].employee_id, EmployeeId(1));
        assert_eq!(repo.recorded_queries().await, vec![query]);
    }

    #[tokio::test]
    async fn in_memory_sales_can_be_taken_offline() {
        let repo = InMemorySalesRepository::default();
        repo.set_unavailable(true);
        let query = SalesQuery {
            visible: VisibleSet::All,
            employee: None,
            range: DateRange::new(date(1), date(31)).expect("range"),
        };
        assert!(matches!(repo.sales_records(&query).await, Err(StoreError::Unavailable(_))));
    }

    #[tokio::test]
    async fn in_memory_read_table_projects_owner_column() {
        let repo = InMemorySalesRepository::default();
        repo.insert_record(record(1, 3, 100)).await;
        repo.insert_record(record(2, 4, 200)).await;

        let rows = repo
            .read_table(&TableQuery {
                table: "sales".to_string(),
                columns: vec!["amount".to_string()],
                filters: vec![ColumnFilter { column: "units".to_string(), value: json!(1) }],
                limit: 10,
                visible: VisibleSet::Only(BTreeSet::from([EmployeeId(2)])),
            })
            .await
            .expect("rows");

        assert_eq!(rows.rows.len(), 1);
        assert_eq!(rows.rows[0]["employee_id"], json!(2));
        assert_eq!(rows.rows[0].len(), 2);
    }

    #[tokio::test]
    async fn in_memory_conversation_counts_and_windows_turns() {
        let repo = InMemoryConversationRepository::default();
        let id = repo.get_or_create(EmployeeId(1), None, "Chat").await.expect("create");
        for index in 0..4 {
            repo.append_turn(&id, Turn::user(format!("m{index}"), false)).await.expect("append");
        }

        let recent = repo.load_recent_turns(&id, 2).await.expect("recent");
        assert_eq!(recent.iter().map(|t| t.content.as_str()).collect::<Vec<_>>(), ["m2", "m3"]);
        let summaries = repo.recent_sessions(EmployeeId(1), 5).await.expect("summaries");
        assert_eq!(summaries[0].message_count, 4);
    }

    #[tokio::test]
    async fn in_memory_memory_hides_expired_items() {
        let repo = InMemoryMemoryRepository::default();
        let now = Utc::now();
        repo.insert(
            EmployeeId(1),
            MemoryItem { key: "tone".into(), value: "brief".into(), expires_at: None },
        )
        .await;
        repo.insert(
            EmployeeId(1),
            MemoryItem {
                key: "old".into(),
                value: "gone".into(),
                expires_at: Some(now - Duration::minutes(5)),
            },
        )
        .await;

        let live = repo.live_memories(EmployeeId(1), now).await.expect("live");
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].key, "tone");
    }
}
