//! Closed tool registry.
//!
//! Each tool identifier maps to one handler. Handlers never trust the store to have applied the
//! caller's visibility: every row is filtered against `ToolContext::visible` again before it is
//! returned to the model.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::NaiveDate;
use serde_json::{json, Map, Value};
use thiserror::Error;
use tracing::{info, warn};

use pulse_core::domain::access::{AccessGrant, RowScope, VisibleSet};
use pulse_core::domain::employee::{Employee, EmployeeId};
use pulse_core::errors::StoreError;
use pulse_core::org::IdentityGraph;
use pulse_core::ports::SalesStore;

use crate::llm::{ToolCallRequest, ToolSpec};

mod args;
mod directory;
mod sales;
mod table;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ToolKind {
    LookupEmployees,
    SalesSummary,
    SalesTrend,
    TargetProgress,
    TeamRanking,
    CompanyOverview,
    OrgStructure,
    Forecast,
    QueryTable,
}

impl ToolKind {
    pub const ALL: [ToolKind; 9] = [
        Self::LookupEmployees,
        Self::SalesSummary,
        Self::SalesTrend,
        Self::TargetProgress,
        Self::TeamRanking,
        Self::CompanyOverview,
        Self::OrgStructure,
        Self::Forecast,
        Self::QueryTable,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::LookupEmployees => "lookup_employees",
            Self::SalesSummary => "get_sales_summary",
            Self::SalesTrend => "get_sales_trend",
            Self::TargetProgress => "get_target_progress",
            Self::TeamRanking => "get_team_ranking",
            Self::CompanyOverview => "get_company_overview",
            Self::OrgStructure => "get_org_structure",
            Self::Forecast => "forecast_sales",
            Self::QueryTable => "query_table",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.name() == name)
    }

    /// Capability and row-scope gate. Hidden tools are also refused at execution time.
    pub fn permitted(&self, grant: &AccessGrant) -> bool {
        match self {
            Self::LookupEmployees
            | Self::SalesSummary
            | Self::SalesTrend
            | Self::TargetProgress => true,
            Self::TeamRanking => grant.row_scope != RowScope::OwnOnly,
            Self::CompanyOverview => grant.row_scope == RowScope::All,
            Self::OrgStructure => grant.capabilities.org_structure,
            Self::Forecast => grant.capabilities.forecasting,
            Self::QueryTable => grant.capabilities.free_query,
        }
    }

    fn handler(&self) -> &'static dyn ToolHandler {
        match self {
            Self::LookupEmployees => &directory::LookupEmployees,
            Self::SalesSummary => &sales::SalesSummary,
            Self::SalesTrend => &sales::SalesTrend,
            Self::TargetProgress => &sales::TargetProgress,
            Self::TeamRanking => &sales::TeamRanking,
            Self::CompanyOverview => &sales::CompanyOverview,
            Self::OrgStructure => &directory::OrgStructure,
            Self::Forecast => &sales::Forecast,
            Self::QueryTable => &table::QueryTable,
        }
    }

    pub fn spec(&self) -> ToolSpec {
        let max_rows = table::MAX_ROWS;
        let employee = json!({
            "type": "integer",
            "description": "Employee id. Omit to cover everyone you can see."
        });
        let (description, parameters) = match self {
            Self::LookupEmployees => (
                "Find employees you can see by name or title fragment.",
                object(
                    json!({
                        "query": { "type": "string", "description": "Name or title fragment." },
                        "division": { "type": "string" },
                        "include_inactive": { "type": "boolean" },
                        "limit": { "type": "integer", "minimum": 1, "maximum": 100 }
                    }),
                    &[],
                ),
            ),
            Self::SalesSummary => (
                "Sales totals (amount, units, deals) for a period, grouped by employee, \
                 product line or division.",
                object(
                    with_period(json!({
                        "employee_id": employee,
                        "group_by": {
                            "type": "string",
                            "enum": ["employee", "product_line", "division"]
                        }
                    })),
                    &[],
                ),
            ),
            Self::SalesTrend => (
                "Monthly sales totals for the last N calendar months, including the current one.",
                object(
                    json!({
                        "employee_id": employee,
                        "months": { "type": "integer", "minimum": 1, "maximum": 24 }
                    }),
                    &[],
                ),
            ),
            Self::TargetProgress => (
                "Target versus actual sales and attainment for a period.",
                object(with_period(json!({ "employee_id": employee })), &[]),
            ),
            Self::TeamRanking => (
                "Rank the employees you can see by amount, units or deal count.",
                object(
                    with_period(json!({
                        "metric": { "type": "string", "enum": ["amount", "units", "deals"] },
                        "limit": { "type": "integer", "minimum": 1, "maximum": 50 }
                    })),
                    &[],
                ),
            ),
            Self::CompanyOverview => (
                "Company-wide sales totals per division.",
                object(with_period(json!({})), &[]),
            ),
            Self::OrgStructure => (
                "Reporting lines under an employee, limited by depth.",
                object(
                    json!({
                        "root_employee_id": {
                            "type": "integer",
                            "description": "Defaults to you."
                        },
                        "depth": { "type": "integer", "minimum": 1, "maximum": 6 }
                    }),
                    &[],
                ),
            ),
            Self::Forecast => (
                "Project monthly sales forward with a least-squares trend over complete months.",
                object(
                    json!({
                        "employee_id": employee,
                        "history_months": { "type": "integer", "minimum": 3, "maximum": 24 },
                        "horizon_months": { "type": "integer", "minimum": 1, "maximum": 12 }
                    }),
                    &[],
                ),
            ),
            Self::QueryTable => (
                "Read rows from a catalogued table (sales, sales_targets, employees) \
                 with equality filters.",
                object(
                    json!({
                        "table": { "type": "string" },
                        "columns": { "type": "array", "items": { "type": "string" } },
                        "filters": {
                            "type": "object",
                            "description": "Column to exact value.",
                            "additionalProperties": true
                        },
                        "limit": { "type": "integer", "minimum": 1, "maximum": max_rows }
                    }),
                    &["table"],
                ),
            ),
        };

        ToolSpec { name: self.name(), description, parameters }
    }
}

fn object(properties: Value, required: &[&str]) -> Value {
    json!({
        "type": "object",
        "properties": properties,
        "required": required,
        "additionalProperties": false
    })
}

fn with_period(mut properties: Value) -> Value {
    if let Some(map) = properties.as_object_mut() {
        map.insert(
            "period".to_string(),
            json!({
                "type": "string",
                "enum": [
                    "today", "this_week", "this_month", "last_month",
                    "this_quarter", "last_quarter", "this_year", "last_year"
                ]
            }),
        );
        map.insert(
            "start_date".to_string(),
            json!({ "type": "string", "format": "date", "description": "ISO date, inclusive." }),
        );
        map.insert(
            "end_date".to_string(),
            json!({ "type": "string", "format": "date", "description": "ISO date, inclusive." }),
        );
    }
    properties
}

/// The tools offered to a caller holding `grant`.
pub fn list_tools(grant: &AccessGrant) -> Vec<ToolSpec> {
    ToolKind::ALL.iter().filter(|kind| kind.permitted(grant)).map(ToolKind::spec).collect()
}

/// Read-only view of the caller a handler runs for.
#[derive(Clone, Debug)]
pub struct ToolContext {
    pub caller: Employee,
    pub grant: AccessGrant,
    pub visible: VisibleSet,
    pub graph: Arc<IdentityGraph>,
    pub today: NaiveDate,
}

impl ToolContext {
    fn require_visible(&self, employee: Option<EmployeeId>) -> Result<(), ToolError> {
        match employee {
            Some(id) if !self.visible.contains(id) => Err(ToolError::OutOfScope(id)),
            _ => Ok(()),
        }
    }

    fn employee_name(&self, id: EmployeeId) -> Option<String> {
        self.graph.employee(id).map(|employee| employee.name.clone())
    }

    /// Drops rows the store should never have returned, logging how many.
    fn retain_visible<T>(
        &self,
        tool: ToolKind,
        rows: Vec<T>,
        owner: impl Fn(&T) -> Option<EmployeeId>,
    ) -> Vec<T> {
        let before = rows.len();
        let visible = &self.visible;
        let kept: Vec<T> = rows
            .into_iter()
            .filter(|row| match owner(row) {
                Some(id) => visible.contains(id),
                None => visible.is_all(),
            })
            .collect();
        if kept.len() < before {
            warn!(
                event_name = "agent.tool.out_of_scope_rows",
                tool = tool.name(),
                employee_id = %self.caller.id,
                dropped = before - kept.len(),
                "dropped rows outside the caller's visible set"
            );
        }
        kept
    }
}

#[derive(Clone, Debug)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    /// Raw JSON text from the backend.
    pub arguments: String,
}

impl From<&ToolCallRequest> for ToolCall {
    fn from(request: &ToolCallRequest) -> Self {
        Self {
            id: request.id.clone(),
            name: request.function.name.clone(),
            arguments: request.function.arguments.clone(),
        }
    }
}

#[derive(Debug)]
pub struct ToolResult {
    pub call_id: String,
    pub name: String,
    pub arguments: Value,
    pub outcome: Result<Value, ToolError>,
}

impl ToolResult {
    pub fn failed(call: &ToolCall, error: ToolError) -> Self {
        Self {
            call_id: call.id.clone(),
            name: call.name.clone(),
            arguments: parse_arguments(&call.arguments).unwrap_or(Value::Null),
            outcome: Err(error),
        }
    }

    pub fn is_error(&self) -> bool {
        self.outcome.is_err()
    }

    /// The envelope handed back to the backend: the typed result or `{ "error": ... }`.
    pub fn payload(&self) -> Value {
        match &self.outcome {
            Ok(value) => value.clone(),
            Err(error) => json!({ "error": error.to_string() }),
        }
    }
}

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("unknown tool `{0}`")]
    UnknownTool(String),
    #[error("tool `{0}` is not available for your access grant")]
    NotPermitted(String),
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),
    #[error("out_of_scope: employee {0} is outside your visible team")]
    OutOfScope(EmployeeId),
    #[error("data unavailable: {0}")]
    Store(#[from] StoreError),
    #[error("tool call skipped: more than {0} calls requested in one round")]
    CallBudgetExceeded(u32),
}

#[async_trait]
trait ToolHandler: Send + Sync {
    async fn run(
        &self,
        arguments: &Value,
        ctx: &ToolContext,
        sales: &dyn SalesStore,
    ) -> Result<Value, ToolError>;
}

fn parse_arguments(raw: &str) -> Result<Value, ToolError> {
    if raw.trim().is_empty() {
        return Ok(Value::Object(Map::new()));
    }
    serde_json::from_str(raw).map_err(|error| {
        ToolError::InvalidArguments(format!("arguments are not valid JSON: {error}"))
    })
}

pub struct ToolExecutor {
    sales: Arc<dyn SalesStore>,
}

impl ToolExecutor {
    pub fn new(sales: Arc<dyn SalesStore>) -> Self {
        Self { sales }
    }

    /// Never fails: every problem is folded into the result as a typed error.
    pub async fn execute(&self, call: &ToolCall, ctx: &ToolContext) -> ToolResult {
        let started = Instant::now();
        let arguments = match parse_arguments(&call.arguments) {
            Ok(arguments) => arguments,
            Err(error) => return self.finish(ToolResult::failed(call, error), ctx, started),
        };

        let outcome = match ToolKind::from_name(&call.name) {
            None => Err(ToolError::UnknownTool(call.name.clone())),
            Some(kind) if !kind.permitted(&ctx.grant) => {
                Err(ToolError::NotPermitted(call.name.clone()))
            }
            Some(kind) => kind.handler().run(&arguments, ctx, self.sales.as_ref()).await,
        };

        let result =
            ToolResult { call_id: call.id.clone(), name: call.name.clone(), arguments, outcome };
        self.finish(result, ctx, started)
    }

    fn finish(&self, result: ToolResult, ctx: &ToolContext, started: Instant) -> ToolResult {
        let duration_ms = started.elapsed().as_millis() as u64;
        match &result.outcome {
            Ok(_) => info!(
                event_name = "agent.tool.executed",
                tool = %result.name,
                call_id = %result.call_id,
                employee_id = %ctx.caller.id,
                duration_ms,
                outcome = "ok",
                "tool executed"
            ),
            Err(error) => info!(
                event_name = "agent.tool.executed",
                tool = %result.name,
                call_id = %result.call_id,
                employee_id = %ctx.caller.id,
                duration_ms,
                outcome = "error",
                error = %error,
                "tool executed with error"
            ),
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use pulse_core::domain::access::RowScope;
    use pulse_core::domain::employee::EmployeeId;
    use pulse_db::repositories::InMemorySalesRepository;

    use super::{list_tools, ToolCall, ToolError, ToolExecutor, ToolKind};
    use crate::test_support::{grant, ic_context};

    fn call(name: &str, arguments: &str) -> ToolCall {
        ToolCall {
            id: "call_1".to_string(),
            name: name.to_string(),
            arguments: arguments.to_string(),
        }
    }

    #[test]
    fn names_resolve_to_kinds() {
        for kind in ToolKind::ALL {
            assert_eq!(ToolKind::from_name(kind.name()), Some(kind));
            assert_eq!(kind.spec().parameters["type"], "object");
        }
        assert_eq!(ToolKind::from_name("drop_tables"), None);
    }

    #[test]
    fn own_only_callers_are_not_offered_team_tools() {
        let names: Vec<_> =
            list_tools(&grant(5, RowScope::OwnOnly)).into_iter().map(|spec| spec.name).collect();
        assert_eq!(
            names,
            vec!["lookup_employees", "get_sales_summary", "get_sales_trend", "get_target_progress"]
        );
    }

    #[test]
    fn company_overview_needs_the_all_scope() {
        let subtree = list_tools(&grant(4, RowScope::OwnAndSubtree));
        assert!(subtree.iter().any(|spec| spec.name == "get_team_ranking"));
        assert!(!subtree.iter().any(|spec| spec.name == "get_company_overview"));
        assert!(list_tools(&grant(1, RowScope::All))
            .iter()
            .any(|spec| spec.name == "get_company_overview"));
    }

    #[tokio::test]
    async fn unknown_tools_become_typed_errors() {
        let executor = ToolExecutor::new(Arc::new(InMemorySalesRepository::default()));
        let result = executor.execute(&call("drop_tables", "{}"), &ic_context()).await;

        assert!(matches!(result.outcome, Err(ToolError::UnknownTool(_))));
        assert_eq!(result.payload()["error"], "unknown tool `drop_tables`");
    }

    #[tokio::test]
    async fn hidden_tools_are_refused_at_execution() {
        let executor = ToolExecutor::new(Arc::new(InMemorySalesRepository::default()));
        let result = executor.execute(&call("get_company_overview", "{}"), &ic_context()).await;
        assert!(matches!(result.outcome, Err(ToolError::NotPermitted(_))));
    }

    #[tokio::test]
    async fn malformed_json_arguments_are_rejected() {
        let executor = ToolExecutor::new(Arc::new(InMemorySalesRepository::default()));
        let result = executor
            .execute(&call("get_sales_summary", "{\"employee_id\":"), &ic_context())
            .await;

        assert!(matches!(result.outcome, Err(ToolError::InvalidArguments(_))));
        assert!(result.arguments.is_null());
    }

    #[tokio::test]
    async fn explicit_employee_outside_scope_is_out_of_scope() {
        let executor = ToolExecutor::new(Arc::new(InMemorySalesRepository::default()));
        let result = executor
            .execute(&call("get_sales_summary", r#"{"employee_id": 6}"#), &ic_context())
            .await;

        assert!(matches!(result.outcome, Err(ToolError::OutOfScope(EmployeeId(6)))));
        let message = result.payload()["error"].as_str().unwrap_or_default().to_string();
        assert!(message.starts_with("out_of_scope"));
    }

    #[tokio::test]
    async fn empty_argument_text_is_an_empty_object() {
        let sales = Arc::new(InMemorySalesRepository::default());
        let executor = ToolExecutor::new(sales);
        let result = executor.execute(&call("get_sales_summary", ""), &ic_context()).await;
        assert!(result.outcome.is_ok(), "{:?}", result.outcome);
    }
}
