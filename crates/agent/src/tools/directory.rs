use async_trait::async_trait;
use serde_json::{json, Value};

use pulse_core::domain::employee::Employee;
use pulse_core::ports::SalesStore;

use super::args::{parse, LookupEmployeesArgs, OrgStructureArgs};
use super::{ToolContext, ToolError, ToolHandler, ToolKind};

pub(super) struct LookupEmployees;
pub(super) struct OrgStructure;

fn employee_json(employee: &Employee) -> Value {
    json!({
        "employee_id": employee.id,
        "name": employee.name,
        "title": employee.title,
        "division": employee.division,
        "unit": employee.unit,
        "manager_id": employee.manager_id,
        "active": employee.active,
    })
}

#[async_trait]
impl ToolHandler for LookupEmployees {
    async fn run(
        &self,
        arguments: &Value,
        ctx: &ToolContext,
        _sales: &dyn SalesStore,
    ) -> Result<Value, ToolError> {
        let args: LookupEmployeesArgs = parse(arguments)?;
        let limit = args.limit()?;
        let needle = args.query.as_deref().map(str::trim).unwrap_or_default().to_lowercase();

        let candidates: Vec<&Employee> = ctx
            .graph
            .employees()
            .filter(|employee| args.include_inactive || employee.active)
            .filter(|employee| {
                args.division
                    .as_deref()
                    .map_or(true, |division| employee.division.eq_ignore_ascii_case(division))
            })
            .filter(|employee| {
                needle.is_empty()
                    || employee.name.to_lowercase().contains(&needle)
                    || employee.title.to_lowercase().contains(&needle)
            })
            .collect();
        let mut matches =
            ctx.retain_visible(ToolKind::LookupEmployees, candidates, |employee| Some(employee.id));
        matches.sort_by_key(|employee| employee.id);

        let total = matches.len();
        let employees: Vec<Value> =
            matches.into_iter().take(limit).map(employee_json).collect();

        Ok(json!({
            "count": total,
            "truncated": total > employees.len(),
            "employees": employees,
        }))
    }
}

#[async_trait]
impl ToolHandler for OrgStructure {
    async fn run(
        &self,
        arguments: &Value,
        ctx: &ToolContext,
        _sales: &dyn SalesStore,
    ) -> Result<Value, ToolError> {
        let args: OrgStructureArgs = parse(arguments)?;
        let depth = args.depth()?;
        let root = args.root_employee_id.unwrap_or(ctx.caller.id);
        ctx.require_visible(Some(root))?;

        let reached = ctx.graph.walk(root, Some(depth));
        let reached = ctx.retain_visible(ToolKind::OrgStructure, reached, |node| {
            Some(node.employee.id)
        });

        let nodes: Vec<Value> = reached
            .iter()
            .map(|node| {
                let mut entry = employee_json(node.employee);
                entry["depth"] = json!(node.depth);
                entry["direct_reports"] = json!(ctx.graph.direct_reports(node.employee.id).len());
                entry
            })
            .collect();

        Ok(json!({
            "root_employee_id": root,
            "depth": depth,
            "nodes": nodes,
        }))
    }
}
