use async_trait::async_trait;
use serde_json::{json, Map, Value};

use pulse_core::domain::employee::EmployeeId;
use pulse_core::domain::sales::{ColumnFilter, TableQuery};
use pulse_core::ports::SalesStore;

use super::args::{parse, QueryTableArgs};
use super::{ToolContext, ToolError, ToolHandler, ToolKind};

pub(super) const MAX_ROWS: u32 = 200;

pub(super) struct QueryTable;

fn owner_of(row: &Map<String, Value>, owner_column: Option<&str>) -> Option<EmployeeId> {
    owner_column.and_then(|column| row.get(column)).and_then(Value::as_i64).map(EmployeeId)
}

#[async_trait]
impl ToolHandler for QueryTable {
    async fn run(
        &self,
        arguments: &Value,
        ctx: &ToolContext,
        sales: &dyn SalesStore,
    ) -> Result<Value, ToolError> {
        let args: QueryTableArgs = parse(arguments)?;
        let table = args.table.trim().to_ascii_lowercase();
        if !ctx.grant.table_permitted(&table) {
            return Err(ToolError::NotPermitted(format!("query_table on `{table}`")));
        }
        let limit = args.limit(MAX_ROWS)?;

        let query = TableQuery {
            table: table.clone(),
            columns: args.columns.clone(),
            filters: args
                .filters
                .into_iter()
                .map(|(column, value)| ColumnFilter { column, value })
                .collect(),
            limit,
            visible: ctx.visible.clone(),
        };
        let result = sales.read_table(&query).await?;
        let owner_column = result.owner_column.as_deref();
        let rows = ctx.retain_visible(ToolKind::QueryTable, result.rows, |row| {
            owner_of(row, owner_column)
        });

        Ok(json!({
            "table": table,
            "row_count": rows.len(),
            "truncated": rows.len() as u32 >= limit,
            "rows": rows,
        }))
    }
}
