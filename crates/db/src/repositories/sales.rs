use std::str::FromStr;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde_json::{Map, Value};
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite};

use pulse_core::domain::access::VisibleSet;
use pulse_core::domain::employee::EmployeeId;
use pulse_core::domain::sales::{
    DateRange, SalesQuery, SalesRecord, SalesTarget, TableQuery, TableRows,
};
use pulse_core::errors::StoreError;
use pulse_core::ports::SalesStore;

use super::{decode_err, format_date, parse_date, RepositoryError};
use crate::DbPool;

pub const MAX_TABLE_ROWS: u32 = 200;

/// Tables reachable through `read_table`, each with the column that names its owning employee.
pub const QUERYABLE_TABLES: &[(&str, &str)] =
    &[("sales", "employee_id"), ("sales_targets", "employee_id"), ("employees", "id")];

pub fn owner_column_for(table: &str) -> Option<&'static str> {
    QUERYABLE_TABLES.iter().find(|(name, _)| *name == table).map(|(_, owner)| *owner)
}

pub struct SqlSalesRepository {
    pool: DbPool,
}

struct ColumnInfo {
    name: String,
    declared_type: String,
}

impl SqlSalesRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn fetch_records(&self, query: &SalesQuery) -> Result<Vec<SalesRecord>, RepositoryError> {
        let mut builder = QueryBuilder::<Sqlite>::new(
            "SELECT employee_id, division, sold_on, product_line, amount, units
             FROM sales WHERE sold_on >= ",
        );
        builder.push_bind(format_date(query.range.start));
        builder.push(" AND sold_on <= ");
        builder.push_bind(format_date(query.range.end));
        if let Some(employee) = query.employee {
            builder.push(" AND employee_id = ");
            builder.push_bind(employee.0);
        }
        if !push_visibility(&mut builder, "employee_id", &query.visible) {
            return Ok(Vec::new());
        }
        builder.push(" ORDER BY sold_on ASC, id ASC");

        let rows = builder.build().fetch_all(&self.pool).await?;
        rows.iter().map(row_to_record).collect()
    }

    async fn fetch_targets(
        &self,
        visible: &VisibleSet,
        range: &DateRange,
    ) -> Result<Vec<SalesTarget>, RepositoryError> {
        let mut builder = QueryBuilder::<Sqlite>::new(
            "SELECT employee_id, period_start, period_end, amount
             FROM sales_targets WHERE period_start <= ",
        );
        builder.push_bind(format_date(range.end));
        builder.push(" AND period_end >= ");
        builder.push_bind(format_date(range.start));
        if !push_visibility(&mut builder, "employee_id", visible) {
            return Ok(Vec::new());
        }
        builder.push(" ORDER BY employee_id ASC, period_start ASC");

        let rows = builder.build().fetch_all(&self.pool).await?;
        rows.iter().map(row_to_target).collect()
    }

    async fn table_columns(&self, table: &str) -> Result<Vec<ColumnInfo>, RepositoryError> {
        // table names are checked against QUERYABLE_TABLES before reaching here
        let rows = sqlx::query(&format!("PRAGMA table_info(\"{table}\")"))
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| {
                Ok(ColumnInfo {
                    name: row.try_get("name").map_err(decode_err)?,
                    declared_type: row.try_get("type").map_err(decode_err)?,
                })
            })
            .collect()
    }

    async fn fetch_table(&self, query: &TableQuery) -> Result<TableRows, RepositoryError> {
        let owner = owner_column_for(&query.table).ok_or_else(|| {
            RepositoryError::Rejected(format!("table `{}` is not queryable", query.table))
        })?;
        let known = self.table_columns(&query.table).await?;
        let lookup = |name: &str| known.iter().find(|column| column.name == name);

        let mut selected: Vec<&ColumnInfo> = if query.columns.is_empty() {
            known.iter().collect()
        } else {
            let mut picked = Vec::with_capacity(query.columns.len() + 1);
            for name in &query.columns {
                let column = lookup(name).ok_or_else(|| {
                    RepositoryError::Rejected(format!(
                        "unknown column `{name}` on `{}`",
                        query.table
                    ))
                })?;
                if !picked.iter().any(|c: &&ColumnInfo| c.name == column.name) {
                    picked.push(column);
                }
            }
            picked
        };
        if !selected.iter().any(|column| column.name == owner) {
            let owner_info = lookup(owner).ok_or_else(|| {
                RepositoryError::Decode(format!("`{}` has no column `{owner}`", query.table))
            })?;
            selected.push(owner_info);
        }

        let column_list =
            selected.iter().map(|c| format!("\"{}\"", c.name)).collect::<Vec<_>>().join(", ");
        let mut builder = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {column_list} FROM \"{}\" WHERE 1 = 1",
            query.table
        ));
        for filter in &query.filters {
            if lookup(&filter.column).is_none() {
                return Err(RepositoryError::Rejected(format!(
                    "unknown filter column `{}` on `{}`",
                    filter.column, query.table
                )));
            }
            builder.push(format!(" AND \"{}\" = ", filter.column));
            match &filter.value {
                Value::String(text) => {
                    builder.push_bind(text.clone());
                }
                Value::Bool(flag) => {
                    builder.push_bind(i64::from(*flag));
                }
                Value::Number(number) => {
                    if let Some(int) = number.as_i64() {
                        builder.push_bind(int);
                    } else if let Some(float) = number.as_f64() {
                        builder.push_bind(float);
                    } else {
                        return Err(RepositoryError::Rejected(format!(
                            "unsupported numeric filter on `{}`",
                            filter.column
                        )));
                    }
                }
                _ => {
                    return Err(RepositoryError::Rejected(format!(
                        "filter on `{}` must be a string, number, or boolean",
                        filter.column
                    )))
                }
            }
        }
        if !push_visibility(&mut builder, owner, &query.visible) {
            return Ok(TableRows { owner_column: Some(owner.to_string()), rows: Vec::new() });
        }
        builder.push(format!(" ORDER BY \"{owner}\" ASC LIMIT "));
        builder.push_bind(i64::from(query.limit.clamp(1, MAX_TABLE_ROWS)));

        let rows = builder.build().fetch_all(&self.pool).await?;
        let decoded = rows
            .iter()
            .map(|row| decode_dynamic_row(row, &selected))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(TableRows { owner_column: Some(owner.to_string()), rows: decoded })
    }
}

/// Appends the identity filter. Returns `false` when the visible set is empty.
fn push_visibility(
    builder: &mut QueryBuilder<'_, Sqlite>,
    column: &str,
    visible: &VisibleSet,
) -> bool {
    let Some(ids) = visible.ids() else {
        return true;
    };
    if ids.is_empty() {
        return false;
    }
    builder.push(format!(" AND \"{column}\" IN ("));
    let mut separated = builder.separated(", ");
    for id in ids {
        separated.push_bind(id.0);
    }
    separated.push_unseparated(")");
    true
}

fn decode_dynamic_row(
    row: &SqliteRow,
    columns: &[&ColumnInfo],
) -> Result<Map<String, Value>, RepositoryError> {
    let mut map = Map::with_capacity(columns.len());
    for column in columns {
        let declared = column.declared_type.to_ascii_uppercase();
        let value = if declared.contains("INT") {
            row.try_get::<Option<i64>, _>(column.name.as_str())
                .map_err(decode_err)?
                .map(Value::from)
                .unwrap_or(Value::Null)
        } else if declared.contains("REAL") {
            row.try_get::<Option<f64>, _>(column.name.as_str())
                .map_err(decode_err)?
                .map(Value::from)
                .unwrap_or(Value::Null)
        } else {
            row.try_get::<Option<String>, _>(column.name.as_str())
                .map_err(decode_err)?
                .map(Value::from)
                .unwrap_or(Value::Null)
        };
        map.insert(column.name.clone(), value);
    }
    Ok(map)
}

fn parse_amount(value: &str) -> Result<Decimal, RepositoryError> {
    Decimal::from_str(value)
        .map_err(|e| RepositoryError::Decode(format!("invalid amount `{value}`: {e}")))
}

fn row_to_record(row: &SqliteRow) -> Result<SalesRecord, RepositoryError> {
    let employee_id: i64 = row.try_get("employee_id").map_err(decode_err)?;
    let sold_on: String = row.try_get("sold_on").map_err(decode_err)?;
    let amount: String = row.try_get("amount").map_err(decode_err)?;

    Ok(SalesRecord {
        employee_id: EmployeeId(employee_id),
        division: row.try_get("division").map_err(decode_err)?,
        sold_on: parse_date(&sold_on)?,
        product_line: row.try_get("product_line").map_err(decode_err)?,
        amount: parse_amount(&amount)?,
        units: row.try_get("units").map_err(decode_err)?,
    })
}

fn row_to_target(row: &SqliteRow) -> Result<SalesTarget, RepositoryError> {
    let employee_id: i64 = row.try_get("employee_id").map_err(decode_err)?;
    let period_start: String = row.try_get("period_start").map_err(decode_err)?;
    let period_end: String = row.try_get("period_end").map_err(decode_err)?;
    let amount: String = row.try_get("amount").map_err(decode_err)?;

    Ok(SalesTarget {
        employee_id: EmployeeId(employee_id),
        period_start: parse_date(&period_start)?,
        period_end: parse_date(&period_end)?,
        amount: parse_amount(&amount)?,
    })
}

#[async_trait]
impl SalesStore for SqlSalesRepository {
    async fn sales_records(&self, query: &SalesQuery) -> Result<Vec<SalesRecord>, StoreError> {
        Ok(self.fetch_records(query).await?)
    }

    async fn sales_targets(
        &self,
        visible: &VisibleSet,
        range: &DateRange,
    ) -> Result<Vec<SalesTarget>, StoreError> {
        Ok(self.fetch_targets(visible, range).await?)
    }

    async fn read_table(&self, query: &TableQuery) -> Result<TableRows, StoreError> {
        Ok(self.fetch_table(query).await?)
    }
}
