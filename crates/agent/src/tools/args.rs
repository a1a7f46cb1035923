//! Validated argument structs. Unknown fields are rejected before a handler runs.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;

use pulse_core::domain::employee::EmployeeId;
use pulse_core::domain::sales::{DateRange, PeriodPreset};

use super::ToolError;

pub(crate) fn parse<T: DeserializeOwned>(arguments: &Value) -> Result<T, ToolError> {
    if !arguments.is_object() {
        return Err(ToolError::InvalidArguments("arguments must be a JSON object".to_string()));
    }
    serde_json::from_value(arguments.clone())
        .map_err(|error| ToolError::InvalidArguments(error.to_string()))
}

/// A preset or an explicit `start_date`/`end_date` window. Defaults to month-to-date.
pub(crate) fn resolve_period(
    preset: Option<PeriodPreset>,
    start: Option<NaiveDate>,
    end: Option<NaiveDate>,
    today: NaiveDate,
) -> Result<DateRange, ToolError> {
    match (preset, start, end) {
        (Some(_), Some(_), _) | (Some(_), _, Some(_)) => Err(ToolError::InvalidArguments(
            "use either `period` or `start_date`/`end_date`, not both".to_string(),
        )),
        (Some(preset), None, None) => Ok(preset.resolve(today)),
        (None, Some(start), end) => {
            DateRange::new(start, end.unwrap_or(today)).map_err(ToolError::InvalidArguments)
        }
        (None, None, Some(_)) => {
            Err(ToolError::InvalidArguments("`end_date` requires `start_date`".to_string()))
        }
        (None, None, None) => Ok(PeriodPreset::ThisMonth.resolve(today)),
    }
}

fn bounded(
    value: Option<u32>,
    default: u32,
    min: u32,
    max: u32,
    field: &str,
) -> Result<u32, ToolError> {
    let value = value.unwrap_or(default);
    if (min..=max).contains(&value) {
        Ok(value)
    } else {
        Err(ToolError::InvalidArguments(format!("`{field}` must be between {min} and {max}")))
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct LookupEmployeesArgs {
    pub query: Option<String>,
    pub division: Option<String>,
    #[serde(default)]
    pub include_inactive: bool,
    pub limit: Option<u32>,
}

impl LookupEmployeesArgs {
    pub fn limit(&self) -> Result<usize, ToolError> {
        bounded(self.limit, 25, 1, 100, "limit").map(|limit| limit as usize)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum GroupBy {
    #[default]
    Employee,
    ProductLine,
    Division,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct SalesSummaryArgs {
    pub employee_id: Option<EmployeeId>,
    pub period: Option<PeriodPreset>,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    #[serde(default)]
    pub group_by: GroupBy,
}

impl SalesSummaryArgs {
    pub fn range(&self, today: NaiveDate) -> Result<DateRange, ToolError> {
        resolve_period(self.period, self.start_date, self.end_date, today)
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct SalesTrendArgs {
    pub employee_id: Option<EmployeeId>,
    pub months: Option<u32>,
}

impl SalesTrendArgs {
    pub fn months(&self) -> Result<u32, ToolError> {
        bounded(self.months, 6, 1, 24, "months")
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct TargetProgressArgs {
    pub employee_id: Option<EmployeeId>,
    pub period: Option<PeriodPreset>,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
}

impl TargetProgressArgs {
    pub fn range(&self, today: NaiveDate) -> Result<DateRange, ToolError> {
        resolve_period(self.period, self.start_date, self.end_date, today)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum RankMetric {
    #[default]
    Amount,
    Units,
    Deals,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct TeamRankingArgs {
    pub period: Option<PeriodPreset>,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    #[serde(default)]
    pub metric: RankMetric,
    pub limit: Option<u32>,
}

impl TeamRankingArgs {
    pub fn range(&self, today: NaiveDate) -> Result<DateRange, ToolError> {
        resolve_period(self.period, self.start_date, self.end_date, today)
    }

    pub fn limit(&self) -> Result<usize, ToolError> {
        bounded(self.limit, 10, 1, 50, "limit").map(|limit| limit as usize)
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct CompanyOverviewArgs {
    pub period: Option<PeriodPreset>,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
}

impl CompanyOverviewArgs {
    pub fn range(&self, today: NaiveDate) -> Result<DateRange, ToolError> {
        resolve_period(self.period, self.start_date, self.end_date, today)
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct OrgStructureArgs {
    pub root_employee_id: Option<EmployeeId>,
    pub depth: Option<u32>,
}

impl OrgStructureArgs {
    pub fn depth(&self) -> Result<u32, ToolError> {
        bounded(self.depth, 2, 1, 6, "depth")
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct ForecastArgs {
    pub employee_id: Option<EmployeeId>,
    pub history_months: Option<u32>,
    pub horizon_months: Option<u32>,
}

impl ForecastArgs {
    pub fn history_months(&self) -> Result<u32, ToolError> {
        bounded(self.history_months, 6, 3, 24, "history_months")
    }

    pub fn horizon_months(&self) -> Result<u32, ToolError> {
        bounded(self.horizon_months, 3, 1, 12, "horizon_months")
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct QueryTableArgs {
    pub table: String,
    #[serde(default)]
    pub columns: Vec<String>,
    #[serde(default)]
    pub filters: BTreeMap<String, Value>,
    pub limit: Option<u32>,
}

impl QueryTableArgs {
    pub fn limit(&self, max_rows: u32) -> Result<u32, ToolError> {
        bounded(self.limit, 50, 1, max_rows, "limit")
    }
}
