use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use chrono::{Datelike, NaiveDate};
use rust_decimal::Decimal;
use serde_json::{json, Value};

use pulse_core::domain::employee::EmployeeId;
use pulse_core::domain::sales::{
    first_of_month, last_of_month, month_label, shift_month, DateRange, SalesQuery, SalesRecord,
};
use pulse_core::ports::SalesStore;

use super::args::{
    parse, CompanyOverviewArgs, ForecastArgs, GroupBy, RankMetric, SalesSummaryArgs,
    SalesTrendArgs, TargetProgressArgs, TeamRankingArgs,
};
use super::{ToolContext, ToolError, ToolHandler, ToolKind};

pub(super) struct SalesSummary;
pub(super) struct SalesTrend;
pub(super) struct TargetProgress;
pub(super) struct TeamRanking;
pub(super) struct CompanyOverview;
pub(super) struct Forecast;

#[derive(Clone, Debug, Default, PartialEq)]
struct Totals {
    amount: Decimal,
    units: i64,
    deals: u64,
}

impl Totals {
    fn add(&mut self, record: &SalesRecord) {
        self.amount += record.amount;
        self.units += record.units;
        self.deals += 1;
    }

    fn to_json(&self) -> Value {
        json!({
            "amount": self.amount.round_dp(2),
            "units": self.units,
            "deals": self.deals,
        })
    }
}

fn period_json(range: &DateRange) -> Value {
    json!({ "start_date": range.start, "end_date": range.end })
}

async fn fetch_records(
    kind: ToolKind,
    ctx: &ToolContext,
    sales: &dyn SalesStore,
    employee: Option<EmployeeId>,
    range: DateRange,
) -> Result<Vec<SalesRecord>, ToolError> {
    let query = SalesQuery { visible: ctx.visible.clone(), employee, range };
    let records = sales.sales_records(&query).await?;
    let records = ctx.retain_visible(kind, records, |record| Some(record.employee_id));
    Ok(records
        .into_iter()
        .filter(|record| employee.map_or(true, |id| record.employee_id == id))
        .filter(|record| range.contains(record.sold_on))
        .collect())
}

/// `(year, month)` pairs from `start` through `end`, oldest first.
fn months_between(start: NaiveDate, end: NaiveDate) -> Vec<(i32, u32)> {
    let mut months = Vec::new();
    let (mut year, mut month) = (start.year(), start.month());
    while (year, month) <= (end.year(), end.month()) {
        months.push((year, month));
        (year, month) = shift_month(year, month, 1);
    }
    months
}

fn monthly_buckets(
    months: &[(i32, u32)],
    records: &[SalesRecord],
) -> BTreeMap<String, Totals> {
    let mut buckets: BTreeMap<String, Totals> = months
        .iter()
        .filter_map(|&(year, month)| first_of_month(year, month))
        .map(|first| (month_label(first), Totals::default()))
        .collect();
    for record in records {
        if let Some(bucket) = buckets.get_mut(&month_label(record.sold_on)) {
            bucket.add(record);
        }
    }
    buckets
}

#[async_trait]
impl ToolHandler for SalesSummary {
    async fn run(
        &self,
        arguments: &Value,
        ctx: &ToolContext,
        sales: &dyn SalesStore,
    ) -> Result<Value, ToolError> {
        let args: SalesSummaryArgs = parse(arguments)?;
        ctx.require_visible(args.employee_id)?;
        let range = args.range(ctx.today)?;
        let records =
            fetch_records(ToolKind::SalesSummary, ctx, sales, args.employee_id, range).await?;

        let mut total = Totals::default();
        let mut groups: BTreeMap<String, Totals> = BTreeMap::new();
        for record in &records {
            total.add(record);
            let key = match args.group_by {
                GroupBy::Employee => record.employee_id.to_string(),
                GroupBy::ProductLine => record.product_line.clone(),
                GroupBy::Division => record.division.clone(),
            };
            groups.entry(key).or_default().add(record);
        }

        let mut groups: Vec<(String, Totals)> = groups.into_iter().collect();
        groups.sort_by(|a, b| b.1.amount.cmp(&a.1.amount).then_with(|| a.0.cmp(&b.0)));
        let groups: Vec<Value> = groups
            .into_iter()
            .map(|(key, totals)| {
                let mut entry = totals.to_json();
                entry["key"] = json!(key);
                if args.group_by == GroupBy::Employee {
                    if let Ok(id) = key.parse::<i64>() {
                        entry["name"] = json!(ctx.employee_name(EmployeeId(id)));
                    }
                }
                entry
            })
            .collect();

        Ok(json!({
            "period": period_json(&range),
            "employee_id": args.employee_id,
            "total": total.to_json(),
            "group_by": match args.group_by {
                GroupBy::Employee => "employee",
                GroupBy::ProductLine => "product_line",
                GroupBy::Division => "division",
            },
            "groups": groups,
        }))
    }
}

#[async_trait]
impl ToolHandler for SalesTrend {
    async fn run(
        &self,
        arguments: &Value,
        ctx: &ToolContext,
        sales: &dyn SalesStore,
    ) -> Result<Value, ToolError> {
        let args: SalesTrendArgs = parse(arguments)?;
        ctx.require_visible(args.employee_id)?;
        let range = DateRange::trailing_months(ctx.today, args.months()?);
        let records =
            fetch_records(ToolKind::SalesTrend, ctx, sales, args.employee_id, range).await?;

        let months = months_between(range.start, range.end);
        let series: Vec<Value> = monthly_buckets(&months, &records)
            .into_iter()
            .map(|(month, totals)| {
                let mut entry = totals.to_json();
                entry["month"] = json!(month);
                entry
            })
            .collect();

        Ok(json!({
            "period": period_json(&range),
            "employee_id": args.employee_id,
            "current_month_is_partial": true,
            "months": series,
        }))
    }
}

#[async_trait]
impl ToolHandler for TargetProgress {
    async fn run(
        &self,
        arguments: &Value,
        ctx: &ToolContext,
        sales: &dyn SalesStore,
    ) -> Result<Value, ToolError> {
        let args: TargetProgressArgs = parse(arguments)?;
        ctx.require_visible(args.employee_id)?;
        let range = args.range(ctx.today)?;

        let targets = sales.sales_targets(&ctx.visible, &range).await?;
        let targets = ctx.retain_visible(ToolKind::TargetProgress, targets, |target| {
            Some(target.employee_id)
        });
        let records =
            fetch_records(ToolKind::TargetProgress, ctx, sales, args.employee_id, range).await?;

        let mut progress: BTreeMap<EmployeeId, (Decimal, Decimal)> = BTreeMap::new();
        for target in targets
            .iter()
            .filter(|target| args.employee_id.map_or(true, |id| target.employee_id == id))
            .filter(|target| range.overlaps(target.period_start, target.period_end))
        {
            progress.entry(target.employee_id).or_default().0 += target.amount;
        }
        for record in &records {
            progress.entry(record.employee_id).or_default().1 += record.amount;
        }

        let mut target_total = Decimal::ZERO;
        let mut actual_total = Decimal::ZERO;
        let rows: Vec<Value> = progress
            .into_iter()
            .map(|(employee_id, (target, actual))| {
                target_total += target;
                actual_total += actual;
                json!({
                    "employee_id": employee_id,
                    "name": ctx.employee_name(employee_id),
                    "target": target.round_dp(2),
                    "actual": actual.round_dp(2),
                    "attainment_pct": attainment(actual, target),
                })
            })
            .collect();

        Ok(json!({
            "period": period_json(&range),
            "employee_id": args.employee_id,
            "employees": rows,
            "total": {
                "target": target_total.round_dp(2),
                "actual": actual_total.round_dp(2),
                "attainment_pct": attainment(actual_total, target_total),
            },
        }))
    }
}

/// `None` when there is no target to measure against.
fn attainment(actual: Decimal, target: Decimal) -> Option<Decimal> {
    (target > Decimal::ZERO).then(|| (actual / target * Decimal::ONE_HUNDRED).round_dp(1))
}

#[async_trait]
impl ToolHandler for TeamRanking {
    async fn run(
        &self,
        arguments: &Value,
        ctx: &ToolContext,
        sales: &dyn SalesStore,
    ) -> Result<Value, ToolError> {
        let args: TeamRankingArgs = parse(arguments)?;
        let range = args.range(ctx.today)?;
        let limit = args.limit()?;
        let records = fetch_records(ToolKind::TeamRanking, ctx, sales, None, range).await?;

        let mut per_employee: BTreeMap<EmployeeId, Totals> = BTreeMap::new();
        for record in &records {
            per_employee.entry(record.employee_id).or_default().add(record);
        }

        let mut ranked: Vec<(EmployeeId, Totals)> = per_employee.into_iter().collect();
        ranked.sort_by(|(a_id, a), (b_id, b)| {
            let ordering = match args.metric {
                RankMetric::Amount => b.amount.cmp(&a.amount),
                RankMetric::Units => b.units.cmp(&a.units),
                RankMetric::Deals => b.deals.cmp(&a.deals),
            };
            ordering.then_with(|| a_id.cmp(b_id))
        });
        let ranked_count = ranked.len();

        let ranking: Vec<Value> = ranked
            .into_iter()
            .take(limit)
            .enumerate()
            .map(|(position, (employee_id, totals))| {
                let mut entry = totals.to_json();
                entry["rank"] = json!(position + 1);
                entry["employee_id"] = json!(employee_id);
                entry["name"] = json!(ctx.employee_name(employee_id));
                entry
            })
            .collect();

        Ok(json!({
            "period": period_json(&range),
            "metric": match args.metric {
                RankMetric::Amount => "amount",
                RankMetric::Units => "units",
                RankMetric::Deals => "deals",
            },
            "ranked_employees": ranked_count,
            "ranking": ranking,
        }))
    }
}

#[async_trait]
impl ToolHandler for CompanyOverview {
    async fn run(
        &self,
        arguments: &Value,
        ctx: &ToolContext,
        sales: &dyn SalesStore,
    ) -> Result<Value, ToolError> {
        let args: CompanyOverviewArgs = parse(arguments)?;
        if !ctx.visible.is_all() {
            return Err(ToolError::NotPermitted(ToolKind::CompanyOverview.name().to_string()));
        }
        let range = args.range(ctx.today)?;
        let records = fetch_records(ToolKind::CompanyOverview, ctx, sales, None, range).await?;

        let mut total = Totals::default();
        let mut divisions: BTreeMap<String, (Totals, BTreeSet<EmployeeId>)> = BTreeMap::new();
        for record in &records {
            total.add(record);
            let (totals, sellers) = divisions.entry(record.division.clone()).or_default();
            totals.add(record);
            sellers.insert(record.employee_id);
        }

        let divisions: Vec<Value> = divisions
            .into_iter()
            .map(|(division, (totals, sellers))| {
                let mut entry = totals.to_json();
                entry["division"] = json!(division);
                entry["sellers"] = json!(sellers.len());
                entry
            })
            .collect();

        Ok(json!({
            "period": period_json(&range),
            "total": total.to_json(),
            "divisions": divisions,
        }))
    }
}

#[async_trait]
impl ToolHandler for Forecast {
    async fn run(
        &self,
        arguments: &Value,
        ctx: &ToolContext,
        sales: &dyn SalesStore,
    ) -> Result<Value, ToolError> {
        let args: ForecastArgs = parse(arguments)?;
        ctx.require_visible(args.employee_id)?;
        let history_months = args.history_months()?;
        let horizon_months = args.horizon_months()?;

        // complete months only: the current month is still open
        let (last_year, last_month) = shift_month(ctx.today.year(), ctx.today.month(), -1);
        let (first_year, first_month) =
            shift_month(last_year, last_month, -(history_months as i32 - 1));
        let (Some(start), Some(end)) =
            (first_of_month(first_year, first_month), last_of_month(last_year, last_month))
        else {
            return Err(ToolError::InvalidArguments("history window is out of range".to_string()));
        };
        let range = DateRange::new(start, end).map_err(ToolError::InvalidArguments)?;
        let records =
            fetch_records(ToolKind::Forecast, ctx, sales, args.employee_id, range).await?;

        let months = months_between(start, end);
        let history: Vec<(String, Decimal)> = monthly_buckets(&months, &records)
            .into_iter()
            .map(|(month, totals)| (month, totals.amount))
            .collect();
        let amounts: Vec<Decimal> = history.iter().map(|(_, amount)| *amount).collect();
        let (intercept, slope) = least_squares(&amounts);

        let projection: Vec<Value> = (1..=horizon_months as i32)
            .filter_map(|step| {
                let (year, month) = shift_month(last_year, last_month, step);
                let first = first_of_month(year, month)?;
                let x = Decimal::from(amounts.len() as i64 - 1 + i64::from(step));
                let projected = (intercept + slope * x).max(Decimal::ZERO).round_dp(2);
                Some(json!({ "month": month_label(first), "amount": projected }))
            })
            .collect();

        Ok(json!({
            "employee_id": args.employee_id,
            "method": "least_squares",
            "history": history
                .into_iter()
                .map(|(month, amount)| json!({ "month": month, "amount": amount.round_dp(2) }))
                .collect::<Vec<_>>(),
            "slope_per_month": slope.round_dp(2),
            "projection": projection,
        }))
    }
}

/// Ordinary least squares over `x = 0..n`. Returns `(intercept, slope)`.
fn least_squares(values: &[Decimal]) -> (Decimal, Decimal) {
    let n = Decimal::from(values.len() as i64);
    if values.len() < 2 {
        return (values.first().copied().unwrap_or(Decimal::ZERO), Decimal::ZERO);
    }

    let mut sum_x = Decimal::ZERO;
    let mut sum_y = Decimal::ZERO;
    let mut sum_xy = Decimal::ZERO;
    let mut sum_xx = Decimal::ZERO;
    for (index, value) in values.iter().enumerate() {
        let x = Decimal::from(index as i64);
        sum_x += x;
        sum_y += *value;
        sum_xy += x * *value;
        sum_xx += x * x;
    }

    let denominator = n * sum_xx - sum_x * sum_x;
    if denominator.is_zero() {
        return (sum_y / n, Decimal::ZERO);
    }
    let slope = (n * sum_xy - sum_x * sum_y) / denominator;
    let intercept = (sum_y - slope * sum_x) / n;
    (intercept, slope)
}
