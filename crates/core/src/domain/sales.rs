use chrono::{Datelike, Duration, NaiveDate};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::domain::access::VisibleSet;
use crate::domain::employee::EmployeeId;

const MAX_RANGE_DAYS: i64 = 366 * 5;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SalesRecord {
    pub employee_id: EmployeeId,
    pub division: String,
    pub sold_on: NaiveDate,
    pub product_line: String,
    pub amount: Decimal,
    pub units: i64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SalesTarget {
    pub employee_id: EmployeeId,
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
    pub amount: Decimal,
}

/// Inclusive calendar range.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self, String> {
        if start > end {
            return Err(format!("start_date {start} is after end_date {end}"));
        }
        if (end - start).num_days() > MAX_RANGE_DAYS {
            return Err(format!("date range {start}..{end} exceeds five years"));
        }
        Ok(Self { start, end })
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date <= self.end
    }

    pub fn overlaps(&self, start: NaiveDate, end: NaiveDate) -> bool {
        start <= self.end && self.start <= end
    }

    /// The calendar months `months` back from `today`'s month, inclusive of the current one.
    pub fn trailing_months(today: NaiveDate, months: u32) -> Self {
        let (year, month) = shift_month(today.year(), today.month(), -(months.max(1) as i32 - 1));
        let start = first_of_month(year, month).unwrap_or(today);
        Self { start, end: today }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeriodPreset {
    Today,
    ThisWeek,
    ThisMonth,
    LastMonth,
    ThisQuarter,
    LastQuarter,
    ThisYear,
    LastYear,
}

impl PeriodPreset {
    pub fn resolve(&self, today: NaiveDate) -> DateRange {
        let year = today.year();
        let month = today.month();
        let quarter_start_month = ((month - 1) / 3) * 3 + 1;

        let (start, end) = match self {
            Self::Today => (today, today),
            Self::ThisWeek => {
                let offset = i64::from(today.weekday().num_days_from_monday());
                (today - Duration::days(offset), today)
            }
            Self::ThisMonth => (first_of_month(year, month).unwrap_or(today), today),
            Self::LastMonth => {
                let (y, m) = shift_month(year, month, -1);
                (first_of_month(y, m).unwrap_or(today), last_of_month(y, m).unwrap_or(today))
            }
            Self::ThisQuarter => {
                (first_of_month(year, quarter_start_month).unwrap_or(today), today)
            }
            Self::LastQuarter => {
                let (y, m) = shift_month(year, quarter_start_month, -3);
                let (end_y, end_m) = shift_month(y, m, 2);
                (
                    first_of_month(y, m).unwrap_or(today),
                    last_of_month(end_y, end_m).unwrap_or(today),
                )
            }
            Self::ThisYear => (first_of_month(year, 1).unwrap_or(today), today),
            Self::LastYear => (
                first_of_month(year - 1, 1).unwrap_or(today),
                last_of_month(year - 1, 12).unwrap_or(today),
            ),
        };

        DateRange { start, end }
    }
}

/// `(year, month)` moved by `delta` months.
pub fn shift_month(year: i32, month: u32, delta: i32) -> (i32, u32) {
    let zero_based = year * 12 + (month as i32 - 1) + delta;
    (zero_based.div_euclid(12), zero_based.rem_euclid(12) as u32 + 1)
}

pub fn first_of_month(year: i32, month: u32) -> Option<NaiveDate> {
    NaiveDate::from_ymd_opt(year, month, 1)
}

pub fn last_of_month(year: i32, month: u32) -> Option<NaiveDate> {
    let (next_year, next_month) = shift_month(year, month, 1);
    first_of_month(next_year, next_month).and_then(|first| first.pred_opt())
}

pub fn month_label(date: NaiveDate) -> String {
    format!("{:04}-{:02}", date.year(), date.month())
}

/// Typed read query against the sales ledger.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SalesQuery {
    pub visible: VisibleSet,
    pub employee: Option<EmployeeId>,
    pub range: DateRange,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ColumnFilter {
    pub column: String,
    pub value: Value,
}

/// Read-only query against one catalogued table.
#[derive(Clone, Debug, PartialEq)]
pub struct TableQuery {
    pub table: String,
    pub columns: Vec<String>,
    pub filters: Vec<ColumnFilter>,
    pub limit: u32,
    pub visible: VisibleSet,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct TableRows {
    /// Column holding the owning employee id, when the table has one.
    pub owner_column: Option<String>,
    pub rows: Vec<Map<String, Value>>,
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::{last_of_month, shift_month, DateRange, PeriodPreset};

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).expect("valid date")
    }

    #[test]
    fn month_shift_wraps_years() {
        assert_eq!(shift_month(2026, 1, -1), (2025, 12));
        assert_eq!(shift_month(2026, 11, 3), (2027, 2));
        assert_eq!(last_of_month(2024, 2), Some(date(2024, 2, 29)));
    }

    #[test]
    fn presets_resolve_against_today() {
        let today = date(2026, 5, 14);
        assert_eq!(
            PeriodPreset::ThisMonth.resolve(today),
            DateRange { start: date(2026, 5, 1), end: today }
        );
        assert_eq!(
            PeriodPreset::LastMonth.resolve(today),
            DateRange { start: date(2026, 4, 1), end: date(2026, 4, 30) }
        );
        assert_eq!(
            PeriodPreset::LastQuarter.resolve(today),
            DateRange { start: date(2026, 1, 1), end: date(2026, 3, 31) }
        );
        assert_eq!(PeriodPreset::ThisWeek.resolve(today).start, date(2026, 5, 11));
    }

    #[test]
    fn inverted_ranges_are_rejected() {
        assert!(DateRange::new(date(2026, 2, 1), date(2026, 1, 1)).is_err());
        assert!(DateRange::new(date(2010, 1, 1), date(2026, 1, 1)).is_err());
    }

    #[test]
    fn trailing_months_starts_on_first_of_month() {
        let range = DateRange::trailing_months(date(2026, 3, 20), 6);
        assert_eq!(range.start, date(2025, 10, 1));
        assert_eq!(range.end, date(2026, 3, 20));
    }
}
