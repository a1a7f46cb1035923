use chrono::{Datelike, NaiveDate};
use rust_decimal::Decimal;

use pulse_core::domain::sales::{first_of_month, last_of_month, shift_month};

use crate::connection::DbPool;
use crate::repositories::RepositoryError;

const PRODUCT_LINES: &[&str] = &["Platform", "Analytics", "Services"];
const DEAL_DAYS: &[u32] = &[3, 12, 21];
const HISTORY_MONTHS: i32 = 6;

/// Sellers carrying a quota, with the base deal size used to generate their history.
const SELLERS: &[SeedSeller] = &[
    SeedSeller { employee_id: 4, division: "North", base_deal: 2500, months_active: 6 },
    SeedSeller { employee_id: 5, division: "North", base_deal: 1800, months_active: 6 },
    SeedSeller { employee_id: 6, division: "North", base_deal: 1400, months_active: 6 },
    SeedSeller { employee_id: 7, division: "South", base_deal: 2100, months_active: 6 },
    SeedSeller { employee_id: 8, division: "South", base_deal: 900, months_active: 3 },
    SeedSeller { employee_id: 10, division: "North", base_deal: 1600, months_active: 6 },
];

#[derive(Debug, Clone, Copy)]
struct SeedSeller {
    employee_id: i64,
    division: &'static str,
    base_deal: i64,
    /// Inactive sellers stopped closing deals this many months before `today`.
    months_active: i32,
}

/// Demo organisation with grants, personas and six months of sales history ending at `today`.
pub struct DemoDataset;

impl DemoDataset {
    pub const ORG_SQL: &str = include_str!("../../../config/fixtures/pulse_demo_org.sql");

    pub async fn load(pool: &DbPool, today: NaiveDate) -> Result<SeedResult, RepositoryError> {
        let mut tx = pool.begin().await?;
        sqlx::raw_sql(Self::ORG_SQL).execute(&mut *tx).await?;

        let mut sales_rows = 0_usize;
        let mut target_rows = 0_usize;
        for seller in SELLERS {
            for offset in 0..HISTORY_MONTHS {
                let (year, month) = shift_month(today.year(), today.month(), -offset);
                let bounds = (first_of_month(year, month), last_of_month(year, month));
                let (Some(start), Some(end)) = bounds else {
                    continue;
                };

                sqlx::query(
                    "INSERT INTO sales_targets (employee_id, period_start, period_end, amount)
                     VALUES (?, ?, ?, ?)",
                )
                .bind(seller.employee_id)
                .bind(start.format("%Y-%m-%d").to_string())
                .bind(end.format("%Y-%m-%d").to_string())
                .bind(Decimal::new(seller.base_deal * 3 + 500, 0).to_string())
                .execute(&mut *tx)
                .await?;
                target_rows += 1;

                let inactive_window = HISTORY_MONTHS - seller.months_active;
                if offset < inactive_window {
                    continue;
                }

                for (deal, day) in DEAL_DAYS.iter().enumerate() {
                    let Some(sold_on) = NaiveDate::from_ymd_opt(year, month, *day) else {
                        continue;
                    };
                    if sold_on > today {
                        continue;
                    }
                    let deal = deal as i64;
                    let amount = Decimal::new(
                        (seller.base_deal + 37 * i64::from(offset) + 11 * deal) * 100 + 50,
                        2,
                    );
                    let product = PRODUCT_LINES[((seller.employee_id + deal) % 3) as usize];

                    sqlx::query(
                        "INSERT INTO sales
                           (employee_id, division, sold_on, product_line, amount, units)
                         VALUES (?, ?, ?, ?, ?, ?)",
                    )
                    .bind(seller.employee_id)
                    .bind(seller.division)
                    .bind(sold_on.format("%Y-%m-%d").to_string())
                    .bind(product)
                    .bind(amount.to_string())
                    .bind(1 + deal % 2)
                    .execute(&mut *tx)
                    .await?;
                    sales_rows += 1;
                }
            }
        }

        tx.commit().await?;

        Ok(SeedResult { employees: 10, sellers: SELLERS.len(), sales_rows, target_rows })
    }

    /// Verify that the demo organisation is present and internally consistent.
    pub async fn verify(pool: &DbPool) -> Result<VerificationResult, RepositoryError> {
        let mut checks = Vec::new();

        let employees: i64 = sqlx::query_scalar("SELECT COUNT(1) FROM employees")
            .fetch_one(pool)
            .await?;
        checks.push(("employees", employees == 10));

        let ungranted: i64 = sqlx::query_scalar(
            "SELECT COUNT(1) FROM employees e
             WHERE NOT EXISTS (
                 SELECT 1 FROM roles r WHERE r.employee_id = e.id OR r.title = e.title
             )",
        )
        .fetch_one(pool)
        .await?;
        checks.push(("every-employee-has-a-role", ungranted == 0));

        let orphaned_sales: i64 = sqlx::query_scalar(
            "SELECT COUNT(1) FROM sales s
             WHERE NOT EXISTS (SELECT 1 FROM employees e WHERE e.id = s.employee_id)",
        )
        .fetch_one(pool)
        .await?;
        checks.push(("sales-owned-by-employees", orphaned_sales == 0));

        let targets: i64 = sqlx::query_scalar("SELECT COUNT(1) FROM sales_targets")
            .fetch_one(pool)
            .await?;
        checks.push(("targets", targets == (SELLERS.len() as i64) * i64::from(HISTORY_MONTHS)));

        let dangling_personas: i64 = sqlx::query_scalar(
            "SELECT COUNT(1) FROM roles r
             WHERE r.persona_id IS NOT NULL
               AND NOT EXISTS (SELECT 1 FROM personas p WHERE p.id = r.persona_id)",
        )
        .fetch_one(pool)
        .await?;
        checks.push(("personas-resolve", dangling_personas == 0));

        let all_present = checks.iter().all(|(_, ok)| *ok);
        Ok(VerificationResult { all_present, checks })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeedResult {
    pub employees: usize,
    pub sellers: usize,
    pub sales_rows: usize,
    pub target_rows: usize,
}

#[derive(Debug, Clone)]
pub struct VerificationResult {
    pub all_present: bool,
    pub checks: Vec<(&'static str, bool)>,
}
