use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use pulse_core::domain::access::{AccessGrant, Capabilities, Persona, RowScope};
use pulse_core::domain::employee::{Employee, EmployeeId};
use pulse_core::errors::StoreError;
use pulse_core::ports::{GrantStore, IdentityDirectory};

use super::{decode_err, RepositoryError};
use crate::DbPool;

const EMPLOYEE_COLUMNS: &str = "id, name, title, division, unit, manager_id, active";
const ROLE_COLUMNS: &str = "role_name, row_scope, proactive_insights, recommendations, forecasting,
     org_structure, free_query, table_allow, table_deny, persona_id";

/// Employee directory and role grants backed by the `employees`, `roles` and `personas` tables.
pub struct SqlAccessRepository {
    pool: DbPool,
}

impl SqlAccessRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn all_employees(&self) -> Result<Vec<Employee>, RepositoryError> {
        let rows = sqlx::query(&format!("SELECT {EMPLOYEE_COLUMNS} FROM employees ORDER BY id"))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_employee).collect()
    }

    async fn employee_by_id(&self, id: EmployeeId) -> Result<Option<Employee>, RepositoryError> {
        let row = sqlx::query(&format!("SELECT {EMPLOYEE_COLUMNS} FROM employees WHERE id = ?"))
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_employee).transpose()
    }

    /// A per-employee role row wins over the role attached to the employee's title.
    async fn grant_row(&self, employee: &Employee) -> Result<Option<AccessGrant>, RepositoryError> {
        let direct = sqlx::query(&format!("SELECT {ROLE_COLUMNS} FROM roles WHERE employee_id = ?"))
            .bind(employee.id.0)
            .fetch_optional(&self.pool)
            .await?;

        let row = match direct {
            Some(row) => Some(row),
            None => {
                sqlx::query(&format!(
                    "SELECT {ROLE_COLUMNS} FROM roles
                     WHERE employee_id IS NULL AND title = ?
                     ORDER BY id LIMIT 1"
                ))
                .bind(&employee.title)
                .fetch_optional(&self.pool)
                .await?
            }
        };

        row.as_ref().map(|row| row_to_grant(row, employee)).transpose()
    }

    async fn persona_by_id(&self, persona_id: &str) -> Result<Option<Persona>, RepositoryError> {
        let row =
            sqlx::query("SELECT id, name, tone, format_guidance FROM personas WHERE id = ?")
                .bind(persona_id)
                .fetch_optional(&self.pool)
                .await?;

        match row {
            Some(ref r) => Ok(Some(Persona {
                id: r.try_get("id").map_err(decode_err)?,
                name: r.try_get("name").map_err(decode_err)?,
                tone: r.try_get("tone").map_err(decode_err)?,
                format_guidance: r.try_get("format_guidance").map_err(decode_err)?,
            })),
            None => Ok(None),
        }
    }
}

pub(crate) fn row_to_employee(row: &SqliteRow) -> Result<Employee, RepositoryError> {
    let id: i64 = row.try_get("id").map_err(decode_err)?;
    let manager_id: Option<i64> = row.try_get("manager_id").map_err(decode_err)?;
    let active: i64 = row.try_get("active").map_err(decode_err)?;

    Ok(Employee {
        id: EmployeeId(id),
        name: row.try_get("name").map_err(decode_err)?,
        title: row.try_get("title").map_err(decode_err)?,
        division: row.try_get("division").map_err(decode_err)?,
        unit: row.try_get("unit").map_err(decode_err)?,
        manager_id: manager_id.map(EmployeeId),
        active: active != 0,
    })
}

fn row_to_grant(row: &SqliteRow, employee: &Employee) -> Result<AccessGrant, RepositoryError> {
    let scope_str: String = row.try_get("row_scope").map_err(decode_err)?;
    let row_scope = scope_str.parse::<RowScope>().map_err(RepositoryError::Decode)?;
    let table_allow_json: String = row.try_get("table_allow").map_err(decode_err)?;
    let table_deny_json: String = row.try_get("table_deny").map_err(decode_err)?;
    let flag = |column: &str| -> Result<bool, RepositoryError> {
        let value: i64 = row.try_get(column).map_err(decode_err)?;
        Ok(value != 0)
    };

    Ok(AccessGrant {
        employee_id: employee.id,
        division: employee.division.clone(),
        unit: employee.unit.clone(),
        role_name: row.try_get("role_name").map_err(decode_err)?,
        row_scope,
        capabilities: Capabilities {
            proactive_insights: flag("proactive_insights")?,
            recommendations: flag("recommendations")?,
            forecasting: flag("forecasting")?,
            org_structure: flag("org_structure")?,
            free_query: flag("free_query")?,
        },
        table_allow: serde_json::from_str(&table_allow_json).map_err(decode_err)?,
        table_deny: serde_json::from_str(&table_deny_json).map_err(decode_err)?,
        persona_id: row.try_get("persona_id").map_err(decode_err)?,
    })
}

#[async_trait]
impl IdentityDirectory for SqlAccessRepository {
    async fn load_identity_graph(&self) -> Result<Vec<Employee>, StoreError> {
        Ok(self.all_employees().await?)
    }

    async fn find_employee(&self, id: EmployeeId) -> Result<Option<Employee>, StoreError> {
        Ok(self.employee_by_id(id).await?)
    }
}

#[async_trait]
impl GrantStore for SqlAccessRepository {
    async fn grant_for(&self, employee: &Employee) -> Result<Option<AccessGrant>, StoreError> {
        Ok(self.grant_row(employee).await?)
    }

    async fn persona(&self, persona_id: &str) -> Result<Option<Persona>, StoreError> {
        Ok(self.persona_by_id(persona_id).await?)
    }
}

#[cfg(test)]
mod tests {
    use pulse_core::domain::access::RowScope;
    use pulse_core::domain::employee::EmployeeId;
    use pulse_core::ports::{GrantStore, IdentityDirectory};

    use super::SqlAccessRepository;
    use crate::{connect_with_settings, migrations};

    async fn setup() -> sqlx::SqlitePool {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("migrations");
        sqlx::raw_sql(
            "INSERT INTO personas (id, name, tone, format_guidance)
                 VALUES ('coach', 'Coach', 'encouraging', 'short paragraphs');
             INSERT INTO employees (id, name, title, division, unit, manager_id, active) VALUES
                 (1, 'Dana Whitfield', 'Regional Director', 'North', NULL, NULL, 1),
                 (2, 'Aisha Okafor', 'Account Executive', 'North', 'Metro', 1, 1),
                 (3, 'Ken Watanabe', 'Account Executive', 'North', NULL, 1, 0),
                 (4, 'Nobody Special', 'Intern', 'North', NULL, 1, 1);
             INSERT INTO roles (role_name, employee_id, title, row_scope, forecasting, persona_id)
                 VALUES ('ae', NULL, 'Account Executive', 'own_only', 0, 'coach');
             INSERT INTO roles (role_name, employee_id, title, row_scope, forecasting, table_deny)
                 VALUES ('director', 1, NULL, 'own_and_subtree', 1, '[\"employees\"]');",
        )
        .execute(&pool)
        .await
        .expect("seed");
        pool
    }

    #[tokio::test]
    async fn identity_graph_includes_inactive_employees() {
        let repo = SqlAccessRepository::new(setup().await);

        let employees = repo.load_identity_graph().await.expect("load graph");
        assert_eq!(employees.len(), 4);
        let ken = employees.iter().find(|e| e.id == EmployeeId(3)).expect("ken");
        assert!(!ken.active);
        assert_eq!(ken.manager_id, Some(EmployeeId(1)));
    }

    #[tokio::test]
    async fn employee_specific_role_wins_over_title_role() {
        let repo = SqlAccessRepository::new(setup().await);
        let dana = repo.find_employee(EmployeeId(1)).await.expect("find").expect("exists");

        let grant = repo.grant_for(&dana).await.expect("grant").expect("has grant");
        assert_eq!(grant.role_name, "director");
        assert_eq!(grant.row_scope, RowScope::OwnAndSubtree);
        assert!(grant.capabilities.forecasting);
        assert!(!grant.table_permitted("employees"));
        assert!(grant.table_permitted("sales"));
    }

    #[tokio::test]
    async fn title_role_applies_when_no_direct_grant() {
        let repo = SqlAccessRepository::new(setup().await);
        let aisha = repo.find_employee(EmployeeId(2)).await.expect("find").expect("exists");

        let grant = repo.grant_for(&aisha).await.expect("grant").expect("has grant");
        assert_eq!(grant.row_scope, RowScope::OwnOnly);
        assert_eq!(grant.division, "North");
        assert_eq!(grant.unit.as_deref(), Some("Metro"));

        let persona = repo.persona("coach").await.expect("persona").expect("exists");
        assert_eq!(persona.tone, "encouraging");
    }

    #[tokio::test]
    async fn employee_without_any_role_has_no_grant() {
        let repo = SqlAccessRepository::new(setup().await);
        let intern = repo.find_employee(EmployeeId(4)).await.expect("find").expect("exists");

        assert!(repo.grant_for(&intern).await.expect("grant").is_none());
        assert!(repo.find_employee(EmployeeId(99)).await.expect("find").is_none());
    }
}
