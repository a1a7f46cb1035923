use sqlx::migrate::{MigrateError, Migrator};

use crate::DbPool;

pub static MIGRATOR: Migrator = sqlx::migrate!("../../migrations");

pub async fn run_pending(pool: &DbPool) -> Result<(), MigrateError> {
    MIGRATOR.run(pool).await
}

#[cfg(test)]
mod tests {
    use sqlx::Row;

    use super::run_pending;
    use crate::{connect_with_settings, migrations::MIGRATOR};

    const MANAGED_SCHEMA_OBJECTS: &[&str] = &[
        "employees",
        "personas",
        "roles",
        "sales",
        "sales_targets",
        "conversations",
        "conversation_turns",
        "personalization_memory",
        "idx_employees_manager_id",
        "idx_employees_division",
        "idx_roles_title",
        "idx_sales_employee_sold_on",
        "idx_sales_sold_on",
        "idx_conversations_owner_last_active",
        "conversation_turns_reject_update",
        "conversation_turns_reject_delete",
    ];

    async fn object_count(pool: &sqlx::SqlitePool, kind: &str, name: &str) -> i64 {
        sqlx::query("SELECT COUNT(*) AS count FROM sqlite_master WHERE type = ? AND name = ?")
            .bind(kind)
            .bind(name)
            .fetch_one(pool)
            .await
            .expect("query sqlite_master")
            .get::<i64, _>("count")
    }

    #[tokio::test]
    async fn migrations_create_baseline_tables() {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        run_pending(&pool).await.expect("run migrations");

        for table in [
            "employees",
            "personas",
            "roles",
            "sales",
            "sales_targets",
            "conversations",
            "conversation_turns",
            "personalization_memory",
        ] {
            assert_eq!(object_count(&pool, "table", table).await, 1, "missing table {table}");
        }
        assert_eq!(object_count(&pool, "trigger", "conversation_turns_reject_update").await, 1);
        assert_eq!(object_count(&pool, "trigger", "conversation_turns_reject_delete").await, 1);
    }

    #[tokio::test]
    async fn turn_rows_reject_update_and_delete() {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        run_pending(&pool).await.expect("run migrations");

        sqlx::query(
            "INSERT INTO conversations (id, owner_id, title, created_at, last_active_at)
             VALUES ('c-1', 1, 'First', '2026-01-01T00:00:00Z', '2026-01-01T00:00:00Z')",
        )
        .execute(&pool)
        .await
        .expect("insert conversation");
        sqlx::query(
            "INSERT INTO conversation_turns (conversation_id, turn_index, role, content, created_at)
             VALUES ('c-1', 0, 'user', 'hello', '2026-01-01T00:00:00Z')",
        )
        .execute(&pool)
        .await
        .expect("insert turn");

        let update = sqlx::query("UPDATE conversation_turns SET content = 'edited'")
            .execute(&pool)
            .await;
        assert!(update.is_err(), "turn update should be rejected");

        let delete = sqlx::query("DELETE FROM conversation_turns").execute(&pool).await;
        assert!(delete.is_err(), "turn delete should be rejected");
    }

    #[tokio::test]
    async fn migrations_are_reversible() {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        run_pending(&pool).await.expect("run migrations");

        MIGRATOR.undo(&pool, 0).await.expect("undo migrations");

        assert_eq!(object_count(&pool, "table", "conversation_turns").await, 0);
        assert_eq!(object_count(&pool, "table", "employees").await, 0);
    }

    #[tokio::test]
    async fn migrations_up_down_up_preserves_schema_signature() {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        run_pending(&pool).await.expect("run migrations");

        let initial_signature = managed_schema_signature(&pool).await;
        assert_eq!(
            initial_signature.len(),
            MANAGED_SCHEMA_OBJECTS.len(),
            "initial migration pass should create all managed schema objects",
        );

        MIGRATOR.undo(&pool, 0).await.expect("undo migrations");

        let after_down_signature = managed_schema_signature(&pool).await;
        assert!(
            after_down_signature.is_empty(),
            "managed schema objects should be removed after full undo",
        );

        run_pending(&pool).await.expect("re-run migrations");

        let after_second_up_signature = managed_schema_signature(&pool).await;
        assert_eq!(
            after_second_up_signature, initial_signature,
            "up/down/up should preserve migration-managed schema signature",
        );
    }

    async fn managed_schema_signature(pool: &sqlx::SqlitePool) -> Vec<(String, String, String)> {
        let mut signature: Vec<(String, String, String)> = sqlx::query(
            "SELECT type, name, IFNULL(sql, '') AS sql
             FROM sqlite_master
             WHERE type IN ('table', 'index', 'trigger')",
        )
        .fetch_all(pool)
        .await
        .expect("load schema objects")
        .into_iter()
        .filter_map(|row| {
            let name = row.get::<String, _>("name");
            if MANAGED_SCHEMA_OBJECTS.contains(&name.as_str()) {
                Some((row.get::<String, _>("type"), name, row.get::<String, _>("sql")))
            } else {
                None
            }
        })
        .collect();
        signature.sort();
        signature
    }
}
