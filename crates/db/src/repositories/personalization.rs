use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Row;

use pulse_core::domain::conversation::MemoryItem;
use pulse_core::domain::employee::EmployeeId;
use pulse_core::errors::StoreError;
use pulse_core::ports::MemoryStore;

use super::{decode_err, parse_timestamp, RepositoryError};
use crate::DbPool;

/// Read side of the personalization memory. Rows are written by the feedback pipeline.
pub struct SqlMemoryRepository {
    pool: DbPool,
}

impl SqlMemoryRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn memories_for(
        &self,
        owner: EmployeeId,
        now: DateTime<Utc>,
    ) -> Result<Vec<MemoryItem>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT memory_key, memory_value, expires_at FROM personalization_memory
             WHERE employee_id = ?
             ORDER BY memory_key ASC",
        )
        .bind(owner.0)
        .fetch_all(&self.pool)
        .await?;

        let mut items = Vec::with_capacity(rows.len());
        for row in &rows {
            let expires_at: Option<String> = row.try_get("expires_at").map_err(decode_err)?;
            let item = MemoryItem {
                key: row.try_get("memory_key").map_err(decode_err)?,
                value: row.try_get("memory_value").map_err(decode_err)?,
                expires_at: expires_at.as_deref().map(parse_timestamp).transpose()?,
            };
            if item.is_live(now) {
                items.push(item);
            }
        }
        Ok(items)
    }
}

#[async_trait]
impl MemoryStore for SqlMemoryRepository {
    async fn live_memories(
        &self,
        owner: EmployeeId,
        now: DateTime<Utc>,
    ) -> Result<Vec<MemoryItem>, StoreError> {
        Ok(self.memories_for(owner, now).await?)
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};

    use pulse_core::domain::employee::EmployeeId;
    use pulse_core::ports::MemoryStore;

    use super::SqlMemoryRepository;
    use crate::{connect_with_settings, migrations};

    #[tokio::test]
    async fn expired_items_are_filtered_at_read() {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("migrations");

        let now = Utc::now();
        let rows = [
            ("preferred_format", "tables", None),
            ("focus", "enterprise deals", Some((now + Duration::days(3)).to_rfc3339())),
            ("stale", "old hint", Some((now - Duration::hours(1)).to_rfc3339())),
        ];
        for (key, value, expires_at) in rows {
            sqlx::query(
                "INSERT INTO personalization_memory
                     (employee_id, memory_key, memory_value, expires_at, created_at)
                 VALUES (7, ?, ?, ?, ?)",
            )
            .bind(key)
            .bind(value)
            .bind(expires_at)
            .bind(now.to_rfc3339())
            .execute(&pool)
            .await
            .expect("insert memory");
        }

        let repo = SqlMemoryRepository::new(pool);
        let items = repo.live_memories(EmployeeId(7), now).await.expect("memories");
        let keys: Vec<&str> = items.iter().map(|item| item.key.as_str()).collect();
        assert_eq!(keys, vec!["focus", "preferred_format"]);

        assert!(repo.live_memories(EmployeeId(8), now).await.expect("memories").is_empty());
    }
}
