use chrono::{DateTime, NaiveDate, Utc};
use thiserror::Error;

use pulse_core::errors::StoreError;

pub mod access;
pub mod conversation;
pub mod memory;
pub mod personalization;
pub mod sales;

pub use access::SqlAccessRepository;
pub use conversation::SqlConversationRepository;
pub use memory::{
    InMemoryAccessRepository, InMemoryConversationRepository, InMemoryMemoryRepository,
    InMemorySalesRepository,
};
pub use personalization::SqlMemoryRepository;
pub use sales::SqlSalesRepository;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("rejected query: {0}")]
    Rejected(String),
    #[error("not found: {0}")]
    NotFound(String),
}

impl From<RepositoryError> for StoreError {
    fn from(error: RepositoryError) -> Self {
        match error {
            RepositoryError::Database(sqlx::Error::RowNotFound) => {
                StoreError::NotFound("row not found".to_string())
            }
            RepositoryError::Database(sqlx::Error::Database(database_error)) => {
                StoreError::Rejected(database_error.message().to_string())
            }
            RepositoryError::Database(
                error @ (sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_)),
            ) => StoreError::Decode(error.to_string()),
            RepositoryError::Database(error) => StoreError::Unavailable(error.to_string()),
            RepositoryError::Decode(message) => StoreError::Decode(message),
            RepositoryError::Rejected(message) => StoreError::Rejected(message),
            RepositoryError::NotFound(message) => StoreError::NotFound(message),
        }
    }
}

pub(crate) fn decode_err(error: impl std::fmt::Display) -> RepositoryError {
    RepositoryError::Decode(error.to_string())
}

pub(crate) fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Decode(format!("invalid timestamp `{value}`: {e}")))
}

pub(crate) fn parse_date(value: &str) -> Result<NaiveDate, RepositoryError> {
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .map_err(|e| RepositoryError::Decode(format!("invalid date `{value}`: {e}")))
}

pub(crate) fn format_date(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

#[cfg(test)]
mod tests {
    use pulse_core::errors::StoreError;

    use super::RepositoryError;

    #[test]
    fn pool_timeouts_surface_as_unavailable() {
        let error = StoreError::from(RepositoryError::Database(sqlx::Error::PoolTimedOut));
        assert!(matches!(error, StoreError::Unavailable(_)));
    }

    #[test]
    fn missing_rows_surface_as_not_found() {
        let error = StoreError::from(RepositoryError::Database(sqlx::Error::RowNotFound));
        assert!(matches!(error, StoreError::NotFound(_)));
    }

    #[test]
    fn decode_failures_keep_their_message() {
        let error = StoreError::from(RepositoryError::Decode("bad amount".to_string()));
        assert_eq!(error, StoreError::Decode("bad amount".to_string()));
    }
}
