use std::sync::Arc;
use std::time::Duration;

use pulse_agent::llm::{BackendError, EngineId, HttpBackend, ReasoningBackend};
use pulse_agent::tools::ToolExecutor;
use pulse_agent::{AccessResolver, AgentRuntime, EngineCoordinator};
use pulse_core::config::{AppConfig, BackendConfig, ConfigError, LoadOptions};
use pulse_db::repositories::{
    SqlAccessRepository, SqlConversationRepository, SqlMemoryRepository, SqlSalesRepository,
};
use pulse_db::{connect_with_settings, migrations, DbPool};
use thiserror::Error;
use tracing::info;

use crate::api::ApiState;
use crate::health::BackendReadiness;

pub struct Application {
    pub config: AppConfig,
    pub db_pool: DbPool,
    pub api: ApiState,
    pub backends: BackendReadiness,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("database connection failed: {0}")]
    DatabaseConnect(#[source] sqlx::Error),
    #[error("database migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),
    #[error("backend client setup failed: {0}")]
    Backend(#[from] BackendError),
}

pub async fn bootstrap(options: LoadOptions) -> Result<Application, BootstrapError> {
    let config = AppConfig::load(options)?;
    bootstrap_with_config(config).await
}

fn backend(
    engine: EngineId,
    config: &BackendConfig,
) -> Result<Arc<dyn ReasoningBackend>, BootstrapError> {
    let backend = HttpBackend::new(engine, config)?;
    info!(
        event_name = "system.bootstrap.backend_configured",
        correlation_id = "bootstrap",
        engine = %engine,
        model = %config.model,
        available = backend.is_available(),
        "reasoning backend configured"
    );
    Ok(Arc::new(backend))
}

pub async fn bootstrap_with_config(config: AppConfig) -> Result<Application, BootstrapError> {
    info!(
        event_name = "system.bootstrap.start",
        correlation_id = "bootstrap",
        "starting application bootstrap"
    );

    let db_pool = connect_with_settings(
        &config.database.url,
        config.database.max_connections,
        config.database.timeout_secs,
    )
    .await
    .map_err(BootstrapError::DatabaseConnect)?;
    info!(
        event_name = "system.bootstrap.database_connected",
        correlation_id = "bootstrap",
        "database connection established"
    );

    migrations::run_pending(&db_pool).await.map_err(BootstrapError::Migration)?;
    info!(
        event_name = "system.bootstrap.migrations_applied",
        correlation_id = "bootstrap",
        "database migrations applied"
    );

    let access = Arc::new(SqlAccessRepository::new(db_pool.clone()));
    let resolver = Arc::new(AccessResolver::new(
        access.clone(),
        access,
        Duration::from_secs(config.agent.identity_cache_ttl_secs),
    ));
    let executor = Arc::new(ToolExecutor::new(Arc::new(SqlSalesRepository::new(db_pool.clone()))));

    let primary = backend(EngineId::Primary, &config.backends.primary)?;
    let analyst = backend(EngineId::Analyst, &config.backends.analyst)?;
    let critic = backend(EngineId::Critic, &config.backends.critic)?;
    let backends = BackendReadiness {
        primary: primary.is_available(),
        analyst: analyst.is_available(),
        critic: critic.is_available(),
    };

    let runtime = AgentRuntime::new(
        resolver.clone(),
        executor.clone(),
        primary,
        Arc::new(SqlConversationRepository::new(db_pool.clone())),
        Arc::new(SqlMemoryRepository::new(db_pool.clone())),
        config.agent.clone(),
    );
    let engines = EngineCoordinator::new(resolver, executor, analyst, critic, config.agent.clone());

    Ok(Application {
        config,
        db_pool,
        api: ApiState { runtime: Arc::new(runtime), engines: Arc::new(engines) },
        backends,
    })
}

#[cfg(test)]
mod tests {
    use pulse_core::config::{ConfigOverrides, LoadOptions};

    use crate::bootstrap::bootstrap;

    fn overrides(database_url: &str) -> LoadOptions {
        LoadOptions {
            overrides: ConfigOverrides {
                database_url: Some(database_url.to_string()),
                ..ConfigOverrides::default()
            },
            ..LoadOptions::default()
        }
    }

    #[tokio::test]
    async fn bootstrap_applies_migrations_and_reports_backend_readiness() {
        let app = bootstrap(overrides("sqlite::memory:?cache=shared"))
            .await
            .expect("bootstrap should succeed without backend credentials");

        let (table_count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' \
             AND name IN ('employees', 'roles', 'sales', 'conversation_turns')",
        )
        .fetch_one(&app.db_pool)
        .await
        .expect("schema tables should exist after bootstrap");
        assert_eq!(table_count, 4);
        assert_eq!(app.api.runtime.primary_available(), app.backends.primary);

        app.db_pool.close().await;
    }

    #[tokio::test]
    async fn bootstrap_fails_fast_on_invalid_database_url() {
        let result = bootstrap(overrides("postgres://not-sqlite")).await;
        assert!(result.is_err());
    }
}
