use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use chrono::Utc;
use pulse_db::DbPool;
use serde::Serialize;

/// Which backends have a credential. A missing one degrades answers but never fails readiness.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct BackendReadiness {
    pub primary: bool,
    pub analyst: bool,
    pub critic: bool,
}

#[derive(Clone)]
pub struct HealthState {
    db_pool: DbPool,
    backends: BackendReadiness,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HealthCheck {
    pub status: &'static str,
    pub detail: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub database: HealthCheck,
    pub backends: BackendReadiness,
    pub checked_at: String,
}

pub fn router(db_pool: DbPool, backends: BackendReadiness) -> Router {
    Router::new().route("/health", get(health)).with_state(HealthState { db_pool, backends })
}

pub async fn health(State(state): State<HealthState>) -> (StatusCode, Json<HealthResponse>) {
    let database = database_check(&state.db_pool).await;
    let database_ready = database.status == "ready";
    let ready = database_ready && state.backends.primary;

    let payload = HealthResponse {
        status: if ready { "ready" } else { "degraded" },
        database,
        backends: state.backends,
        checked_at: Utc::now().to_rfc3339(),
    };

    let status_code = if database_ready { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (status_code, Json(payload))
}

async fn database_check(pool: &DbPool) -> HealthCheck {
    match sqlx::query_scalar::<_, i64>("SELECT 1").fetch_one(pool).await {
        Ok(_) => HealthCheck { status: "ready", detail: "database query succeeded".to_string() },
        Err(error) => {
            HealthCheck { status: "degraded", detail: format!("database query failed: {error}") }
        }
    }
}
