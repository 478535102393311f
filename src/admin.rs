//! Read-only HTTP administration surface: liveness, scheduler status, and
//! the configured repository set (secrets redacted).

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::config::RepoConfig;
use crate::db::SqliteStore;
use crate::health::HealthChecker;
use crate::scheduler::Scheduler;
use crate::worker::StatusRegistry;

#[derive(Clone)]
pub struct AdminState {
    pub scheduler: Arc<Scheduler>,
    pub registry: StatusRegistry,
    pub health: Arc<HealthChecker>,
    pub store: Arc<SqliteStore>,
    pub repositories: Arc<Vec<RepoSummary>>,
}

/// A repository as exposed over the admin surface; the token never leaves
/// the process.
#[derive(Debug, Clone, Serialize)]
pub struct RepoSummary {
    pub name: String,
    pub url: String,
    pub provider: String,
    pub branch_regex: String,
    pub enabled: bool,
    pub has_token: bool,
}

impl RepoSummary {
    pub fn from_config(repo: &RepoConfig) -> Self {
        RepoSummary {
            name: repo.name.clone(),
            url: repo.url.clone(),
            provider: repo.provider.to_string(),
            branch_regex: repo.branch_regex.clone(),
            enabled: repo.enabled,
            has_token: !repo.token.is_empty(),
        }
    }
}

pub fn router(state: AdminState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/status", get(status_handler))
        .route("/repositories", get(repositories_handler))
        .route("/events", get(events_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health_handler(State(state): State<AdminState>) -> Response {
    let report = state.health.check().await;
    let status = if report.healthy() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(report)).into_response()
}

async fn status_handler(State(state): State<AdminState>) -> Response {
    let body = serde_json::json!({
        "scheduler": state.scheduler.status(),
        "repositories": state.registry.snapshot(),
    });
    Json(body).into_response()
}

async fn repositories_handler(State(state): State<AdminState>) -> Response {
    Json(state.repositories.as_ref().clone()).into_response()
}

#[derive(Debug, Deserialize)]
struct EventsQuery {
    #[serde(default = "default_events_limit")]
    limit: u32,
}

fn default_events_limit() -> u32 {
    50
}

async fn events_handler(
    State(state): State<AdminState>,
    Query(query): Query<EventsQuery>,
) -> Response {
    match state.store.recent_events(query.limit.min(500)).await {
        Ok(events) => Json(events).into_response(),
        Err(e) => {
            tracing::error!(error = %e, "failed to list events");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({"error": "failed to list events"})),
            )
                .into_response()
        }
    }
}
