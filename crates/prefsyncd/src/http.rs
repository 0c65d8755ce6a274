//! HTTP trigger surface
//!
//! The change-detection layer calls these routes; the handlers only decode
//! the request and hand it to the engine.
//!
//! | Route | Behavior |
//! |-------|----------|
//! | `GET/POST /backfill?secret=…` | Run the backfill, answer with a text summary |
//! | `POST /events/user-created` | Create default preferences (202, async) |
//! | `POST /events/preferences-written` | Sync a written or deleted document (202, async) |
//! | `POST /events/user-deleted` | Unsubscribe and delete preferences (202, async) |
//! | `GET /healthz` | Liveness |

use axum::{
    Json, Router,
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use prefsync_core::{SyncEngine, SyncOutcome};
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    engine: Arc<SyncEngine>,
    backfill_secret: Option<Arc<str>>,
}

impl AppState {
    pub fn new(engine: Arc<SyncEngine>, backfill_secret: Option<String>) -> Self {
        Self {
            engine,
            backfill_secret: backfill_secret
                .filter(|secret| !secret.is_empty())
                .map(Arc::from),
        }
    }
}

#[derive(Debug, Deserialize)]
struct BackfillQuery {
    secret: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UserEvent {
    user_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PreferencesWrittenEvent {
    user_id: String,
    #[serde(default)]
    before: Option<Value>,
    #[serde(default)]
    after: Option<Value>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(health))
        .route("/backfill", get(backfill).post(backfill))
        .route("/events/user-created", post(user_created))
        .route("/events/preferences-written", post(preferences_written))
        .route("/events/user-deleted", post(user_deleted))
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

async fn backfill(
    State(state): State<AppState>,
    Query(query): Query<BackfillQuery>,
) -> impl IntoResponse {
    let Some(expected) = state.backfill_secret.as_deref() else {
        error!("Backfill requested but no backfill secret is configured");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Backfill is not configured on this server.".to_string(),
        );
    };

    if query.secret.as_deref() != Some(expected) {
        warn!("Rejected backfill request with missing or invalid secret");
        return (StatusCode::FORBIDDEN, "Unauthorized".to_string());
    }

    info!("Backfill requested");
    match state.engine.run_backfill().await {
        Ok(report) => (StatusCode::OK, report.to_string()),
        Err(e) => {
            error!("Backfill failed: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Backfill failed: {}", e),
            )
        }
    }
}

async fn user_created(
    State(state): State<AppState>,
    Json(event): Json<UserEvent>,
) -> StatusCode {
    tokio::spawn(async move {
        state.engine.on_user_created(&event.user_id).await;
    });
    StatusCode::ACCEPTED
}

async fn preferences_written(
    State(state): State<AppState>,
    Json(event): Json<PreferencesWrittenEvent>,
) -> StatusCode {
    tokio::spawn(async move {
        let outcome = state
            .engine
            .on_preferences_written(&event.user_id, event.before, event.after)
            .await;
        log_outcome(&event.user_id, &outcome);
    });
    StatusCode::ACCEPTED
}

async fn user_deleted(
    State(state): State<AppState>,
    Json(event): Json<UserEvent>,
) -> StatusCode {
    tokio::spawn(async move {
        let outcome = state.engine.on_user_deleted(&event.user_id).await;
        log_outcome(&event.user_id, &outcome);
    });
    StatusCode::ACCEPTED
}

fn log_outcome(user_id: &str, outcome: &SyncOutcome) {
    match outcome {
        SyncOutcome::Synced { status, .. } => {
            tracing::debug!("Event for {} settled: {}", user_id, status);
        }
        SyncOutcome::Failed { stage, .. } => {
            warn!("Event for {} left unsynced after {} failure", user_id, stage);
        }
        SyncOutcome::ConfigurationError(_) => {
            warn!("Event for {} dropped: mailing-list configuration incomplete", user_id);
        }
    }
}
