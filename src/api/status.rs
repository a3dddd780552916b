//! Health and status endpoints

use axum::{Json, extract::State as AxumState, response::IntoResponse};
use serde_json::json;

use crate::SharedState;

const RECENT_ATTEMPTS: usize = 10;

/// Root health check endpoint
pub async fn root() -> &'static str {
    "site_deploy_hook - healthy"
}

/// GET /status - server info, current deployment and recent attempts.
/// Captured output is never included.
pub async fn status(AxumState(state): AxumState<SharedState>) -> impl IntoResponse {
    let store = state.deployer.attempts().lock().await;
    let recent = store.recent(RECENT_ATTEMPTS);

    Json(json!({
        "server": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
            "started_at": state.started_at,
            "uptime_seconds": state.start_time.elapsed().as_secs(),
        },
        "config": {
            "tracked_branch": state.config.tracked_branch,
            "mode": state.config.mode,
            "busy_policy": state.config.busy_policy,
            "secret_configured": state.config.secret().is_some(),
        },
        "deployments": {
            "current": store.current(),
            "queued_count": store.queued_count(),
            "total_recorded": store.total_recorded(),
            "recent": recent,
        }
    }))
}
