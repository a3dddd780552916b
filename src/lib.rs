pub mod api;
pub mod attempt;
pub mod config;
pub mod deploy;
pub mod error;
pub mod event;
pub mod logging;
pub mod pipeline;
pub mod report;
pub mod signature;

use axum::{Router, extract::DefaultBodyLimit, routing};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Instant;

pub use config::DeploymentConfig;
use deploy::Deployer;

/// Process-wide state, built once at startup. The config never changes after
/// this; the only mutable parts live behind the deployer's locks.
pub struct AppState {
    pub config: DeploymentConfig,
    pub deployer: Deployer,
    pub start_time: Instant,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    pub fn new(config: DeploymentConfig) -> Self {
        let deployer = Deployer::from_config(&config);
        Self::with_deployer(config, deployer)
    }

    pub fn with_deployer(config: DeploymentConfig, deployer: Deployer) -> Self {
        Self {
            config,
            deployer,
            start_time: Instant::now(),
            started_at: Utc::now(),
        }
    }
}

pub type SharedState = Arc<AppState>;

pub fn app(state: SharedState) -> Router {
    let payload_limit = DefaultBodyLimit::max(state.config.max_payload_bytes);
    Router::new()
        .route("/", routing::get(api::root))
        .route(
            "/webhook",
            routing::post(api::handle_webhook)
                .fallback(api::method_not_allowed)
                .layer(payload_limit),
        )
        .route("/status", routing::get(api::status))
        .with_state(state)
}
