//! Maps webhook outcomes to HTTP responses and log records

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::attempt::{AttemptStatus, DeploymentAttempt};
use crate::error::DeployError;
use crate::event::IgnoreReason;
use crate::pipeline::output_tail;

/// How much captured output goes into a single log record.
pub const LOG_OUTPUT_TAIL_BYTES: usize = 4 * 1024;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStatus {
    Success,
    Error,
    Ignored,
    Rejected,
}

/// JSON body returned for every `/webhook` request.
#[derive(Debug, Serialize)]
pub struct WebhookResponse {
    pub status: ResponseStatus,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempt_id: Option<String>,
}

impl WebhookResponse {
    pub fn new(status: ResponseStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            timestamp: Utc::now(),
            attempt_id: None,
        }
    }

    pub fn with_attempt(mut self, attempt_id: impl Into<String>) -> Self {
        self.attempt_id = Some(attempt_id.into());
        self
    }

    pub fn into_response_with(self, code: StatusCode) -> Response {
        (code, Json(self)).into_response()
    }
}

impl IntoResponse for DeployError {
    fn into_response(self) -> Response {
        let code = self.status_code();
        let status = match &self {
            DeployError::MalformedPayload(_)
            | DeployError::PayloadTooLarge { .. }
            | DeployError::UnhandledEvent(_) => ResponseStatus::Rejected,
            _ => ResponseStatus::Error,
        };
        // Pipeline details stay in the server log.
        let message = match &self {
            DeployError::ConfigurationError => "Webhook endpoint is not configured".to_string(),
            e if e.is_pipeline_failure() => "Deployment failed; see server logs".to_string(),
            DeployError::Config(_) | DeployError::TomlParse(_) => {
                "Internal configuration error".to_string()
            }
            e => e.to_string(),
        };
        WebhookResponse::new(status, message).into_response_with(code)
    }
}

/// 200 for pushes and pings that need no deployment.
pub fn ignored(reason: &IgnoreReason, delivery: Option<&str>) -> Response {
    let message = reason.message();
    info!("[delivery {}] Ignored: {}", delivery.unwrap_or("-"), message);
    WebhookResponse::new(ResponseStatus::Ignored, message).into_response_with(StatusCode::OK)
}

/// 200 once a background deployment has been handed off.
pub fn accepted(attempt_id: &str, delivery: Option<&str>) -> Response {
    info!(
        "[delivery {}] Accepted: deployment {} started",
        delivery.unwrap_or("-"),
        attempt_id
    );
    WebhookResponse::new(
        ResponseStatus::Success,
        "Webhook received. Deployment process initiated.",
    )
    .with_attempt(attempt_id)
    .into_response_with(StatusCode::OK)
}

/// Response for a deployment the handler waited on.
pub fn finished(attempt: &DeploymentAttempt) -> Response {
    match attempt.status {
        AttemptStatus::Success => {
            WebhookResponse::new(ResponseStatus::Success, "Site updated successfully")
                .with_attempt(&attempt.id)
                .into_response_with(StatusCode::OK)
        }
        _ => WebhookResponse::new(ResponseStatus::Error, "Deployment failed; see server logs")
            .with_attempt(&attempt.id)
            .into_response_with(StatusCode::INTERNAL_SERVER_ERROR),
    }
}

/// Log a refused request. Auth failures and misconfiguration are louder than
/// ordinary client mistakes.
pub fn log_rejection(err: &DeployError, delivery: Option<&str>, secret_state: &str) {
    let delivery = delivery.unwrap_or("-");
    match err {
        DeployError::ConfigurationError => error!(
            "[delivery {}] Refusing webhook: shared secret is {}",
            delivery, secret_state
        ),
        DeployError::MissingSignature | DeployError::SignatureMismatch => {
            warn!("[delivery {}] Authentication failed: {}", delivery, err)
        }
        DeployError::DeploymentBusy | DeployError::PayloadTooLarge { .. } => {
            warn!("[delivery {}] {}", delivery, err)
        }
        e if e.is_pipeline_failure() => error!("[delivery {}] {}", delivery, err),
        _ => info!("[delivery {}] Rejected: {}", delivery, err),
    }
}

/// Log a finished attempt with the tail of its captured output.
pub fn log_attempt(attempt: &DeploymentAttempt) {
    let tail = output_tail(&attempt.output, LOG_OUTPUT_TAIL_BYTES);
    let duration = attempt
        .duration_ms()
        .map(|ms| format!("{}ms", ms))
        .unwrap_or_else(|| "-".to_string());
    match attempt.status {
        AttemptStatus::Success => info!(
            "Deployment {} succeeded in {} (exit code {:?}) at {}\n{}",
            attempt.id,
            duration,
            attempt.exit_code,
            attempt.completed_at.unwrap_or_else(Utc::now).to_rfc3339(),
            tail
        ),
        _ => error!(
            "Deployment {} failed after {}: {} (exit code {:?}) at {}\n{}",
            attempt.id,
            duration,
            attempt.error.as_deref().unwrap_or("unknown error"),
            attempt.exit_code,
            attempt.completed_at.unwrap_or_else(Utc::now).to_rfc3339(),
            tail
        ),
    }
}
