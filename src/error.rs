use axum::http::StatusCode;
use std::io;
use std::time::Duration;

/// Error type for every stage of a webhook delivery, from startup
/// configuration to the deployment subprocess.
#[derive(Debug, thiserror::Error)]
pub enum DeployError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Webhook secret is not configured")]
    ConfigurationError,

    #[error("Missing X-Hub-Signature-256 header")]
    MissingSignature,

    #[error("Webhook signature does not match")]
    SignatureMismatch,

    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    #[error("Payload exceeds {limit} bytes")]
    PayloadTooLarge { limit: usize },

    #[error("Unhandled GitHub event type: {0}")]
    UnhandledEvent(String),

    #[error("A deployment is already in progress")]
    DeploymentBusy,

    #[error("Deployment output exceeded {limit} bytes")]
    OutputOverflow { limit: usize },

    #[error("Deployment timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    #[error("Stage '{stage}' failed with {}", describe_exit(.exit_code))]
    StageFailed {
        stage: String,
        exit_code: Option<i32>,
    },

    #[error("Failed to start deployment: {0}")]
    Spawn(io::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("TOML parsing error: {0}")]
    TomlParse(#[from] toml::de::Error),
}

fn describe_exit(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {}", code),
        None => "no exit code (killed by signal)".to_string(),
    }
}

impl DeployError {
    /// HTTP status reported to the webhook sender for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            DeployError::MissingSignature | DeployError::SignatureMismatch => {
                StatusCode::UNAUTHORIZED
            }
            DeployError::MalformedPayload(_) | DeployError::UnhandledEvent(_) => {
                StatusCode::BAD_REQUEST
            }
            DeployError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            DeployError::DeploymentBusy => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// True for failures of the deployment pipeline itself, as opposed to
    /// problems with the request or the service configuration.
    pub fn is_pipeline_failure(&self) -> bool {
        matches!(
            self,
            DeployError::OutputOverflow { .. }
                | DeployError::Timeout(_)
                | DeployError::StageFailed { .. }
                | DeployError::Spawn(_)
                | DeployError::Io(_)
        )
    }
}

/// Helper type for Results that use DeployError
pub type Result<T> = std::result::Result<T, DeployError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_errors_map_to_401() {
        assert_eq!(
            DeployError::MissingSignature.status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            DeployError::SignatureMismatch.status_code(),
            StatusCode::UNAUTHORIZED
        );
    }

    #[test]
    fn missing_secret_maps_to_500() {
        assert_eq!(
            DeployError::ConfigurationError.status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn stage_failure_message_names_stage() {
        let err = DeployError::StageFailed {
            stage: "fetch".to_string(),
            exit_code: Some(128),
        };
        assert_eq!(err.to_string(), "Stage 'fetch' failed with exit code 128");
        assert!(err.is_pipeline_failure());
        assert!(!DeployError::DeploymentBusy.is_pipeline_failure());
    }
}
