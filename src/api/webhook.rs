//! Webhook handler for GitHub push events

use axum::{
    body::Bytes,
    extract::{State as AxumState, rejection::BytesRejection},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use tracing::debug;

use crate::SharedState;
use crate::deploy::Submission;
use crate::error::{DeployError, Result};
use crate::event::{Classification, DELIVERY_HEADER, EVENT_HEADER, classify};
use crate::report::{self, ResponseStatus, WebhookResponse};
use crate::signature::{SIGNATURE_HEADER, verify_github_signature};

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Handles the GitHub webhook POST request.
///
/// The body is taken as raw bytes: the signature is computed over exactly
/// what GitHub sent, before any JSON parsing.
pub async fn handle_webhook(
    AxumState(state): AxumState<SharedState>,
    headers: HeaderMap,
    body: std::result::Result<Bytes, BytesRejection>,
) -> Response {
    let delivery = header(&headers, DELIVERY_HEADER);
    let body = match body {
        Ok(body) => body,
        Err(rejection) => {
            let err = if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
                DeployError::PayloadTooLarge {
                    limit: state.config.max_payload_bytes,
                }
            } else {
                DeployError::MalformedPayload(rejection.body_text())
            };
            report::log_rejection(&err, delivery, state.config.secret_state());
            return err.into_response();
        }
    };
    debug!(
        "[delivery {}] {} event, {} bytes",
        delivery.unwrap_or("-"),
        header(&headers, EVENT_HEADER).unwrap_or("(none)"),
        body.len()
    );

    match process(&state, &headers, &body, delivery).await {
        Ok(response) => response,
        Err(err) => {
            report::log_rejection(&err, delivery, state.config.secret_state());
            err.into_response()
        }
    }
}

async fn process(
    state: &SharedState,
    headers: &HeaderMap,
    body: &[u8],
    delivery: Option<&str>,
) -> Result<Response> {
    verify_github_signature(
        state.config.secret(),
        body,
        header(headers, SIGNATURE_HEADER),
    )?;

    let tracked_ref = state.config.tracked_ref();
    match classify(header(headers, EVENT_HEADER), body, &tracked_ref)? {
        Classification::Ignored(reason) => Ok(report::ignored(&reason, delivery)),
        Classification::Rejected { event_type } => Err(DeployError::UnhandledEvent(event_type)),
        Classification::Accepted(push) => {
            match state
                .deployer
                .submit(&push, delivery.map(String::from))
                .await?
            {
                Submission::Started { attempt_id } => Ok(report::accepted(&attempt_id, delivery)),
                Submission::Finished(attempt) => Ok(report::finished(&attempt)),
            }
        }
    }
}

/// Any method other than POST on `/webhook`.
pub async fn method_not_allowed() -> impl IntoResponse {
    WebhookResponse::new(ResponseStatus::Error, "Method Not Allowed")
        .into_response_with(StatusCode::METHOD_NOT_ALLOWED)
}
