//! GitHub event classification

use serde::Deserialize;
use tracing::debug;

use crate::error::{DeployError, Result};

pub const EVENT_HEADER: &str = "X-GitHub-Event";
pub const DELIVERY_HEADER: &str = "X-GitHub-Delivery";

const MAX_COMMIT_MSG_LEN: usize = 200;

#[derive(Debug, Clone, Deserialize)]
pub struct Repository {
    pub full_name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Pusher {
    pub name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HeadCommit {
    pub message: Option<String>,
}

/// The subset of a push payload needed to deploy and to log the attempt.
#[derive(Debug, Clone, Deserialize)]
pub struct PushEvent {
    #[serde(rename = "ref")]
    pub reference: String,
    #[serde(default)]
    pub after: Option<String>,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default)]
    pub repository: Option<Repository>,
    #[serde(default)]
    pub pusher: Option<Pusher>,
    #[serde(default)]
    pub head_commit: Option<HeadCommit>,
}

impl PushEvent {
    /// Branch name with the `refs/heads/` prefix removed.
    pub fn branch(&self) -> &str {
        self.reference
            .strip_prefix("refs/heads/")
            .unwrap_or(&self.reference)
    }

    pub fn repository_name(&self) -> &str {
        self.repository
            .as_ref()
            .and_then(|r| r.full_name.as_deref())
            .unwrap_or("(unknown)")
    }

    pub fn pusher_name(&self) -> Option<&str> {
        self.pusher.as_ref().and_then(|p| p.name.as_deref())
    }

    /// First line of the head commit message, shortened for logging.
    pub fn commit_summary(&self) -> Option<String> {
        let message = self.head_commit.as_ref()?.message.as_deref()?;
        let first_line = message.lines().next().unwrap_or("");
        if first_line.chars().count() > MAX_COMMIT_MSG_LEN {
            let short: String = first_line.chars().take(MAX_COMMIT_MSG_LEN).collect();
            Some(format!("{}...", short))
        } else {
            Some(first_line.to_string())
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IgnoreReason {
    /// GitHub's hook-configuration check.
    Ping,
    /// A push to some other ref than the tracked branch.
    BranchMismatch { reference: String },
    /// The tracked branch itself was deleted.
    BranchDeleted,
}

impl IgnoreReason {
    pub fn message(&self) -> String {
        match self {
            IgnoreReason::Ping => "Webhook configured successfully (ping received)".to_string(),
            IgnoreReason::BranchMismatch { reference } => {
                format!("Push to '{}' ignored; not the tracked branch", reference)
            }
            IgnoreReason::BranchDeleted => "Branch deletion ignored".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub enum Classification {
    Accepted(Box<PushEvent>),
    Ignored(IgnoreReason),
    Rejected { event_type: String },
}

/// Decide what to do with a verified delivery.
///
/// `ping` is acknowledged without looking at the body. A `push` body must be
/// JSON carrying a string `ref`, otherwise `MalformedPayload`.
pub fn classify(event_type: Option<&str>, body: &[u8], tracked_ref: &str) -> Result<Classification> {
    match event_type {
        Some("ping") => Ok(Classification::Ignored(IgnoreReason::Ping)),
        Some("push") => {
            let push: PushEvent = serde_json::from_slice(body)
                .map_err(|e| DeployError::MalformedPayload(e.to_string()))?;
            debug!(
                "Push event for '{}' on ref '{}'",
                push.repository_name(),
                push.reference
            );

            if push.reference != tracked_ref {
                return Ok(Classification::Ignored(IgnoreReason::BranchMismatch {
                    reference: push.reference,
                }));
            }
            if push.deleted {
                return Ok(Classification::Ignored(IgnoreReason::BranchDeleted));
            }
            Ok(Classification::Accepted(Box::new(push)))
        }
        Some(other) => Ok(Classification::Rejected {
            event_type: other.to_string(),
        }),
        None => Ok(Classification::Rejected {
            event_type: "(missing)".to_string(),
        }),
    }
}
