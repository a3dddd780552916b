use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use uuid::Uuid;

use crate::event::PushEvent;

/// Status of one deployment attempt
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AttemptStatus {
    Queued,
    Running,
    Success,
    Failed,
}

impl AttemptStatus {
    pub fn is_finished(self) -> bool {
        matches!(self, AttemptStatus::Success | AttemptStatus::Failed)
    }
}

/// One accepted push and the pipeline run it triggered.
///
/// Captured output stays server-side: it is logged but never serialized into
/// an HTTP response.
#[derive(Debug, Clone, Serialize)]
pub struct DeploymentAttempt {
    pub id: String,
    pub repository: String,
    pub branch: String,
    pub commit_sha: Option<String>,
    pub commit_message: Option<String>,
    pub pusher: Option<String>,
    pub delivery_id: Option<String>,
    pub commands: Vec<String>,
    pub status: AttemptStatus,
    pub queued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    #[serde(skip)]
    pub output: String,
    pub error: Option<String>,
}

impl DeploymentAttempt {
    /// Create a new attempt in Queued status
    pub fn from_push(push: &PushEvent, delivery_id: Option<String>, commands: Vec<String>) -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            repository: push.repository_name().to_string(),
            branch: push.branch().to_string(),
            commit_sha: push.after.clone(),
            commit_message: push.commit_summary(),
            pusher: push.pusher_name().map(String::from),
            delivery_id,
            commands,
            status: AttemptStatus::Queued,
            queued_at: Utc::now(),
            started_at: None,
            completed_at: None,
            exit_code: None,
            output: String::new(),
            error: None,
        }
    }

    pub fn mark_running(&mut self) {
        self.status = AttemptStatus::Running;
        self.started_at = Some(Utc::now());
    }

    pub fn mark_success(&mut self, exit_code: Option<i32>, output: String) {
        self.status = AttemptStatus::Success;
        self.completed_at = Some(Utc::now());
        self.exit_code = exit_code;
        self.output = output;
    }

    pub fn mark_failed(&mut self, exit_code: Option<i32>, output: String, error: String) {
        self.status = AttemptStatus::Failed;
        self.completed_at = Some(Utc::now());
        self.exit_code = exit_code;
        self.output = output;
        self.error = Some(error);
    }

    /// Wall-clock run time, once the attempt has started and finished.
    pub fn duration_ms(&self) -> Option<i64> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds()),
            _ => None,
        }
    }
}

/// Bounded in-memory history of attempts, newest last.
pub struct AttemptStore {
    attempts: VecDeque<DeploymentAttempt>,
    max_attempts: usize,
    total_recorded: u64,
}

impl AttemptStore {
    pub fn new(max_attempts: usize) -> Self {
        Self {
            attempts: VecDeque::with_capacity(max_attempts),
            max_attempts: max_attempts.max(1),
            total_recorded: 0,
        }
    }

    /// Add an attempt, evicting the oldest finished ones when full.
    ///
    /// Queued and running attempts are never evicted, so the store may hold
    /// more than `max_attempts` while a backlog is waiting.
    pub fn add(&mut self, attempt: DeploymentAttempt) {
        self.attempts.push_back(attempt);
        self.total_recorded += 1;
        while self.attempts.len() > self.max_attempts {
            let Some(oldest_finished) = self.attempts.iter().position(|a| a.status.is_finished())
            else {
                break;
            };
            self.attempts.remove(oldest_finished);
        }
    }

    pub fn update<F>(&mut self, id: &str, f: F) -> Option<DeploymentAttempt>
    where
        F: FnOnce(&mut DeploymentAttempt),
    {
        let attempt = self.attempts.iter_mut().find(|a| a.id == id)?;
        f(attempt);
        Some(attempt.clone())
    }

    pub fn current(&self) -> Option<&DeploymentAttempt> {
        self.attempts
            .iter()
            .find(|a| a.status == AttemptStatus::Running)
    }

    pub fn queued_count(&self) -> usize {
        self.attempts
            .iter()
            .filter(|a| a.status == AttemptStatus::Queued)
            .count()
    }

    /// Most recent attempts, newest first.
    pub fn recent(&self, limit: usize) -> Vec<DeploymentAttempt> {
        self.attempts.iter().rev().take(limit).cloned().collect()
    }

    /// Number of attempts ever recorded, including evicted ones.
    pub fn total_recorded(&self) -> u64 {
        self.total_recorded
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn push() -> PushEvent {
        serde_json::from_value(serde_json::json!({
            "ref": "refs/heads/main",
            "after": "abc123",
            "repository": { "full_name": "owner/site" }
        }))
        .unwrap()
    }

    fn attempt() -> DeploymentAttempt {
        DeploymentAttempt::from_push(&push(), Some("delivery-1".into()), vec!["git pull".into()])
    }

    fn contains(store: &AttemptStore, id: &str) -> bool {
        store.recent(usize::MAX).iter().any(|a| a.id == id)
    }

    #[test]
    fn new_attempt_is_queued() {
        let attempt = attempt();
        assert_eq!(attempt.status, AttemptStatus::Queued);
        assert_eq!(attempt.branch, "main");
        assert_eq!(attempt.repository, "owner/site");
        assert_eq!(attempt.commit_sha.as_deref(), Some("abc123"));
        assert!(attempt.started_at.is_none());
    }

    #[test]
    fn lifecycle_records_timestamps() {
        let mut attempt = attempt();
        attempt.mark_running();
        attempt.mark_failed(Some(1), "boom".into(), "Stage 'fetch' failed".into());
        assert_eq!(attempt.status, AttemptStatus::Failed);
        assert_eq!(attempt.exit_code, Some(1));
        assert!(attempt.duration_ms().is_some());
        assert!(attempt.completed_at >= attempt.started_at);
    }

    #[test]
    fn output_is_not_serialized() {
        let mut attempt = attempt();
        attempt.mark_success(Some(0), "/home/deploy/secret-path".into());
        let json = serde_json::to_string(&attempt).unwrap();
        assert!(!json.contains("secret-path"));
        assert!(json.contains("\"status\":\"success\""));
    }

    #[test]
    fn store_evicts_oldest_finished_first() {
        let mut store = AttemptStore::new(2);
        let mut first = attempt();
        first.mark_running();
        let first_id = first.id.clone();
        let mut second = attempt();
        second.mark_success(Some(0), String::new());
        let second_id = second.id.clone();

        store.add(first);
        store.add(second);
        store.add(attempt());

        assert!(contains(&store, &first_id));
        assert!(!contains(&store, &second_id));
        assert_eq!(store.total_recorded(), 3);
        assert_eq!(store.current().map(|a| a.id.clone()), Some(first_id));
    }

    #[test]
    fn backlog_never_evicts_pending_attempts() {
        let mut store = AttemptStore::new(2);
        let mut running = attempt();
        running.mark_running();
        let running_id = running.id.clone();

        store.add(running);
        store.add(attempt());
        store.add(attempt());

        assert_eq!(store.recent(usize::MAX).len(), 3);
        assert_eq!(store.current().map(|a| a.id.clone()), Some(running_id.clone()));
        assert_eq!(store.queued_count(), 2);

        let finished = store
            .update(&running_id, |a| a.mark_success(Some(0), String::new()))
            .unwrap();
        assert_eq!(finished.status, AttemptStatus::Success);

        // Only the finished attempt is dropped on the next add.
        store.add(attempt());
        assert!(!contains(&store, &running_id));
        assert_eq!(store.recent(usize::MAX).len(), 3);
        assert_eq!(store.queued_count(), 3);
    }

    #[test]
    fn update_and_recent() {
        let mut store = AttemptStore::new(10);
        let a = attempt();
        let id = a.id.clone();
        store.add(a);
        store.add(attempt());
        assert_eq!(store.queued_count(), 2);

        let updated = store.update(&id, |a| a.mark_running()).unwrap();
        assert_eq!(updated.status, AttemptStatus::Running);
        assert_eq!(store.queued_count(), 1);

        let recent = store.recent(1);
        assert_eq!(recent.len(), 1);
        assert_ne!(recent[0].id, id);
        assert!(store.update("missing", |a| a.mark_running()).is_none());
    }
}
