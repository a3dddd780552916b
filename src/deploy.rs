//! Deployment orchestration: one pipeline at a time, run off the request task.

use std::io;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{error, info};

use crate::attempt::{AttemptStore, DeploymentAttempt};
use crate::config::{BusyPolicy, DeployMode, DeploymentConfig};
use crate::error::{DeployError, Result};
use crate::event::PushEvent;
use crate::pipeline::Pipeline;
use crate::report;

/// What the webhook handler gets back from `Deployer::submit`.
#[derive(Debug)]
pub enum Submission {
    /// Pipeline queued or running in the background.
    Started { attempt_id: String },
    /// Pipeline already finished (`DeployMode::Wait`).
    Finished(DeploymentAttempt),
}

#[derive(Clone)]
pub struct Deployer {
    pipeline: Arc<Pipeline>,
    mode: DeployMode,
    busy_policy: BusyPolicy,
    // Guards the working copy and the supervised process.
    execution_lock: Arc<Mutex<()>>,
    attempts: Arc<Mutex<AttemptStore>>,
}

impl Deployer {
    pub fn new(pipeline: Pipeline, mode: DeployMode, busy_policy: BusyPolicy, history_size: usize) -> Self {
        Self {
            pipeline: Arc::new(pipeline),
            mode,
            busy_policy,
            execution_lock: Arc::new(Mutex::new(())),
            attempts: Arc::new(Mutex::new(AttemptStore::new(history_size))),
        }
    }

    pub fn from_config(config: &DeploymentConfig) -> Self {
        Self::new(
            Pipeline::from_config(config),
            config.mode,
            config.busy_policy,
            config.history_size,
        )
    }

    pub fn attempts(&self) -> &Arc<Mutex<AttemptStore>> {
        &self.attempts
    }

    /// Start a deployment for an accepted push.
    ///
    /// The pipeline always runs in its own task so a dropped HTTP connection
    /// cannot abort it half-way. With `BusyPolicy::Reject` the execution lock
    /// is taken here, before anything is recorded.
    pub async fn submit(&self, push: &PushEvent, delivery_id: Option<String>) -> Result<Submission> {
        let reserved = match self.busy_policy {
            BusyPolicy::Reject => Some(
                self.execution_lock
                    .clone()
                    .try_lock_owned()
                    .map_err(|_| DeployError::DeploymentBusy)?,
            ),
            BusyPolicy::Queue => None,
        };

        let attempt = DeploymentAttempt::from_push(push, delivery_id, self.pipeline.commands());
        let attempt_id = attempt.id.clone();
        self.attempts.lock().await.add(attempt.clone());

        info!(
            "Created deployment {} for '{}' branch '{}' (commit {})",
            attempt_id,
            attempt.repository,
            attempt.branch,
            attempt.commit_sha.as_deref().unwrap_or("unknown")
        );

        let deployer = self.clone();
        let handle = tokio::spawn(async move { deployer.execute(attempt, reserved).await });

        match self.mode {
            DeployMode::Background => Ok(Submission::Started { attempt_id }),
            DeployMode::Wait => match handle.await {
                Ok(attempt) => Ok(Submission::Finished(attempt)),
                Err(e) => {
                    error!("Deployment task {} did not complete: {}", attempt_id, e);
                    Err(DeployError::Io(io::Error::other(format!(
                        "deployment task failed: {}",
                        e
                    ))))
                }
            },
        }
    }

    async fn execute(
        &self,
        mut attempt: DeploymentAttempt,
        reserved: Option<OwnedMutexGuard<()>>,
    ) -> DeploymentAttempt {
        // Only one pipeline at a time; queued attempts wait here in FIFO order.
        let guard = match reserved {
            Some(guard) => guard,
            None => self.execution_lock.clone().lock_owned().await,
        };

        attempt.mark_running();
        self.record(&attempt).await;
        info!(
            "Deployment {} - starting pipeline in '{}'",
            attempt.id,
            self.pipeline.working_directory().display()
        );

        let result = self.pipeline.run(&deploy_env(&attempt)).await;
        drop(guard);

        match result {
            Ok(output) => attempt.mark_success(output.exit_code, output.output),
            Err(failure) => {
                attempt.mark_failed(failure.exit_code, failure.output, failure.error.to_string())
            }
        }
        self.record(&attempt).await;
        report::log_attempt(&attempt);
        attempt
    }

    async fn record(&self, attempt: &DeploymentAttempt) {
        let mut store = self.attempts.lock().await;
        store.update(&attempt.id, |stored| *stored = attempt.clone());
    }
}

/// Push details exported to the pipeline stages.
fn deploy_env(attempt: &DeploymentAttempt) -> Vec<(String, String)> {
    let mut env = vec![
        ("DEPLOY_ATTEMPT_ID".to_string(), attempt.id.clone()),
        ("DEPLOY_BRANCH".to_string(), attempt.branch.clone()),
        ("DEPLOY_REPOSITORY".to_string(), attempt.repository.clone()),
    ];
    if let Some(sha) = &attempt.commit_sha {
        env.push(("DEPLOY_COMMIT_SHA".to_string(), sha.clone()));
    }
    env
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attempt::AttemptStatus;
    use crate::pipeline::Stage;
    use std::path::Path;
    use std::time::Duration;

    fn push() -> PushEvent {
        serde_json::from_value(serde_json::json!({
            "ref": "refs/heads/main",
            "after": "0a1b2c",
            "repository": { "full_name": "owner/site" }
        }))
        .unwrap()
    }

    fn deployer(dir: &Path, command: &str, mode: DeployMode, policy: BusyPolicy) -> Deployer {
        let pipeline = Pipeline::new(dir, vec![Stage::new("deploy", command)])
            .with_timeout(Duration::from_secs(20));
        Deployer::new(pipeline, mode, policy, 10)
    }

    async fn wait_until_finished(deployer: &Deployer, expected: usize) -> Vec<DeploymentAttempt> {
        for _ in 0..200 {
            let recent = deployer.attempts().lock().await.recent(expected);
            if recent.len() == expected && recent.iter().all(|a| a.status.is_finished()) {
                return recent;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("deployments did not finish in time");
    }

    #[tokio::test]
    async fn wait_mode_returns_finished_attempt() {
        let dir = tempfile::tempdir().unwrap();
        let deployer = deployer(
            dir.path(),
            "echo \"$DEPLOY_BRANCH $DEPLOY_COMMIT_SHA\" > deployed",
            DeployMode::Wait,
            BusyPolicy::Queue,
        );

        let Submission::Finished(attempt) = deployer.submit(&push(), None).await.unwrap() else {
            panic!("expected a finished attempt");
        };
        assert_eq!(attempt.status, AttemptStatus::Success);
        assert_eq!(attempt.exit_code, Some(0));
        let deployed = std::fs::read_to_string(dir.path().join("deployed")).unwrap();
        assert_eq!(deployed, "main 0a1b2c\n");
    }

    #[tokio::test]
    async fn failed_pipeline_marks_attempt_failed() {
        let dir = tempfile::tempdir().unwrap();
        let deployer = deployer(dir.path(), "exit 7", DeployMode::Wait, BusyPolicy::Queue);

        let Submission::Finished(attempt) = deployer.submit(&push(), None).await.unwrap() else {
            panic!("expected a finished attempt");
        };
        assert_eq!(attempt.status, AttemptStatus::Failed);
        assert_eq!(attempt.exit_code, Some(7));
        assert!(attempt.error.unwrap().contains("deploy"));
    }

    #[tokio::test]
    async fn queued_deployments_never_overlap() {
        let dir = tempfile::tempdir().unwrap();
        let command = "if [ -e running ]; then echo overlap >> overlap.log; fi; \
                       touch running; echo start >> order.log; sleep 0.3; \
                       echo end >> order.log; rm running";
        let deployer = deployer(dir.path(), command, DeployMode::Background, BusyPolicy::Queue);

        let push = push();
        let (a, b) = tokio::join!(deployer.submit(&push, None), deployer.submit(&push, None));
        assert!(matches!(a.unwrap(), Submission::Started { .. }));
        assert!(matches!(b.unwrap(), Submission::Started { .. }));

        let attempts = wait_until_finished(&deployer, 2).await;
        assert!(attempts.iter().all(|a| a.status == AttemptStatus::Success));
        assert!(!dir.path().join("overlap.log").exists());
        let order = std::fs::read_to_string(dir.path().join("order.log")).unwrap();
        assert_eq!(order, "start\nend\nstart\nend\n");
    }

    #[tokio::test]
    async fn backlog_beyond_history_keeps_running_attempt_visible() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = Pipeline::new(dir.path(), vec![Stage::new("deploy", "sleep 0.3")])
            .with_timeout(Duration::from_secs(20));
        let deployer = Deployer::new(pipeline, DeployMode::Background, BusyPolicy::Queue, 1);

        for _ in 0..3 {
            deployer.submit(&push(), None).await.unwrap();
        }

        let mut seen = None;
        for _ in 0..100 {
            let store = deployer.attempts().lock().await;
            if let Some(current) = store.current() {
                seen = Some((current.id.clone(), store.queued_count()));
                break;
            }
            drop(store);
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let (_, queued) = seen.expect("no attempt was reported as running");
        assert_eq!(queued, 2);

        let attempts = wait_until_finished(&deployer, 3).await;
        assert!(attempts.iter().all(|a| a.status == AttemptStatus::Success));
        assert_eq!(deployer.attempts().lock().await.total_recorded(), 3);
    }

    #[tokio::test]
    async fn reject_policy_refuses_while_busy() {
        let dir = tempfile::tempdir().unwrap();
        let deployer = deployer(dir.path(), "sleep 0.5", DeployMode::Background, BusyPolicy::Reject);

        let first = deployer.submit(&push(), None).await.unwrap();
        assert!(matches!(first, Submission::Started { .. }));
        let second = deployer.submit(&push(), None).await.unwrap_err();
        assert!(matches!(second, DeployError::DeploymentBusy));

        wait_until_finished(&deployer, 1).await;
        assert_eq!(deployer.attempts().lock().await.total_recorded(), 1);
        assert!(deployer.submit(&push(), None).await.is_ok());
    }
}
