//! Deployment pipeline: fetch, install, build and restart as one subprocess

use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::config::{
    DEFAULT_MAX_OUTPUT_BYTES, DEFAULT_SEARCH_PATH, DEFAULT_TIMEOUT_SECS, DeploymentConfig,
    shell_quote,
};
use crate::error::DeployError;

const SHELL: &str = "/bin/sh";
const STAGE_MARKER: &str = "==> stage ";
const READ_CHUNK: usize = 8 * 1024;
const DRAIN_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stage {
    pub name: String,
    pub command: String,
}

impl Stage {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
        }
    }
}

/// Result of a pipeline that ran every stage successfully.
#[derive(Debug)]
pub struct PipelineOutput {
    pub exit_code: Option<i32>,
    pub output: String,
}

/// A failed run, with whatever output was captured before it stopped.
#[derive(Debug)]
pub struct PipelineFailure {
    pub error: DeployError,
    pub exit_code: Option<i32>,
    pub output: String,
}

impl PipelineFailure {
    fn new(error: DeployError, exit_code: Option<i32>, output: String) -> Self {
        Self {
            error,
            exit_code,
            output,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Pipeline {
    working_directory: PathBuf,
    stages: Vec<Stage>,
    search_path: String,
    home_directory: Option<PathBuf>,
    timeout: Duration,
    max_output_bytes: usize,
}

impl Pipeline {
    pub fn new(working_directory: impl Into<PathBuf>, stages: Vec<Stage>) -> Self {
        Self {
            working_directory: working_directory.into(),
            stages,
            search_path: DEFAULT_SEARCH_PATH.to_string(),
            home_directory: None,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
        }
    }

    /// The standard fetch, install, build, restart sequence.
    pub fn from_config(config: &DeploymentConfig) -> Self {
        let stages = vec![
            Stage::new("fetch", config.fetch_command()),
            Stage::new("install", config.install_command()),
            Stage::new("build", config.build_command()),
            Stage::new("restart", config.restart_command()),
        ];
        let pipeline = Self::new(config.working_directory.clone(), stages)
            .with_search_path(config.search_path.clone())
            .with_timeout(Duration::from_secs(config.command_timeout_seconds))
            .with_max_output_bytes(config.max_output_bytes);
        match &config.home_directory {
            Some(home) => pipeline.with_home_directory(home.clone()),
            None => pipeline,
        }
    }

    pub fn with_search_path(mut self, search_path: impl Into<String>) -> Self {
        self.search_path = search_path.into();
        self
    }

    pub fn with_home_directory(mut self, home: impl Into<PathBuf>) -> Self {
        self.home_directory = Some(home.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_output_bytes(mut self, max_output_bytes: usize) -> Self {
        self.max_output_bytes = max_output_bytes;
        self
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn working_directory(&self) -> &Path {
        &self.working_directory
    }

    /// Human-readable commands, in execution order.
    pub fn commands(&self) -> Vec<String> {
        self.stages
            .iter()
            .map(|s| format!("{}: {}", s.name, s.command))
            .collect()
    }

    /// Shell script run by the single subprocess. Each stage runs in its own
    /// subshell and a non-zero status exits the script with that status, so
    /// later stages never start. stderr is folded into stdout.
    ///
    /// Stage markers after the first start with a newline so they begin a
    /// line even when the previous stage's output did not end with one.
    pub fn script(&self) -> String {
        let mut script = String::from("exec 2>&1\n");
        for (index, stage) in self.stages.iter().enumerate() {
            let format = if index == 0 { "'%s%s\\n'" } else { "'\\n%s%s\\n'" };
            script.push_str(&format!(
                "printf {} {} {}\n( {}\n) || exit $?\n",
                format,
                shell_quote(STAGE_MARKER),
                shell_quote(&stage.name),
                stage.command
            ));
        }
        script.push_str("exit 0\n");
        script
    }

    /// Run every stage in order. `extra_env` is exported to the stages on top
    /// of the fixed PATH/HOME environment; nothing else is inherited.
    pub async fn run(&self, extra_env: &[(String, String)]) -> Result<PipelineOutput, PipelineFailure> {
        if !self.working_directory.is_dir() {
            let err = io::Error::new(
                io::ErrorKind::NotFound,
                format!(
                    "working directory '{}' does not exist",
                    self.working_directory.display()
                ),
            );
            return Err(PipelineFailure::new(DeployError::Spawn(err), None, String::new()));
        }

        for stage in &self.stages {
            info!(
                "Running (cwd = '{}'): [{}] {}",
                self.working_directory.display(),
                stage.name,
                stage.command
            );
        }

        let mut command = Command::new(SHELL);
        command
            .arg("-c")
            .arg(self.script())
            .current_dir(&self.working_directory)
            .env_clear()
            .env("PATH", &self.search_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .process_group(0)
            .kill_on_drop(true);
        if let Some(home) = &self.home_directory {
            command.env("HOME", home);
        }
        for (key, value) in extra_env {
            command.env(key, value);
        }

        let mut child = command
            .spawn()
            .map_err(|e| PipelineFailure::new(DeployError::Spawn(e), None, String::new()))?;
        let pid = child.id();
        debug!("Pipeline started with pid {:?}", pid);

        let Some(mut stdout) = child.stdout.take() else {
            terminate(&mut child, pid).await;
            let err = io::Error::other("pipeline stdout was not captured");
            return Err(PipelineFailure::new(DeployError::Io(err), None, String::new()));
        };

        let mut buf = Vec::new();
        let limit = self.max_output_bytes;
        let finished = tokio::time::timeout(self.timeout, async {
            let read = capture(&mut stdout, limit, &mut buf);
            tokio::pin!(read);
            tokio::select! {
                captured = &mut read => {
                    if !captured? {
                        return io::Result::Ok(None);
                    }
                    child.wait().await.map(Some)
                }
                status = child.wait() => {
                    let status = status?;
                    // A detached process may still hold the pipe open; stop
                    // reading once the shell is gone and the buffer drains.
                    match tokio::time::timeout(DRAIN_GRACE, &mut read).await {
                        Ok(Ok(false)) => return Ok(None),
                        Ok(Err(e)) => return Err(e),
                        Ok(Ok(true)) => {}
                        Err(_) => debug!("Pipeline stdout still open after the shell exited"),
                    }
                    Ok(Some(status))
                }
            }
        })
        .await;

        match finished {
            Ok(Ok(Some(status))) => {
                let output = String::from_utf8_lossy(&buf).into_owned();
                if status.success() {
                    Ok(PipelineOutput {
                        exit_code: status.code(),
                        output,
                    })
                } else {
                    let stage = failed_stage(&output).unwrap_or("unknown").to_string();
                    Err(PipelineFailure::new(
                        DeployError::StageFailed {
                            stage,
                            exit_code: status.code(),
                        },
                        status.code(),
                        output,
                    ))
                }
            }
            Ok(Ok(None)) => {
                warn!("Pipeline output exceeded {} bytes, terminating", limit);
                terminate(&mut child, pid).await;
                let output = String::from_utf8_lossy(&buf).into_owned();
                Err(PipelineFailure::new(
                    DeployError::OutputOverflow { limit },
                    None,
                    output,
                ))
            }
            Ok(Err(e)) => {
                terminate(&mut child, pid).await;
                let output = String::from_utf8_lossy(&buf).into_owned();
                Err(PipelineFailure::new(DeployError::Io(e), None, output))
            }
            Err(_) => {
                warn!(
                    "Pipeline exceeded {}s timeout, terminating",
                    self.timeout.as_secs()
                );
                terminate(&mut child, pid).await;
                let output = String::from_utf8_lossy(&buf).into_owned();
                Err(PipelineFailure::new(
                    DeployError::Timeout(self.timeout),
                    None,
                    output,
                ))
            }
        }
    }
}

/// Read `reader` to EOF into `buf`. Returns false as soon as more than
/// `limit` bytes arrive; `buf` then holds the first `limit` bytes.
async fn capture<R>(reader: &mut R, limit: usize, buf: &mut Vec<u8>) -> io::Result<bool>
where
    R: AsyncRead + Unpin,
{
    let mut chunk = [0u8; READ_CHUNK];
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            return Ok(true);
        }
        if buf.len() + n > limit {
            let room = limit - buf.len();
            buf.extend_from_slice(&chunk[..room]);
            return Ok(false);
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

/// Kill the whole process group led by the pipeline shell, then reap it.
async fn terminate(child: &mut Child, pid: Option<u32>) {
    if let Some(pid) = pid.and_then(|p| i32::try_from(p).ok()) {
        // ESRCH just means everything already exited
        if let Err(e) = killpg(Pid::from_raw(pid), Signal::SIGKILL) {
            debug!("killpg({}) failed: {}", pid, e);
        }
    }
    if let Err(e) = child.wait().await {
        warn!("Failed to reap pipeline process: {}", e);
    }
}

/// Name of the last stage that announced itself in `output`.
fn failed_stage(output: &str) -> Option<&str> {
    output
        .lines()
        .rev()
        .find_map(|line| line.strip_prefix(STAGE_MARKER))
}

/// Last `max_bytes` of `output`, cut on a char boundary.
pub fn output_tail(output: &str, max_bytes: usize) -> &str {
    if output.len() <= max_bytes {
        return output;
    }
    let mut start = output.len() - max_bytes;
    while !output.is_char_boundary(start) {
        start += 1;
    }
    &output[start..]
}
