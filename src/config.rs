//! Process-wide deployment configuration
//!
//! Loaded once at startup from an optional TOML file, then overridden field by
//! field from the environment. Immutable afterwards.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::{DeployError, Result};

pub const DEFAULT_CONFIG_PATH: &str = "deploy_config.toml";
pub const DEFAULT_BIND_ADDRESS: &str = "127.0.0.1:8888";
pub const DEFAULT_BRANCH: &str = "main";
pub const DEFAULT_REMOTE: &str = "origin";
pub const DEFAULT_RESTART_TARGET: &str = "site";
pub const DEFAULT_TIMEOUT_SECS: u64 = 600;
/// Maximum combined stdout/stderr captured from one pipeline run (1MB)
pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 1024 * 1024;
/// GitHub caps webhook payloads at 25MB
pub const DEFAULT_MAX_PAYLOAD_BYTES: usize = 25 * 1024 * 1024;
pub const DEFAULT_SEARCH_PATH: &str = "/usr/local/bin:/usr/bin:/bin";
pub const DEFAULT_HISTORY_SIZE: usize = 24;

/// Whether the webhook response waits for the pipeline to finish.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DeployMode {
    /// Acknowledge immediately and report the outcome through the logs.
    #[default]
    Background,
    /// Hold the response until the pipeline succeeds or fails.
    Wait,
}

/// What to do with an accepted push while another deployment is in flight.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BusyPolicy {
    /// Run strictly after the current deployment completes.
    #[default]
    Queue,
    /// Refuse with `DeploymentBusy`.
    Reject,
}

impl DeployMode {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "background" => Some(DeployMode::Background),
            "wait" => Some(DeployMode::Wait),
            _ => None,
        }
    }
}

impl BusyPolicy {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "queue" => Some(BusyPolicy::Queue),
            "reject" => Some(BusyPolicy::Reject),
            _ => None,
        }
    }
}

/// Shell commands for each pipeline stage. Unset stages use the built-in
/// defaults derived from the rest of the configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StageCommands {
    pub fetch: Option<String>,
    pub install: Option<String>,
    pub build: Option<String>,
    pub restart: Option<String>,
}

#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct DeploymentConfig {
    pub bind_address: String,
    pub shared_secret: Option<String>,
    pub tracked_branch: String,
    pub remote: String,
    pub working_directory: PathBuf,
    pub restart_target_name: String,
    pub command_timeout_seconds: u64,
    pub max_output_bytes: usize,
    pub max_payload_bytes: usize,
    /// PATH handed to the pipeline. Must include the node/npm and pm2 install
    /// locations, the service's own environment is not inherited.
    pub search_path: String,
    pub home_directory: Option<PathBuf>,
    pub mode: DeployMode,
    pub busy_policy: BusyPolicy,
    pub log_directory: Option<PathBuf>,
    pub history_size: usize,
    pub commands: StageCommands,
}

impl Default for DeploymentConfig {
    fn default() -> Self {
        Self {
            bind_address: DEFAULT_BIND_ADDRESS.to_string(),
            shared_secret: None,
            tracked_branch: DEFAULT_BRANCH.to_string(),
            remote: DEFAULT_REMOTE.to_string(),
            working_directory: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            restart_target_name: DEFAULT_RESTART_TARGET.to_string(),
            command_timeout_seconds: DEFAULT_TIMEOUT_SECS,
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
            max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
            search_path: DEFAULT_SEARCH_PATH.to_string(),
            home_directory: std::env::var_os("HOME").map(PathBuf::from),
            mode: DeployMode::default(),
            busy_policy: BusyPolicy::default(),
            log_directory: None,
            history_size: DEFAULT_HISTORY_SIZE,
            commands: StageCommands::default(),
        }
    }
}

// Hand-written so the secret never ends up in a log line.
impl fmt::Debug for DeploymentConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeploymentConfig")
            .field("bind_address", &self.bind_address)
            .field("shared_secret", &self.secret_state())
            .field("tracked_branch", &self.tracked_branch)
            .field("remote", &self.remote)
            .field("working_directory", &self.working_directory)
            .field("restart_target_name", &self.restart_target_name)
            .field("command_timeout_seconds", &self.command_timeout_seconds)
            .field("max_output_bytes", &self.max_output_bytes)
            .field("max_payload_bytes", &self.max_payload_bytes)
            .field("search_path", &self.search_path)
            .field("home_directory", &self.home_directory)
            .field("mode", &self.mode)
            .field("busy_policy", &self.busy_policy)
            .field("log_directory", &self.log_directory)
            .field("history_size", &self.history_size)
            .field("commands", &self.commands)
            .finish()
    }
}

impl DeploymentConfig {
    /// The configured secret, if it is present and non-empty.
    pub fn secret(&self) -> Option<&str> {
        self.shared_secret.as_deref().filter(|s| !s.is_empty())
    }

    /// Masked description of the secret, safe to log.
    pub fn secret_state(&self) -> &'static str {
        if self.secret().is_some() {
            "<set>"
        } else {
            "<unset>"
        }
    }

    /// Full ref name that push events must target, e.g. `refs/heads/main`.
    pub fn tracked_ref(&self) -> String {
        format!("refs/heads/{}", self.tracked_branch)
    }

    pub fn fetch_command(&self) -> String {
        self.commands.fetch.clone().unwrap_or_else(|| {
            format!(
                "git pull --ff-only {} {}",
                shell_quote(&self.remote),
                shell_quote(&self.tracked_branch)
            )
        })
    }

    pub fn install_command(&self) -> String {
        self.commands
            .install
            .clone()
            .unwrap_or_else(|| "npm install".to_string())
    }

    pub fn build_command(&self) -> String {
        self.commands
            .build
            .clone()
            .unwrap_or_else(|| "npm run build".to_string())
    }

    pub fn restart_command(&self) -> String {
        self.commands
            .restart
            .clone()
            .unwrap_or_else(|| format!("pm2 restart {}", shell_quote(&self.restart_target_name)))
    }

    /// Override fields from environment-style variables.
    /// `lookup` is normally `std::env::var(..).ok()`.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("GITHUB_WEBHOOK_SECRET") {
            self.shared_secret = Some(v);
        }
        if let Some(v) = lookup("TRACKED_BRANCH") {
            self.tracked_branch = v;
        }
        if let Some(v) = lookup("DEPLOY_REMOTE") {
            self.remote = v;
        }
        if let Some(v) = lookup("WORKING_DIRECTORY") {
            self.working_directory = PathBuf::from(v);
        }
        if let Some(v) = lookup("RESTART_TARGET") {
            self.restart_target_name = v;
        }
        if let Some(v) = lookup("COMMAND_TIMEOUT_SECONDS") {
            self.command_timeout_seconds = parse_number("COMMAND_TIMEOUT_SECONDS", &v)?;
        }
        if let Some(v) = lookup("MAX_OUTPUT_BYTES") {
            self.max_output_bytes = parse_number("MAX_OUTPUT_BYTES", &v)?;
        }
        if let Some(v) = lookup("MAX_PAYLOAD_BYTES") {
            self.max_payload_bytes = parse_number("MAX_PAYLOAD_BYTES", &v)?;
        }
        if let Some(v) = lookup("DEPLOY_PATH") {
            self.search_path = v;
        }
        if let Some(v) = lookup("DEPLOY_HOME") {
            self.home_directory = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("DEPLOY_MODE") {
            self.mode = DeployMode::parse(&v).ok_or_else(|| {
                DeployError::Config(format!("DEPLOY_MODE must be 'background' or 'wait', got '{}'", v))
            })?;
        }
        if let Some(v) = lookup("BUSY_POLICY") {
            self.busy_policy = BusyPolicy::parse(&v).ok_or_else(|| {
                DeployError::Config(format!("BUSY_POLICY must be 'queue' or 'reject', got '{}'", v))
            })?;
        }
        if let Some(v) = lookup("BIND_ADDRESS") {
            self.bind_address = v;
        }
        if let Some(v) = lookup("LOG_DIRECTORY") {
            self.log_directory = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("HISTORY_SIZE") {
            self.history_size = parse_number("HISTORY_SIZE", &v)?;
        }
        Ok(())
    }

    /// Reject values the pipeline cannot run with. A missing secret is not an
    /// error here: the endpoint refuses requests instead.
    pub fn validate(&self) -> Result<()> {
        if self.tracked_branch.trim().is_empty() {
            return Err(DeployError::Config("tracked_branch must not be empty".into()));
        }
        if self.restart_target_name.trim().is_empty() {
            return Err(DeployError::Config(
                "restart_target_name must not be empty".into(),
            ));
        }
        if self.command_timeout_seconds == 0 {
            return Err(DeployError::Config(
                "command_timeout_seconds must be greater than zero".into(),
            ));
        }
        if self.max_output_bytes == 0 {
            return Err(DeployError::Config(
                "max_output_bytes must be greater than zero".into(),
            ));
        }
        if self.max_payload_bytes == 0 {
            return Err(DeployError::Config(
                "max_payload_bytes must be greater than zero".into(),
            ));
        }
        if self.history_size == 0 {
            return Err(DeployError::Config("history_size must be greater than zero".into()));
        }
        Ok(())
    }
}

fn parse_number<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| DeployError::Config(format!("{} must be a number, got '{}'", name, value)))
}

/// Quote a value for use as a single POSIX shell word.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Parse a TOML configuration string.
pub fn parse_config(config_str: &str) -> Result<DeploymentConfig> {
    Ok(toml::from_str(config_str)?)
}

/// Load the configuration file (if any), apply environment overrides and validate.
///
/// A missing file is only tolerated when `explicit` is false, i.e. when the
/// default path was used.
pub fn load_config<F>(path: &Path, explicit: bool, lookup: F) -> Result<DeploymentConfig>
where
    F: Fn(&str) -> Option<String>,
{
    let mut config = match std::fs::read_to_string(path) {
        Ok(config_str) => parse_config(&config_str).map_err(|e| {
            DeployError::Config(format!("Failed to parse config file '{}': {}", path.display(), e))
        })?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound && !explicit => {
            DeploymentConfig::default()
        }
        Err(e) => {
            return Err(DeployError::Config(format!(
                "Failed to read config file '{}': {}",
                path.display(),
                e
            )));
        }
    };

    config.apply_env_overrides(lookup)?;
    config.validate()?;
    Ok(config)
}
