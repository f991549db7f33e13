use serde::{Deserialize, Serialize};
use std::{path::Path, path::PathBuf, time::Duration};

use crate::err::ConfigError;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub scheduler: SchedulerConfig,
    pub sandbox: SandboxConfig,
    pub verdict: VerdictConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Number of sandbox executions allowed to run at the same time
    pub workers: usize,

    /// How many times a job hitting an infrastructure error is re-queued
    /// before it gets escalated to the operator
    pub max_infra_retries: u32,

    /// Delay before an infrastructure failure is re-queued, in milliseconds
    pub retry_backoff_ms: u64,

    /// How often the reaper looks for submissions stuck in `Running`
    pub reaper_interval_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            workers: 4,
            max_infra_retries: 3,
            retry_backoff_ms: 1000,
            reaper_interval_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// The docker image every job runs in. It must provide the entry script.
    pub image: String,

    /// Where ephemeral job folders are created. Must be visible to the
    /// docker daemon under the same path.
    pub work_dir: PathBuf,

    /// The path the job folder is mounted at inside the container
    pub mount_point: String,

    /// The entry procedure, run with the mount point as working directory
    pub entry: Vec<String>,

    /// The user every container runs as
    pub docker_user: Option<String>,

    /// Memory ceiling of a job, in bytes
    pub mem_limit: i64,

    /// Process count ceiling of a job
    pub pids_limit: i64,

    /// Bytes of stdout kept from a job; the rest is dropped
    pub stdout_size_limit: usize,

    /// Bytes of stderr kept from a job; the rest is dropped
    pub stderr_size_limit: usize,

    pub min_timeout_secs: u64,
    pub max_timeout_secs: u64,

    /// Extra time granted to the isolation provider on top of the job's own
    /// timeout before the whole call is abandoned as an infrastructure error
    pub watchdog_grace_secs: u64,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        SandboxConfig {
            image: "riker-sandbox".into(),
            work_dir: default_work_dir(),
            mount_point: "/home/unprivileged".into(),
            entry: vec!["entry".into()],
            docker_user: None,
            mem_limit: 500 * 1024 * 1024,
            pids_limit: 30,
            stdout_size_limit: 1024 * 1024,
            stderr_size_limit: 64 * 1024,
            min_timeout_secs: 3,
            max_timeout_secs: 10,
            watchdog_grace_secs: 5,
        }
    }
}

fn default_work_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("riker")
        .join("jobs")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VerdictConfig {
    /// Maximum characters of a runtime error diagnostic kept in the verdict
    pub diagnostic_limit: usize,
}

impl Default for VerdictConfig {
    fn default() -> Self {
        VerdictConfig {
            diagnostic_limit: 1024,
        }
    }
}

impl Config {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Config::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Config, ConfigError> {
        let cfg: Config = toml::from_str(content)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.into()));
        if self.scheduler.workers == 0 {
            return invalid("scheduler.workers must be at least 1");
        }
        if self.sandbox.entry.is_empty() {
            return invalid("sandbox.entry must not be empty");
        }
        if self.sandbox.image.is_empty() {
            return invalid("sandbox.image must not be empty");
        }
        if self.sandbox.mem_limit <= 0 || self.sandbox.pids_limit <= 0 {
            return invalid("sandbox limits must be positive");
        }
        if self.sandbox.min_timeout_secs == 0
            || self.sandbox.min_timeout_secs > self.sandbox.max_timeout_secs
        {
            return invalid("sandbox timeout range must satisfy 0 < min <= max");
        }
        Ok(())
    }
}

impl SandboxConfig {
    /// Bound a submission's requested timeout to the configured range.
    pub fn clamp_timeout(&self, secs: u64) -> Duration {
        Duration::from_secs(secs.clamp(self.min_timeout_secs, self.max_timeout_secs))
    }

    pub fn watchdog_grace(&self) -> Duration {
        Duration::from_secs(self.watchdog_grace_secs)
    }
}
