use async_trait::async_trait;
use bytes::Bytes;
use derive_builder::Builder;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::lang::EntryCommand;

/// Name of the file holding the submitted source inside a job folder.
pub const PROGRAM_FILE: &str = "program";
/// Name of the file wired to the program's stdin inside a job folder.
pub const TESTINPUT_FILE: &str = "testinput";

/// The result returned by running a job inside an isolation provider.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ProcessOutput {
    pub ret_code: ExitStatus,
    pub stdout: Bytes,
    /// Set when stdout went past `stdout_size_limit` and was cut
    pub stdout_capped: bool,
    pub stderr: String,

    pub runned_inside: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub enum ExitStatus {
    ReturnCode(i64),
    Signal(u32),
    Timeout,
    Unknown,
}

/// One sandbox execution. Lives only as long as the worker handling it.
#[derive(Debug)]
pub struct SandboxJob {
    /// Label used for container names and logs
    pub label: String,
    /// The host folder holding `program` and `testinput`
    pub dir: PathBuf,
    pub entry: EntryCommand,
}

impl SandboxJob {
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

/// Some isolation mechanism that can run a job in a throwaway sandbox
#[async_trait]
pub trait IsolationProvider: Sync + Send {
    /// The name of this provider, used in run results
    fn name(&self) -> std::borrow::Cow<'static, str>;

    /// Run `job` to completion.
    ///
    /// Implementations must enforce `opt.timeout` themselves: when it expires
    /// every process of the job is killed and `ExitStatus::Timeout` returned.
    /// `Err(_)` is reserved for failures of the mechanism itself.
    async fn run(&self, job: &SandboxJob, opt: &CommandRunOptions) -> anyhow::Result<ProcessOutput>;
}

#[derive(Debug, Builder)]
#[builder(setter(into))]
pub struct CommandRunOptions {
    #[builder(default = "1024*1024")]
    pub stdout_size_limit: usize,

    #[builder(default = "64*1024")]
    pub stderr_size_limit: usize,

    #[builder(default = "500*1024*1024")]
    pub mem_limit: i64,

    #[builder(default = "30")]
    pub pids_limit: i64,

    pub timeout: Duration,
}
