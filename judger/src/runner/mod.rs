//! Running one untrusted program inside an isolation provider.
//!
//! This module only produces raw outcomes. Turning them into verdicts is the
//! job of [`crate::verdict`].

use std::{sync::Arc, time::Duration};

use anyhow::Context;
use bytes::Bytes;

use crate::{config::SandboxConfig, err::ExecError, lang, verdict::normalize_output};

use self::{
    model::{CommandRunOptionsBuilder, ExitStatus, ProcessOutput, SandboxJob},
    util::signal_from_code,
    workspace::JobDir,
};

pub mod exec;
pub mod model;
mod util;
pub mod workspace;

pub use exec::DockerProvider;
pub use model::IsolationProvider;

/// A successful run: the program exited with code 0 within its time limit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionResult {
    /// Captured stdout with at most one trailing newline removed
    pub stdout: Bytes,
    pub ret_code: ExitStatus,
}

/// Runs a single `(language, source, stdin, timeout)` job to a raw outcome.
///
/// Every call gets its own job folder and its own sandbox; nothing is shared
/// between calls, so one executor may serve any number of concurrent jobs.
#[derive(Clone)]
pub struct Executor {
    provider: Arc<dyn IsolationProvider>,
    cfg: SandboxConfig,
}

impl Executor {
    pub fn new(provider: Arc<dyn IsolationProvider>, cfg: SandboxConfig) -> Self {
        Executor { provider, cfg }
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.cfg
    }

    pub fn provider_name(&self) -> std::borrow::Cow<'static, str> {
        self.provider.name()
    }

    /// Execute `source` as a `language` program with `stdin` as its input.
    ///
    /// `timeout` is the wall-clock limit of the whole job, compilation
    /// included. The job folder is gone by the time this returns, whatever
    /// the outcome.
    #[tracing::instrument(skip(self, source, stdin), fields(provider = %self.provider.name()))]
    pub async fn execute(
        &self,
        language: &str,
        source: &str,
        stdin: &str,
        timeout: Duration,
    ) -> Result<ExecutionResult, ExecError> {
        // Unsupported languages never touch the filesystem.
        let entry = lang::resolve(language, &self.cfg.entry)?;

        let dir = JobDir::create(&self.cfg.work_dir, source, stdin)
            .await
            .context("failed to prepare job folder")?;

        let job = SandboxJob {
            label: dir.name(),
            dir: dir.to_path_buf(),
            entry,
        };
        let opt = CommandRunOptionsBuilder::default()
            .stdout_size_limit(self.cfg.stdout_size_limit)
            .stderr_size_limit(self.cfg.stderr_size_limit)
            .mem_limit(self.cfg.mem_limit)
            .pids_limit(self.cfg.pids_limit)
            .timeout(timeout)
            .build()
            .map_err(|e| anyhow::anyhow!("invalid run options: {}", e))?;

        let watchdog = timeout + self.cfg.watchdog_grace();
        let res = tokio::time::timeout(watchdog, self.provider.run(&job, &opt)).await;

        let label = job.label;
        if let Err(e) = dir.close() {
            tracing::warn!(job = %label, "failed to remove job folder: {}", e);
        }

        let output = match res {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Err(ExecError::Infrastructure(e)),
            Err(_) => {
                tracing::error!(job = %label, ?watchdog, "isolation provider did not return in time");
                return Err(ExecError::Infrastructure(anyhow::anyhow!(
                    "isolation provider hung for more than {:?}",
                    watchdog
                )));
            }
        };

        classify(output, opt.stdout_size_limit)
    }
}

/// `stdout_limit` is the cap the provider applied to stdout. Output that hit
/// it is incomplete and never reaches comparison.
fn classify(output: ProcessOutput, stdout_limit: usize) -> Result<ExecutionResult, ExecError> {
    tracing::debug!(ret_code = ?output.ret_code, inside = %output.runned_inside, "job finished");
    match output.ret_code {
        ExitStatus::ReturnCode(0) if output.stdout_capped => Err(ExecError::ProgramError(
            format!("output limit of {} bytes exceeded", stdout_limit),
        )),
        ExitStatus::ReturnCode(0) => Ok(ExecutionResult {
            stdout: output.stdout.slice(..normalize_output(&output.stdout).len()),
            ret_code: output.ret_code,
        }),
        ExitStatus::ReturnCode(code) => {
            let mut diag = output.stderr;
            if diag.trim().is_empty() {
                diag = exit_code_message(code);
            } else if signal_from_code(code).is_some() {
                if !diag.ends_with('\n') {
                    diag.push('\n');
                }
                diag.push_str(&exit_code_message(code));
            }
            Err(ExecError::ProgramError(diag))
        }
        ExitStatus::Signal(sig) => {
            let mut diag = output.stderr;
            if !diag.is_empty() && !diag.ends_with('\n') {
                diag.push('\n');
            }
            diag.push_str(&format!("killed by signal {} ({})", sig, signal_name(sig)));
            Err(ExecError::ProgramError(diag))
        }
        ExitStatus::Timeout => Err(ExecError::ProgramTimeout),
        ExitStatus::Unknown => Err(ExecError::Infrastructure(anyhow::anyhow!(
            "could not determine how the job in {} ended",
            output.runned_inside
        ))),
    }
}

/// Shells report death by signal `n` as `128 + n`, but a program may exit
/// with such a code on its own, so the signal is only a guess.
fn exit_code_message(code: i64) -> String {
    match signal_from_code(code) {
        Some(sig) => format!(
            "exited with code {} (possibly signal {}, {})",
            code,
            sig,
            signal_name(sig)
        ),
        None => format!("exited with code {}", code),
    }
}

fn signal_name(sig: u32) -> &'static str {
    match sig {
        1 => "SIGHUP",
        2 => "SIGINT",
        3 => "SIGQUIT",
        4 => "SIGILL",
        5 => "SIGTRAP",
        6 => "SIGABRT",
        7 => "SIGBUS",
        8 => "SIGFPE",
        9 => "SIGKILL",
        11 => "SIGSEGV",
        13 => "SIGPIPE",
        14 => "SIGALRM",
        15 => "SIGTERM",
        24 => "SIGXCPU",
        25 => "SIGXFSZ",
        _ => "unknown signal",
    }
}
