//! Verdicts and the evaluator turning execution outcomes into them.

use std::{convert::TryFrom, fmt, str::FromStr};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{config::VerdictConfig, err::ExecError, runner::ExecutionResult};

/// Where a submission is in its judging lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Pending,
    Running,
    Pass,
    Fail,
    RuntimeError,
    Timeout,
    UnsupportedLanguage,
}

impl Status {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Status::Pending | Status::Running)
    }

    /// Pending -> Running -> exactly one terminal state, nothing else.
    pub fn can_transition_to(self, next: Status) -> bool {
        match self {
            Status::Pending => next == Status::Running,
            Status::Running => next.is_terminal(),
            _ => false,
        }
    }
}

/// The terminal classification of a submission, written back exactly once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum Verdict {
    Pass,
    Fail,
    /// Carries the sanitized stderr of the program
    RuntimeError(String),
    Timeout,
    UnsupportedLanguage,
}

const RUNTIME_ERROR_PREFIX: &str = "runtime error: ";

impl Verdict {
    pub fn status(&self) -> Status {
        match self {
            Verdict::Pass => Status::Pass,
            Verdict::Fail => Status::Fail,
            Verdict::RuntimeError(_) => Status::RuntimeError,
            Verdict::Timeout => Status::Timeout,
            Verdict::UnsupportedLanguage => Status::UnsupportedLanguage,
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Pass => f.write_str("PASS"),
            Verdict::Fail => f.write_str("FAIL"),
            Verdict::RuntimeError(diag) => write!(f, "{}{}", RUNTIME_ERROR_PREFIX, diag),
            Verdict::Timeout => f.write_str("timed out"),
            Verdict::UnsupportedLanguage => f.write_str("unsupported language"),
        }
    }
}

impl FromStr for Verdict {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PASS" => Ok(Verdict::Pass),
            "FAIL" => Ok(Verdict::Fail),
            "timed out" => Ok(Verdict::Timeout),
            "unsupported language" => Ok(Verdict::UnsupportedLanguage),
            s => match s.strip_prefix(RUNTIME_ERROR_PREFIX) {
                Some(diag) => Ok(Verdict::RuntimeError(diag.to_owned())),
                None => Err(format!("not a verdict: {:?}", s)),
            },
        }
    }
}

impl From<Verdict> for String {
    fn from(v: Verdict) -> String {
        v.to_string()
    }
}

impl TryFrom<String> for Verdict {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

/// Strip at most one trailing `\n`.
///
/// Test fixtures are newline-terminated while stored expected outputs may or
/// may not be. Program stdout gets this in the executor, expected output gets
/// it in [`Evaluator::judge`]; each side is normalized exactly once.
pub fn normalize_output(s: &[u8]) -> &[u8] {
    s.strip_suffix(b"\n").unwrap_or(s)
}

static ANSI_ESCAPE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\x1b\[[0-9;?]*[ -/]*[@-~]").unwrap());

/// Make captured stderr safe to show next to a verdict.
pub fn sanitize_diagnostic(raw: &str, limit: usize) -> String {
    let stripped = ANSI_ESCAPE.replace_all(raw, "");
    let cleaned: String = stripped
        .chars()
        .filter(|&c| c == '\n' || c == '\t' || !c.is_control())
        .collect();
    let cleaned = cleaned.trim_end();

    if cleaned.chars().count() > limit {
        let mut s: String = cleaned.chars().take(limit).collect();
        s.push_str("...");
        s
    } else {
        cleaned.to_owned()
    }
}

pub struct Evaluator {
    cfg: VerdictConfig,
}

impl Evaluator {
    pub fn new(cfg: VerdictConfig) -> Self {
        Evaluator { cfg }
    }

    /// Classify one execution outcome.
    ///
    /// Total over every program-level outcome. An infrastructure error is not
    /// the program's fault and has no verdict, so it is handed back as `Err`.
    pub fn judge(
        &self,
        outcome: Result<ExecutionResult, ExecError>,
        expected: &str,
    ) -> Result<Verdict, anyhow::Error> {
        match outcome {
            Ok(res) => {
                if res.stdout[..] == *normalize_output(expected.as_bytes()) {
                    Ok(Verdict::Pass)
                } else {
                    Ok(Verdict::Fail)
                }
            }
            Err(ExecError::UnsupportedLanguage(_)) => Ok(Verdict::UnsupportedLanguage),
            Err(ExecError::ProgramError(diag)) => Ok(Verdict::RuntimeError(
                sanitize_diagnostic(&diag, self.cfg.diagnostic_limit),
            )),
            Err(ExecError::ProgramTimeout) => Ok(Verdict::Timeout),
            Err(ExecError::Infrastructure(e)) => Err(e),
        }
    }
}

impl Default for Evaluator {
    fn default() -> Self {
        Evaluator::new(VerdictConfig::default())
    }
}
