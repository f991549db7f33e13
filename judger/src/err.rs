use err_derive::Error;
use std::fmt::Debug;

/// Everything the sandbox executor can fail with.
///
/// The first three variants are routine outcomes of running untrusted code
/// and always end up as a verdict. `Infrastructure` means the judging machinery
/// itself broke and must never be shown to the submitter as their fault.
#[derive(Debug, Error)]
pub enum ExecError {
    #[error(display = "Unsupported language: {:?}", _0)]
    UnsupportedLanguage(String),

    #[error(display = "Program exited with an error: {}", _0)]
    ProgramError(String),

    #[error(display = "Program timed out")]
    ProgramTimeout,

    #[error(display = "Infrastructure error: {:#}", _0)]
    Infrastructure(anyhow::Error),
}

impl ExecError {
    pub fn is_infrastructure(&self) -> bool {
        matches!(self, ExecError::Infrastructure(_))
    }
}

impl From<anyhow::Error> for ExecError {
    fn from(e: anyhow::Error) -> Self {
        ExecError::Infrastructure(e)
    }
}

impl From<std::io::Error> for ExecError {
    fn from(e: std::io::Error) -> Self {
        ExecError::Infrastructure(anyhow::Error::new(e).context("filesystem error in sandbox job"))
    }
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(display = "Scheduler has been shut down")]
    Closed,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(display = "IO error: {}", _0)]
    Io(#[error(source)] std::io::Error),

    #[error(display = "TOML deserialization error: {}", _0)]
    TomlDes(#[error(source)] toml::de::Error),

    #[error(display = "Invalid config: {}", _0)]
    Invalid(String),
}
