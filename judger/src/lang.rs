//! Language dispatch table.
//!
//! Maps a submission's language tag to the command that starts the entry
//! procedure inside the sandbox. Unknown tags are rejected here, before any
//! ephemeral directory is created or any sandbox is launched.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::err::ExecError;

/// Languages the sandbox image knows how to build and run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Language {
    #[serde(rename = "c")]
    C,
    #[serde(rename = "c++", alias = "cpp")]
    Cpp,
    #[serde(rename = "python")]
    Python,
    #[serde(rename = "ruby")]
    Ruby,
    #[serde(rename = "bash")]
    Bash,
}

impl Language {
    pub const ALL: [Language; 5] = [
        Language::C,
        Language::Cpp,
        Language::Python,
        Language::Ruby,
        Language::Bash,
    ];

    /// The tag passed to the entry script through `LANGUAGE`.
    pub fn tag(self) -> &'static str {
        match self {
            Language::C => "c",
            Language::Cpp => "c++",
            Language::Python => "python",
            Language::Ruby => "ruby",
            Language::Bash => "bash",
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

impl FromStr for Language {
    type Err = ExecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "c" => Ok(Language::C),
            "c++" | "cpp" => Ok(Language::Cpp),
            "python" => Ok(Language::Python),
            "ruby" => Ok(Language::Ruby),
            "bash" => Ok(Language::Bash),
            other => Err(ExecError::UnsupportedLanguage(other.to_owned())),
        }
    }
}

/// The sandbox-side command for one resolved language.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryCommand {
    pub language: Language,
    pub command: Vec<String>,
    pub env: Vec<(String, String)>,
}

/// Resolve `tag` against the supported set.
///
/// `entry` is the configured entry procedure, e.g. `["entry"]`. The entry
/// script selects the compiler or interpreter from the `LANGUAGE` variable.
pub fn resolve(tag: &str, entry: &[String]) -> Result<EntryCommand, ExecError> {
    let language = tag.parse::<Language>()?;
    Ok(EntryCommand {
        language,
        command: entry.to_vec(),
        env: vec![("LANGUAGE".into(), language.tag().into())],
    })
}
