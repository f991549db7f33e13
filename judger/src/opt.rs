use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug, Clone)]
#[clap(name = "riker", about = "Judge untrusted programs in disposable sandboxes")]
pub struct Opts {
    #[clap(subcommand)]
    pub cmd: SubCmd,

    #[clap(flatten)]
    pub opt: GlobalOpts,
}

#[derive(Args, Debug, Clone)]
pub struct GlobalOpts {
    /// Configuration file. Defaults are used for everything it leaves out.
    #[clap(long, short, global = true, name = "config-file-path")]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum SubCmd {
    /// Run a single program against one test case
    #[clap(name = "run")]
    Run(RunSubCmd),

    /// Verify every submission in a batch file through the scheduler
    #[clap(name = "batch")]
    Batch(BatchSubCmd),
}

#[derive(Args, Debug, Clone)]
pub struct RunSubCmd {
    /// Language of the program: c, c++, python, ruby or bash
    #[clap(required = true)]
    pub lang: String,

    /// Path of the source file
    #[clap(required = true)]
    pub source: PathBuf,

    /// File fed to the program's stdin
    #[clap(long, short)]
    pub input: Option<PathBuf>,

    /// File holding the expected output. Without it the program's output is
    /// printed instead of a verdict.
    #[clap(long, short)]
    pub expected: Option<PathBuf>,

    /// Time limit in seconds, clamped into the configured range
    #[clap(long, short, default_value = "3")]
    pub timeout: u64,
}

#[derive(Args, Debug, Clone)]
pub struct BatchSubCmd {
    /// TOML file with one `[[submission]]` table per submission
    #[clap(required = true)]
    pub file: PathBuf,

    /// Number of concurrent sandboxes, overriding the config file
    #[clap(long, short)]
    pub workers: Option<usize>,

    /// Print results as JSON lines
    #[clap(long)]
    pub json: bool,
}
