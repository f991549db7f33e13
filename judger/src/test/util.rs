use std::{
    borrow::Cow,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;

use crate::{
    config::Config,
    runner::{
        model::{
            CommandRunOptions, ExitStatus, IsolationProvider, ProcessOutput, SandboxJob,
            PROGRAM_FILE, TESTINPUT_FILE,
        },
        workspace::JOB_DIR_PREFIX,
        Executor,
    },
};

/// What the mock provider saw of one job.
#[derive(Debug, Clone)]
pub struct SeenJob {
    pub label: String,
    pub dir: PathBuf,
    /// File names in the job folder, sorted
    pub files: Vec<String>,
    pub program: String,
    pub testinput: String,
    pub command: Vec<String>,
    pub env: Vec<(String, String)>,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
enum Behaviour {
    Exit,
    InfraError(String),
    Panic(String),
    Hang,
}

#[derive(Debug)]
struct Rule {
    source: String,
    ret_code: ExitStatus,
    stdout: String,
    stderr: String,
    delay: Option<Duration>,
    behaviour: Behaviour,
    /// Infrastructure failures served before `behaviour` kicks in
    fail_first: usize,
    calls: AtomicUsize,
}

/// An isolation provider answering from a script keyed by program source.
#[derive(Debug, Default)]
pub struct MockProvider {
    rules: Vec<Rule>,
    seen: Mutex<Vec<SeenJob>>,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

pub struct MockRuleBuilder<'a> {
    provider: &'a mut MockProvider,
    rule: Rule,
}

impl MockProvider {
    pub fn new() -> MockProvider {
        Self::default()
    }

    /// Script what happens to jobs whose `program` file is exactly `source`.
    pub fn when(&mut self, source: &str) -> MockRuleBuilder<'_> {
        MockRuleBuilder {
            provider: self,
            rule: Rule {
                source: source.into(),
                ret_code: ExitStatus::ReturnCode(0),
                stdout: String::new(),
                stderr: String::new(),
                delay: None,
                behaviour: Behaviour::Exit,
                fail_first: 0,
                calls: AtomicUsize::new(0),
            },
        }
    }

    pub fn seen(&self) -> Vec<SeenJob> {
        self.seen.lock().unwrap().clone()
    }

    pub fn runs(&self) -> usize {
        self.seen.lock().unwrap().len()
    }

    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }
}

impl<'a> MockRuleBuilder<'a> {
    pub fn returns(mut self, code: i64) -> Self {
        self.rule.ret_code = ExitStatus::ReturnCode(code);
        self
    }

    pub fn ends_with(mut self, status: ExitStatus) -> Self {
        self.rule.ret_code = status;
        self
    }

    pub fn stdout(mut self, s: &str) -> Self {
        self.rule.stdout = s.into();
        self
    }

    pub fn stderr(mut self, s: &str) -> Self {
        self.rule.stderr = s.into();
        self
    }

    pub fn delay(mut self, d: Duration) -> Self {
        self.rule.delay = Some(d);
        self
    }

    pub fn infra_error(mut self, msg: &str) -> Self {
        self.rule.behaviour = Behaviour::InfraError(msg.into());
        self
    }

    pub fn panics(mut self, msg: &str) -> Self {
        self.rule.behaviour = Behaviour::Panic(msg.into());
        self
    }

    /// Never return, like a wedged daemon.
    pub fn hangs(mut self) -> Self {
        self.rule.behaviour = Behaviour::Hang;
        self
    }

    pub fn fail_first(mut self, n: usize) -> Self {
        self.rule.fail_first = n;
        self
    }

    pub fn finish(self) {
        self.provider.rules.push(self.rule);
    }
}

fn list_files(dir: &Path) -> Vec<String> {
    let mut files: Vec<_> = std::fs::read_dir(dir)
        .expect("job folder should exist while the job runs")
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    files.sort();
    files
}

#[async_trait]
impl IsolationProvider for MockProvider {
    fn name(&self) -> Cow<'static, str> {
        "mock".into()
    }

    async fn run(&self, job: &SandboxJob, opt: &CommandRunOptions) -> anyhow::Result<ProcessOutput> {
        let program = std::fs::read_to_string(job.dir().join(PROGRAM_FILE))?;
        let testinput = std::fs::read_to_string(job.dir().join(TESTINPUT_FILE))?;
        self.seen.lock().unwrap().push(SeenJob {
            label: job.label.clone(),
            dir: job.dir.clone(),
            files: list_files(job.dir()),
            program: program.clone(),
            testinput,
            command: job.entry.command.clone(),
            env: job.entry.env.clone(),
            timeout: opt.timeout,
        });

        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
        let _active = scopeguard::guard((), |_| {
            self.active.fetch_sub(1, Ordering::SeqCst);
        });

        let rule = self
            .rules
            .iter()
            .find(|r| r.source == program)
            .ok_or_else(|| anyhow::anyhow!("no rule for program {:?}", program))?;
        let call = rule.calls.fetch_add(1, Ordering::SeqCst);

        if let Some(d) = rule.delay {
            tokio::time::sleep(d).await;
        }
        if call < rule.fail_first {
            anyhow::bail!("scripted infrastructure failure #{}", call + 1);
        }

        // cut stdout the way a real provider does
        let kept = rule.stdout.len().min(opt.stdout_size_limit);
        match &rule.behaviour {
            Behaviour::Exit => Ok(ProcessOutput {
                ret_code: rule.ret_code,
                stdout: Bytes::copy_from_slice(&rule.stdout.as_bytes()[..kept]),
                stdout_capped: kept < rule.stdout.len(),
                stderr: rule.stderr.clone(),
                runned_inside: self.name().into(),
            }),
            Behaviour::InfraError(msg) => Err(anyhow::anyhow!("{}", msg)),
            Behaviour::Panic(msg) => panic!("{}", msg),
            Behaviour::Hang => {
                std::future::pending::<()>().await;
                unreachable!()
            }
        }
    }
}

/// Config with short intervals, creating job folders under `work_dir`.
pub fn test_config(work_dir: &Path) -> Config {
    let mut cfg = Config::default();
    cfg.sandbox.work_dir = work_dir.to_owned();
    cfg.sandbox.min_timeout_secs = 1;
    cfg.sandbox.max_timeout_secs = 3;
    cfg.sandbox.watchdog_grace_secs = 1;
    cfg.scheduler.retry_backoff_ms = 10;
    cfg
}

pub fn executor(provider: Arc<MockProvider>, cfg: &Config) -> Executor {
    Executor::new(provider, cfg.sandbox.clone())
}

/// Job folders currently present under `root`.
pub fn count_job_dirs(root: &Path) -> usize {
    match std::fs::read_dir(root) {
        Ok(entries) => entries
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(JOB_DIR_PREFIX))
            .count(),
        Err(_) => 0,
    }
}
