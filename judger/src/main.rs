use anyhow::Context;
use clap::Parser;
use riker_judger::{
    config::Config,
    runner::{DockerProvider, Executor},
    scheduler::{MemoryStore, Scheduler, SubmissionBatch, SubmissionId, SubmissionStore},
    verdict::{Evaluator, Status, Verdict},
};
use serde::Serialize;
use std::{
    io::Write,
    process::exit,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tracing_subscriber::EnvFilter;

mod opt;

static CTRL_C: AtomicBool = AtomicBool::new(false);
static CTRL_C_TWICE: AtomicBool = AtomicBool::new(false);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opts = opt::Opts::parse();
    init_logging()?;

    ctrlc::set_handler(handle_ctrl_c).context("Failed to set termination handler")?;

    let cfg = match &opts.opt.config {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => Config::default(),
    };

    match opts.cmd {
        opt::SubCmd::Run(cmd) => run(cfg, cmd).await,
        opt::SubCmd::Batch(cmd) => batch(cfg, cmd).await,
    }
}

fn init_logging() -> anyhow::Result<()> {
    tracing_log::LogTracer::init().context("Failed to bridge log records")?;
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new("info"))?;
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber).context("Failed to set up logger")?;
    Ok(())
}

async fn executor(cfg: &Config) -> anyhow::Result<Executor> {
    let provider = DockerProvider::connect(&cfg.sandbox)?;
    provider.ping().await?;
    Ok(Executor::new(Arc::new(provider), cfg.sandbox.clone()))
}

async fn run(cfg: Config, cmd: opt::RunSubCmd) -> anyhow::Result<()> {
    let source = tokio::fs::read_to_string(&cmd.source)
        .await
        .with_context(|| format!("Failed to read {}", cmd.source.display()))?;
    let stdin = match &cmd.input {
        Some(path) => tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?,
        None => String::new(),
    };
    let expected = match &cmd.expected {
        Some(path) => Some(
            tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("Failed to read {}", path.display()))?,
        ),
        None => None,
    };

    let executor = executor(&cfg).await?;
    let timeout = cfg.sandbox.clamp_timeout(cmd.timeout);
    let outcome = executor.execute(&cmd.lang, &source, &stdin, timeout).await;

    match expected {
        Some(expected) => {
            let verdict = Evaluator::new(cfg.verdict).judge(outcome, &expected)?;
            println!("{}", verdict);
            if verdict != Verdict::Pass {
                exit(1);
            }
        }
        None => match outcome {
            Ok(res) => {
                let mut out = std::io::stdout();
                out.write_all(&res.stdout)?;
                out.flush()?;
            }
            Err(e) if e.is_infrastructure() => return Err(e.into()),
            Err(e) => {
                eprintln!("{}", e);
                exit(1);
            }
        },
    }
    Ok(())
}

#[derive(Serialize)]
struct BatchResult {
    id: SubmissionId,
    status: Status,
    verdict: Option<Verdict>,
}

async fn batch(mut cfg: Config, cmd: opt::BatchSubCmd) -> anyhow::Result<()> {
    if let Some(workers) = cmd.workers {
        cfg.scheduler.workers = workers;
    }
    cfg.validate()?;

    let content = tokio::fs::read_to_string(&cmd.file)
        .await
        .with_context(|| format!("Failed to read {}", cmd.file.display()))?;
    let batch = SubmissionBatch::from_toml(&content)
        .with_context(|| format!("Failed to parse {}", cmd.file.display()))?;

    let store = Arc::new(MemoryStore::new());
    let mut ids = vec![];
    for sub in batch.submissions {
        let id = sub.id;
        if !store.insert(sub) {
            tracing::warn!(submission = %id, "duplicate submission id in batch, skipped");
            continue;
        }
        ids.push(id);
    }

    let executor = executor(&cfg).await?;
    let scheduler = Scheduler::start(&cfg, executor, store.clone() as Arc<dyn SubmissionStore>);
    for id in ids {
        scheduler.submit(id)?;
    }

    tokio::select! {
        _ = scheduler.wait_idle() => {}
        _ = wait_for_ctrl_c() => {}
    }
    scheduler.shutdown().await;

    let mut out = std::io::stdout();
    for record in store.records() {
        let result = BatchResult {
            id: record.submission.id,
            status: record.status,
            verdict: record.verdict,
        };
        if cmd.json {
            writeln!(out, "{}", serde_json::to_string(&result)?)?;
        } else {
            match &result.verdict {
                Some(v) => writeln!(out, "{}\t{}", result.id, v)?,
                None => writeln!(out, "{}\t({:?})", result.id, result.status)?,
            }
        }
    }
    Ok(())
}

async fn wait_for_ctrl_c() {
    while !CTRL_C.load(Ordering::SeqCst) {
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
}

fn handle_ctrl_c() {
    if !CTRL_C.load(Ordering::SeqCst) {
        tracing::warn!("Waiting for queued jobs to complete... Press Ctrl-C again to force quit.");
        CTRL_C.store(true, Ordering::SeqCst);
    } else if !CTRL_C_TWICE.load(Ordering::SeqCst) {
        tracing::error!("Force quit!");
        CTRL_C_TWICE.store(true, Ordering::SeqCst);
        exit(101);
    }
}
