//! Background verification of submissions by a fixed pool of workers.
//!
//! Submissions are referenced by id on a FIFO queue. Each of the K workers
//! takes the next id, claims the submission in the store, runs it through the
//! executor and the evaluator, and writes the verdict back with a single
//! compare-and-set. Infrastructure failures are retried a bounded number of
//! times; a reaper re-queues submissions left `Running` by lost attempts.

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, PoisonError, RwLock,
    },
    time::Duration,
};

use anyhow::Context;
use dashmap::DashMap;
use tokio::{
    sync::{
        mpsc::{self, UnboundedReceiver, UnboundedSender},
        Mutex, Notify, Semaphore,
    },
    task::JoinHandle,
};
use tracing::Instrument;

use crate::{
    config::Config,
    err::SchedulerError,
    runner::Executor,
    verdict::Evaluator,
};

pub mod store;

pub use store::{
    MemoryStore, Submission, SubmissionBatch, SubmissionId, SubmissionRecord, SubmissionStore,
};

struct Inner {
    workers: usize,
    max_infra_retries: u32,
    retry_backoff: Duration,
    reaper_interval: Duration,
    /// Longest a healthy attempt can keep a submission `Running`
    stale_after: chrono::Duration,
    /// Token naming this scheduler's claims in the store
    owner: String,

    executor: Executor,
    evaluator: Evaluator,
    store: Arc<dyn SubmissionStore>,

    sender: RwLock<Option<UnboundedSender<SubmissionId>>>,
    queue: Mutex<UnboundedReceiver<SubmissionId>>,
    queued: AtomicUsize,
    slots: Arc<Semaphore>,

    /// Submissions owned by this scheduler: queued, running or backing off
    in_flight: DashMap<SubmissionId, ()>,
    /// Attempts made so far for each in-flight submission
    attempts: DashMap<SubmissionId, u32>,
    /// Submissions whose infrastructure retries ran out
    escalated: DashMap<SubmissionId, ()>,
    idle: Notify,
}

pub struct Scheduler {
    inner: Arc<Inner>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    reaper: JoinHandle<()>,
}

impl Scheduler {
    /// Spawn the workers and the reaper. Must be called inside a tokio
    /// runtime.
    pub fn start(cfg: &Config, executor: Executor, store: Arc<dyn SubmissionStore>) -> Scheduler {
        let (tx, rx) = mpsc::unbounded_channel();
        let sched = &cfg.scheduler;
        let workers = sched.workers.max(1);
        let stale_secs = cfg.sandbox.max_timeout_secs + cfg.sandbox.watchdog_grace_secs;

        let inner = Arc::new(Inner {
            workers,
            max_infra_retries: sched.max_infra_retries,
            retry_backoff: Duration::from_millis(sched.retry_backoff_ms),
            reaper_interval: Duration::from_secs(sched.reaper_interval_secs.max(1)),
            stale_after: chrono::Duration::seconds(stale_secs as i64),
            owner: format!("riker-{:016x}", rand::random::<u64>()),
            executor,
            evaluator: Evaluator::new(cfg.verdict.clone()),
            store,
            sender: RwLock::new(Some(tx)),
            queue: Mutex::new(rx),
            queued: AtomicUsize::new(0),
            slots: Arc::new(Semaphore::new(workers)),
            in_flight: DashMap::new(),
            attempts: DashMap::new(),
            escalated: DashMap::new(),
            idle: Notify::new(),
        });

        let handles = (0..workers)
            .map(|idx| {
                tokio::spawn(
                    worker(inner.clone()).instrument(tracing::info_span!("worker", idx)),
                )
            })
            .collect();
        let reaper = tokio::spawn(reaper(inner.clone()).instrument(tracing::info_span!("reaper")));

        tracing::info!(
            workers,
            owner = %inner.owner,
            provider = %inner.executor.provider_name(),
            "scheduler started"
        );
        Scheduler {
            inner,
            workers: Mutex::new(handles),
            reaper,
        }
    }

    /// Queue a persisted `Pending` submission for verification.
    ///
    /// Returns immediately. `Ok(false)` means the submission is already
    /// queued or running here and nothing was done.
    pub fn submit(&self, id: SubmissionId) -> Result<bool, SchedulerError> {
        // an explicit submit is the operator's way of retrying an escalation
        self.inner.escalated.remove(&id);
        self.inner.enqueue(id)
    }

    /// Number of slots currently running a job.
    pub fn active(&self) -> usize {
        self.inner.workers - self.inner.slots.available_permits()
    }

    /// Number of references waiting on the queue.
    pub fn queued(&self) -> usize {
        self.inner.queued.load(Ordering::SeqCst)
    }

    /// Resolves once nothing is queued, running or waiting for a retry.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            if self.inner.in_flight.is_empty() {
                return;
            }
            notified.await;
        }
    }

    /// Stop accepting submissions, let the workers drain what is already
    /// queued and wait for them to exit.
    pub async fn shutdown(&self) {
        let sender = self
            .inner
            .sender
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if sender.is_none() {
            return;
        }
        drop(sender);
        self.reaper.abort();

        let handles = std::mem::take(&mut *self.workers.lock().await);
        tracing::info!(queued = self.queued(), "scheduler shutting down, draining queue");
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::error!("worker exited abnormally: {}", e);
            }
        }
        tracing::info!("scheduler stopped");
    }
}

impl Inner {
    fn enqueue(&self, id: SubmissionId) -> Result<bool, SchedulerError> {
        let sender = self.sender.read().unwrap_or_else(PoisonError::into_inner);
        let sender = sender.as_ref().ok_or(SchedulerError::Closed)?;

        match self.in_flight.entry(id) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                tracing::debug!(submission = %id, "already queued or running, ignored");
                return Ok(false);
            }
            dashmap::mapref::entry::Entry::Vacant(v) => {
                v.insert(());
            }
        }

        self.queued.fetch_add(1, Ordering::SeqCst);
        if sender.send(id).is_err() {
            self.queued.fetch_sub(1, Ordering::SeqCst);
            self.release(id);
            return Err(SchedulerError::Closed);
        }
        tracing::debug!(submission = %id, "queued");
        Ok(true)
    }

    /// Give up ownership of a submission.
    fn release(&self, id: SubmissionId) {
        self.attempts.remove(&id);
        self.in_flight.remove(&id);
        if self.in_flight.is_empty() {
            self.idle.notify_waiters();
        }
    }

    fn next_attempt(&self, id: SubmissionId) -> u32 {
        let mut n = self.attempts.entry(id).or_insert(0);
        *n += 1;
        *n
    }

    /// Decide what happens to a submission whose attempt failed for reasons
    /// that are not the program's.
    fn on_infra_failure(self: &Arc<Self>, id: SubmissionId, attempt: u32, err: anyhow::Error) {
        if attempt > self.max_infra_retries {
            tracing::error!(
                submission = %id,
                attempts = attempt,
                "giving up on submission after repeated infrastructure failures, \
                 operator attention required: {:?}",
                err
            );
            self.escalated.insert(id, ());
            self.release(id);
            return;
        }

        tracing::warn!(
            submission = %id,
            attempt,
            backoff = ?self.retry_backoff,
            "infrastructure failure, retrying: {:#}",
            err
        );
        let sender = self
            .sender
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let sender = match sender {
            Some(s) => s,
            None => {
                tracing::warn!(submission = %id, "scheduler closed, retry dropped");
                self.release(id);
                return;
            }
        };

        let inner = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(inner.retry_backoff).await;
            inner.queued.fetch_add(1, Ordering::SeqCst);
            if sender.send(id).is_err() {
                inner.queued.fetch_sub(1, Ordering::SeqCst);
                inner.release(id);
            }
        });
    }

    /// One attempt at judging a submission. `Err` is always an
    /// infrastructure failure.
    async fn judge(&self, id: SubmissionId) -> anyhow::Result<()> {
        let record = self
            .store
            .load(id)
            .await
            .context("failed to load submission")?;
        let record = match record {
            Some(r) => r,
            None => {
                tracing::warn!("submission does not exist, skipped");
                return Ok(());
            }
        };
        if record.status.is_terminal() {
            tracing::debug!(status = ?record.status, "submission already judged, skipped");
            return Ok(());
        }
        let claimed = self
            .store
            .claim(id, &self.owner, self.stale_after)
            .await
            .context("failed to claim submission")?;
        if !claimed {
            tracing::debug!("submission is judged elsewhere, skipped");
            return Ok(());
        }

        let sub = &record.submission;
        let timeout = self.executor.config().clamp_timeout(sub.timeout_secs);
        let outcome = self
            .executor
            .execute(&sub.language, &sub.source, &sub.test_input, timeout)
            .await;
        let verdict = self.evaluator.judge(outcome, &sub.test_output)?;

        let written = self
            .store
            .finish(id, &self.owner, verdict.clone())
            .await
            .context("failed to record verdict")?;
        if written {
            tracing::info!(%verdict, "verdict recorded");
        } else {
            tracing::warn!(%verdict, "claim lost or submission already resolved, verdict dropped");
        }
        Ok(())
    }
}

async fn worker(inner: Arc<Inner>) {
    loop {
        let id = { inner.queue.lock().await.recv().await };
        let id = match id {
            Some(id) => id,
            None => break,
        };
        inner.queued.fetch_sub(1, Ordering::SeqCst);
        let permit = match inner.slots.clone().acquire_owned().await {
            Ok(p) => p,
            Err(_) => break,
        };

        let attempt = inner.next_attempt(id);
        let release = scopeguard::guard(id, |id| inner.release(id));

        let span = tracing::info_span!("judge", submission = %id, attempt);
        let job = tokio::spawn({
            let inner = inner.clone();
            async move { inner.judge(id).await }.instrument(span)
        });
        let res = match job.await {
            Ok(res) => res,
            Err(e) if e.is_panic() => Err(anyhow::anyhow!("job panicked: {}", e)),
            Err(e) => Err(anyhow::anyhow!("job was cancelled: {}", e)),
        };
        drop(permit);

        if let Err(e) = res {
            // ownership carries over into the retry
            let id = scopeguard::ScopeGuard::into_inner(release);
            inner.on_infra_failure(id, attempt, e);
        }
    }
    tracing::debug!("worker exited");
}

async fn reaper(inner: Arc<Inner>) {
    let mut interval = tokio::time::interval(inner.reaper_interval);
    // the first tick fires immediately
    interval.tick().await;
    loop {
        interval.tick().await;
        let stale = match inner.store.stale_running(inner.stale_after).await {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!("failed to look for stale submissions: {:#}", e);
                continue;
            }
        };
        for id in stale {
            if inner.in_flight.contains_key(&id) || inner.escalated.contains_key(&id) {
                continue;
            }
            match inner.enqueue(id) {
                Ok(true) => tracing::warn!(submission = %id, "re-queued stale submission"),
                Ok(false) => {}
                Err(SchedulerError::Closed) => return,
            }
        }
    }
}
