//! Persistence seam between the scheduler and whatever owns submissions.

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::verdict::{Status, Verdict};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubmissionId(pub u64);

impl fmt::Display for SubmissionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for SubmissionId {
    fn from(id: u64) -> Self {
        SubmissionId(id)
    }
}

fn default_timeout_secs() -> u64 {
    3
}

/// A program to verify against one test case.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Submission {
    pub id: SubmissionId,
    pub language: String,
    pub source: String,
    #[serde(default)]
    pub test_input: String,
    #[serde(default)]
    pub test_output: String,
    /// Requested time limit; clamped into the configured range when run
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

/// A file of submissions, one `[[submission]]` table each.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubmissionBatch {
    #[serde(default, rename = "submission")]
    pub submissions: Vec<Submission>,
}

impl SubmissionBatch {
    pub fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }
}

/// A submission together with its judging state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmissionRecord {
    pub submission: Submission,
    pub status: Status,
    pub verdict: Option<Verdict>,
    pub claimed_at: Option<DateTime<Utc>>,
    /// Owner token of the scheduler holding the current claim
    #[serde(default)]
    pub claimed_by: Option<String>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl SubmissionRecord {
    pub fn pending(submission: Submission) -> Self {
        SubmissionRecord {
            submission,
            status: Status::Pending,
            verdict: None,
            claimed_at: None,
            claimed_by: None,
            finished_at: None,
        }
    }
}

/// Storage the scheduler reads submissions from and writes verdicts to.
///
/// `claim` and `finish` are compare-and-set operations; implementations must
/// make each of them a single atomic update. Several schedulers may share one
/// store: a claim names its `owner`, and a `Running` submission belongs to
/// that owner until its lease runs out.
#[async_trait]
pub trait SubmissionStore: Send + Sync {
    async fn load(&self, id: SubmissionId) -> anyhow::Result<Option<SubmissionRecord>>;

    /// Move a submission into `Running` for `owner`, stamping `claimed_at`
    /// and `claimed_by`.
    ///
    /// Succeeds from `Pending`. From `Running` it succeeds only when `owner`
    /// already holds the claim, or when the claim is older than `lease` and
    /// its holder is presumed lost. Returns `false` if the submission is
    /// missing, already has a verdict or is held by someone else.
    async fn claim(
        &self,
        id: SubmissionId,
        owner: &str,
        lease: chrono::Duration,
    ) -> anyhow::Result<bool>;

    /// Record the verdict if and only if the submission is still `Running`
    /// under a claim held by `owner`. Returns `false` when nothing was
    /// written.
    async fn finish(&self, id: SubmissionId, owner: &str, verdict: Verdict)
        -> anyhow::Result<bool>;

    /// Submissions that have been `Running` since before `now - older_than`.
    async fn stale_running(&self, older_than: chrono::Duration) -> anyhow::Result<Vec<SubmissionId>>;
}

/// In-process store, used by the CLI and tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: DashMap<SubmissionId, SubmissionRecord>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a submission in `Pending` state. An existing record with the
    /// same id is left untouched and `false` is returned.
    pub fn insert(&self, submission: Submission) -> bool {
        match self.records.entry(submission.id) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(v) => {
                v.insert(SubmissionRecord::pending(submission));
                true
            }
        }
    }

    /// Put a record in place as-is, e.g. one restored from elsewhere.
    pub fn restore(&self, record: SubmissionRecord) {
        self.records.insert(record.submission.id, record);
    }

    pub fn get(&self, id: SubmissionId) -> Option<SubmissionRecord> {
        self.records.get(&id).map(|r| r.value().clone())
    }

    pub fn status(&self, id: SubmissionId) -> Option<Status> {
        self.records.get(&id).map(|r| r.status)
    }

    /// All records, ordered by id.
    pub fn records(&self) -> Vec<SubmissionRecord> {
        let mut res: Vec<_> = self.records.iter().map(|r| r.value().clone()).collect();
        res.sort_by_key(|r| r.submission.id);
        res
    }
}

#[async_trait]
impl SubmissionStore for MemoryStore {
    async fn load(&self, id: SubmissionId) -> anyhow::Result<Option<SubmissionRecord>> {
        Ok(self.get(id))
    }

    async fn claim(
        &self,
        id: SubmissionId,
        owner: &str,
        lease: chrono::Duration,
    ) -> anyhow::Result<bool> {
        let mut record = match self.records.get_mut(&id) {
            Some(r) => r,
            None => return Ok(false),
        };
        let now = Utc::now();
        let claimable = match record.status {
            Status::Pending => true,
            Status::Running => {
                record.claimed_by.as_deref() == Some(owner)
                    || record.claimed_at.map_or(true, |t| t < now - lease)
            }
            _ => false,
        };
        if claimable {
            record.status = Status::Running;
            record.claimed_at = Some(now);
            record.claimed_by = Some(owner.to_owned());
        }
        Ok(claimable)
    }

    async fn finish(
        &self,
        id: SubmissionId,
        owner: &str,
        verdict: Verdict,
    ) -> anyhow::Result<bool> {
        let mut record = match self.records.get_mut(&id) {
            Some(r) => r,
            None => return Ok(false),
        };
        let next = verdict.status();
        if record.claimed_by.as_deref() != Some(owner) || !record.status.can_transition_to(next) {
            return Ok(false);
        }
        record.status = next;
        record.verdict = Some(verdict);
        record.finished_at = Some(Utc::now());
        Ok(true)
    }

    async fn stale_running(&self, older_than: chrono::Duration) -> anyhow::Result<Vec<SubmissionId>> {
        let deadline = Utc::now() - older_than;
        let mut res: Vec<_> = self
            .records
            .iter()
            .filter(|r| r.status == Status::Running)
            .filter(|r| r.claimed_at.map_or(true, |t| t < deadline))
            .map(|r| *r.key())
            .collect();
        res.sort();
        Ok(res)
    }
}
