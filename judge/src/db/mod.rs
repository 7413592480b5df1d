//! Row-level access to submissions, per-case results, and submission locks
//!
//! The lock table is how concurrent workers share the queue: a worker owns a
//! submission while `now < ping + LOCK_TIME` and keeps ownership alive by
//! re-acquiring. A crashed worker simply stops pinging and its claim expires.

pub mod memory;
pub mod pg;

pub use memory::MemoryStore;
pub use pg::PgStore;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

/// Lease duration for submission locks. Heartbeats must come comfortably
/// more often than this.
pub const LOCK_TIME_SECS: i64 = 60;

pub fn lock_time() -> Duration {
    Duration::seconds(LOCK_TIME_SECS)
}

/// Submissions table row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Submission {
    pub id: i32,
    pub submission_time: DateTime<Utc>,
    pub problem_name: String,
    pub lang: String,
    pub status: String,
    pub prev_status: String,
    pub hacked: bool,
    pub source: String,
    pub testcases_version: String,
    /// Max wall-clock over the cases, milliseconds.
    pub max_time: i32,
    /// Max memory over the cases, bytes.
    pub max_memory: i64,
    pub compile_error: Vec<u8>,
    pub user_name: Option<String>,
    pub judged_time: Option<DateTime<Utc>>,
}

/// Listing projection of a submission, with the problem title joined in.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SubmissionOverview {
    pub id: i32,
    pub submission_time: DateTime<Utc>,
    pub problem_name: String,
    pub problem_title: Option<String>,
    pub lang: String,
    pub status: String,
    pub testcases_version: String,
    pub max_time: i32,
    pub max_memory: i64,
    pub user_name: Option<String>,
}

/// Problems table row (the fields the worker consumes).
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Problem {
    pub name: String,
    pub title: String,
    /// Problem time limit, milliseconds.
    pub timelimit: i32,
    pub testcases_version: String,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct User {
    pub name: String,
}

/// A submission with its owner and problem resolved.
#[derive(Debug, Clone)]
pub struct SubmissionDetail {
    pub submission: Submission,
    pub user: Option<User>,
    pub problem: Option<Problem>,
}

/// Per-case result row, keyed by `(submission, testcase)`.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct TestcaseResultRow {
    pub submission: i32,
    pub testcase: String,
    pub status: String,
    /// Wall-clock, milliseconds.
    pub time: i32,
    /// Memory, bytes.
    pub memory: i64,
    pub stderr: Vec<u8>,
    pub checker_out: Vec<u8>,
}

/// Cooperative lease row on a submission.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SubmissionLockRow {
    pub submission: i32,
    pub holder: String,
    pub ping: DateTime<Utc>,
}

impl SubmissionLockRow {
    /// Whether the lease is still live at `now`.
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        now < self.ping + lock_time()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmissionOrder {
    IdDesc,
    MaxTimeAsc,
}

/// Listing filter; `None` fields match everything.
#[derive(Debug, Clone, Default)]
pub struct SubmissionFilter {
    pub problem: Option<String>,
    pub status: Option<String>,
    pub lang: Option<String>,
    pub user: Option<String>,
}

/// Store operations the worker needs. `PgStore` is the production
/// implementation; `MemoryStore` backs tests and the lock-protocol checks.
#[async_trait]
pub trait SubmissionStore: Send + Sync {
    /// Fetch a submission with its user and problem, or `None` if unknown.
    async fn fetch_submission(&self, id: i32) -> Result<Option<SubmissionDetail>>;

    /// Insert a new submission (id must be 0) and return the assigned id.
    async fn save_submission(&self, submission: Submission) -> Result<i32>;

    /// Update an existing submission (id must be set).
    async fn update_submission(&self, submission: &Submission) -> Result<()>;

    async fn clear_testcase_results(&self, submission_id: i32) -> Result<()>;

    /// Upsert one per-case row.
    async fn save_testcase_result(&self, row: &TestcaseResultRow) -> Result<()>;

    /// All per-case rows of a submission, sorted by testcase name.
    async fn list_testcase_results(&self, submission_id: i32) -> Result<Vec<TestcaseResultRow>>;

    /// Filtered listing plus the total count matching the filter.
    async fn list_submissions(
        &self,
        filter: &SubmissionFilter,
        order: &[SubmissionOrder],
        offset: i64,
        limit: i64,
    ) -> Result<(Vec<SubmissionOverview>, i64)>;

    /// Claim or refresh the lease on a submission. Returns `false` when
    /// another holder's lease is still live. Re-invoking from the current
    /// holder is the heartbeat.
    async fn try_lock(&self, submission_id: i32, holder: &str) -> Result<bool>;

    /// Release the lease. Re-acquires first; if that fails the caller was
    /// evicted and the row is left alone.
    async fn unlock(&self, submission_id: i32, holder: &str) -> Result<()>;
}
