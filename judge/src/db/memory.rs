//! In-memory store
//!
//! Backs unit tests and the lock-protocol checks without a database. The
//! whole state sits behind one mutex, which gives the same all-or-nothing
//! critical section the Postgres implementation gets from its transaction.

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{
    Problem, Submission, SubmissionDetail, SubmissionFilter, SubmissionLockRow, SubmissionOrder,
    SubmissionOverview, SubmissionStore, TestcaseResultRow, User,
};

#[derive(Default)]
struct Data {
    submissions: HashMap<i32, Submission>,
    next_submission_id: i32,
    testcase_results: HashMap<(i32, String), TestcaseResultRow>,
    locks: HashMap<i32, SubmissionLockRow>,
    problems: HashMap<String, Problem>,
    users: HashMap<String, User>,
}

#[derive(Default)]
pub struct MemoryStore {
    data: Mutex<Data>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn insert_problem(&self, problem: Problem) {
        let mut data = self.data.lock().unwrap();
        data.problems.insert(problem.name.clone(), problem);
    }

    pub fn insert_user(&self, user: User) {
        let mut data = self.data.lock().unwrap();
        data.users.insert(user.name.clone(), user);
    }

    /// Lock claim with an explicit clock, so lease expiry is testable.
    pub fn try_lock_at(&self, submission_id: i32, holder: &str, now: DateTime<Utc>) -> bool {
        let mut data = self.data.lock().unwrap();
        let row = data
            .locks
            .entry(submission_id)
            .or_insert_with(|| SubmissionLockRow {
                submission: submission_id,
                holder: holder.to_string(),
                ping: DateTime::<Utc>::UNIX_EPOCH,
            });
        if row.holder != holder && row.is_live(now) {
            return false;
        }
        row.holder = holder.to_string();
        row.ping = now;
        true
    }

    pub fn unlock_at(&self, submission_id: i32, holder: &str, now: DateTime<Utc>) -> Result<()> {
        if !self.try_lock_at(submission_id, holder, now) {
            anyhow::bail!(
                "failed to re-acquire lock on submission {} for {}",
                submission_id,
                holder
            );
        }
        let mut data = self.data.lock().unwrap();
        data.locks.remove(&submission_id);
        Ok(())
    }

    /// The current lock row, if any (inspection hook).
    pub fn lock_row(&self, submission_id: i32) -> Option<SubmissionLockRow> {
        self.data.lock().unwrap().locks.get(&submission_id).cloned()
    }
}

fn matches(filter: &SubmissionFilter, s: &Submission) -> bool {
    if let Some(problem) = &filter.problem {
        if &s.problem_name != problem {
            return false;
        }
    }
    if let Some(status) = &filter.status {
        if &s.status != status {
            return false;
        }
    }
    if let Some(lang) = &filter.lang {
        if &s.lang != lang {
            return false;
        }
    }
    if let Some(user) = &filter.user {
        if s.user_name.as_deref() != Some(user.as_str()) {
            return false;
        }
    }
    true
}

#[async_trait]
impl SubmissionStore for MemoryStore {
    async fn fetch_submission(&self, id: i32) -> Result<Option<SubmissionDetail>> {
        let data = self.data.lock().unwrap();
        let submission = match data.submissions.get(&id) {
            Some(s) => s.clone(),
            None => return Ok(None),
        };
        let problem = data.problems.get(&submission.problem_name).cloned();
        let user = submission
            .user_name
            .as_ref()
            .and_then(|name| data.users.get(name))
            .cloned();
        Ok(Some(SubmissionDetail {
            submission,
            user,
            problem,
        }))
    }

    async fn save_submission(&self, mut submission: Submission) -> Result<i32> {
        if submission.id != 0 {
            anyhow::bail!("must not specify submission id");
        }
        let mut data = self.data.lock().unwrap();
        data.next_submission_id += 1;
        submission.id = data.next_submission_id;
        let id = submission.id;
        data.submissions.insert(id, submission);
        Ok(id)
    }

    async fn update_submission(&self, submission: &Submission) -> Result<()> {
        if submission.id == 0 {
            anyhow::bail!("must specify submission id");
        }
        let mut data = self.data.lock().unwrap();
        data.submissions.insert(submission.id, submission.clone());
        Ok(())
    }

    async fn clear_testcase_results(&self, submission_id: i32) -> Result<()> {
        let mut data = self.data.lock().unwrap();
        data.testcase_results.retain(|(s, _), _| *s != submission_id);
        Ok(())
    }

    async fn save_testcase_result(&self, row: &TestcaseResultRow) -> Result<()> {
        let mut data = self.data.lock().unwrap();
        data.testcase_results
            .insert((row.submission, row.testcase.clone()), row.clone());
        Ok(())
    }

    async fn list_testcase_results(&self, submission_id: i32) -> Result<Vec<TestcaseResultRow>> {
        let data = self.data.lock().unwrap();
        let mut rows: Vec<_> = data
            .testcase_results
            .values()
            .filter(|r| r.submission == submission_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.testcase.cmp(&b.testcase));
        Ok(rows)
    }

    async fn list_submissions(
        &self,
        filter: &SubmissionFilter,
        order: &[SubmissionOrder],
        offset: i64,
        limit: i64,
    ) -> Result<(Vec<SubmissionOverview>, i64)> {
        let data = self.data.lock().unwrap();
        let mut selected: Vec<&Submission> = data
            .submissions
            .values()
            .filter(|s| matches(filter, s))
            .collect();
        let count = selected.len() as i64;

        selected.sort_by(|a, b| {
            for o in order {
                let ord = match o {
                    SubmissionOrder::IdDesc => b.id.cmp(&a.id),
                    SubmissionOrder::MaxTimeAsc => a.max_time.cmp(&b.max_time),
                };
                if ord != std::cmp::Ordering::Equal {
                    return ord;
                }
            }
            a.id.cmp(&b.id)
        });

        let overviews = selected
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .map(|s| SubmissionOverview {
                id: s.id,
                submission_time: s.submission_time,
                problem_name: s.problem_name.clone(),
                problem_title: data.problems.get(&s.problem_name).map(|p| p.title.clone()),
                lang: s.lang.clone(),
                status: s.status.clone(),
                testcases_version: s.testcases_version.clone(),
                max_time: s.max_time,
                max_memory: s.max_memory,
                user_name: s.user_name.clone(),
            })
            .collect();

        Ok((overviews, count))
    }

    async fn try_lock(&self, submission_id: i32, holder: &str) -> Result<bool> {
        Ok(self.try_lock_at(submission_id, holder, Utc::now()))
    }

    async fn unlock(&self, submission_id: i32, holder: &str) -> Result<()> {
        self.unlock_at(submission_id, holder, Utc::now())
    }
}
