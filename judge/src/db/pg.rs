//! Postgres store
//!
//! The lock protocol runs in a single transaction around a `FOR UPDATE`
//! select, so two workers racing for the same submission serialize on the
//! row and exactly one of them sees a live foreign lease.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};

use super::{
    Problem, Submission, SubmissionDetail, SubmissionFilter, SubmissionLockRow, SubmissionOrder,
    SubmissionOverview, SubmissionStore, TestcaseResultRow, User,
};

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(4)
            .connect(url)
            .await
            .context("failed to connect to postgres")?;
        Ok(Self { pool })
    }

    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn push_filter(qb: &mut QueryBuilder<'_, Postgres>, filter: &SubmissionFilter) {
    if let Some(problem) = &filter.problem {
        qb.push(" AND s.problem_name = ").push_bind(problem.clone());
    }
    if let Some(status) = &filter.status {
        qb.push(" AND s.status = ").push_bind(status.clone());
    }
    if let Some(lang) = &filter.lang {
        qb.push(" AND s.lang = ").push_bind(lang.clone());
    }
    if let Some(user) = &filter.user {
        qb.push(" AND s.user_name = ").push_bind(user.clone());
    }
}

#[async_trait]
impl SubmissionStore for PgStore {
    async fn fetch_submission(&self, id: i32) -> Result<Option<SubmissionDetail>> {
        let submission: Option<Submission> = sqlx::query_as(
            "SELECT id, submission_time, problem_name, lang, status, prev_status, hacked, \
             source, testcases_version, max_time, max_memory, compile_error, user_name, \
             judged_time FROM submissions WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("failed to fetch submission")?;

        let submission = match submission {
            Some(s) => s,
            None => return Ok(None),
        };

        let problem: Option<Problem> = sqlx::query_as(
            "SELECT name, title, timelimit, testcases_version FROM problems WHERE name = $1",
        )
        .bind(&submission.problem_name)
        .fetch_optional(&self.pool)
        .await
        .context("failed to fetch problem")?;

        let user: Option<User> = match &submission.user_name {
            Some(name) => sqlx::query_as("SELECT name FROM users WHERE name = $1")
                .bind(name)
                .fetch_optional(&self.pool)
                .await
                .context("failed to fetch user")?,
            None => None,
        };

        Ok(Some(SubmissionDetail {
            submission,
            user,
            problem,
        }))
    }

    async fn save_submission(&self, submission: Submission) -> Result<i32> {
        if submission.id != 0 {
            anyhow::bail!("must not specify submission id");
        }
        let row = sqlx::query(
            "INSERT INTO submissions (submission_time, problem_name, lang, status, \
             prev_status, hacked, source, testcases_version, max_time, max_memory, \
             compile_error, user_name, judged_time) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13) RETURNING id",
        )
        .bind(submission.submission_time)
        .bind(&submission.problem_name)
        .bind(&submission.lang)
        .bind(&submission.status)
        .bind(&submission.prev_status)
        .bind(submission.hacked)
        .bind(&submission.source)
        .bind(&submission.testcases_version)
        .bind(submission.max_time)
        .bind(submission.max_memory)
        .bind(&submission.compile_error)
        .bind(&submission.user_name)
        .bind(submission.judged_time)
        .fetch_one(&self.pool)
        .await
        .context("failed to insert submission")?;
        Ok(row.get::<i32, _>(0))
    }

    async fn update_submission(&self, submission: &Submission) -> Result<()> {
        if submission.id == 0 {
            anyhow::bail!("must specify submission id");
        }
        sqlx::query(
            "UPDATE submissions SET submission_time = $2, problem_name = $3, lang = $4, \
             status = $5, prev_status = $6, hacked = $7, source = $8, \
             testcases_version = $9, max_time = $10, max_memory = $11, \
             compile_error = $12, user_name = $13, judged_time = $14 WHERE id = $1",
        )
        .bind(submission.id)
        .bind(submission.submission_time)
        .bind(&submission.problem_name)
        .bind(&submission.lang)
        .bind(&submission.status)
        .bind(&submission.prev_status)
        .bind(submission.hacked)
        .bind(&submission.source)
        .bind(&submission.testcases_version)
        .bind(submission.max_time)
        .bind(submission.max_memory)
        .bind(&submission.compile_error)
        .bind(&submission.user_name)
        .bind(submission.judged_time)
        .execute(&self.pool)
        .await
        .context("failed to update submission")?;
        Ok(())
    }

    async fn clear_testcase_results(&self, submission_id: i32) -> Result<()> {
        sqlx::query("DELETE FROM submission_testcase_results WHERE submission = $1")
            .bind(submission_id)
            .execute(&self.pool)
            .await
            .context("failed to clear testcase results")?;
        Ok(())
    }

    async fn save_testcase_result(&self, row: &TestcaseResultRow) -> Result<()> {
        sqlx::query(
            "INSERT INTO submission_testcase_results \
             (submission, testcase, status, time, memory, stderr, checker_out) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) \
             ON CONFLICT (submission, testcase) DO UPDATE SET \
             status = EXCLUDED.status, time = EXCLUDED.time, memory = EXCLUDED.memory, \
             stderr = EXCLUDED.stderr, checker_out = EXCLUDED.checker_out",
        )
        .bind(row.submission)
        .bind(&row.testcase)
        .bind(&row.status)
        .bind(row.time)
        .bind(row.memory)
        .bind(&row.stderr)
        .bind(&row.checker_out)
        .execute(&self.pool)
        .await
        .context("failed to save testcase result")?;
        Ok(())
    }

    async fn list_testcase_results(&self, submission_id: i32) -> Result<Vec<TestcaseResultRow>> {
        let rows = sqlx::query_as(
            "SELECT submission, testcase, status, time, memory, stderr, checker_out \
             FROM submission_testcase_results WHERE submission = $1 ORDER BY testcase",
        )
        .bind(submission_id)
        .fetch_all(&self.pool)
        .await
        .context("failed to list testcase results")?;
        Ok(rows)
    }

    async fn list_submissions(
        &self,
        filter: &SubmissionFilter,
        order: &[SubmissionOrder],
        offset: i64,
        limit: i64,
    ) -> Result<(Vec<SubmissionOverview>, i64)> {
        let mut count_qb =
            QueryBuilder::<Postgres>::new("SELECT count(*) FROM submissions s WHERE TRUE");
        push_filter(&mut count_qb, filter);
        let count: i64 = count_qb
            .build()
            .fetch_one(&self.pool)
            .await
            .context("submission count query failed")?
            .get(0);

        let mut qb = QueryBuilder::<Postgres>::new(
            "SELECT s.id, s.submission_time, s.problem_name, p.title AS problem_title, \
             s.lang, s.status, s.testcases_version, s.max_time, s.max_memory, s.user_name \
             FROM submissions s LEFT JOIN problems p ON p.name = s.problem_name WHERE TRUE",
        );
        push_filter(&mut qb, filter);
        if !order.is_empty() {
            qb.push(" ORDER BY ");
            for (i, o) in order.iter().enumerate() {
                if i > 0 {
                    qb.push(", ");
                }
                match o {
                    SubmissionOrder::IdDesc => qb.push("s.id DESC"),
                    SubmissionOrder::MaxTimeAsc => qb.push("s.max_time ASC"),
                };
            }
        }
        qb.push(" OFFSET ").push_bind(offset);
        qb.push(" LIMIT ").push_bind(limit);

        let rows = qb
            .build_query_as::<SubmissionOverview>()
            .fetch_all(&self.pool)
            .await
            .context("submission list query failed")?;

        Ok((rows, count))
    }

    async fn try_lock(&self, submission_id: i32, holder: &str) -> Result<bool> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await.context("failed to open lock tx")?;

        // A fresh row carries the zero timestamp so the creator's first claim
        // always succeeds.
        sqlx::query(
            "INSERT INTO submission_locks (submission, holder, ping) \
             VALUES ($1, $2, to_timestamp(0)) ON CONFLICT (submission) DO NOTHING",
        )
        .bind(submission_id)
        .bind(holder)
        .execute(&mut *tx)
        .await
        .context("failed to seed lock row")?;

        let row: SubmissionLockRow = sqlx::query_as(
            "SELECT submission, holder, ping FROM submission_locks \
             WHERE submission = $1 FOR UPDATE",
        )
        .bind(submission_id)
        .fetch_one(&mut *tx)
        .await
        .context("failed to select lock row")?;

        if row.holder != holder && row.is_live(now) {
            // live foreign lease; dropping the tx rolls the seed back
            return Ok(false);
        }

        sqlx::query("UPDATE submission_locks SET holder = $2, ping = $3 WHERE submission = $1")
            .bind(submission_id)
            .bind(holder)
            .bind(now)
            .execute(&mut *tx)
            .await
            .context("failed to refresh lock row")?;
        tx.commit().await.context("failed to commit lock tx")?;

        Ok(true)
    }

    async fn unlock(&self, submission_id: i32, holder: &str) -> Result<()> {
        if !self.try_lock(submission_id, holder).await? {
            anyhow::bail!(
                "failed to re-acquire lock on submission {} for {}",
                submission_id,
                holder
            );
        }
        sqlx::query("DELETE FROM submission_locks WHERE submission = $1")
            .bind(submission_id)
            .execute(&self.pool)
            .await
            .context("failed to delete lock row")?;
        Ok(())
    }
}
