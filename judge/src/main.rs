//! Judge worker entry point
//!
//! One worker owns one submission at a time. The submissions table is the
//! queue; the lock table is the only coordination between workers. A worker
//! that dies mid-judgement simply stops heartbeating and its claim expires.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::time::{sleep, Duration};
use tracing::{error, info, warn};

use judge::db::{
    PgStore, SubmissionFilter, SubmissionOrder, SubmissionStore, TestcaseResultRow,
};
use judge::languages;
use judge::session::{aggregate_results, JudgeSession};
use judge::testcases;

/// Submission waiting to be judged.
const STATUS_WAITING: &str = "WJ";
/// Submission currently claimed by a worker.
const STATUS_JUDGING: &str = "Judging";
/// Submission whose source failed to compile.
const STATUS_COMPILE_ERROR: &str = "CE";

const POLL_INTERVAL: Duration = Duration::from_secs(3);
const CLAIM_BATCH: i64 = 10;

struct WorkerConfig {
    testcase_dir: PathBuf,
    testlib_path: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("judge=info".parse()?),
        )
        .init();

    dotenvy::dotenv().ok();

    let langs_path = std::env::var("LANGS_CONFIG").unwrap_or_else(|_| "files/langs.toml".into());
    languages::init_languages(&PathBuf::from(&langs_path))?;
    info!("loaded language configurations from {}", langs_path);

    let testlib_path =
        PathBuf::from(std::env::var("TESTLIB_PATH").unwrap_or_else(|_| "files/testlib.h".into()));
    anyhow::ensure!(
        testlib_path.is_file(),
        "support header not found at {}",
        testlib_path.display()
    );

    let config = WorkerConfig {
        testcase_dir: PathBuf::from(
            std::env::var("TESTCASE_DIR").unwrap_or_else(|_| "testcases".into()),
        ),
        testlib_path,
    };

    let db_url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
    let store: Arc<dyn SubmissionStore> = Arc::new(PgStore::connect(&db_url).await?);
    info!("connected to database");

    let judge_name = std::env::var("JUDGE_NAME").unwrap_or_else(|_| {
        format!(
            "{}:{}",
            std::env::var("HOSTNAME").unwrap_or_else(|_| "judge".into()),
            std::process::id()
        )
    });
    info!("judge worker {} started", judge_name);

    loop {
        match claim_next(store.as_ref(), &judge_name).await {
            Ok(Some(submission_id)) => {
                if let Err(err) =
                    judge_submission(store.as_ref(), &judge_name, submission_id, &config).await
                {
                    error!("judging submission {} failed: {:#}", submission_id, err);
                    // Hand it back to the queue; the lock is left to expire so
                    // another worker does not grab it in a tight loop.
                    if let Err(err) = requeue(store.as_ref(), submission_id).await {
                        error!("failed to requeue submission {}: {:#}", submission_id, err);
                    }
                }
            }
            Ok(None) => sleep(POLL_INTERVAL).await,
            Err(err) => {
                error!("claim poll failed: {:#}", err);
                sleep(POLL_INTERVAL).await;
            }
        }
    }
}

/// Find a waiting submission and take its lock. Newest first, like the rest
/// of the system lists them.
async fn claim_next(store: &dyn SubmissionStore, judge_name: &str) -> Result<Option<i32>> {
    let filter = SubmissionFilter {
        status: Some(STATUS_WAITING.to_string()),
        ..Default::default()
    };
    let (waiting, _) = store
        .list_submissions(&filter, &[SubmissionOrder::IdDesc], 0, CLAIM_BATCH)
        .await?;
    for overview in waiting {
        if store.try_lock(overview.id, judge_name).await? {
            info!("claimed submission {}", overview.id);
            return Ok(Some(overview.id));
        }
    }
    Ok(None)
}

async fn requeue(store: &dyn SubmissionStore, submission_id: i32) -> Result<()> {
    if let Some(detail) = store.fetch_submission(submission_id).await? {
        let mut submission = detail.submission;
        submission.status = STATUS_WAITING.to_string();
        store.update_submission(&submission).await?;
    }
    Ok(())
}

async fn judge_submission(
    store: &dyn SubmissionStore,
    judge_name: &str,
    submission_id: i32,
    config: &WorkerConfig,
) -> Result<()> {
    let detail = store
        .fetch_submission(submission_id)
        .await?
        .context("claimed submission no longer exists")?;
    let mut submission = detail.submission;
    let problem = detail
        .problem
        .with_context(|| format!("unknown problem {}", submission.problem_name))?;
    let time_limit_s = f64::from(problem.timelimit) / 1000.0;

    info!(
        "judging submission {} (problem={}, lang={}, tl={:.1}s)",
        submission_id, problem.name, submission.lang, time_limit_s
    );

    submission.prev_status = submission.status.clone();
    submission.status = STATUS_JUDGING.to_string();
    store.update_submission(&submission).await?;
    store.clear_testcase_results(submission_id).await?;

    let problem_files = testcases::load_problem(&config.testcase_dir, &problem.name)?;

    let work_dir = tempfile::tempdir().context("failed to create session directory")?;
    let checker_source = tokio::fs::File::open(&problem_files.checker)
        .await
        .with_context(|| format!("failed to open {}", problem_files.checker.display()))?;
    let session = JudgeSession::new(
        work_dir,
        &submission.lang,
        &config.testlib_path,
        checker_source,
        submission.source.as_bytes(),
        time_limit_s,
    )
    .await?;

    // A checker that does not compile is an operator problem, not the
    // contestant's; bail out and let the submission be retried.
    let checker_compile = session.compile_checker().await?;
    anyhow::ensure!(
        checker_compile.return_code == 0,
        "checker compile exited {}: {}",
        checker_compile.return_code,
        String::from_utf8_lossy(&checker_compile.stderr)
    );

    let compile = session.compile_source().await?;
    if compile.return_code != 0 {
        info!("submission {} failed to compile", submission_id);
        submission.compile_error = compile.stderr;
        submission.status = STATUS_COMPILE_ERROR.to_string();
        submission.judged_time = Some(Utc::now());
        store.update_submission(&submission).await?;
        store.unlock(submission_id, judge_name).await?;
        return Ok(());
    }

    let mut results = Vec::with_capacity(problem_files.cases.len());
    for case in &problem_files.cases {
        // Heartbeat between cases; losing the lease means another worker
        // considers us dead and will redo the submission.
        if !store.try_lock(submission_id, judge_name).await? {
            anyhow::bail!("lost lock on submission {}", submission_id);
        }

        let input = tokio::fs::File::open(&case.input)
            .await
            .with_context(|| format!("failed to open {}", case.input.display()))?;
        let expected = tokio::fs::File::open(&case.expected)
            .await
            .with_context(|| format!("failed to open {}", case.expected.display()))?;
        let result = session.run_case(&case.name, input, expected).await?;
        info!(
            "submission {} case {}: {} ({:.3}s, {}B)",
            submission_id, result.case_name, result.status, result.run.time_s, result.run.memory_bytes
        );

        store
            .save_testcase_result(&TestcaseResultRow {
                submission: submission_id,
                testcase: result.case_name.clone(),
                status: result.status.to_string(),
                time: (result.run.time_s * 1000.0) as i32,
                memory: result.run.memory_bytes,
                stderr: result.run.stderr.clone(),
                checker_out: result.checker_out.clone(),
            })
            .await?;
        results.push(result);
    }

    let total = aggregate_results(&results);
    submission.status = total.status.to_string();
    submission.max_time = (total.run.time_s * 1000.0) as i32;
    submission.max_memory = total.run.memory_bytes;
    submission.judged_time = Some(Utc::now());
    store.update_submission(&submission).await?;

    if let Err(err) = store.unlock(submission_id, judge_name).await {
        warn!("failed to release submission {}: {:#}", submission_id, err);
    }

    info!(
        "submission {} judged: {} (max {}ms, {}B)",
        submission_id, submission.status, submission.max_time, submission.max_memory
    );
    Ok(())
}
