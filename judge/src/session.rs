//! Per-submission judging session
//!
//! A session owns a temporary working tree with a fixed layout:
//!
//! ```text
//! <work_dir>/
//!   checker/  checker.cpp testlib.h checker input.in expect.out actual.out
//!   source/   <lang.source> + compiler artifacts
//! ```
//!
//! Both subdirectories are mode 0777 so the sandboxed child, which may run
//! under a different uid, can write its outputs into them. Case runs go
//! through the read-only overlay, so the host tree still cannot be mutated
//! by the submission. The tree is removed when the session is dropped.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tempfile::TempDir;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tracing::{debug, error, info};

use crate::languages::{self, LanguageSpec};
use crate::runner::{safe_run, RunResult, RunSpec, RunnerError, EXECUTOR_TIMEOUT_EXIT};
use crate::verdict::Verdict;

/// Wall-clock limit for compile steps.
pub const COMPILE_TIME_LIMIT_S: f64 = 30.0;

/// Outcome of judging one test case.
///
/// `run` is the submission's own run (time/memory), not the checker's;
/// `checker_out` keeps the checker's capped stderr for diagnostics.
#[derive(Debug, Clone)]
pub struct CaseResult {
    pub case_name: String,
    pub status: Verdict,
    pub run: RunResult,
    pub checker_out: Vec<u8>,
}

pub struct JudgeSession {
    work_dir: TempDir,
    lang: LanguageSpec,
    time_limit_s: f64,
}

impl JudgeSession {
    /// Set up the working tree for one submission.
    ///
    /// `work_dir` must be empty and exclusively owned; the session takes it
    /// over and removes it on drop. `support_header` is the worker-bundled
    /// testlib.h copied next to every checker source.
    pub async fn new(
        work_dir: TempDir,
        lang_id: &str,
        support_header: &Path,
        checker_source: impl AsyncRead + Unpin,
        submission_source: impl AsyncRead + Unpin,
        time_limit_s: f64,
    ) -> Result<Self> {
        let lang = languages::get_language(lang_id);

        let checker_dir = work_dir.path().join("checker");
        let source_dir = work_dir.path().join("source");
        for dir in [&checker_dir, &source_dir] {
            tokio::fs::create_dir(dir)
                .await
                .with_context(|| format!("failed to create {}", dir.display()))?;
            tokio::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o777))
                .await
                .with_context(|| format!("failed to chmod {}", dir.display()))?;
        }

        copy_into(checker_source, &checker_dir.join("checker.cpp")).await?;
        tokio::fs::copy(support_header, checker_dir.join("testlib.h"))
            .await
            .with_context(|| {
                format!("failed to copy support header {}", support_header.display())
            })?;
        copy_into(submission_source, &source_dir.join(&lang.source)).await?;

        info!("judge session ready at {}", work_dir.path().display());

        Ok(Self {
            work_dir,
            lang,
            time_limit_s,
        })
    }

    pub fn path(&self) -> &Path {
        self.work_dir.path()
    }

    fn checker_dir(&self) -> PathBuf {
        self.work_dir.path().join("checker")
    }

    fn source_dir(&self) -> PathBuf {
        self.work_dir.path().join("source")
    }

    /// Compile the submission in `source/`. A non-zero `return_code` with
    /// captured stderr is the compile error to show the contestant; it is not
    /// an error of this call.
    pub async fn compile_source(&self) -> Result<RunResult> {
        let argv = tokenize_compile(&self.lang.compile)?;
        debug!("compiling source: {:?}", argv);
        let spec = RunSpec::new(argv, self.source_dir());
        safe_run(&spec, COMPILE_TIME_LIMIT_S, false)
            .await
            .context("source compile invocation failed")
    }

    /// Compile the checker in `checker/`; expected to produce the `checker`
    /// executable there.
    pub async fn compile_checker(&self) -> Result<RunResult> {
        let argv = tokenize_compile(&languages::checker_language().compile)?;
        debug!("compiling checker: {:?}", argv);
        let spec = RunSpec::new(argv, self.checker_dir());
        safe_run(&spec, COMPILE_TIME_LIMIT_S, false)
            .await
            .context("checker compile invocation failed")
    }

    /// Run the submission against one test case and verdict it.
    ///
    /// The three case files (`input.in`, `expect.out`, `actual.out`) are left
    /// on disk for post-mortem until the session is torn down.
    pub async fn run_case(
        &self,
        case_name: &str,
        input: impl AsyncRead + Unpin,
        expected: impl AsyncRead + Unpin,
    ) -> Result<CaseResult> {
        let checker_dir = self.checker_dir();
        copy_into(input, &checker_dir.join("input.in")).await?;
        copy_into(expected, &checker_dir.join("expect.out")).await?;
        tokio::fs::File::create(checker_dir.join("actual.out"))
            .await
            .context("failed to create actual.out")?;

        // Exec strings are trusted configuration: plain whitespace split.
        let argv: Vec<String> = self
            .lang
            .exec
            .split_whitespace()
            .map(str::to_string)
            .collect();
        if argv.is_empty() {
            anyhow::bail!("language has an empty exec command");
        }

        let spec = RunSpec::new(argv, self.source_dir())
            .with_stdin(checker_dir.join("input.in"))
            .with_stdout(checker_dir.join("actual.out"));

        let run = match safe_run(&spec, self.time_limit_s, true).await {
            Ok(run) => run,
            Err(err @ RunnerError::ExecutorFailed { .. }) => {
                error!("case {}: {}", case_name, err);
                return Ok(CaseResult {
                    case_name: case_name.to_string(),
                    status: Verdict::Broken,
                    run: err.into_result(),
                    checker_out: Vec::new(),
                });
            }
            Err(err) => return Err(err).context("submission run failed"),
        };

        if let Some(status) = submission_phase_verdict(&run) {
            if status == Verdict::Broken {
                error!(
                    "case {}: executor exited {} without reporting tle",
                    case_name, run.executor_code
                );
            }
            return Ok(CaseResult {
                case_name: case_name.to_string(),
                status,
                run,
                checker_out: Vec::new(),
            });
        }

        let checker_argv = vec![
            "./checker".to_string(),
            "input.in".to_string(),
            "actual.out".to_string(),
            "expect.out".to_string(),
        ];
        let checker_spec = RunSpec::new(checker_argv, checker_dir);
        let check = match safe_run(&checker_spec, self.time_limit_s, true).await {
            Ok(check) => check,
            Err(err @ RunnerError::ExecutorFailed { .. }) => {
                error!("case {}: checker: {}", case_name, err);
                let checker_out = err.into_result().stderr;
                return Ok(CaseResult {
                    case_name: case_name.to_string(),
                    status: Verdict::Broken,
                    run,
                    checker_out,
                });
            }
            Err(err) => return Err(err).context("checker run failed"),
        };

        let status = checker_phase_verdict(&check);
        if status == Verdict::Broken {
            error!(
                "case {}: checker executor exited {} without reporting tle",
                case_name, check.executor_code
            );
        }
        Ok(CaseResult {
            case_name: case_name.to_string(),
            status,
            run,
            checker_out: check.stderr,
        })
    }
}

/// Compile commands may carry quoted arguments with spaces.
fn tokenize_compile(command: &str) -> Result<Vec<String>> {
    let argv =
        shlex::split(command).with_context(|| format!("unparseable compile command: {command}"))?;
    if argv.is_empty() {
        anyhow::bail!("language has an empty compile command");
    }
    Ok(argv)
}

/// Interpret the submission's own run. `None` means the run is clean and the
/// checker decides the verdict.
fn submission_phase_verdict(run: &RunResult) -> Option<Verdict> {
    if run.tle {
        return Some(Verdict::TimeLimitExceeded);
    }
    if run.executor_code != 0 && run.executor_code != EXECUTOR_TIMEOUT_EXIT {
        return Some(Verdict::Broken);
    }
    if run.return_code != 0 {
        return Some(Verdict::RuntimeError);
    }
    None
}

/// Map the checker's exit onto a verdict.
fn checker_phase_verdict(check: &RunResult) -> Verdict {
    if check.tle {
        return Verdict::CheckerTimeLimitExceeded;
    }
    if check.executor_code != 0 && check.executor_code != EXECUTOR_TIMEOUT_EXIT {
        return Verdict::Broken;
    }
    match check.return_code {
        0 => Verdict::Accepted,
        1 => Verdict::WrongAnswer,
        2 => Verdict::PresentationError,
        3 => Verdict::CheckerFailed,
        _ => Verdict::Unknown,
    }
}

/// Reduce per-case results into the submission summary: worst status, max
/// time, max memory. When several cases are non-AC the last one in input
/// order wins; callers must not rely on which non-AC is chosen.
pub fn aggregate_results(results: &[CaseResult]) -> CaseResult {
    let mut total = CaseResult {
        case_name: String::new(),
        status: Verdict::Accepted,
        run: RunResult::sentinel(0, Vec::new()),
        checker_out: Vec::new(),
    };
    for result in results {
        if result.status != Verdict::Accepted {
            total.status = result.status;
        }
        if total.run.time_s < result.run.time_s {
            total.run.time_s = result.run.time_s;
        }
        if total.run.memory_bytes < result.run.memory_bytes {
            total.run.memory_bytes = result.run.memory_bytes;
        }
    }
    total
}

async fn copy_into(mut reader: impl AsyncRead + Unpin, dest: &Path) -> Result<()> {
    let mut file = tokio::fs::File::create(dest)
        .await
        .with_context(|| format!("failed to create {}", dest.display()))?;
    tokio::io::copy(&mut reader, &mut file)
        .await
        .with_context(|| format!("failed to write {}", dest.display()))?;
    file.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(return_code: i32, tle: bool, executor_code: i32) -> RunResult {
        RunResult {
            return_code,
            time_s: 0.1,
            memory_bytes: 1024,
            tle,
            stderr: Vec::new(),
            executor_code,
        }
    }

    fn case(name: &str, status: Verdict, time_s: f64, memory_bytes: i64) -> CaseResult {
        CaseResult {
            case_name: name.to_string(),
            status,
            run: RunResult {
                return_code: 0,
                time_s,
                memory_bytes,
                tle: false,
                stderr: Vec::new(),
                executor_code: 0,
            },
            checker_out: Vec::new(),
        }
    }

    #[test]
    fn test_submission_phase_ladder() {
        assert_eq!(
            submission_phase_verdict(&run(0, true, 124)),
            Some(Verdict::TimeLimitExceeded)
        );
        assert_eq!(
            submission_phase_verdict(&run(0, false, 2)),
            Some(Verdict::Broken)
        );
        assert_eq!(
            submission_phase_verdict(&run(1, false, 0)),
            Some(Verdict::RuntimeError)
        );
        assert_eq!(submission_phase_verdict(&run(0, false, 0)), None);
    }

    #[test]
    fn test_tle_wins_over_exit_code() {
        // a killed program reports a junk return code; tle is authoritative
        assert_eq!(
            submission_phase_verdict(&run(137, true, 124)),
            Some(Verdict::TimeLimitExceeded)
        );
    }

    #[test]
    fn test_checker_phase_exit_codes() {
        assert_eq!(checker_phase_verdict(&run(0, false, 0)), Verdict::Accepted);
        assert_eq!(
            checker_phase_verdict(&run(1, false, 0)),
            Verdict::WrongAnswer
        );
        assert_eq!(
            checker_phase_verdict(&run(2, false, 0)),
            Verdict::PresentationError
        );
        assert_eq!(
            checker_phase_verdict(&run(3, false, 0)),
            Verdict::CheckerFailed
        );
        assert_eq!(checker_phase_verdict(&run(7, false, 0)), Verdict::Unknown);
        assert_eq!(
            checker_phase_verdict(&run(0, true, 124)),
            Verdict::CheckerTimeLimitExceeded
        );
        assert_eq!(checker_phase_verdict(&run(0, false, 3)), Verdict::Broken);
    }

    #[test]
    fn test_aggregate_empty_is_sentinel() {
        let total = aggregate_results(&[]);
        assert_eq!(total.status, Verdict::Accepted);
        assert_eq!(total.run.time_s, -1.0);
        assert_eq!(total.run.memory_bytes, -1);
    }

    #[test]
    fn test_aggregate_all_accepted() {
        let total = aggregate_results(&[
            case("00", Verdict::Accepted, 0.5, 2048),
            case("01", Verdict::Accepted, 0.2, 4096),
        ]);
        assert_eq!(total.status, Verdict::Accepted);
        assert_eq!(total.run.time_s, 0.5);
        assert_eq!(total.run.memory_bytes, 4096);
    }

    #[test]
    fn test_aggregate_any_rejection_wins() {
        let total = aggregate_results(&[
            case("00", Verdict::Accepted, 0.1, 100),
            case("01", Verdict::WrongAnswer, 0.9, 300),
            case("02", Verdict::Accepted, 0.4, 200),
        ]);
        assert_eq!(total.status, Verdict::WrongAnswer);
        assert_eq!(total.run.time_s, 0.9);
        assert_eq!(total.run.memory_bytes, 300);
    }

    #[test]
    fn test_aggregate_last_rejection_in_order() {
        let total = aggregate_results(&[
            case("00", Verdict::WrongAnswer, 0.1, 100),
            case("01", Verdict::RuntimeError, 0.1, 100),
        ]);
        assert_eq!(total.status, Verdict::RuntimeError);
    }

    #[test]
    fn test_aggregate_singleton_matches_input() {
        let only = case("00", Verdict::TimeLimitExceeded, 1.0, 12345);
        let total = aggregate_results(std::slice::from_ref(&only));
        assert_eq!(total.status, only.status);
        assert_eq!(total.run.time_s, only.run.time_s);
        assert_eq!(total.run.memory_bytes, only.run.memory_bytes);
    }
}
