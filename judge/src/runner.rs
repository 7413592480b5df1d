//! Sandboxed execution through the external `executor` supervisor
//!
//! The runner enforces nothing by itself; it shells out to the `executor`
//! binary (resolved via PATH), which applies the wall-clock limit and the
//! optional read-only filesystem overlay, then writes a machine-readable
//! result file. That file is the ground truth for what the supervised
//! program did; the supervisor's own exit status only tells us whether the
//! sandbox itself worked.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};

use serde::Deserialize;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::debug;

use crate::output_cap::{OutputCap, TeeWriter};

/// Name of the sandbox supervisor binary, resolved via the ambient PATH.
pub const EXECUTOR_BIN: &str = "executor";

/// Exit code the executor reserves for "the program hit the time limit".
/// Any other non-zero exit means the sandbox itself malfunctioned.
pub const EXECUTOR_TIMEOUT_EXIT: i32 = 124;

/// Stderr capture limit per invocation.
pub const STDERR_CAP_BYTES: usize = 2048;

/// Result of one supervised process invocation.
///
/// If `tle` is set the sandbox killed the process for exceeding wall-clock
/// and `return_code` is not meaningful as a program exit.
#[derive(Debug, Clone)]
pub struct RunResult {
    /// Exit code of the supervised program, from the result file.
    pub return_code: i32,
    /// Wall-clock seconds consumed.
    pub time_s: f64,
    /// Peak memory in bytes.
    pub memory_bytes: i64,
    /// Whether the sandbox killed the program for exceeding the limit.
    pub tle: bool,
    /// Capped stderr of the invocation.
    pub stderr: Vec<u8>,
    /// The executor's own exit code (0 or 124 on a healthy run).
    pub executor_code: i32,
}

impl RunResult {
    /// Placeholder attached to failed invocations: negative telemetry so it
    /// can never be mistaken for a real measurement.
    pub fn sentinel(executor_code: i32, stderr: Vec<u8>) -> Self {
        Self {
            return_code: -1,
            time_s: -1.0,
            memory_bytes: -1,
            tle: false,
            stderr,
            executor_code,
        }
    }
}

/// Result document the executor writes, decoded from JSON.
#[derive(Debug, Deserialize)]
struct ExecutorReport {
    returncode: i32,
    time: f64,
    memory: i64,
    tle: bool,
}

/// Executor-level failure. Judged outcomes (TLE, non-zero program exits) are
/// not errors; these are the cases where the sandbox could not do its job.
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("failed to spawn {EXECUTOR_BIN} (is it on PATH?): {source}")]
    Spawn {
        #[source]
        source: std::io::Error,
    },
    #[error("{EXECUTOR_BIN} exited with code {code}")]
    ExecutorFailed { code: i32, result: RunResult },
    #[error("failed to set up process i/o: {source}")]
    Io {
        #[source]
        source: std::io::Error,
    },
    #[error("{EXECUTOR_BIN} wrote no usable result: {source}")]
    BadResult {
        #[source]
        source: anyhow::Error,
    },
}

impl RunnerError {
    /// Best-effort telemetry for the failed invocation.
    pub fn into_result(self) -> RunResult {
        match self {
            RunnerError::ExecutorFailed { result, .. } => result,
            _ => RunResult::sentinel(-1, Vec::new()),
        }
    }
}

/// Specification of one supervised invocation.
///
/// stdin/stdout default to the worker's own; stderr is always drained
/// through an [`OutputCap`] and can additionally be forwarded to the
/// operator's stderr.
#[derive(Debug, Clone)]
pub struct RunSpec {
    pub command: Vec<String>,
    pub work_dir: PathBuf,
    pub stdin: Option<PathBuf>,
    pub stdout: Option<PathBuf>,
    pub forward_stderr: bool,
}

impl RunSpec {
    pub fn new(command: Vec<String>, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            command,
            work_dir: work_dir.into(),
            stdin: None,
            stdout: None,
            forward_stderr: false,
        }
    }

    pub fn with_stdin(mut self, path: impl Into<PathBuf>) -> Self {
        self.stdin = Some(path.into());
        self
    }

    pub fn with_stdout(mut self, path: impl Into<PathBuf>) -> Self {
        self.stdout = Some(path.into());
        self
    }

    pub fn with_forwarded_stderr(mut self) -> Self {
        self.forward_stderr = true;
        self
    }
}

/// Assemble the executor argv for a supervised command.
fn build_executor_args(
    time_limit_s: f64,
    overlay: bool,
    result_path: &Path,
    command: &[String],
) -> Vec<String> {
    let mut args = vec!["--tl".to_string(), format!("{:.4}", time_limit_s)];
    if overlay {
        args.push("--overlay".to_string());
    }
    args.push("--result".to_string());
    args.push(result_path.to_string_lossy().into_owned());
    args.push("--".to_string());
    args.extend(command.iter().cloned());
    args
}

/// Shared handle so the stderr pump and the caller both see the cap.
struct SharedCap(Arc<Mutex<OutputCap>>);

impl Write for SharedCap {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.0.lock().unwrap().flush()
    }
}

/// Run a command under the executor with the given wall-clock limit.
///
/// With `overlay` the child sees a read-only overlay of its working
/// directory and cannot persist mutations back to the host.
pub async fn safe_run(
    spec: &RunSpec,
    time_limit_s: f64,
    overlay: bool,
) -> Result<RunResult, RunnerError> {
    let result_file = tempfile::NamedTempFile::new().map_err(|source| RunnerError::Io { source })?;
    let args = build_executor_args(time_limit_s, overlay, result_file.path(), &spec.command);

    debug!("executor invocation: {:?}", args);

    let mut cmd = Command::new(EXECUTOR_BIN);
    cmd.args(&args).current_dir(&spec.work_dir);

    if let Some(path) = &spec.stdin {
        let file = std::fs::File::open(path).map_err(|source| RunnerError::Io { source })?;
        cmd.stdin(Stdio::from(file));
    }
    if let Some(path) = &spec.stdout {
        let file = std::fs::File::create(path).map_err(|source| RunnerError::Io { source })?;
        cmd.stdout(Stdio::from(file));
    }
    cmd.stderr(Stdio::piped());

    let mut child = cmd.spawn().map_err(|source| RunnerError::Spawn { source })?;

    let cap = Arc::new(Mutex::new(OutputCap::new(STDERR_CAP_BYTES)));
    let mut sinks: Vec<Box<dyn Write + Send>> = vec![Box::new(SharedCap(cap.clone()))];
    if spec.forward_stderr {
        sinks.push(Box::new(std::io::stderr()));
    }
    let mut tee = TeeWriter::new(sinks);

    let mut stderr_pipe = child.stderr.take().ok_or_else(|| RunnerError::BadResult {
        source: anyhow::anyhow!("child stderr pipe missing"),
    })?;
    let pump = tokio::spawn(async move {
        let mut buf = [0u8; 8192];
        loop {
            match stderr_pipe.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if tee.write_all(&buf[..n]).is_err() {
                        break;
                    }
                }
            }
        }
    });

    let status = child
        .wait()
        .await
        .map_err(|source| RunnerError::Io { source })?;
    let _ = pump.await;

    let stderr = cap.lock().unwrap().snapshot();
    let code = status.code().unwrap_or(-1);

    if !status.success() && code != EXECUTOR_TIMEOUT_EXIT {
        return Err(RunnerError::ExecutorFailed {
            code,
            result: RunResult::sentinel(code, stderr),
        });
    }

    let raw = std::fs::read(result_file.path()).map_err(|source| RunnerError::BadResult {
        source: source.into(),
    })?;
    let report: ExecutorReport =
        serde_json::from_slice(&raw).map_err(|source| RunnerError::BadResult {
            source: source.into(),
        })?;

    debug!(
        "executor report: returncode={} time={:.3}s memory={}B tle={}",
        report.returncode, report.time, report.memory, report.tle
    );

    Ok(RunResult {
        return_code: report.returncode,
        time_s: report.time,
        memory_bytes: report.memory,
        tle: report.tle,
        stderr,
        executor_code: code,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_executor_args_shape() {
        let args = build_executor_args(
            2.0,
            true,
            Path::new("/tmp/result.json"),
            &["./main".to_string(), "--flag".to_string()],
        );
        assert_eq!(
            args,
            vec![
                "--tl",
                "2.0000",
                "--overlay",
                "--result",
                "/tmp/result.json",
                "--",
                "./main",
                "--flag"
            ]
        );
    }

    #[test]
    fn test_executor_args_without_overlay() {
        let args = build_executor_args(30.0, false, Path::new("/tmp/r"), &["g++".to_string()]);
        assert!(!args.contains(&"--overlay".to_string()));
        assert_eq!(args[1], "30.0000");
    }

    #[test]
    fn test_report_decoding() {
        let raw = br#"{"returncode": 1, "time": 0.25, "memory": 1048576, "tle": false}"#;
        let report: ExecutorReport = serde_json::from_slice(raw).unwrap();
        assert_eq!(report.returncode, 1);
        assert_eq!(report.memory, 1_048_576);
        assert!(!report.tle);
    }

    #[test]
    fn test_sentinel_is_negative() {
        let result = RunResult::sentinel(2, b"boom".to_vec());
        assert_eq!(result.return_code, -1);
        assert_eq!(result.time_s, -1.0);
        assert_eq!(result.memory_bytes, -1);
        assert_eq!(result.executor_code, 2);
    }
}
