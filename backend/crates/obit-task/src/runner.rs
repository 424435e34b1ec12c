//! Task execution: the [`TaskRunner`] seam and the subprocess implementation.

use std::io::Write as _;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;

use crate::error::{Error, Result};
use crate::params::TaskParams;

/// A fully described task invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    /// Task name, e.g. `UVBlAvg` or `MFImage`
    pub name: String,
    pub params: TaskParams,
    /// Wall-clock limit; `None` waits indefinitely
    pub timeout: Option<Duration>,
}

impl TaskSpec {
    pub fn new(name: impl Into<String>, params: TaskParams) -> Self {
        Self {
            name: name.into(),
            params,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// How a task invocation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status", content = "code")]
pub enum TaskStatus {
    Success,
    /// Non-zero exit; `None` when terminated by a signal
    Failed(Option<i32>),
    TimedOut,
}

impl TaskStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, TaskStatus::Success)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Success => write!(f, "exit 0"),
            TaskStatus::Failed(Some(code)) => write!(f, "exit {}", code),
            TaskStatus::Failed(None) => write!(f, "terminated by signal"),
            TaskStatus::TimedOut => write!(f, "timed out"),
        }
    }
}

/// Result of one task invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskOutcome {
    pub status: TaskStatus,
    /// Captured stdout and stderr lines in arrival order
    pub log: Vec<String>,
    pub elapsed: Duration,
}

impl TaskOutcome {
    pub fn success(log: Vec<String>) -> Self {
        Self {
            status: TaskStatus::Success,
            log,
            elapsed: Duration::ZERO,
        }
    }

    pub fn failed(code: i32) -> Self {
        Self {
            status: TaskStatus::Failed(Some(code)),
            log: Vec::new(),
            elapsed: Duration::ZERO,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }
}

/// Something that can execute a task to completion.
///
/// `Err` is reserved for failures to launch; a task that ran and failed is an
/// `Ok` outcome with a non-success [`TaskStatus`].
#[async_trait]
pub trait TaskRunner: Send + Sync {
    async fn run(&self, spec: &TaskSpec) -> Result<TaskOutcome>;
}

/// Runs Obit tasks as child processes.
///
/// The executable `<exec_dir>/<TaskName>` is started with `-input <file>`,
/// where the file holds the rendered parameters.
#[derive(Debug, Clone)]
pub struct ProcessTaskRunner {
    exec_dir: PathBuf,
    work_dir: PathBuf,
}

impl ProcessTaskRunner {
    pub fn new(exec_dir: impl Into<PathBuf>, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            exec_dir: exec_dir.into(),
            work_dir: work_dir.into(),
        }
    }

    pub fn executable(&self, task: &str) -> PathBuf {
        self.exec_dir.join(task)
    }

    fn write_parameter_file(&self, spec: &TaskSpec) -> Result<tempfile::NamedTempFile> {
        std::fs::create_dir_all(&self.work_dir)?;
        let mut file = tempfile::Builder::new()
            .prefix(&format!("{}.", spec.name))
            .suffix(".inp")
            .tempfile_in(&self.work_dir)?;
        file.write_all(spec.params.to_parameter_file().as_bytes())?;
        file.flush()?;
        Ok(file)
    }
}

#[async_trait]
impl TaskRunner for ProcessTaskRunner {
    async fn run(&self, spec: &TaskSpec) -> Result<TaskOutcome> {
        let input = self.write_parameter_file(spec)?;
        let executable = self.executable(&spec.name);
        debug!(
            "Launching {} with {} parameters ({})",
            executable.display(),
            spec.params.len(),
            input.path().display()
        );

        let started = Instant::now();
        let mut child = Command::new(&executable)
            .arg("-input")
            .arg(input.path())
            .current_dir(&self.work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| Error::Spawn {
                task: spec.name.clone(),
                source,
            })?;

        let stdout = child.stdout.take().map(|s| capture(spec.name.clone(), s));
        let stderr = child.stderr.take().map(|s| capture(spec.name.clone(), s));

        let status = match spec.timeout {
            Some(limit) => match tokio::time::timeout(limit, child.wait()).await {
                Ok(waited) => Some(waited?),
                Err(_) => {
                    warn!("{} exceeded {:?}, killing", spec.name, limit);
                    child.kill().await?;
                    None
                }
            },
            None => Some(child.wait().await?),
        };

        let mut log = Vec::new();
        for handle in [stdout, stderr].into_iter().flatten() {
            if let Ok(lines) = handle.await {
                log.extend(lines);
            }
        }

        let status = match status {
            Some(s) if s.success() => TaskStatus::Success,
            Some(s) => TaskStatus::Failed(s.code()),
            None => TaskStatus::TimedOut,
        };
        let elapsed = started.elapsed();
        info!("{} finished: {} after {:.1?}", spec.name, status, elapsed);

        Ok(TaskOutcome {
            status,
            log,
            elapsed,
        })
    }
}

fn capture<R>(task: String, stream: R) -> tokio::task::JoinHandle<Vec<String>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        let mut captured = Vec::new();
        while let Ok(Some(line)) = lines.next_line().await {
            info!(target: "obit", "{}: {}", task, line);
            captured.push(line);
        }
        captured
    })
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;

    fn install_script(dir: &Path, name: &str, body: &str) {
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
    }

    #[tokio::test]
    async fn test_process_runner_captures_log_and_status() {
        let dir = tempfile::tempdir().unwrap();
        install_script(dir.path(), "Echo", "cat \"$2\"; exit 0");
        let runner = ProcessTaskRunner::new(dir.path(), dir.path());

        let spec = TaskSpec::new("Echo", TaskParams::new().with("FOV", 1.5));
        let outcome = runner.run(&spec).await.unwrap();

        assert!(outcome.is_success());
        assert!(outcome.log.iter().any(|l| l == "$Key = FOV Flt (1)"));
    }

    #[tokio::test]
    async fn test_process_runner_reports_nonzero_exit() {
        let dir = tempfile::tempdir().unwrap();
        install_script(dir.path(), "Broken", "echo boom >&2; exit 3");
        let runner = ProcessTaskRunner::new(dir.path(), dir.path());

        let outcome = runner
            .run(&TaskSpec::new("Broken", TaskParams::new()))
            .await
            .unwrap();

        assert_eq!(outcome.status, TaskStatus::Failed(Some(3)));
        assert_eq!(outcome.log, vec!["boom".to_string()]);
    }

    #[tokio::test]
    async fn test_process_runner_times_out() {
        let dir = tempfile::tempdir().unwrap();
        install_script(dir.path(), "Sleepy", "exec sleep 5");
        let runner = ProcessTaskRunner::new(dir.path(), dir.path());

        let spec = TaskSpec::new("Sleepy", TaskParams::new())
            .with_timeout(Duration::from_millis(100));
        let outcome = runner.run(&spec).await.unwrap();

        assert_eq!(outcome.status, TaskStatus::TimedOut);
    }

    #[tokio::test]
    async fn test_missing_executable_is_spawn_error() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ProcessTaskRunner::new(dir.path(), dir.path());
        let err = runner
            .run(&TaskSpec::new("Nope", TaskParams::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Spawn { .. }));
    }
}
