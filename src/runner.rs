//! Script runner -- spawn a script, capture its output, enforce a hard timeout.
//!
//! Each script runs in its own process group so a timeout takes down anything
//! the script forked as well.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::RunnerConfig;
use crate::model::ResultStatus;

/// How long to wait for the output pipes to drain after the script exited.
const PIPE_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("failed to launch {path}: {source}")]
    Launch {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to wait for {path}: {source}")]
    Wait {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Raw result of one script process.
#[derive(Debug, Clone)]
pub struct ScriptOutcome {
    /// `None` when the process was killed by a signal (including our timeout).
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    pub duration: Duration,
}

/// Why a script was judged a failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    TimedOut(Duration),
    ExitCode(i32),
    Signalled,
    Marker(String),
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureReason::TimedOut(after) => write!(f, "timed out after {}s", after.as_secs()),
            FailureReason::ExitCode(code) => write!(f, "exited with code {code}"),
            FailureReason::Signalled => write!(f, "terminated by signal"),
            FailureReason::Marker(m) => write!(f, "failure marker '{m}' found in output"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScriptRunner {
    interpreter: Option<String>,
    media_root: PathBuf,
    timeout: Duration,
    failure_markers: Vec<String>,
}

impl ScriptRunner {
    pub fn new(config: &RunnerConfig, media_root: impl Into<PathBuf>) -> Self {
        let interpreter = Some(config.interpreter.trim().to_string()).filter(|s| !s.is_empty());
        Self {
            interpreter,
            media_root: media_root.into(),
            timeout: config.timeout(),
            failure_markers: config.failure_markers.clone(),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Script paths are relative to the media root unless absolute.
    pub fn resolve(&self, script_path: &str) -> PathBuf {
        let p = Path::new(script_path);
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            self.media_root.join(p)
        }
    }

    /// Run `script` and wait for it, at most `timeout`.
    ///
    /// A nonzero exit is a normal outcome. Only a failure to start (missing
    /// file, permission denied) or to wait is an error.
    pub async fn run(&self, script: &Path, timeout: Duration) -> Result<ScriptOutcome, RunnerError> {
        let shown = script.display().to_string();
        let launch_err = |source| RunnerError::Launch { path: shown.clone(), source };

        let mut cmd = match &self.interpreter {
            Some(interpreter) => {
                if !script.exists() {
                    return Err(launch_err(std::io::Error::new(
                        std::io::ErrorKind::NotFound,
                        "script file not found",
                    )));
                }
                let mut c = Command::new(interpreter);
                c.arg(script);
                c
            }
            None => Command::new(script),
        };
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let start = Instant::now();
        let mut child = cmd.spawn().map_err(launch_err)?;
        let pid = child.id();
        debug!(script = %shown, ?pid, "script started");

        let stdout_task = tokio::spawn(read_pipe(child.stdout.take()));
        let stderr_task = tokio::spawn(read_pipe(child.stderr.take()));

        let (exit_code, timed_out) = match tokio::time::timeout(timeout, child.wait()).await {
            Ok(Ok(status)) => (status.code(), false),
            Ok(Err(source)) => {
                kill_group(pid);
                return Err(RunnerError::Wait { path: shown, source });
            }
            Err(_) => {
                warn!(script = %shown, timeout_secs = timeout.as_secs(), "script timed out, killing process group");
                kill_group(pid);
                if let Err(e) = child.kill().await {
                    debug!(error = %e, "child already gone");
                }
                (None, true)
            }
        };

        // Leftover grandchildren can keep the pipes open.
        let stdout = collect_pipe(stdout_task, pid).await;
        let stderr = collect_pipe(stderr_task, pid).await;

        Ok(ScriptOutcome {
            exit_code,
            stdout,
            stderr,
            timed_out,
            duration: start.elapsed(),
        })
    }

    /// Decide between `Done` and `Error`.
    ///
    /// A zero exit is not enough: scripted targets may report functional
    /// failure through a marker in stdout.
    pub fn classify(&self, outcome: &ScriptOutcome) -> (ResultStatus, Option<FailureReason>) {
        let reason = if outcome.timed_out {
            Some(FailureReason::TimedOut(outcome.duration))
        } else {
            match outcome.exit_code {
                None => Some(FailureReason::Signalled),
                Some(0) => self
                    .failure_markers
                    .iter()
                    .find(|m| !m.is_empty() && outcome.stdout.contains(m.as_str()))
                    .map(|m| FailureReason::Marker(m.clone())),
                Some(code) => Some(FailureReason::ExitCode(code)),
            }
        };
        match reason {
            Some(r) => (ResultStatus::Error, Some(r)),
            None => (ResultStatus::Done, None),
        }
    }
}

async fn read_pipe<R: AsyncRead + Unpin>(pipe: Option<R>) -> String {
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        if let Err(e) = pipe.read_to_end(&mut buf).await {
            debug!(error = %e, "pipe read interrupted");
        }
    }
    String::from_utf8_lossy(&buf).into_owned()
}

async fn collect_pipe(mut task: JoinHandle<String>, pid: Option<u32>) -> String {
    match tokio::time::timeout(PIPE_GRACE, &mut task).await {
        Ok(text) => text.unwrap_or_default(),
        Err(_) => {
            kill_group(pid);
            task.await.unwrap_or_default()
        }
    }
}

/// SIGKILL the whole process group led by `pid`.
fn kill_group(pid: Option<u32>) {
    #[cfg(unix)]
    if let Some(pid) = pid.and_then(|p| i32::try_from(p).ok()) {
        // SAFETY: kill(2) with a negative pid only signals the group; no memory is touched.
        unsafe {
            libc::kill(-pid, libc::SIGKILL);
        }
    }
    #[cfg(not(unix))]
    let _ = pid;
}
