//! Process runner
//!
//! Spawns the validation engine and exposes its two output pipes as independent
//! chunk streams plus a single exit report. The exit report is only sent after both
//! pipes have been drained (or abandoned, see [`EXIT_DRAIN_IDLE`]), so consumers can
//! treat it as the end of all output.

use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{JobError, JobResult};

/// Read buffer size for engine output
pub const CHUNK_SIZE: usize = 8 * 1024;

/// Chunks buffered per output stream before the pump waits for the consumer
const STREAM_BUFFER: usize = 64;

/// How long a pipe may stay silent after the engine exited before it is abandoned
///
/// Background processes forked by the engine inherit its pipes and can keep them
/// open long after the engine itself is gone.
pub const EXIT_DRAIN_IDLE: Duration = Duration::from_secs(2);

/// Everything needed to start the engine for one job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    /// Executable
    pub program: String,

    /// Full positional argument vector
    pub args: Vec<String>,

    /// Working directory of the child (the job workspace)
    pub working_dir: PathBuf,
}

/// Why a running job was cancelled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// The client connection closed
    ClientDisconnected,

    /// A new submission replaced the job
    Superseded,

    /// The engine ran longer than the configured timeout
    TimedOut,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ClientDisconnected => write!(f, "client disconnected"),
            Self::Superseded => write!(f, "superseded by a new submission"),
            Self::TimedOut => write!(f, "timed out"),
        }
    }
}

/// Cancellation hook shared between a job and whoever may abort it
///
/// The first reason wins; later calls are ignored.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<Option<CancelReason>>>,
}

impl CancelHandle {
    /// Create an untriggered handle
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    /// Request cancellation; returns `false` if it was already requested
    pub fn cancel(&self, reason: CancelReason) -> bool {
        self.tx.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(reason);
                true
            } else {
                false
            }
        })
    }

    /// Reason, if cancellation was requested
    pub fn reason(&self) -> Option<CancelReason> {
        *self.tx.borrow()
    }

    /// Wait until cancellation is requested
    pub async fn cancelled(&self) -> CancelReason {
        let mut rx = self.tx.subscribe();
        loop {
            if let Some(reason) = *rx.borrow_and_update() {
                return reason;
            }
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

impl Default for CancelHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// How the engine process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitReport {
    /// Exit code; `None` when terminated by a signal or not observable
    pub code: Option<i32>,

    /// Set when the process was killed through the cancel hook
    pub cancelled: Option<CancelReason>,
}

impl ExitReport {
    /// Normal exit with a code
    #[must_use]
    pub const fn exited(code: i32) -> Self {
        Self {
            code: Some(code),
            cancelled: None,
        }
    }

    /// Human readable completion line
    #[must_use]
    pub fn describe(&self) -> String {
        match (self.cancelled, self.code) {
            (Some(reason), _) => format!("engine process cancelled: {}", reason),
            (None, Some(code)) => format!("engine process finished with code: {}", code),
            (None, None) => "engine process terminated without exit code".to_string(),
        }
    }
}

/// Live engine process
///
/// `stdout` and `stderr` end when the respective pipe closes; `exit` resolves once,
/// after both have ended.
#[derive(Debug)]
pub struct ProcessHandle {
    /// Standard output chunks
    pub stdout: mpsc::Receiver<Vec<u8>>,

    /// Standard error chunks
    pub stderr: mpsc::Receiver<Vec<u8>>,

    /// Terminal exit report
    pub exit: oneshot::Receiver<ExitReport>,

    /// Cancellation hook for this process
    pub cancel: CancelHandle,
}

/// Abstraction over engine execution, enabling test doubles
pub trait ProcessRunner: Send + Sync {
    /// Start the engine; fails only if the process could not be spawned
    fn start(&self, spec: &LaunchSpec, cancel: CancelHandle) -> JobResult<ProcessHandle>;
}

/// Default runner backed by `tokio::process`
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProcessRunner;

impl ProcessRunner for SystemProcessRunner {
    fn start(&self, spec: &LaunchSpec, cancel: CancelHandle) -> JobResult<ProcessHandle> {
        debug!(program = %spec.program, args = ?spec.args, dir = %spec.working_dir.display(), "Launching engine");

        let mut child = Command::new(&spec.program)
            .args(&spec.args)
            .current_dir(&spec.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| JobError::LaunchFailure {
                program: spec.program.clone(),
                source,
            })?;

        info!(program = %spec.program, pid = ?child.id(), "Engine started");

        let (stdout_tx, stdout_rx) = mpsc::channel(STREAM_BUFFER);
        let (stderr_tx, stderr_rx) = mpsc::channel(STREAM_BUFFER);
        let (exit_tx, exit_rx) = oneshot::channel();

        let (exited_tx, exited_rx) = watch::channel(false);
        let stdout_pump = child
            .stdout
            .take()
            .map(|out| pump(out, stdout_tx, exited_rx.clone()));
        let stderr_pump = child
            .stderr
            .take()
            .map(|err| pump(err, stderr_tx, exited_rx));

        let hook = cancel.clone();
        tokio::spawn(async move {
            let (status, cancelled) = tokio::select! {
                status = child.wait() => (status, None),
                reason = hook.cancelled() => {
                    info!(reason = %reason, "Killing engine");
                    if let Err(e) = child.start_kill() {
                        warn!(error = %e, "Failed to signal engine");
                    }
                    (child.wait().await, Some(reason))
                }
            };
            exited_tx.send_replace(true);

            for handle in [stdout_pump, stderr_pump].into_iter().flatten() {
                let _ = handle.await;
            }

            let code = match status {
                Ok(status) => status.code(),
                Err(e) => {
                    warn!(error = %e, "Failed to wait for engine");
                    None
                }
            };

            let _ = exit_tx.send(ExitReport { code, cancelled });
        });

        Ok(ProcessHandle {
            stdout: stdout_rx,
            stderr: stderr_rx,
            exit: exit_rx,
            cancel,
        })
    }
}

/// Forward raw chunks from a pipe until EOF
///
/// Keeps reading after the consumer is gone so the child never blocks on a full pipe.
/// Once the engine has exited, a read that stays idle for [`EXIT_DRAIN_IDLE`] ends
/// the stream.
fn pump<R>(mut reader: R, tx: mpsc::Sender<Vec<u8>>, mut exited: watch::Receiver<bool>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = vec![0u8; CHUNK_SIZE];
        let mut forwarding = true;
        let mut engine_gone = false;

        loop {
            let read = if engine_gone {
                match tokio::time::timeout(EXIT_DRAIN_IDLE, reader.read(&mut buf)).await {
                    Ok(read) => read,
                    Err(_) => {
                        warn!("Engine pipe still open after exit; a child process may hold it");
                        break;
                    }
                }
            } else {
                tokio::select! {
                    read = reader.read(&mut buf) => read,
                    _ = exited.changed() => {
                        engine_gone = true;
                        continue;
                    }
                }
            };

            match read {
                Ok(0) => break,
                Ok(n) => {
                    if forwarding && tx.send(buf[..n].to_vec()).await.is_err() {
                        forwarding = false;
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Engine pipe read failed");
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::tempdir;

    fn sh(script: &str, dir: &std::path::Path) -> LaunchSpec {
        LaunchSpec {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            working_dir: dir.to_path_buf(),
        }
    }

    async fn collect(mut rx: mpsc::Receiver<Vec<u8>>) -> String {
        let mut bytes = Vec::new();
        while let Some(chunk) = rx.recv().await {
            bytes.extend(chunk);
        }
        String::from_utf8(bytes).expect("utf8")
    }

    #[tokio::test]
    async fn test_streams_and_exit_code() {
        let dir = tempdir().expect("tempdir");
        let handle = SystemProcessRunner
            .start(&sh("echo out; echo err >&2; exit 3", dir.path()), CancelHandle::new())
            .expect("start");

        let ProcessHandle { stdout, stderr, exit, .. } = handle;
        let (out, err) = tokio::join!(collect(stdout), collect(stderr));
        let report = exit.await.expect("exit report");

        assert_eq!(out, "out\n");
        assert_eq!(err, "err\n");
        assert_eq!(report, ExitReport::exited(3));
    }

    #[tokio::test]
    async fn test_runs_in_working_dir() {
        let dir = tempdir().expect("tempdir");
        let handle = SystemProcessRunner
            .start(&sh("printf OK > report.log", dir.path()), CancelHandle::new())
            .expect("start");

        assert_eq!(handle.exit.await.expect("exit"), ExitReport::exited(0));
        assert_eq!(
            std::fs::read_to_string(dir.path().join("report.log")).expect("read"),
            "OK"
        );
    }

    #[tokio::test]
    async fn test_missing_binary_is_launch_failure() {
        let dir = tempdir().expect("tempdir");
        let spec = LaunchSpec {
            program: "/nonexistent/engine-binary".to_string(),
            args: vec![],
            working_dir: dir.path().to_path_buf(),
        };

        let err = SystemProcessRunner
            .start(&spec, CancelHandle::new())
            .expect_err("must not spawn");
        assert!(matches!(err, JobError::LaunchFailure { .. }));
    }

    #[tokio::test]
    async fn test_cancel_kills_process() {
        let dir = tempdir().expect("tempdir");
        let cancel = CancelHandle::new();
        let handle = SystemProcessRunner
            .start(&sh("exec sleep 30", dir.path()), cancel.clone())
            .expect("start");

        assert!(cancel.cancel(CancelReason::TimedOut));
        let report = tokio::time::timeout(Duration::from_secs(10), handle.exit)
            .await
            .expect("exit within timeout")
            .expect("exit report");

        assert_eq!(report.cancelled, Some(CancelReason::TimedOut));
        assert_eq!(report.code, None);
    }

    #[tokio::test]
    async fn test_cancel_with_background_child_holding_pipes() {
        let dir = tempdir().expect("tempdir");
        let cancel = CancelHandle::new();
        let handle = SystemProcessRunner
            .start(&sh("sleep 20 & exec sleep 20", dir.path()), cancel.clone())
            .expect("start");

        let ProcessHandle { stdout, stderr, exit, .. } = handle;
        cancel.cancel(CancelReason::Superseded);

        let report = tokio::time::timeout(Duration::from_secs(10), async {
            let _ = tokio::join!(collect(stdout), collect(stderr));
            exit.await.expect("exit report")
        })
        .await
        .expect("streams end and exit is reported");

        assert_eq!(report.cancelled, Some(CancelReason::Superseded));
    }

    #[tokio::test]
    async fn test_exit_with_background_child_keeps_output() {
        let dir = tempdir().expect("tempdir");
        let handle = SystemProcessRunner
            .start(&sh("sleep 20 & echo done", dir.path()), CancelHandle::new())
            .expect("start");

        let ProcessHandle { stdout, stderr, exit, .. } = handle;
        let (out, report) = tokio::time::timeout(Duration::from_secs(10), async {
            let (out, _) = tokio::join!(collect(stdout), collect(stderr));
            (out, exit.await.expect("exit report"))
        })
        .await
        .expect("streams end and exit is reported");

        assert_eq!(out, "done\n");
        assert_eq!(report, ExitReport::exited(0));
    }

    #[test]
    fn test_first_cancel_reason_wins() {
        let cancel = CancelHandle::new();
        assert_eq!(cancel.reason(), None);
        assert!(cancel.cancel(CancelReason::Superseded));
        assert!(!cancel.cancel(CancelReason::ClientDisconnected));
        assert_eq!(cancel.reason(), Some(CancelReason::Superseded));
    }

    #[test]
    fn test_exit_report_describe() {
        assert_eq!(
            ExitReport::exited(0).describe(),
            "engine process finished with code: 0"
        );
        let killed = ExitReport {
            code: None,
            cancelled: Some(CancelReason::ClientDisconnected),
        };
        assert!(killed.describe().contains("client disconnected"));
        let signalled = ExitReport {
            code: None,
            cancelled: None,
        };
        assert!(signalled.describe().contains("without exit code"));
    }
}
