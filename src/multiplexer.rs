//! Message multiplexer
//!
//! Turns one engine run into the ordered protocol sequence:
//! `startEval`, interleaved `log`/`error` chunks, completion `log`, terminal `code`,
//! then one `result` or `error` per configured artifact.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::process::{ExitReport, ProcessHandle};
use crate::protocol::{ProtocolMessage, StatusCode, TerminalStatus};
use crate::store::JobWorkspace;

/// Mapping from engine exit signals to a terminal status
///
/// Killed or cancelled processes never reach `classify`; they are always `error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StatusPolicy {
    /// Revision 2: success iff exit code is `0`; stderr is informational only
    #[default]
    ExitCode,

    /// Revision 1: success iff exit code is `0` and nothing was written to stderr
    Strict,
}

impl StatusPolicy {
    /// Protocol revision this policy corresponds to
    #[must_use]
    pub const fn revision(self) -> u32 {
        match self {
            Self::Strict => 1,
            Self::ExitCode => 2,
        }
    }

    /// Classify a finished engine run
    ///
    /// Consults the exit code (`None` = no code, e.g. killed by a signal) and, under
    /// `Strict`, whether any stderr output was observed.
    #[must_use]
    pub fn classify(self, exit_code: Option<i32>, saw_stderr: bool) -> TerminalStatus {
        match (self, exit_code) {
            (_, None) => TerminalStatus::Error,
            (_, Some(code)) if code != 0 => TerminalStatus::Error,
            (Self::Strict, Some(_)) if saw_stderr => TerminalStatus::Error,
            _ => TerminalStatus::Success,
        }
    }
}

/// Summary of one multiplexed run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    /// Terminal status that was sent
    pub status: TerminalStatus,

    /// How the process ended
    pub exit: ExitReport,

    /// Whether any stderr output was observed
    pub saw_stderr: bool,

    /// `log` messages emitted for stdout
    pub log_messages: usize,

    /// `error` messages emitted for stderr
    pub error_messages: usize,

    /// Artifacts that were read and forwarded
    pub artifacts_found: Vec<String>,

    /// Artifacts that could not be read
    pub artifacts_missing: Vec<String>,
}

/// Set once a job has handed its last message to the outbound channel
///
/// A job is idle from the client's point of view at that moment, even though its
/// task may still be removing the workspace.
#[derive(Debug, Clone)]
pub struct Completion {
    tx: Arc<watch::Sender<bool>>,
}

impl Completion {
    /// Create an unset marker
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Mark the message sequence as finished
    pub fn mark(&self) {
        self.tx.send_replace(true);
    }

    /// Whether the last message has been handed off
    pub fn is_complete(&self) -> bool {
        *self.tx.borrow()
    }
}

impl Default for Completion {
    fn default() -> Self {
        Self::new()
    }
}

/// Writes a job's protocol messages to the connection's outbound channel
#[derive(Debug, Clone)]
pub struct Multiplexer {
    policy: StatusPolicy,
    artifacts: Vec<String>,
    outbound: mpsc::Sender<ProtocolMessage>,
    completion: Completion,
}

impl Multiplexer {
    /// Create a multiplexer
    pub fn new(
        policy: StatusPolicy,
        artifacts: Vec<String>,
        outbound: mpsc::Sender<ProtocolMessage>,
        completion: Completion,
    ) -> Self {
        Self {
            policy,
            artifacts,
            outbound,
            completion,
        }
    }

    /// Send one message; a closed channel means the client is gone and is not an error
    pub async fn emit(&self, message: ProtocolMessage) -> bool {
        self.outbound.send(message).await.is_ok()
    }

    /// Send the last message of the job
    ///
    /// The completion marker is set after a slot in the channel is reserved and before
    /// the message becomes visible, so whoever reads this message already sees the
    /// job as complete.
    pub async fn emit_final(&self, message: ProtocolMessage) -> bool {
        match self.outbound.reserve().await {
            Ok(permit) => {
                self.completion.mark();
                permit.send(message);
                true
            }
            Err(_) => {
                self.completion.mark();
                false
            }
        }
    }

    /// Stream a launched process to completion and harvest its artifacts
    pub async fn run(&self, handle: ProcessHandle, workspace: &JobWorkspace) -> RunSummary {
        let ProcessHandle {
            mut stdout,
            mut stderr,
            exit,
            ..
        } = handle;

        self.emit(ProtocolMessage::code(StatusCode::StartEval)).await;

        let mut out_decoder = Utf8Decoder::default();
        let mut err_decoder = Utf8Decoder::default();
        let mut stdout_open = true;
        let mut stderr_open = true;
        let mut saw_stderr = false;
        let mut log_messages = 0;
        let mut error_messages = 0;

        while stdout_open || stderr_open {
            tokio::select! {
                chunk = stdout.recv(), if stdout_open => match chunk {
                    Some(bytes) => {
                        let text = out_decoder.decode(&bytes);
                        if !text.is_empty() {
                            self.emit(ProtocolMessage::log(text)).await;
                            log_messages += 1;
                        }
                    }
                    None => {
                        stdout_open = false;
                        if let Some(rest) = out_decoder.finish() {
                            self.emit(ProtocolMessage::log(rest)).await;
                            log_messages += 1;
                        }
                    }
                },
                chunk = stderr.recv(), if stderr_open => match chunk {
                    Some(bytes) => {
                        saw_stderr = true;
                        let text = err_decoder.decode(&bytes);
                        if !text.is_empty() {
                            self.emit(ProtocolMessage::error(text)).await;
                            error_messages += 1;
                        }
                    }
                    None => {
                        stderr_open = false;
                        if let Some(rest) = err_decoder.finish() {
                            self.emit(ProtocolMessage::error(rest)).await;
                            error_messages += 1;
                        }
                    }
                },
            }
        }

        let exit = exit.await.unwrap_or_else(|_| {
            warn!("Engine exit report was lost");
            ExitReport {
                code: None,
                cancelled: None,
            }
        });

        let status = match exit.cancelled {
            Some(_) => TerminalStatus::Error,
            None => self.policy.classify(exit.code, saw_stderr),
        };

        debug!(
            exit_code = ?exit.code,
            saw_stderr,
            policy = self.policy.revision(),
            status = ?status,
            "Engine run classified"
        );

        self.emit(ProtocolMessage::log(exit.describe())).await;

        let (artifacts_found, artifacts_missing) = if self.artifacts.is_empty() {
            self.emit_final(ProtocolMessage::code(status)).await;
            (Vec::new(), Vec::new())
        } else {
            self.emit(ProtocolMessage::code(status)).await;
            self.harvest(workspace).await
        };

        RunSummary {
            status,
            exit,
            saw_stderr,
            log_messages,
            error_messages,
            artifacts_found,
            artifacts_missing,
        }
    }

    /// Emit every configured artifact; returns (found, missing)
    async fn harvest(&self, workspace: &JobWorkspace) -> (Vec<String>, Vec<String>) {
        let mut found = Vec::new();
        let mut missing = Vec::new();

        let last = self.artifacts.len().saturating_sub(1);

        for (i, name) in self.artifacts.iter().enumerate() {
            let message = match workspace.read_artifact(name).await {
                Ok(contents) => {
                    found.push(name.clone());
                    ProtocolMessage::result(name.clone(), contents)
                }
                Err(e) => {
                    warn!(artifact = %name, error = %e, "Result artifact unavailable");
                    missing.push(name.clone());
                    ProtocolMessage::error(e.to_string())
                }
            };

            if i == last {
                self.emit_final(message).await;
            } else {
                self.emit(message).await;
            }
        }

        (found, missing)
    }
}

/// Incremental UTF-8 decoder that holds back a character split across reads
#[derive(Debug, Default)]
struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    fn decode(&mut self, chunk: &[u8]) -> String {
        self.pending.extend_from_slice(chunk);
        let split = self.pending.len() - incomplete_tail_len(&self.pending);
        let tail = self.pending.split_off(split);
        let text = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending = tail;
        text
    }

    fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let text = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        Some(text)
    }
}

/// Length of a truncated multi-byte sequence at the end of `bytes`
fn incomplete_tail_len(bytes: &[u8]) -> usize {
    for back in 1..=bytes.len().min(3) {
        let byte = bytes[bytes.len() - back];
        if byte & 0b1100_0000 == 0b1000_0000 {
            continue;
        }
        let width = match byte {
            b if b & 0b1110_0000 == 0b1100_0000 => 2,
            b if b & 0b1111_0000 == 0b1110_0000 => 3,
            b if b & 0b1111_1000 == 0b1111_0000 => 4,
            _ => 1,
        };
        return if width > back { back } else { 0 };
    }
    0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobId;
    use crate::process::CancelHandle;
    use crate::store::ArtifactStore;
    use rstest::rstest;
    use tempfile::tempdir;
    use tokio::sync::oneshot;

    struct FakeProcess {
        stdout: mpsc::Sender<Vec<u8>>,
        stderr: mpsc::Sender<Vec<u8>>,
        exit: oneshot::Sender<ExitReport>,
    }

    fn fake_process() -> (FakeProcess, ProcessHandle) {
        let (out_tx, out_rx) = mpsc::channel(16);
        let (err_tx, err_rx) = mpsc::channel(16);
        let (exit_tx, exit_rx) = oneshot::channel();
        (
            FakeProcess {
                stdout: out_tx,
                stderr: err_tx,
                exit: exit_tx,
            },
            ProcessHandle {
                stdout: out_rx,
                stderr: err_rx,
                exit: exit_rx,
                cancel: CancelHandle::new(),
            },
        )
    }

    async fn drain(mut rx: mpsc::Receiver<ProtocolMessage>) -> Vec<ProtocolMessage> {
        let mut messages = Vec::new();
        while let Some(msg) = rx.recv().await {
            messages.push(msg);
        }
        messages
    }

    #[rstest]
    #[case(StatusPolicy::ExitCode, Some(0), false, TerminalStatus::Success)]
    #[case(StatusPolicy::ExitCode, Some(0), true, TerminalStatus::Success)]
    #[case(StatusPolicy::ExitCode, Some(1), false, TerminalStatus::Error)]
    #[case(StatusPolicy::ExitCode, None, false, TerminalStatus::Error)]
    #[case(StatusPolicy::Strict, Some(0), false, TerminalStatus::Success)]
    #[case(StatusPolicy::Strict, Some(0), true, TerminalStatus::Error)]
    #[case(StatusPolicy::Strict, Some(2), false, TerminalStatus::Error)]
    fn test_classify(
        #[case] policy: StatusPolicy,
        #[case] exit_code: Option<i32>,
        #[case] saw_stderr: bool,
        #[case] expected: TerminalStatus,
    ) {
        assert_eq!(policy.classify(exit_code, saw_stderr), expected);
    }

    #[test]
    fn test_policy_revisions() {
        assert_eq!(StatusPolicy::Strict.revision(), 1);
        assert_eq!(StatusPolicy::default(), StatusPolicy::ExitCode);
        assert_eq!(StatusPolicy::ExitCode.revision(), 2);
    }

    #[test]
    fn test_decoder_holds_split_character() {
        let mut decoder = Utf8Decoder::default();
        let bytes = "ü✓".as_bytes();
        assert_eq!(decoder.decode(&bytes[..1]), "");
        assert_eq!(decoder.decode(&bytes[1..3]), "ü");
        assert_eq!(decoder.decode(&bytes[3..]), "✓");
        assert_eq!(decoder.finish(), None);
    }

    #[test]
    fn test_decoder_flushes_truncated_tail() {
        let mut decoder = Utf8Decoder::default();
        assert_eq!(decoder.decode(&[b'a', 0xe2, 0x9c]), "a");
        assert_eq!(decoder.finish(), Some("\u{fffd}".to_string()));
    }

    #[tokio::test]
    async fn test_message_order() {
        let dir = tempdir().expect("tempdir");
        let store = ArtifactStore::open(dir.path()).expect("open");
        let ws = store.create_job(&JobId::generate("conn_test", 0)).await.expect("job");
        std::fs::write(ws.dir().join("report.log"), "OK").expect("write");

        let (tx, rx) = mpsc::channel(64);
        let mux = Multiplexer::new(StatusPolicy::ExitCode, vec!["report.log".to_string()], tx, Completion::new());
        let (fake, handle) = fake_process();

        let driver = tokio::spawn(async move {
            fake.stdout.send(b"validating".to_vec()).await.expect("send");
            fake.stderr.send(b"warning".to_vec()).await.expect("send");
            drop(fake.stdout);
            drop(fake.stderr);
            fake.exit.send(ExitReport::exited(0)).expect("exit");
        });

        let summary = mux.run(handle, &ws).await;
        driver.await.expect("driver");
        drop(mux);
        let messages = drain(rx).await;

        assert_eq!(messages.first(), Some(&ProtocolMessage::code(StatusCode::StartEval)));
        let code_pos = messages
            .iter()
            .position(|m| m.status().is_some_and(StatusCode::is_terminal))
            .expect("terminal code");
        assert_eq!(messages[code_pos], ProtocolMessage::code(StatusCode::Success));
        assert_eq!(
            messages[code_pos - 1],
            ProtocolMessage::log("engine process finished with code: 0")
        );
        assert!(messages[..code_pos].contains(&ProtocolMessage::log("validating")));
        assert!(messages[..code_pos].contains(&ProtocolMessage::error("warning")));
        assert_eq!(messages[code_pos + 1..], [ProtocolMessage::result("report.log", "OK")]);

        assert!(summary.saw_stderr);
        assert_eq!(summary.log_messages, 1);
        assert_eq!(summary.error_messages, 1);
        assert_eq!(summary.artifacts_found, vec!["report.log".to_string()]);
    }

    #[tokio::test]
    async fn test_chunks_keep_per_stream_order() {
        let dir = tempdir().expect("tempdir");
        let store = ArtifactStore::open(dir.path()).expect("open");
        let ws = store.create_job(&JobId::generate("conn_test", 0)).await.expect("job");

        let (tx, rx) = mpsc::channel(64);
        let mux = Multiplexer::new(StatusPolicy::ExitCode, vec![], tx, Completion::new());
        let (fake, handle) = fake_process();

        let driver = tokio::spawn(async move {
            for chunk in ["one ", "two ", "three"] {
                fake.stdout.send(chunk.as_bytes().to_vec()).await.expect("send");
                tokio::task::yield_now().await;
            }
            for chunk in ["e1", "e2"] {
                fake.stderr.send(chunk.as_bytes().to_vec()).await.expect("send");
            }
            drop(fake.stdout);
            drop(fake.stderr);
            fake.exit.send(ExitReport::exited(0)).expect("exit");
        });

        mux.run(handle, &ws).await;
        driver.await.expect("driver");
        drop(mux);
        let messages = drain(rx).await;

        let logs: Vec<&ProtocolMessage> = messages
            .iter()
            .filter(|m| matches!(m, ProtocolMessage::Log { .. }))
            .collect();
        assert_eq!(
            logs,
            vec![
                &ProtocolMessage::log("one "),
                &ProtocolMessage::log("two "),
                &ProtocolMessage::log("three"),
                &ProtocolMessage::log("engine process finished with code: 0"),
            ]
        );
        let errors: Vec<&ProtocolMessage> = messages
            .iter()
            .filter(|m| matches!(m, ProtocolMessage::Error { .. }))
            .collect();
        assert_eq!(errors, vec![&ProtocolMessage::error("e1"), &ProtocolMessage::error("e2")]);
    }

    #[tokio::test]
    async fn test_completion_visible_with_final_message() {
        let dir = tempdir().expect("tempdir");
        let store = ArtifactStore::open(dir.path()).expect("open");
        let ws = store.create_job(&JobId::generate("conn_test", 0)).await.expect("job");
        std::fs::write(ws.dir().join("report.log"), "OK").expect("write");

        let completion = Completion::new();
        let (tx, mut rx) = mpsc::channel(64);
        let mux = Multiplexer::new(
            StatusPolicy::ExitCode,
            vec!["report.log".to_string()],
            tx,
            completion.clone(),
        );
        let (fake, handle) = fake_process();
        drop(fake.stdout);
        drop(fake.stderr);
        fake.exit.send(ExitReport::exited(0)).expect("exit");

        let run = tokio::spawn(async move { mux.run(handle, &ws).await });

        loop {
            let msg = rx.recv().await.expect("message");
            if matches!(msg, ProtocolMessage::Result { .. }) {
                break;
            }
        }
        assert!(completion.is_complete());
        run.await.expect("run");
    }

    #[tokio::test]
    async fn test_missing_artifact_does_not_change_status() {
        let dir = tempdir().expect("tempdir");
        let store = ArtifactStore::open(dir.path()).expect("open");
        let ws = store.create_job(&JobId::generate("conn_test", 0)).await.expect("job");

        let (tx, rx) = mpsc::channel(64);
        let mux = Multiplexer::new(StatusPolicy::ExitCode, vec!["report.log".to_string()], tx, Completion::new());
        let (fake, handle) = fake_process();
        drop(fake.stdout);
        drop(fake.stderr);
        fake.exit.send(ExitReport::exited(0)).expect("exit");

        let summary = mux.run(handle, &ws).await;
        drop(mux);
        let messages = drain(rx).await;

        assert_eq!(summary.status, TerminalStatus::Success);
        assert_eq!(summary.artifacts_missing, vec!["report.log".to_string()]);
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[2], ProtocolMessage::code(StatusCode::Success));
        assert!(matches!(&messages[3], ProtocolMessage::Error { message } if message.contains("report.log")));
    }

    #[tokio::test]
    async fn test_cancelled_run_is_error() {
        let dir = tempdir().expect("tempdir");
        let store = ArtifactStore::open(dir.path()).expect("open");
        let ws = store.create_job(&JobId::generate("conn_test", 0)).await.expect("job");

        let (tx, _rx) = mpsc::channel(64);
        let mux = Multiplexer::new(StatusPolicy::ExitCode, vec![], tx, Completion::new());
        let (fake, handle) = fake_process();
        drop(fake.stdout);
        drop(fake.stderr);
        fake.exit
            .send(ExitReport {
                code: Some(0),
                cancelled: Some(crate::process::CancelReason::Superseded),
            })
            .expect("exit");

        let summary = mux.run(handle, &ws).await;
        assert_eq!(summary.status, TerminalStatus::Error);
    }

    #[tokio::test]
    async fn test_closed_outbound_still_completes() {
        let dir = tempdir().expect("tempdir");
        let store = ArtifactStore::open(dir.path()).expect("open");
        let ws = store.create_job(&JobId::generate("conn_test", 0)).await.expect("job");

        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let mux = Multiplexer::new(StatusPolicy::ExitCode, vec![], tx, Completion::new());
        let (fake, handle) = fake_process();
        fake.stdout.send(b"ignored".to_vec()).await.expect("send");
        drop(fake.stdout);
        drop(fake.stderr);
        fake.exit.send(ExitReport::exited(1)).expect("exit");

        let summary = mux.run(handle, &ws).await;
        assert_eq!(summary.status, TerminalStatus::Error);
    }
}
