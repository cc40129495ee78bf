//! Session coordinator
//!
//! One `Session` per client connection. It owns at most one running job, enforces the
//! busy policy for overlapping submissions and fires the cancel hook on disconnect.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::SessionConfig;
use crate::job::{run_job, JobEnvironment, JobId, JobReport};
use crate::multiplexer::Completion;
use crate::process::{CancelHandle, CancelReason};
use crate::protocol::ProtocolMessage;

/// What to do with a submission that arrives while a job is running
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusyPolicy {
    /// Answer with a `busy:` error and leave the running job alone
    #[default]
    Reject,

    /// Cancel the running job, let it finish its sequence, then start the new one
    Replace,
}

/// Result of handing a payload to the session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Submission {
    /// A new job was started
    Started(JobId),

    /// A job was already running and the payload was dropped
    Rejected {
        /// The job that is still running
        running: JobId,
    },

    /// The running job was cancelled and a new one started
    Replaced {
        /// Cancelled job
        previous: JobId,
        /// Newly started job
        started: JobId,
    },
}

struct ActiveJob {
    id: JobId,
    cancel: CancelHandle,
    completion: Completion,
    task: JoinHandle<JobReport>,
}

impl ActiveJob {
    /// Still producing messages for the client
    fn is_running(&self) -> bool {
        !self.completion.is_complete() && !self.task.is_finished()
    }
}

/// Per-connection job coordinator
pub struct Session {
    conn_id: String,
    env: Arc<JobEnvironment>,
    config: SessionConfig,
    outbound: mpsc::Sender<ProtocolMessage>,
    active: Option<ActiveJob>,
    next_seq: u32,
}

impl Session {
    /// Create a session writing to `outbound`
    pub fn new(
        conn_id: impl Into<String>,
        env: Arc<JobEnvironment>,
        config: SessionConfig,
        outbound: mpsc::Sender<ProtocolMessage>,
    ) -> Self {
        Self {
            conn_id: conn_id.into(),
            env,
            config,
            outbound,
            active: None,
            next_seq: 0,
        }
    }

    /// Connection id
    pub fn conn_id(&self) -> &str {
        &self.conn_id
    }

    /// Whether a job is still running (including artifact harvesting)
    ///
    /// A job stops counting as busy once its last message is sent, even if its
    /// workspace is still being removed.
    pub fn is_busy(&self) -> bool {
        self.active.as_ref().is_some_and(ActiveJob::is_running)
    }

    /// Id of the current (or most recent) job
    pub fn current_job(&self) -> Option<&JobId> {
        self.active.as_ref().map(|job| &job.id)
    }

    /// Handle one inbound text frame: the raw constraint document
    pub async fn on_inbound_text(&mut self, payload: String) -> Submission {
        let previous = match self.active.take() {
            Some(job) if job.is_running() => match self.config.busy_policy {
                BusyPolicy::Reject => {
                    let running = job.id.clone();
                    info!(conn_id = %self.conn_id, job_id = %running, "Rejecting submission while busy");
                    self.active = Some(job);
                    self.send_error(format!(
                        "busy: job {} is still running; wait for its final status before submitting again",
                        running
                    ))
                    .await;
                    return Submission::Rejected { running };
                }
                BusyPolicy::Replace => {
                    info!(conn_id = %self.conn_id, job_id = %job.id, "Replacing running job");
                    job.cancel.cancel(CancelReason::Superseded);
                    if let Err(e) = job.task.await {
                        warn!(conn_id = %self.conn_id, error = %e, "Superseded job task failed");
                    }
                    Some(job.id)
                }
            },
            _ => None,
        };

        let started = self.start_job(payload);

        match previous {
            Some(previous) => Submission::Replaced { previous, started },
            None => Submission::Started(started),
        }
    }

    /// Send a session-level `error` message
    pub async fn send_error(&self, message: impl Into<String>) {
        if self.outbound.send(ProtocolMessage::error(message)).await.is_err() {
            debug!(conn_id = %self.conn_id, "Outbound channel closed");
        }
    }

    /// Wait for the running job, if any, and return its report
    pub async fn wait_idle(&mut self) -> Option<JobReport> {
        let job = self.active.take()?;
        match job.task.await {
            Ok(report) => Some(report),
            Err(e) => {
                warn!(conn_id = %self.conn_id, job_id = %job.id, error = %e, "Job task failed");
                None
            }
        }
    }

    /// The connection is gone
    ///
    /// Fires the cancel hook when `cancel_on_disconnect` is set; the job still cleans
    /// up its workspace in the background.
    pub fn close(&mut self) {
        let Some(job) = self.active.take() else {
            return;
        };

        if !job.is_running() {
            return;
        }

        if self.config.cancel_on_disconnect {
            info!(conn_id = %self.conn_id, job_id = %job.id, "Cancelling job of closed connection");
            job.cancel.cancel(CancelReason::ClientDisconnected);
        } else {
            info!(conn_id = %self.conn_id, job_id = %job.id, "Leaving job of closed connection running");
        }
    }

    fn start_job(&mut self, payload: String) -> JobId {
        let id = JobId::generate(&self.conn_id, self.next_seq);
        self.next_seq = self.next_seq.wrapping_add(1);

        debug!(conn_id = %self.conn_id, job_id = %id, bytes = payload.len(), "Accepted submission");

        let cancel = CancelHandle::new();
        let completion = Completion::new();
        let task = tokio::spawn(run_job(
            Arc::clone(&self.env),
            id.clone(),
            payload,
            self.outbound.clone(),
            cancel.clone(),
            completion.clone(),
        ));

        self.active = Some(ActiveJob {
            id: id.clone(),
            cancel,
            completion,
            task,
        });

        id
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}
