//! Validation jobs
//!
//! *Le Travail* (The Job) - one submission: stage, launch, stream, harvest, clean up.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::config::{Config, EngineConfig};
use crate::error::{JobError, JobResult};
use crate::multiplexer::{Completion, Multiplexer, RunSummary};
use crate::process::{CancelHandle, CancelReason, LaunchSpec, ProcessRunner};
use crate::protocol::{ProtocolMessage, StatusCode, TerminalStatus};
use crate::store::ArtifactStore;

/// Disambiguates ids generated within the same clock tick
static GENERATION: AtomicU64 = AtomicU64::new(0);

/// Unique job identifier
///
/// Format: `job_<hash[:12]>_<seq>` where `hash` is a BLAKE3 digest of the owning
/// connection, the per-connection sequence number and the generation time, and `seq`
/// counts submissions on that connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId {
    /// First 12 hex characters of the BLAKE3 digest
    pub hash: String,

    /// Submission number on the owning connection
    pub seq: u32,
}

impl JobId {
    /// Character length of the hash part
    const HASH_LEN: usize = 12;

    /// Generate a fresh id for the `seq`-th submission on `connection_id`
    #[must_use]
    pub fn generate(connection_id: &str, seq: u32) -> Self {
        let now = chrono::Utc::now();
        let mut hasher = blake3::Hasher::new();
        hasher.update(connection_id.as_bytes());
        hasher.update(&seq.to_le_bytes());
        hasher.update(&now.timestamp_nanos_opt().unwrap_or_default().to_le_bytes());
        hasher.update(&GENERATION.fetch_add(1, Ordering::Relaxed).to_le_bytes());

        let hex = hasher.finalize().to_hex();
        Self {
            hash: hex.as_str()[..Self::HASH_LEN].to_string(),
            seq,
        }
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "job_{}_{}", self.hash, self.seq)
    }
}

/// Shared, immutable context every job runs in
#[derive(Clone)]
pub struct JobEnvironment {
    /// Workspace root
    pub store: ArtifactStore,

    /// Engine launcher
    pub runner: Arc<dyn ProcessRunner>,

    /// Engine invocation settings
    pub engine: EngineConfig,

    /// Directory substituted for `{root}` in engine arguments
    pub root_dir: PathBuf,

    /// Keep job directories after harvesting
    pub retain_job_dirs: bool,
}

impl JobEnvironment {
    /// Build the environment from configuration
    ///
    /// Opens the artifact store and resolves `{root}` to the current directory.
    pub fn from_config(config: &Config, runner: Arc<dyn ProcessRunner>) -> JobResult<Self> {
        let store = ArtifactStore::open(&config.storage.work_dir)?;
        let root_dir = std::env::current_dir()
            .map_err(|e| JobError::io("Failed to resolve current directory", ".", e))?;

        Ok(Self {
            store,
            runner,
            engine: config.engine.clone(),
            root_dir,
            retain_job_dirs: config.storage.retain_job_dirs,
        })
    }
}

impl fmt::Debug for JobEnvironment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobEnvironment")
            .field("store", &self.store)
            .field("engine", &self.engine)
            .field("root_dir", &self.root_dir)
            .field("retain_job_dirs", &self.retain_job_dirs)
            .finish_non_exhaustive()
    }
}

/// Outcome of a finished job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobReport {
    /// Job that ran
    pub job_id: JobId,

    /// Terminal status sent to the client
    pub status: TerminalStatus,

    /// Present when the engine was launched
    pub run: Option<RunSummary>,
}

/// Run one job to completion, writing its messages to `outbound`
///
/// Never fails: every failure becomes protocol messages and an `error` terminal code.
/// `completion` is marked as the last message is sent, before the workspace is
/// removed.
pub async fn run_job(
    env: Arc<JobEnvironment>,
    job_id: JobId,
    document: String,
    outbound: mpsc::Sender<ProtocolMessage>,
    cancel: CancelHandle,
    completion: Completion,
) -> JobReport {
    let mux = Multiplexer::new(
        env.engine.status_policy,
        env.engine.artifacts.clone(),
        outbound,
        completion,
    );

    let workspace = match env.store.create_job(&job_id).await {
        Ok(workspace) => workspace,
        Err(e) => return fail_before_launch(&mux, job_id, e).await,
    };

    let input = match workspace.stage(&document).await {
        Ok(path) => path,
        Err(e) => {
            discard(&workspace, &job_id).await;
            return fail_before_launch(&mux, job_id, e).await;
        }
    };

    if let Some(reason) = cancel.reason() {
        discard(&workspace, &job_id).await;
        mux.emit(ProtocolMessage::error(format!("job cancelled before launch: {}", reason)))
            .await;
        mux.emit_final(ProtocolMessage::code(StatusCode::Error)).await;
        return JobReport {
            job_id,
            status: TerminalStatus::Error,
            run: None,
        };
    }

    let spec = LaunchSpec {
        program: env.engine.program.clone(),
        args: env.engine.launch_args(&env.root_dir, &input),
        working_dir: workspace.dir().to_path_buf(),
    };

    info!(job_id = %job_id, endpoints = ?env.engine.endpoints, "Starting validation job");

    let handle = match env.runner.start(&spec, cancel.clone()) {
        Ok(handle) => handle,
        Err(e) => {
            discard(&workspace, &job_id).await;
            return fail_before_launch(&mux, job_id, e).await;
        }
    };

    let timer = env.engine.job_timeout_secs.map(|secs| {
        let hook = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(secs)).await;
            hook.cancel(CancelReason::TimedOut);
        })
    });

    let summary = mux.run(handle, &workspace).await;

    if let Some(timer) = timer {
        timer.abort();
    }

    if summary.status == TerminalStatus::Error {
        let failure = JobError::EngineRuntime {
            exit_code: summary.exit.code,
            detail: summary.exit.describe(),
        };
        warn!(job_id = %job_id, saw_stderr = summary.saw_stderr, "{}", failure);
    } else {
        info!(job_id = %job_id, artifacts = summary.artifacts_found.len(), "Validation job succeeded");
    }

    if !env.retain_job_dirs {
        discard(&workspace, &job_id).await;
    }

    JobReport {
        job_id,
        status: summary.status,
        run: Some(summary),
    }
}

async fn fail_before_launch(mux: &Multiplexer, job_id: JobId, failure: JobError) -> JobReport {
    if failure.is_fatal_before_launch() {
        warn!(job_id = %job_id, error = %failure, "Job failed before launch");
    } else {
        error!(job_id = %job_id, error = %failure, "Job workspace unavailable");
    }
    mux.emit(ProtocolMessage::error(failure.to_string())).await;
    mux.emit_final(ProtocolMessage::code(StatusCode::Error)).await;
    JobReport {
        job_id,
        status: TerminalStatus::Error,
        run: None,
    }
}

async fn discard(workspace: &crate::store::JobWorkspace, job_id: &JobId) {
    if let Err(e) = workspace.cleanup().await {
        warn!(job_id = %job_id, error = %e, "Failed to clean up job workspace");
    }
}
