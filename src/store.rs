//! Artifact store
//!
//! Every job gets its own directory under the store root. The submitted document is
//! staged there and the engine runs with that directory as its working directory, so
//! its result files never collide with another job's.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, warn};

use crate::error::{JobError, JobResult};
use crate::job::JobId;

/// File name of the staged constraint document
pub const STAGED_INPUT_NAME: &str = "constraint.ttl";

/// Root of all job workspaces
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    /// Open (and create) the store root
    pub fn open<P: AsRef<Path>>(root: P) -> JobResult<Self> {
        let root = root.as_ref();
        std::fs::create_dir_all(root)
            .map_err(|e| JobError::io("Failed to create work directory", root, e))?;
        let root = root
            .canonicalize()
            .map_err(|e| JobError::io("Failed to canonicalize work directory", root, e))?;
        Ok(Self { root })
    }

    /// Store root
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create the workspace for one job
    pub async fn create_job(&self, job_id: &JobId) -> JobResult<JobWorkspace> {
        let dir = self.root.join(job_id.to_string());
        tokio::fs::create_dir(&dir)
            .await
            .map_err(|e| JobError::io("Failed to create job directory", &dir, e))?;
        debug!(job_id = %job_id, dir = %dir.display(), "Created job workspace");
        Ok(JobWorkspace { dir })
    }

    /// Remove job directories whose last modification is older than `ttl`
    ///
    /// Returns the number of directories removed.
    pub fn sweep_stale(&self, ttl: Duration) -> JobResult<usize> {
        let entries = std::fs::read_dir(&self.root)
            .map_err(|e| JobError::io("Failed to list work directory", &self.root, e))?;

        let now = SystemTime::now();
        let mut removed = 0;

        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }

            let age = entry
                .metadata()
                .and_then(|m| m.modified())
                .ok()
                .and_then(|modified| now.duration_since(modified).ok());

            if matches!(age, Some(age) if age >= ttl) {
                match std::fs::remove_dir_all(&path) {
                    Ok(()) => removed += 1,
                    Err(e) => warn!(dir = %path.display(), error = %e, "Failed to remove stale job directory"),
                }
            }
        }

        Ok(removed)
    }
}

/// Scratch directory of a single job
#[derive(Debug, Clone)]
pub struct JobWorkspace {
    dir: PathBuf,
}

impl JobWorkspace {
    /// Workspace directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the staged input document
    pub fn input_path(&self) -> PathBuf {
        self.dir.join(STAGED_INPUT_NAME)
    }

    /// Write the submitted document, replacing any previous content
    pub async fn stage(&self, document: &str) -> JobResult<PathBuf> {
        let path = self.input_path();
        tokio::fs::write(&path, document.as_bytes())
            .await
            .map_err(|source| JobError::StagingWrite {
                path: path.clone(),
                source,
            })?;
        Ok(path)
    }

    /// Read a result artifact by bare file name
    pub async fn read_artifact(&self, name: &str) -> JobResult<String> {
        if name.is_empty() || name.contains(['/', '\\']) || name == "." || name == ".." {
            return Err(JobError::artifact(name, "artifact name must be a bare file name"));
        }

        let bytes = tokio::fs::read(self.dir.join(name))
            .await
            .map_err(|e| JobError::artifact(name, e))?;

        String::from_utf8(bytes).map_err(|_| JobError::artifact(name, "contents are not valid UTF-8"))
    }

    /// Delete the workspace
    pub async fn cleanup(&self) -> JobResult<()> {
        match tokio::fs::remove_dir_all(&self.dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(JobError::io("Failed to remove job directory", &self.dir, e)),
        }
    }
}
