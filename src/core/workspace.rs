//! On-disk working tree for job runs.
//!
//! Layout: `<root>/jobs/<run_id>/<job_name>/artifacts/`. Every run gets its own
//! subtree, so overlapping batches never address the same paths.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use nix::unistd::{Uid, User};
use tracing::{debug, warn};

use super::backup_service::BackupService;
use super::error::JobError;
use super::models::RunId;

const FROSTY_DIR_NAME: &str = ".frosty";
const RUNS_DIR_NAME: &str = "jobs";
const ARTIFACTS_DIR_NAME: &str = "artifacts";
const ARCHIVE_EXTENSION: &str = "zip";
const DIR_MODE: u32 = 0o755;

/// Directories owned by one job within one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobDirectories {
    pub job_dir: PathBuf,
    pub artifact_dir: PathBuf,
}

#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    /// Root the workspace at `root`, resolved against the current directory
    /// when relative. Job commands only ever see absolute paths.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, JobError> {
        let root = root.into();
        let root = std::path::absolute(&root).map_err(|e| JobError::directory("resolve", &root, e))?;
        Ok(Self { root })
    }

    /// Use the configured root, or `<home>/.frosty` when unset.
    pub fn from_config(work_dir: Option<&Path>) -> Result<Self, JobError> {
        match work_dir {
            Some(dir) => Self::new(dir),
            None => Self::new(default_root()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn run_dir(&self, run_id: &RunId) -> PathBuf {
        self.root.join(RUNS_DIR_NAME).join(run_id.as_str())
    }

    pub fn job_dir(&self, job_name: &str, run_id: &RunId) -> PathBuf {
        self.run_dir(run_id).join(job_name)
    }

    pub fn artifact_dir(&self, job_name: &str, run_id: &RunId) -> PathBuf {
        self.job_dir(job_name, run_id).join(ARTIFACTS_DIR_NAME)
    }

    /// Where the job's archive is written. The base name comes from the
    /// active backup service's naming convention.
    pub fn archive_path(
        &self,
        job_name: &str,
        run_id: &RunId,
        service: &dyn BackupService,
    ) -> PathBuf {
        self.artifact_dir(job_name, run_id).join(format!(
            "{}.{}",
            service.artifact_file_base_name(job_name),
            ARCHIVE_EXTENSION
        ))
    }

    /// Create the job and artifact directories, including parents.
    pub async fn prepare(&self, job_name: &str, run_id: &RunId) -> Result<JobDirectories, JobError> {
        let dirs = JobDirectories {
            job_dir: self.job_dir(job_name, run_id),
            artifact_dir: self.artifact_dir(job_name, run_id),
        };

        for dir in [&dirs.job_dir, &dirs.artifact_dir] {
            tokio::fs::DirBuilder::new()
                .recursive(true)
                .mode(DIR_MODE)
                .create(dir)
                .await
                .map_err(|e| JobError::directory("create", dir, e))?;
        }

        debug!(job = %job_name, run_id = %run_id, path = %dirs.job_dir.display(), "Prepared job directories");
        Ok(dirs)
    }

    /// Remove the job's working tree. Already absent is not an error.
    pub async fn reclaim_job(&self, job_name: &str, run_id: &RunId) -> Result<(), JobError> {
        let job_dir = self.job_dir(job_name, run_id);
        remove_tree(&job_dir)
            .await
            .map_err(|e| JobError::directory("remove", &job_dir, e))?;
        debug!(job = %job_name, run_id = %run_id, "Reclaimed job directory");
        Ok(())
    }

    /// Remove the whole run tree. Failures are logged only.
    pub async fn reclaim_run(&self, run_id: &RunId) {
        let run_dir = self.run_dir(run_id);
        match remove_tree(&run_dir).await {
            Ok(()) => debug!(run_id = %run_id, "Reclaimed run directory"),
            Err(e) => warn!(
                run_id = %run_id,
                path = %run_dir.display(),
                error = %e,
                "Failed to reclaim run directory"
            ),
        }
    }
}

async fn remove_tree(path: &Path) -> std::io::Result<()> {
    match tokio::fs::remove_dir_all(path).await {
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

fn default_root() -> PathBuf {
    home_dir().join(FROSTY_DIR_NAME)
}

/// Home directory of the current user, from the user database first.
fn home_dir() -> PathBuf {
    if let Ok(Some(user)) = User::from_uid(Uid::current()) {
        return user.dir;
    }

    match std::env::var_os("HOME") {
        Some(home) if !home.is_empty() => PathBuf::from(home),
        _ => {
            warn!("Could not determine home directory, using the system temp directory");
            std::env::temp_dir()
        }
    }
}
