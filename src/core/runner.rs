//! Executes a single job: prepare directories, run the command, package
//! whatever the command produced. Transfers are left to the batch.

use chrono::Utc;
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::backup_service::BackupService;
use super::error::{JobError, PackagingError};
use super::models::{JobSpec, JobStatus, RunId};
use super::packager::{self, PackageOutcome};
use super::workspace::Workspace;

/// Absolute path of the job's working directory.
pub const ENV_JOB_DIR: &str = "FROSTY_JOB_DIR";
/// Absolute path of the directory the command writes its artifacts into.
pub const ENV_JOB_ARTIFACTS_DIR: &str = "FROSTY_JOB_ARTIFACTS_DIR";

#[derive(Clone)]
pub struct JobRunner {
    workspace: Workspace,
    service: Arc<dyn BackupService>,
}

impl JobRunner {
    pub fn new(workspace: Workspace, service: Arc<dyn BackupService>) -> Self {
        Self { workspace, service }
    }

    /// Run `job` within `run_id`. Always returns a status; every failure is
    /// recorded in it.
    pub async fn run(&self, job: JobSpec, run_id: &RunId) -> JobStatus {
        let mut status = JobStatus::started(job);
        let name = status.job.name.clone();

        let dirs = match self.workspace.prepare(&name, run_id).await {
            Ok(dirs) => dirs,
            Err(e) => {
                warn!(job = %name, run_id = %run_id, error = %e, "Failed to prepare job directories");
                status.fail(e.to_string());
                status.ended_at = Utc::now();
                return status;
            }
        };

        info!(job = %name, run_id = %run_id, command = %status.job.command_line(), "Starting job");

        let result = Command::new(&status.job.command)
            .args(&status.job.args)
            .env(ENV_JOB_DIR, &dirs.job_dir)
            .env(ENV_JOB_ARTIFACTS_DIR, &dirs.artifact_dir)
            .stdin(Stdio::null())
            .output()
            .await;

        match result {
            Ok(output) => {
                status.output = String::from_utf8_lossy(&output.stdout).trim().to_string();
                if !output.status.success() {
                    let stderr = String::from_utf8_lossy(&output.stderr);
                    let err = JobError::CommandExecution {
                        command: status.job.command_line(),
                        reason: output.status.to_string(),
                    };
                    // Both what the command said and how it ended.
                    status.fail(stderr.trim());
                    status.fail(err.to_string());
                }
            }
            Err(e) => {
                let err = JobError::CommandExecution {
                    command: status.job.command_line(),
                    reason: format!("failed to launch: {}", e),
                };
                status.fail(err.to_string());
            }
        }
        status.ended_at = Utc::now();

        if status.is_successful() {
            info!(job = %name, run_id = %run_id, elapsed_ms = status.elapsed().num_milliseconds(), "Job command succeeded");
        } else {
            warn!(job = %name, run_id = %run_id, error = %status.error, "Job command failed");
        }

        // A failed command still gets its partial output archived.
        let archive = self
            .workspace
            .archive_path(&name, run_id, self.service.as_ref());

        match packager::package(&dirs.artifact_dir, &archive).await {
            Ok(PackageOutcome::Empty) => {
                debug!(job = %name, run_id = %run_id, "Job produced no artifacts");
            }
            Ok(PackageOutcome::Created { .. }) => match tokio::fs::metadata(&archive).await {
                Ok(metadata) => {
                    status.archive_created = true;
                    status.archive_size = metadata.len();
                    status.archive_path = Some(archive);
                }
                Err(e) => {
                    let err = JobError::from(PackagingError::Scan {
                        path: archive,
                        source: e,
                    });
                    status.fail(err.to_string());
                }
            },
            Err(e) => {
                warn!(job = %name, run_id = %run_id, error = %e, "Failed to package artifacts");
                status.fail(JobError::from(e).to_string());
            }
        }

        status
    }
}
