//! One firing of a schedule key, from fan-out to a finished report.
//!
//! Phases, strictly in order:
//! 1. every job runs concurrently, each in its own task (fan-out);
//! 2. wait for all of them, whatever their outcome (fan-in);
//! 3. initialize the backup service once, then store archives one at a time,
//!    reclaiming each job directory after a successful store;
//! 4. reclaim the run directory.

use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{Instrument, Span, debug, error, info, info_span, warn};

use super::backup_service::{BackupService, hostname};
use super::error::JobError;
use super::models::{JobSpec, JobStatus, RunId};
use super::runner::JobRunner;
use super::summary::BatchReport;
use super::workspace::Workspace;

pub struct Batcher {
    workspace: Workspace,
    service: Arc<dyn BackupService>,
    keep_failed_runs: bool,
}

impl Batcher {
    pub fn new(workspace: Workspace, service: Arc<dyn BackupService>) -> Self {
        Self {
            workspace,
            service,
            keep_failed_runs: false,
        }
    }

    /// Keep the run directory when a failed job still has an archive on disk.
    pub fn keep_failed_runs(mut self, keep: bool) -> Self {
        self.keep_failed_runs = keep;
        self
    }

    /// Run every job in `jobs` under a fresh run identifier and report.
    pub async fn execute(&self, schedule: &str, jobs: Vec<JobSpec>) -> BatchReport {
        self.execute_run(RunId::generate(), schedule, jobs).await
    }

    pub async fn execute_run(&self, run_id: RunId, schedule: &str, jobs: Vec<JobSpec>) -> BatchReport {
        let span = info_span!("batch", run_id = %run_id, schedule = %schedule);

        async {
            let started_at = Utc::now();
            info!(jobs = jobs.len(), service = self.service.name(), "Starting batch");

            let mut statuses = self.run_jobs(&run_id, jobs).await;
            self.transfer_archives(&run_id, &mut statuses).await;
            self.finish_run(&run_id, &statuses).await;

            let report = BatchReport {
                run_id: run_id.clone(),
                schedule: schedule.to_string(),
                service_name: self.service.name().to_string(),
                location: self.service.display_location(),
                hostname: hostname(),
                started_at,
                ended_at: Utc::now(),
                jobs: statuses,
            };
            report.log();
            report
        }
        .instrument(span)
        .await
    }

    /// Fan out one task per job and collect a status for every one of them,
    /// in completion order. A task that panics still yields a Failure.
    pub async fn run_jobs(&self, run_id: &RunId, jobs: Vec<JobSpec>) -> Vec<JobStatus> {
        let runner = JobRunner::new(self.workspace.clone(), Arc::clone(&self.service));
        let mut tasks = JoinSet::new();
        let mut in_flight = HashMap::with_capacity(jobs.len());

        for job in jobs {
            let runner = runner.clone();
            let run_id = run_id.clone();
            let task_job = job.clone();
            let handle = tasks.spawn(
                async move { runner.run(task_job, &run_id).await }.instrument(Span::current()),
            );
            in_flight.insert(handle.id(), (job, Utc::now()));
        }

        let mut statuses = Vec::with_capacity(in_flight.len());
        while let Some(joined) = tasks.join_next_with_id().await {
            match joined {
                Ok((id, status)) => {
                    in_flight.remove(&id);
                    statuses.push(status);
                }
                Err(e) => {
                    let Some((job, spawned_at)) = in_flight.remove(&e.id()) else {
                        error!(error = %e, "Untracked job task failed");
                        continue;
                    };
                    error!(job = %job.name, error = %e, "Job task aborted");
                    let mut status = JobStatus::started(job);
                    status.started_at = spawned_at;
                    status.ended_at = Utc::now();
                    status.fail(format!("job task aborted: {}", e));
                    statuses.push(status);
                }
            }
        }

        debug!(completed = statuses.len(), "All jobs finished");
        statuses
    }

    /// Initialize the backup service once and store every archive in turn.
    pub async fn transfer_archives(&self, run_id: &RunId, statuses: &mut [JobStatus]) {
        if let Err(e) = self.service.initialize().await {
            let err = JobError::BackendInit {
                service: self.service.name().to_string(),
                reason: format!("{:#}", e),
            };
            error!(error = %err, "Backup service unavailable, no archives will be stored");

            let message = err.to_string();
            for status in statuses.iter_mut() {
                status.fail_transfer(message.clone());
            }
            return;
        }

        for status in statuses.iter_mut() {
            let Some(archive) = status.archive_path.clone() else {
                continue;
            };
            if !status.archive_created {
                continue;
            }

            if tokio::fs::metadata(&archive).await.is_err() {
                debug!(job = %status.job.name, archive = %archive.display(), "Archive missing, skipping transfer");
                continue;
            }

            info!(job = %status.job.name, archive = %archive.display(), bytes = status.archive_size, "Storing archive");
            status.transfer_started_at = Some(Utc::now());
            let result = self.service.store_file(&archive).await;
            status.transfer_ended_at = Some(Utc::now());

            match result {
                Ok(()) => {
                    if let Err(e) = self.workspace.reclaim_job(&status.job.name, run_id).await {
                        warn!(job = %status.job.name, error = %e, "Archive stored but job directory was not reclaimed");
                        status.fail(e.to_string());
                    }
                }
                Err(e) => {
                    let err = JobError::Transfer {
                        path: archive,
                        reason: format!("{:#}", e),
                    };
                    error!(job = %status.job.name, error = %err, "Transfer failed");
                    status.fail_transfer(err.to_string());
                }
            }
        }
    }

    /// Reclaim the run directory once every job has settled.
    pub async fn finish_run(&self, run_id: &RunId, statuses: &[JobStatus]) {
        if self.keep_failed_runs {
            let stranded = statuses
                .iter()
                .filter(|s| !s.is_successful())
                .filter_map(|s| s.archive_path.as_ref())
                .any(|p| p.exists());
            if stranded {
                warn!(
                    path = %self.workspace.run_dir(run_id).display(),
                    "Keeping run directory with archives of failed jobs"
                );
                return;
            }
        }

        self.workspace.reclaim_run(run_id).await;
    }
}
