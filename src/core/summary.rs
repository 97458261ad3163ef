use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{info, warn};

use super::models::{JobStatus, RunId, Status};

/// Everything reporting needs to know about one finished batch.
#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    #[serde(serialize_with = "serialize_run_id")]
    pub run_id: RunId,
    pub schedule: String,
    pub service_name: String,
    pub location: String,
    pub hostname: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    /// One entry per submitted job, in completion order.
    pub jobs: Vec<JobStatus>,
}

fn serialize_run_id<S: serde::Serializer>(run_id: &RunId, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(run_id.as_str())
}

impl BatchReport {
    /// True iff no job in the batch failed.
    pub fn is_successful(&self) -> bool {
        self.jobs.iter().all(JobStatus::is_successful)
    }

    pub fn status(&self) -> Status {
        if self.is_successful() {
            Status::Success
        } else {
            Status::Failure
        }
    }

    pub fn failed(&self) -> impl Iterator<Item = &JobStatus> {
        self.jobs.iter().filter(|j| !j.is_successful())
    }

    pub fn failed_count(&self) -> usize {
        self.failed().count()
    }

    pub fn stored_count(&self) -> usize {
        self.jobs
            .iter()
            .filter(|j| j.transfer_ended_at.is_some() && j.transfer_error.is_empty())
            .count()
    }

    pub fn elapsed(&self) -> Duration {
        self.ended_at - self.started_at
    }

    /// Emit the summary through tracing.
    pub fn log(&self) {
        for job in &self.jobs {
            if job.is_successful() {
                info!(
                    job = %job.job.name,
                    archive = %job.archive_name().unwrap_or_default(),
                    size = %job.archive_size_display(),
                    elapsed_ms = job.elapsed().num_milliseconds(),
                    "Job succeeded"
                );
            } else {
                warn!(
                    job = %job.job.name,
                    error = %job.error,
                    transfer_error = %job.transfer_error,
                    "Job failed"
                );
            }
        }

        info!(
            run_id = %self.run_id,
            status = ?self.status(),
            jobs = self.jobs.len(),
            failed = self.failed_count(),
            stored = self.stored_count(),
            location = %self.location,
            elapsed_secs = self.elapsed().num_seconds(),
            "Batch complete"
        );
    }
}
