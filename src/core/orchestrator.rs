use anyhow::{Result, bail};
use std::collections::BTreeMap;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::context::AppContext;
use crate::core::backup_service::create_service;
use crate::core::batch::Batcher;
use crate::core::models::JobSpec;
use crate::core::summary::BatchReport;

/// Jobs grouped by schedule key. Keys are sorted, job order is kept.
pub fn group_by_schedule(jobs: &[JobSpec]) -> BTreeMap<String, Vec<JobSpec>> {
    let mut groups: BTreeMap<String, Vec<JobSpec>> = BTreeMap::new();
    for job in jobs {
        groups.entry(job.schedule.clone()).or_default().push(job.clone());
    }
    groups
}

pub struct Orchestrator {
    ctx: AppContext,
}

impl Orchestrator {
    pub fn new(ctx: AppContext) -> Self {
        Self { ctx }
    }

    /// Fire `schedule` (or every configured schedule key) and wait for all of
    /// the resulting batches. Batches run concurrently and independently.
    pub async fn run(&self, schedule: Option<&str>) -> Result<Vec<BatchReport>> {
        let mut groups = group_by_schedule(&self.ctx.config.jobs);

        if let Some(key) = schedule {
            groups.retain(|k, _| k == key);
            if groups.is_empty() {
                bail!("No jobs are configured with schedule {:?}", key);
            }
        }

        // Build every backend up front so a broken setup fails before any job runs.
        let mut batches = Vec::with_capacity(groups.len());
        for (key, jobs) in groups {
            let service = create_service(&self.ctx.config.backup)?;
            let batcher = Batcher::new(self.ctx.workspace.clone(), service)
                .keep_failed_runs(self.ctx.config.keep_failed_runs);
            batches.push((key, jobs, batcher));
        }

        info!(batches = batches.len(), root = %self.ctx.workspace.root().display(), "Dispatching batches");

        let mut tasks = JoinSet::new();
        for (key, jobs, batcher) in batches {
            let notifier = self.ctx.notifier.clone();
            tasks.spawn(async move {
                let report = batcher.execute(&key, jobs).await;
                if let Some(notifier) = notifier {
                    if let Err(e) = notifier.notify(&report).await {
                        warn!(run_id = %report.run_id, error = %e, "Failed to send batch notification");
                    }
                }
                report
            });
        }

        let mut reports = Vec::new();
        let mut aborted = 0;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(report) => reports.push(report),
                Err(e) => {
                    error!(error = %e, "Batch task aborted");
                    aborted += 1;
                }
            }
        }

        if aborted > 0 {
            bail!("{} batch(es) aborted before completing", aborted);
        }

        reports.sort_by(|a, b| a.schedule.cmp(&b.schedule));
        Ok(reports)
    }
}
