use super::NotificationChannel;
use crate::core::summary::BatchReport;
use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Value, json};

/// Jobs listed individually before the message is truncated.
const MAX_LISTED_JOBS: usize = 10;

pub struct SlackNotifier {
    webhook_url: String,
    client: reqwest::Client,
}

impl SlackNotifier {
    pub fn new(webhook_url: String) -> Self {
        Self {
            webhook_url,
            client: reqwest::Client::new(),
        }
    }

    fn format_message(&self, report: &BatchReport) -> Value {
        let title = if report.is_successful() {
            "[SUCCESS] Frosty Backup Report"
        } else {
            "[FAILURE] Frosty Backup Report"
        };

        let mut blocks = vec![
            json!({
                "type": "header",
                "text": {
                    "type": "plain_text",
                    "text": title,
                    "emoji": true
                }
            }),
            json!({
                "type": "section",
                "fields": [
                    {
                        "type": "mrkdwn",
                        "text": format!("*Host:*\n{}", report.hostname)
                    },
                    {
                        "type": "mrkdwn",
                        "text": format!("*Schedule:*\n`{}`", report.schedule)
                    },
                    {
                        "type": "mrkdwn",
                        "text": format!("*Stored in:*\n{}", report.location)
                    },
                    {
                        "type": "mrkdwn",
                        "text": format!(
                            "*Duration:*\n{}s ({} of {} jobs failed)",
                            report.elapsed().num_seconds(),
                            report.failed_count(),
                            report.jobs.len()
                        )
                    }
                ]
            }),
        ];

        for job in report.jobs.iter().take(MAX_LISTED_JOBS) {
            let text = if job.is_successful() {
                match job.archive_name() {
                    Some(archive) => format!(
                        "*{}*: ok, `{}` ({})",
                        job.job.name,
                        archive,
                        job.archive_size_display()
                    ),
                    None => format!("*{}*: ok, no artifacts", job.job.name),
                }
            } else {
                let error = [job.error.as_str(), job.transfer_error.as_str()]
                    .into_iter()
                    .filter(|e| !e.is_empty())
                    .collect::<Vec<_>>()
                    .join("\n");
                format!("*{}*: failed\n```{}```", job.job.name, error)
            };

            blocks.push(json!({
                "type": "section",
                "text": {
                    "type": "mrkdwn",
                    "text": text
                }
            }));
        }

        if report.jobs.len() > MAX_LISTED_JOBS {
            blocks.push(json!({
                "type": "context",
                "elements": [
                    {
                        "type": "mrkdwn",
                        "text": format!("... and {} more", report.jobs.len() - MAX_LISTED_JOBS)
                    }
                ]
            }));
        }

        json!({ "blocks": blocks })
    }
}

#[async_trait]
impl NotificationChannel for SlackNotifier {
    async fn notify(&self, report: &BatchReport) -> Result<()> {
        let payload = self.format_message(report);
        self.client
            .post(&self.webhook_url)
            .json(&payload)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::models::{JobSpec, JobStatus, RunId};
    use chrono::Utc;

    fn report(jobs: Vec<JobStatus>) -> BatchReport {
        BatchReport {
            run_id: RunId::from("run"),
            schedule: "nightly".to_string(),
            service_name: "local".to_string(),
            location: "Local directory: /srv".to_string(),
            hostname: "backup-host".to_string(),
            started_at: Utc::now(),
            ended_at: Utc::now(),
            jobs,
        }
    }

    #[test]
    fn test_success_message() {
        let mut ok = JobStatus::started(JobSpec::new("db", "/bin/dump"));
        ok.archive_path = Some("/work/jobs/run/db/artifacts/db.zip".into());
        ok.archive_size = 2048;

        let notifier = SlackNotifier::new("https://hooks.slack.com/x".to_string());
        let message = notifier.format_message(&report(vec![ok]));
        let text = message.to_string();

        assert_eq!(message["blocks"][0]["text"]["text"], "[SUCCESS] Frosty Backup Report");
        assert!(text.contains("backup-host"));
        assert!(text.contains("`db.zip` (2 kB)"));
    }

    #[test]
    fn test_failure_message_includes_errors() {
        let mut bad = JobStatus::started(JobSpec::new("broken", "/bin/false"));
        bad.fail("exit status: 1");
        bad.fail_transfer("upload rejected");

        let notifier = SlackNotifier::new("https://hooks.slack.com/x".to_string());
        let message = notifier.format_message(&report(vec![bad]));
        let text = message["blocks"][2]["text"]["text"].as_str().unwrap();

        assert_eq!(message["blocks"][0]["text"]["text"], "[FAILURE] Frosty Backup Report");
        assert!(text.contains("exit status: 1"));
        assert!(text.contains("upload rejected"));
    }

    #[test]
    fn test_long_reports_are_truncated() {
        let jobs = (0..13)
            .map(|i| JobStatus::started(JobSpec::new(format!("job-{i}"), "/bin/true")))
            .collect();

        let notifier = SlackNotifier::new("https://hooks.slack.com/x".to_string());
        let message = notifier.format_message(&report(jobs));
        let blocks = message["blocks"].as_array().unwrap();

        assert_eq!(blocks.len(), 2 + MAX_LISTED_JOBS + 1);
        assert!(message.to_string().contains("... and 3 more"));
    }
}
