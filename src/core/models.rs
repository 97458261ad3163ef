use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Schedule key used for jobs that do not name one.
pub const DEFAULT_SCHEDULE: &str = "default";

const BYTES_PER_SI: u64 = 1000;
const SI_UNITS: [&str; 8] = ["B", " kB", " MB", " GB", " TB", " PB", " EB", " ZB"];

/// A configured backup job. Validated at config load time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSpec {
    pub name: String,
    /// Executable to launch. Never interpreted by a shell.
    pub command: String,
    /// Arguments passed verbatim to `command`.
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_schedule")]
    pub schedule: String,
}

fn default_schedule() -> String {
    DEFAULT_SCHEDULE.to_string()
}

impl JobSpec {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            args: Vec::new(),
            schedule: default_schedule(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_schedule(mut self, schedule: impl Into<String>) -> Self {
        self.schedule = schedule.into();
        self
    }

    /// Command line as shown in logs and error messages.
    pub fn command_line(&self) -> String {
        if self.args.is_empty() {
            self.command.clone()
        } else {
            format!("{} {}", self.command, self.args.join(" "))
        }
    }
}

/// Identifies one firing of a schedule key. Scopes every working directory
/// created for that firing.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RunId(String);

impl RunId {
    /// Time-derived and unique across concurrently running batches.
    pub fn generate() -> Self {
        let now = Utc::now();
        Self(format!(
            "{}_{}",
            now.format("%Y%m%d%H%M%S"),
            Uuid::now_v7().simple()
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for RunId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Status {
    Success,
    Failure,
}

/// Outcome of one job within one run.
///
/// The fields are a flattened projection of the job's lifecycle:
/// command, packaging, then transfer. `transfer_ended_at` is only ever
/// set for jobs whose archive was created and handed to the backup service.
#[derive(Debug, Clone, Serialize)]
pub struct JobStatus {
    pub job: JobSpec,
    pub status: Status,
    /// Trimmed standard output of the command.
    pub output: String,
    /// Trimmed standard error plus error detail, empty if none.
    pub error: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub archive_created: bool,
    pub archive_path: Option<PathBuf>,
    pub archive_size: u64,
    pub transfer_started_at: Option<DateTime<Utc>>,
    pub transfer_ended_at: Option<DateTime<Utc>>,
    pub transfer_error: String,
}

impl JobStatus {
    pub fn started(job: JobSpec) -> Self {
        let now = Utc::now();
        Self {
            job,
            status: Status::Success,
            output: String::new(),
            error: String::new(),
            started_at: now,
            ended_at: now,
            archive_created: false,
            archive_path: None,
            archive_size: 0,
            transfer_started_at: None,
            transfer_ended_at: None,
            transfer_error: String::new(),
        }
    }

    /// Mark the job failed and append `message` to the error text.
    pub fn fail(&mut self, message: impl AsRef<str>) {
        self.status = Status::Failure;
        let message = message.as_ref().trim();
        if message.is_empty() {
            return;
        }
        if self.error.is_empty() {
            self.error = message.to_string();
        } else {
            self.error = format!("{}\n{}", self.error, message);
        }
    }

    /// Mark the job failed because its archive could not be stored.
    pub fn fail_transfer(&mut self, message: impl Into<String>) {
        self.status = Status::Failure;
        self.transfer_error = message.into();
    }

    pub fn is_successful(&self) -> bool {
        self.status == Status::Success
    }

    pub fn elapsed(&self) -> Duration {
        self.ended_at - self.started_at
    }

    pub fn transfer_elapsed(&self) -> Option<Duration> {
        match (self.transfer_started_at, self.transfer_ended_at) {
            (Some(start), Some(end)) => Some(end - start),
            _ => None,
        }
    }

    pub fn archive_name(&self) -> Option<String> {
        self.archive_path
            .as_ref()
            .and_then(|p| p.file_name())
            .map(|n| n.to_string_lossy().into_owned())
    }

    pub fn archive_size_display(&self) -> String {
        format_size(self.archive_size)
    }
}

/// Human readable size using decimal SI units.
pub fn format_size(bytes: u64) -> String {
    let mut size = bytes;
    for unit in SI_UNITS {
        if size < 1024 {
            return format!("{}{}", size, unit);
        }
        size /= BYTES_PER_SI;
    }
    format!("{}{}", bytes, SI_UNITS[0])
}
