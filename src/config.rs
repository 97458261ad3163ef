//! Configuration loading and validation.
//!
//! Sources, later ones winning: the TOML file, `FROSTY_`-prefixed environment
//! variables (`__` separates nested keys), then command-line overrides.

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use thiserror::Error;

use crate::core::JobSpec;

const ENV_PREFIX: &str = "FROSTY_";

static JOB_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9._-]+$").expect("job name pattern is valid"));

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("cannot parse config file {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: Box<figment::Error>,
    },

    #[error("invalid config file {}:\n  - {}", path.display(), problems.join("\n  - "))]
    Invalid { path: PathBuf, problems: Vec<String> },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Root for run and job working directories. Defaults to `~/.frosty`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub work_dir: Option<PathBuf>,

    /// Keep the run directory when a failed job left an archive behind.
    #[serde(default)]
    pub keep_failed_runs: bool,

    pub backup: BackupConfig,

    #[serde(default)]
    pub reporting: NotificationConfig,

    #[serde(default)]
    pub jobs: Vec<JobSpec>,
}

/// Backend selection, tagged by `service`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "service", rename_all = "lowercase")]
pub enum BackupConfig {
    Local {
        destination: PathBuf,
    },
    Http {
        endpoint: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<String>,
    },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotificationConfig {
    #[serde(default)]
    pub channel: NotificationChannelType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slack_webhook: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationChannelType {
    #[default]
    None,
    Slack,
}

impl AppConfig {
    /// Load and validate `path`, applying environment and `overrides`.
    pub fn load<T: Serialize>(path: &Path, overrides: Option<&T>) -> Result<Self, ConfigError> {
        if !path.is_file() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }

        let mut figment = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"));

        if let Some(overrides) = overrides {
            figment = figment.merge(Serialized::defaults(overrides));
        }

        Self::from_figment(path, figment)
    }

    /// Extract and validate an already assembled figment.
    pub fn from_figment(path: &Path, figment: Figment) -> Result<Self, ConfigError> {
        let config: AppConfig = figment.extract().map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: Box::new(e),
        })?;

        let problems = config.validate();
        if !problems.is_empty() {
            return Err(ConfigError::Invalid {
                path: path.to_path_buf(),
                problems,
            });
        }

        Ok(config)
    }

    /// Every problem found, empty when the config is usable.
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();

        if self.jobs.is_empty() {
            problems.push("at least one job must be configured".to_string());
        }

        let mut seen = HashSet::new();
        for (i, job) in self.jobs.iter().enumerate() {
            let name = job.name.trim();

            if name.is_empty() {
                problems.push(format!("job in position {} has no name", i));
            } else if !is_safe_job_name(name) || name != job.name {
                problems.push(format!(
                    "job name {:?} may only contain letters, digits, '.', '_' and '-'",
                    job.name
                ));
            } else if !seen.insert(name) {
                problems.push(format!("job names must be unique, duplicate found for {:?}", name));
            }

            if job.command.trim().is_empty() {
                problems.push(format!("job {:?} has no command", job.name));
            }

            if job.schedule.trim().is_empty() {
                problems.push(format!("job {:?} has an empty schedule", job.name));
            }
        }

        match &self.backup {
            BackupConfig::Local { destination } if destination.as_os_str().is_empty() => {
                problems.push("backup destination must not be empty".to_string());
            }
            BackupConfig::Http { endpoint, .. }
                if !(endpoint.starts_with("http://") || endpoint.starts_with("https://")) =>
            {
                problems.push(format!("backup endpoint {:?} must be an http(s) URL", endpoint));
            }
            _ => {}
        }

        if self.reporting.channel == NotificationChannelType::Slack
            && self
                .reporting
                .slack_webhook
                .as_deref()
                .is_none_or(|w| w.trim().is_empty())
        {
            problems.push("slack reporting requires slack_webhook".to_string());
        }

        problems
    }
}

/// A single path component that cannot escape its parent directory.
fn is_safe_job_name(name: &str) -> bool {
    JOB_NAME.is_match(name) && name != "." && name != ".."
}
