mod http;
mod local;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::Path;
use std::sync::Arc;

use crate::config::BackupConfig;

pub use http::HttpBackupService;
pub use local::LocalBackupService;

/// Remote storage that receives finished archives.
///
/// One instance is built per batch. `initialize` is called once, after every
/// job in the batch has finished and before any `store_file`; stores are
/// issued one at a time.
#[async_trait]
pub trait BackupService: Send + Sync {
    /// Identifier of the backend, matching the `service` config tag.
    fn name(&self) -> &'static str;

    /// Where backups end up, for reports only.
    fn display_location(&self) -> String;

    /// Archive file name for a job, without extension.
    fn artifact_file_base_name(&self, job_name: &str) -> String;

    async fn initialize(&self) -> Result<()>;

    async fn store_file(&self, path: &Path) -> Result<()>;
}

/// Factory keyed by the configured backend.
pub fn create_service(config: &BackupConfig) -> Result<Arc<dyn BackupService>> {
    let hostname = hostname();
    match config {
        BackupConfig::Local { destination } => Ok(Arc::new(LocalBackupService::new(
            destination.clone(),
            hostname,
        ))),
        BackupConfig::Http { endpoint, token } => Ok(Arc::new(HttpBackupService::new(
            endpoint.clone(),
            token.clone(),
            hostname,
        )?)),
    }
}

/// Name of this machine, or `unknown-host`.
pub fn hostname() -> String {
    match nix::unistd::gethostname() {
        Ok(name) => name.to_string_lossy().into_owned(),
        Err(e) => {
            tracing::warn!(error = %e, "Could not determine hostname");
            "unknown-host".to_string()
        }
    }
}

/// Remote key for a stored file: `<hostname>/<YYYYMMDD>/<HHMMSS>_<file>`.
pub fn object_key(hostname: &str, file_name: &str, at: DateTime<Utc>) -> String {
    format!("{}/{}", object_dir(hostname, at), object_name(file_name, at, 0))
}

/// Directory part of an object key.
pub fn object_dir(hostname: &str, at: DateTime<Utc>) -> String {
    format!("{}/{}", hostname, at.format("%Y%m%d"))
}

/// File part of an object key. A non-zero `attempt` disambiguates stores
/// of the same file within the same second: `<HHMMSS>.<attempt>_<file>`.
pub fn object_name(file_name: &str, at: DateTime<Utc>, attempt: u32) -> String {
    if attempt == 0 {
        format!("{}_{}", at.format("%H%M%S"), file_name)
    } else {
        format!("{}.{}_{}", at.format("%H%M%S"), attempt, file_name)
    }
}
