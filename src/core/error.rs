use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Failure while building an artifact archive.
///
/// An empty artifact directory is not an error; it is reported as
/// "no archive" by the packager.
#[derive(Debug, Error)]
pub enum PackagingError {
    #[error("failed to scan {}: {source}", path.display())]
    Scan {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to read artifact {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to write archive {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to add entry {entry} to archive: {source}")]
    Encode {
        entry: String,
        #[source]
        source: zip::result::ZipError,
    },

    #[error("packaging task aborted: {0}")]
    Aborted(String),
}

/// Errors local to one job or one batch. Rendered into a `JobStatus`,
/// never propagated across sibling jobs.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("failed to {action} directory {}: {source}", path.display())]
    Directory {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("command `{command}` failed: {reason}")]
    CommandExecution { command: String, reason: String },

    #[error(transparent)]
    Packaging(#[from] PackagingError),

    #[error("{service} backup service failed to initialize: {reason}")]
    BackendInit { service: String, reason: String },

    #[error("failed to store {}: {reason}", path.display())]
    Transfer { path: PathBuf, reason: String },
}

impl JobError {
    pub fn directory(action: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Directory {
            action,
            path: path.into(),
            source,
        }
    }
}
