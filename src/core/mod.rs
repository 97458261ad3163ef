pub mod backup_service;
pub mod batch;
pub mod error;
pub mod models;
pub mod notifications;
pub mod orchestrator;
pub mod packager;
pub mod runner;
pub mod summary;
pub mod workspace;

pub use backup_service::{BackupService, create_service};
pub use batch::Batcher;
pub use error::{JobError, PackagingError};
pub use models::{DEFAULT_SCHEDULE, JobSpec, JobStatus, RunId, Status};
pub use orchestrator::{Orchestrator, group_by_schedule};
pub use packager::PackageOutcome;
pub use runner::{ENV_JOB_ARTIFACTS_DIR, ENV_JOB_DIR, JobRunner};
pub use summary::BatchReport;
pub use workspace::{JobDirectories, Workspace};
