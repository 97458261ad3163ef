use crate::config::AppConfig;
use crate::core::{JobError, Workspace};
use crate::core::notifications::{NotificationChannel, create_notifier};
use std::sync::Arc;

#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<AppConfig>,
    pub workspace: Workspace,
    pub notifier: Option<Arc<dyn NotificationChannel>>,
}

impl AppContext {
    pub fn new(config: AppConfig) -> Result<Self, JobError> {
        let workspace = Workspace::from_config(config.work_dir.as_deref())?;
        let notifier = create_notifier(&config.reporting);
        Ok(Self {
            config: Arc::new(config),
            workspace,
            notifier,
        })
    }
}
