use crate::executor::{self, ExecutorHandle};
use crate::jobs::JobTable;
use quarry_core::Config;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

pub type SharedState = Arc<AppState>;

/// Runtime settings of one driver process
#[derive(Debug, Clone)]
pub struct DriverSettings {
    pub db_path: PathBuf,
    pub busy_timeout: Duration,
    pub queue_capacity: usize,
    pub transaction_timeout: Duration,
    pub integrity_probe_interval: Duration,
    pub max_pending_jobs: usize,
    pub job_retention: Duration,
}

impl DriverSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            db_path: config.database.path.clone(),
            busy_timeout: Duration::from_millis(config.database.busy_timeout_ms),
            queue_capacity: config.driver.queue_capacity.max(1),
            transaction_timeout: config.driver.transaction_timeout(),
            integrity_probe_interval: config.driver.integrity_probe_interval(),
            max_pending_jobs: config.driver.max_pending_jobs,
            job_retention: config.driver.job_retention(),
        }
    }
}

pub struct AppState {
    pub settings: DriverSettings,
    pub executor: ExecutorHandle,
    pub jobs: JobTable,
}

impl AppState {
    /// Start the executor thread and build the shared state around it.
    pub fn start(settings: DriverSettings) -> std::io::Result<SharedState> {
        let executor = executor::spawn(&settings)?;
        let jobs = JobTable::new(settings.max_pending_jobs, settings.job_retention);
        Ok(Arc::new(Self {
            settings,
            executor,
            jobs,
        }))
    }
}
