//! Everything a command or worker needs, built once from the config

use crate::driver_client::DriverClient;
use crate::gate::{CorruptionMonitor, SafeModeGate};
use crate::store::IndexStore;
use crate::workers::{WorkerCommand, WorkerRegistry};
use quarry_core::{Config, Result};
use std::path::PathBuf;

pub struct Context {
    pub config: Config,
    pub config_path: Option<PathBuf>,
    pub client: DriverClient,
    pub registry: WorkerRegistry,
}

impl Context {
    /// Workers are launched as `{current exe} [--config path] worker run {type}`.
    pub fn new(config: Config, config_path: Option<PathBuf>) -> Result<Self> {
        let command = WorkerCommand::current_exe(config_path.as_deref())?;
        Self::with_worker_command(config, config_path, command)
    }

    pub fn with_worker_command(config: Config, config_path: Option<PathBuf>, command: WorkerCommand) -> Result<Self> {
        let client = DriverClient::from_config(&config.client)?.with_gate(SafeModeGate::new(&config.database.path));
        let registry = WorkerRegistry::new(
            &config.data_dir(),
            &config.logs_dir(),
            command,
            config.workers.stop_timeout(),
        );
        Ok(Self {
            config,
            config_path,
            client,
            registry,
        })
    }

    pub fn store(&self) -> IndexStore<'_> {
        IndexStore::new(&self.client)
    }

    pub fn gate(&self) -> SafeModeGate {
        SafeModeGate::new(&self.config.database.path)
    }

    pub fn monitor(&self) -> CorruptionMonitor<'_> {
        CorruptionMonitor::new(&self.client, &self.config.database.path).with_registry(&self.registry)
    }
}
