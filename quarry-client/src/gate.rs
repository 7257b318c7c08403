//! Safe-mode gate and the repair/restore workflows around the corruption marker

use crate::driver_client::DriverClient;
use crate::workers::{WorkerRegistry, WorkerType};
use quarry_core::safety::{backup_database_files, list_backups};
use quarry_core::{CorruptionMarker, IntegrityReport, IntegrityStatus, QuarryError, RepairLock, Result};
use serde::Serialize;
use std::path::{Path, PathBuf};

/// What a command needs from the index, for the safe-mode check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    Status,
    Backup,
    Repair,
    Restore,
    /// Starting, stopping or listing worker processes
    WorkerControl,
    Index,
    Query,
    Mutate,
}

impl CommandKind {
    pub fn allowed_in_safe_mode(self) -> bool {
        matches!(
            self,
            Self::Status | Self::Backup | Self::Repair | Self::Restore | Self::WorkerControl
        )
    }
}

/// Refuses index access while the corruption marker exists.
#[derive(Debug, Clone)]
pub struct SafeModeGate {
    db_path: PathBuf,
}

impl SafeModeGate {
    pub fn new(db_path: &Path) -> Self {
        Self {
            db_path: db_path.to_path_buf(),
        }
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn is_safe_mode(&self) -> bool {
        CorruptionMarker::exists(&self.db_path)
    }

    pub fn check(&self, kind: CommandKind) -> Result<()> {
        if kind.allowed_in_safe_mode() {
            return Ok(());
        }
        self.check_data_access()
    }

    pub(crate) fn check_data_access(&self) -> Result<()> {
        match CorruptionMarker::read(&self.db_path)? {
            Some(marker) => Err(QuarryError::corrupted(marker.message)),
            None => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CorruptionStatus {
    pub db_path: PathBuf,
    pub safe_mode: bool,
    pub marker: Option<CorruptionMarker>,
    pub integrity: Option<IntegrityReport>,
    pub driver_reachable: bool,
    pub backups: Vec<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RepairOutcome {
    pub recreated: bool,
    pub marker_cleared: bool,
    pub integrity: Option<IntegrityReport>,
    pub backup_paths: Vec<PathBuf>,
    pub stopped_workers: Vec<WorkerType>,
}

/// Drives the Corrupted -> Healthy transitions.
pub struct CorruptionMonitor<'a> {
    client: &'a DriverClient,
    db_path: PathBuf,
    registry: Option<&'a WorkerRegistry>,
}

impl<'a> CorruptionMonitor<'a> {
    pub fn new(client: &'a DriverClient, db_path: &Path) -> Self {
        Self {
            client,
            db_path: db_path.to_path_buf(),
            registry: None,
        }
    }

    /// Workers from `registry` are stopped before destructive steps.
    pub fn with_registry(mut self, registry: &'a WorkerRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn status(&self) -> Result<CorruptionStatus> {
        let marker = CorruptionMarker::read(&self.db_path)?;
        let driver_reachable = self.client.is_reachable();
        let integrity = if driver_reachable {
            match self.client.integrity() {
                Ok(report) => Some(report),
                Err(err) => {
                    tracing::warn!(error = %err, "integrity probe failed");
                    None
                }
            }
        } else {
            None
        };
        // The probe may have just entered safe mode.
        let marker = match marker {
            Some(marker) => Some(marker),
            None => CorruptionMarker::read(&self.db_path)?,
        };
        Ok(CorruptionStatus {
            db_path: self.db_path.clone(),
            safe_mode: marker.is_some(),
            marker,
            integrity,
            driver_reachable,
            backups: list_backups(&self.db_path)?,
        })
    }

    /// Back up the database files. Falls back to a local copy when the
    /// driver is down, since nothing is writing then.
    pub fn backup(&self) -> Result<Vec<PathBuf>> {
        match self.client.backup() {
            Ok(paths) => Ok(paths),
            Err(QuarryError::DriverUnavailable(reason)) => {
                tracing::warn!(reason = %reason, "driver unreachable, backing up files directly");
                backup_database_files(&self.db_path)
                    .map_err(|e| QuarryError::BackupError(e.to_string()))
            }
            Err(err) => Err(err),
        }
    }

    /// Leave safe mode.
    ///
    /// Without `recreate` the marker is cleared only if a fresh integrity
    /// check passes; nothing else changes. With `recreate` the database is
    /// backed up and rebuilt empty, which requires `force`.
    pub fn repair(&self, recreate: bool, force: bool) -> Result<RepairOutcome> {
        if recreate && !force {
            return Err(QuarryError::ConfirmationRequired {
                operation: "repair --recreate".to_string(),
            });
        }
        let _lock = RepairLock::try_acquire(&self.db_path)?;

        if !recreate {
            let report = self.client.integrity()?;
            return match report.status {
                IntegrityStatus::Ok => {
                    let marker_cleared = CorruptionMarker::clear(&self.db_path)?;
                    tracing::info!(marker_cleared, "integrity check passed");
                    Ok(RepairOutcome {
                        marker_cleared,
                        integrity: Some(report),
                        ..Default::default()
                    })
                }
                IntegrityStatus::Corrupt => Err(QuarryError::repair(
                    format!(
                        "integrity check still failing ({}); use --recreate --force or restore a backup",
                        report.detail
                    ),
                    self.marker_backups(),
                )),
                IntegrityStatus::Busy => Err(QuarryError::repair(
                    format!("database busy, retry later: {}", report.detail),
                    Vec::new(),
                )),
            };
        }

        let stopped_workers = self.stop_workers()?;
        let backup_paths = self.client.recreate()?;
        let marker_cleared = CorruptionMarker::clear(&self.db_path)?;
        tracing::warn!(
            db = %self.db_path.display(),
            backups = backup_paths.len(),
            "database recreated"
        );
        Ok(RepairOutcome {
            recreated: true,
            marker_cleared,
            integrity: None,
            backup_paths,
            stopped_workers,
        })
    }

    /// Replace the database with `backup_path`. Destructive, requires `force`.
    pub fn restore(&self, backup_path: &Path, force: bool) -> Result<RepairOutcome> {
        if !force {
            return Err(QuarryError::ConfirmationRequired {
                operation: "restore".to_string(),
            });
        }
        let _lock = RepairLock::try_acquire(&self.db_path)?;
        let stopped_workers = self.stop_workers()?;

        let restored = self.client.restore(backup_path)?;
        if !restored.integrity.is_ok() {
            let message = format!(
                "restored backup {} fails integrity: {}",
                backup_path.display(),
                restored.integrity.detail
            );
            CorruptionMarker::record(&self.db_path, &message, &restored.backup_paths)?;
            return Err(QuarryError::repair(message, restored.backup_paths));
        }

        let marker_cleared = CorruptionMarker::clear(&self.db_path)?;
        tracing::warn!(backup = %backup_path.display(), "database restored");
        Ok(RepairOutcome {
            recreated: false,
            marker_cleared,
            integrity: Some(restored.integrity),
            backup_paths: restored.backup_paths,
            stopped_workers,
        })
    }

    fn stop_workers(&self) -> Result<Vec<WorkerType>> {
        match self.registry {
            Some(registry) => registry.stop_all(),
            None => Ok(Vec::new()),
        }
    }

    fn marker_backups(&self) -> Vec<PathBuf> {
        CorruptionMarker::read(&self.db_path)
            .ok()
            .flatten()
            .map(|m| m.backup_paths)
            .unwrap_or_default()
    }
}
