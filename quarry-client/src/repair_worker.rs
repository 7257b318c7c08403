//! Restores soft-deleted files from the version store

use crate::shutdown::ShutdownFlag;
use crate::store::{IndexStore, VersionedFile};
use quarry_core::Result;
use serde::Serialize;
use std::cell::Cell;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RepairReport {
    pub restored: Vec<PathBuf>,
    /// Original path already occupied, left alone
    pub skipped: usize,
    /// Version store copy gone; the row no longer points at it
    pub missing: usize,
}

/// Walks the versioned rows a batch at a time. Each pass resumes after the
/// last row the previous pass looked at and wraps around at the end, so rows
/// that cannot be restored yet never hide the ones behind them.
pub struct RepairWorker<'a> {
    store: IndexStore<'a>,
    batch_size: usize,
    cursor: Cell<i64>,
}

impl<'a> RepairWorker<'a> {
    pub fn new(store: IndexStore<'a>, batch_size: usize) -> Self {
        Self {
            store,
            batch_size: batch_size.max(1),
            cursor: Cell::new(0),
        }
    }

    /// Copy back the next batch of versioned files whose original location is free.
    pub fn run_pass(&self) -> Result<RepairReport> {
        let mut report = RepairReport::default();
        let mut batch = self.store.versioned_deleted_files(self.cursor.get(), self.batch_size)?;
        if batch.is_empty() && self.cursor.get() > 0 {
            self.cursor.set(0);
            batch = self.store.versioned_deleted_files(0, self.batch_size)?;
        }
        let reached_end = batch.len() < self.batch_size;
        for versioned in &batch {
            // Advance first: a row that errors is retried after a full cycle.
            self.cursor.set(versioned.file.id);
            self.restore_one(versioned, &mut report)?;
        }
        if reached_end {
            self.cursor.set(0);
        }
        Ok(report)
    }

    fn restore_one(&self, versioned: &VersionedFile, report: &mut RepairReport) -> Result<()> {
        let file = &versioned.file;
        let (Some(version_dir), Some(original)) = (&file.version_dir, &file.original_path) else {
            return Ok(());
        };
        let source = PathBuf::from(version_dir).join(original);
        let target = versioned.root_path.join(original);

        if !source.is_file() {
            tracing::warn!(file = file.id, source = %source.display(), "version store copy missing");
            self.store.clear_version_dir(file.id)?;
            report.missing += 1;
            return Ok(());
        }
        if target.exists() {
            report.skipped += 1;
            return Ok(());
        }
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::copy(&source, &target)?;
        self.store.mark_restored(file.id)?;
        tracing::info!(file = file.id, target = %target.display(), "file restored from version store");
        report.restored.push(target);
        Ok(())
    }

    pub fn run(&self, shutdown: &ShutdownFlag, poll_interval: Duration) {
        tracing::info!("repair worker running");
        loop {
            match self.run_pass() {
                Ok(report) if !report.restored.is_empty() || report.missing > 0 => {
                    tracing::info!(
                        restored = report.restored.len(),
                        skipped = report.skipped,
                        missing = report.missing,
                        "repair pass complete"
                    )
                }
                Ok(_) => {}
                Err(err) => tracing::error!(error = %err, "repair pass failed"),
            }
            if !shutdown.sleep(poll_interval) {
                break;
            }
        }
        tracing::info!("repair worker stopped");
    }
}
