//! Watch directory scanning
//!
//! Each pass discovers projects by their marker file, reconciles them with
//! the stored projects and runs an incremental index over each one.

use crate::indexer::Indexer;
use crate::shutdown::ShutdownFlag;
use crate::store::IndexStore;
use quarry_core::config::{IndexingConfig, WorkersConfig};
use quarry_core::{discover_projects, DiscoveredProject, IndexStats, Project, Result, SourceParser};
use serde::Serialize;
use std::path::{Path, PathBuf};

/// What a watcher pass did, per watch directory.
#[derive(Debug, Clone, Default, Serialize)]
pub struct WatchReport {
    pub projects_created: usize,
    pub projects_moved: usize,
    pub projects_rekeyed: usize,
    pub stats: IndexStats,
    pub failures: Vec<(PathBuf, String)>,
}

pub struct FileWatcher<'a> {
    store: IndexStore<'a>,
    parser: &'a dyn SourceParser,
    indexing: &'a IndexingConfig,
    workers: &'a WorkersConfig,
}

impl<'a> FileWatcher<'a> {
    pub fn new(
        store: IndexStore<'a>,
        parser: &'a dyn SourceParser,
        indexing: &'a IndexingConfig,
        workers: &'a WorkersConfig,
    ) -> Self {
        Self {
            store,
            parser,
            indexing,
            workers,
        }
    }

    /// Scan every configured watch directory once.
    pub fn run_pass(&self) -> Result<WatchReport> {
        let mut report = WatchReport::default();
        for watch_dir in &self.workers.watch_dirs {
            self.scan_watch_dir(watch_dir, &mut report)?;
        }
        Ok(report)
    }

    /// Scan one directory; unlike [`run_pass`](Self::run_pass) it needs no config entry.
    pub fn scan_watch_dir(&self, watch_dir: &Path, report: &mut WatchReport) -> Result<()> {
        let row = self.store.ensure_watch_dir(watch_dir)?;
        let discovered = discover_projects(watch_dir, &self.indexing.project_marker, &self.indexing.ignore_patterns)?;
        tracing::debug!(watch_dir = %watch_dir.display(), projects = discovered.len(), "projects discovered");

        for found in &discovered {
            let project = match self.register(found, &row.id, report) {
                Ok(project) => project,
                Err(err) if err.is_safe_mode() => return Err(err),
                Err(err) => {
                    tracing::warn!(root = %found.root.display(), error = %err, "project not registered");
                    report.failures.push((found.root.clone(), err.to_string()));
                    continue;
                }
            };

            let mut exclude = vec![self.workers.version_root.clone()];
            exclude.extend(
                discovered
                    .iter()
                    .filter(|other| other.root != found.root && other.root.starts_with(&found.root))
                    .map(|other| other.root.clone()),
            );
            let indexer = Indexer::new(self.store, self.parser, self.indexing).with_exclude(exclude);
            match indexer.index_project(&project, None) {
                Ok(stats) => report.stats.merge(stats),
                Err(err) if err.is_safe_mode() => return Err(err),
                Err(err) => {
                    tracing::warn!(project = %project.id, error = %err, "indexing failed");
                    report.failures.push((project.root_path.clone(), err.to_string()));
                }
            }
        }
        Ok(())
    }

    /// Match a discovered marker to a stored project.
    ///
    /// The marker id wins: a known id at a new root is a move, a known root
    /// with a new id is re-keyed.
    fn register(&self, found: &DiscoveredProject, watch_dir_id: &str, report: &mut WatchReport) -> Result<Project> {
        let marker_id = found.marker.id.as_str();

        if let Some(project) = self.store.find_project(marker_id)? {
            if project.root_path != found.root {
                tracing::info!(project = %marker_id, from = %project.root_path.display(), to = %found.root.display(), "project moved");
                self.store.set_project_root(marker_id, &found.root)?;
                report.projects_moved += 1;
                return self.store.get_project(marker_id);
            }
            return Ok(project);
        }

        if let Some(existing) = self.store.find_project_by_root(&found.root)? {
            self.store.change_project_id(&existing.id, marker_id)?;
            report.projects_rekeyed += 1;
            return self.store.get_project(marker_id);
        }

        let project = self.store.create_project(
            &found.root,
            Some(marker_id),
            Some(watch_dir_id),
            found.marker.description.as_deref(),
        )?;
        report.projects_created += 1;
        Ok(project)
    }

    /// Pass, then sleep for the watch interval, until shutdown.
    pub fn run(&self, shutdown: &ShutdownFlag) {
        tracing::info!(dirs = self.workers.watch_dirs.len(), "watcher running");
        loop {
            match self.run_pass() {
                Ok(report) => tracing::info!(
                    created = report.projects_created,
                    reparsed = report.stats.files_reparsed,
                    deleted = report.stats.files_marked_deleted,
                    failures = report.failures.len(),
                    "watch pass complete"
                ),
                Err(err) => tracing::error!(error = %err, "watch pass failed"),
            }
            if !shutdown.sleep(self.workers.watch_interval()) {
                break;
            }
        }
        tracing::info!("watcher stopped");
    }
}
