//! Incremental indexing
//!
//! A file is reparsed only when its disk mtime differs from the stored one,
//! it has no stored record, or the record is marked deleted. A reparse
//! replaces the file's rows in one atomic batch.

use crate::store::{IndexStore, StoredFiles};
use quarry_core::config::IndexingConfig;
use quarry_core::{
    walk_project_files, FileErrorRecord, IndexStats, Project, QuarryError, Result, SourceParser,
    SyntaxErrorRecord, TransactionId,
};
use rayon::prelude::*;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

pub struct Indexer<'a> {
    store: IndexStore<'a>,
    parser: &'a dyn SourceParser,
    config: &'a IndexingConfig,
    exclude: Vec<PathBuf>,
}

impl<'a> Indexer<'a> {
    pub fn new(store: IndexStore<'a>, parser: &'a dyn SourceParser, config: &'a IndexingConfig) -> Self {
        Self {
            store,
            parser,
            config,
            exclude: Vec::new(),
        }
    }

    /// Paths never indexed, such as the version store.
    pub fn with_exclude(mut self, exclude: Vec<PathBuf>) -> Self {
        self.exclude = exclude;
        self
    }

    /// Index every supported file of `project`, then soft-delete stored files
    /// that disappeared from disk.
    pub fn index_project(&self, project: &Project, transaction_id: Option<&TransactionId>) -> Result<IndexStats> {
        let started = std::time::Instant::now();
        let files = walk_project_files(&project.root_path, self.parser, self.config, &self.exclude)?;
        let stored = self.store.stored_files(&project.id, transaction_id)?;

        let mut stats = IndexStats {
            files_discovered: files.len(),
            ..Default::default()
        };
        let mut present = HashSet::with_capacity(files.len());
        for path in &files {
            let Some(relative) = relative_path(&project.root_path, path) else {
                continue;
            };
            self.process_file(project, path, &relative, &stored, transaction_id, &mut stats)?;
            present.insert(relative);
        }

        let missing = self.store.mark_missing_deleted(&project.id, &present, transaction_id)?;
        stats.files_marked_deleted = missing.len();

        tracing::info!(
            project = %project.id,
            processed = stats.files_processed,
            reparsed = stats.files_reparsed,
            skipped = stats.files_skipped,
            deleted = stats.files_marked_deleted,
            errors = stats.files_with_errors + stats.files_with_syntax_errors,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "project indexed"
        );
        Ok(stats)
    }

    /// Index independent projects in parallel; each result is reported separately.
    pub fn index_projects(&self, projects: &[Project]) -> Vec<(String, Result<IndexStats>)> {
        projects
            .par_iter()
            .map(|project| (project.id.clone(), self.index_project(project, None)))
            .collect()
    }

    /// Index one file; `path` may be absolute or relative to the project root.
    pub fn reindex_file(
        &self,
        project: &Project,
        path: &Path,
        transaction_id: Option<&TransactionId>,
    ) -> Result<IndexStats> {
        let absolute = if path.is_absolute() {
            path.to_path_buf()
        } else {
            project.root_path.join(path)
        };
        let relative = relative_path(&project.root_path, &absolute).ok_or_else(|| {
            QuarryError::InvalidRequest(format!(
                "{} is outside project root {}",
                absolute.display(),
                project.root_path.display()
            ))
        })?;
        if !absolute.is_file() {
            return Err(QuarryError::FileNotFound(absolute));
        }
        if !self.parser.supports(&absolute) {
            return Err(QuarryError::InvalidRequest(format!(
                "{} is not handled by the {} parser",
                absolute.display(),
                self.parser.name()
            )));
        }

        let mut stored = StoredFiles::new();
        if let Some(record) = self.store.get_file(&project.id, &relative, transaction_id)? {
            stored.insert(relative.clone(), (record.mtime, record.deleted));
        }
        let mut stats = IndexStats {
            files_discovered: 1,
            ..Default::default()
        };
        self.process_file(project, &absolute, &relative, &stored, transaction_id, &mut stats)?;
        Ok(stats)
    }

    fn process_file(
        &self,
        project: &Project,
        path: &Path,
        relative: &str,
        stored: &StoredFiles,
        transaction_id: Option<&TransactionId>,
        stats: &mut IndexStats,
    ) -> Result<()> {
        stats.files_processed += 1;

        let mtime = match quarry_core::file_mtime(path) {
            Ok(mtime) => mtime,
            Err(err) => {
                file_error(stats, path, err.to_string());
                return Ok(());
            }
        };
        if let Some((stored_mtime, deleted)) = stored.get(relative) {
            if !deleted && same_mtime(*stored_mtime, mtime) {
                stats.files_skipped += 1;
                return Ok(());
            }
        }

        let source = match read_source(path, self.config.max_file_bytes) {
            Ok(source) => source,
            Err(message) => {
                file_error(stats, path, message);
                return Ok(());
            }
        };
        let facts = match self.parser.parse(path, &source) {
            Ok(facts) => facts,
            Err(err) => {
                tracing::debug!(path = %path.display(), line = err.line, "syntax error");
                stats.files_with_syntax_errors += 1;
                stats.syntax_errors.push(SyntaxErrorRecord {
                    path: path.to_path_buf(),
                    line: err.line,
                    message: err.message,
                });
                return Ok(());
            }
        };

        match self
            .store
            .replace_file_entities(&project.id, relative, mtime, &facts, transaction_id)
        {
            Ok(_) => {}
            Err(err) if aborts_run(&err, transaction_id.is_some()) => return Err(err),
            Err(err) => {
                file_error(stats, path, err.to_string());
                return Ok(());
            }
        }

        stats.files_reparsed += 1;
        stats.classes += facts.classes.len();
        stats.methods += facts.method_count();
        stats.functions += facts.functions.len();
        stats.imports += facts.imports.len();
        stats.usages += facts.usages.len();
        stats.chunks += facts.chunks.len();
        Ok(())
    }
}

/// Stored mtimes travel through JSON, so allow for the last bit of a float.
fn same_mtime(stored: f64, disk: f64) -> bool {
    (stored - disk).abs() < 1e-6
}

/// Errors after which no further file of the run can succeed.
fn aborts_run(err: &QuarryError, in_transaction: bool) -> bool {
    err.is_safe_mode()
        || matches!(err, QuarryError::DriverUnavailable(_))
        || (in_transaction
            && matches!(
                err,
                QuarryError::TransactionFailed(_) | QuarryError::TransactionNotFound(_)
            ))
}

fn file_error(stats: &mut IndexStats, path: &Path, message: String) {
    tracing::warn!(path = %path.display(), error = %message, "file not indexed");
    stats.files_with_errors += 1;
    stats.errors.push(FileErrorRecord {
        path: path.to_path_buf(),
        message,
    });
}

fn read_source(path: &Path, max_bytes: u64) -> std::result::Result<String, String> {
    let size = std::fs::metadata(path).map_err(|e| e.to_string())?.len();
    if max_bytes > 0 && size > max_bytes {
        return Err(format!("file is {size} bytes, limit is {max_bytes}"));
    }
    let bytes = std::fs::read(path).map_err(|e| e.to_string())?;
    String::from_utf8(bytes).map_err(|e| format!("not valid UTF-8: {e}"))
}

/// `/`-separated path of `path` below `root`.
pub fn relative_path(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let parts: Vec<String> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().to_string())
        .collect();
    if parts.is_empty() {
        return None;
    }
    Some(parts.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_paths_use_forward_slashes() {
        let root = Path::new("/src/proj");
        assert_eq!(
            relative_path(root, Path::new("/src/proj/pkg/mod.py")),
            Some("pkg/mod.py".to_string())
        );
        assert_eq!(relative_path(root, Path::new("/elsewhere/x.py")), None);
        assert_eq!(relative_path(root, root), None);
    }

    #[test]
    fn oversized_and_binary_files_are_read_errors() {
        let dir = tempfile::TempDir::new().unwrap();
        let big = dir.path().join("big.py");
        std::fs::write(&big, "x = 1\n".repeat(100)).unwrap();
        assert!(read_source(&big, 10).unwrap_err().contains("limit"));
        assert!(read_source(&big, 0).is_ok());

        let binary = dir.path().join("bin.py");
        std::fs::write(&binary, [0xff, 0xfe, 0x00, 0x80]).unwrap();
        assert!(read_source(&binary, 0).unwrap_err().contains("UTF-8"));
    }

    #[test]
    fn only_fatal_errors_abort_a_run() {
        assert!(aborts_run(&QuarryError::corrupted("m"), false));
        assert!(aborts_run(&QuarryError::DriverUnavailable("down".into()), false));
        assert!(aborts_run(&QuarryError::TransactionFailed("x".into()), true));
        assert!(!aborts_run(&QuarryError::TransactionFailed("x".into()), false));
        assert!(!aborts_run(&QuarryError::InvalidRequest("x".into()), false));
    }
}
