//! Project and source file discovery under watched directories

use crate::config::IndexingConfig;
use crate::parse::SourceParser;
use crate::{QuarryError, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use ignore::WalkBuilder;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Contents of a project marker file: JSON `{id, description?}` or a bare UUID.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectMarker {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl ProjectMarker {
    pub fn parse(content: &str) -> Result<Self> {
        let trimmed = content.trim();
        let marker = if trimmed.starts_with('{') {
            serde_json::from_str::<ProjectMarker>(trimmed)?
        } else {
            ProjectMarker {
                id: trimmed.to_string(),
                description: None,
            }
        };
        uuid::Uuid::parse_str(&marker.id)
            .map_err(|e| QuarryError::InvalidRequest(format!("project id {:?}: {e}", marker.id)))?;
        Ok(marker)
    }

    pub fn read(path: &Path) -> Result<Self> {
        Self::parse(&std::fs::read_to_string(path)?)
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        crate::safety::write_atomic(path, &serde_json::to_vec_pretty(self)?)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveredProject {
    pub root: PathBuf,
    pub marker: ProjectMarker,
}

/// Every directory under `watch_dir` that holds a `marker_name` file.
///
/// Unreadable or invalid markers are logged and skipped.
pub fn discover_projects(
    watch_dir: &Path,
    marker_name: &str,
    ignore_patterns: &[String],
) -> Result<Vec<DiscoveredProject>> {
    if !watch_dir.is_dir() {
        return Err(QuarryError::FileNotFound(watch_dir.to_path_buf()));
    }
    let ignore_set = build_ignore_set(ignore_patterns)?;

    let mut builder = WalkBuilder::new(watch_dir);
    builder.hidden(false);
    builder.git_ignore(true);

    let mut projects = Vec::new();
    for entry in builder.build() {
        let entry = match entry {
            Ok(e) => e,
            Err(_) => continue,
        };
        let path = entry.path();
        if entry.file_name() != marker_name || !path.is_file() {
            continue;
        }
        let relative = path.strip_prefix(watch_dir).unwrap_or(path);
        if ignore_set.is_match(relative) {
            continue;
        }
        let Some(root) = path.parent() else { continue };
        match ProjectMarker::read(path) {
            Ok(marker) => projects.push(DiscoveredProject {
                root: root.to_path_buf(),
                marker,
            }),
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "skipping invalid project marker");
            }
        }
    }
    projects.sort_by(|a, b| a.root.cmp(&b.root));
    Ok(projects)
}

/// Source files of the project at `root` that `parser` supports.
///
/// Skips ignored directories, the `exclude` paths (e.g. the version store)
/// and nested projects that carry their own marker.
pub fn walk_project_files(
    root: &Path,
    parser: &dyn SourceParser,
    config: &IndexingConfig,
    exclude: &[PathBuf],
) -> Result<Vec<PathBuf>> {
    let ignore_set = build_ignore_set(&config.ignore_patterns)?;

    let mut builder = WalkBuilder::new(root);
    builder.hidden(false);
    builder.git_ignore(true);
    builder.git_exclude(true);

    let nested_root = root.to_path_buf();
    let marker = config.project_marker.clone();
    let excluded: Vec<PathBuf> = exclude.to_vec();
    builder.filter_entry(move |entry| {
        let path = entry.path();
        if excluded.iter().any(|ex| path.starts_with(ex)) {
            return false;
        }
        let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
        !(is_dir && path != nested_root && path.join(&marker).is_file())
    });

    let mut files = Vec::new();
    for entry in builder.build() {
        let entry = match entry {
            Ok(e) => e,
            Err(_) => continue,
        };
        let path = entry.path();
        if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
            continue;
        }
        let relative = path.strip_prefix(root).unwrap_or(path);
        if ignore_set.is_match(relative) {
            continue;
        }
        if parser.supports(path) {
            files.push(path.to_path_buf());
        }
    }
    files.sort();
    Ok(files)
}

fn build_ignore_set(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob_pattern = if pattern.contains('*') || pattern.contains('?') {
            pattern.clone()
        } else {
            format!("**/{}", pattern)
        };
        if let Ok(g) = Glob::new(&glob_pattern) {
            builder.add(g);
        }
        if let Ok(g) = Glob::new(&format!("**/{}/**", pattern)) {
            builder.add(g);
        }
    }
    builder
        .build()
        .map_err(|e| QuarryError::InvalidRequest(format!("ignore pattern: {e}")))
}
