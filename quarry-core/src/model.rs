//! Records stored in the index and the counters of an indexing run

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchDir {
    pub id: String,
    pub path: PathBuf,
}

/// A project is a directory tree identified by a UUID, unique by root path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    pub root_path: PathBuf,
    pub watch_dir_id: Option<String>,
    pub comment: Option<String>,
    pub created_at: f64,
    pub updated_at: f64,
}

/// Stored state of one file; `path` is relative to the project root.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
    pub id: i64,
    pub project_id: String,
    pub path: String,
    pub lines: i64,
    pub mtime: f64,
    pub deleted: bool,
    pub original_path: Option<String>,
    pub version_dir: Option<String>,
    pub needs_chunking: bool,
}

/// A chunk waiting for an embedding
#[derive(Debug, Clone, PartialEq)]
pub struct PendingChunk {
    pub id: i64,
    pub file_id: i64,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyntaxErrorRecord {
    pub path: PathBuf,
    pub line: usize,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileErrorRecord {
    pub path: PathBuf,
    pub message: String,
}

/// Statistics from one indexing run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IndexStats {
    pub files_discovered: usize,
    /// Files examined, whether reparsed or skipped as unchanged
    pub files_processed: usize,
    pub files_reparsed: usize,
    pub files_skipped: usize,
    pub files_with_errors: usize,
    pub files_with_syntax_errors: usize,
    pub files_marked_deleted: usize,
    pub classes: usize,
    pub functions: usize,
    pub methods: usize,
    pub imports: usize,
    pub usages: usize,
    pub chunks: usize,
    pub syntax_errors: Vec<SyntaxErrorRecord>,
    pub errors: Vec<FileErrorRecord>,
}

impl IndexStats {
    /// Fold another run into this one, e.g. when several projects are indexed.
    pub fn merge(&mut self, other: IndexStats) {
        self.files_discovered += other.files_discovered;
        self.files_processed += other.files_processed;
        self.files_reparsed += other.files_reparsed;
        self.files_skipped += other.files_skipped;
        self.files_with_errors += other.files_with_errors;
        self.files_with_syntax_errors += other.files_with_syntax_errors;
        self.files_marked_deleted += other.files_marked_deleted;
        self.classes += other.classes;
        self.functions += other.functions;
        self.methods += other.methods;
        self.imports += other.imports;
        self.usages += other.usages;
        self.chunks += other.chunks;
        self.syntax_errors.extend(other.syntax_errors);
        self.errors.extend(other.errors);
    }

    pub fn has_errors(&self) -> bool {
        self.files_with_errors > 0 || self.files_with_syntax_errors > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_sums_counters_and_keeps_errors() {
        let mut total = IndexStats {
            files_processed: 2,
            classes: 1,
            ..Default::default()
        };
        total.merge(IndexStats {
            files_processed: 3,
            files_with_syntax_errors: 1,
            syntax_errors: vec![SyntaxErrorRecord {
                path: PathBuf::from("bad.py"),
                line: 4,
                message: "unexpected token".into(),
            }],
            ..Default::default()
        });

        assert_eq!(total.files_processed, 5);
        assert_eq!(total.classes, 1);
        assert_eq!(total.syntax_errors.len(), 1);
        assert!(total.has_errors());
    }
}
