//! End-to-end tests: a real driver on a temp database, driven through the
//! client, the store, the indexer and the workers.

use quarry_client::{
    CorruptionMonitor, DriverClient, EmbeddingProvider, FileWatcher, IndexStore, Indexer, JobClient,
    RepairWorker, RetryPolicy, SafeModeGate, Vectorizer, WatchReport,
};
use quarry_core::config::{IndexingConfig, VectorizeConfig, WorkersConfig};
use quarry_core::{sql_params, CorruptionMarker, FlatVectorIndex, PythonParser, QuarryError, VectorIndex};
use quarry_driver::{BackgroundDriver, DriverSettings};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tempfile::TempDir;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

const SAMPLE: &str = r#""""Sample module."""
import os
import sys
from pathlib import Path


class Reader:
    """Reads things."""

    def __init__(self, path):
        self.path = Path(path)

    def read(self):
        return open(self.path).read()

    def close(self):
        pass


class Writer(Reader):
    def write(self, data):
        os.write(1, data)

    def flush(self):
        sys.stdout.flush()


def main():
    Reader("x").read()
"#;

struct Harness {
    dir: TempDir,
    _driver: BackgroundDriver,
    client: DriverClient,
}

impl Harness {
    fn start() -> Self {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("data").join("index.db");
        fs::create_dir_all(db_path.parent().unwrap()).unwrap();
        let driver = BackgroundDriver::start(DriverSettings {
            db_path: db_path.clone(),
            busy_timeout: Duration::from_secs(1),
            queue_capacity: 64,
            transaction_timeout: Duration::from_secs(10),
            integrity_probe_interval: Duration::from_secs(600),
            max_pending_jobs: 16,
            job_retention: Duration::from_secs(60),
        })
        .unwrap();
        let client = DriverClient::with_options(&driver.url(), RetryPolicy::none(), Some(Duration::from_secs(30)))
            .unwrap()
            .with_gate(SafeModeGate::new(&db_path));
        Self {
            dir,
            _driver: driver,
            client,
        }
    }

    fn db_path(&self) -> PathBuf {
        self.dir.path().join("data").join("index.db")
    }

    fn store(&self) -> IndexStore<'_> {
        IndexStore::new(&self.client)
    }

    fn project_dir(&self, name: &str) -> PathBuf {
        let root = self.dir.path().join("src").join(name);
        fs::create_dir_all(&root).unwrap();
        root
    }

    fn monitor(&self) -> CorruptionMonitor<'_> {
        CorruptionMonitor::new(&self.client, &self.db_path())
    }
}

fn indexing() -> IndexingConfig {
    IndexingConfig::default()
}

fn bump_mtime(path: &Path, secs: u64) {
    let file = fs::File::options().write(true).open(path).unwrap();
    file.set_modified(SystemTime::now() + Duration::from_secs(secs)).unwrap();
}

/// Ids and timestamps of every file and entity row, table by table.
fn row_stamps(h: &Harness) -> Vec<Vec<Vec<quarry_core::SqlValue>>> {
    [
        "SELECT id, created_at, updated_at, mtime FROM files ORDER BY id",
        "SELECT id, created_at FROM classes ORDER BY id",
        "SELECT id, created_at FROM methods ORDER BY id",
        "SELECT id, created_at FROM functions ORDER BY id",
        "SELECT id, created_at FROM imports ORDER BY id",
        "SELECT id, created_at FROM usages ORDER BY id",
        "SELECT id, created_at FROM chunks ORDER BY id",
    ]
    .iter()
    .map(|sql| h.client.execute(sql, vec![], None).unwrap().rows)
    .collect()
}

/// Character histogram over eight buckets.
struct FakeEmbeddings;

impl EmbeddingProvider for FakeEmbeddings {
    fn model(&self) -> &str {
        "fake"
    }

    fn dimension(&self) -> usize {
        8
    }

    fn embed(&self, text: &str) -> quarry_core::Result<Vec<f32>> {
        let mut buckets = vec![0.0; 8];
        for c in text.chars() {
            buckets[c as usize % 8] += 1.0;
        }
        Ok(buckets)
    }
}

// ---------------------------------------------------------------------------
// Indexing
// ---------------------------------------------------------------------------

#[test]
fn test_index_counts_entities_of_sample_file() {
    let h = Harness::start();
    let root = h.project_dir("alpha");
    fs::write(root.join("sample.py"), SAMPLE).unwrap();

    let config = indexing();
    let parser = PythonParser::new();
    let project = h.store().create_project(&root, None, None, Some("demo")).unwrap();
    let stats = Indexer::new(h.store(), &parser, &config)
        .index_project(&project, None)
        .unwrap();

    assert_eq!(stats.files_reparsed, 1);
    assert_eq!(stats.classes, 2);
    assert_eq!(stats.methods, 5);
    assert_eq!(stats.functions, 1);
    assert_eq!(stats.imports, 3);

    let counts = h.store().entity_counts(Some(&project.id)).unwrap();
    assert_eq!(counts.files, 1);
    assert_eq!(counts.classes, 2);
    assert_eq!(counts.methods, 5);
    assert_eq!(counts.functions, 1);
    assert_eq!(counts.imports, 3);

    let hits = h.store().find_entities("Read%", Some(&project.id), 10).unwrap();
    assert!(hits.iter().any(|hit| hit.kind == "class" && hit.name == "Reader"));
}

#[test]
fn test_second_run_skips_unchanged_files() {
    let h = Harness::start();
    let root = h.project_dir("alpha");
    fs::write(root.join("sample.py"), SAMPLE).unwrap();
    fs::write(root.join("other.py"), "def helper():\n    return 1\n").unwrap();

    let config = indexing();
    let parser = PythonParser::new();
    let project = h.store().create_project(&root, None, None, None).unwrap();
    let indexer = Indexer::new(h.store(), &parser, &config);

    let first = indexer.index_project(&project, None).unwrap();
    assert_eq!(first.files_processed, 2);
    assert_eq!(first.files_reparsed, 2);
    let stamps = row_stamps(&h);
    assert!(!stamps[1].is_empty());

    let second = indexer.index_project(&project, None).unwrap();
    assert_eq!(second.files_processed, 2);
    assert_eq!(second.files_reparsed, 0);
    assert_eq!(second.files_skipped, 2);
    assert_eq!(row_stamps(&h), stamps, "an unchanged tree must not rewrite any row");

    fs::write(root.join("other.py"), "class Only:\n    pass\n").unwrap();
    bump_mtime(&root.join("other.py"), 10);
    let third = indexer.index_project(&project, None).unwrap();
    assert_eq!(third.files_reparsed, 1);

    let counts = h.store().entity_counts(Some(&project.id)).unwrap();
    assert_eq!(counts.classes, 3);
    assert_eq!(counts.functions, 1);
}

#[test]
fn test_removed_files_are_soft_deleted() {
    let h = Harness::start();
    let root = h.project_dir("alpha");
    fs::write(root.join("sample.py"), SAMPLE).unwrap();
    fs::write(root.join("gone.py"), "def bye():\n    pass\n").unwrap();

    let config = indexing();
    let parser = PythonParser::new();
    let project = h.store().create_project(&root, None, None, None).unwrap();
    let indexer = Indexer::new(h.store(), &parser, &config);
    indexer.index_project(&project, None).unwrap();

    fs::remove_file(root.join("gone.py")).unwrap();
    let stats = indexer.index_project(&project, None).unwrap();
    assert_eq!(stats.files_marked_deleted, 1);

    let live = h.store().list_files(&project.id, false).unwrap();
    assert_eq!(live.len(), 1);
    let all = h.store().list_files(&project.id, true).unwrap();
    let gone = all.iter().find(|f| f.path == "gone.py").unwrap();
    assert!(gone.deleted);
}

#[test]
fn test_file_stored_as_deleted_is_reparsed() {
    let h = Harness::start();
    let root = h.project_dir("alpha");
    fs::write(root.join("sample.py"), SAMPLE).unwrap();

    let config = indexing();
    let parser = PythonParser::new();
    let project = h.store().create_project(&root, None, None, None).unwrap();
    let indexer = Indexer::new(h.store(), &parser, &config);
    indexer.index_project(&project, None).unwrap();

    // Same mtime on disk, but the stored row says deleted.
    h.client
        .execute(
            "UPDATE files SET deleted = 1 WHERE project_id = ?1 AND path = 'sample.py'",
            sql_params![project.id.as_str()],
            None,
        )
        .unwrap();
    assert_eq!(h.store().entity_counts(Some(&project.id)).unwrap().classes, 0);

    let stats = indexer.index_project(&project, None).unwrap();
    assert_eq!(stats.files_reparsed, 1);
    assert_eq!(stats.files_skipped, 0);
    assert!(!h.store().get_file(&project.id, "sample.py", None).unwrap().unwrap().deleted);
    assert_eq!(h.store().entity_counts(Some(&project.id)).unwrap().classes, 2);
}

#[test]
fn test_syntax_errors_are_reported_and_indexing_continues() {
    let h = Harness::start();
    let root = h.project_dir("alpha");
    fs::write(root.join("good.py"), SAMPLE).unwrap();
    fs::write(root.join("bad.py"), "def broken(:\n    pass\n").unwrap();

    let config = indexing();
    let parser = PythonParser::new();
    let project = h.store().create_project(&root, None, None, None).unwrap();
    let stats = Indexer::new(h.store(), &parser, &config)
        .index_project(&project, None)
        .unwrap();

    assert_eq!(stats.files_processed, 2);
    assert_eq!(stats.files_reparsed, 1);
    assert_eq!(stats.files_with_syntax_errors, 1);
    assert!(stats.syntax_errors[0].path.ends_with("bad.py"));
    assert_eq!(h.store().entity_counts(Some(&project.id)).unwrap().classes, 2);
}

#[test]
fn test_independent_projects_index_in_parallel() {
    let h = Harness::start();
    let config = indexing();
    let parser = PythonParser::new();
    let mut projects = Vec::new();
    for name in ["alpha", "beta", "gamma"] {
        let root = h.project_dir(name);
        fs::write(root.join("sample.py"), SAMPLE).unwrap();
        projects.push(h.store().create_project(&root, None, None, None).unwrap());
    }

    let results = Indexer::new(h.store(), &parser, &config).index_projects(&projects);
    assert_eq!(results.len(), 3);
    for (_, result) in &results {
        assert_eq!(result.as_ref().unwrap().classes, 2);
    }
    assert_eq!(h.store().entity_counts(None).unwrap().classes, 6);
}

#[test]
fn test_reindex_single_file_inside_transaction() {
    let h = Harness::start();
    let root = h.project_dir("alpha");
    fs::write(root.join("sample.py"), SAMPLE).unwrap();

    let config = indexing();
    let parser = PythonParser::new();
    let project = h.store().create_project(&root, None, None, None).unwrap();
    let indexer = Indexer::new(h.store(), &parser, &config);

    let tx = h.client.transaction().unwrap();
    let stats = indexer
        .reindex_file(&project, Path::new("sample.py"), Some(tx.id()))
        .unwrap();
    assert_eq!(stats.files_reparsed, 1);
    tx.rollback().unwrap();
    assert_eq!(h.store().entity_counts(Some(&project.id)).unwrap().files, 0);

    let outside = indexer.reindex_file(&project, Path::new("/etc/hosts"), None);
    assert!(matches!(outside, Err(QuarryError::InvalidRequest(_))));
}

// ---------------------------------------------------------------------------
// Projects
// ---------------------------------------------------------------------------

#[test]
fn test_project_root_is_unique() {
    let h = Harness::start();
    let root = h.project_dir("alpha");
    h.store().create_project(&root, None, None, None).unwrap();
    let err = h.store().create_project(&root, None, None, None).unwrap_err();
    assert!(matches!(err, QuarryError::ProjectExists(_)));
}

#[test]
fn test_change_project_id_carries_files() {
    let h = Harness::start();
    let root = h.project_dir("alpha");
    fs::write(root.join("sample.py"), SAMPLE).unwrap();

    let config = indexing();
    let parser = PythonParser::new();
    let project = h.store().create_project(&root, None, None, None).unwrap();
    Indexer::new(h.store(), &parser, &config)
        .index_project(&project, None)
        .unwrap();

    let new_id = "6f1d2c3b-4a5e-4f60-9a7b-8c9d0e1f2a3b";
    h.store().change_project_id(&project.id, new_id).unwrap();

    assert_eq!(h.store().list_files(new_id, false).unwrap().len(), 1);
    assert!(h.store().list_files(&project.id, false).unwrap().is_empty());
    assert!(matches!(
        h.store().get_project(&project.id),
        Err(QuarryError::ProjectNotFound(_))
    ));
    assert_eq!(h.store().entity_counts(Some(new_id)).unwrap().classes, 2);
}

#[test]
fn test_delete_project_cascades() {
    let h = Harness::start();
    let root = h.project_dir("alpha");
    fs::write(root.join("sample.py"), SAMPLE).unwrap();

    let config = indexing();
    let parser = PythonParser::new();
    let project = h.store().create_project(&root, None, None, None).unwrap();
    Indexer::new(h.store(), &parser, &config)
        .index_project(&project, None)
        .unwrap();

    h.store().delete_project(&project.id).unwrap();
    assert_eq!(h.store().entity_counts(None).unwrap().methods, 0);
    assert!(matches!(
        h.store().delete_project(&project.id),
        Err(QuarryError::ProjectNotFound(_))
    ));
}

// ---------------------------------------------------------------------------
// Transactions and jobs
// ---------------------------------------------------------------------------

#[test]
fn test_dropped_transaction_rolls_back() {
    let h = Harness::start();
    let root = h.project_dir("alpha");
    {
        let tx = h.client.transaction().unwrap();
        h.client
            .execute(
                "INSERT INTO projects (id, root_path, created_at, updated_at) VALUES (?1, ?2, 0, 0)",
                sql_params!["0b7f6a5e-9a8c-4d1e-8f55-3bb6a1c0c2d4", root.to_string_lossy().to_string()],
                Some(tx.id()),
            )
            .unwrap();
    }
    assert!(h.store().list_projects().unwrap().is_empty());

    let tx = h.client.transaction().unwrap();
    h.client
        .execute(
            "INSERT INTO projects (id, root_path, created_at, updated_at) VALUES (?1, ?2, 0, 0)",
            sql_params!["0b7f6a5e-9a8c-4d1e-8f55-3bb6a1c0c2d4", root.to_string_lossy().to_string()],
            Some(tx.id()),
        )
        .unwrap();
    tx.commit().unwrap();
    assert_eq!(h.store().list_projects().unwrap().len(), 1);
}

#[test]
fn test_failed_batch_changes_nothing() {
    let h = Harness::start();
    let root = h.project_dir("alpha");
    let ops = vec![
        quarry_core::Statement::new(
            "INSERT INTO projects (id, root_path, created_at, updated_at) VALUES (?1, ?2, 0, 0)",
            sql_params!["0b7f6a5e-9a8c-4d1e-8f55-3bb6a1c0c2d4", root.to_string_lossy().to_string()],
        ),
        quarry_core::Statement::new("INSERT INTO no_such_table VALUES (1)", vec![]),
    ];
    let err = h.client.execute_batch(ops, None).unwrap_err();
    assert!(matches!(err, QuarryError::TransactionFailed(_)));
    assert!(h.store().list_projects().unwrap().is_empty());
}

#[test]
fn test_job_client_runs_one_statement() {
    let h = Harness::start();
    let jobs = JobClient::with_timing(&h.client, Duration::from_millis(20), Duration::from_secs(10));
    let out = jobs.run("SELECT COUNT(*) AS n FROM projects", vec![]).unwrap();
    assert_eq!(out.scalar_i64(), Some(0));
}

// ---------------------------------------------------------------------------
// Corruption safety
// ---------------------------------------------------------------------------

fn indexed_harness() -> (Harness, String) {
    let h = Harness::start();
    let root = h.project_dir("alpha");
    fs::write(root.join("sample.py"), SAMPLE).unwrap();
    let config = indexing();
    let parser = PythonParser::new();
    let project = h.store().create_project(&root, None, None, None).unwrap();
    Indexer::new(h.store(), &parser, &config)
        .index_project(&project, None)
        .unwrap();
    (h, project.id)
}

#[test]
fn test_marker_blocks_data_until_repair_clears_it() {
    let (h, project_id) = indexed_harness();
    let before = h.store().entity_counts(None).unwrap();

    CorruptionMarker::new("simulated corruption", vec![])
        .write(&h.db_path())
        .unwrap();

    let err = h.store().list_projects().unwrap_err();
    assert_eq!(err.code(), "database_corrupted");
    let status = h.monitor().status().unwrap();
    assert!(status.safe_mode);
    assert!(status.marker.is_some());

    let outcome = h.monitor().repair(false, false).unwrap();
    assert!(outcome.marker_cleared);
    assert!(!outcome.recreated);
    assert!(!CorruptionMarker::exists(&h.db_path()));

    assert_eq!(h.store().entity_counts(None).unwrap(), before);
    assert!(h.store().find_project(&project_id).unwrap().is_some());
}

#[test]
fn test_recreate_without_force_changes_nothing() {
    let (h, _) = indexed_harness();
    let before = h.store().entity_counts(None).unwrap();
    CorruptionMarker::new("simulated corruption", vec![])
        .write(&h.db_path())
        .unwrap();

    let err = h.monitor().repair(true, false).unwrap_err();
    assert_eq!(err.code(), "confirmation_required");
    assert!(CorruptionMarker::exists(&h.db_path()));

    let err = h.monitor().restore(&h.db_path(), false).unwrap_err();
    assert_eq!(err.code(), "confirmation_required");

    h.monitor().repair(false, false).unwrap();
    assert_eq!(h.store().entity_counts(None).unwrap(), before);
}

#[test]
fn test_forced_recreate_backs_up_and_empties_index() {
    let (h, _) = indexed_harness();
    CorruptionMarker::new("simulated corruption", vec![])
        .write(&h.db_path())
        .unwrap();

    let outcome = h.monitor().repair(true, true).unwrap();
    assert!(outcome.recreated);
    assert!(outcome.marker_cleared);
    assert!(!outcome.backup_paths.is_empty());
    for path in &outcome.backup_paths {
        assert!(path.exists(), "missing backup {}", path.display());
    }
    assert!(!CorruptionMarker::exists(&h.db_path()));

    assert!(h.store().list_projects().unwrap().is_empty());
    assert_eq!(h.store().entity_counts(None).unwrap().files, 0);
}

#[test]
fn test_backup_then_restore_brings_rows_back() {
    let (h, project_id) = indexed_harness();
    let backups = h.monitor().backup().unwrap();
    // Main database file comes first, sidecars after it.
    let db_backup = backups[0].clone();
    assert!(db_backup.to_string_lossy().contains("index.db.corrupt-backup."));

    h.store().delete_project(&project_id).unwrap();
    assert!(h.store().list_projects().unwrap().is_empty());

    let outcome = h.monitor().restore(&db_backup, true).unwrap();
    assert!(outcome.integrity.map(|r| r.is_ok()).unwrap_or(false));
    assert!(h.store().find_project(&project_id).unwrap().is_some());

    let status = h.monitor().status().unwrap();
    assert!(!status.safe_mode);
    assert!(!status.backups.is_empty());
}

// ---------------------------------------------------------------------------
// Workers
// ---------------------------------------------------------------------------

#[test]
fn test_vector_ids_stay_dense_after_rebuild() {
    let (h, project_id) = indexed_harness();
    let vectors_dir = h.dir.path().join("data").join("vectors");
    let provider = FakeEmbeddings;
    let config = VectorizeConfig {
        batch_size: 100,
        ..Default::default()
    };
    let mut vectorizer = Vectorizer::new(h.store(), &provider, &vectors_dir, &config);

    let report = vectorizer.run_pass().unwrap();
    let chunks = h.store().entity_counts(Some(&project_id)).unwrap().chunks;
    assert_eq!(report.chunks_embedded as i64, chunks);
    assert_eq!(report.projects_rebuilt, vec![project_id.clone()]);

    let ids = |h: &Harness| -> Vec<i64> {
        h.client
            .execute(
                "SELECT c.vector_id FROM chunks c JOIN files f ON f.id = c.file_id \
                 WHERE f.project_id = ?1 AND c.vector_id IS NOT NULL ORDER BY c.vector_id",
                sql_params![project_id.as_str()],
                None,
            )
            .unwrap()
            .rows()
            .filter_map(|row| row.i64("vector_id"))
            .collect()
    };
    assert_eq!(ids(&h), (0..chunks).collect::<Vec<_>>());

    let index = FlatVectorIndex::load(&vectorizer.index_path(&project_id)).unwrap();
    assert_eq!(index.len() as i64, chunks);

    let hits = vectorizer.search(&project_id, "Reads things.", 1).unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].text, "Reads things.");
    assert!(hits[0].score > 0.999);

    // Drop two chunks, then rebuild: ids close the gap.
    h.client
        .execute(
            "DELETE FROM chunks WHERE id IN (SELECT id FROM chunks ORDER BY id LIMIT 2)",
            vec![],
            None,
        )
        .unwrap();
    vectorizer.rebuild(&project_id).unwrap();
    assert_eq!(ids(&h), (0..chunks - 2).collect::<Vec<_>>());
    let index = FlatVectorIndex::load(&vectorizer.index_path(&project_id)).unwrap();
    assert_eq!(index.len() as i64, chunks - 2);
}

#[test]
fn test_version_store_copy_is_restored_by_repair_worker() {
    let (h, project_id) = indexed_harness();
    let project = h.store().get_project(&project_id).unwrap();
    let version_root = h.dir.path().join("data").join("versions");

    let moved = h
        .store()
        .move_file_to_version_store(&project, "sample.py", &version_root)
        .unwrap();
    assert!(moved.is_file());
    assert!(!project.root_path.join("sample.py").exists());
    assert!(h.store().get_file(&project_id, "sample.py", None).unwrap().unwrap().deleted);

    let report = RepairWorker::new(h.store(), 10).run_pass().unwrap();
    assert_eq!(report.restored, vec![project.root_path.join("sample.py")]);
    assert_eq!(fs::read_to_string(project.root_path.join("sample.py")).unwrap(), SAMPLE);

    let record = h.store().get_file(&project_id, "sample.py", None).unwrap().unwrap();
    assert!(!record.deleted);
    assert!(record.version_dir.is_none());

    // The reset mtime forces a reparse on the next pass.
    let config = indexing();
    let parser = PythonParser::new();
    let stats = Indexer::new(h.store(), &parser, &config)
        .index_project(&project, None)
        .unwrap();
    assert_eq!(stats.files_reparsed, 1);

    let idle = RepairWorker::new(h.store(), 10).run_pass().unwrap();
    assert!(idle.restored.is_empty());
}

#[test]
fn test_repair_worker_moves_past_rows_it_cannot_restore() {
    let h = Harness::start();
    let root = h.project_dir("alpha");
    let config = indexing();
    let parser = PythonParser::new();
    let project = h.store().create_project(&root, None, None, None).unwrap();
    let indexer = Indexer::new(h.store(), &parser, &config);
    // One pass per file keeps row ids in this order.
    for (name, body) in [
        ("blocked.py", "def a():\n    pass\n"),
        ("other.py", "def b():\n    pass\n"),
        ("lost.py", "def c():\n    pass\n"),
    ] {
        fs::write(root.join(name), body).unwrap();
        indexer.index_project(&project, None).unwrap();
    }

    let version_root = h.dir.path().join("data").join("versions");
    let store = h.store();
    for name in ["blocked.py", "other.py", "lost.py"] {
        let copy = store.move_file_to_version_store(&project, name, &version_root).unwrap();
        if name == "lost.py" {
            fs::remove_file(copy).unwrap();
        }
    }
    // Something new took the first file's place.
    fs::write(root.join("blocked.py"), "x = 1\n").unwrap();

    let worker = RepairWorker::new(h.store(), 1);
    let first = worker.run_pass().unwrap();
    assert_eq!((first.restored.len(), first.skipped, first.missing), (0, 1, 0));

    let second = worker.run_pass().unwrap();
    assert_eq!(second.restored, vec![root.join("other.py")]);
    assert_eq!(fs::read_to_string(root.join("other.py")).unwrap(), "def b():\n    pass\n");

    let third = worker.run_pass().unwrap();
    assert_eq!(third.missing, 1);
    let lost = h.store().get_file(&project.id, "lost.py", None).unwrap().unwrap();
    assert!(lost.deleted);
    assert!(lost.version_dir.is_none());

    // Only the blocked row is left, and it stays put.
    let fourth = worker.run_pass().unwrap();
    assert_eq!((fourth.restored.len(), fourth.skipped, fourth.missing), (0, 1, 0));
    assert_eq!(fs::read_to_string(root.join("blocked.py")).unwrap(), "x = 1\n");
    assert!(h.store().get_file(&project.id, "blocked.py", None).unwrap().unwrap().deleted);
}

/// Delegates to [`FakeEmbeddings`] but always rejects one text.
struct RejectingEmbeddings {
    rejected: String,
}

impl EmbeddingProvider for RejectingEmbeddings {
    fn model(&self) -> &str {
        "fake"
    }

    fn dimension(&self) -> usize {
        8
    }

    fn embed(&self, text: &str) -> quarry_core::Result<Vec<f32>> {
        if text == self.rejected {
            return Err(QuarryError::Embedding("rejected by provider".into()));
        }
        FakeEmbeddings.embed(text)
    }
}

#[test]
fn test_rejected_chunk_does_not_stall_the_backlog() {
    let (h, project_id) = indexed_harness();
    let chunks = h.store().entity_counts(Some(&project_id)).unwrap().chunks;
    let first_text = h
        .client
        .execute("SELECT text FROM chunks ORDER BY id LIMIT 1", vec![], None)
        .unwrap()
        .first()
        .and_then(|row| row.string("text"))
        .unwrap();

    let provider = RejectingEmbeddings { rejected: first_text };
    let config = VectorizeConfig {
        batch_size: 1,
        max_embedding_attempts: 2,
        ..Default::default()
    };
    let vectors_dir = h.dir.path().join("data").join("vectors");
    let mut vectorizer = Vectorizer::new(h.store(), &provider, &vectors_dir, &config);

    let (mut embedded, mut failures) = (0, 0);
    for _ in 0..chunks + 3 {
        let report = vectorizer.run_pass().unwrap();
        embedded += report.chunks_embedded;
        failures += report.embedding_failures;
    }
    assert_eq!(embedded as i64, chunks - 1);
    assert_eq!(failures, 2);
    assert!(h.store().pending_chunk_counts(2).unwrap().is_empty());

    let attempts = h
        .client
        .execute(
            "SELECT embedding_attempts FROM chunks WHERE embedding_vector IS NULL",
            vec![],
            None,
        )
        .unwrap();
    assert_eq!(attempts.rows().filter_map(|row| row.i64("embedding_attempts")).collect::<Vec<_>>(), vec![2]);

    let index = FlatVectorIndex::load(&vectorizer.index_path(&project_id)).unwrap();
    assert_eq!(index.len() as i64, chunks - 1);
}

#[test]
fn test_wrong_dimension_embedding_takes_no_vector_id() {
    let (h, project_id) = indexed_harness();
    let provider = FakeEmbeddings;
    let config = VectorizeConfig {
        batch_size: 100,
        ..Default::default()
    };
    let vectors_dir = h.dir.path().join("data").join("vectors");
    let mut vectorizer = Vectorizer::new(h.store(), &provider, &vectors_dir, &config);
    vectorizer.run_pass().unwrap();
    let chunks = h.store().entity_counts(Some(&project_id)).unwrap().chunks;

    // An embedding left over from a model with another dimension.
    let stale = h
        .client
        .execute("SELECT id FROM chunks ORDER BY id LIMIT 1 OFFSET 1", vec![], None)
        .unwrap()
        .scalar_i64()
        .unwrap();
    h.store()
        .set_chunk_embeddings(&[(stale, vec![1.0, 0.0, 0.0])], "old-model")
        .unwrap();

    let index = vectorizer.rebuild(&project_id).unwrap();
    assert_eq!(index.len() as i64, chunks - 1);
    let ids: Vec<i64> = h
        .client
        .execute(
            "SELECT vector_id FROM chunks WHERE vector_id IS NOT NULL ORDER BY vector_id",
            vec![],
            None,
        )
        .unwrap()
        .rows()
        .filter_map(|row| row.i64("vector_id"))
        .collect();
    assert_eq!(ids, (0..chunks - 1).collect::<Vec<_>>());

    let pending = h.store().pending_chunks(&project_id, 10, 3).unwrap();
    assert_eq!(pending.iter().map(|c| c.id).collect::<Vec<_>>(), vec![stale]);
}

#[test]
fn test_watcher_registers_and_follows_projects() {
    let h = Harness::start();
    let watch = h.dir.path().join("watch");
    let first_root = watch.join("alpha");
    fs::create_dir_all(&first_root).unwrap();
    let id = "0b7f6a5e-9a8c-4d1e-8f55-3bb6a1c0c2d4";
    fs::write(first_root.join("projectid"), format!(r#"{{"id": "{id}", "description": "demo"}}"#)).unwrap();
    fs::write(first_root.join("sample.py"), SAMPLE).unwrap();

    let indexing = indexing();
    let workers = WorkersConfig {
        watch_dirs: vec![watch.clone()],
        version_root: h.dir.path().join("data").join("versions"),
        ..Default::default()
    };
    let parser = PythonParser::new();
    let watcher = FileWatcher::new(h.store(), &parser, &indexing, &workers);

    let report: WatchReport = watcher.run_pass().unwrap();
    assert_eq!(report.projects_created, 1);
    assert_eq!(report.stats.files_reparsed, 1);
    let project = h.store().get_project(id).unwrap();
    assert_eq!(project.root_path, first_root);
    assert_eq!(project.comment.as_deref(), Some("demo"));

    let moved_root = watch.join("renamed");
    fs::rename(&first_root, &moved_root).unwrap();
    let report = watcher.run_pass().unwrap();
    assert_eq!(report.projects_moved, 1);
    assert_eq!(report.projects_created, 0);
    assert_eq!(h.store().get_project(id).unwrap().root_path, moved_root);
    assert_eq!(h.store().list_projects().unwrap().len(), 1);
}

#[test]
fn test_watcher_rekeys_project_when_marker_changes() {
    let h = Harness::start();
    let watch = h.dir.path().join("watch");
    let root = watch.join("alpha");
    fs::create_dir_all(&root).unwrap();
    fs::write(root.join("sample.py"), SAMPLE).unwrap();
    let original = h.store().create_project(&root, None, None, None).unwrap();

    let marker_id = "6f1d2c3b-4a5e-4f60-9a7b-8c9d0e1f2a3b";
    fs::write(root.join("projectid"), marker_id).unwrap();

    let indexing = indexing();
    let workers = WorkersConfig {
        watch_dirs: vec![watch],
        ..Default::default()
    };
    let parser = PythonParser::new();
    let report = FileWatcher::new(h.store(), &parser, &indexing, &workers)
        .run_pass()
        .unwrap();

    assert_eq!(report.projects_rekeyed, 1);
    assert!(h.store().find_project(&original.id).unwrap().is_none());
    assert_eq!(h.store().list_files(marker_id, false).unwrap().len(), 1);
}
