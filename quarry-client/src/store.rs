//! Typed index operations over driver RPC
//!
//! Every method maps to one or a few RPCs. Writes that must be atomic go out
//! as a single `execute_batch`, inside the caller's transaction when one is
//! passed.

use crate::driver_client::{DriverClient, Select};
use quarry_core::schema::FILE_ENTITY_TABLES;
use quarry_core::vector::{decode_vector, encode_vector};
use quarry_core::{
    sql_params, FileRecord, ParsedFacts, PendingChunk, Project, QuarryError, Result, Row, SqlValue,
    Statement, TransactionId, WatchDir,
};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

/// Resolves the file row inside a batch; `?1` is the project id, `?2` the path.
const FILE_ID: &str = "(SELECT id FROM files WHERE project_id = ?1 AND path = ?2)";

const PROJECT_COLUMNS: &str = "id, root_path, watch_dir_id, comment, created_at, updated_at";
const FILE_COLUMNS: &str =
    "id, project_id, path, lines, mtime, deleted, original_path, version_dir, needs_chunking";

/// Stored mtime and deleted flag, keyed by relative path
pub type StoredFiles = HashMap<String, (f64, bool)>;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EntityCounts {
    pub files: i64,
    pub classes: i64,
    pub methods: i64,
    pub functions: i64,
    pub imports: i64,
    pub usages: i64,
    pub chunks: i64,
}

/// A class, function or method matched by name
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntityHit {
    pub kind: String,
    pub name: String,
    pub project_id: String,
    pub path: String,
    pub line: i64,
}

/// A soft-deleted file with a copy in the version store
#[derive(Debug, Clone, PartialEq)]
pub struct VersionedFile {
    pub file: FileRecord,
    pub root_path: PathBuf,
}

#[derive(Clone, Copy)]
pub struct IndexStore<'a> {
    client: &'a DriverClient,
}

impl<'a> IndexStore<'a> {
    pub fn new(client: &'a DriverClient) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &'a DriverClient {
        self.client
    }

    // Watch dirs and projects

    /// Find or create the watch dir row for `path`.
    pub fn ensure_watch_dir(&self, path: &Path) -> Result<WatchDir> {
        let path_str = path_string(path);
        let results = self.client.execute_batch(
            vec![
                Statement::new(
                    "INSERT OR IGNORE INTO watch_dirs (id, path) VALUES (?1, ?2)",
                    sql_params![uuid::Uuid::new_v4().to_string(), path_str.as_str()],
                ),
                Statement::new("SELECT id, path FROM watch_dirs WHERE path = ?1", sql_params![path_str.as_str()]),
            ],
            None,
        )?;
        results
            .last()
            .and_then(|out| out.first())
            .and_then(|row| {
                Some(WatchDir {
                    id: row.string("id")?,
                    path: PathBuf::from(row.str("path")?),
                })
            })
            .ok_or_else(|| QuarryError::InvalidRequest(format!("watch dir {} not stored", path.display())))
    }

    /// Register a project rooted at `root`. `id` defaults to a fresh UUID.
    pub fn create_project(
        &self,
        root: &Path,
        id: Option<&str>,
        watch_dir_id: Option<&str>,
        comment: Option<&str>,
    ) -> Result<Project> {
        if self.find_project_by_root(root)?.is_some() {
            return Err(QuarryError::ProjectExists(root.to_path_buf()));
        }
        let id = match id {
            Some(id) => validate_project_id(id)?,
            None => uuid::Uuid::new_v4().to_string(),
        };
        if self.find_project(&id)?.is_some() {
            return Err(QuarryError::InvalidRequest(format!("project id {id} already in use")));
        }
        let now = quarry_core::unix_now();
        self.client.execute(
            "INSERT INTO projects (id, root_path, watch_dir_id, comment, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
            sql_params![id.as_str(), path_string(root), watch_dir_id, comment, now],
            None,
        )?;
        tracing::info!(project = %id, root = %root.display(), "project created");
        self.get_project(&id)
    }

    pub fn get_project(&self, id: &str) -> Result<Project> {
        self.find_project(id)?
            .ok_or_else(|| QuarryError::ProjectNotFound(id.to_string()))
    }

    pub fn find_project(&self, id: &str) -> Result<Option<Project>> {
        let out = self.client.select(Select::from("projects").eq("id", id), None)?;
        Ok(out.first().and_then(project_from_row))
    }

    pub fn find_project_by_root(&self, root: &Path) -> Result<Option<Project>> {
        let out = self
            .client
            .select(Select::from("projects").eq("root_path", path_string(root)), None)?;
        Ok(out.first().and_then(project_from_row))
    }

    /// The innermost project whose root contains `path`.
    pub fn find_project_containing(&self, path: &Path) -> Result<Option<Project>> {
        Ok(self
            .list_projects()?
            .into_iter()
            .filter(|p| path.starts_with(&p.root_path))
            .max_by_key(|p| p.root_path.components().count()))
    }

    pub fn list_projects(&self) -> Result<Vec<Project>> {
        let out = self.client.execute(
            &format!("SELECT {PROJECT_COLUMNS} FROM projects ORDER BY root_path"),
            vec![],
            None,
        )?;
        Ok(out.rows().filter_map(project_from_row).collect())
    }

    /// Hard delete; files and everything below them cascade.
    pub fn delete_project(&self, id: &str) -> Result<()> {
        let out = self
            .client
            .execute("DELETE FROM projects WHERE id = ?1", sql_params![id], None)?;
        if out.rows_affected == 0 {
            return Err(QuarryError::ProjectNotFound(id.to_string()));
        }
        tracing::info!(project = %id, "project deleted");
        Ok(())
    }

    /// Re-key a project. Files follow through `ON UPDATE CASCADE`.
    pub fn change_project_id(&self, old_id: &str, new_id: &str) -> Result<()> {
        let new_id = validate_project_id(new_id)?;
        if old_id == new_id {
            return self.get_project(old_id).map(|_| ());
        }
        if self.find_project(&new_id)?.is_some() {
            return Err(QuarryError::InvalidRequest(format!("project id {new_id} already in use")));
        }
        let out = self.client.execute(
            "UPDATE projects SET id = ?1, updated_at = ?2 WHERE id = ?3",
            sql_params![new_id.as_str(), quarry_core::unix_now(), old_id],
            None,
        )?;
        if out.rows_affected == 0 {
            return Err(QuarryError::ProjectNotFound(old_id.to_string()));
        }
        tracing::info!(old = %old_id, new = %new_id, "project id changed");
        Ok(())
    }

    pub fn set_project_root(&self, id: &str, root: &Path) -> Result<()> {
        let out = self.client.execute(
            "UPDATE projects SET root_path = ?1, updated_at = ?2 WHERE id = ?3",
            sql_params![path_string(root), quarry_core::unix_now(), id],
            None,
        )?;
        if out.rows_affected == 0 {
            return Err(QuarryError::ProjectNotFound(id.to_string()));
        }
        Ok(())
    }

    // Files

    pub fn get_file(
        &self,
        project_id: &str,
        path: &str,
        transaction_id: Option<&TransactionId>,
    ) -> Result<Option<FileRecord>> {
        let out = self.client.select(
            Select::from("files").eq("project_id", project_id).eq("path", path),
            transaction_id,
        )?;
        Ok(out.first().and_then(file_from_row))
    }

    pub fn list_files(&self, project_id: &str, include_deleted: bool) -> Result<Vec<FileRecord>> {
        let sql = if include_deleted {
            format!("SELECT {FILE_COLUMNS} FROM files WHERE project_id = ?1 ORDER BY path")
        } else {
            format!("SELECT {FILE_COLUMNS} FROM files WHERE project_id = ?1 AND deleted = 0 ORDER BY path")
        };
        let out = self.client.execute(&sql, sql_params![project_id], None)?;
        Ok(out.rows().filter_map(file_from_row).collect())
    }

    /// Stored mtime and deleted flag of every file in the project, in one query.
    pub fn stored_files(&self, project_id: &str, transaction_id: Option<&TransactionId>) -> Result<StoredFiles> {
        let out = self.client.execute(
            "SELECT path, mtime, deleted FROM files WHERE project_id = ?1",
            sql_params![project_id],
            transaction_id,
        )?;
        Ok(out
            .rows()
            .filter_map(|row| Some((row.string("path")?, (row.f64("mtime")?, row.bool("deleted")))))
            .collect())
    }

    /// Upsert the file row and replace everything it owns, in one batch.
    ///
    /// Returns the statement count sent, for logging.
    pub fn replace_file_entities(
        &self,
        project_id: &str,
        path: &str,
        mtime: f64,
        facts: &ParsedFacts,
        transaction_id: Option<&TransactionId>,
    ) -> Result<usize> {
        let ops = file_replacement_batch(project_id, path, mtime, facts)?;
        let count = ops.len();
        self.client.execute_batch(ops, transaction_id)?;
        Ok(count)
    }

    /// Soft-delete stored files that are no longer in `present`.
    pub fn mark_missing_deleted(
        &self,
        project_id: &str,
        present: &HashSet<String>,
        transaction_id: Option<&TransactionId>,
    ) -> Result<Vec<String>> {
        let stored = self.stored_files(project_id, transaction_id)?;
        let mut missing: Vec<String> = stored
            .into_iter()
            .filter(|(path, (_, deleted))| !deleted && !present.contains(path))
            .map(|(path, _)| path)
            .collect();
        missing.sort();
        if missing.is_empty() {
            return Ok(missing);
        }
        let now = quarry_core::unix_now();
        let ops = missing
            .iter()
            .map(|path| {
                Statement::new(
                    "UPDATE files SET deleted = 1, updated_at = ?3 WHERE project_id = ?1 AND path = ?2",
                    sql_params![project_id, path.as_str(), now],
                )
            })
            .collect();
        self.client.execute_batch(ops, transaction_id)?;
        Ok(missing)
    }

    /// Mark one file deleted, keeping its rows. Returns false if unknown.
    pub fn soft_delete_file(&self, project_id: &str, path: &str) -> Result<bool> {
        let out = self.client.execute(
            "UPDATE files SET deleted = 1, updated_at = ?3 WHERE project_id = ?1 AND path = ?2",
            sql_params![project_id, path, quarry_core::unix_now()],
            None,
        )?;
        Ok(out.rows_affected > 0)
    }

    /// Remove the file row and, by cascade, everything it owns.
    pub fn hard_delete_file(&self, project_id: &str, path: &str) -> Result<bool> {
        let out = self.client.execute(
            "DELETE FROM files WHERE project_id = ?1 AND path = ?2",
            sql_params![project_id, path],
            None,
        )?;
        Ok(out.rows_affected > 0)
    }

    /// Move `path` (relative to the project root) into the version store and
    /// mark its row deleted.
    ///
    /// The copy lands at `{version_root}/{project_id}/{stamp}/{path}`; the row
    /// records the stamp directory as `version_dir`.
    pub fn move_file_to_version_store(
        &self,
        project: &Project,
        path: &str,
        version_root: &Path,
    ) -> Result<PathBuf> {
        let source = project.root_path.join(path);
        if !source.is_file() {
            return Err(QuarryError::FileNotFound(source));
        }
        let version_dir = unique_version_dir(&version_root.join(&project.id))?;
        let target = version_dir.join(path);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        move_file(&source, &target)?;

        self.client.execute(
            "UPDATE files SET deleted = 1, original_path = ?2, version_dir = ?3, updated_at = ?4 \
             WHERE project_id = ?1 AND path = ?2",
            sql_params![project.id.as_str(), path, path_string(&version_dir), quarry_core::unix_now()],
            None,
        )?;
        tracing::info!(project = %project.id, path, target = %target.display(), "file moved to version store");
        Ok(target)
    }

    /// Deleted files with a version store copy and a row id above `after_id`,
    /// in row id order.
    pub fn versioned_deleted_files(&self, after_id: i64, limit: usize) -> Result<Vec<VersionedFile>> {
        let out = self.client.execute(
            "SELECT f.id, f.project_id, f.path, f.lines, f.mtime, f.deleted, f.original_path, \
                    f.version_dir, f.needs_chunking, p.root_path \
             FROM files f JOIN projects p ON p.id = f.project_id \
             WHERE f.deleted = 1 AND f.version_dir IS NOT NULL AND f.id > ?1 \
             ORDER BY f.id LIMIT ?2",
            sql_params![after_id, limit],
            None,
        )?;
        Ok(out
            .rows()
            .filter_map(|row| {
                Some(VersionedFile {
                    file: file_from_row(row)?,
                    root_path: PathBuf::from(row.str("root_path")?),
                })
            })
            .collect())
    }

    /// Undo a soft delete after the file was copied back. The mtime reset
    /// makes the next indexing pass reparse it.
    pub fn mark_restored(&self, file_id: i64) -> Result<()> {
        self.client.execute(
            "UPDATE files SET deleted = 0, version_dir = NULL, original_path = NULL, mtime = 0, \
             updated_at = ?2 WHERE id = ?1",
            sql_params![file_id, quarry_core::unix_now()],
            None,
        )?;
        Ok(())
    }

    /// Forget a version store copy that no longer exists. The row stays
    /// soft-deleted.
    pub fn clear_version_dir(&self, file_id: i64) -> Result<()> {
        self.client.execute(
            "UPDATE files SET version_dir = NULL, updated_at = ?2 WHERE id = ?1",
            sql_params![file_id, quarry_core::unix_now()],
            None,
        )?;
        Ok(())
    }

    // Chunks and vectors

    /// Projects with chunks awaiting an embedding, largest backlog first.
    /// Chunks that failed `max_attempts` times do not count.
    pub fn pending_chunk_counts(&self, max_attempts: u32) -> Result<Vec<(String, i64)>> {
        let out = self.client.execute(
            "SELECT f.project_id AS project_id, COUNT(*) AS pending \
             FROM chunks c JOIN files f ON f.id = c.file_id \
             WHERE c.embedding_vector IS NULL AND f.deleted = 0 AND c.embedding_attempts < ?1 \
             GROUP BY f.project_id ORDER BY pending DESC, f.project_id",
            sql_params![max_attempts],
            None,
        )?;
        Ok(out
            .rows()
            .filter_map(|row| Some((row.string("project_id")?, row.i64("pending")?)))
            .collect())
    }

    /// Chunks without an embedding, fewest failed attempts first.
    pub fn pending_chunks(&self, project_id: &str, limit: usize, max_attempts: u32) -> Result<Vec<PendingChunk>> {
        let out = self.client.execute(
            "SELECT c.id, c.file_id, c.text FROM chunks c JOIN files f ON f.id = c.file_id \
             WHERE f.project_id = ?1 AND f.deleted = 0 AND c.embedding_vector IS NULL \
               AND c.embedding_attempts < ?3 \
             ORDER BY c.embedding_attempts, c.id LIMIT ?2",
            sql_params![project_id, limit, max_attempts],
            None,
        )?;
        Ok(out
            .rows()
            .filter_map(|row| {
                Some(PendingChunk {
                    id: row.i64("id")?,
                    file_id: row.i64("file_id")?,
                    text: row.string("text")?,
                })
            })
            .collect())
    }

    pub fn record_embedding_failures(&self, chunk_ids: &[i64]) -> Result<()> {
        if chunk_ids.is_empty() {
            return Ok(());
        }
        let ops = chunk_ids
            .iter()
            .map(|chunk_id| {
                Statement::new(
                    "UPDATE chunks SET embedding_attempts = embedding_attempts + 1 WHERE id = ?1",
                    sql_params![*chunk_id],
                )
            })
            .collect();
        self.client.execute_batch(ops, None)?;
        Ok(())
    }

    /// Store embeddings; their `vector_id` stays NULL until the next rebuild.
    pub fn set_chunk_embeddings(&self, embeddings: &[(i64, Vec<f32>)], model: &str) -> Result<()> {
        let ops = embeddings
            .iter()
            .map(|(chunk_id, vector)| {
                Statement::new(
                    "UPDATE chunks SET embedding_vector = ?1, embedding_model = ?2, vector_id = NULL WHERE id = ?3",
                    sql_params![encode_vector(vector), model, *chunk_id],
                )
            })
            .collect();
        self.client.execute_batch(ops, None)?;
        Ok(())
    }

    /// Renumber the project's embedded chunks `0..N-1` in chunk-id order and
    /// return `(vector_id, vector)` pairs for the index rebuild. Embeddings
    /// that are malformed or not `dimension` long are cleared so the chunk is
    /// embedded again, and take no id.
    pub fn rebuild_vector_ids(&self, project_id: &str, dimension: usize) -> Result<Vec<(i64, Vec<f32>)>> {
        let tx = self.client.transaction()?;
        let out = self.client.execute(
            "SELECT c.id, c.embedding_vector FROM chunks c JOIN files f ON f.id = c.file_id \
             WHERE f.project_id = ?1 AND f.deleted = 0 AND c.embedding_vector IS NOT NULL \
             ORDER BY c.id",
            sql_params![project_id],
            Some(tx.id()),
        )?;

        let mut ops = vec![Statement::new(
            "UPDATE chunks SET vector_id = NULL \
             WHERE file_id IN (SELECT id FROM files WHERE project_id = ?1)",
            sql_params![project_id],
        )];
        let mut vectors = Vec::new();
        for row in out.rows() {
            let (Some(chunk_id), Some(bytes)) = (row.i64("id"), row.blob("embedding_vector")) else {
                continue;
            };
            let Some(vector) = decode_vector(bytes).filter(|v| v.len() == dimension) else {
                tracing::warn!(chunk = chunk_id, dimension, "clearing embedding of the wrong shape");
                ops.push(Statement::new(
                    "UPDATE chunks SET embedding_vector = NULL, embedding_model = NULL, embedding_attempts = 0 \
                     WHERE id = ?1",
                    sql_params![chunk_id],
                ));
                continue;
            };
            let vector_id = vectors.len() as i64;
            ops.push(Statement::new(
                "UPDATE chunks SET vector_id = ?1 WHERE id = ?2",
                sql_params![vector_id, chunk_id],
            ));
            vectors.push((vector_id, vector));
        }
        self.client.execute_batch(ops, Some(tx.id()))?;
        tx.commit()?;
        Ok(vectors)
    }

    pub fn chunk_text_for_vector(&self, project_id: &str, vector_id: i64) -> Result<Option<(String, String, i64)>> {
        let out = self.client.execute(
            "SELECT f.path, c.text, c.line FROM chunks c JOIN files f ON f.id = c.file_id \
             WHERE f.project_id = ?1 AND c.vector_id = ?2",
            sql_params![project_id, vector_id],
            None,
        )?;
        Ok(out
            .first()
            .and_then(|row| Some((row.string("path")?, row.string("text")?, row.i64("line")?))))
    }

    // Queries

    /// Classes, functions and methods whose name matches the SQL LIKE `pattern`.
    pub fn find_entities(&self, pattern: &str, project_id: Option<&str>, limit: usize) -> Result<Vec<EntityHit>> {
        let sql = "SELECT kind, name, project_id, path, line FROM ( \
                 SELECT 'class' AS kind, c.name, f.project_id, f.path, c.line FROM classes c JOIN files f ON f.id = c.file_id WHERE f.deleted = 0 \
                 UNION ALL \
                 SELECT 'function', fn.name, f.project_id, f.path, fn.line FROM functions fn JOIN files f ON f.id = fn.file_id WHERE f.deleted = 0 \
                 UNION ALL \
                 SELECT 'method', m.name, f.project_id, f.path, m.line FROM methods m JOIN files f ON f.id = m.file_id WHERE f.deleted = 0 \
             ) WHERE name LIKE ?1 AND (?2 IS NULL OR project_id = ?2) \
             ORDER BY name, path, line LIMIT ?3";
        let out = self
            .client
            .execute(sql, sql_params![pattern, project_id, limit], None)?;
        Ok(out
            .rows()
            .filter_map(|row| {
                Some(EntityHit {
                    kind: row.string("kind")?,
                    name: row.string("name")?,
                    project_id: row.string("project_id")?,
                    path: row.string("path")?,
                    line: row.i64("line")?,
                })
            })
            .collect())
    }

    /// Row counts of the live (not deleted) files of one project, or of every project.
    pub fn entity_counts(&self, project_id: Option<&str>) -> Result<EntityCounts> {
        let count = |table: &str| -> String {
            format!(
                "(SELECT COUNT(*) FROM {table} t JOIN files f ON f.id = t.file_id \
                 WHERE f.deleted = 0 AND (?1 IS NULL OR f.project_id = ?1))"
            )
        };
        let sql = format!(
            "SELECT (SELECT COUNT(*) FROM files f WHERE f.deleted = 0 AND (?1 IS NULL OR f.project_id = ?1)) AS files, \
             {} AS classes, {} AS methods, {} AS functions, {} AS imports, {} AS usages, {} AS chunks",
            count("classes"),
            count("methods"),
            count("functions"),
            count("imports"),
            count("usages"),
            count("chunks"),
        );
        let out = self.client.execute(&sql, sql_params![project_id], None)?;
        let row = out
            .first()
            .ok_or_else(|| QuarryError::InvalidRequest("count query returned no rows".into()))?;
        Ok(EntityCounts {
            files: row.i64("files").unwrap_or(0),
            classes: row.i64("classes").unwrap_or(0),
            methods: row.i64("methods").unwrap_or(0),
            functions: row.i64("functions").unwrap_or(0),
            imports: row.i64("imports").unwrap_or(0),
            usages: row.i64("usages").unwrap_or(0),
            chunks: row.i64("chunks").unwrap_or(0),
        })
    }
}

/// Statements that upsert one file and replace its entities.
///
/// Every statement binds `?1` project id and `?2` path so the file id and
/// class ids resolve by subquery, keeping the whole file one round trip.
pub(crate) fn file_replacement_batch(
    project_id: &str,
    path: &str,
    mtime: f64,
    facts: &ParsedFacts,
) -> Result<Vec<Statement>> {
    let key = || sql_params![project_id, path];
    let with_key = |rest: Vec<SqlValue>| {
        let mut params = key();
        params.extend(rest);
        params
    };
    let mut ops = Vec::new();

    ops.push(Statement::new(
        "INSERT INTO files (project_id, path, lines, mtime, deleted, needs_chunking, updated_at) \
         VALUES (?1, ?2, ?3, ?4, 0, 0, ?5) \
         ON CONFLICT(project_id, path) DO UPDATE SET \
           lines = excluded.lines, mtime = excluded.mtime, deleted = 0, \
           original_path = NULL, version_dir = NULL, needs_chunking = 0, \
           updated_at = excluded.updated_at",
        with_key(sql_params![facts.lines, mtime, quarry_core::unix_now()]),
    ));

    for table in FILE_ENTITY_TABLES {
        ops.push(Statement::new(
            format!("DELETE FROM {table} WHERE file_id = {FILE_ID}"),
            key(),
        ));
    }

    for class in &facts.classes {
        ops.push(Statement::new(
            format!(
                "INSERT INTO classes (file_id, name, line, end_line, docstring, bases) \
                 VALUES ({FILE_ID}, ?3, ?4, ?5, ?6, ?7)"
            ),
            with_key(sql_params![
                class.name.as_str(),
                class.line,
                class.end_line,
                class.docstring.as_deref(),
                serde_json::to_string(&class.bases)?,
            ]),
        ));
        for method in &class.methods {
            ops.push(Statement::new(
                format!(
                    "INSERT INTO methods (file_id, class_id, name, line, end_line, docstring, args, complexity, is_async) \
                     VALUES ({FILE_ID}, \
                       (SELECT id FROM classes WHERE file_id = {FILE_ID} AND name = ?3 AND line = ?4), \
                       ?5, ?6, ?7, ?8, ?9, ?10, ?11)"
                ),
                with_key(sql_params![
                    class.name.as_str(),
                    class.line,
                    method.name.as_str(),
                    method.line,
                    method.end_line,
                    method.docstring.as_deref(),
                    serde_json::to_string(&method.args)?,
                    method.complexity,
                    method.is_async,
                ]),
            ));
        }
    }

    for function in &facts.functions {
        ops.push(Statement::new(
            format!(
                "INSERT INTO functions (file_id, name, line, end_line, docstring, args, complexity, is_async) \
                 VALUES ({FILE_ID}, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"
            ),
            with_key(sql_params![
                function.name.as_str(),
                function.line,
                function.end_line,
                function.docstring.as_deref(),
                serde_json::to_string(&function.args)?,
                function.complexity,
                function.is_async,
            ]),
        ));
    }

    for import in &facts.imports {
        ops.push(Statement::new(
            format!("INSERT INTO imports (file_id, name, module, import_type, line) VALUES ({FILE_ID}, ?3, ?4, ?5, ?6)"),
            with_key(sql_params![
                import.name.as_str(),
                import.module.as_deref(),
                import.import_type.as_str(),
                import.line,
            ]),
        ));
    }

    for usage in &facts.usages {
        ops.push(Statement::new(
            format!("INSERT INTO usages (file_id, name, usage_type, line) VALUES ({FILE_ID}, ?3, ?4, ?5)"),
            with_key(sql_params![usage.name.as_str(), usage.usage_type.as_str(), usage.line]),
        ));
    }

    for chunk in &facts.chunks {
        ops.push(Statement::new(
            format!("INSERT INTO chunks (file_id, chunk_type, text, line) VALUES ({FILE_ID}, ?3, ?4, ?5)"),
            with_key(sql_params![chunk.chunk_type.as_str(), chunk.text.as_str(), chunk.line]),
        ));
    }

    Ok(ops)
}

fn validate_project_id(id: &str) -> Result<String> {
    uuid::Uuid::parse_str(id)
        .map(|u| u.to_string())
        .map_err(|e| QuarryError::InvalidRequest(format!("project id {id:?}: {e}")))
}

fn path_string(path: &Path) -> String {
    path.to_string_lossy().to_string()
}

fn project_from_row(row: Row<'_>) -> Option<Project> {
    Some(Project {
        id: row.string("id")?,
        root_path: PathBuf::from(row.str("root_path")?),
        watch_dir_id: row.string("watch_dir_id"),
        comment: row.string("comment"),
        created_at: row.f64("created_at").unwrap_or(0.0),
        updated_at: row.f64("updated_at").unwrap_or(0.0),
    })
}

fn file_from_row(row: Row<'_>) -> Option<FileRecord> {
    Some(FileRecord {
        id: row.i64("id")?,
        project_id: row.string("project_id")?,
        path: row.string("path")?,
        lines: row.i64("lines").unwrap_or(0),
        mtime: row.f64("mtime").unwrap_or(0.0),
        deleted: row.bool("deleted"),
        original_path: row.string("original_path"),
        version_dir: row.string("version_dir"),
        needs_chunking: row.bool("needs_chunking"),
    })
}

fn unique_version_dir(project_root: &Path) -> Result<PathBuf> {
    let stamp = quarry_core::safety::backup_stamp();
    let mut candidate = project_root.join(&stamp);
    let mut n = 1;
    while candidate.exists() {
        candidate = project_root.join(format!("{stamp}.{n}"));
        n += 1;
    }
    std::fs::create_dir_all(&candidate)?;
    Ok(candidate)
}

/// Rename, falling back to copy and remove across filesystems.
fn move_file(source: &Path, target: &Path) -> Result<()> {
    if std::fs::rename(source, target).is_ok() {
        return Ok(());
    }
    std::fs::copy(source, target)?;
    std::fs::remove_file(source)?;
    Ok(())
}
