//! SQLite schema and connection setup

use crate::Result;
use rusqlite::Connection;
use std::path::Path;
use std::time::Duration;

pub const SCHEMA_VERSION: i32 = 2;

/// Entity tables owned by a file, in delete order for a reparse.
pub const FILE_ENTITY_TABLES: [&str; 6] = ["methods", "classes", "functions", "imports", "usages", "chunks"];

const NOW: &str = "((julianday('now') - 2440587.5) * 86400.0)";

/// Open the database file with WAL, foreign keys and a busy timeout.
pub fn open_database(path: &Path, busy_timeout: Duration) -> Result<Connection> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let conn = Connection::open(path)?;
    configure(&conn, busy_timeout)?;
    Ok(conn)
}

pub fn configure(conn: &Connection, busy_timeout: Duration) -> Result<()> {
    conn.busy_timeout(busy_timeout)?;
    conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    Ok(())
}

/// Create the schema if missing. Idempotent.
pub fn init_schema(conn: &Connection) -> Result<()> {
    let sql = format!(
        r#"
        CREATE TABLE IF NOT EXISTS meta (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS watch_dirs (
            id TEXT PRIMARY KEY,
            path TEXT NOT NULL UNIQUE,
            created_at REAL NOT NULL DEFAULT {NOW}
        );

        CREATE TABLE IF NOT EXISTS projects (
            id TEXT PRIMARY KEY,
            root_path TEXT NOT NULL UNIQUE,
            watch_dir_id TEXT REFERENCES watch_dirs(id) ON DELETE SET NULL,
            comment TEXT,
            created_at REAL NOT NULL DEFAULT {NOW},
            updated_at REAL NOT NULL DEFAULT {NOW}
        );

        CREATE TABLE IF NOT EXISTS files (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            project_id TEXT NOT NULL REFERENCES projects(id) ON DELETE CASCADE ON UPDATE CASCADE,
            path TEXT NOT NULL,
            lines INTEGER NOT NULL DEFAULT 0,
            mtime REAL NOT NULL DEFAULT 0,
            deleted INTEGER NOT NULL DEFAULT 0,
            original_path TEXT,
            version_dir TEXT,
            needs_chunking INTEGER NOT NULL DEFAULT 0,
            created_at REAL NOT NULL DEFAULT {NOW},
            updated_at REAL NOT NULL DEFAULT {NOW},
            UNIQUE(project_id, path)
        );

        CREATE TABLE IF NOT EXISTS classes (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            file_id INTEGER NOT NULL REFERENCES files(id) ON DELETE CASCADE,
            name TEXT NOT NULL,
            line INTEGER NOT NULL,
            end_line INTEGER NOT NULL,
            docstring TEXT,
            bases TEXT NOT NULL DEFAULT '[]',
            created_at REAL NOT NULL DEFAULT {NOW}
        );

        CREATE TABLE IF NOT EXISTS methods (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            file_id INTEGER NOT NULL REFERENCES files(id) ON DELETE CASCADE,
            class_id INTEGER NOT NULL REFERENCES classes(id) ON DELETE CASCADE,
            name TEXT NOT NULL,
            line INTEGER NOT NULL,
            end_line INTEGER NOT NULL,
            docstring TEXT,
            args TEXT NOT NULL DEFAULT '[]',
            complexity INTEGER NOT NULL DEFAULT 1,
            is_async INTEGER NOT NULL DEFAULT 0,
            created_at REAL NOT NULL DEFAULT {NOW}
        );

        CREATE TABLE IF NOT EXISTS functions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            file_id INTEGER NOT NULL REFERENCES files(id) ON DELETE CASCADE,
            name TEXT NOT NULL,
            line INTEGER NOT NULL,
            end_line INTEGER NOT NULL,
            docstring TEXT,
            args TEXT NOT NULL DEFAULT '[]',
            complexity INTEGER NOT NULL DEFAULT 1,
            is_async INTEGER NOT NULL DEFAULT 0,
            created_at REAL NOT NULL DEFAULT {NOW}
        );

        CREATE TABLE IF NOT EXISTS imports (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            file_id INTEGER NOT NULL REFERENCES files(id) ON DELETE CASCADE,
            name TEXT NOT NULL,
            module TEXT,
            import_type TEXT NOT NULL,
            line INTEGER NOT NULL,
            created_at REAL NOT NULL DEFAULT {NOW}
        );

        CREATE TABLE IF NOT EXISTS usages (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            file_id INTEGER NOT NULL REFERENCES files(id) ON DELETE CASCADE,
            name TEXT NOT NULL,
            usage_type TEXT NOT NULL,
            line INTEGER NOT NULL,
            created_at REAL NOT NULL DEFAULT {NOW}
        );

        CREATE TABLE IF NOT EXISTS chunks (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            file_id INTEGER NOT NULL REFERENCES files(id) ON DELETE CASCADE,
            chunk_type TEXT NOT NULL,
            text TEXT NOT NULL,
            line INTEGER NOT NULL,
            embedding_vector BLOB,
            embedding_model TEXT,
            embedding_attempts INTEGER NOT NULL DEFAULT 0,
            vector_id INTEGER,
            created_at REAL NOT NULL DEFAULT {NOW}
        );

        CREATE INDEX IF NOT EXISTS idx_files_project ON files(project_id, deleted);
        CREATE INDEX IF NOT EXISTS idx_classes_file ON classes(file_id);
        CREATE INDEX IF NOT EXISTS idx_classes_name ON classes(name);
        CREATE INDEX IF NOT EXISTS idx_methods_file ON methods(file_id);
        CREATE INDEX IF NOT EXISTS idx_methods_class ON methods(class_id);
        CREATE INDEX IF NOT EXISTS idx_methods_name ON methods(name);
        CREATE INDEX IF NOT EXISTS idx_functions_file ON functions(file_id);
        CREATE INDEX IF NOT EXISTS idx_functions_name ON functions(name);
        CREATE INDEX IF NOT EXISTS idx_imports_file ON imports(file_id);
        CREATE INDEX IF NOT EXISTS idx_usages_file ON usages(file_id);
        CREATE INDEX IF NOT EXISTS idx_usages_name ON usages(name);
        CREATE INDEX IF NOT EXISTS idx_chunks_file ON chunks(file_id);
        CREATE INDEX IF NOT EXISTS idx_chunks_pending ON chunks(vector_id) WHERE vector_id IS NULL;
        "#
    );
    conn.execute_batch(&sql)?;
    migrate(conn)?;
    conn.execute(
        "INSERT OR REPLACE INTO meta (key, value) VALUES ('schema_version', ?1)",
        [SCHEMA_VERSION.to_string()],
    )?;
    Ok(())
}

/// Bring a database created by an older schema version up to date.
fn migrate(conn: &Connection) -> Result<()> {
    if schema_version(conn)?.is_some_and(|v| v < 2) && !has_column(conn, "chunks", "embedding_attempts")? {
        conn.execute_batch("ALTER TABLE chunks ADD COLUMN embedding_attempts INTEGER NOT NULL DEFAULT 0")?;
        tracing::info!("schema migrated to version 2");
    }
    Ok(())
}

fn has_column(conn: &Connection, table: &str, column: &str) -> Result<bool> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let names = stmt.query_map([], |row| row.get::<_, String>(1))?;
    for name in names {
        if name? == column {
            return Ok(true);
        }
    }
    Ok(false)
}

pub fn schema_version(conn: &Connection) -> Result<Option<i32>> {
    let version: Option<String> = conn
        .query_row("SELECT value FROM meta WHERE key = 'schema_version'", [], |row| row.get(0))
        .ok();
    Ok(version.and_then(|v| v.parse().ok()))
}
