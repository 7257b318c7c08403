//! Corruption detection primitives: integrity probing, the persistent
//! corruption marker, timestamped backups and the repair lock.
//!
//! Everything here works on plain filesystem paths and a borrowed
//! `rusqlite::Connection`; only quarry-driver ever holds that connection.

mod backup;
mod lock;
mod marker;

pub use backup::{
    backup_database_files, backup_stamp, is_backup_of, list_backups, remove_database_files,
    restore_database_files, sidecar_path, BACKUP_INFIX, SIDECAR_SUFFIXES,
};
pub use lock::RepairLock;
pub use marker::{marker_path, now_rfc3339, write_atomic, CorruptionMarker};

use rusqlite::{Connection, ErrorCode};
use serde::{Deserialize, Serialize};

/// Outcome class of an integrity probe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntegrityStatus {
    Ok,
    Corrupt,
    /// The file was busy or locked; says nothing about corruption.
    Busy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntegrityReport {
    pub status: IntegrityStatus,
    /// Which pragma produced the verdict
    pub check: String,
    pub detail: String,
}

impl IntegrityReport {
    pub fn is_ok(&self) -> bool {
        self.status == IntegrityStatus::Ok
    }

    pub fn is_corrupt(&self) -> bool {
        self.status == IntegrityStatus::Corrupt
    }

    fn new(status: IntegrityStatus, check: &str, detail: impl Into<String>) -> Self {
        Self {
            status,
            check: check.to_string(),
            detail: detail.into(),
        }
    }
}

/// Busy/locked errors are never treated as corruption.
pub fn is_transient(err: &rusqlite::Error) -> bool {
    matches!(
        err.sqlite_error_code(),
        Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
    )
}

/// True for errors that mean the physical file is damaged.
pub fn is_corruption(err: &rusqlite::Error) -> bool {
    if is_transient(err) {
        return false;
    }
    if matches!(
        err.sqlite_error_code(),
        Some(ErrorCode::DatabaseCorrupt | ErrorCode::NotADatabase)
    ) {
        return true;
    }
    is_corruption_message(&err.to_string())
}

pub fn is_corruption_message(message: &str) -> bool {
    let lowered = message.to_lowercase();
    lowered.contains("malformed")
        || lowered.contains("file is not a database")
        || lowered.contains("database corruption")
}

/// Run `PRAGMA quick_check`, falling back to the full `integrity_check` when
/// the quick check fails or reports problems.
pub fn probe_integrity(conn: &Connection) -> IntegrityReport {
    match run_check(conn, "quick_check") {
        Ok(report) if report.status != IntegrityStatus::Corrupt => return report,
        Ok(report) => {
            tracing::warn!(detail = %report.detail, "quick_check failed, running full integrity_check");
        }
        Err(err) => {
            tracing::warn!(error = %err, "quick_check errored, running full integrity_check");
        }
    }

    match run_check(conn, "integrity_check") {
        Ok(report) => report,
        Err(err) if is_transient(&err) => {
            IntegrityReport::new(IntegrityStatus::Busy, "integrity_check", err.to_string())
        }
        Err(err) => {
            IntegrityReport::new(IntegrityStatus::Corrupt, "integrity_check", err.to_string())
        }
    }
}

fn run_check(conn: &Connection, pragma: &str) -> rusqlite::Result<IntegrityReport> {
    let mut stmt = match conn.prepare(&format!("PRAGMA {pragma}")) {
        Ok(stmt) => stmt,
        Err(err) if is_transient(&err) => {
            return Ok(IntegrityReport::new(
                IntegrityStatus::Busy,
                pragma,
                err.to_string(),
            ))
        }
        Err(err) => return Err(err),
    };

    let lines: rusqlite::Result<Vec<String>> = stmt
        .query_map([], |row| row.get::<_, String>(0))
        .and_then(|rows| rows.collect());

    let lines = match lines {
        Ok(lines) => lines,
        Err(err) if is_transient(&err) => {
            return Ok(IntegrityReport::new(
                IntegrityStatus::Busy,
                pragma,
                err.to_string(),
            ))
        }
        Err(err) => return Err(err),
    };

    if lines.len() == 1 && lines[0].trim().eq_ignore_ascii_case("ok") {
        Ok(IntegrityReport::new(IntegrityStatus::Ok, pragma, "ok"))
    } else {
        Ok(IntegrityReport::new(
            IntegrityStatus::Corrupt,
            pragma,
            lines.join("; "),
        ))
    }
}
