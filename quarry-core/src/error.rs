//! Error types for quarry operations

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Stable error codes shared by the driver, the client and the CLI.
pub mod codes {
    pub const PROJECT_NOT_FOUND: &str = "project_not_found";
    pub const PROJECT_EXISTS: &str = "project_exists";
    pub const FILE_NOT_FOUND: &str = "file_not_found";
    pub const DATABASE_CORRUPTED: &str = "database_corrupted";
    pub const DRIVER_UNAVAILABLE: &str = "driver_unavailable";
    pub const TRANSACTION_FAILED: &str = "transaction_failed";
    pub const TRANSACTION_NOT_FOUND: &str = "transaction_not_found";
    pub const SYNTAX_ERROR: &str = "syntax_error";
    pub const BACKUP_ERROR: &str = "backup_error";
    pub const REPAIR_ERROR: &str = "repair_error";
    pub const CONFIRMATION_REQUIRED: &str = "confirmation_required";
    pub const QUEUE_FULL: &str = "queue_full";
    pub const JOB_NOT_FOUND: &str = "job_not_found";
    pub const WORKER_ALREADY_RUNNING: &str = "worker_already_running";
    pub const INVALID_REQUEST: &str = "invalid_request";
    pub const EMBEDDING_ERROR: &str = "embedding_error";
    pub const INTERNAL_ERROR: &str = "internal_error";
}

/// Structured error payload shared between driver and client.
///
/// Used as the error body of every driver response and parsed back into a
/// [`QuarryError`] on the client side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub code: String,
    pub message: String,
    pub hint: String,
    /// Backup files made before the failure, for destructive operations.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub backup_paths: Vec<String>,
}

impl ErrorEnvelope {
    pub fn new(
        code: impl Into<String>,
        message: impl Into<String>,
        hint: impl Into<String>,
    ) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            hint: hint.into(),
            backup_paths: Vec::new(),
        }
    }

    pub fn with_backups(mut self, backup_paths: &[PathBuf]) -> Self {
        self.backup_paths = backup_paths
            .iter()
            .map(|p| p.to_string_lossy().to_string())
            .collect();
        self
    }

    pub fn internal(msg: &str) -> Self {
        Self::new(codes::INTERNAL_ERROR, msg, "Check driver logs for details")
    }
}

#[derive(Debug, thiserror::Error)]
pub enum QuarryError {
    #[error("Project not found: {0}")]
    ProjectNotFound(String),

    #[error("Project already registered for root {}", .0.display())]
    ProjectExists(PathBuf),

    #[error("File not found: {}", .0.display())]
    FileNotFound(PathBuf),

    #[error("Database is corrupted (safe mode): {message}")]
    DatabaseCorrupted { message: String },

    #[error("Driver unavailable: {0}")]
    DriverUnavailable(String),

    #[error("Transaction failed and was rolled back: {0}")]
    TransactionFailed(String),

    #[error("Unknown or expired transaction: {0}")]
    TransactionNotFound(String),

    #[error("Syntax error in {} at line {line}: {message}", .path.display())]
    SyntaxError {
        path: PathBuf,
        line: usize,
        message: String,
    },

    #[error("Backup failed: {0}")]
    BackupError(String),

    #[error("Repair failed: {message}")]
    RepairError {
        message: String,
        backup_paths: Vec<PathBuf>,
    },

    #[error("{operation} is destructive; pass force=true to confirm")]
    ConfirmationRequired { operation: String },

    #[error("Driver job queue is full ({0} pending jobs)")]
    QueueFull(usize),

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Worker {worker_type} already running with pid {pid}")]
    WorkerAlreadyRunning { worker_type: String, pid: u32 },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Embedding service error: {0}")]
    Embedding(String),

    #[error("Config parse error: {0}")]
    ConfigParse(String),

    #[error("Driver error [{code}]: {message} ({hint})")]
    Driver {
        code: String,
        message: String,
        hint: String,
    },

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl QuarryError {
    pub fn repair(message: impl Into<String>, backup_paths: Vec<PathBuf>) -> Self {
        Self::RepairError {
            message: message.into(),
            backup_paths,
        }
    }

    pub fn corrupted(message: impl Into<String>) -> Self {
        Self::DatabaseCorrupted {
            message: message.into(),
        }
    }

    pub fn code(&self) -> &str {
        match self {
            Self::ProjectNotFound(_) => codes::PROJECT_NOT_FOUND,
            Self::ProjectExists(_) => codes::PROJECT_EXISTS,
            Self::FileNotFound(_) => codes::FILE_NOT_FOUND,
            Self::DatabaseCorrupted { .. } => codes::DATABASE_CORRUPTED,
            Self::DriverUnavailable(_) => codes::DRIVER_UNAVAILABLE,
            Self::TransactionFailed(_) => codes::TRANSACTION_FAILED,
            Self::TransactionNotFound(_) => codes::TRANSACTION_NOT_FOUND,
            Self::SyntaxError { .. } => codes::SYNTAX_ERROR,
            Self::BackupError(_) => codes::BACKUP_ERROR,
            Self::RepairError { .. } => codes::REPAIR_ERROR,
            Self::ConfirmationRequired { .. } => codes::CONFIRMATION_REQUIRED,
            Self::QueueFull(_) => codes::QUEUE_FULL,
            Self::JobNotFound(_) => codes::JOB_NOT_FOUND,
            Self::WorkerAlreadyRunning { .. } => codes::WORKER_ALREADY_RUNNING,
            Self::InvalidRequest(_) => codes::INVALID_REQUEST,
            Self::Embedding(_) => codes::EMBEDDING_ERROR,
            Self::Driver { code, .. } => code,
            Self::ConfigParse(_) | Self::Database(_) | Self::Io(_) | Self::Serialization(_) => {
                codes::INTERNAL_ERROR
            }
        }
    }

    /// Transient failures worth retrying with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::DriverUnavailable(_) | Self::QueueFull(_))
    }

    /// True when the operation was refused by safe mode rather than failing.
    pub fn is_safe_mode(&self) -> bool {
        matches!(self, Self::DatabaseCorrupted { .. })
    }

    fn hint(&self) -> &'static str {
        match self {
            Self::ProjectNotFound(_) => "Run `quarry project list` to see registered projects",
            Self::ProjectExists(_) => "Use the existing project or delete it first",
            Self::DatabaseCorrupted { .. } => {
                "Run `quarry corruption-status`, then `quarry repair` or `quarry restore`"
            }
            Self::DriverUnavailable(_) => "Is quarry-driver running? Retry with backoff",
            Self::TransactionFailed(_) => "No changes were applied; fix the cause and retry",
            Self::TransactionNotFound(_) => "Begin a new transaction",
            Self::ConfirmationRequired { .. } => "Re-run with --force",
            Self::QueueFull(_) => "Retry later or migrate the call site to batched RPC",
            Self::WorkerAlreadyRunning { .. } => "Stop the running worker first",
            Self::BackupError(_) | Self::RepairError { .. } => {
                "Check file permissions and free space next to the database"
            }
            _ => "Check logs for details",
        }
    }

    /// Convert to the wire envelope.
    pub fn to_envelope(&self) -> ErrorEnvelope {
        if let Self::Driver {
            code,
            message,
            hint,
        } = self
        {
            return ErrorEnvelope::new(code.clone(), message.clone(), hint.clone());
        }
        let envelope = ErrorEnvelope::new(self.code(), self.to_string(), self.hint());
        match self {
            Self::RepairError { backup_paths, .. } => envelope.with_backups(backup_paths),
            _ => envelope,
        }
    }

    /// Rebuild a typed error from a driver envelope.
    pub fn from_envelope(envelope: ErrorEnvelope) -> Self {
        let ErrorEnvelope {
            code,
            message,
            hint,
            backup_paths,
        } = envelope;
        match code.as_str() {
            codes::DATABASE_CORRUPTED => Self::DatabaseCorrupted { message },
            codes::DRIVER_UNAVAILABLE => Self::DriverUnavailable(message),
            codes::TRANSACTION_FAILED => Self::TransactionFailed(message),
            codes::TRANSACTION_NOT_FOUND => Self::TransactionNotFound(message),
            codes::BACKUP_ERROR => Self::BackupError(message),
            codes::REPAIR_ERROR => Self::RepairError {
                message,
                backup_paths: backup_paths.into_iter().map(PathBuf::from).collect(),
            },
            codes::QUEUE_FULL => Self::QueueFull(0),
            codes::JOB_NOT_FOUND => Self::JobNotFound(message),
            codes::INVALID_REQUEST => Self::InvalidRequest(message),
            _ => Self::Driver {
                code,
                message,
                hint,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_roundtrip_keeps_code_and_backups() {
        let err = QuarryError::repair("recreate failed", vec![PathBuf::from("/tmp/a.db.bak")]);
        let envelope = err.to_envelope();
        assert_eq!(envelope.code, codes::REPAIR_ERROR);
        assert_eq!(envelope.backup_paths, vec!["/tmp/a.db.bak".to_string()]);

        match QuarryError::from_envelope(envelope) {
            QuarryError::RepairError { backup_paths, .. } => {
                assert_eq!(backup_paths, vec![PathBuf::from("/tmp/a.db.bak")]);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn safe_mode_is_distinguished_from_transient() {
        let corrupted = QuarryError::corrupted("marker present");
        assert!(corrupted.is_safe_mode());
        assert!(!corrupted.is_retryable());

        let unavailable = QuarryError::DriverUnavailable("refused".into());
        assert!(unavailable.is_retryable());
        assert!(!unavailable.is_safe_mode());
    }

    #[test]
    fn unknown_codes_pass_through() {
        let err = QuarryError::from_envelope(ErrorEnvelope::new("weird", "m", "h"));
        assert_eq!(err.code(), "weird");
    }
}
