//! Quarry Core - persistent structural index of a source tree
//!
//! Shared data model, wire protocol, schema, corruption-safety primitives
//! and the parser / discovery / vector index collaborators used by the
//! driver, the client and the CLI.

pub mod config;
pub mod discovery;
pub mod document;
pub mod error;
pub mod model;
pub mod parse;
pub mod protocol;
pub mod safety;
pub mod schema;
pub mod vector;

pub use config::Config;
pub use discovery::{discover_projects, walk_project_files, DiscoveredProject, ProjectMarker};
pub use document::{ChunkFact, ClassFact, FunctionFact, ImportFact, ParseError, ParsedFacts, UsageFact};
pub use error::{codes, ErrorEnvelope, QuarryError};
pub use model::{FileErrorRecord, FileRecord, IndexStats, PendingChunk, Project, SyntaxErrorRecord, WatchDir};
pub use parse::{PythonParser, SourceParser};
pub use protocol::{QueryOutput, Row, RpcRequest, RpcResponse, RpcResult, SqlValue, Statement, TransactionId};
pub use safety::{CorruptionMarker, IntegrityReport, IntegrityStatus, RepairLock};
pub use vector::{FlatVectorIndex, SearchHit, VectorIndex};

/// Result type alias for quarry operations
pub type Result<T> = std::result::Result<T, QuarryError>;

/// Current wall clock as float unix seconds, the unit of every stored timestamp.
pub fn unix_now() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Modification time of `path` as float unix seconds.
pub fn file_mtime(path: &std::path::Path) -> Result<f64> {
    let modified = std::fs::metadata(path)?.modified()?;
    Ok(modified
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0))
}
