//! Quarry Client - everything that talks to the driver
//!
//! The RPC client with its transaction guard and safe-mode gate, the typed
//! index store, the incremental indexer, and the worker processes (watcher,
//! vectorizer, repair) with their registry.

pub mod context;
pub mod driver_client;
pub mod gate;
pub mod indexer;
pub mod repair_worker;
pub mod shutdown;
pub mod store;
pub mod vectorize;
pub mod watcher;
pub mod workers;

pub use context::Context;
pub use driver_client::{DriverClient, JobClient, RetryPolicy, Select, Transaction};
pub use gate::{CommandKind, CorruptionMonitor, CorruptionStatus, RepairOutcome, SafeModeGate};
pub use indexer::Indexer;
pub use repair_worker::{RepairReport, RepairWorker};
pub use shutdown::ShutdownFlag;
pub use store::{EntityCounts, EntityHit, IndexStore};
pub use vectorize::{EmbeddingProvider, HttpEmbeddingProvider, SearchResult, VectorizeReport, Vectorizer};
pub use watcher::{FileWatcher, WatchReport};
pub use workers::{WorkerCommand, WorkerEntry, WorkerRegistry, WorkerStatus, WorkerType};
