//! # Iris Online
//!
//! Online index partitions that move to a new on-disk version without
//! stopping readers or writers.
//!
//! ## Features
//!
//! - Realtime writes into a building segment, sealed and dumped in the background
//! - Reopen classification from version diffs and memory pressure
//! - Step chains that roll back completely on the first failure
//! - Join-segment and branch (redo) reopen paths, plus KV/KKV recipes
//! - Memory admission control before any destructive step
//! - In-memory and file-backed version directories
pub mod config;
pub mod error;
pub mod index;
pub mod memory;
pub mod metrics;
pub mod oplog;
pub mod partition;
pub mod reopen;
pub mod schema;

// Re-exports for the public API
pub use config::OnlineConfig;
pub use error::{IrisError, Result};
pub use index::{
    Directory, Document, FileDirectory, MemoryDirectory, PartitionData, PartitionReader,
    SegmentId, Version, VersionId,
};
pub use memory::MemoryQuotaController;
pub use metrics::{CounterMetrics, NoopMetrics, ReopenMetrics};
pub use oplog::{Cursor, Operation, OperationLog, OperationRecord, OperationReplayer};
pub use partition::{LiveState, OnlinePartition, OnlinePartitionBuilder};
pub use reopen::{OpenStatus, ReopenFailure, ReopenType};
pub use schema::{Schema, TableType};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
