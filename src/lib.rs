//! Mirror Core Library
//!
//! Download orchestration for mirroring a catalog's files to disk through an
//! external aria2 download engine controlled over JSON-RPC.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//! - [`db`] - Database connection and schema management
//! - [`registry`] - Persisted file records, statuses and catalog metadata
//! - [`engine`] - Engine process supervision and the JSON-RPC client
//! - [`download`] - Rate limiting, download tasks and the scheduler loop

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod db;
pub mod download;
pub mod engine;
pub mod registry;

// Re-export commonly used types
pub use db::{Database, DatabaseOptions, DbError};
pub use download::{
    Admission, DownloadTask, RateLimiter, RunStats, Scheduler, SchedulerConfig, SchedulerError,
    StorageLayout,
};
pub use engine::{EngineConfig, EngineError, EngineRpcClient, EngineSupervisor, RpcError};
pub use registry::{FileRecord, FileRegistry, FileStatus, FileUpdate, Registry, RegistryError};
