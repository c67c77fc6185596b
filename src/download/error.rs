//! Error types for download tasks and the scheduler.
//!
//! Record-level rejections (bad URL, blocked path) are not errors: they are
//! reported as outcomes and written to the registry. The types here cover
//! failures the caller has to act on.

use std::path::PathBuf;

use thiserror::Error;

use crate::engine::{EngineError, RpcError};
use crate::registry::RegistryError;

/// Errors raised by a single [`DownloadTask`](super::DownloadTask).
#[derive(Debug, Error)]
pub enum TaskError {
    /// `submit` was called before a record was loaded.
    #[error("task has no loaded record")]
    NotLoaded,

    /// `submit` was called while an engine transfer is still bound.
    #[error("task already bound to engine transfer {gid}")]
    AlreadySubmitted {
        /// The transfer that is still bound.
        gid: String,
    },

    /// The engine call failed.
    #[error(transparent)]
    Rpc(#[from] RpcError),

    /// File system error while preparing or moving the file.
    #[error("IO error at {path}: {source}")]
    Io {
        /// The path involved.
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors that abort a scheduler run.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Registry read or write failed.
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    /// An engine query the control loop depends on failed.
    #[error("engine rpc error: {0}")]
    Rpc(#[from] RpcError),

    /// The engine process died and could not be respawned.
    #[error("engine process error: {0}")]
    Engine(#[from] EngineError),

    /// The storage roots could not be prepared.
    #[error("storage error at {path}: {source}")]
    Storage {
        /// The root involved.
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
