//! Error types for the engine supervisor and its RPC client.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Errors raised while managing the engine process.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Every candidate port was already taken.
    #[error("no idle RPC port found after {attempts} attempts")]
    NoIdlePort {
        /// How many candidates were probed.
        attempts: usize,
    },

    /// A well-known or out-of-range port was requested.
    #[error("port {0} cannot be used for the engine RPC (expected 1025..=65535)")]
    ReservedPort(u32),

    /// The engine executable could not be started.
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        /// Executable that failed to launch.
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// A log sink could not be created or removed.
    #[error("engine log file {path}: {source}")]
    Log {
        /// The log path involved.
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Waiting on or signalling the child process failed.
    #[error("engine process error: {0}")]
    Process(#[from] std::io::Error),
}

/// Errors raised by a single JSON-RPC call.
///
/// Protocol failures carry the full request and response text so a bad call
/// can be diagnosed from the log alone.
#[derive(Debug, Error)]
pub enum RpcError {
    /// The HTTP exchange itself failed (connection refused, timeout, ...).
    #[error("rpc transport error calling {method}: {source}")]
    Http {
        /// Fully qualified method, e.g. `aria2.addUri`.
        method: String,
        #[source]
        source: reqwest::Error,
    },

    /// The engine answered with a JSON-RPC `error` member.
    #[error("rpc error\nsend = {request}\nrecv = {response}")]
    Remote {
        /// Serialized request envelope.
        request: String,
        /// Raw response body.
        response: String,
    },

    /// The response had no `result` member (or was not JSON at all).
    #[error("rpc response without result\nsend = {request}\nrecv = {response}")]
    MissingResult {
        /// Serialized request envelope.
        request: String,
        /// Raw response body.
        response: String,
    },

    /// The `result` member did not have the expected shape.
    #[error("unexpected result for {method}: {message}")]
    Decode {
        /// Fully qualified method.
        method: String,
        /// What went wrong.
        message: String,
    },

    /// The HTTP client could not be built.
    #[error("failed to build rpc client: {0}")]
    Client(#[source] reqwest::Error),

    /// The engine never answered after being started.
    #[error("engine did not answer within {0:?}")]
    NotReady(Duration),
}
