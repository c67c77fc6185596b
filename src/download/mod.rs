//! Download orchestration on top of the external engine.
//!
//! This module turns registry records into engine transfers and back into
//! registry outcomes.
//!
//! # Features
//!
//! - Sliding-window admission control ([`RateLimiter`])
//! - Staging/final directory layout with sanitized names ([`StorageLayout`])
//! - One task per admitted record with submit/poll/cancel/finalize ([`DownloadTask`])
//! - A bounded, retrying, resumable control loop ([`Scheduler`])
//! - A one-line progress report per tick ([`ProgressLine`])
//!
//! # Example
//!
//! ```
//! use mirror_core::download::{RateLimiter, SchedulerConfig};
//!
//! let limiter = RateLimiter::new(99);
//! let config = SchedulerConfig::default();
//! assert_eq!(config.max_concurrent, 20);
//! assert!(limiter.admit());
//! ```

mod error;
mod layout;
mod progress;
pub mod rate_limiter;
mod scheduler;
mod task;

pub use error::{SchedulerError, TaskError};
pub use layout::{StorageLayout, relative_path, sanitize_component};
pub use progress::{ProgressLine, ProgressSlot};
pub use rate_limiter::{
    DEFAULT_API_CAPACITY, DEFAULT_DOWNLOAD_CAPACITY, DEFAULT_WINDOW, RateLimiter,
};
pub use scheduler::{
    Admission, DEFAULT_MAX_CONCURRENT, DEFAULT_MAX_RECORD_ERRORS, DEFAULT_MAX_TASK_RETRIES,
    RunStats, Scheduler, SchedulerConfig,
};
pub use task::{DownloadTask, LoadOutcome, TaskState};

// Note: no module-local Result aliases here.
// Use `Result<T, SchedulerError>` / `Result<T, TaskError>` explicitly in signatures.
