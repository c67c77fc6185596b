//! One in-flight download bound to one registry record.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use url::Url;

use super::TaskError;
use super::layout::{StorageLayout, relative_path};
use crate::engine::{AddUriOptions, EngineRpcClient, TaskStatus, TransferState};
use crate::registry::FileRecord;

/// Result of [`DownloadTask::load_record`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    /// Ready to submit.
    Ready,
    /// Source URL is not an http(s) URL.
    InvalidUrl,
    /// A directory occupies the final or staging path, or a stale file could not be removed.
    PathProblem,
}

/// Lifecycle of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Unbound,
    Loaded,
    Rejected(LoadOutcome),
    Submitted,
    Polling,
    Completed,
    Failed,
}

/// A download of one record through the engine.
///
/// The file is downloaded into the staging tree and moved to the final tree by
/// [`finalize`](Self::finalize) once the engine reports it complete.
#[derive(Debug)]
pub struct DownloadTask {
    rpc: EngineRpcClient,
    layout: StorageLayout,
    options: AddUriOptions,
    record_id: Option<i64>,
    url: String,
    relative_path: PathBuf,
    gid: Option<String>,
    error_count: u32,
    state: TaskState,
    created_at: Instant,
    last_updated: Instant,
}

impl DownloadTask {
    /// Creates an unbound task.
    #[must_use]
    pub fn new(rpc: EngineRpcClient, layout: StorageLayout, options: AddUriOptions) -> Self {
        let now = Instant::now();
        Self {
            rpc,
            layout,
            options,
            record_id: None,
            url: String::new(),
            relative_path: PathBuf::new(),
            gid: None,
            error_count: 0,
            state: TaskState::Unbound,
            created_at: now,
            last_updated: now,
        }
    }

    #[must_use]
    pub fn record_id(&self) -> Option<i64> {
        self.record_id
    }

    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    #[must_use]
    pub fn relative_path(&self) -> &Path {
        &self.relative_path
    }

    /// Engine transfer handle, if submitted.
    #[must_use]
    pub fn gid(&self) -> Option<&str> {
        self.gid.as_deref()
    }

    #[must_use]
    pub fn error_count(&self) -> u32 {
        self.error_count
    }

    #[must_use]
    pub fn state(&self) -> TaskState {
        self.state
    }

    #[must_use]
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    #[must_use]
    pub fn last_updated(&self) -> Instant {
        self.last_updated
    }

    /// Absolute staging location.
    #[must_use]
    pub fn staging_path(&self) -> PathBuf {
        self.layout.staging_path(&self.relative_path)
    }

    /// Absolute final location.
    #[must_use]
    pub fn final_path(&self) -> PathBuf {
        self.layout.final_path(&self.relative_path)
    }

    /// Counts one transfer failure and returns the new total.
    pub fn record_failure(&mut self) -> u32 {
        self.error_count += 1;
        self.last_updated = Instant::now();
        self.error_count
    }

    /// Marks the task abandoned.
    pub fn mark_failed(&mut self) {
        self.state = TaskState::Failed;
        self.last_updated = Instant::now();
    }

    fn touch(&mut self, state: TaskState) {
        self.state = state;
        self.last_updated = Instant::now();
    }

    /// Binds the task to `record` and prepares the target paths.
    ///
    /// An existing engine binding is cancelled first. Stale files at the final
    /// and staging locations are deleted; a directory at either location is a
    /// [`LoadOutcome::PathProblem`].
    pub async fn load_record(&mut self, record: &FileRecord) -> LoadOutcome {
        if self.gid.is_some() {
            self.cancel().await;
        }

        self.record_id = Some(record.id);
        self.url.clone_from(&record.url);
        self.error_count = 0;

        if !is_http_url(&self.url) {
            error!(id = record.id, url = %self.url, "invalid source URL");
            self.touch(TaskState::Rejected(LoadOutcome::InvalidUrl));
            return LoadOutcome::InvalidUrl;
        }

        self.relative_path = relative_path(record);

        for (label, path) in [("final", self.final_path()), ("staging", self.staging_path())] {
            if path.is_dir() {
                error!(
                    id = record.id,
                    path = %path.display(),
                    "{label} path is occupied by a directory"
                );
                self.touch(TaskState::Rejected(LoadOutcome::PathProblem));
                return LoadOutcome::PathProblem;
            }
            if path.is_file() {
                debug!(path = %path.display(), "removing stale {label} file");
                if let Err(e) = fs::remove_file(&path) {
                    error!(id = record.id, path = %path.display(), error = %e, "cannot remove stale {label} file");
                    self.touch(TaskState::Rejected(LoadOutcome::PathProblem));
                    return LoadOutcome::PathProblem;
                }
            }
        }

        self.touch(TaskState::Loaded);
        LoadOutcome::Ready
    }

    /// Hands the loaded record to the engine.
    ///
    /// # Errors
    ///
    /// Returns [`TaskError::AlreadySubmitted`] while a transfer is bound,
    /// [`TaskError::NotLoaded`] without a loaded record, [`TaskError::Io`] if
    /// the staging directory cannot be created and [`TaskError::Rpc`] if the
    /// engine refuses the submission.
    pub async fn submit(&mut self) -> Result<String, TaskError> {
        if let Some(gid) = &self.gid {
            warn!(task = %self, "task already bound to a transfer");
            return Err(TaskError::AlreadySubmitted { gid: gid.clone() });
        }
        if self.record_id.is_none() || matches!(self.state, TaskState::Unbound | TaskState::Rejected(_)) {
            return Err(TaskError::NotLoaded);
        }

        let staging = self.staging_path();
        let (Some(dir), Some(file_name)) = (staging.parent(), staging.file_name()) else {
            return Err(TaskError::NotLoaded);
        };
        fs::create_dir_all(dir).map_err(|source| TaskError::Io {
            path: dir.to_path_buf(),
            source,
        })?;

        let gid = self
            .rpc
            .add_uri(&self.url, dir, &file_name.to_string_lossy(), &self.options)
            .await?;
        debug!(%gid, path = %staging.display(), "submitted");

        self.gid = Some(gid.clone());
        self.touch(TaskState::Submitted);
        Ok(gid)
    }

    /// Queries the engine; `None` when no transfer is bound.
    ///
    /// # Errors
    ///
    /// Returns [`TaskError::Rpc`] if the status query fails.
    pub async fn poll(&mut self) -> Result<Option<TaskStatus>, TaskError> {
        let Some(gid) = self.gid.clone() else {
            return Ok(None);
        };
        let status = self.rpc.tell_status(&gid).await?;
        self.touch(TaskState::Polling);
        Ok(Some(status))
    }

    /// Removes the engine transfer and clears the binding.
    ///
    /// The binding is cleared even when the engine refuses the removal.
    /// Returns `false` (with a warning) when nothing was submitted.
    pub async fn cancel(&mut self) -> bool {
        let Some(gid) = self.gid.take() else {
            warn!(task = %self, "task has no engine transfer to cancel");
            return false;
        };

        debug!(%gid, "removing transfer");
        if let Err(e) = self.rpc.remove(&gid).await {
            debug!(%gid, error = %e, "engine refused removal");
        }
        if let Err(e) = self.rpc.remove_download_result(&gid).await {
            debug!(%gid, error = %e, "no stopped result to purge");
        }
        self.last_updated = Instant::now();
        true
    }

    /// Moves the staged file into place when `status` says the transfer completed.
    ///
    /// Returns `Ok(false)` for any other state.
    ///
    /// # Errors
    ///
    /// Returns [`TaskError::Io`] if the final directory cannot be created or
    /// the staged file cannot be moved.
    pub fn finalize(&mut self, status: &TaskStatus) -> Result<bool, TaskError> {
        if status.status != TransferState::Complete {
            return Ok(false);
        }

        let staging = self.staging_path();
        let target = self.final_path();
        if let Some(dir) = target.parent() {
            fs::create_dir_all(dir).map_err(|source| TaskError::Io {
                path: dir.to_path_buf(),
                source,
            })?;
        }

        move_file(&staging, &target).map_err(|source| TaskError::Io {
            path: staging.clone(),
            source,
        })?;

        info!(gid = ?self.gid, path = %target.display(), "completed");
        self.touch(TaskState::Completed);
        Ok(true)
    }

    /// Forgets the engine transfer without contacting the engine.
    ///
    /// For use after the engine process was replaced and the GID is gone.
    pub fn detach(&mut self) -> Option<String> {
        self.last_updated = Instant::now();
        self.gid.take()
    }

    /// Drops the engine's stored result for a finished transfer.
    pub async fn release(&mut self) {
        let Some(gid) = self.gid.take() else {
            return;
        };
        if let Err(e) = self.rpc.remove_download_result(&gid).await {
            debug!(%gid, error = %e, "failed to release transfer result");
        }
    }
}

impl fmt::Display for DownloadTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "<task bind={} file=\"{}\" gid={}>",
            self.record_id.map_or_else(|| "-".to_string(), |id| id.to_string()),
            self.relative_path.display(),
            self.gid.as_deref().unwrap_or("-"),
        )
    }
}

fn is_http_url(value: &str) -> bool {
    Url::parse(value).is_ok_and(|url| matches!(url.scheme(), "http" | "https"))
}

fn move_file(from: &Path, to: &Path) -> std::io::Result<()> {
    match fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(rename_err) => {
            // Rename fails across file systems; copy then delete instead.
            if !from.is_file() {
                return Err(rename_err);
            }
            fs::copy(from, to)?;
            fs::remove_file(from)
        }
    }
}
