//! Control loop that drains the file registry through the engine.
//!
//! The scheduler never transfers bytes itself. It admits registry records as
//! [`DownloadTask`]s under a concurrency cap and the submission rate limit,
//! polls the engine once per tick, and writes every outcome back to the
//! registry before the next admission decision.
//!
//! # Passes
//!
//! A pass runs three phases in order:
//!
//! 1. **Unfinished**: records left `active` by an earlier run. Skipped when the
//!    engine still reports active transfers, since those could be the same
//!    files.
//! 2. **New**: records in `new`, admitted one at a time by ascending key.
//! 3. **Retryable**: `path_problem` records and `error` records under the
//!    persisted error budget that did not already fail in this run.
//!
//! Each phase ends when its source is exhausted and the active set is empty.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use mirror_core::download::{RateLimiter, Scheduler, SchedulerConfig, StorageLayout};
//! use mirror_core::engine::EngineRpcClient;
//! use mirror_core::registry::Registry;
//! use mirror_core::Database;
//! use std::path::Path;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let registry = Registry::new(Database::new(Path::new("catalog.db")).await?);
//! let rpc = EngineRpcClient::new("http://127.0.0.1:6800", "secret")?;
//! let limiter = Arc::new(RateLimiter::new(99));
//! let layout = StorageLayout::new("data/download", "data/staging");
//!
//! let mut scheduler = Scheduler::new(registry, rpc, limiter, layout, SchedulerConfig::default());
//! let stats = scheduler.run(false).await?;
//! println!("completed {}, failed {}", stats.completed, stats.failed);
//! # Ok(())
//! # }
//! ```

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tracing::{debug, error, info, instrument, warn};

use super::layout::StorageLayout;
use super::progress::{ProgressLine, ProgressSlot};
use super::rate_limiter::RateLimiter;
use super::task::{DownloadTask, LoadOutcome};
use super::SchedulerError;
use crate::engine::{
    AddUriOptions, DEFAULT_READY_TIMEOUT, EngineRpcClient, EngineSupervisor, GlobalStat,
    TransferState,
};
use crate::registry::{FileRecord, FileRegistry, FileStatus, FileUpdate, retry_busy};

/// Default cap on concurrently active tasks.
pub const DEFAULT_MAX_CONCURRENT: usize = 20;

/// Resubmissions allowed per task before the record is marked `error`.
pub const DEFAULT_MAX_TASK_RETRIES: u32 = 5;

/// Runs after which an `error` record is no longer retried.
pub const DEFAULT_MAX_RECORD_ERRORS: i64 = 3;

/// Scheduler tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Active-set capacity.
    pub max_concurrent: usize,
    /// Per-task resubmissions before giving up.
    pub max_task_retries: u32,
    /// Persisted error budget for the retry phase.
    pub max_record_errors: i64,
    /// Delay between reconciliation ticks.
    pub tick_interval: Duration,
    /// Service mode: pause after a pass that admitted nothing.
    pub idle_interval: Duration,
    /// Proxy handed to the engine with every submission.
    pub proxy: Option<String>,
    /// User agent override for submissions.
    pub user_agent: Option<String>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            max_task_retries: DEFAULT_MAX_TASK_RETRIES,
            max_record_errors: DEFAULT_MAX_RECORD_ERRORS,
            tick_interval: Duration::from_secs(1),
            idle_interval: Duration::from_secs(30),
            proxy: None,
            user_agent: None,
        }
    }
}

/// Outcome of one admission attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// A task was created and submitted (or left for reconciliation to resubmit).
    Admitted,
    /// The record was rejected at load time; its status was updated.
    Rejected,
    /// The submission limiter is full; a slot frees after the given wait.
    Throttled(Duration),
    /// The active set is at capacity.
    QueueFull,
    /// The phase source has no more records.
    Exhausted,
}

/// Counters for one `run`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunStats {
    pub admitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub rejected: u64,
    pub retried: u64,
}

enum Source {
    New,
    Snapshot(VecDeque<i64>),
}

/// Registry-driven download scheduler.
pub struct Scheduler<R: FileRegistry> {
    registry: R,
    rpc: EngineRpcClient,
    supervisor: Option<EngineSupervisor>,
    limiter: Arc<RateLimiter>,
    base_layout: StorageLayout,
    layout: Option<StorageLayout>,
    config: SchedulerConfig,
    options: AddUriOptions,
    active: Vec<DownloadTask>,
    throttled: bool,
    failed_this_run: HashSet<i64>,
    stop: Arc<AtomicBool>,
    stats: RunStats,
}

impl<R: FileRegistry> Scheduler<R> {
    /// Creates a scheduler. Storage is prepared lazily on the first pass.
    #[must_use]
    pub fn new(
        registry: R,
        rpc: EngineRpcClient,
        limiter: Arc<RateLimiter>,
        layout: StorageLayout,
        config: SchedulerConfig,
    ) -> Self {
        let options = AddUriOptions {
            user_agent: config.user_agent.clone(),
            proxy: config.proxy.clone(),
            ..AddUriOptions::default()
        };
        Self {
            registry,
            rpc,
            supervisor: None,
            limiter,
            base_layout: layout,
            layout: None,
            config,
            options,
            active: Vec::new(),
            throttled: false,
            failed_this_run: HashSet::new(),
            stop: Arc::new(AtomicBool::new(false)),
            stats: RunStats::default(),
        }
    }

    /// Hands the engine process to the scheduler.
    ///
    /// When a status query fails and the process has exited, it is respawned
    /// and every active task is resubmitted without counting a failure.
    /// [`shutdown`](Self::shutdown) stops the process.
    #[must_use]
    pub fn with_supervisor(mut self, supervisor: EngineSupervisor) -> Self {
        self.supervisor = Some(supervisor);
        self
    }

    /// Flag that ends `run` when set; admission stops immediately and the
    /// caller is expected to [`shutdown`](Self::shutdown) afterwards.
    #[must_use]
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    /// Number of tasks in the active set.
    #[must_use]
    pub fn active_len(&self) -> usize {
        self.active.len()
    }

    /// Whether the last admission attempt hit the rate limit.
    #[must_use]
    pub fn is_throttled(&self) -> bool {
        self.throttled
    }

    /// Counters accumulated so far.
    #[must_use]
    pub fn stats(&self) -> RunStats {
        self.stats
    }

    /// The catalog-scoped layout, once prepared.
    #[must_use]
    pub fn layout(&self) -> Option<&StorageLayout> {
        self.layout.as_ref()
    }

    fn is_full(&self) -> bool {
        self.active.len() >= self.config.max_concurrent
    }

    /// Scopes the layout by catalog name, creates both roots and clears stale
    /// staging files. Runs once; later calls return the prepared layout.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::Registry`] if the catalog name cannot be read
    /// and [`SchedulerError::Storage`] if a root cannot be prepared.
    pub async fn prepare(&mut self) -> Result<StorageLayout, SchedulerError> {
        if let Some(layout) = &self.layout {
            return Ok(layout.clone());
        }

        let catalog = self.registry.catalog_name().await?;
        let layout = self.base_layout.for_catalog(catalog.as_deref());
        layout.create_roots().map_err(|source| SchedulerError::Storage {
            path: layout.download_root().to_path_buf(),
            source,
        })?;
        debug!(staging = %layout.staging_root().display(), download = %layout.download_root().display(), "storage roots");

        let removed = layout.clear_staging().map_err(|source| SchedulerError::Storage {
            path: layout.staging_root().to_path_buf(),
            source,
        })?;
        if removed > 0 {
            info!(removed, "cleared stale staging files");
        }

        self.layout = Some(layout.clone());
        Ok(layout)
    }

    // Only checks; the slot is taken once a record is ready to submit.
    fn check_rate_limit(&mut self) -> Option<Admission> {
        if !self.limiter.is_saturated() {
            self.throttled = false;
            return None;
        }
        let wait = self.limiter.time_until_next_slot();
        if !self.throttled && !wait.is_zero() {
            debug!(wait_secs = wait.as_secs(), "submission rate limit reached");
        }
        self.throttled = true;
        Some(Admission::Throttled(wait))
    }

    /// Admits the lowest-keyed `new` record.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError`] if storage or the registry fails.
    pub async fn add_file(&mut self) -> Result<Admission, SchedulerError> {
        if self.is_full() {
            return Ok(Admission::QueueFull);
        }
        let Some(record) = self.registry.first_by_status(FileStatus::New).await? else {
            return Ok(Admission::Exhausted);
        };
        if let Some(throttled) = self.check_rate_limit() {
            return Ok(throttled);
        }
        self.create_task(&record).await
    }

    /// Admits the next key of a snapshot, removing it from `ids`.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError`] if storage or the registry fails.
    pub async fn add_files(&mut self, ids: &mut VecDeque<i64>) -> Result<Admission, SchedulerError> {
        if self.is_full() {
            return Ok(Admission::QueueFull);
        }
        if ids.is_empty() {
            return Ok(Admission::Exhausted);
        }
        if let Some(throttled) = self.check_rate_limit() {
            return Ok(throttled);
        }
        let Some(id) = ids.pop_front() else {
            return Ok(Admission::Exhausted);
        };
        let Some(record) = self.registry.get(id).await? else {
            warn!(id, "record disappeared before admission");
            return Ok(Admission::Rejected);
        };
        self.create_task(&record).await
    }

    async fn create_task(&mut self, record: &FileRecord) -> Result<Admission, SchedulerError> {
        let layout = self.prepare().await?;
        let mut task = DownloadTask::new(self.rpc.clone(), layout, self.options.clone());

        match task.load_record(record).await {
            LoadOutcome::InvalidUrl => {
                let update = FileUpdate::status(FileStatus::InvalidUrl).with_skip(true);
                retry_busy(|| self.registry.update(record.id, &update)).await?;
                self.stats.rejected += 1;
                warn!(id = record.id, url = %record.url, "rejected: invalid url");
                Ok(Admission::Rejected)
            }
            LoadOutcome::PathProblem => {
                let update = FileUpdate::status(FileStatus::PathProblem);
                retry_busy(|| self.registry.update(record.id, &update)).await?;
                self.stats.rejected += 1;
                warn!(id = record.id, path = %task.relative_path().display(), "rejected: path problem");
                Ok(Admission::Rejected)
            }
            LoadOutcome::Ready => {
                if !self.limiter.admit() {
                    debug!(id = record.id, "limiter filled between check and submit");
                }
                let update = FileUpdate::status(FileStatus::Active);
                retry_busy(|| self.registry.update(record.id, &update)).await?;
                if let Err(e) = task.submit().await {
                    error!(id = record.id, path = %task.relative_path().display(), error = %e, "submit failed");
                }
                debug!(id = record.id, path = %task.relative_path().display(), "admitted");
                self.active.push(task);
                self.stats.admitted += 1;
                Ok(Admission::Admitted)
            }
        }
    }

    /// Polls every active task once and applies the outcomes.
    ///
    /// Completed transfers are moved into place and marked `completed`.
    /// Failed transfers (including unbound tasks and failed polls) are
    /// resubmitted until the per-task budget is spent, then marked `error`.
    /// A failed poll while an attached engine process is down is not counted:
    /// the engine is respawned and every task resubmitted instead.
    /// Returns the number of tasks that left the active set.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::Registry`] if an outcome cannot be persisted
    /// and [`SchedulerError::Engine`] if a dead engine cannot be respawned.
    pub async fn reconcile(&mut self) -> Result<usize, SchedulerError> {
        let mut slots = Vec::with_capacity(self.active.len());
        let mut engine_down = None;
        let mut removed = 0;
        let mut index = 0;

        while index < self.active.len() {
            let task = &mut self.active[index];
            let Some(id) = task.record_id() else {
                self.active.remove(index);
                removed += 1;
                continue;
            };

            let status = match task.poll().await {
                Ok(status) => status,
                Err(e) => {
                    warn!(id, error = %e, "status query failed");
                    let down = *engine_down.get_or_insert_with(|| {
                        self.supervisor.as_mut().is_some_and(|s| !s.is_running())
                    });
                    if down {
                        slots.push(ProgressSlot::State(TransferState::Waiting));
                        index += 1;
                        continue;
                    }
                    None
                }
            };

            match status {
                Some(status) if status.status == TransferState::Complete => {
                    match task.finalize(&status) {
                        Ok(_) => {
                            let update = FileUpdate::status(FileStatus::Completed);
                            retry_busy(|| self.registry.update(id, &update)).await?;
                            self.stats.completed += 1;
                            slots.push(ProgressSlot::Done);
                            info!(id, path = %task.relative_path().display(), "download completed");
                        }
                        Err(e) => {
                            slots.push(ProgressSlot::State(TransferState::Error));
                            error!(id, path = %task.relative_path().display(), error = %e, "cannot move staged file; record stays active");
                        }
                    }
                    task.release().await;
                    self.active.remove(index);
                    removed += 1;
                }
                Some(status) if status.status != TransferState::Error => {
                    slots.push(ProgressSlot::from_status(&status));
                    index += 1;
                }
                failed => {
                    if let Some(status) = &failed {
                        debug!(id, code = ?status.error_code, message = ?status.error_message, "transfer error");
                    }
                    let attempts = task.record_failure();
                    if task.gid().is_some() {
                        task.cancel().await;
                    }
                    if attempts <= self.config.max_task_retries {
                        warn!(id, attempt = attempts, path = %task.relative_path().display(), "retrying download");
                        if let Err(e) = task.submit().await {
                            warn!(id, error = %e, "resubmit failed");
                        }
                        self.stats.retried += 1;
                        slots.push(ProgressSlot::Retrying);
                        index += 1;
                    } else {
                        task.mark_failed();
                        error!(id, path = %task.relative_path().display(), "download failed");
                        retry_busy(|| self.registry.mark_error(id)).await?;
                        self.failed_this_run.insert(id);
                        self.stats.failed += 1;
                        self.active.remove(index);
                        removed += 1;
                    }
                }
            }
        }

        if engine_down == Some(true) {
            self.restart_engine().await?;
        }
        self.report_progress(&slots).await;
        Ok(removed)
    }

    async fn restart_engine(&mut self) -> Result<(), SchedulerError> {
        let Some(supervisor) = self.supervisor.as_mut() else {
            return Ok(());
        };
        if !supervisor.ensure_running()? {
            return Ok(());
        }
        if let Err(e) = self.rpc.wait_until_ready(DEFAULT_READY_TIMEOUT).await {
            warn!(error = %e, "restarted engine is not answering yet");
        }

        let mut resubmitted = 0;
        for task in &mut self.active {
            task.detach();
            match task.submit().await {
                Ok(_) => resubmitted += 1,
                Err(e) => warn!(task = %task, error = %e, "resubmit after engine restart failed"),
            }
        }
        info!(resubmitted, "engine restarted, transfers resubmitted");
        Ok(())
    }

    async fn report_progress(&self, slots: &[ProgressSlot]) {
        let stat = match self.rpc.get_global_stat().await {
            Ok(stat) => stat,
            Err(e) => {
                debug!(error = %e, "global stat unavailable");
                GlobalStat::default()
            }
        };
        let line = ProgressLine {
            slots,
            capacity: self.config.max_concurrent,
            active_tasks: self.active.len(),
            limiter: self.limiter.to_string(),
            throttle_wait: self.throttled.then(|| self.limiter.time_until_next_slot()),
            engine_active: stat.num_active,
            download_speed: stat.download_speed,
        };
        info!("{line}");
    }

    async fn admit_next(&mut self, source: &mut Source) -> Result<Admission, SchedulerError> {
        match source {
            Source::New => self.add_file().await,
            Source::Snapshot(ids) => self.add_files(ids).await,
        }
    }

    async fn drain(&mut self, mut source: Source) -> Result<(), SchedulerError> {
        let mut exhausted = false;
        loop {
            if self.stop_requested() {
                return Ok(());
            }
            if !exhausted && self.admit_next(&mut source).await? == Admission::Exhausted {
                exhausted = true;
            }
            if exhausted && self.active.is_empty() {
                return Ok(());
            }
            if !exhausted && !self.is_full() && !self.throttled {
                continue;
            }
            self.reconcile().await?;
            tokio::time::sleep(self.config.tick_interval).await;
        }
    }

    /// Phase 1: resume records left `active`.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError`] on registry, storage or engine-query failure.
    #[instrument(skip(self))]
    pub async fn download_unfinished(&mut self) -> Result<(), SchedulerError> {
        info!("checking unfinished records");
        let stat = self.rpc.get_global_stat().await?;
        if stat.num_active != 0 {
            error!(
                num_active = stat.num_active,
                "engine still has active transfers; unfinished records left untouched"
            );
            return Ok(());
        }

        let ids = self.registry.ids_by_status(FileStatus::Active).await?;
        if ids.is_empty() {
            debug!("no unfinished records");
            return Ok(());
        }
        info!(count = ids.len(), "resuming unfinished records");
        self.drain(Source::Snapshot(ids.into())).await
    }

    /// Phase 2: admit `new` records in key order.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError`] on registry or storage failure.
    #[instrument(skip(self))]
    pub async fn download_new(&mut self) -> Result<(), SchedulerError> {
        info!("checking new records");
        self.drain(Source::New).await
    }

    /// Phase 3: retry path problems and errors still under budget.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError`] on registry or storage failure.
    #[instrument(skip(self))]
    pub async fn download_retryable(&mut self) -> Result<(), SchedulerError> {
        info!("checking retryable records");
        let ids: VecDeque<i64> = self
            .registry
            .retryable_ids(self.config.max_record_errors)
            .await?
            .into_iter()
            .filter(|id| !self.failed_this_run.contains(id))
            .collect();
        if ids.is_empty() {
            debug!("no retryable records");
            return Ok(());
        }
        info!(count = ids.len(), "retrying records");
        self.drain(Source::Snapshot(ids)).await
    }

    /// Runs passes until the registry is drained (`service == false`) or the
    /// stop flag is raised (`service == true`).
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError`] on registry, storage or engine-query failure.
    #[instrument(skip(self))]
    pub async fn run(&mut self, service: bool) -> Result<RunStats, SchedulerError> {
        self.prepare().await?;

        while !self.stop_requested() {
            let admitted_before = self.stats.admitted;

            self.download_unfinished().await?;
            self.download_new().await?;
            self.download_retryable().await?;

            if !service {
                info!(
                    admitted = self.stats.admitted,
                    completed = self.stats.completed,
                    failed = self.stats.failed,
                    rejected = self.stats.rejected,
                    "download pass finished"
                );
                break;
            }
            if self.stats.admitted == admitted_before {
                debug!(idle_secs = self.config.idle_interval.as_secs(), "nothing to do, idling");
                self.idle().await;
            }
        }

        Ok(self.stats)
    }

    async fn idle(&self) {
        let step = self.config.tick_interval.max(Duration::from_millis(1));
        let mut remaining = self.config.idle_interval;
        while !remaining.is_zero() && !self.stop_requested() {
            let nap = remaining.min(step);
            tokio::time::sleep(nap).await;
            remaining = remaining.saturating_sub(nap);
        }
    }

    /// Cancels every remaining engine transfer, empties the active set and
    /// stops an attached engine process.
    ///
    /// Records keep their `active` status so the next run resumes them.
    /// Returns the number of cancelled tasks.
    pub async fn shutdown(&mut self) -> usize {
        let mut cancelled = 0;
        for mut task in self.active.drain(..) {
            if task.gid().is_some() && task.cancel().await {
                cancelled += 1;
            }
        }
        if cancelled > 0 {
            info!(cancelled, "cancelled remaining transfers");
        }
        if let Some(mut supervisor) = self.supervisor.take() {
            supervisor.stop();
        }
        cancelled
    }
}
