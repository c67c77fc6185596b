//! File registry: the persisted work queue the scheduler drains.
//!
//! Each row of the `files` table is one addressable file of the mirrored
//! catalog, identified by `(group, chapter, page, extension)`. A small
//! `metadata` table holds catalog-level key/value pairs such as the catalog
//! name (`__name__`) that scopes the on-disk directories.
//!
//! # Overview
//!
//! - [`Registry`] - `SQLite`-backed implementation
//! - [`FileRecord`] - one persisted file
//! - [`FileStatus`] - record lifecycle states
//! - [`FileUpdate`] - partial update ("set if present")
//! - [`FileRegistry`] - the seam the scheduler depends on
//!
//! # Example
//!
//! ```ignore
//! use mirror_core::registry::{FileStatus, FileUpdate, NewFile, Registry};
//! use mirror_core::Database;
//! use std::path::Path;
//!
//! let db = Database::new(Path::new("catalog.db")).await?;
//! let registry = Registry::new(db);
//!
//! let id = registry
//!     .add_file(&NewFile {
//!         group_name: "default",
//!         chapter_index: 1,
//!         chapter: "Ch.1",
//!         page: 1,
//!         extension: "webp",
//!         url: "https://cdn.example.com/1/1.webp",
//!     })
//!     .await?;
//! registry.update(id, &FileUpdate::status(FileStatus::Completed)).await?;
//! ```

mod error;
mod record;
mod repository;

pub use error::RegistryError;
pub use record::{FileRecord, FileStatus, FileUpdate, NewFile};
pub use repository::FileRegistry;

use std::time::Duration;

use sqlx::{QueryBuilder, Row, Sqlite};
use tracing::{instrument, warn};

use crate::db::Database;

/// Metadata tag holding the catalog name.
pub const CATALOG_NAME_TAG: &str = "__name__";

/// Returns `Ok(())` if at least one row was affected; otherwise [`RegistryError::ItemNotFound`].
fn check_affected(id: i64, rows_affected: u64) -> Result<()> {
    if rows_affected == 0 {
        Err(RegistryError::ItemNotFound(id))
    } else {
        Ok(())
    }
}

/// Attempts made for one statement while the database reports busy.
pub const BUSY_ATTEMPTS: u32 = 5;

const BUSY_BACKOFF: Duration = Duration::from_millis(50);

/// Runs `op`, issuing it again with linear backoff while it fails with
/// [`RegistryError::Busy`]. Other errors are returned at once.
///
/// # Errors
///
/// Returns the last error once [`BUSY_ATTEMPTS`] attempts were busy, or the
/// first non-busy error.
pub async fn retry_busy<T, F, Fut>(mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Err(e) if e.is_busy() && attempt < BUSY_ATTEMPTS => {
                warn!(attempt, error = %e, "registry busy, retrying");
                tokio::time::sleep(BUSY_BACKOFF * attempt).await;
                attempt += 1;
            }
            outcome => return outcome,
        }
    }
}

/// Result type for registry operations.
pub type Result<T> = std::result::Result<T, RegistryError>;

/// File registry backed by the `files` and `metadata` tables.
///
/// Every mutation is a single autocommitted statement, so a change is durable
/// before the caller makes its next decision.
#[derive(Debug, Clone)]
pub struct Registry {
    db: Database,
}

impl Registry {
    /// Creates a registry over an open database.
    #[must_use]
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Returns the underlying database handle.
    #[must_use]
    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Inserts a new record in `New` status.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Constraint`] for a duplicate identity tuple
    /// and [`RegistryError::Database`] for other failures.
    #[instrument(skip(self, file), fields(group = %file.group_name, chapter = %file.chapter, page = file.page))]
    pub async fn add_file(&self, file: &NewFile<'_>) -> Result<i64> {
        let row = sqlx::query(
            r"INSERT INTO files (group_name, chapter_index, chapter, page, extension, url, status)
              VALUES (?, ?, ?, ?, ?, ?, ?)
              RETURNING id",
        )
        .bind(file.group_name)
        .bind(file.chapter_index)
        .bind(file.chapter)
        .bind(file.page)
        .bind(file.extension)
        .bind(file.url)
        .bind(FileStatus::New.as_str())
        .fetch_one(self.db.pool())
        .await?;

        Ok(row.get("id"))
    }

    /// Gets a record by key.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn get(&self, id: i64) -> Result<Option<FileRecord>> {
        let record = sqlx::query_as::<_, FileRecord>(r"SELECT * FROM files WHERE id = ?")
            .bind(id)
            .fetch_optional(self.db.pool())
            .await?;

        Ok(record)
    }

    /// Returns the lowest-keyed non-skipped record in `status`.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn first_by_status(&self, status: FileStatus) -> Result<Option<FileRecord>> {
        let record = sqlx::query_as::<_, FileRecord>(
            r"SELECT * FROM files
              WHERE status = ? AND skip = 0
              ORDER BY id ASC
              LIMIT 1",
        )
        .bind(status.as_str())
        .fetch_optional(self.db.pool())
        .await?;

        Ok(record)
    }

    /// Returns the keys of every non-skipped record in `status`, ascending.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn ids_by_status(&self, status: FileStatus) -> Result<Vec<i64>> {
        let ids = sqlx::query_scalar::<_, i64>(
            r"SELECT id FROM files WHERE status = ? AND skip = 0 ORDER BY id ASC",
        )
        .bind(status.as_str())
        .fetch_all(self.db.pool())
        .await?;

        Ok(ids)
    }

    /// Returns keys eligible for the retry phase: every `PathProblem` record,
    /// plus `Error` records that have failed fewer than `max_errors` times.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn retryable_ids(&self, max_errors: i64) -> Result<Vec<i64>> {
        let ids = sqlx::query_scalar::<_, i64>(
            r"SELECT id FROM files
              WHERE skip = 0
                AND (status = ? OR (status = ? AND error_count < ?))
              ORDER BY id ASC",
        )
        .bind(FileStatus::PathProblem.as_str())
        .bind(FileStatus::Error.as_str())
        .bind(max_errors)
        .fetch_all(self.db.pool())
        .await?;

        Ok(ids)
    }

    /// Writes the present fields of `update` to the record.
    ///
    /// An empty update only checks that the record exists.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::ItemNotFound`] if no record exists with the given key.
    /// Returns [`RegistryError::Database`] if the update fails.
    #[instrument(skip(self, update))]
    pub async fn update(&self, id: i64, update: &FileUpdate) -> Result<()> {
        let mut builder = QueryBuilder::<Sqlite>::new("UPDATE files SET updated_at = datetime('now')");

        if let Some(group_name) = &update.group_name {
            builder.push(", group_name = ").push_bind(group_name.clone());
        }
        if let Some(chapter_index) = update.chapter_index {
            builder.push(", chapter_index = ").push_bind(chapter_index);
        }
        if let Some(chapter) = &update.chapter {
            builder.push(", chapter = ").push_bind(chapter.clone());
        }
        if let Some(page) = update.page {
            builder.push(", page = ").push_bind(page);
        }
        if let Some(extension) = &update.extension {
            builder.push(", extension = ").push_bind(extension.clone());
        }
        if let Some(url) = &update.url {
            builder.push(", url = ").push_bind(url.clone());
        }
        if let Some(skip) = update.skip {
            builder.push(", skip = ").push_bind(skip);
        }
        if let Some(status) = update.status {
            builder.push(", status = ").push_bind(status.as_str());
        }
        if let Some(error_count) = update.error_count {
            builder.push(", error_count = ").push_bind(error_count);
        }
        builder.push(" WHERE id = ").push_bind(id);

        let result = builder.build().execute(self.db.pool()).await?;
        check_affected(id, result.rows_affected())
    }

    /// Sets the status of a record.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::ItemNotFound`] if no record exists with the given key.
    /// Returns [`RegistryError::Database`] if the update fails.
    #[instrument(skip(self))]
    pub async fn set_status(&self, id: i64, status: FileStatus) -> Result<()> {
        let result = sqlx::query(
            r"UPDATE files
              SET status = ?, updated_at = datetime('now')
              WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(id)
        .execute(self.db.pool())
        .await?;

        check_affected(id, result.rows_affected())
    }

    /// Marks a record `Error` and bumps its persisted error count.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::ItemNotFound`] if no record exists with the given key.
    /// Returns [`RegistryError::Database`] if the update fails.
    #[instrument(skip(self))]
    pub async fn mark_error(&self, id: i64) -> Result<()> {
        let result = sqlx::query(
            r"UPDATE files
              SET status = ?, error_count = error_count + 1, updated_at = datetime('now')
              WHERE id = ?",
        )
        .bind(FileStatus::Error.as_str())
        .bind(id)
        .execute(self.db.pool())
        .await?;

        check_affected(id, result.rows_affected())
    }

    /// Counts records by status, skipped ones included.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn count_by_status(&self, status: FileStatus) -> Result<i64> {
        let row = sqlx::query(r"SELECT COUNT(*) as count FROM files WHERE status = ?")
            .bind(status.as_str())
            .fetch_one(self.db.pool())
            .await?;

        Ok(row.get("count"))
    }

    /// Returns `(status, count)` for every status, in lifecycle order.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Database`] if a query fails.
    pub async fn status_counts(&self) -> Result<Vec<(FileStatus, i64)>> {
        let mut counts = Vec::with_capacity(FileStatus::ALL.len());
        for status in FileStatus::ALL {
            counts.push((status, self.count_by_status(status).await?));
        }
        Ok(counts)
    }

    /// Reads a metadata value.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn metadata(&self, tag: &str) -> Result<Option<String>> {
        let value = sqlx::query_scalar::<_, String>(r"SELECT value FROM metadata WHERE tag = ?")
            .bind(tag)
            .fetch_optional(self.db.pool())
            .await?;

        Ok(value)
    }

    /// Inserts or replaces a metadata value.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Database`] if the upsert fails.
    #[instrument(skip(self, value))]
    pub async fn set_metadata(&self, tag: &str, value: &str) -> Result<()> {
        sqlx::query(
            r"INSERT INTO metadata (tag, value) VALUES (?, ?)
              ON CONFLICT(tag) DO UPDATE SET value = excluded.value",
        )
        .bind(tag)
        .bind(value)
        .execute(self.db.pool())
        .await?;

        Ok(())
    }

    /// Returns the catalog name stored under [`CATALOG_NAME_TAG`], if any.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Database`] if the query fails.
    pub async fn catalog_name(&self) -> Result<Option<String>> {
        self.metadata(CATALOG_NAME_TAG).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    async fn setup() -> Registry {
        Registry::new(Database::new_in_memory().await.unwrap())
    }

    fn page(page: i64) -> NewFile<'static> {
        NewFile {
            group_name: "default",
            chapter_index: 1,
            chapter: "Ch.1",
            page,
            extension: "webp",
            url: "https://cdn.example.com/1.webp",
        }
    }

    #[tokio::test]
    async fn test_add_file_returns_id_and_starts_new() {
        let registry = setup().await;

        let id = registry.add_file(&page(1)).await.unwrap();
        let record = registry.get(id).await.unwrap().unwrap();

        assert_eq!(record.status(), FileStatus::New);
        assert_eq!(record.error_count, 0);
        assert!(!record.skip);
        assert_eq!(record.chapter, "Ch.1");
    }

    #[tokio::test]
    async fn test_add_file_duplicate_identity_is_constraint_violation() {
        let registry = setup().await;
        registry.add_file(&page(1)).await.unwrap();

        let err = registry.add_file(&page(1)).await.unwrap_err();

        assert!(matches!(err, RegistryError::Constraint(_)));
    }

    #[tokio::test]
    async fn test_get_missing_returns_none() {
        let registry = setup().await;
        assert!(registry.get(999).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_first_by_status_orders_by_key_and_ignores_skip() {
        let registry = setup().await;
        let first = registry.add_file(&page(1)).await.unwrap();
        let second = registry.add_file(&page(2)).await.unwrap();

        registry
            .update(first, &FileUpdate::default().with_skip(true))
            .await
            .unwrap();

        let next = registry.first_by_status(FileStatus::New).await.unwrap().unwrap();
        assert_eq!(next.id, second);
    }

    #[tokio::test]
    async fn test_ids_by_status_ascending() {
        let registry = setup().await;
        let a = registry.add_file(&page(1)).await.unwrap();
        let b = registry.add_file(&page(2)).await.unwrap();
        let c = registry.add_file(&page(3)).await.unwrap();
        registry.set_status(c, FileStatus::Active).await.unwrap();
        registry.set_status(a, FileStatus::Active).await.unwrap();

        let ids = registry.ids_by_status(FileStatus::Active).await.unwrap();
        assert_eq!(ids, vec![a, c]);
        assert_eq!(registry.ids_by_status(FileStatus::New).await.unwrap(), vec![b]);
    }

    #[tokio::test]
    async fn test_update_writes_only_present_fields() {
        let registry = setup().await;
        let id = registry.add_file(&page(1)).await.unwrap();

        registry
            .update(
                id,
                &FileUpdate {
                    url: Some("https://mirror.example.com/1.webp".to_string()),
                    ..FileUpdate::default()
                },
            )
            .await
            .unwrap();

        let record = registry.get(id).await.unwrap().unwrap();
        assert_eq!(record.url, "https://mirror.example.com/1.webp");
        assert_eq!(record.status(), FileStatus::New);
        assert_eq!(record.page, 1);
        assert!(!record.skip);
    }

    #[tokio::test]
    async fn test_update_missing_record_is_not_found() {
        let registry = setup().await;
        let err = registry
            .update(404, &FileUpdate::status(FileStatus::Completed))
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::ItemNotFound(404)));
    }

    #[tokio::test]
    async fn test_mark_error_increments_count() {
        let registry = setup().await;
        let id = registry.add_file(&page(1)).await.unwrap();

        registry.mark_error(id).await.unwrap();
        registry.set_status(id, FileStatus::Active).await.unwrap();
        registry.mark_error(id).await.unwrap();

        let record = registry.get(id).await.unwrap().unwrap();
        assert_eq!(record.status(), FileStatus::Error);
        assert_eq!(record.error_count, 2);
    }

    #[tokio::test]
    async fn test_retryable_ids_respects_error_budget() {
        let registry = setup().await;
        let path_problem = registry.add_file(&page(1)).await.unwrap();
        let fresh_error = registry.add_file(&page(2)).await.unwrap();
        let exhausted = registry.add_file(&page(3)).await.unwrap();

        registry
            .set_status(path_problem, FileStatus::PathProblem)
            .await
            .unwrap();
        registry.mark_error(fresh_error).await.unwrap();
        for _ in 0..3 {
            registry.mark_error(exhausted).await.unwrap();
        }

        let ids = registry.retryable_ids(3).await.unwrap();
        assert_eq!(ids, vec![path_problem, fresh_error]);
    }

    #[tokio::test]
    async fn test_status_counts_cover_every_status() {
        let registry = setup().await;
        let id = registry.add_file(&page(1)).await.unwrap();
        registry.add_file(&page(2)).await.unwrap();
        registry.set_status(id, FileStatus::Completed).await.unwrap();

        let counts = registry.status_counts().await.unwrap();
        assert_eq!(counts.len(), FileStatus::ALL.len());
        assert!(counts.contains(&(FileStatus::New, 1)));
        assert!(counts.contains(&(FileStatus::Completed, 1)));
        assert!(counts.contains(&(FileStatus::Error, 0)));
    }

    #[tokio::test]
    async fn test_metadata_upsert_and_catalog_name() {
        let registry = setup().await;
        assert!(registry.catalog_name().await.unwrap().is_none());

        registry.set_metadata(CATALOG_NAME_TAG, "first").await.unwrap();
        registry.set_metadata(CATALOG_NAME_TAG, "second").await.unwrap();

        assert_eq!(
            registry.catalog_name().await.unwrap().as_deref(),
            Some("second")
        );
        assert!(registry.metadata("missing").await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_busy_reissues_until_success() {
        let mut calls = 0;
        let value = retry_busy(|| {
            calls += 1;
            let outcome = if calls < 3 {
                Err(RegistryError::Busy("database is locked".to_string()))
            } else {
                Ok(7)
            };
            async move { outcome }
        })
        .await
        .unwrap();

        assert_eq!(value, 7);
        assert_eq!(calls, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_busy_gives_up_after_budget() {
        let mut calls = 0;
        let err = retry_busy(|| {
            calls += 1;
            async { Err::<(), _>(RegistryError::Busy("database is busy".to_string())) }
        })
        .await
        .unwrap_err();

        assert!(err.is_busy());
        assert_eq!(calls, BUSY_ATTEMPTS);
    }

    #[tokio::test]
    async fn test_retry_busy_returns_other_errors_at_once() {
        let registry = setup().await;
        let mut calls = 0;
        let err = retry_busy(|| {
            calls += 1;
            registry.set_status(404, FileStatus::Active)
        })
        .await
        .unwrap_err();

        assert!(matches!(err, RegistryError::ItemNotFound(404)));
        assert_eq!(calls, 1);
    }
}
