//! Repository seam between the scheduler and record persistence.
//!
//! The scheduler only needs selection by status and single-record mutation;
//! tests and alternative stores can implement this trait without `SQLite`.

use async_trait::async_trait;

use super::{FileRecord, FileStatus, FileUpdate, Registry, Result};

/// Data-access contract consumed by the scheduler.
#[async_trait]
pub trait FileRegistry: Send + Sync {
    /// Gets a record by key.
    async fn get(&self, id: i64) -> Result<Option<FileRecord>>;

    /// Returns the lowest-keyed non-skipped record in a status.
    async fn first_by_status(&self, status: FileStatus) -> Result<Option<FileRecord>>;

    /// Returns the keys of every non-skipped record in a status, ascending.
    async fn ids_by_status(&self, status: FileStatus) -> Result<Vec<i64>>;

    /// Returns keys for the retry phase (path problems plus errors under budget).
    async fn retryable_ids(&self, max_errors: i64) -> Result<Vec<i64>>;

    /// Writes the present fields of a partial update.
    async fn update(&self, id: i64, update: &FileUpdate) -> Result<()>;

    /// Marks a record `Error` and bumps its error count.
    async fn mark_error(&self, id: i64) -> Result<()>;

    /// Returns the catalog name that scopes the storage directories.
    async fn catalog_name(&self) -> Result<Option<String>>;
}

#[async_trait]
impl FileRegistry for Registry {
    async fn get(&self, id: i64) -> Result<Option<FileRecord>> {
        Registry::get(self, id).await
    }

    async fn first_by_status(&self, status: FileStatus) -> Result<Option<FileRecord>> {
        Registry::first_by_status(self, status).await
    }

    async fn ids_by_status(&self, status: FileStatus) -> Result<Vec<i64>> {
        Registry::ids_by_status(self, status).await
    }

    async fn retryable_ids(&self, max_errors: i64) -> Result<Vec<i64>> {
        Registry::retryable_ids(self, max_errors).await
    }

    async fn update(&self, id: i64, update: &FileUpdate) -> Result<()> {
        Registry::update(self, id, update).await
    }

    async fn mark_error(&self, id: i64) -> Result<()> {
        Registry::mark_error(self, id).await
    }

    async fn catalog_name(&self) -> Result<Option<String>> {
        Registry::catalog_name(self).await
    }
}
