//! File record types, status definitions and the partial-update value.

use std::fmt;

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Download status of a registry record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    /// Queued, never submitted.
    New,
    /// Submitted to the engine (or about to be).
    Active,
    /// Downloaded and moved to its final path.
    Completed,
    /// Transfer failed after the per-task retry budget.
    Error,
    /// Source URL is not an HTTP(S) URL. Terminal; the record is also skipped.
    InvalidUrl,
    /// A directory occupies the staging or final path.
    PathProblem,
}

impl FileStatus {
    /// All statuses, in lifecycle order.
    pub const ALL: [Self; 6] = [
        Self::New,
        Self::Active,
        Self::Completed,
        Self::Error,
        Self::InvalidUrl,
        Self::PathProblem,
    ];

    /// Returns the database string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Error => "error",
            Self::InvalidUrl => "invalid_url",
            Self::PathProblem => "path_problem",
        }
    }
}

impl fmt::Display for FileStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for FileStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new" => Ok(Self::New),
            "active" => Ok(Self::Active),
            "completed" => Ok(Self::Completed),
            "error" => Ok(Self::Error),
            "invalid_url" => Ok(Self::InvalidUrl),
            "path_problem" => Ok(Self::PathProblem),
            _ => Err(format!("invalid file status: {s}")),
        }
    }
}

/// One persisted file of the catalog.
#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct FileRecord {
    /// Surrogate key; ascending key order is admission priority.
    pub id: i64,
    /// Group (e.g. "default", "tankobon") the chapter belongs to.
    pub group_name: String,
    /// Position of the chapter inside its group.
    pub chapter_index: i64,
    /// Chapter or volume label.
    pub chapter: String,
    /// Page number inside the chapter.
    pub page: i64,
    /// File extension without the leading dot.
    pub extension: String,
    /// Source URL handed to the engine.
    pub url: String,
    /// Records with `skip` set are never selected.
    pub skip: bool,
    #[sqlx(rename = "status")]
    pub status_str: String,
    /// How many times the record ended a run in `Error`.
    pub error_count: i64,
    pub created_at: String,
    pub updated_at: String,
}

impl FileRecord {
    /// Returns the parsed status enum.
    ///
    /// Falls back to `New` if the status string is invalid.
    #[must_use]
    pub fn status(&self) -> FileStatus {
        self.status_str.parse().unwrap_or(FileStatus::New)
    }
}

impl fmt::Display for FileRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "<file [{}] {}/{}/{:03}.{} {}>",
            self.id,
            self.group_name,
            self.chapter,
            self.page,
            self.extension,
            self.status()
        )
    }
}

/// Insert payload for a new record.
#[derive(Debug, Clone, Copy)]
pub struct NewFile<'a> {
    pub group_name: &'a str,
    pub chapter_index: i64,
    pub chapter: &'a str,
    pub page: i64,
    pub extension: &'a str,
    pub url: &'a str,
}

/// Partial update of a record: present fields are written, absent ones are left alone.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileUpdate {
    pub group_name: Option<String>,
    pub chapter_index: Option<i64>,
    pub chapter: Option<String>,
    pub page: Option<i64>,
    pub extension: Option<String>,
    pub url: Option<String>,
    pub skip: Option<bool>,
    pub status: Option<FileStatus>,
    pub error_count: Option<i64>,
}

impl FileUpdate {
    /// An update that only changes the status.
    #[must_use]
    pub fn status(status: FileStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    /// Sets the skip flag on this update.
    #[must_use]
    pub fn with_skip(mut self, skip: bool) -> Self {
        self.skip = Some(skip);
        self
    }

    /// Returns true when no field is set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Merges the present fields into `record`.
    pub fn apply(&self, record: &mut FileRecord) {
        if let Some(group_name) = &self.group_name {
            record.group_name.clone_from(group_name);
        }
        if let Some(chapter_index) = self.chapter_index {
            record.chapter_index = chapter_index;
        }
        if let Some(chapter) = &self.chapter {
            record.chapter.clone_from(chapter);
        }
        if let Some(page) = self.page {
            record.page = page;
        }
        if let Some(extension) = &self.extension {
            record.extension.clone_from(extension);
        }
        if let Some(url) = &self.url {
            record.url.clone_from(url);
        }
        if let Some(skip) = self.skip {
            record.skip = skip;
        }
        if let Some(status) = self.status {
            record.status_str = status.as_str().to_string();
        }
        if let Some(error_count) = self.error_count {
            record.error_count = error_count;
        }
    }
}
