//! On-disk layout of mirrored files.
//!
//! Files are downloaded into a staging tree and renamed into the final tree on
//! completion, so a partially written file never appears under the final root.
//! Both trees share the same relative path:
//!
//! ```text
//! <root>/<catalog>/<group>/<chapter_index:04>.<chapter>-<page:03>.<ext>
//! ```

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::registry::FileRecord;

/// Maps a free-form name to a single safe path component.
///
/// Path separators, reserved characters, whitespace and control characters
/// become `_` (runs collapse to one). A result that is empty or made only of
/// dots becomes `_`, so a component can never climb out of its parent.
#[must_use]
pub fn sanitize_component(value: &str) -> String {
    let mut out = String::new();
    let mut prev_sep = false;
    for ch in value.chars() {
        let mapped = match ch {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_whitespace() || c.is_control() => '_',
            c => c,
        };
        if mapped == '_' {
            if !prev_sep {
                out.push('_');
                prev_sep = true;
            }
        } else {
            out.push(mapped);
            prev_sep = false;
        }
    }

    let trimmed = out.trim_matches('_');
    if trimmed.chars().all(|c| c == '.') {
        "_".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Relative path of a record inside either tree.
#[must_use]
pub fn relative_path(record: &FileRecord) -> PathBuf {
    let file_name = format!(
        "{:04}.{}-{:03}.{}",
        record.chapter_index,
        sanitize_component(&record.chapter),
        record.page,
        sanitize_component(&record.extension),
    );
    PathBuf::from(sanitize_component(&record.group_name)).join(file_name)
}

/// Final and staging roots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageLayout {
    download_root: PathBuf,
    staging_root: PathBuf,
}

impl StorageLayout {
    /// Creates a layout over the two roots.
    #[must_use]
    pub fn new(download_root: impl Into<PathBuf>, staging_root: impl Into<PathBuf>) -> Self {
        Self {
            download_root: download_root.into(),
            staging_root: staging_root.into(),
        }
    }

    /// Scopes both roots by the catalog name, when there is one.
    #[must_use]
    pub fn for_catalog(&self, catalog: Option<&str>) -> Self {
        match catalog {
            Some(name) => {
                let name = sanitize_component(name);
                Self {
                    download_root: self.download_root.join(&name),
                    staging_root: self.staging_root.join(&name),
                }
            }
            None => self.clone(),
        }
    }

    #[must_use]
    pub fn download_root(&self) -> &Path {
        &self.download_root
    }

    #[must_use]
    pub fn staging_root(&self) -> &Path {
        &self.staging_root
    }

    /// Absolute final location of `relative`.
    #[must_use]
    pub fn final_path(&self, relative: &Path) -> PathBuf {
        self.download_root.join(relative)
    }

    /// Absolute staging location of `relative`.
    #[must_use]
    pub fn staging_path(&self, relative: &Path) -> PathBuf {
        self.staging_root.join(relative)
    }

    /// Creates both roots.
    ///
    /// # Errors
    ///
    /// Returns the underlying IO error.
    pub fn create_roots(&self) -> io::Result<()> {
        fs::create_dir_all(&self.download_root)?;
        fs::create_dir_all(&self.staging_root)
    }

    /// Deletes every file under the staging root, keeping the directories.
    ///
    /// Returns the number of files removed.
    ///
    /// # Errors
    ///
    /// Returns the underlying IO error.
    pub fn clear_staging(&self) -> io::Result<usize> {
        if !self.staging_root.exists() {
            return Ok(0);
        }
        let removed = clear_files(&self.staging_root)?;
        debug!(removed, root = %self.staging_root.display(), "staging tree cleared");
        Ok(removed)
    }
}

fn clear_files(dir: &Path) -> io::Result<usize> {
    let mut removed = 0;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            removed += clear_files(&path)?;
        } else {
            fs::remove_file(&path)?;
            removed += 1;
        }
    }
    Ok(removed)
}
