//! Storage provider trait definition.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use peersync_common::{FolderPath, Result};

/// Metadata for a stored object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metadata {
    /// Path of the object within the folder.
    pub path: FolderPath,
    /// Size in bytes (None for directories).
    pub size: Option<u64>,
    /// Whether this is a directory.
    pub is_directory: bool,
    /// Last modification time.
    pub modified: DateTime<Utc>,
}

/// Storage provider trait for the synchronized folder.
///
/// Paths are folder-relative. Mutating operations create missing parent
/// directories, so callers never need to order `create_dir` before `write`.
#[async_trait]
pub trait StorageProvider: Send + Sync {
    /// Get the provider name (e.g., "local", "memory").
    fn name(&self) -> &str;

    /// Check if a path exists.
    async fn exists(&self, path: &FolderPath) -> Result<bool>;

    /// Get metadata for a path.
    ///
    /// # Errors
    /// - Path not found
    async fn metadata(&self, path: &FolderPath) -> Result<Metadata>;

    /// Read a complete file.
    ///
    /// # Errors
    /// - File not found
    /// - Path is a directory
    async fn read(&self, path: &FolderPath) -> Result<Vec<u8>>;

    /// Replace the content of a file, creating it if needed.
    async fn write(&self, path: &FolderPath, data: Vec<u8>) -> Result<Metadata>;

    /// Read up to `len` bytes starting at `offset`.
    ///
    /// Reading at or past end-of-file yields a truncated, possibly empty,
    /// buffer rather than an error.
    async fn read_chunk(&self, path: &FolderPath, offset: u64, len: usize) -> Result<Vec<u8>>;

    /// Write `data` at `offset`, creating the file if needed.
    ///
    /// Bytes outside `offset..offset + data.len()` are left untouched, which
    /// makes repeating the same write idempotent.
    async fn write_chunk(&self, path: &FolderPath, offset: u64, data: &[u8]) -> Result<()>;

    /// Set a file's length, dropping or zero-filling the tail.
    async fn truncate(&self, path: &FolderPath, len: u64) -> Result<()>;

    /// Create a directory and any missing parents.
    ///
    /// Succeeds if the directory already exists.
    ///
    /// # Errors
    /// - Path exists as a file
    async fn create_dir(&self, path: &FolderPath) -> Result<Metadata>;

    /// Delete a file, or a directory with everything below it.
    ///
    /// # Errors
    /// - Path not found
    async fn delete(&self, path: &FolderPath) -> Result<()>;

    /// Move/rename a path.
    ///
    /// # Errors
    /// - Source not found
    /// - Destination already exists
    async fn rename(&self, from: &FolderPath, to: &FolderPath) -> Result<Metadata>;

    /// List the direct children of a directory.
    async fn list(&self, path: &FolderPath) -> Result<Vec<Metadata>>;

    /// Every file and directory below the root, shallowest first.
    async fn walk(&self) -> Result<Vec<Metadata>> {
        let mut found = Vec::new();
        let mut pending = vec![FolderPath::root()];

        while let Some(dir) = pending.pop() {
            for entry in self.list(&dir).await? {
                if entry.is_directory {
                    pending.push(entry.path.clone());
                }
                found.push(entry);
            }
        }

        found.sort_by(|a, b| FolderPath::shallow_first(&a.path, &b.path));
        Ok(found)
    }
}
