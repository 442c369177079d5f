//! Local filesystem storage provider.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use crate::provider::{Metadata, StorageProvider};
use crate::STATE_DIR_NAME;
use peersync_common::{Error, FolderPath, Result};

/// Local filesystem storage provider.
///
/// Serves the synchronized folder rooted at a directory on disk.
pub struct LocalProvider {
    root: PathBuf,
}

impl LocalProvider {
    /// Create a new local provider with the given root directory.
    ///
    /// # Postconditions
    /// - Root directory is created if it doesn't exist
    ///
    /// # Errors
    /// - Permission denied
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();

        if !root.exists() {
            std::fs::create_dir_all(&root)?;
        }

        Ok(Self { root })
    }

    /// Root directory of the folder.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory for device-local state, inside the root but hidden from sync.
    pub fn state_dir(&self) -> PathBuf {
        self.root.join(STATE_DIR_NAME)
    }

    /// Convert a FolderPath to a filesystem path.
    fn to_fs_path(&self, path: &FolderPath) -> PathBuf {
        let mut fs_path = self.root.clone();
        for component in path.components() {
            fs_path.push(component);
        }
        fs_path
    }

    fn create_metadata(&self, path: &FolderPath, fs_meta: std::fs::Metadata) -> Metadata {
        let modified: DateTime<Utc> = fs_meta
            .modified()
            .map(|t| t.into())
            .unwrap_or_else(|_| Utc::now());

        Metadata {
            path: path.clone(),
            size: if fs_meta.is_file() {
                Some(fs_meta.len())
            } else {
                None
            },
            is_directory: fs_meta.is_dir(),
            modified,
        }
    }

    async fn ensure_parent(&self, fs_path: &Path) -> Result<()> {
        if let Some(parent) = fs_path.parent() {
            if !parent.exists() {
                fs::create_dir_all(parent).await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl StorageProvider for LocalProvider {
    fn name(&self) -> &str {
        "local"
    }

    async fn exists(&self, path: &FolderPath) -> Result<bool> {
        Ok(fs::try_exists(self.to_fs_path(path)).await?)
    }

    async fn metadata(&self, path: &FolderPath) -> Result<Metadata> {
        let fs_path = self.to_fs_path(path);

        if !fs_path.exists() {
            return Err(Error::NotFound(format!("Path not found: {}", path)));
        }

        let fs_meta = fs::metadata(&fs_path).await?;
        Ok(self.create_metadata(path, fs_meta))
    }

    async fn read(&self, path: &FolderPath) -> Result<Vec<u8>> {
        let fs_path = self.to_fs_path(path);

        if !fs_path.exists() {
            return Err(Error::NotFound(format!("File not found: {}", path)));
        }

        if fs_path.is_dir() {
            return Err(Error::InvalidInput(format!("Cannot read directory: {}", path)));
        }

        Ok(fs::read(&fs_path).await?)
    }

    async fn write(&self, path: &FolderPath, data: Vec<u8>) -> Result<Metadata> {
        let fs_path = self.to_fs_path(path);
        self.ensure_parent(&fs_path).await?;

        fs::write(&fs_path, &data).await?;

        let fs_meta = fs::metadata(&fs_path).await?;
        Ok(self.create_metadata(path, fs_meta))
    }

    async fn read_chunk(&self, path: &FolderPath, offset: u64, len: usize) -> Result<Vec<u8>> {
        let fs_path = self.to_fs_path(path);

        if !fs_path.is_file() {
            return Err(Error::NotFound(format!("File not found: {}", path)));
        }

        let mut file = fs::File::open(&fs_path).await?;
        let file_len = file.metadata().await?.len();
        if offset >= file_len {
            return Ok(Vec::new());
        }

        let available = (file_len - offset).min(len as u64);
        file.seek(SeekFrom::Start(offset)).await?;

        let mut buffer = Vec::with_capacity(available as usize);
        file.take(available).read_to_end(&mut buffer).await?;
        Ok(buffer)
    }

    async fn write_chunk(&self, path: &FolderPath, offset: u64, data: &[u8]) -> Result<()> {
        let fs_path = self.to_fs_path(path);
        self.ensure_parent(&fs_path).await?;

        let mut file = fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&fs_path)
            .await?;
        file.seek(SeekFrom::Start(offset)).await?;
        file.write_all(data).await?;
        file.flush().await?;
        Ok(())
    }

    async fn truncate(&self, path: &FolderPath, len: u64) -> Result<()> {
        let fs_path = self.to_fs_path(path);
        self.ensure_parent(&fs_path).await?;

        let file = fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&fs_path)
            .await?;
        file.set_len(len).await?;
        Ok(())
    }

    async fn create_dir(&self, path: &FolderPath) -> Result<Metadata> {
        let fs_path = self.to_fs_path(path);

        if fs_path.is_file() {
            return Err(Error::AlreadyExists(format!(
                "Path exists as a file: {}",
                path
            )));
        }

        fs::create_dir_all(&fs_path).await?;

        let fs_meta = fs::metadata(&fs_path).await?;
        Ok(self.create_metadata(path, fs_meta))
    }

    async fn delete(&self, path: &FolderPath) -> Result<()> {
        if path.is_root() {
            return Err(Error::InvalidInput("Cannot delete the folder root".to_string()));
        }

        let fs_path = self.to_fs_path(path);

        if !fs_path.exists() {
            return Err(Error::NotFound(format!("Path not found: {}", path)));
        }

        if fs_path.is_dir() {
            fs::remove_dir_all(&fs_path).await?;
        } else {
            fs::remove_file(&fs_path).await?;
        }
        Ok(())
    }

    async fn rename(&self, from: &FolderPath, to: &FolderPath) -> Result<Metadata> {
        let from_path = self.to_fs_path(from);
        let to_path = self.to_fs_path(to);

        if !from_path.exists() {
            return Err(Error::NotFound(format!("Source not found: {}", from)));
        }

        if to_path.exists() {
            return Err(Error::AlreadyExists(format!(
                "Destination already exists: {}",
                to
            )));
        }

        self.ensure_parent(&to_path).await?;
        fs::rename(&from_path, &to_path).await?;

        let fs_meta = fs::metadata(&to_path).await?;
        Ok(self.create_metadata(to, fs_meta))
    }

    async fn list(&self, path: &FolderPath) -> Result<Vec<Metadata>> {
        let fs_path = self.to_fs_path(path);

        if !fs_path.exists() {
            return Err(Error::NotFound(format!("Directory not found: {}", path)));
        }

        if !fs_path.is_dir() {
            return Err(Error::InvalidInput(format!("Not a directory: {}", path)));
        }

        let mut results = Vec::new();
        let mut entries = fs::read_dir(&fs_path).await?;

        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if path.is_root() && name == STATE_DIR_NAME {
                continue;
            }

            let child = path.join(&name)?;
            let fs_meta = entry.metadata().await?;
            results.push(self.create_metadata(&child, fs_meta));
        }

        Ok(results)
    }
}
