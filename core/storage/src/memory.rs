//! In-memory storage provider for testing.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::provider::{Metadata, StorageProvider};
use crate::STATE_DIR_NAME;
use peersync_common::{Error, FolderPath, Result};

/// In-memory storage entry.
#[derive(Debug, Clone)]
enum Entry {
    File { data: Vec<u8>, modified: DateTime<Utc> },
    Directory { modified: DateTime<Utc> },
}

impl Entry {
    fn metadata(&self, path: &FolderPath) -> Metadata {
        match self {
            Entry::File { data, modified } => Metadata {
                path: path.clone(),
                size: Some(data.len() as u64),
                is_directory: false,
                modified: *modified,
            },
            Entry::Directory { modified } => Metadata {
                path: path.clone(),
                size: None,
                is_directory: true,
                modified: *modified,
            },
        }
    }
}

/// In-memory storage provider.
///
/// Useful for testing. All data is lost on drop. Clones share the same
/// underlying folder. Writes can be made to fail on demand to exercise local
/// I/O fault handling.
#[derive(Clone)]
pub struct MemoryProvider {
    storage: Arc<RwLock<BTreeMap<FolderPath, Entry>>>,
    fail_writes: Arc<AtomicBool>,
}

impl MemoryProvider {
    /// Create a new empty memory provider.
    pub fn new() -> Self {
        let mut storage = BTreeMap::new();
        storage.insert(
            FolderPath::root(),
            Entry::Directory {
                modified: Utc::now(),
            },
        );

        Self {
            storage: Arc::new(RwLock::new(storage)),
            fail_writes: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Make every mutating call fail with an I/O error until reset.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn read_lock(&self) -> Result<RwLockReadGuard<'_, BTreeMap<FolderPath, Entry>>> {
        self.storage
            .read()
            .map_err(|_| Error::Storage("Memory storage lock poisoned".to_string()))
    }

    fn write_lock(&self) -> Result<RwLockWriteGuard<'_, BTreeMap<FolderPath, Entry>>> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                "writes disabled",
            )));
        }
        self.storage
            .write()
            .map_err(|_| Error::Storage("Memory storage lock poisoned".to_string()))
    }

    fn ensure_parents(
        storage: &mut BTreeMap<FolderPath, Entry>,
        path: &FolderPath,
    ) -> Result<()> {
        for ancestor in path.ancestors() {
            match storage.get(&ancestor) {
                Some(Entry::Directory { .. }) => {}
                Some(Entry::File { .. }) => {
                    return Err(Error::AlreadyExists(format!(
                        "Parent exists as a file: {}",
                        ancestor
                    )));
                }
                None => {
                    storage.insert(
                        ancestor,
                        Entry::Directory {
                            modified: Utc::now(),
                        },
                    );
                }
            }
        }
        Ok(())
    }

    fn file_mut<'a>(
        storage: &'a mut BTreeMap<FolderPath, Entry>,
        path: &FolderPath,
    ) -> Result<&'a mut Vec<u8>> {
        Self::ensure_parents(storage, path)?;
        let entry = storage.entry(path.clone()).or_insert_with(|| Entry::File {
            data: Vec::new(),
            modified: Utc::now(),
        });
        match entry {
            Entry::File { data, modified } => {
                *modified = Utc::now();
                Ok(data)
            }
            Entry::Directory { .. } => Err(Error::InvalidInput(format!(
                "Path is a directory: {}",
                path
            ))),
        }
    }

    fn subtree(storage: &BTreeMap<FolderPath, Entry>, path: &FolderPath) -> Vec<FolderPath> {
        storage
            .keys()
            .filter(|key| *key == path || path.is_ancestor_of(key))
            .cloned()
            .collect()
    }
}

impl Default for MemoryProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StorageProvider for MemoryProvider {
    fn name(&self) -> &str {
        "memory"
    }

    async fn exists(&self, path: &FolderPath) -> Result<bool> {
        Ok(self.read_lock()?.contains_key(path))
    }

    async fn metadata(&self, path: &FolderPath) -> Result<Metadata> {
        let storage = self.read_lock()?;
        storage
            .get(path)
            .map(|entry| entry.metadata(path))
            .ok_or_else(|| Error::NotFound(format!("Path not found: {}", path)))
    }

    async fn read(&self, path: &FolderPath) -> Result<Vec<u8>> {
        let storage = self.read_lock()?;
        match storage.get(path) {
            Some(Entry::File { data, .. }) => Ok(data.clone()),
            Some(Entry::Directory { .. }) => Err(Error::InvalidInput(format!(
                "Cannot read directory: {}",
                path
            ))),
            None => Err(Error::NotFound(format!("File not found: {}", path))),
        }
    }

    async fn write(&self, path: &FolderPath, data: Vec<u8>) -> Result<Metadata> {
        let mut storage = self.write_lock()?;
        let file = Self::file_mut(&mut storage, path)?;
        *file = data;
        Ok(storage
            .get(path)
            .map(|entry| entry.metadata(path))
            .ok_or_else(|| Error::Storage(format!("Write lost: {}", path)))?)
    }

    async fn read_chunk(&self, path: &FolderPath, offset: u64, len: usize) -> Result<Vec<u8>> {
        let storage = self.read_lock()?;
        match storage.get(path) {
            Some(Entry::File { data, .. }) => {
                let start = (offset as usize).min(data.len());
                let end = start.saturating_add(len).min(data.len());
                Ok(data[start..end].to_vec())
            }
            Some(Entry::Directory { .. }) => Err(Error::InvalidInput(format!(
                "Cannot read directory: {}",
                path
            ))),
            None => Err(Error::NotFound(format!("File not found: {}", path))),
        }
    }

    async fn write_chunk(&self, path: &FolderPath, offset: u64, chunk: &[u8]) -> Result<()> {
        let mut storage = self.write_lock()?;
        let data = Self::file_mut(&mut storage, path)?;
        let start = offset as usize;
        let end = start + chunk.len();
        if data.len() < end {
            data.resize(end, 0);
        }
        data[start..end].copy_from_slice(chunk);
        Ok(())
    }

    async fn truncate(&self, path: &FolderPath, len: u64) -> Result<()> {
        let mut storage = self.write_lock()?;
        let data = Self::file_mut(&mut storage, path)?;
        data.resize(len as usize, 0);
        Ok(())
    }

    async fn create_dir(&self, path: &FolderPath) -> Result<Metadata> {
        let mut storage = self.write_lock()?;
        if let Some(Entry::File { .. }) = storage.get(path) {
            return Err(Error::AlreadyExists(format!(
                "Path exists as a file: {}",
                path
            )));
        }

        Self::ensure_parents(&mut storage, path)?;
        let entry = storage
            .entry(path.clone())
            .or_insert_with(|| Entry::Directory {
                modified: Utc::now(),
            });
        Ok(entry.metadata(path))
    }

    async fn delete(&self, path: &FolderPath) -> Result<()> {
        if path.is_root() {
            return Err(Error::InvalidInput("Cannot delete the folder root".to_string()));
        }

        let mut storage = self.write_lock()?;
        if !storage.contains_key(path) {
            return Err(Error::NotFound(format!("Path not found: {}", path)));
        }

        for key in Self::subtree(&storage, path) {
            storage.remove(&key);
        }
        Ok(())
    }

    async fn rename(&self, from: &FolderPath, to: &FolderPath) -> Result<Metadata> {
        let mut storage = self.write_lock()?;

        if !storage.contains_key(from) {
            return Err(Error::NotFound(format!("Source not found: {}", from)));
        }
        if storage.contains_key(to) {
            return Err(Error::AlreadyExists(format!(
                "Destination already exists: {}",
                to
            )));
        }

        Self::ensure_parents(&mut storage, to)?;
        for key in Self::subtree(&storage, from) {
            let suffix = &key.components()[from.depth()..];
            let mut components = to.components().to_vec();
            components.extend_from_slice(suffix);
            let moved = FolderPath::from_components(components)?;
            if let Some(entry) = storage.remove(&key) {
                storage.insert(moved, entry);
            }
        }

        storage
            .get(to)
            .map(|entry| entry.metadata(to))
            .ok_or_else(|| Error::Storage(format!("Rename lost: {}", to)))
    }

    async fn list(&self, path: &FolderPath) -> Result<Vec<Metadata>> {
        let storage = self.read_lock()?;
        match storage.get(path) {
            Some(Entry::Directory { .. }) => {}
            Some(Entry::File { .. }) => {
                return Err(Error::InvalidInput(format!("Not a directory: {}", path)));
            }
            None => return Err(Error::NotFound(format!("Directory not found: {}", path))),
        }

        Ok(storage
            .iter()
            .filter(|(key, _)| key.parent().as_ref() == Some(path))
            .filter(|(key, _)| !(path.is_root() && key.name() == Some(STATE_DIR_NAME)))
            .map(|(key, entry)| entry.metadata(key))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(p: &str) -> FolderPath {
        FolderPath::parse(p).unwrap()
    }

    #[tokio::test]
    async fn test_write_creates_parents() {
        let provider = MemoryProvider::new();
        provider.write(&path("/a/b/c.txt"), b"data".to_vec()).await.unwrap();

        assert!(provider.metadata(&path("/a/b")).await.unwrap().is_directory);
        assert_eq!(provider.read(&path("/a/b/c.txt")).await.unwrap(), b"data".to_vec());
    }

    #[tokio::test]
    async fn test_chunks_and_truncate() {
        let provider = MemoryProvider::new();
        let p = path("/f.bin");

        provider.write_chunk(&p, 3, b"xyz").await.unwrap();
        assert_eq!(provider.read(&p).await.unwrap(), vec![0, 0, 0, b'x', b'y', b'z']);
        assert_eq!(provider.read_chunk(&p, 4, 10).await.unwrap(), b"yz".to_vec());
        assert!(provider.read_chunk(&p, 40, 10).await.unwrap().is_empty());

        provider.truncate(&p, 0).await.unwrap();
        assert!(provider.read(&p).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rename_moves_subtree() {
        let provider = MemoryProvider::new();
        provider.write(&path("/d/x.txt"), vec![1]).await.unwrap();
        provider.write(&path("/d/e/y.txt"), vec![2]).await.unwrap();

        provider.rename(&path("/d"), &path("/m")).await.unwrap();

        assert!(!provider.exists(&path("/d")).await.unwrap());
        assert_eq!(provider.read(&path("/m/e/y.txt")).await.unwrap(), vec![2]);
        assert_eq!(provider.walk().await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_delete_subtree() {
        let provider = MemoryProvider::new();
        provider.write(&path("/d/e/y.txt"), vec![2]).await.unwrap();
        provider.write(&path("/dx.txt"), vec![3]).await.unwrap();

        provider.delete(&path("/d")).await.unwrap();
        let left: Vec<String> = provider
            .walk()
            .await
            .unwrap()
            .iter()
            .map(|m| m.path.to_string())
            .collect();
        assert_eq!(left, vec!["/dx.txt"]);
    }

    #[tokio::test]
    async fn test_fail_writes() {
        let provider = MemoryProvider::new();
        provider.set_fail_writes(true);
        assert!(matches!(
            provider.write(&path("/a"), vec![1]).await,
            Err(Error::Io(_))
        ));
        provider.set_fail_writes(false);
        provider.write(&path("/a"), vec![1]).await.unwrap();
    }

    #[tokio::test]
    async fn test_state_dir_hidden_from_walk() {
        let provider = MemoryProvider::new();
        provider.write(&path("/.peersync/partial/x"), vec![1]).await.unwrap();
        provider.write(&path("/seen.txt"), vec![2]).await.unwrap();

        let walked: Vec<String> = provider
            .walk()
            .await
            .unwrap()
            .iter()
            .map(|m| m.path.to_string())
            .collect();
        assert_eq!(walked, vec!["/seen.txt"]);
        assert!(provider.exists(&path("/.peersync/partial/x")).await.unwrap());
    }
}
