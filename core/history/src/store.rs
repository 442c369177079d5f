//! The device-local version-history store.

use std::path::Path;
use tokio::fs;
use tracing::debug;

use crate::snapshot::{Snapshot, StoreMeta};
use crate::version::{FileVersion, PathHistory};
use peersync_common::{DeviceId, Error, FolderPath, Result};
use peersync_storage::ContentHash;

/// Mutable history of every tracked path on this device.
#[derive(Debug, Clone)]
pub struct HistoryStore {
    device: DeviceId,
    state: Snapshot,
}

impl HistoryStore {
    /// Create an empty store owned by `owner`, recording as `device`.
    pub fn new(device: DeviceId, owner: impl Into<String>) -> Self {
        Self {
            device,
            state: Snapshot::new(StoreMeta {
                owner: owner.into(),
                ..StoreMeta::default()
            }),
        }
    }

    /// Wrap an existing snapshot.
    pub fn from_snapshot(device: DeviceId, snapshot: Snapshot) -> Self {
        Self {
            device,
            state: snapshot,
        }
    }

    pub fn device(&self) -> &DeviceId {
        &self.device
    }

    pub fn meta(&self) -> &StoreMeta {
        &self.state.meta
    }

    pub fn meta_mut(&mut self) -> &mut StoreMeta {
        &mut self.state.meta
    }

    /// Owned copy of the current state.
    pub fn snapshot(&self) -> Snapshot {
        self.state.clone()
    }

    /// Borrow the current state.
    pub fn view(&self) -> &Snapshot {
        &self.state
    }

    pub fn history(&self, path: &FolderPath) -> Option<&PathHistory> {
        self.state.get(path)
    }

    pub fn last_version(&self, path: &FolderPath) -> Option<&FileVersion> {
        self.state.last_version(path)
    }

    /// Last known live checksum of a path.
    pub fn last_hash(&self, path: &FolderPath) -> Option<&ContentHash> {
        self.last_version(path).and_then(|v| v.live_hash())
    }

    /// Append a version to a path's chain.
    pub fn record_version(&mut self, path: &FolderPath, version: FileVersion) {
        debug!(
            "Recording version of {} from {} (deleted: {})",
            path, version.device, version.deleted
        );
        match self.state.get_mut(path) {
            Some(history) => history.push(version),
            None => self.state.insert(path.clone(), PathHistory::new(version)),
        }
    }

    /// Record content observed locally, skipping it if the head already matches.
    ///
    /// Returns whether a version was appended.
    pub fn record_local_change(
        &mut self,
        path: &FolderPath,
        hash: ContentHash,
        size: Option<u64>,
    ) -> bool {
        if let Some(last) = self.last_version(path) {
            if last.live_hash() == Some(&hash) {
                return false;
            }
        }

        let version = if hash.is_directory() {
            FileVersion::directory(self.device.clone())
        } else {
            FileVersion::file(hash, size.unwrap_or(0), self.device.clone())
        };
        self.record_version(path, version);
        true
    }

    /// Tombstone a path and everything tracked below it.
    pub fn record_deletion(&mut self, path: &FolderPath) {
        let affected: Vec<FolderPath> = self
            .state
            .paths()
            .filter(|p| *p == path || path.is_ancestor_of(p))
            .cloned()
            .collect();

        for target in affected {
            let Some(history) = self.state.get(&target) else {
                continue;
            };
            if !history.is_live() {
                continue;
            }
            let is_directory = history.last().map(|v| v.is_directory).unwrap_or(false);
            self.record_version(&target, FileVersion::tombstone(is_directory, self.device.clone()));
        }
    }

    /// Move a path's chain (and its subtree) to a new location.
    ///
    /// The old paths are tombstoned; each new path gets the old head as a
    /// fresh version produced by this device.
    ///
    /// # Errors
    /// - Source is not tracked or not live
    pub fn move_history(&mut self, from: &FolderPath, to: &FolderPath) -> Result<()> {
        if !self.state.get(from).map(|h| h.is_live()).unwrap_or(false) {
            return Err(Error::NotFound(format!("No live history for {}", from)));
        }

        let moved: Vec<(FolderPath, FileVersion)> = self
            .state
            .iter()
            .filter(|(p, h)| (*p == from || from.is_ancestor_of(p)) && h.is_live())
            .filter_map(|(p, h)| h.last().map(|v| (p.clone(), v.clone())))
            .collect();

        for (old_path, head) in moved {
            let suffix = &old_path.components()[from.depth()..];
            let mut components = to.components().to_vec();
            components.extend_from_slice(suffix);
            let new_path = FolderPath::from_components(components)?;

            let version = FileVersion {
                device: self.device.clone(),
                timestamp: chrono::Utc::now(),
                ..head
            };
            self.record_version(&new_path, version);
        }

        self.record_deletion(from);
        Ok(())
    }

    /// Replace a path's chain with one adopted from a peer.
    pub fn replace_history(&mut self, path: &FolderPath, history: PathHistory) {
        self.state.insert(path.clone(), history);
    }

    /// Drop a path's chain entirely.
    pub fn forget(&mut self, path: &FolderPath) -> Option<PathHistory> {
        self.state.remove(path)
    }

    /// Persist the store as an archive file.
    pub async fn save(&self, file: impl AsRef<Path>) -> Result<()> {
        let file = file.as_ref();
        if let Some(parent) = file.parent() {
            fs::create_dir_all(parent).await?;
        }

        let tmp = file.with_extension("tmp");
        fs::write(&tmp, self.state.encode()?).await?;
        fs::rename(&tmp, file).await?;
        Ok(())
    }

    /// Load a store persisted with `save`, or start empty if none exists.
    pub async fn load_or_new(
        file: impl AsRef<Path>,
        device: DeviceId,
        owner: impl Into<String>,
    ) -> Result<Self> {
        let file = file.as_ref();
        if !fs::try_exists(file).await? {
            return Ok(Self::new(device, owner));
        }

        let data = fs::read(file).await?;
        Ok(Self::from_snapshot(device, Snapshot::decode(&data)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn path(p: &str) -> FolderPath {
        FolderPath::parse(p).unwrap()
    }

    fn store() -> HistoryStore {
        HistoryStore::new(DeviceId::new("dev-a").unwrap(), "alice")
    }

    #[test]
    fn test_record_local_change_skips_same_content() {
        let mut store = store();
        let p = path("/a.txt");

        assert!(store.record_local_change(&p, ContentHash::of_bytes(b"1"), Some(1)));
        assert!(!store.record_local_change(&p, ContentHash::of_bytes(b"1"), Some(1)));
        assert!(store.record_local_change(&p, ContentHash::of_bytes(b"2"), Some(1)));

        assert_eq!(store.history(&p).unwrap().len(), 2);
        assert_eq!(store.last_hash(&p), Some(&ContentHash::of_bytes(b"2")));
    }

    #[test]
    fn test_record_deletion_tombstones_subtree() {
        let mut store = store();
        store.record_local_change(&path("/d"), ContentHash::directory(), None);
        store.record_local_change(&path("/d/x"), ContentHash::of_bytes(b"x"), Some(1));
        store.record_local_change(&path("/dx"), ContentHash::of_bytes(b"y"), Some(1));

        store.record_deletion(&path("/d"));

        assert!(!store.history(&path("/d")).unwrap().is_live());
        assert!(!store.history(&path("/d/x")).unwrap().is_live());
        assert!(store.history(&path("/dx")).unwrap().is_live());

        store.record_deletion(&path("/d"));
        assert_eq!(store.history(&path("/d/x")).unwrap().len(), 2);
    }

    #[test]
    fn test_move_history() {
        let mut store = store();
        store.record_local_change(&path("/d"), ContentHash::directory(), None);
        store.record_local_change(&path("/d/x"), ContentHash::of_bytes(b"x"), Some(1));

        store.move_history(&path("/d"), &path("/e")).unwrap();

        assert!(!store.history(&path("/d/x")).unwrap().is_live());
        assert_eq!(store.last_hash(&path("/e/x")), Some(&ContentHash::of_bytes(b"x")));
        assert!(store.last_version(&path("/e")).unwrap().is_directory);
        assert!(store.move_history(&path("/missing"), &path("/z")).is_err());
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let temp = TempDir::new().unwrap();
        let file = temp.path().join("state").join("history.bin");

        let mut original = store();
        original.record_local_change(&path("/a.txt"), ContentHash::of_bytes(b"1"), Some(1));
        original.save(&file).await.unwrap();

        let loaded = HistoryStore::load_or_new(&file, DeviceId::new("dev-a").unwrap(), "ignored")
            .await
            .unwrap();
        assert_eq!(loaded.snapshot(), original.snapshot());
        assert_eq!(loaded.meta().owner, "alice");

        let fresh = HistoryStore::load_or_new(temp.path().join("none"), DeviceId::new("d").unwrap(), "bob")
            .await
            .unwrap();
        assert!(fresh.view().is_empty());
    }
}
