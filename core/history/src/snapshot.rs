//! Owned, serializable copies of the history store.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::archive::{Archive, ArchiveEntry};
use crate::version::{FileVersion, PathHistory};
use peersync_common::{Error, FolderPath, Result};

const META_ENTRY: &str = ".store.json";
const HISTORY_SUFFIX: &str = ".history";

/// Ownership and access metadata of a synchronized folder.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreMeta {
    /// User that owns the folder.
    pub owner: String,
    /// Other users the folder is shared with.
    pub sharers: Vec<String>,
    /// Whether sharers may write, or only read.
    pub sharers_can_write: bool,
}

/// A point-in-time copy of every tracked path's version chain.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    pub meta: StoreMeta,
    entries: BTreeMap<FolderPath, PathHistory>,
}

impl Snapshot {
    pub fn new(meta: StoreMeta) -> Self {
        Self {
            meta,
            entries: BTreeMap::new(),
        }
    }

    pub fn get(&self, path: &FolderPath) -> Option<&PathHistory> {
        self.entries.get(path)
    }

    pub(crate) fn get_mut(&mut self, path: &FolderPath) -> Option<&mut PathHistory> {
        self.entries.get_mut(path)
    }

    pub fn last_version(&self, path: &FolderPath) -> Option<&FileVersion> {
        self.entries.get(path).and_then(|h| h.last())
    }

    pub fn insert(&mut self, path: FolderPath, history: PathHistory) {
        self.entries.insert(path, history);
    }

    pub fn remove(&mut self, path: &FolderPath) -> Option<PathHistory> {
        self.entries.remove(path)
    }

    pub fn contains(&self, path: &FolderPath) -> bool {
        self.entries.contains_key(path)
    }

    /// Tracked paths, shallowest first.
    pub fn paths(&self) -> impl Iterator<Item = &FolderPath> {
        self.entries.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&FolderPath, &PathHistory)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Every path present in either snapshot, shallowest first.
    pub fn union_paths(&self, other: &Snapshot) -> Vec<FolderPath> {
        let all: BTreeSet<&FolderPath> = self.entries.keys().chain(other.entries.keys()).collect();
        all.into_iter().cloned().collect()
    }

    /// Pack the snapshot as the store's backing files.
    ///
    /// Each tracked path `p` becomes a file entry `p.history` holding its JSON
    /// chain, every directory those files sit in becomes a marker entry, and
    /// the store metadata goes into `.store.json`.
    pub fn to_archive(&self) -> Result<Archive> {
        let mut archive = Archive::new();
        archive.push(ArchiveEntry::file(META_ENTRY, serde_json::to_vec(&self.meta)?));

        let mut directories: BTreeSet<FolderPath> = BTreeSet::new();
        for path in self.entries.keys() {
            directories.extend(path.ancestors());
        }
        for dir in directories {
            archive.push(ArchiveEntry::directory(dir.to_relative()));
        }

        for (path, history) in &self.entries {
            archive.push(ArchiveEntry::file(
                format!("{}{}", path.to_relative(), HISTORY_SUFFIX),
                serde_json::to_vec(history)?,
            ));
        }

        Ok(archive)
    }

    /// Rebuild a snapshot from its archived backing files.
    ///
    /// # Errors
    /// - Missing store metadata
    /// - Entries that are neither metadata, directory markers nor chains
    /// - Malformed JSON
    pub fn from_archive(archive: &Archive) -> Result<Self> {
        let meta_entry = archive
            .file(META_ENTRY)
            .ok_or_else(|| Error::Serialization("Snapshot archive lacks store metadata".to_string()))?;
        let meta: StoreMeta = serde_json::from_slice(&meta_entry.content)?;

        let mut entries = BTreeMap::new();
        for entry in &archive.entries {
            if entry.is_directory || entry.path == META_ENTRY {
                continue;
            }
            let tracked = entry.path.strip_suffix(HISTORY_SUFFIX).ok_or_else(|| {
                Error::Serialization(format!("Unexpected snapshot entry '{}'", entry.path))
            })?;
            let path = FolderPath::parse(tracked)?;
            let history: PathHistory = serde_json::from_slice(&entry.content)?;
            entries.insert(path, history);
        }

        Ok(Self { meta, entries })
    }

    /// Archive bytes, ready for the wire or the disk.
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(self.to_archive()?.encode())
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        Self::from_archive(&Archive::decode(data)?)
    }
}
