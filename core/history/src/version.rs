//! Versions, per-path chains and lineage comparison.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use peersync_common::DeviceId;
use peersync_storage::ContentHash;

/// One entry in a path's version chain.
///
/// Two versions are the same version only if every field matches; this is
/// the identity lineage comparison works with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileVersion {
    /// Content checksum, `None` for tombstones.
    pub hash: Option<ContentHash>,
    /// File size in bytes (None for directories and tombstones).
    pub size: Option<u64>,
    pub is_directory: bool,
    /// Explicit deletion marker.
    pub deleted: bool,
    /// Device that produced this version.
    pub device: DeviceId,
    pub timestamp: DateTime<Utc>,
}

impl FileVersion {
    /// A new file version.
    pub fn file(hash: ContentHash, size: u64, device: DeviceId) -> Self {
        Self {
            hash: Some(hash),
            size: Some(size),
            is_directory: false,
            deleted: false,
            device,
            timestamp: Utc::now(),
        }
    }

    /// A new directory version.
    pub fn directory(device: DeviceId) -> Self {
        Self {
            hash: Some(ContentHash::directory()),
            size: None,
            is_directory: true,
            deleted: false,
            device,
            timestamp: Utc::now(),
        }
    }

    /// A tombstone for a path that used to be a file or directory.
    pub fn tombstone(is_directory: bool, device: DeviceId) -> Self {
        Self {
            hash: None,
            size: None,
            is_directory,
            deleted: true,
            device,
            timestamp: Utc::now(),
        }
    }

    pub fn is_tombstone(&self) -> bool {
        self.deleted
    }

    /// Checksum of live content, `None` for tombstones.
    pub fn live_hash(&self) -> Option<&ContentHash> {
        if self.deleted {
            None
        } else {
            self.hash.as_ref()
        }
    }
}

/// How two chains for the same path relate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lineage {
    /// Identical chains.
    Equal,
    /// The remote chain strictly extends the local one.
    RemoteAhead,
    /// The local chain strictly extends the remote one.
    LocalAhead,
    /// Both advanced past their last common version.
    Diverged,
}

/// The append-only version chain of one path.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathHistory {
    pub versions: Vec<FileVersion>,
}

impl PathHistory {
    pub fn new(first: FileVersion) -> Self {
        Self {
            versions: vec![first],
        }
    }

    pub fn last(&self) -> Option<&FileVersion> {
        self.versions.last()
    }

    pub fn push(&mut self, version: FileVersion) {
        self.versions.push(version);
    }

    pub fn len(&self) -> usize {
        self.versions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }

    /// Whether the head of the chain is live content.
    pub fn is_live(&self) -> bool {
        self.last().map(|v| !v.is_tombstone()).unwrap_or(false)
    }

    /// Number of leading versions both chains share.
    pub fn common_prefix_len(&self, other: &PathHistory) -> usize {
        self.versions
            .iter()
            .zip(other.versions.iter())
            .take_while(|(a, b)| a == b)
            .count()
    }

    /// Compare this (local) chain against a remote chain.
    ///
    /// Containment decides: a chain that holds the other as a strict prefix is
    /// ahead, and anything else past the shared prefix has diverged.
    pub fn compare(&self, remote: &PathHistory) -> Lineage {
        let common = self.common_prefix_len(remote);
        let (local_len, remote_len) = (self.len(), remote.len());

        if common == local_len && common == remote_len {
            Lineage::Equal
        } else if common == local_len {
            Lineage::RemoteAhead
        } else if common == remote_len {
            Lineage::LocalAhead
        } else {
            Lineage::Diverged
        }
    }
}
