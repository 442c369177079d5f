//! Build a snapshot from what is actually on disk.

use tracing::debug;

use crate::snapshot::Snapshot;
use crate::version::{FileVersion, PathHistory};
use peersync_common::{DeviceId, Result};
use peersync_storage::{content_hash, StorageProvider};

/// Scan a folder and describe it relative to a previous snapshot.
///
/// Paths whose on-disk content matches their last live version keep their
/// chain untouched. Changed or new paths get a version produced by `device`
/// appended, and paths that were live before but are gone get a tombstone.
/// Paths that were already tombstoned and are still absent are carried over
/// as they are.
pub async fn scan_folder<P: StorageProvider + ?Sized>(
    provider: &P,
    previous: &Snapshot,
    device: &DeviceId,
) -> Result<Snapshot> {
    let mut scanned = Snapshot::new(previous.meta.clone());

    for entry in provider.walk().await? {
        let hash = content_hash(provider, &entry.path).await?;
        let mut history = previous.get(&entry.path).cloned().unwrap_or_default();

        let unchanged = history
            .last()
            .and_then(|v| v.live_hash())
            .map(|h| *h == hash)
            .unwrap_or(false);
        if !unchanged {
            debug!("Scan found new content at {}", entry.path);
            let version = if entry.is_directory {
                FileVersion::directory(device.clone())
            } else {
                FileVersion::file(hash, entry.size.unwrap_or(0), device.clone())
            };
            history.push(version);
        }

        scanned.insert(entry.path, history);
    }

    for (path, history) in previous.iter() {
        if scanned.contains(path) {
            continue;
        }
        let mut history: PathHistory = history.clone();
        if history.is_live() {
            debug!("Scan found {} missing", path);
            let is_directory = history.last().map(|v| v.is_directory).unwrap_or(false);
            history.push(FileVersion::tombstone(is_directory, device.clone()));
        }
        scanned.insert(path.clone(), history);
    }

    Ok(scanned)
}
