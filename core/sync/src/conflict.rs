//! Conflict file materialization.
//!
//! A path whose chain diverged from a peer's keeps this device's content
//! under `<basename>_conflict_<deviceId>.<ext>` next to the original, so
//! the peer's content can take the original name without anything being
//! overwritten. The device id in the name keeps two devices that materialize
//! the same conflict at the same time from colliding.
//!
//! When that name is already taken by an earlier conflict on the same path,
//! the copy is numbered: `<basename>_conflict_<deviceId>_<n>.<ext>` with the
//! first free `n` from 2 on. Device ids cannot contain `.` or `_`, so both
//! forms parse back unambiguously.

use chrono::Utc;
use tracing::{info, warn};

use crate::device::DeviceContext;
use crate::events::{EventKind, FolderEvent};
use peersync_common::{DeviceId, Error, FolderPath, Result};
use peersync_history::FileVersion;

const MARKER: &str = "_conflict_";

/// Highest copy number tried before giving up on a path.
const MAX_CONFLICT_COPIES: u32 = 1000;

/// Split a file name into stem and extension (with its dot).
///
/// A leading dot belongs to the stem, so `.profile` has no extension.
fn split_extension(name: &str) -> (&str, &str) {
    match name.rfind('.') {
        Some(0) | None => (name, ""),
        Some(pos) => name.split_at(pos),
    }
}

/// Conflict file name for `name` materialized by `device`.
pub fn conflict_name(name: &str, device: &DeviceId) -> String {
    conflict_name_numbered(name, device, 1)
}

/// Conflict file name for the `copy`-th conflict on `name` by `device`.
///
/// Copy 1 is the plain conflict name; later copies carry `_<copy>`.
pub fn conflict_name_numbered(name: &str, device: &DeviceId, copy: u32) -> String {
    let (stem, ext) = split_extension(name);
    if copy <= 1 {
        format!("{}{}{}{}", stem, MARKER, device, ext)
    } else {
        format!("{}{}{}_{}{}", stem, MARKER, device, copy, ext)
    }
}

/// Recover the original name, the device and the copy number from a
/// conflict file name.
pub fn parse_conflict_name(name: &str) -> Option<(String, DeviceId, u32)> {
    let pos = name.rfind(MARKER)?;
    let (stem, rest) = name.split_at(pos);
    let rest = &rest[MARKER.len()..];

    let (tag, ext) = match rest.find('.') {
        Some(dot) => rest.split_at(dot),
        None => (rest, ""),
    };
    let (device, copy) = match tag.split_once('_') {
        Some((device, digits)) => {
            let copy: u32 = digits.parse().ok()?;
            // Only the form conflict_name_numbered writes: no sign, no leading zero.
            if copy < 2 || copy.to_string() != digits {
                return None;
            }
            (device, copy)
        }
        None => (tag, 1),
    };
    let device = DeviceId::new(device).ok()?;
    Some((format!("{}{}", stem, ext), device, copy))
}

/// Conflict path for `path` materialized by `device`.
pub fn conflict_path(path: &FolderPath, device: &DeviceId) -> Result<FolderPath> {
    conflict_path_numbered(path, device, 1)
}

fn conflict_path_numbered(path: &FolderPath, device: &DeviceId, copy: u32) -> Result<FolderPath> {
    let name = path.name().unwrap_or_default();
    path.with_name(&conflict_name_numbered(name, device, copy))
}

/// First conflict path for `path` that nothing occupies yet.
async fn free_conflict_path(ctx: &DeviceContext, path: &FolderPath) -> Result<FolderPath> {
    for copy in 1..=MAX_CONFLICT_COPIES {
        let target = conflict_path_numbered(path, &ctx.local.device, copy)?;
        if !ctx.provider.exists(&target).await? {
            return Ok(target);
        }
    }
    Err(Error::AlreadyExists(format!(
        "No free conflict name left for {}",
        path
    )))
}

/// Move this device's version of `path` aside as a conflict file.
///
/// Emits a suppressed move and a suppressed create before renaming, and
/// records the moved content's history at the new path. Returns `None` if
/// no conflict file was produced; the original is then left untouched.
pub async fn create_conflict_file(ctx: &DeviceContext, path: &FolderPath) -> Option<FolderPath> {
    match materialize(ctx, path).await {
        Ok(target) => {
            info!("Kept local {} as {}", path, target);
            Some(target)
        }
        Err(e) => {
            warn!("Could not create a conflict file for {}: {}", path, e);
            None
        }
    }
}

async fn materialize(ctx: &DeviceContext, path: &FolderPath) -> Result<FolderPath> {
    let head = ctx.store.read().await.last_version(path).cloned();
    let metadata = ctx.provider.metadata(path).await?;
    let target = free_conflict_path(ctx, path).await?;

    ctx.events.notify(
        FolderEvent::new(
            target.clone(),
            EventKind::Moved { from: path.clone() },
            metadata.is_directory,
        )
        .suppressed(),
    );
    ctx.events.notify(
        FolderEvent::new(target.clone(), EventKind::Created, metadata.is_directory).suppressed(),
    );

    ctx.provider.rename(path, &target).await?;

    // Untracked content gets hashed from disk instead.
    match head.filter(|v| !v.is_tombstone()) {
        Some(version) => {
            let version = FileVersion {
                device: ctx.local.device.clone(),
                timestamp: Utc::now(),
                ..version
            };
            ctx.store.write().await.record_version(&target, version);
        }
        None => {
            if let Some(hash) = ctx.disk_hash(&target).await? {
                ctx.store
                    .write()
                    .await
                    .record_local_change(&target, hash, metadata.size);
            }
        }
    }
    Ok(target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Cluster;
    use peersync_storage::{ContentHash, StorageProvider};
    use proptest::prelude::*;

    fn device(name: &str) -> DeviceId {
        DeviceId::new(name).unwrap()
    }

    fn path(p: &str) -> FolderPath {
        FolderPath::parse(p).unwrap()
    }

    #[test]
    fn test_conflict_name_keeps_extension() {
        assert_eq!(conflict_name("report.txt", &device("A1")), "report_conflict_A1.txt");
        assert_eq!(conflict_name("archive.tar.gz", &device("x")), "archive.tar_conflict_x.gz");
        assert_eq!(conflict_name("Makefile", &device("x")), "Makefile_conflict_x");
        assert_eq!(conflict_name(".profile", &device("x")), ".profile_conflict_x");
    }

    #[test]
    fn test_numbered_conflict_name_parses_back() {
        let id = device("a");
        assert_eq!(conflict_name_numbered("r.txt", &id, 1), "r_conflict_a.txt");
        assert_eq!(conflict_name_numbered("r.txt", &id, 2), "r_conflict_a_2.txt");
        assert_eq!(
            parse_conflict_name("r_conflict_a_2.txt"),
            Some(("r.txt".to_string(), id.clone(), 2))
        );
        assert_eq!(
            parse_conflict_name("r_conflict_a.txt"),
            Some(("r.txt".to_string(), id, 1))
        );
        assert_eq!(parse_conflict_name("r_conflict_a_02.txt"), None);
        assert_eq!(parse_conflict_name("r_conflict_a_1.txt"), None);
        assert_eq!(parse_conflict_name("r_conflict_a_x.txt"), None);
    }

    #[test]
    fn test_conflict_path_stays_in_directory() {
        let target = conflict_path(&path("/docs/report.txt"), &device("a")).unwrap();
        assert_eq!(target.to_string(), "/docs/report_conflict_a.txt");
    }

    #[tokio::test]
    async fn test_create_conflict_file_emits_events_then_renames() {
        let cluster = Cluster::new(&["a"]).await;
        let ctx = cluster.ctx("a");
        let original = path("/docs/report.txt");
        cluster.provider("a").write(&original, b"mine".to_vec()).await.unwrap();
        ctx.record_local_changes().await.unwrap();
        let mut events = ctx.events.subscribe();

        let target = create_conflict_file(ctx, &original).await.unwrap();
        assert_eq!(target.to_string(), "/docs/report_conflict_a.txt");

        let moved = events.recv().await.unwrap();
        assert_eq!(moved.kind, EventKind::Moved { from: original.clone() });
        assert!(moved.suppressed);
        let created = events.recv().await.unwrap();
        assert_eq!(created.kind, EventKind::Created);
        assert!(created.suppressed);

        assert!(!cluster.provider("a").exists(&original).await.unwrap());
        assert_eq!(cluster.provider("a").read(&target).await.unwrap(), b"mine");
        assert_eq!(
            ctx.store.read().await.last_hash(&target),
            Some(&ContentHash::of_bytes(b"mine"))
        );
    }

    #[tokio::test]
    async fn test_second_conflict_takes_next_copy() {
        let cluster = Cluster::new(&["a"]).await;
        let ctx = cluster.ctx("a");
        let original = path("/r.txt");

        cluster.provider("a").write(&original, b"mine".to_vec()).await.unwrap();
        let first = create_conflict_file(ctx, &original).await.unwrap();
        assert_eq!(first.to_string(), "/r_conflict_a.txt");

        cluster.provider("a").write(&original, b"mine2".to_vec()).await.unwrap();
        let second = create_conflict_file(ctx, &original).await.unwrap();
        assert_eq!(second.to_string(), "/r_conflict_a_2.txt");

        assert_eq!(cluster.provider("a").read(&first).await.unwrap(), b"mine");
        assert_eq!(cluster.provider("a").read(&second).await.unwrap(), b"mine2");
        assert!(!cluster.provider("a").exists(&original).await.unwrap());
    }

    #[tokio::test]
    async fn test_failed_rename_returns_none() {
        let cluster = Cluster::new(&["a"]).await;
        let original = path("/r.txt");
        cluster.provider("a").write(&original, b"mine".to_vec()).await.unwrap();
        cluster.provider("a").set_fail_writes(true);

        assert!(create_conflict_file(cluster.ctx("a"), &original).await.is_none());
        cluster.provider("a").set_fail_writes(false);
        assert_eq!(cluster.provider("a").read(&original).await.unwrap(), b"mine");
    }

    #[tokio::test]
    async fn test_missing_path_returns_none() {
        let cluster = Cluster::new(&["a"]).await;
        assert!(create_conflict_file(cluster.ctx("a"), &path("/gone")).await.is_none());
    }

    fn arb_name() -> impl Strategy<Value = String> {
        ("[a-zA-Z0-9 ]{1,12}", proptest::option::of("[a-z0-9]{1,4}")).prop_map(|(stem, ext)| {
            match ext {
                Some(ext) => format!("{}.{}", stem, ext),
                None => stem,
            }
        })
    }

    proptest! {
        #[test]
        fn prop_conflict_name_round_trips(
            name in arb_name(),
            id in "[a-zA-Z0-9._-]{1,10}",
            copy in 1u32..50,
        ) {
            // Ids that could blur the name never get this far.
            let Ok(id) = DeviceId::new(id.clone()) else {
                prop_assert!(id.contains('.') || id.contains('_'));
                return Ok(());
            };
            let conflict = conflict_name_numbered(&name, &id, copy);
            let (original, parsed, parsed_copy) = parse_conflict_name(&conflict).unwrap();
            prop_assert_eq!(original, name);
            prop_assert_eq!(parsed, id);
            prop_assert_eq!(parsed_copy, copy);
        }

        #[test]
        fn prop_devices_never_collide(name in arb_name(), a in "[a-z0-9-]{1,8}", b in "[a-z0-9-]{1,8}") {
            prop_assume!(a != b);
            prop_assert_ne!(conflict_name(&name, &device(&a)), conflict_name(&name, &device(&b)));
        }
    }
}
