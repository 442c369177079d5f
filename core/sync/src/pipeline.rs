//! Snapshot fetch and merge classification.
//!
//! The pipeline never touches the folder. It fetches every reachable peer's
//! snapshot, folds each one into the local history store, and reports per
//! path what the folder has to do: nothing, fetch, delete, or surface a
//! conflict. Path maps iterate shallowest first, so acting on them in order
//! always handles a directory before anything inside it.

use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, warn};

use crate::device::DeviceContext;
use crate::events::{EventKind, FolderEvent};
use peersync_common::{FolderPath, PeerRef, Result};
use peersync_history::{FileVersion, HistoryStore, Lineage, PathHistory, Snapshot};
use peersync_net::Message;
use peersync_storage::ContentHash;

/// Per-path outcome of comparing a local chain with a remote one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Unchanged,
    Changed,
    Deleted,
    Conflict,
}

/// Classification plus whether the local store should take the remote chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Verdict {
    pub classification: Classification,
    pub adopt: bool,
}

impl Verdict {
    fn keep() -> Self {
        Self {
            classification: Classification::Unchanged,
            adopt: false,
        }
    }

    fn adopt(classification: Classification) -> Self {
        Self {
            classification,
            adopt: true,
        }
    }
}

/// Compare the local and remote chains of one path.
///
/// A path missing remotely is never a deletion; only explicit tombstones
/// delete. Diverged chains whose heads agree (same content, or both deleted)
/// are left alone, as is a local directory the remote deleted on a branch
/// of its own. A local deletion that diverged from a remote edit yields to
/// the edit.
pub fn classify(local: Option<&PathHistory>, remote: Option<&PathHistory>) -> Verdict {
    let remote = match remote.filter(|h| !h.is_empty()) {
        Some(remote) => remote,
        None => return Verdict::keep(),
    };
    let remote_head = match remote.last() {
        Some(head) => head,
        None => return Verdict::keep(),
    };

    let local = match local.filter(|h| !h.is_empty()) {
        Some(local) => local,
        None if remote_head.is_tombstone() => return Verdict::adopt(Classification::Unchanged),
        None => return Verdict::adopt(Classification::Changed),
    };
    let local_head = match local.last() {
        Some(head) => head,
        None => return Verdict::keep(),
    };

    match local.compare(remote) {
        Lineage::Equal | Lineage::LocalAhead => Verdict::keep(),
        Lineage::RemoteAhead => {
            if remote_head.is_tombstone() {
                if local_head.is_tombstone() {
                    Verdict::adopt(Classification::Unchanged)
                } else {
                    Verdict::adopt(Classification::Deleted)
                }
            } else if local_head.live_hash() == remote_head.live_hash() {
                Verdict::adopt(Classification::Unchanged)
            } else {
                Verdict::adopt(Classification::Changed)
            }
        }
        Lineage::Diverged => match (local_head.is_tombstone(), remote_head.is_tombstone()) {
            (true, true) => Verdict::keep(),
            (true, false) => Verdict::adopt(Classification::Changed),
            (false, true) if local_head.is_directory => Verdict::keep(),
            (false, false) if local_head.live_hash() == remote_head.live_hash() => Verdict::keep(),
            _ => Verdict {
                classification: Classification::Conflict,
                adopt: false,
            },
        },
    }
}

/// What the folder needs to do about one path, and where to get it.
#[derive(Debug, Clone)]
pub struct MergeEntry {
    /// Device whose snapshot produced this entry.
    pub source: PeerRef,
    /// Local checksum of the path before the merge, `None` if it had no live
    /// content. The folder must still match this for the action to apply.
    pub expected_local: Option<ContentHash>,
    /// Local chain before the merge, restored if the action fails.
    pub previous: Option<PathHistory>,
    /// The remote chain.
    pub remote: PathHistory,
}

impl MergeEntry {
    /// Version the path should end up at.
    pub fn target(&self) -> Option<&FileVersion> {
        self.remote.last()
    }

    /// Checksum the path should end up with, `None` for deletions.
    pub fn target_hash(&self) -> Option<&ContentHash> {
        self.target().and_then(|v| v.live_hash())
    }
}

/// Classified paths of one merge call.
#[derive(Debug, Clone, Default)]
pub struct MergeResult {
    pub unchanged: BTreeSet<FolderPath>,
    pub changed: BTreeMap<FolderPath, MergeEntry>,
    pub deleted: BTreeMap<FolderPath, MergeEntry>,
    pub conflict: BTreeMap<FolderPath, MergeEntry>,
}

impl MergeResult {
    /// Number of classified paths.
    pub fn len(&self) -> usize {
        self.unchanged.len() + self.changed.len() + self.deleted.len() + self.conflict.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Merge one peer's snapshot into the local store.
///
/// Remote chains are adopted for changed and deleted paths. Conflicting
/// paths keep their local chain until the conflict is materialized.
pub fn merge_one(store: &mut HistoryStore, remote: &Snapshot, source: &PeerRef) -> MergeResult {
    let mut result = MergeResult::default();

    for path in store.view().union_paths(remote) {
        let local = store.history(&path);
        let remote_history = remote.get(&path);
        let verdict = classify(local, remote_history);

        let entry = remote_history.map(|h| MergeEntry {
            source: source.clone(),
            expected_local: store.last_hash(&path).cloned(),
            previous: local.cloned(),
            remote: h.clone(),
        });

        if verdict.adopt {
            if let Some(history) = remote_history {
                store.replace_history(&path, history.clone());
            }
        }

        match (verdict.classification, entry) {
            (Classification::Changed, Some(entry)) => {
                result.changed.insert(path, entry);
            }
            (Classification::Deleted, Some(entry)) => {
                result.deleted.insert(path, entry);
            }
            (Classification::Conflict, Some(entry)) => {
                result.conflict.insert(path, entry);
            }
            _ => {
                result.unchanged.insert(path);
            }
        }
    }

    debug!(
        "Merged snapshot of {}: {} changed, {} deleted, {} conflicting, {} unchanged",
        source,
        result.changed.len(),
        result.deleted.len(),
        result.conflict.len(),
        result.unchanged.len()
    );
    result
}

/// Accumulated work of a run across every merged peer.
#[derive(Debug, Clone, Default)]
pub struct ReconcilePlan {
    pub to_delete: BTreeMap<FolderPath, MergeEntry>,
    pub to_update: BTreeMap<FolderPath, MergeEntry>,
    pub to_conflict: BTreeMap<FolderPath, MergeEntry>,
}

impl ReconcilePlan {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one merge result into the plan.
    ///
    /// Later merges override earlier ones for the same path, except that a
    /// conflict stays a conflict. The expected local checksum is the one
    /// seen first, since only that one describes the folder.
    pub fn absorb(&mut self, result: MergeResult) {
        for (path, entry) in result.conflict {
            let entry = self.keep_first_expectation(&path, entry);
            self.to_delete.remove(&path);
            self.to_update.remove(&path);
            self.to_conflict.insert(path, entry);
        }
        for (path, entry) in result.changed {
            if self.to_conflict.contains_key(&path) {
                continue;
            }
            let entry = self.keep_first_expectation(&path, entry);
            self.to_delete.remove(&path);
            self.to_update.insert(path, entry);
        }
        for (path, entry) in result.deleted {
            if self.to_conflict.contains_key(&path) {
                continue;
            }
            let entry = self.keep_first_expectation(&path, entry);
            self.to_update.remove(&path);
            self.to_delete.insert(path, entry);
        }
    }

    fn keep_first_expectation(&self, path: &FolderPath, mut entry: MergeEntry) -> MergeEntry {
        let earlier = self
            .to_conflict
            .get(path)
            .or_else(|| self.to_update.get(path))
            .or_else(|| self.to_delete.get(path));
        if let Some(earlier) = earlier {
            entry.expected_local = earlier.expected_local.clone();
            entry.previous = earlier.previous.clone();
        }
        entry
    }

    pub fn is_empty(&self) -> bool {
        self.to_delete.is_empty() && self.to_update.is_empty() && self.to_conflict.is_empty()
    }
}

/// Fetch the snapshot of every reachable peer of this user.
///
/// Peers that do not answer in time, refuse, or send an unreadable archive
/// are left out; the run proceeds with whoever answered.
pub async fn fetch_all_snapshots(ctx: &DeviceContext) -> Result<Vec<(PeerRef, Snapshot)>> {
    let peers = ctx.peers().await?;
    if peers.is_empty() {
        debug!("{} has no reachable peers", ctx.local.device);
        return Ok(Vec::new());
    }

    let targets: Vec<_> = peers.iter().map(|p| p.address.clone()).collect();
    let outcome = ctx
        .coordinator
        .request(&targets, Message::SnapshotFetchRequest, ctx.config.snapshot_timeout)
        .await?;

    if !outcome.completed {
        warn!(
            "Only {} of {} peer(s) sent their snapshot",
            outcome.responses.len(),
            peers.len()
        );
    }

    let mut snapshots = Vec::new();
    for response in outcome.responses {
        match response.body {
            Message::SnapshotFetchResponse { archive } => match Snapshot::decode(&archive) {
                Ok(snapshot) => snapshots.push((response.from, snapshot)),
                Err(e) => warn!("Unreadable snapshot from {}: {}", response.from, e),
            },
            other => warn!(
                "Unexpected {} from {} while fetching snapshots",
                other.kind(),
                response.from
            ),
        }
    }

    snapshots.sort_by(|a, b| a.0.device.cmp(&b.0.device));
    Ok(snapshots)
}

/// Notifications describing how `after` differs from `before`.
pub fn changes_between(before: &Snapshot, after: &Snapshot) -> Vec<FolderEvent> {
    let mut events = Vec::new();

    for (path, history) in after.iter() {
        let previous = before.get(path);
        if previous == Some(history) {
            continue;
        }
        let Some(head) = history.last() else {
            continue;
        };
        let was_live = previous.map(|h| h.is_live()).unwrap_or(false);

        let kind = match (was_live, head.is_tombstone()) {
            (true, true) => EventKind::Deleted,
            (false, true) => continue,
            (true, false) => EventKind::Modified,
            (false, false) => EventKind::Created,
        };
        events.push(FolderEvent::new(path.clone(), kind, head.is_directory));
    }

    events
}

#[cfg(test)]
mod tests {
    use super::*;
    use peersync_common::{DeviceId, PeerAddress};
    use peersync_history::StoreMeta;
    use proptest::prelude::*;

    fn device(name: &str) -> DeviceId {
        DeviceId::new(name).unwrap()
    }

    fn peer(name: &str) -> PeerRef {
        PeerRef::new("alice", device(name), PeerAddress::new(format!("mem://{}", name)))
    }

    fn path(p: &str) -> FolderPath {
        FolderPath::parse(p).unwrap()
    }

    fn file(content: &[u8], by: &str) -> FileVersion {
        FileVersion::file(ContentHash::of_bytes(content), content.len() as u64, device(by))
    }

    fn chain(versions: &[&FileVersion]) -> PathHistory {
        PathHistory {
            versions: versions.iter().map(|v| (*v).clone()).collect(),
        }
    }

    #[test]
    fn test_classify_basic_lineages() {
        let v1 = file(b"1", "a");
        let v2 = file(b"2", "b");
        let gone = FileVersion::tombstone(false, device("b"));

        let base = chain(&[&v1]);
        let ahead = chain(&[&v1, &v2]);
        let deleted = chain(&[&v1, &gone]);

        assert_eq!(classify(Some(&base), Some(&base)).classification, Classification::Unchanged);
        assert_eq!(classify(Some(&base), Some(&ahead)), Verdict::adopt(Classification::Changed));
        assert_eq!(classify(Some(&ahead), Some(&base)), Verdict::keep());
        assert_eq!(classify(Some(&base), Some(&deleted)), Verdict::adopt(Classification::Deleted));
        assert_eq!(classify(Some(&base), None), Verdict::keep());
        assert_eq!(classify(None, Some(&base)), Verdict::adopt(Classification::Changed));
        assert_eq!(classify(None, Some(&chain(&[&gone]))), Verdict::adopt(Classification::Unchanged));
    }

    #[test]
    fn test_classify_divergence() {
        let h1 = file(b"h1", "a");
        let mine = file(b"mine", "a");
        let theirs = file(b"theirs", "b");
        let same = file(b"mine", "b");
        let gone_here = FileVersion::tombstone(false, device("a"));
        let gone_there = FileVersion::tombstone(false, device("b"));

        let local = chain(&[&h1, &mine]);
        assert_eq!(
            classify(Some(&local), Some(&chain(&[&h1, &theirs]))).classification,
            Classification::Conflict
        );
        assert_eq!(classify(Some(&local), Some(&chain(&[&h1, &same]))), Verdict::keep());
        assert_eq!(
            classify(Some(&local), Some(&chain(&[&h1, &gone_there]))).classification,
            Classification::Conflict
        );
        assert_eq!(
            classify(Some(&chain(&[&h1, &gone_here])), Some(&chain(&[&h1, &theirs]))),
            Verdict::adopt(Classification::Changed)
        );
        assert_eq!(
            classify(Some(&chain(&[&h1, &gone_here])), Some(&chain(&[&h1, &gone_there]))),
            Verdict::keep()
        );
    }

    #[test]
    fn test_merge_one_adopts_and_orders() {
        let a = device("a");
        let mut store = HistoryStore::new(a.clone(), "alice");
        let v1 = file(b"1", "a");
        store.record_version(&path("/docs/x.txt"), v1.clone());
        store.record_version(&path("/old"), v1.clone());

        let mut remote = Snapshot::new(StoreMeta::default());
        remote.insert(path("/docs/x.txt"), chain(&[&v1, &file(b"2", "b")]));
        remote.insert(path("/docs"), PathHistory::new(FileVersion::directory(device("b"))));
        remote.insert(path("/old"), chain(&[&v1, &FileVersion::tombstone(false, device("b"))]));

        let result = merge_one(&mut store, &remote, &peer("b"));

        let changed: Vec<String> = result.changed.keys().map(|p| p.to_string()).collect();
        assert_eq!(changed, vec!["/docs", "/docs/x.txt"]);
        assert!(result.deleted.contains_key(&path("/old")));
        assert_eq!(
            result.changed[&path("/docs/x.txt")].expected_local,
            Some(ContentHash::of_bytes(b"1"))
        );
        assert_eq!(result.changed[&path("/docs")].expected_local, None);
        assert_eq!(store.history(&path("/docs/x.txt")), remote.get(&path("/docs/x.txt")));
        assert!(!store.history(&path("/old")).unwrap().is_live());
    }

    #[test]
    fn test_merge_one_keeps_local_chain_on_conflict() {
        let mut store = HistoryStore::new(device("a"), "alice");
        let h1 = file(b"h1", "a");
        let mine = file(b"mine", "a");
        store.record_version(&path("/r.txt"), h1.clone());
        store.record_version(&path("/r.txt"), mine.clone());

        let mut remote = Snapshot::new(StoreMeta::default());
        remote.insert(path("/r.txt"), chain(&[&h1, &file(b"theirs", "b")]));

        let result = merge_one(&mut store, &remote, &peer("b"));
        assert!(result.conflict.contains_key(&path("/r.txt")));
        assert_eq!(store.last_version(&path("/r.txt")), Some(&mine));
    }

    #[test]
    fn test_plan_keeps_conflicts_and_first_expectation() {
        let v1 = file(b"1", "a");
        let entry = |expected: &[u8]| MergeEntry {
            source: peer("b"),
            expected_local: Some(ContentHash::of_bytes(expected)),
            previous: None,
            remote: chain(&[&v1]),
        };

        let mut first = MergeResult::default();
        first.changed.insert(path("/x"), entry(b"disk"));
        first.conflict.insert(path("/y"), entry(b"disk"));

        let mut second = MergeResult::default();
        second.deleted.insert(path("/x"), entry(b"adopted"));
        second.changed.insert(path("/y"), entry(b"adopted"));

        let mut plan = ReconcilePlan::new();
        plan.absorb(first);
        plan.absorb(second);

        assert!(plan.to_update.is_empty());
        assert_eq!(
            plan.to_delete[&path("/x")].expected_local,
            Some(ContentHash::of_bytes(b"disk"))
        );
        assert!(plan.to_conflict.contains_key(&path("/y")));
    }

    #[test]
    fn test_changes_between() {
        let mut before = Snapshot::new(StoreMeta::default());
        let v1 = file(b"1", "a");
        before.insert(path("/kept"), chain(&[&v1]));
        before.insert(path("/edited"), chain(&[&v1]));
        before.insert(path("/removed"), chain(&[&v1]));

        let mut after = before.clone();
        after.insert(path("/edited"), chain(&[&v1, &file(b"2", "a")]));
        after.insert(path("/removed"), chain(&[&v1, &FileVersion::tombstone(false, device("a"))]));
        after.insert(path("/new"), chain(&[&file(b"n", "a")]));

        let events = changes_between(&before, &after);
        let kinds: Vec<(String, EventKind)> = events
            .into_iter()
            .map(|e| (e.path.to_string(), e.kind))
            .collect();

        assert_eq!(kinds.len(), 3);
        assert!(kinds.contains(&("/edited".to_string(), EventKind::Modified)));
        assert!(kinds.contains(&("/removed".to_string(), EventKind::Deleted)));
        assert!(kinds.contains(&("/new".to_string(), EventKind::Created)));
    }

    fn arb_version() -> impl Strategy<Value = FileVersion> {
        (0u8..4, any::<bool>(), prop_oneof![Just("a"), Just("b")]).prop_map(|(content, deleted, by)| {
            if deleted {
                FileVersion::tombstone(false, device(by))
            } else {
                file(&[content], by)
            }
        })
    }

    fn arb_history() -> impl Strategy<Value = Option<PathHistory>> {
        proptest::option::of(proptest::collection::vec(arb_version(), 0..4).prop_map(|versions| {
            PathHistory { versions }
        }))
    }

    proptest! {
        #[test]
        fn prop_every_path_classified_exactly_once(
            histories in proptest::collection::vec((arb_history(), arb_history(), any::<bool>()), 1..12)
        ) {
            let mut store = HistoryStore::new(device("a"), "alice");
            let mut remote = Snapshot::new(StoreMeta::default());

            for (i, (local, theirs, share_prefix)) in histories.iter().enumerate() {
                let p = path(&format!("/p{}", i));
                let local = local.clone();
                let mut theirs = theirs.clone();
                if let (true, Some(local), Some(theirs)) = (*share_prefix, &local, theirs.as_mut()) {
                    let mut versions = local.versions.clone();
                    versions.extend(theirs.versions.drain(..));
                    theirs.versions = versions;
                }
                if let Some(local) = local {
                    store.replace_history(&p, local);
                }
                if let Some(theirs) = theirs {
                    remote.insert(p, theirs);
                }
            }

            let union = store.view().union_paths(&remote);
            let result = merge_one(&mut store, &remote, &peer("b"));

            prop_assert_eq!(result.len(), union.len());
            for p in &union {
                let hits = [
                    result.unchanged.contains(p),
                    result.changed.contains_key(p),
                    result.deleted.contains_key(p),
                    result.conflict.contains_key(p),
                ];
                prop_assert_eq!(hits.iter().filter(|h| **h).count(), 1);
            }
        }
    }
}
