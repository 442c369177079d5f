//! Background reconciliation runs.
//!
//! A run suspends the local watcher, optionally elects a leader, merges
//! every reachable peer's snapshot into the local store, and then applies
//! the result to the folder: deletions, conflict files, then fetches, each
//! in shallowest-first order. Before touching a path the run re-checks it on
//! disk, so an edit that raced the run is kept rather than overwritten.
//! Once the watcher is resumed, a fresh disk scan turns anything edited
//! during the run into ordinary change notifications.
//!
//! Every failure ends the run early with the watcher resumed; the next run
//! starts over from scratch.

use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::conflict::create_conflict_file;
use crate::device::DeviceContext;
use crate::election::elect_master;
use crate::events::{EventKind, FolderEvent};
use crate::pipeline::{fetch_all_snapshots, merge_one, MergeEntry, ReconcilePlan};
use crate::scheduler::{SyncMode, SyncScheduler};
use crate::state::{RunReport, SyncPhase};
use crate::transfer::fetch_path;
use peersync_common::{Error, FolderPath, PeerRef, Result};
use peersync_net::Message;

/// What happened to one planned path.
enum Step {
    Applied,
    Unneeded,
    /// The path changed on disk since the merge; left as it is.
    Raced,
}

/// Put back the chain a failed action's merge replaced.
async fn restore_history(ctx: &DeviceContext, path: &FolderPath, entry: &MergeEntry) {
    let mut store = ctx.store.write().await;
    match &entry.previous {
        Some(history) => store.replace_history(path, history.clone()),
        None => {
            store.forget(path);
        }
    }
}

async fn apply_deletion(ctx: &DeviceContext, path: &FolderPath, entry: &MergeEntry) -> Result<Step> {
    let Some(disk) = ctx.disk_hash(path).await? else {
        return Ok(Step::Unneeded);
    };
    if Some(&disk) != entry.expected_local.as_ref() {
        warn!("{} changed during the run, not deleting it", path);
        return Ok(Step::Raced);
    }

    if disk.is_directory() {
        let store = ctx.store.read().await;
        let occupied = store
            .view()
            .iter()
            .any(|(p, h)| path.is_ancestor_of(p) && h.is_live());
        if occupied {
            debug!("Keeping directory {}, it still holds live entries", path);
            return Ok(Step::Unneeded);
        }
    }

    ctx.provider.delete(path).await?;
    ctx.events
        .notify(FolderEvent::new(path.clone(), EventKind::Deleted, disk.is_directory()).suppressed());
    debug!("Deleted {}", path);
    Ok(Step::Applied)
}

async fn apply_update(ctx: &DeviceContext, path: &FolderPath, entry: &MergeEntry) -> Result<Step> {
    let Some(target) = entry.target_hash() else {
        return Ok(Step::Unneeded);
    };

    let disk = ctx.disk_hash(path).await?;
    if disk.as_ref() == Some(target) {
        return Ok(Step::Unneeded);
    }
    if disk != entry.expected_local {
        warn!("{} changed during the run, keeping the local edit", path);
        return Ok(Step::Raced);
    }

    fetch_path(ctx, &entry.source, path).await?;
    Ok(Step::Applied)
}

/// Apply a merge plan to the folder.
///
/// Deletions run first, then conflict files, then fetches, each shallowest
/// first. A path that fails is logged, its pre-merge history restored, and
/// the rest of the plan continues.
pub async fn reconcile_plan(ctx: &DeviceContext, plan: ReconcilePlan, report: &mut RunReport) {
    let ReconcilePlan {
        to_delete,
        mut to_update,
        to_conflict,
    } = plan;

    for (path, entry) in &to_delete {
        match apply_deletion(ctx, path, entry).await {
            Ok(Step::Applied) => report.deleted += 1,
            Ok(Step::Unneeded) => {}
            Ok(Step::Raced) => report.skipped += 1,
            Err(e) => {
                warn!("Skipping deletion of {}: {}", path, e);
                restore_history(ctx, path, entry).await;
                report.skipped += 1;
            }
        }
    }

    for (path, entry) in to_conflict {
        report.conflicts += 1;
        let Some(target) = create_conflict_file(ctx, &path).await else {
            warn!("Keeping local {} in place, not fetching the remote version", path);
            report.skipped += 1;
            continue;
        };
        report.conflict_files.push(target);

        ctx.store
            .write()
            .await
            .replace_history(&path, entry.remote.clone());
        if entry.target_hash().is_some() {
            to_update.insert(
                path,
                MergeEntry {
                    expected_local: None,
                    previous: None,
                    ..entry
                },
            );
        }
    }

    for (path, entry) in &to_update {
        match apply_update(ctx, path, entry).await {
            Ok(Step::Applied) => report.updated += 1,
            Ok(Step::Unneeded) => {}
            Ok(Step::Raced) => report.skipped += 1,
            Err(e) => {
                warn!("Skipping update of {} from {}: {}", path, entry.source.device, e);
                restore_history(ctx, path, entry).await;
                report.skipped += 1;
            }
        }
    }
}

/// Scan the folder and announce whatever changed since the store last saw it.
///
/// Returns the number of notifications emitted. They are not suppressed, so
/// the edits travel to peers like any other.
pub(crate) async fn emit_local_changes(ctx: &DeviceContext) -> Result<usize> {
    let changes = ctx.record_local_changes().await?;
    let count = changes.len();
    for event in changes {
        debug!("{} changed during the run ({:?})", event.path, event.kind);
        ctx.events.notify(event);
    }
    Ok(count)
}

/// Drives reconciliation runs for one device.
pub struct BackgroundSyncer {
    ctx: Arc<DeviceContext>,
    phase: Mutex<SyncPhase>,
}

impl BackgroundSyncer {
    pub fn new(ctx: Arc<DeviceContext>) -> Self {
        Self {
            ctx,
            phase: Mutex::new(SyncPhase::Idle),
        }
    }

    pub fn context(&self) -> &Arc<DeviceContext> {
        &self.ctx
    }

    /// Phase of the current run, or of the last one if none is running.
    pub fn phase(&self) -> SyncPhase {
        *self.phase.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_phase(&self, phase: SyncPhase) {
        let mut current = self.phase.lock().unwrap_or_else(|e| e.into_inner());
        if *current != phase {
            debug!("{}: {} -> {}", self.ctx.local.device, *current, phase);
            *current = phase;
        }
    }

    /// Run one reconciliation.
    ///
    /// Never fails: problems end the run early and show up in the report.
    pub async fn run(&self) -> RunReport {
        let started = Instant::now();
        let mut report = RunReport::new();

        let Some(_running) = self.ctx.begin_run() else {
            report.abort("a run is already in progress");
            return report;
        };

        let mut followers = Vec::new();
        let outcome = {
            let _suspended = self.ctx.events.suspend();
            let outcome = self.run_steps(&mut report, &mut followers).await;
            self.set_phase(SyncPhase::Resuming);
            outcome
        };

        if !followers.is_empty() {
            self.notify_followers(
                &followers,
                Message::ReconciliationComplete,
                self.ctx.config.exchange_timeout,
            )
            .await;
        }

        match outcome {
            Ok(()) => match emit_local_changes(&self.ctx).await {
                Ok(count) => report.synthetic_events = count,
                Err(e) => warn!("Could not scan for edits made during the run: {}", e),
            },
            Err(Error::Aborted(reason)) => report.abort(reason),
            Err(e) => {
                warn!("Reconciliation on {} failed: {}", self.ctx.local.device, e);
                report.abort(e.to_string());
            }
        }

        if let Err(e) = self.ctx.save_store().await {
            warn!("Could not save history store: {}", e);
        }

        report.duration = started.elapsed();
        self.set_phase(if report.is_aborted() {
            SyncPhase::Aborted
        } else {
            SyncPhase::Idle
        });

        match &report.abort_reason {
            Some(reason) => info!("Run on {} stopped: {}", self.ctx.local.device, reason),
            None => info!(
                "Run on {} finished in {:?}: {} peer(s), {} deleted, {} updated, {} conflict(s), {} skipped",
                self.ctx.local.device,
                report.duration,
                report.peers_merged,
                report.deleted,
                report.updated,
                report.conflicts,
                report.skipped
            ),
        }
        report
    }

    async fn run_steps(&self, report: &mut RunReport, followers: &mut Vec<PeerRef>) -> Result<()> {
        let ctx = &self.ctx;

        self.set_phase(SyncPhase::ElectingOrSkipping);
        if ctx.config.variant.elects_leader() {
            let election = elect_master(ctx).await?;
            report.leader = Some(election.leader.clone());
            if !election.is_leader(&ctx.local) {
                return Err(Error::Aborted(format!(
                    "another peer owns the run ({})",
                    election.leader.device
                )));
            }

            *followers = ctx.peers().await?;
            if !followers.is_empty() {
                self.notify_followers(
                    followers,
                    Message::ReconciliationStarted {
                        leader: ctx.local.clone(),
                    },
                    ctx.config.exchange_timeout,
                )
                .await;
            }
        }

        // Local edits made since the last run become versions first, so the
        // merge compares against what is really on disk.
        ctx.record_local_changes().await?;

        self.set_phase(SyncPhase::FetchingSnapshots);
        let snapshots = fetch_all_snapshots(ctx).await?;
        report.peers_merged = snapshots.len();

        self.set_phase(SyncPhase::Merging);
        let mut plan = ReconcilePlan::new();
        {
            let mut store = ctx.store.write().await;
            for (peer, snapshot) in &snapshots {
                plan.absorb(merge_one(&mut store, snapshot, peer));
            }
        }

        self.set_phase(SyncPhase::Reconciling);
        reconcile_plan(ctx, plan, report).await;

        if !followers.is_empty() {
            let archive = ctx.store.read().await.view().encode()?;
            self.notify_followers(
                followers,
                Message::ReconciliationResult { archive },
                ctx.config.transfer_session_timeout,
            )
            .await;
        }
        Ok(())
    }

    /// Send a notice to every follower.
    ///
    /// Followers that do not acknowledge in time are treated as unknown; a
    /// missed start or result notice only costs them this run.
    async fn notify_followers(&self, followers: &[PeerRef], body: Message, timeout: Duration) {
        let targets: Vec<_> = followers.iter().map(|p| p.address.clone()).collect();
        let kind = body.kind();

        match self.ctx.coordinator.request(&targets, body, timeout).await {
            Ok(outcome) if outcome.completed => {
                debug!("{} acknowledged by {} follower(s)", kind, followers.len());
            }
            Ok(outcome) => warn!(
                "{} acknowledged by {} of {} follower(s)",
                kind,
                outcome.responses.len(),
                followers.len()
            ),
            Err(e) => warn!("Could not send {}: {}", kind, e),
        }
    }

    /// Drive runs from a scheduler in the given mode.
    ///
    /// Unsuppressed folder events are forwarded to the scheduler, so the
    /// on-demand modes react to local edits.
    pub fn spawn_scheduled(self: &Arc<Self>, mode: SyncMode) -> (SyncScheduler, JoinHandle<()>) {
        let (scheduler, handle) = SyncScheduler::new(mode);

        let syncer = self.clone();
        let task = tokio::spawn(handle.run(move |_request| {
            let syncer = syncer.clone();
            async move { Ok(syncer.run().await) }
        }));

        let mut events = self.ctx.events.subscribe();
        let forward = scheduler.clone();
        tokio::spawn(async move {
            while !forward.is_closed() {
                match events.recv().await {
                    Ok(event) if !event.suppressed => {
                        forward.notify_change(vec![event.path]).await;
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(missed)) => {
                        debug!("Missed {} folder event(s)", missed);
                        forward.notify_change(vec![FolderPath::root()]).await;
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });

        (scheduler, task)
    }
}
