//! Everything one device needs to take part in reconciliation.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::config::SyncConfig;
use crate::events::{EventWatcher, FolderEvent, SuspendGuard};
use crate::handlers::SyncHandler;
use crate::pipeline::changes_between;
use peersync_common::{FolderPath, PeerRef, Result};
use peersync_history::{scan_folder, HistoryStore};
use peersync_net::{serve, Coordinator, MemoryNetwork, PeerDirectory};
use peersync_storage::{content_hash, ContentHash, StorageProvider};

/// Marks a local reconciliation run; cleared on drop.
pub(crate) struct RunGuard<'a> {
    flag: &'a AtomicBool,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct FollowerHold {
    generation: u64,
    guard: Option<SuspendGuard>,
}

/// Shared per-device state: identity, folder, history, events and peers.
pub struct DeviceContext {
    pub local: PeerRef,
    pub provider: Arc<dyn StorageProvider>,
    pub store: Arc<RwLock<HistoryStore>>,
    pub events: EventWatcher,
    pub coordinator: Coordinator,
    pub directory: Arc<dyn PeerDirectory>,
    pub config: SyncConfig,
    store_file: Option<PathBuf>,
    follower: Mutex<FollowerHold>,
    running: AtomicBool,
}

impl DeviceContext {
    pub fn new(
        provider: Arc<dyn StorageProvider>,
        store: HistoryStore,
        coordinator: Coordinator,
        directory: Arc<dyn PeerDirectory>,
        config: SyncConfig,
    ) -> Self {
        Self {
            local: coordinator.local().clone(),
            provider,
            store: Arc::new(RwLock::new(store)),
            events: EventWatcher::new(),
            coordinator,
            directory,
            config,
            store_file: None,
            follower: Mutex::new(FollowerHold::default()),
            running: AtomicBool::new(false),
        }
    }

    /// Persist the history store to `file` after every run.
    pub fn with_store_file(mut self, file: impl Into<PathBuf>) -> Self {
        self.store_file = Some(file.into());
        self
    }

    /// Bring a device up on an in-memory network and start serving requests.
    pub async fn join_memory(
        network: &MemoryNetwork,
        local: PeerRef,
        provider: Arc<dyn StorageProvider>,
        store: HistoryStore,
        config: SyncConfig,
    ) -> Arc<Self> {
        let (transport, inbox) = network.join(local.clone()).await;
        let coordinator = Coordinator::new(local, Arc::new(transport));
        let ctx = Arc::new(Self::new(
            provider,
            store,
            coordinator.clone(),
            Arc::new(network.clone()),
            config,
        ));

        tokio::spawn(serve(
            inbox,
            coordinator,
            Arc::new(SyncHandler::new(ctx.clone())),
        ));
        ctx
    }

    pub fn user(&self) -> &str {
        &self.local.user
    }

    /// Reachable devices of this user other than this one.
    pub async fn peers(&self) -> Result<Vec<PeerRef>> {
        let devices = self.directory.reachable_devices(self.user()).await?;
        Ok(devices.into_iter().filter(|p| *p != self.local).collect())
    }

    /// Checksum of what is on disk at `path`, `None` if nothing is.
    pub async fn disk_hash(&self, path: &FolderPath) -> Result<Option<ContentHash>> {
        if !self.provider.exists(path).await? {
            return Ok(None);
        }
        Ok(Some(content_hash(self.provider.as_ref(), path).await?))
    }

    /// Fold on-disk edits into the history store.
    ///
    /// Returns the changes found, as unsuppressed notifications; emitting
    /// them is up to the caller.
    pub async fn record_local_changes(&self) -> Result<Vec<FolderEvent>> {
        let before = self.store.read().await.snapshot();
        let scanned = scan_folder(self.provider.as_ref(), &before, &self.local.device).await?;
        let changes = changes_between(&before, &scanned);

        if !changes.is_empty() {
            let mut store = self.store.write().await;
            for (path, history) in scanned.iter() {
                if before.get(path) != Some(history) {
                    store.replace_history(path, history.clone());
                }
            }
            debug!("{} recorded {} local change(s)", self.local.device, changes.len());
        }
        Ok(changes)
    }

    /// Write the history store to its file, if one is configured.
    pub async fn save_store(&self) -> Result<()> {
        if let Some(file) = &self.store_file {
            self.store.read().await.save(file).await?;
        }
        Ok(())
    }

    fn follower(&self) -> MutexGuard<'_, FollowerHold> {
        self.follower.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Suspend the watcher on behalf of a leader's run.
    ///
    /// The hold lifts on `release_leader_hold` or after the configured
    /// follower timeout, whichever comes first.
    pub fn hold_for_leader(self: &Arc<Self>, leader: &PeerRef) {
        let generation = {
            let mut hold = self.follower();
            hold.generation += 1;
            if hold.guard.is_none() {
                hold.guard = Some(self.events.suspend());
            }
            hold.generation
        };
        info!("{} holding for leader {}", self.local.device, leader);

        let ctx = Arc::downgrade(self);
        let timeout = self.config.follower_hold_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(ctx) = ctx.upgrade() {
                let mut hold = ctx.follower();
                if hold.generation == generation && hold.guard.take().is_some() {
                    info!("{} gave up waiting for the leader", ctx.local.device);
                }
            }
        });
    }

    /// Claim the store for a local run. `None` if one is already running.
    pub(crate) fn begin_run(&self) -> Option<RunGuard<'_>> {
        self.running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| RunGuard {
                flag: &self.running,
            })
    }

    /// Whether a local reconciliation run owns the store.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Lift a leader hold.
    pub fn release_leader_hold(&self) {
        if self.follower().guard.take().is_some() {
            debug!("{} released leader hold", self.local.device);
        }
    }

    /// Whether a leader hold is active.
    pub fn is_held(&self) -> bool {
        self.follower().guard.is_some()
    }
}
