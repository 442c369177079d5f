//! Run scheduling - manual, on-demand and periodic modes.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use crate::config::millis;
use crate::state::RunReport;
use peersync_common::{Error, FolderPath, Result};

/// Sync mode configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncMode {
    /// Manual runs only.
    Manual,
    /// Run as soon as local changes are reported.
    OnDemand,
    /// Run at regular intervals.
    Periodic {
        #[serde(with = "millis")]
        interval: Duration,
    },
    /// Both on-demand and periodic.
    Hybrid {
        #[serde(with = "millis")]
        interval: Duration,
    },
}

impl SyncMode {
    fn period(&self) -> Option<Duration> {
        match self {
            SyncMode::Periodic { interval } | SyncMode::Hybrid { interval } => Some(*interval),
            _ => None,
        }
    }

    fn reacts_to_changes(&self) -> bool {
        matches!(self, SyncMode::OnDemand | SyncMode::Hybrid { .. })
    }
}

/// Scheduler request types.
#[derive(Debug)]
pub enum SyncRequest {
    /// Explicit reconciliation run.
    Reconcile,
    /// Local edits that should reach peers.
    Changes(Vec<FolderPath>),
    /// Shutdown the scheduler.
    Shutdown,
}

type Pending = (SyncRequest, oneshot::Sender<Result<RunReport>>);

/// Front end for requesting runs and changing the mode.
#[derive(Clone)]
pub struct SyncScheduler {
    /// Current sync mode.
    mode: Arc<RwLock<SyncMode>>,
    /// Channel to send run requests.
    request_tx: mpsc::Sender<Pending>,
}

impl SyncScheduler {
    /// Create a new scheduler with the given mode.
    pub fn new(mode: SyncMode) -> (Self, SyncSchedulerHandle) {
        let (request_tx, request_rx) = mpsc::channel(100);
        let mode = Arc::new(RwLock::new(mode));

        let scheduler = Self {
            mode: mode.clone(),
            request_tx,
        };
        let handle = SyncSchedulerHandle { mode, request_rx };

        (scheduler, handle)
    }

    /// Request a run and wait for its report.
    pub async fn request_sync(&self) -> Result<RunReport> {
        let (response_tx, response_rx) = oneshot::channel();

        self.request_tx
            .send((SyncRequest::Reconcile, response_tx))
            .await
            .map_err(|_| Error::Aborted("Scheduler not running".to_string()))?;

        response_rx
            .await
            .map_err(|_| Error::Aborted("Scheduler dropped the run".to_string()))?
    }

    /// Change the sync mode.
    pub async fn set_mode(&self, mode: SyncMode) {
        let mut current_mode = self.mode.write().await;
        *current_mode = mode;
    }

    /// Get current sync mode.
    pub async fn get_mode(&self) -> SyncMode {
        self.mode.read().await.clone()
    }

    /// Notify the scheduler of local changes (for on-demand mode).
    ///
    /// Returns whether a run was queued.
    pub async fn notify_change(&self, paths: Vec<FolderPath>) -> bool {
        let mode = self.mode.read().await.clone();
        if !mode.reacts_to_changes() {
            debug!("Change notification ignored (mode: {:?})", mode);
            return false;
        }

        let (response_tx, _) = oneshot::channel();
        self.request_tx
            .send((SyncRequest::Changes(paths), response_tx))
            .await
            .is_ok()
    }

    /// Whether the scheduler task has stopped.
    pub fn is_closed(&self) -> bool {
        self.request_tx.is_closed()
    }

    /// Shutdown the scheduler.
    pub async fn shutdown(&self) {
        let (response_tx, _) = oneshot::channel();
        if self
            .request_tx
            .send((SyncRequest::Shutdown, response_tx))
            .await
            .is_err()
        {
            debug!("Scheduler already stopped");
        }
    }
}

/// Handle for the scheduler background task.
pub struct SyncSchedulerHandle {
    mode: Arc<RwLock<SyncMode>>,
    request_rx: mpsc::Receiver<Pending>,
}

impl SyncSchedulerHandle {
    /// Run the scheduler background task.
    ///
    /// This should be spawned in a tokio task. `run_fn` is called whenever a
    /// reconciliation run is due. The task ends on a shutdown request or
    /// once every `SyncScheduler` is dropped.
    pub async fn run<F, Fut>(mut self, run_fn: F)
    where
        F: Fn(SyncRequest) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<RunReport>> + Send,
    {
        let mut period = self.mode.read().await.period();
        let mut periodic_interval = period.map(Self::create_interval);

        info!("Sync scheduler started");

        loop {
            tokio::select! {
                request = self.request_rx.recv() => {
                    let Some((request, response_tx)) = request else {
                        info!("All schedulers dropped, stopping");
                        break;
                    };
                    match request {
                        SyncRequest::Shutdown => {
                            info!("Received shutdown request");
                            break;
                        }
                        _ => {
                            debug!("Processing sync request: {:?}", request);
                            let result = run_fn(request).await;
                            if let Err(e) = &result {
                                warn!("Requested run failed: {}", e);
                            }
                            // The requester may have stopped waiting.
                            let _ = response_tx.send(result);
                        }
                    }
                }

                _ = Self::wait_for_periodic(&mut periodic_interval) => {
                    debug!("Triggering periodic run");
                    match run_fn(SyncRequest::Reconcile).await {
                        Ok(report) => {
                            info!(
                                "Periodic run finished ({}): {} updated, {} deleted, {} conflicts",
                                report.phase, report.updated, report.deleted, report.conflicts
                            );
                        }
                        Err(e) => {
                            error!("Periodic run failed: {}", e);
                        }
                    }
                }
            }

            // Recreate interval if mode changed
            let expected = self.mode.read().await.period();
            if expected != period {
                period = expected;
                periodic_interval = period.map(Self::create_interval);
            }
        }
    }

    fn create_interval(period: Duration) -> tokio::time::Interval {
        let mut ticker = interval(period);
        // The first tick fires immediately; start counting from now instead.
        ticker.reset();
        ticker
    }

    async fn wait_for_periodic(interval: &mut Option<tokio::time::Interval>) {
        match interval {
            Some(interval) => {
                interval.tick().await;
            }
            None => std::future::pending::<()>().await,
        }
    }
}
