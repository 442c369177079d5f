//! Local folder event pipeline.
//!
//! Observations from the filesystem watcher flow through `EventWatcher` to
//! subscribers. While suspended, observations are dropped; notifications
//! the reconciliation emits itself are always delivered, tagged `suppressed`
//! when they must not be propagated back to peers.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;

use peersync_common::FolderPath;

/// What happened to a path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    Created,
    Modified,
    Deleted,
    Moved { from: FolderPath },
}

/// One folder notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FolderEvent {
    pub path: FolderPath,
    pub kind: EventKind,
    pub is_directory: bool,
    /// Produced by reconciliation; must not be re-synced.
    pub suppressed: bool,
}

impl FolderEvent {
    pub fn new(path: FolderPath, kind: EventKind, is_directory: bool) -> Self {
        Self {
            path,
            kind,
            is_directory,
            suppressed: false,
        }
    }

    pub fn suppressed(mut self) -> Self {
        self.suppressed = true;
        self
    }
}

struct Inner {
    suspensions: AtomicUsize,
    sender: broadcast::Sender<FolderEvent>,
}

/// Suspendable fan-out of folder events.
#[derive(Clone)]
pub struct EventWatcher {
    inner: Arc<Inner>,
}

impl EventWatcher {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(1024);
        Self {
            inner: Arc::new(Inner {
                suspensions: AtomicUsize::new(0),
                sender,
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FolderEvent> {
        self.inner.sender.subscribe()
    }

    pub fn is_suspended(&self) -> bool {
        self.inner.suspensions.load(Ordering::SeqCst) > 0
    }

    /// Suspend until the returned guard drops.
    ///
    /// Suspensions nest; the watcher resumes once every guard is gone.
    pub fn suspend(&self) -> SuspendGuard {
        let depth = self.inner.suspensions.fetch_add(1, Ordering::SeqCst) + 1;
        debug!("Event watcher suspended (depth {})", depth);
        SuspendGuard {
            watcher: self.clone(),
        }
    }

    fn resume(&self) {
        let previous = self
            .inner
            .suspensions
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .unwrap_or(0);
        if previous == 1 {
            debug!("Event watcher resumed");
        }
    }

    /// Feed an observation from the filesystem watcher.
    ///
    /// Returns whether it was delivered.
    pub fn observe(&self, event: FolderEvent) -> bool {
        if self.is_suspended() {
            debug!("Dropping {:?} on {} while suspended", event.kind, event.path);
            return false;
        }
        self.publish(event);
        true
    }

    /// Emit a notification produced by reconciliation itself.
    pub fn notify(&self, event: FolderEvent) {
        self.publish(event);
    }

    fn publish(&self, event: FolderEvent) {
        // No subscribers is fine.
        let _ = self.inner.sender.send(event);
    }
}

impl Default for EventWatcher {
    fn default() -> Self {
        Self::new()
    }
}

/// Keeps the watcher suspended while alive.
pub struct SuspendGuard {
    watcher: EventWatcher,
}

impl Drop for SuspendGuard {
    fn drop(&mut self) {
        self.watcher.resume();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(p: &str) -> FolderEvent {
        FolderEvent::new(FolderPath::parse(p).unwrap(), EventKind::Modified, false)
    }

    #[test]
    fn test_guard_resumes_on_drop() {
        let watcher = EventWatcher::new();
        {
            let _outer = watcher.suspend();
            {
                let _inner = watcher.suspend();
                assert!(watcher.is_suspended());
            }
            assert!(watcher.is_suspended());
        }
        assert!(!watcher.is_suspended());
    }

    #[test]
    fn test_guard_resumes_on_early_return() {
        fn fails(watcher: &EventWatcher) -> Result<(), ()> {
            let _guard = watcher.suspend();
            Err(())
        }

        let watcher = EventWatcher::new();
        assert!(fails(&watcher).is_err());
        assert!(!watcher.is_suspended());
    }

    #[tokio::test]
    async fn test_observations_dropped_while_suspended() {
        let watcher = EventWatcher::new();
        let mut rx = watcher.subscribe();

        let guard = watcher.suspend();
        assert!(!watcher.observe(event("/a")));
        watcher.notify(event("/b").suppressed());
        drop(guard);
        assert!(watcher.observe(event("/c")));

        let first = rx.recv().await.unwrap();
        assert_eq!(first.path.to_string(), "/b");
        assert!(first.suppressed);
        assert_eq!(rx.recv().await.unwrap().path.to_string(), "/c");
    }
}
