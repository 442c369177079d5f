//! Responder side of every sync message.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::device::DeviceContext;
use crate::events::{EventKind, FolderEvent};
use crate::pipeline::{merge_one, ReconcilePlan};
use crate::state::RunReport;
use crate::syncer::{emit_local_changes, reconcile_plan};
use crate::transfer::{
    apply_chunk, discard_staging, finish_transfer, install, read_chunk, staging_path, ChunkStep,
};
use peersync_common::{Error, FolderPath, PeerRef, Result};
use peersync_history::{Snapshot, StoreMeta};
use peersync_net::{Chunk, Envelope, ExchangeId, Message, RequestHandler, CHUNK_DONE};

/// Whether `user` may read the folder described by `meta`.
fn may_read(meta: &StoreMeta, local: &PeerRef, user: &str) -> bool {
    let owner = if meta.owner.is_empty() {
        local.user.as_str()
    } else {
        meta.owner.as_str()
    };
    owner == user || meta.sharers.iter().any(|s| s == user)
}

/// Whether `user` may change the folder described by `meta`.
fn may_write(meta: &StoreMeta, local: &PeerRef, user: &str) -> bool {
    let owner = if meta.owner.is_empty() {
        local.user.as_str()
    } else {
        meta.owner.as_str()
    };
    owner == user || (meta.sharers_can_write && meta.sharers.iter().any(|s| s == user))
}

/// Serves sync requests for one device.
pub struct SyncHandler {
    ctx: Arc<DeviceContext>,
}

impl SyncHandler {
    pub fn new(ctx: Arc<DeviceContext>) -> Self {
        Self { ctx }
    }

    async fn authorize(&self, sender: &PeerRef, write: bool) -> Result<()> {
        let store = self.ctx.store.read().await;
        let allowed = if write {
            may_write(store.meta(), &self.ctx.local, &sender.user)
        } else {
            may_read(store.meta(), &self.ctx.local, &sender.user)
        };
        if allowed {
            Ok(())
        } else {
            Err(Error::Protocol(format!(
                "{} may not {} this folder",
                sender.user,
                if write { "write" } else { "read" }
            )))
        }
    }

    async fn snapshot(&self) -> Result<Message> {
        // A local run owns the store until it finishes.
        if !self.ctx.is_running() {
            self.ctx.record_local_changes().await?;
        }
        let archive = self.ctx.store.read().await.view().encode()?;
        Ok(Message::SnapshotFetchResponse { archive })
    }

    async fn chunk_push(&self, exchange: ExchangeId, chunk: &Chunk) -> Result<Message> {
        let _guard = self.ctx.events.suspend();
        let existed = self
            .ctx
            .store
            .read()
            .await
            .history(&chunk.path)
            .map(|h| h.is_live())
            .unwrap_or(false);

        let staging = staging_path(exchange)?;
        let next_chunk = match self.receive_pushed(chunk, &staging, existed).await {
            Ok(next_chunk) => next_chunk,
            Err(e) => {
                discard_staging(&self.ctx, &staging).await;
                return Err(e);
            }
        };
        Ok(Message::ChunkPushResponse { next_chunk })
    }

    async fn receive_pushed(&self, chunk: &Chunk, staging: &FolderPath, existed: bool) -> Result<i64> {
        match apply_chunk(&self.ctx, chunk, staging).await? {
            ChunkStep::Next(next) => i64::try_from(next)
                .map_err(|_| Error::Protocol(format!("Chunk index {} out of range", next))),
            ChunkStep::Verified(hash) => {
                if !hash.is_directory() {
                    install(&self.ctx, staging, &chunk.path).await?;
                }
                finish_transfer(&self.ctx, &chunk.path, &hash, existed).await?;
                debug!("{} received {} by push", self.ctx.local.device, chunk.path);
                Ok(CHUNK_DONE)
            }
            ChunkStep::Restart => Ok(0),
        }
    }

    async fn delete(&self, path: &FolderPath) -> Result<Message> {
        let _guard = self.ctx.events.suspend();
        let provider = &self.ctx.provider;

        let is_directory = if provider.exists(path).await? {
            let is_directory = provider.metadata(path).await?.is_directory;
            provider.delete(path).await?;
            is_directory
        } else {
            false
        };

        self.ctx.store.write().await.record_deletion(path);
        self.ctx.events.notify(
            FolderEvent::new(path.clone(), EventKind::Deleted, is_directory).suppressed(),
        );
        info!("{} deleted {} on request", self.ctx.local.device, path);
        Ok(Message::PathDeleteResponse { accepted: true })
    }

    async fn rename(&self, old_path: &FolderPath, new_path: &FolderPath, is_file: bool) -> Result<Message> {
        let _guard = self.ctx.events.suspend();

        if let Err(e) = self.ctx.provider.rename(old_path, new_path).await {
            warn!("Could not move {} to {}: {}", old_path, new_path, e);
            return Ok(Message::PathMoveResponse { accepted: false });
        }
        if let Err(e) = self.ctx.store.write().await.move_history(old_path, new_path) {
            // Untracked source; the next scan picks the new path up.
            debug!("No history moved for {}: {}", old_path, e);
        }

        self.ctx.events.notify(
            FolderEvent::new(
                new_path.clone(),
                EventKind::Moved {
                    from: old_path.clone(),
                },
                !is_file,
            )
            .suppressed(),
        );
        info!("{} moved {} to {} on request", self.ctx.local.device, old_path, new_path);
        Ok(Message::PathMoveResponse { accepted: true })
    }

    /// Follower side of the blocking variant: adopt the leader's result.
    async fn apply_result(&self, leader: &PeerRef, archive: &[u8]) -> Result<Message> {
        let snapshot = Snapshot::decode(archive)?;
        let mut report = RunReport::new();

        {
            let _guard = self.ctx.events.suspend();
            let result = {
                let mut store = self.ctx.store.write().await;
                merge_one(&mut store, &snapshot, leader)
            };
            let mut plan = ReconcilePlan::new();
            plan.absorb(result);
            reconcile_plan(&self.ctx, plan, &mut report).await;
        }

        report.synthetic_events = emit_local_changes(&self.ctx).await?;
        self.ctx.save_store().await?;
        info!(
            "{} applied result from {}: {} deleted, {} updated, {} conflict(s), {} skipped",
            self.ctx.local.device,
            leader.device,
            report.deleted,
            report.updated,
            report.conflicts,
            report.skipped
        );
        Ok(Message::Ack)
    }
}

#[async_trait]
impl RequestHandler for SyncHandler {
    async fn handle(&self, request: &Envelope) -> Result<Option<Message>> {
        let sender = &request.sender;
        let reply = match &request.body {
            Message::SnapshotFetchRequest => {
                self.authorize(sender, false).await?;
                self.snapshot().await?
            }
            Message::ElectionRequest { timestamp } => {
                debug!("{} confirming election from {} at {}", self.ctx.local.device, sender, timestamp);
                Message::ElectionResponse { accepted: true }
            }
            Message::ChunkPushRequest(chunk) => {
                self.authorize(sender, true).await?;
                self.chunk_push(request.exchange, chunk).await?
            }
            Message::ChunkDemandRequest { path, chunk_index } => {
                self.authorize(sender, false).await?;
                Message::ChunkDemandResponse(read_chunk(&self.ctx, path, *chunk_index).await?)
            }
            Message::PathDeleteRequest { path } => {
                self.authorize(sender, true).await?;
                self.delete(path).await?
            }
            Message::PathMoveRequest {
                old_path,
                new_path,
                is_file,
            } => {
                self.authorize(sender, true).await?;
                self.rename(old_path, new_path, *is_file).await?
            }
            Message::ReconciliationStarted { leader } => {
                self.authorize(sender, false).await?;
                self.ctx.hold_for_leader(leader);
                Message::Ack
            }
            Message::ReconciliationResult { archive } => {
                self.authorize(sender, true).await?;
                self.apply_result(sender, archive).await?
            }
            Message::ReconciliationComplete => {
                self.ctx.release_leader_hold();
                Message::Ack
            }
            other => {
                return Err(Error::Protocol(format!(
                    "{} is not a request",
                    other.kind()
                )));
            }
        };
        Ok(Some(reply))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Cluster;
    use peersync_common::DeviceId;
    use peersync_storage::{ContentHash, StorageProvider};
    use std::time::Duration;

    fn path(p: &str) -> FolderPath {
        FolderPath::parse(p).unwrap()
    }

    #[test]
    fn test_access_rules() {
        let local = PeerRef::new(
            "alice",
            DeviceId::new("a").unwrap(),
            peersync_common::PeerAddress::new("mem://a"),
        );
        let mut meta = StoreMeta {
            owner: "alice".to_string(),
            sharers: vec!["bob".to_string()],
            sharers_can_write: false,
        };

        assert!(may_read(&meta, &local, "alice"));
        assert!(may_read(&meta, &local, "bob"));
        assert!(!may_read(&meta, &local, "eve"));
        assert!(may_write(&meta, &local, "alice"));
        assert!(!may_write(&meta, &local, "bob"));

        meta.sharers_can_write = true;
        assert!(may_write(&meta, &local, "bob"));

        meta.owner.clear();
        assert!(may_write(&meta, &local, "alice"));
    }

    #[tokio::test]
    async fn test_snapshot_request_reports_disk_state() {
        let cluster = Cluster::new(&["a", "b"]).await;
        cluster.provider("b").write(&path("/x.txt"), b"x".to_vec()).await.unwrap();

        let outcome = cluster
            .ctx("a")
            .coordinator
            .request(
                &[cluster.peer("b").address],
                Message::SnapshotFetchRequest,
                Duration::from_secs(1),
            )
            .await
            .unwrap();

        let Message::SnapshotFetchResponse { archive } = &outcome.responses[0].body else {
            panic!("unexpected response");
        };
        let snapshot = Snapshot::decode(archive).unwrap();
        assert_eq!(
            snapshot.last_version(&path("/x.txt")).and_then(|v| v.live_hash()),
            Some(&ContentHash::of_bytes(b"x"))
        );
    }

    fn request_from(sender: PeerRef, body: Message) -> Envelope {
        Envelope {
            exchange: peersync_net::ExchangeId::new(),
            sequence: 0,
            sender,
            receivers: vec![],
            body,
        }
    }

    async fn snapshot_of(handler: &SyncHandler, sender: PeerRef) -> Snapshot {
        let reply = handler
            .handle(&request_from(sender, Message::SnapshotFetchRequest))
            .await
            .unwrap();
        let Some(Message::SnapshotFetchResponse { archive }) = reply else {
            panic!("unexpected reply");
        };
        Snapshot::decode(&archive).unwrap()
    }

    #[tokio::test]
    async fn test_snapshot_refresh_follows_local_run_not_watcher() {
        let cluster = Cluster::new(&["a", "b"]).await;
        let ctx = cluster.ctx("b");
        let handler = SyncHandler::new(cluster.ctx_arc("b"));

        // An incoming push suspends the watcher but does not own the store.
        let incoming = ctx.events.suspend();
        cluster.provider("b").write(&path("/x.txt"), b"x".to_vec()).await.unwrap();
        let snapshot = snapshot_of(&handler, cluster.peer("a")).await;
        assert!(snapshot.get(&path("/x.txt")).is_some());
        drop(incoming);

        let run = ctx.begin_run().unwrap();
        cluster.provider("b").write(&path("/y.txt"), b"y".to_vec()).await.unwrap();
        let snapshot = snapshot_of(&handler, cluster.peer("a")).await;
        assert!(snapshot.get(&path("/y.txt")).is_none());
        drop(run);
        assert!(!ctx.is_running());
    }

    #[tokio::test]
    async fn test_delete_request() {
        let cluster = Cluster::new(&["a", "b"]).await;
        let ctx = cluster.ctx("b");
        cluster.provider("b").write(&path("/d/f"), b"f".to_vec()).await.unwrap();
        ctx.record_local_changes().await.unwrap();

        let accepted = crate::propagate::delete_on_peers(cluster.ctx("a"), &path("/d"))
            .await
            .unwrap();
        assert_eq!(accepted.get(&cluster.peer("b").device), Some(&Some(true)));
        assert!(!cluster.provider("b").exists(&path("/d")).await.unwrap());
        assert!(!ctx.store.read().await.history(&path("/d/f")).unwrap().is_live());
    }

    #[tokio::test]
    async fn test_move_request() {
        let cluster = Cluster::new(&["a", "b"]).await;
        let ctx = cluster.ctx("b");
        cluster.provider("b").write(&path("/old.txt"), b"o".to_vec()).await.unwrap();
        ctx.record_local_changes().await.unwrap();
        let mut events = ctx.events.subscribe();

        let accepted = crate::propagate::move_on_peers(
            cluster.ctx("a"),
            &path("/old.txt"),
            &path("/new.txt"),
            true,
        )
        .await
        .unwrap();

        assert_eq!(accepted.get(&cluster.peer("b").device), Some(&Some(true)));
        assert_eq!(cluster.provider("b").read(&path("/new.txt")).await.unwrap(), b"o");
        assert!(ctx.store.read().await.history(&path("/new.txt")).unwrap().is_live());
        let event = events.recv().await.unwrap();
        assert_eq!(event.kind, EventKind::Moved { from: path("/old.txt") });
        assert!(event.suppressed);
    }

    #[tokio::test]
    async fn test_foreign_user_is_refused() {
        let cluster = Cluster::new(&["a", "b"]).await;
        let stranger = cluster.peer("a");
        let stranger = PeerRef::new("mallory", stranger.device.clone(), stranger.address.clone());
        let envelope = Envelope {
            exchange: peersync_net::ExchangeId::new(),
            sequence: 0,
            sender: stranger,
            receivers: vec![cluster.peer("b").address],
            body: Message::PathDeleteRequest { path: path("/x") },
        };

        let handler = SyncHandler::new(cluster.ctx_arc("b"));
        assert!(matches!(handler.handle(&envelope).await, Err(Error::Protocol(_))));
    }

    #[tokio::test]
    async fn test_started_and_complete_toggle_hold() {
        let cluster = Cluster::new(&["a", "b"]).await;
        let handler = SyncHandler::new(cluster.ctx_arc("b"));
        let leader = cluster.peer("a");
        let notice = |body| Envelope {
            exchange: peersync_net::ExchangeId::new(),
            sequence: 0,
            sender: leader.clone(),
            receivers: vec![],
            body,
        };

        handler
            .handle(&notice(Message::ReconciliationStarted { leader: leader.clone() }))
            .await
            .unwrap();
        assert!(cluster.ctx("b").events.is_suspended());

        handler.handle(&notice(Message::ReconciliationComplete)).await.unwrap();
        assert!(!cluster.ctx("b").events.is_suspended());
    }
}
