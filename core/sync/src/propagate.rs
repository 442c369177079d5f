//! Pushing local deletions and moves to peers.
//!
//! Each call is one exchange over every reachable peer. A peer that does not
//! answer within the exchange timeout is reported as `None` (unknown); it
//! will converge through the next reconciliation run.

use std::collections::BTreeMap;
use tracing::{debug, warn};

use crate::device::DeviceContext;
use peersync_common::{DeviceId, FolderPath, Result};
use peersync_net::{ExchangeOutcome, Message};

/// Per-peer answer: accepted, refused, or unknown.
pub type PeerAnswers = BTreeMap<DeviceId, Option<bool>>;

async fn broadcast(ctx: &DeviceContext, body: Message) -> Result<(Vec<DeviceId>, ExchangeOutcome)> {
    let peers = ctx.peers().await?;
    let targets: Vec<_> = peers.iter().map(|p| p.address.clone()).collect();
    let kind = body.kind();
    let outcome = ctx
        .coordinator
        .request(&targets, body, ctx.config.exchange_timeout)
        .await?;

    if !outcome.completed {
        warn!(
            "{}: {} of {} peer(s) answered",
            kind,
            outcome.responses.len(),
            peers.len()
        );
    }
    Ok((peers.into_iter().map(|p| p.device).collect(), outcome))
}

fn collect(devices: Vec<DeviceId>, outcome: &ExchangeOutcome) -> PeerAnswers {
    devices
        .into_iter()
        .map(|device| {
            let answer = outcome.from_device(&device).map(|r| match &r.body {
                Message::PathDeleteResponse { accepted } | Message::PathMoveResponse { accepted } => {
                    *accepted
                }
                other => {
                    debug!("{} answered with {}", r.from, other.kind());
                    false
                }
            });
            (device, answer)
        })
        .collect()
}

/// Ask every reachable peer to delete `path`.
pub async fn delete_on_peers(ctx: &DeviceContext, path: &FolderPath) -> Result<PeerAnswers> {
    let (devices, outcome) = broadcast(ctx, Message::PathDeleteRequest { path: path.clone() }).await?;
    Ok(collect(devices, &outcome))
}

/// Ask every reachable peer to move `old_path` to `new_path`.
pub async fn move_on_peers(
    ctx: &DeviceContext,
    old_path: &FolderPath,
    new_path: &FolderPath,
    is_file: bool,
) -> Result<PeerAnswers> {
    let body = Message::PathMoveRequest {
        old_path: old_path.clone(),
        new_path: new_path.clone(),
        is_file,
    };
    let (devices, outcome) = broadcast(ctx, body).await?;
    Ok(collect(devices, &outcome))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{fast_config, Cluster};

    #[tokio::test]
    async fn test_unanswered_peer_is_unknown() {
        let cluster = Cluster::with_config(&["a", "b"], fast_config()).await;
        let network = cluster.network.clone();
        network
            .set_interceptor(Some(std::sync::Arc::new(
                |envelope: &mut peersync_net::Envelope| !envelope.body.is_response(),
            )))
            .await;

        let answers = delete_on_peers(cluster.ctx("a"), &FolderPath::parse("/x").unwrap())
            .await
            .unwrap();
        assert_eq!(answers.get(&cluster.peer("b").device), Some(&None));
    }
}
