//! Leader election for the blocking reconciliation variant.
//!
//! Highest device id wins. The initiator only ever talks to the top-ranked
//! device, which accepts unconditionally; if it does not answer in time the
//! initiator elects itself. Election therefore always terminates within one
//! exchange timeout.

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::device::DeviceContext;
use peersync_common::{PeerRef, Result};
use peersync_net::Message;

/// Result of one election.
#[derive(Debug, Clone)]
pub struct ElectionOutcome {
    pub leader: PeerRef,
    /// Network round trips spent, 0 or 1.
    pub round_trips: u32,
    /// The top-ranked device did not confirm, so the initiator took over.
    pub fell_back: bool,
}

impl ElectionOutcome {
    pub fn is_leader(&self, peer: &PeerRef) -> bool {
        self.leader == *peer
    }
}

/// Order candidates by rank, highest device id first.
pub fn rank(mut candidates: Vec<PeerRef>) -> Vec<PeerRef> {
    candidates.sort_by(|a, b| b.device.cmp(&a.device));
    candidates.dedup();
    candidates
}

/// Elect the leader among this user's reachable devices.
pub async fn elect_master(ctx: &DeviceContext) -> Result<ElectionOutcome> {
    let mut candidates = ctx.directory.reachable_devices(ctx.user()).await?;
    candidates.push(ctx.local.clone());
    let ranked = rank(candidates);

    let top = match ranked.first() {
        Some(top) if *top != ctx.local => top.clone(),
        _ => {
            info!("{} ranks highest and leads", ctx.local.device);
            return Ok(ElectionOutcome {
                leader: ctx.local.clone(),
                round_trips: 0,
                fell_back: false,
            });
        }
    };

    debug!("{} asking {} to confirm leadership", ctx.local.device, top);
    let outcome = ctx
        .coordinator
        .request(
            &[top.address.clone()],
            Message::ElectionRequest {
                timestamp: Utc::now(),
            },
            ctx.config.exchange_timeout,
        )
        .await?;

    // No answer from the top device counts as "not there": lead ourselves.
    let confirmed = match outcome.from_device(&top.device) {
        Some(response) => match &response.body {
            Message::ElectionResponse { accepted: true } => Some(response.from.clone()),
            other => {
                warn!("{} answered the election with {}", top, other.kind());
                None
            }
        },
        None => None,
    };

    match confirmed {
        Some(leader) => {
            info!("{} elected {}", ctx.local.device, leader);
            Ok(ElectionOutcome {
                leader,
                round_trips: 1,
                fell_back: false,
            })
        }
        None => {
            info!(
                "{} got no confirmation from {}, electing itself",
                ctx.local.device, top.device
            );
            Ok(ElectionOutcome {
                leader: ctx.local.clone(),
                round_trips: 1,
                fell_back: true,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{fast_config, Cluster};
    use peersync_common::{DeviceId, PeerAddress};
    use peersync_net::memory::Interceptor;
    use peersync_net::Envelope;
    use std::sync::Arc;

    #[test]
    fn test_rank_highest_first() {
        let peer = |d: &str| {
            PeerRef::new("alice", DeviceId::new(d).unwrap(), PeerAddress::new(format!("mem://{}", d)))
        };
        let ranked = rank(vec![peer("b"), peer("c"), peer("a"), peer("c")]);
        let order: Vec<&str> = ranked.iter().map(|p| p.device.as_str()).collect();
        assert_eq!(order, vec!["c", "b", "a"]);
    }

    #[tokio::test]
    async fn test_highest_device_leads_without_round_trips() {
        let cluster = Cluster::new(&["a", "b", "c"]).await;
        let outcome = elect_master(cluster.ctx("c")).await.unwrap();
        assert_eq!(outcome.leader.device.as_str(), "c");
        assert_eq!(outcome.round_trips, 0);
    }

    #[tokio::test]
    async fn test_lower_device_elects_top() {
        let cluster = Cluster::new(&["a", "b", "c"]).await;
        for device in ["a", "b"] {
            let outcome = elect_master(cluster.ctx(device)).await.unwrap();
            assert_eq!(outcome.leader.device.as_str(), "c");
            assert_eq!(outcome.round_trips, 1);
            assert!(!outcome.fell_back);
        }
    }

    #[tokio::test]
    async fn test_unanswered_election_falls_back_to_self() {
        let cluster = Cluster::with_config(&["a", "b"], fast_config()).await;
        let interceptor: Interceptor = Arc::new(|envelope: &mut Envelope| {
            !matches!(envelope.body, Message::ElectionRequest { .. })
        });
        cluster.network.set_interceptor(Some(interceptor)).await;

        let outcome = elect_master(cluster.ctx("a")).await.unwrap();
        assert!(outcome.is_leader(&cluster.peer("a")));
        assert!(outcome.fell_back);
    }

    #[tokio::test]
    async fn test_isolated_device_elects_itself() {
        let cluster = Cluster::new(&["a", "b"]).await;
        cluster.network.disconnect(&cluster.peer("b").address).await;

        let outcome = elect_master(cluster.ctx("a")).await.unwrap();
        assert!(outcome.is_leader(&cluster.peer("a")));
        assert_eq!(outcome.round_trips, 0);
    }
}
