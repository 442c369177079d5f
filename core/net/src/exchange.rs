//! Exchange coordinator.
//!
//! An exchange is registered in the coordinator's table for as long as its
//! `Exchange` handle lives; dropping the handle unregisters it, so a caller
//! that gives up on an exchange can never leak its route. Each request round
//! tracks two countdowns, one for requests physically sent and one for
//! distinct peers that answered. Responses arriving for an unregistered
//! exchange or a stale round are logged and dropped.

use dashmap::DashMap;
use futures::future::join_all;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};

use crate::countdown::Countdown;
use crate::message::{Envelope, ExchangeId, Message};
use crate::transport::Transport;
use peersync_common::{DeviceId, Error, PeerAddress, PeerRef, Result};

/// One peer's answer within an exchange.
#[derive(Debug, Clone)]
pub struct Response {
    pub from: PeerRef,
    pub body: Message,
}

/// What an exchange round produced by the time its wait returned.
#[derive(Debug, Clone)]
pub struct ExchangeOutcome {
    /// Answers in arrival order, at most one per responding device.
    pub responses: Vec<Response>,
    /// Whether every target answered (as opposed to the wait timing out).
    pub completed: bool,
}

impl ExchangeOutcome {
    /// The answer from a specific device, if it arrived.
    pub fn from_device(&self, device: &DeviceId) -> Option<&Response> {
        self.responses.iter().find(|r| &r.from.device == device)
    }
}

struct Round {
    sequence: u64,
    sent: Arc<Countdown>,
    received: Arc<Countdown>,
    responders: HashSet<DeviceId>,
    responses: Vec<Response>,
}

impl Round {
    fn new(sequence: u64, targets: usize) -> Self {
        Self {
            sequence,
            sent: Arc::new(Countdown::new(targets)),
            received: Arc::new(Countdown::new(targets)),
            responders: HashSet::new(),
            responses: Vec::new(),
        }
    }
}

struct ExchangeState {
    round: Mutex<Round>,
}

impl ExchangeState {
    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Round>> {
        self.round
            .lock()
            .map_err(|_| Error::Protocol("Exchange state poisoned".to_string()))
    }

    /// Record a response. Returns whether it was accepted into the round.
    fn on_response(&self, envelope: Envelope) -> Result<bool> {
        let mut round = self.lock()?;
        if envelope.sequence != round.sequence {
            debug!(
                "Dropping {} for round {} of exchange {} (current round {})",
                envelope.body.kind(),
                envelope.sequence,
                envelope.exchange,
                round.sequence
            );
            return Ok(false);
        }
        if !round.responders.insert(envelope.sender.device.clone()) {
            debug!(
                "Dropping duplicate {} from {} in exchange {}",
                envelope.body.kind(),
                envelope.sender,
                envelope.exchange
            );
            return Ok(false);
        }

        round.responses.push(Response {
            from: envelope.sender,
            body: envelope.body,
        });
        round.received.count_down();
        Ok(true)
    }
}

/// Per-device entry point for starting exchanges and routing their responses.
#[derive(Clone)]
pub struct Coordinator {
    local: PeerRef,
    transport: Arc<dyn Transport>,
    exchanges: Arc<DashMap<ExchangeId, Arc<ExchangeState>>>,
}

impl Coordinator {
    pub fn new(local: PeerRef, transport: Arc<dyn Transport>) -> Self {
        Self {
            local,
            transport,
            exchanges: Arc::new(DashMap::new()),
        }
    }

    /// This device's identity.
    pub fn local(&self) -> &PeerRef {
        &self.local
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Register a new exchange. It stays routable until the handle drops.
    pub fn open(&self) -> Exchange {
        let id = ExchangeId::new();
        let state = Arc::new(ExchangeState {
            round: Mutex::new(Round::new(0, 0)),
        });
        self.exchanges.insert(id, state.clone());
        debug!("Exchange {} opened by {}", id, self.local);

        Exchange {
            id,
            state,
            coordinator: self.clone(),
            next_sequence: 0,
        }
    }

    /// Send one request to every target and wait for the round to finish.
    pub async fn request(
        &self,
        targets: &[PeerAddress],
        body: Message,
        timeout: Duration,
    ) -> Result<ExchangeOutcome> {
        let mut exchange = self.open();
        exchange.send_request(targets, body)?;
        exchange.wait(timeout).await
    }

    /// Route a response to the exchange it belongs to.
    ///
    /// Returns whether the response was accepted.
    pub fn on_response(&self, envelope: Envelope) -> bool {
        let state = match self.exchanges.get(&envelope.exchange) {
            Some(entry) => entry.value().clone(),
            None => {
                debug!(
                    "Dropping {} from {} for unknown exchange {}",
                    envelope.body.kind(),
                    envelope.sender,
                    envelope.exchange
                );
                return false;
            }
        };

        match state.on_response(envelope) {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("Failed to record response: {}", e);
                false
            }
        }
    }

    /// Answer a request on behalf of this device.
    pub async fn reply(&self, request: &Envelope, body: Message) -> Result<()> {
        let envelope = request.reply(self.local.clone(), body);
        self.transport.send(&request.sender.address, envelope).await
    }

    /// Number of exchanges currently registered.
    pub fn active_exchanges(&self) -> usize {
        self.exchanges.len()
    }
}

/// Scoped handle on a registered exchange.
pub struct Exchange {
    id: ExchangeId,
    state: Arc<ExchangeState>,
    coordinator: Coordinator,
    next_sequence: u64,
}

impl Exchange {
    pub fn id(&self) -> ExchangeId {
        self.id
    }

    /// Start a new request round, dispatching `body` to every target.
    ///
    /// Dispatch runs in the background, concurrently per target. A target
    /// that cannot be reached still counts as sent but never answers, which
    /// lets the wait run into its timeout rather than block.
    pub fn send_request(&mut self, targets: &[PeerAddress], body: Message) -> Result<()> {
        let sequence = self.next_sequence;
        self.next_sequence += 1;

        let sent = {
            let mut round = self.state.lock()?;
            *round = Round::new(sequence, targets.len());
            round.sent.clone()
        };

        debug!(
            "Exchange {} round {}: sending {} to {} peer(s)",
            self.id,
            sequence,
            body.kind(),
            targets.len()
        );

        let envelope = Envelope {
            exchange: self.id,
            sequence,
            sender: self.coordinator.local.clone(),
            receivers: targets.to_vec(),
            body,
        };
        let transport = self.coordinator.transport.clone();
        let targets = targets.to_vec();

        tokio::spawn(async move {
            let sends = targets.iter().map(|target| {
                let transport = transport.clone();
                let envelope = envelope.clone();
                let sent = sent.clone();
                async move {
                    if let Err(e) = transport.send(target, envelope).await {
                        warn!("Failed to send to {}: {}", target, e);
                    }
                    sent.count_down();
                }
            });
            join_all(sends).await;
        });

        Ok(())
    }

    /// Wait until every request was sent and every target answered, or until
    /// `timeout` elapses. Either way the responses collected so far are
    /// returned.
    pub async fn wait(&self, timeout: Duration) -> Result<ExchangeOutcome> {
        let (sent, received) = {
            let round = self.state.lock()?;
            (round.sent.clone(), round.received.clone())
        };

        let completed = tokio::time::timeout(timeout, async {
            sent.wait().await;
            received.wait().await;
        })
        .await
        .is_ok();

        let round = self.state.lock()?;
        if completed {
            debug!("Exchange {} round {} complete", self.id, round.sequence);
        } else {
            debug!(
                "Exchange {} round {} timed out with {} response(s), {} missing",
                self.id,
                round.sequence,
                round.responses.len(),
                round.received.remaining()
            );
        }

        Ok(ExchangeOutcome {
            responses: round.responses.clone(),
            completed,
        })
    }

    /// Whether every target of the current round has answered.
    pub fn is_completed(&self) -> bool {
        self.state
            .lock()
            .map(|round| round.sent.is_zero() && round.received.is_zero())
            .unwrap_or(false)
    }
}

impl Drop for Exchange {
    fn drop(&mut self) {
        self.coordinator.exchanges.remove(&self.id);
        debug!("Exchange {} closed", self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryNetwork;
    use peersync_common::DeviceId;

    fn peer(device: &str) -> PeerRef {
        PeerRef::new(
            "alice",
            DeviceId::new(device).unwrap(),
            PeerAddress::new(format!("mem://{}", device)),
        )
    }

    async fn answer_all(coordinator: Coordinator, mut inbox: crate::memory::Inbox, body: Message) {
        while let Some(request) = inbox.recv().await {
            let _ = coordinator.reply(&request, body.clone()).await;
        }
    }

    #[tokio::test]
    async fn test_request_collects_all_responses() {
        let network = MemoryNetwork::new();
        let (a_transport, mut a_inbox) = network.join(peer("a")).await;
        let a = Coordinator::new(peer("a"), Arc::new(a_transport));

        for name in ["b", "c"] {
            let (transport, inbox) = network.join(peer(name)).await;
            let coordinator = Coordinator::new(peer(name), Arc::new(transport));
            tokio::spawn(answer_all(coordinator, inbox, Message::Ack));
        }

        // Responses come back to a's inbox; route them by hand.
        let router = {
            let a = a.clone();
            tokio::spawn(async move {
                while let Some(envelope) = a_inbox.recv().await {
                    a.on_response(envelope);
                }
            })
        };

        let outcome = a
            .request(
                &[peer("b").address, peer("c").address],
                Message::SnapshotFetchRequest,
                Duration::from_secs(2),
            )
            .await
            .unwrap();

        assert!(outcome.completed);
        assert_eq!(outcome.responses.len(), 2);
        assert!(outcome.from_device(&DeviceId::new("c").unwrap()).is_some());
        assert_eq!(a.active_exchanges(), 0);
        router.abort();
    }

    #[tokio::test]
    async fn test_unreachable_target_times_out_with_partial_result() {
        let network = MemoryNetwork::new();
        let (a_transport, mut a_inbox) = network.join(peer("a")).await;
        let a = Coordinator::new(peer("a"), Arc::new(a_transport));

        let (b_transport, b_inbox) = network.join(peer("b")).await;
        tokio::spawn(answer_all(
            Coordinator::new(peer("b"), Arc::new(b_transport)),
            b_inbox,
            Message::Ack,
        ));
        {
            let a = a.clone();
            tokio::spawn(async move {
                while let Some(envelope) = a_inbox.recv().await {
                    a.on_response(envelope);
                }
            });
        }

        let outcome = a
            .request(
                &[peer("b").address, PeerAddress::new("mem://nowhere")],
                Message::SnapshotFetchRequest,
                Duration::from_millis(100),
            )
            .await
            .unwrap();

        assert!(!outcome.completed);
        assert_eq!(outcome.responses.len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_and_stale_responses_are_dropped() {
        let network = MemoryNetwork::new();
        let (a_transport, _a_inbox) = network.join(peer("a")).await;
        let a = Coordinator::new(peer("a"), Arc::new(a_transport));

        let mut exchange = a.open();
        exchange.send_request(&[peer("b").address], Message::SnapshotFetchRequest).unwrap();

        let response = Envelope {
            exchange: exchange.id(),
            sequence: 0,
            sender: peer("b"),
            receivers: vec![peer("a").address],
            body: Message::Ack,
        };
        assert!(a.on_response(response.clone()));
        assert!(!a.on_response(response.clone()));

        exchange.send_request(&[peer("b").address], Message::SnapshotFetchRequest).unwrap();
        assert!(!a.on_response(response.clone()));

        let current = Envelope { sequence: 1, ..response.clone() };
        assert!(a.on_response(current));
        let outcome = exchange.wait(Duration::from_secs(1)).await.unwrap();
        assert!(outcome.completed);
        assert!(exchange.is_completed());

        drop(exchange);
        assert!(!a.on_response(response));
    }
}
