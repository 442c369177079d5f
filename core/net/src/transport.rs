//! Seams to the message transport and the peer directory.

use async_trait::async_trait;

use crate::message::Envelope;
use peersync_common::{PeerAddress, PeerRef, Result};

/// Delivers envelopes to peer addresses.
///
/// Delivery is best effort: an `Ok` return means the envelope left this
/// device, not that the peer processed it.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Address other peers reach this device at.
    fn local_address(&self) -> &PeerAddress;

    /// Send one envelope to one address.
    ///
    /// # Errors
    /// - Peer unreachable or the send failed
    async fn send(&self, to: &PeerAddress, envelope: Envelope) -> Result<()>;
}

/// Resolves which devices of a user are currently online.
#[async_trait]
pub trait PeerDirectory: Send + Sync {
    /// Reachable devices of `user`, including this one if it is online.
    async fn reachable_devices(&self, user: &str) -> Result<Vec<PeerRef>>;
}
