//! Peer messaging for peersync.
//!
//! Every multi-peer protocol is built from exchanges: a request sent to a set
//! of peer addresses, responses collected under the exchange's id, and a
//! bounded wait for "all sent and all answered". This crate provides:
//! - Wire messages and envelopes
//! - The `Transport` and `PeerDirectory` seams
//! - The exchange coordinator with scoped registration
//! - An inbound dispatch loop routing requests to a `RequestHandler`
//! - An in-memory network for tests and local demos

pub mod countdown;
pub mod endpoint;
pub mod exchange;
pub mod memory;
pub mod message;
pub mod transport;

pub use countdown::Countdown;
pub use endpoint::{serve, RequestHandler};
pub use exchange::{Coordinator, Exchange, ExchangeOutcome, Response};
pub use memory::{Inbox, MemoryNetwork, MemoryTransport};
pub use message::{Chunk, Envelope, ExchangeId, Message, CHUNK_DONE};
pub use transport::{PeerDirectory, Transport};
