//! Common utilities and types shared across the peersync crates.
//!
//! This module provides the foundational identity and path types used by the
//! storage, history, network and reconciliation layers, plus the shared error
//! type every library crate returns.

pub mod error;
pub mod types;

pub use error::{Error, Result};
pub use types::{DeviceId, FolderPath, PeerAddress, PeerRef};
