//! Storage abstraction over the synchronized folder.
//!
//! This module provides a trait-based interface for the folder a device keeps
//! in sync (local disk, or memory for tests), content checksums computed over
//! it, and a provider registry for resolving a provider from configuration.
//!
//! # Design Principles
//! - Async operations: all I/O goes through tokio
//! - Chunk-level access: transfers read and write fixed-size slices in place
//! - Unified error semantics: consistent error types across providers

pub mod checksum;
pub mod local;
pub mod memory;
pub mod provider;
pub mod registry;

pub use checksum::{content_hash, ContentHash};
pub use local::LocalProvider;
pub use memory::MemoryProvider;
pub use provider::{Metadata, StorageProvider};
pub use registry::{create_default_registry, ProviderFactory, ProviderRegistry};

/// Fixed transfer and hashing granularity: 1 MiB.
pub const CHUNK_SIZE: usize = 1024 * 1024;

/// Name of the per-folder state directory at the root. Providers never
/// report it from `list`, so it stays out of walks and scans.
pub const STATE_DIR_NAME: &str = ".peersync";
