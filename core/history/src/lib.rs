//! Version-history store for the synchronized folder.
//!
//! Every tracked path owns an append-only chain of versions. Chains are what
//! reconciliation compares across devices: a chain that strictly extends
//! another is newer, two chains that each advanced past their last common
//! version have diverged.
//!
//! The store serializes to a `Snapshot`, which in turn packs into a flat
//! archive container for transport between devices.

pub mod archive;
pub mod scan;
pub mod snapshot;
pub mod store;
pub mod version;

pub use archive::{Archive, ArchiveEntry};
pub use scan::scan_folder;
pub use snapshot::{Snapshot, StoreMeta};
pub use store::HistoryStore;
pub use version::{FileVersion, Lineage, PathHistory};
