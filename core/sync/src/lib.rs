//! Peersync reconciliation engine
//!
//! This crate brings the replicas of a synchronized folder back into
//! agreement, including:
//! - Chunked file transfer with end-to-end checksum verification
//! - Leader election for the blocking run variant
//! - Snapshot fetch and per-path merge classification
//! - Conflict file materialization
//! - The background syncer that drives a run, and its scheduler

pub mod config;
pub mod conflict;
pub mod device;
pub mod election;
pub mod events;
pub mod handlers;
pub mod pipeline;
pub mod propagate;
pub mod retry;
pub mod scheduler;
pub mod state;
pub mod syncer;
pub mod transfer;

// Re-export main types
pub use config::{SyncConfig, SyncVariant};
pub use conflict::{
    conflict_name, conflict_name_numbered, conflict_path, create_conflict_file, parse_conflict_name,
};
pub use device::DeviceContext;
pub use election::{elect_master, ElectionOutcome};
pub use events::{EventKind, EventWatcher, FolderEvent, SuspendGuard};
pub use handlers::SyncHandler;
pub use pipeline::{
    classify, fetch_all_snapshots, merge_one, Classification, MergeEntry, MergeResult,
    ReconcilePlan,
};
pub use propagate::{delete_on_peers, move_on_peers, PeerAnswers};
pub use retry::{RestartBudget, RetryConfig};
pub use scheduler::{SyncMode, SyncRequest, SyncScheduler, SyncSchedulerHandle};
pub use state::{RunReport, SyncPhase};
pub use syncer::{reconcile_plan, BackgroundSyncer};
pub use transfer::{fetch_path, push_path, push_to_peers, TransferReport};
