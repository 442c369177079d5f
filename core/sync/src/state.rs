//! Reconciliation phases and run reports.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::config::millis;
use peersync_common::{FolderPath, PeerRef};

/// Where a reconciliation run is, or where it stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SyncPhase {
    Idle,
    ElectingOrSkipping,
    FetchingSnapshots,
    Merging,
    Reconciling,
    Resuming,
    Aborted,
}

impl fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SyncPhase::Idle => "idle",
            SyncPhase::ElectingOrSkipping => "electing",
            SyncPhase::FetchingSnapshots => "fetching-snapshots",
            SyncPhase::Merging => "merging",
            SyncPhase::Reconciling => "reconciling",
            SyncPhase::Resuming => "resuming",
            SyncPhase::Aborted => "aborted",
        };
        write!(f, "{}", name)
    }
}

/// Summary of one reconciliation run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    /// `Idle` once a run finished normally, `Aborted` otherwise.
    pub phase: SyncPhase,
    /// Why the run stopped early.
    pub abort_reason: Option<String>,
    /// Elected leader, blocking variant only.
    pub leader: Option<PeerRef>,
    /// Peers whose snapshot was merged.
    pub peers_merged: usize,
    pub deleted: usize,
    pub updated: usize,
    pub conflicts: usize,
    /// Conflict files created by this run.
    pub conflict_files: Vec<FolderPath>,
    /// Paths left alone because of an I/O fault or a racing local edit.
    pub skipped: usize,
    /// Notifications emitted for edits made during the run.
    pub synthetic_events: usize,
    #[serde(with = "millis")]
    pub duration: Duration,
}

impl RunReport {
    pub fn new() -> Self {
        Self {
            phase: SyncPhase::Idle,
            abort_reason: None,
            leader: None,
            peers_merged: 0,
            deleted: 0,
            updated: 0,
            conflicts: 0,
            conflict_files: Vec::new(),
            skipped: 0,
            synthetic_events: 0,
            duration: Duration::ZERO,
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.phase == SyncPhase::Aborted
    }

    pub(crate) fn abort(&mut self, reason: impl Into<String>) {
        self.phase = SyncPhase::Aborted;
        self.abort_reason = Some(reason.into());
    }
}

impl Default for RunReport {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_abort_records_reason() {
        let mut report = RunReport::new();
        assert!(!report.is_aborted());

        report.abort("another peer owns the run");
        assert!(report.is_aborted());
        assert_eq!(report.abort_reason.as_deref(), Some("another peer owns the run"));
    }

    #[test]
    fn test_report_serializes_duration_as_millis() {
        let mut report = RunReport::new();
        report.duration = Duration::from_millis(1500);
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["duration"], 1500);
        assert_eq!(json["phase"], "Idle");
    }
}
