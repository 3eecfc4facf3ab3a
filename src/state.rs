//! Snapshot finite-state machine types.
//!
//! Every snapshot id moves through the same states on every branch:
//!
//! ```text
//!  NOT_STARTED ──startSnapshot / first marker──▶ RECORDING
//!                                                   │
//!                               marker from every other branch
//!                                                   ▼
//!                                               COMPLETED (terminal)
//! ```
//!
//! Transitions live in [`crate::snapshot`]; this module only names states.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SnapshotStatus {
    /// No local state recorded yet for this id.
    #[default]
    NotStarted,
    /// Local state recorded; some incoming channels still open.
    Recording,
    /// Every incoming channel closed; the record is final.
    Completed,
}

impl SnapshotStatus {
    pub fn is_terminal(self) -> bool {
        self == SnapshotStatus::Completed
    }
}

impl fmt::Display for SnapshotStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SnapshotStatus::NotStarted => "not-started",
            SnapshotStatus::Recording => "recording",
            SnapshotStatus::Completed => "completed",
        };
        f.write_str(name)
    }
}
