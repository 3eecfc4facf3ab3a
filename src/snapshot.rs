//! Chandy–Lamport snapshot coordination for one branch.
//!
//! The coordinator is a pure state machine: it never touches the network.
//! Operations that require markers to be sent return a [`MarkerBroadcast`]
//! which the router turns into messages.
//!
//! Per snapshot id:
//! - Local state is recorded once, either by [`SnapshotCoordinator::start_snapshot`]
//!   or by the first marker received.
//! - Each incoming channel stays open until a marker arrives on it.  Transfers
//!   observed on an open channel are added to that channel's state.
//! - Once every other branch's marker has arrived the record is completed.
//!
//! Snapshots with different ids are independent.  A branch refuses to
//! *initiate* while it is recording, but a marker for a new id always starts
//! a record, even if another snapshot is still open here.  Two branches that
//! initiate at the same moment therefore both complete.
//!
//! Per-link FIFO delivery from [`crate::transport`] guarantees that a transfer
//! sent after a marker is never observed before it.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use thiserror::Error;

use crate::ledger::TransferObserver;
use crate::packet::{PeerId, SnapshotId};
use crate::state::SnapshotStatus;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SnapshotError {
    #[error("snapshot {active} is still recording")]
    AlreadyActive { active: SnapshotId },
    #[error("snapshot {0} was already taken")]
    AlreadyTaken(SnapshotId),
}

/// This branch's part of one global snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotRecord {
    pub id: SnapshotId,
    pub status: SnapshotStatus,
    /// Local balance at the instant recording began.
    pub recorded_balance: u64,
    /// Money observed in flight on each incoming channel.
    pub channel_state: BTreeMap<PeerId, u64>,
    /// Channels already closed by a marker.
    pub markers_seen: BTreeSet<PeerId>,
}

impl SnapshotRecord {
    fn recording(id: SnapshotId, recorded_balance: u64) -> Self {
        Self {
            id,
            status: SnapshotStatus::Recording,
            recorded_balance,
            channel_state: BTreeMap::new(),
            markers_seen: BTreeSet::new(),
        }
    }

    /// Total money captured on incoming channels.
    pub fn in_flight(&self) -> u64 {
        self.channel_state.values().sum()
    }

    /// This branch's contribution to the global total.
    pub fn contribution(&self) -> u64 {
        self.recorded_balance + self.in_flight()
    }
}

/// Outcome of a result query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnapshotLookup {
    NotFound,
    StillRecording,
    Completed(SnapshotRecord),
}

/// Markers the router must send for `snapshot_id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarkerBroadcast {
    pub snapshot_id: SnapshotId,
    pub destinations: Vec<PeerId>,
}

/// Sum of the contributions of a set of completed records.
pub fn global_total<'a>(records: impl IntoIterator<Item = &'a SnapshotRecord>) -> u64 {
    records.into_iter().map(SnapshotRecord::contribution).sum()
}

#[derive(Debug)]
pub struct SnapshotCoordinator {
    local_id: PeerId,
    /// Every other branch.
    peers: BTreeSet<PeerId>,
    records: HashMap<SnapshotId, SnapshotRecord>,
    /// Completed records already handed over by [`SnapshotCoordinator::take`].
    consumed: BTreeSet<SnapshotId>,
    /// Ids currently recording.
    recording: BTreeSet<SnapshotId>,
}

impl SnapshotCoordinator {
    pub fn new(local_id: PeerId, peers: impl IntoIterator<Item = PeerId>) -> Self {
        Self {
            local_id,
            peers: peers.into_iter().filter(|p| *p != local_id).collect(),
            records: HashMap::new(),
            consumed: BTreeSet::new(),
            recording: BTreeSet::new(),
        }
    }

    /// The lowest snapshot id currently recording, if any.
    pub fn active(&self) -> Option<SnapshotId> {
        self.recording.first().copied()
    }

    /// Every snapshot id currently recording, ascending.
    pub fn recording(&self) -> impl Iterator<Item = SnapshotId> + '_ {
        self.recording.iter().copied()
    }

    /// Record local state and return the markers to broadcast.
    pub fn start_snapshot(
        &mut self,
        id: SnapshotId,
        balance: u64,
    ) -> Result<MarkerBroadcast, SnapshotError> {
        if let Some(active) = self.active() {
            return Err(SnapshotError::AlreadyActive { active });
        }
        if self.records.contains_key(&id) || self.consumed.contains(&id) {
            return Err(SnapshotError::AlreadyTaken(id));
        }
        log::info!(
            "[snapshot {id}] branch {} initiates with balance {balance}",
            self.local_id
        );
        Ok(self.begin(id, balance))
    }

    /// Handle a marker for `id` arriving from `from`.
    ///
    /// Returns the markers to broadcast when this is the first marker seen for
    /// `id`.
    pub fn on_marker(
        &mut self,
        from: PeerId,
        id: SnapshotId,
        balance: u64,
    ) -> Option<MarkerBroadcast> {
        if !self.peers.contains(&from) {
            log::warn!("[snapshot {id}] marker from unknown branch {from} ignored");
            return None;
        }

        if self.consumed.contains(&id) {
            log::debug!("[snapshot {id}] late marker from {from} ignored");
            return None;
        }

        let broadcast = match self.records.get(&id).map(|r| r.status) {
            Some(SnapshotStatus::Completed) => {
                log::debug!("[snapshot {id}] late marker from {from} ignored");
                return None;
            }
            Some(_) => None,
            None => {
                if let Some(active) = self.active() {
                    log::info!(
                        "[snapshot {id}] starts while snapshot {active} is still recording"
                    );
                }
                log::info!(
                    "[snapshot {id}] branch {} joins on marker from {from} with balance {balance}",
                    self.local_id
                );
                Some(self.begin(id, balance))
            }
        };

        if let Some(record) = self.records.get_mut(&id) {
            if !record.markers_seen.insert(from) {
                log::debug!("[snapshot {id}] duplicate marker from {from}");
            }
        }
        self.try_complete(id);
        broadcast
    }

    pub fn lookup(&self, id: SnapshotId) -> SnapshotLookup {
        match self.records.get(&id) {
            None => SnapshotLookup::NotFound,
            Some(r) if r.status == SnapshotStatus::Completed => {
                SnapshotLookup::Completed(r.clone())
            }
            Some(_) => SnapshotLookup::StillRecording,
        }
    }

    /// Like [`lookup`](Self::lookup), but a completed record is handed over
    /// and forgotten.  Its id stays unusable for new snapshots.
    pub fn take(&mut self, id: SnapshotId) -> SnapshotLookup {
        match self.records.get(&id).map(|r| r.status) {
            None => SnapshotLookup::NotFound,
            Some(SnapshotStatus::Completed) => match self.records.remove(&id) {
                Some(record) => {
                    self.consumed.insert(id);
                    SnapshotLookup::Completed(record)
                }
                None => SnapshotLookup::NotFound,
            },
            Some(_) => SnapshotLookup::StillRecording,
        }
    }

    fn begin(&mut self, id: SnapshotId, balance: u64) -> MarkerBroadcast {
        self.records.insert(id, SnapshotRecord::recording(id, balance));
        self.recording.insert(id);
        let broadcast = MarkerBroadcast {
            snapshot_id: id,
            destinations: self.peers.iter().copied().collect(),
        };
        // A lone branch has no channels to wait for.
        self.try_complete(id);
        broadcast
    }

    fn try_complete(&mut self, id: SnapshotId) {
        let Some(record) = self.records.get_mut(&id) else {
            return;
        };
        if record.status != SnapshotStatus::Recording
            || !self.peers.is_subset(&record.markers_seen)
        {
            return;
        }
        record.status = SnapshotStatus::Completed;
        self.recording.remove(&id);
        log::info!(
            "[snapshot {id}] branch {} completed: balance={} in_flight={} channels={:?}",
            self.local_id,
            record.recorded_balance,
            record.in_flight(),
            record.channel_state
        );
    }
}

impl TransferObserver for SnapshotCoordinator {
    fn on_transfer_observed(&mut self, from: PeerId, amount: u64) {
        for id in &self.recording {
            let Some(record) = self.records.get_mut(id) else {
                continue;
            };
            if record.markers_seen.contains(&from) {
                continue;
            }
            *record.channel_state.entry(from).or_insert(0) += amount;
            log::debug!("[snapshot {id}] in-flight {amount} on channel {from}");
        }
    }
}
