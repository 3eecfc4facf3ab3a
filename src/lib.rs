//! `branch-snapshot` — branches trading money over reliable UDP links, with
//! Chandy–Lamport global snapshots.
//!
//! # Architecture
//!
//! ```text
//!  ┌───────────────────────── branch loop (one task) ─────────────────────┐
//!  │   ┌──────────┐  apply_incoming   ┌──────────────────────┐           │
//!  │   │  Ledger  │──────────────────▶│ SnapshotCoordinator  │           │
//!  │   └────▲─────┘   (observer)      └──────────▲───────────┘           │
//!  │        │ Transfer                           │ Marker                │
//!  │   ┌────┴─────────────────────────────────────┴──┐                    │
//!  │   │                   Router                    │                    │
//!  │   └────┬──────────────────────────────────▲─────┘                    │
//!  └────────┼──────────────────────────────────┼──────────────────────────┘
//!           │ send / DeliveryHandle            │ Inbound
//!  ┌────────▼──────────────────────────────────┴─────┐
//!  │ Transport: link worker per peer + receive task  │
//!  └────────┬────────────────────────────────────────┘
//!           │ frames
//!  ┌────────▼──────┐
//!  │    Socket     │  (tokio UdpSocket, optional fault simulator)
//!  └───────────────┘
//! ```
//!
//! Each module has a single responsibility:
//! - [`packet`]     — wire format (serialise / deserialise)
//! - [`socket`]     — async UDP socket speaking frames
//! - [`simulator`]  — optional loss/duplication/reorder model for testing
//! - [`timer`]      — cooperative retransmit timer
//! - [`sender`]     — per-link outbound stop-and-wait state
//! - [`receiver`]   — per-link inbound duplicate filter
//! - [`transport`]  — reliable, ordered, at-most-once delivery between branches
//! - [`router`]     — inbound dispatch and outbound sends for the branch loop
//! - [`ledger`]     — available/reserved balances and random transfers
//! - [`snapshot`]   — snapshot coordinator and records
//! - [`state`]      — snapshot status FSM type
//! - [`branch`]     — the branch loop and its control handle
//! - [`config`]     — peer table and tunables

pub mod branch;
pub mod config;
pub mod ledger;
pub mod packet;
pub mod receiver;
pub mod router;
pub mod sender;
pub mod simulator;
pub mod snapshot;
pub mod socket;
pub mod state;
pub mod timer;
pub mod transport;

pub use branch::{Balances, Branch, BranchError};
pub use config::{BranchConfig, NetworkConfig, PeerTable};
pub use packet::{Message, PeerId, SnapshotId};
pub use snapshot::{global_total, SnapshotLookup, SnapshotRecord};
