//! Branch ledger: balance bookkeeping and random transfer generation.
//!
//! Money is split in two buckets:
//! - `available`: may be spent by the next random transfer;
//! - `reserved`: already sent, waiting for the peer's ack.
//!
//! A transfer moves its amount from `available` to `reserved` when it is
//! dispatched and leaves `reserved` once delivery is confirmed.  All methods
//! take `&mut self` and are only ever called from the branch loop, so the
//! two buckets never disagree with each other.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

use crate::packet::PeerId;

/// Upper bound of one random transfer.
pub const MAX_TRANSFER: u64 = 100;

/// Sink for inbound transfer events, consulted before the money is credited.
pub trait TransferObserver {
    fn on_transfer_observed(&mut self, from: PeerId, amount: u64);
}

/// An outgoing transfer whose amount is currently reserved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingTransfer {
    pub to: PeerId,
    pub amount: u64,
}

/// Round-robin over a shuffled permutation of the other branches.
///
/// Every peer is picked exactly once per cycle; the order is reshuffled at
/// the start of each new cycle.
#[derive(Debug, Clone)]
pub struct DestinationCycle {
    order: Vec<PeerId>,
    next: usize,
}

impl DestinationCycle {
    pub fn new(peers: impl IntoIterator<Item = PeerId>, rng: &mut impl Rng) -> Self {
        let mut order: Vec<PeerId> = peers.into_iter().collect();
        order.shuffle(rng);
        Self { order, next: 0 }
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn next(&mut self, rng: &mut impl Rng) -> Option<PeerId> {
        if self.order.is_empty() {
            return None;
        }
        if self.next == self.order.len() {
            self.order.shuffle(rng);
            self.next = 0;
        }
        let peer = self.order[self.next];
        self.next += 1;
        Some(peer)
    }
}

#[derive(Debug)]
pub struct Ledger {
    available: u64,
    reserved: u64,
    max_transfer: u64,
    destinations: DestinationCycle,
    rng: StdRng,
}

impl Ledger {
    /// `peers` are the other branches (self excluded).
    pub fn new(
        initial_balance: u64,
        peers: impl IntoIterator<Item = PeerId>,
        max_transfer: u64,
    ) -> Self {
        let rng = StdRng::from_rng(&mut rand::rng());
        Self::with_rng(initial_balance, peers, max_transfer, rng)
    }

    /// Same as [`Ledger::new`] with a caller-provided RNG, for reproducible runs.
    pub fn with_rng(
        initial_balance: u64,
        peers: impl IntoIterator<Item = PeerId>,
        max_transfer: u64,
        mut rng: StdRng,
    ) -> Self {
        let destinations = DestinationCycle::new(peers, &mut rng);
        Self {
            available: initial_balance,
            reserved: 0,
            max_transfer: max_transfer.max(1),
            destinations,
            rng,
        }
    }

    pub fn available(&self) -> u64 {
        self.available
    }

    pub fn reserved(&self) -> u64 {
        self.reserved
    }

    /// `available + reserved`.
    pub fn total(&self) -> u64 {
        self.available + self.reserved
    }

    /// Pick a random amount and destination and reserve the amount.
    ///
    /// Returns `None` when nothing is available or there is nobody to pay.
    pub fn generate_random_transfer(&mut self) -> Option<PendingTransfer> {
        if self.available == 0 || self.destinations.is_empty() {
            return None;
        }
        let upper = self.max_transfer.min(self.available);
        let amount = self.rng.random_range(1..=upper);
        let to = self.destinations.next(&mut self.rng)?;
        self.reserve(PendingTransfer { to, amount });
        Some(PendingTransfer { to, amount })
    }

    /// Reserve an explicit transfer.  Returns `false` if funds are short.
    pub fn try_reserve(&mut self, transfer: PendingTransfer) -> bool {
        if transfer.amount == 0 || transfer.amount > self.available {
            return false;
        }
        self.reserve(transfer);
        true
    }

    fn reserve(&mut self, transfer: PendingTransfer) {
        self.available -= transfer.amount;
        self.reserved += transfer.amount;
    }

    /// The peer acknowledged the transfer: release its reservation.
    pub fn on_transfer_delivered(&mut self, transfer: PendingTransfer) {
        debug_assert!(transfer.amount <= self.reserved, "release exceeds reservation");
        self.reserved = self.reserved.saturating_sub(transfer.amount);
    }

    /// The transfer could not be dispatched at all: give the money back.
    pub fn abort_transfer(&mut self, transfer: PendingTransfer) {
        debug_assert!(transfer.amount <= self.reserved, "abort exceeds reservation");
        let amount = transfer.amount.min(self.reserved);
        self.reserved -= amount;
        self.available += amount;
    }

    /// Credit an inbound transfer, reporting it to `observer` first.
    pub fn apply_incoming(
        &mut self,
        from: PeerId,
        amount: u64,
        observer: &mut impl TransferObserver,
    ) {
        observer.on_transfer_observed(from, amount);
        self.available += amount;
    }
}
