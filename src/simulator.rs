//! Optional network fault model for testing and demos.
//!
//! Real networks drop, reorder, and duplicate datagrams.  To exercise the
//! reliability mechanisms without depending on actual network conditions,
//! [`crate::socket::Socket`] can route every outgoing datagram through a
//! [`Simulator`], which decides what happens to it:
//!
//! | Fault            | Description                                      |
//! |------------------|--------------------------------------------------|
//! | Packet loss      | Drop a datagram with probability `loss_rate`.    |
//! | Reordering       | Delay a datagram by `reorder_delay_ms`, letting  |
//! |                  | later datagrams overtake it.                     |
//! | Duplication      | Deliver a datagram twice.                        |
//!
//! Datagrams are never corrupted.  The RNG is seeded so failures are
//! reproducible.

use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Deserialize;

/// Configuration for the fault-injection model.
///
/// All probabilities are in the range `[0.0, 1.0]`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SimulatorConfig {
    /// Probability that any given datagram is silently dropped.
    pub loss_rate: f64,
    /// Probability that a datagram is delayed and may be overtaken.
    pub reorder_rate: f64,
    /// Delay applied to reordered datagrams, in milliseconds.
    pub reorder_delay_ms: u64,
    /// Probability that a datagram is sent twice.
    pub duplicate_rate: f64,
    /// RNG seed; `None` seeds from OS entropy.
    pub seed: Option<u64>,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        // No faults by default: the simulator is a transparent pass-through.
        Self {
            loss_rate: 0.0,
            reorder_rate: 0.0,
            reorder_delay_ms: 0,
            duplicate_rate: 0.0,
            seed: None,
        }
    }
}

impl SimulatorConfig {
    pub fn reorder_delay(&self) -> Duration {
        Duration::from_millis(self.reorder_delay_ms)
    }
}

/// What to do with one copy of an outgoing datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Hand to the socket right away.
    Now,
    /// Hand to the socket after the given delay.
    After(Duration),
}

/// Fault-injecting decision maker.
#[derive(Debug)]
pub struct Simulator {
    config: SimulatorConfig,
    rng: StdRng,
}

impl Simulator {
    pub fn new(config: SimulatorConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_rng(&mut rand::rng()),
        };
        Self { config, rng }
    }

    pub fn config(&self) -> &SimulatorConfig {
        &self.config
    }

    /// Decide the fate of one outgoing datagram.
    ///
    /// Returns an empty plan when the datagram is lost, one entry normally,
    /// and two entries when it is duplicated.
    pub fn plan(&mut self) -> Vec<Delivery> {
        if self.roll(self.config.loss_rate) {
            return Vec::new();
        }
        let copies = if self.roll(self.config.duplicate_rate) { 2 } else { 1 };
        (0..copies)
            .map(|_| {
                if self.roll(self.config.reorder_rate) {
                    Delivery::After(self.config.reorder_delay())
                } else {
                    Delivery::Now
                }
            })
            .collect()
    }

    fn roll(&mut self, p: f64) -> bool {
        p > 0.0 && self.rng.random_bool(p.min(1.0))
    }
}
