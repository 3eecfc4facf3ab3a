//! Bootstrap configuration: the peer table and tunables.
//!
//! A network is described by one TOML file shared by every branch; each
//! process picks its own entry by id.  See [`NetworkConfig::from_toml_str`]
//! for the format.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::ledger::MAX_TRANSFER;
use crate::packet::PeerId;
use crate::simulator::SimulatorConfig;
use crate::timer::DEFAULT_ACK_TIMEOUT;

const DEFAULT_INITIAL_BALANCE: u64 = 1000;
const DEFAULT_TRANSFER_PERIOD_MS: u64 = 200;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("cannot parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("config lists no branches")]
    NoBranches,
    #[error("branch {0} is listed more than once")]
    DuplicatePeer(PeerId),
    #[error("local branch {0} is not in the peer table")]
    UnknownLocalPeer(PeerId),
}

/// Immutable mapping from branch id to network address.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerTable {
    peers: BTreeMap<PeerId, SocketAddr>,
}

impl PeerTable {
    pub fn new(peers: BTreeMap<PeerId, SocketAddr>) -> Self {
        Self { peers }
    }

    pub fn address(&self, id: PeerId) -> Option<SocketAddr> {
        self.peers.get(&id).copied()
    }

    pub fn contains(&self, id: PeerId) -> bool {
        self.peers.contains_key(&id)
    }

    /// All ids, ascending.
    pub fn ids(&self) -> impl Iterator<Item = PeerId> + '_ {
        self.peers.keys().copied()
    }

    /// Every peer except `local`.
    pub fn others(&self, local: PeerId) -> impl Iterator<Item = (PeerId, SocketAddr)> + '_ {
        self.peers
            .iter()
            .filter(move |(id, _)| **id != local)
            .map(|(id, addr)| (*id, *addr))
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

impl FromIterator<(PeerId, SocketAddr)> for PeerTable {
    fn from_iter<I: IntoIterator<Item = (PeerId, SocketAddr)>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

/// Reliable transport tunables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportConfig {
    /// Retransmit timeout for an unacknowledged message.
    pub ack_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            ack_timeout: DEFAULT_ACK_TIMEOUT,
        }
    }
}

/// Ledger tunables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerConfig {
    /// Period of random transfer generation; `None` disables it.
    pub transfer_period: Option<Duration>,
    /// Upper bound of a single random transfer.
    pub max_transfer: u64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            transfer_period: Some(Duration::from_millis(DEFAULT_TRANSFER_PERIOD_MS)),
            max_transfer: MAX_TRANSFER,
        }
    }
}

/// Everything one branch needs to start.
#[derive(Debug, Clone)]
pub struct BranchConfig {
    pub local_id: PeerId,
    pub initial_balance: u64,
    pub peers: PeerTable,
    pub transport: TransportConfig,
    pub ledger: LedgerConfig,
    pub faults: Option<SimulatorConfig>,
}

impl BranchConfig {
    /// Build a config with default tunables.
    pub fn new(local_id: PeerId, initial_balance: u64, peers: PeerTable) -> Self {
        Self {
            local_id,
            initial_balance,
            peers,
            transport: TransportConfig::default(),
            ledger: LedgerConfig::default(),
            faults: None,
        }
    }

    /// Fails with [`ConfigError::UnknownLocalPeer`] if the local id has no address.
    pub fn validate(&self) -> Result<SocketAddr, ConfigError> {
        self.peers
            .address(self.local_id)
            .ok_or(ConfigError::UnknownLocalPeer(self.local_id))
    }
}

// ---------------------------------------------------------------------------
// File format
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    transport: TransportSection,
    #[serde(default)]
    ledger: LedgerSection,
    simulator: Option<SimulatorConfig>,
    #[serde(default)]
    branches: Vec<BranchEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct TransportSection {
    ack_timeout_ms: u64,
}

impl Default for TransportSection {
    fn default() -> Self {
        Self {
            ack_timeout_ms: DEFAULT_ACK_TIMEOUT.as_millis() as u64,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct LedgerSection {
    initial_balance: u64,
    transfer_period_ms: u64,
    max_transfer: u64,
}

impl Default for LedgerSection {
    fn default() -> Self {
        Self {
            initial_balance: DEFAULT_INITIAL_BALANCE,
            transfer_period_ms: DEFAULT_TRANSFER_PERIOD_MS,
            max_transfer: MAX_TRANSFER,
        }
    }
}

#[derive(Debug, Deserialize)]
struct BranchEntry {
    id: PeerId,
    address: SocketAddr,
    initial_balance: Option<u64>,
}

/// The whole network as described by a config file.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    pub peers: PeerTable,
    pub balances: BTreeMap<PeerId, u64>,
    pub transport: TransportConfig,
    pub ledger: LedgerConfig,
    pub faults: Option<SimulatorConfig>,
}

impl NetworkConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Parse a network description.
    ///
    /// ```toml
    /// [transport]
    /// ack_timeout_ms = 1000
    ///
    /// [ledger]
    /// initial_balance = 1000
    /// transfer_period_ms = 200   # 0 disables random transfers
    /// max_transfer = 100
    ///
    /// [[branches]]
    /// id = 1
    /// address = "127.0.0.1:7001"
    /// ```
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let file: ConfigFile = toml::from_str(text)?;
        if file.branches.is_empty() {
            return Err(ConfigError::NoBranches);
        }

        let mut peers = BTreeMap::new();
        let mut balances = BTreeMap::new();
        for entry in file.branches {
            if peers.insert(entry.id, entry.address).is_some() {
                return Err(ConfigError::DuplicatePeer(entry.id));
            }
            balances.insert(
                entry.id,
                entry.initial_balance.unwrap_or(file.ledger.initial_balance),
            );
        }

        let transfer_period = match file.ledger.transfer_period_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        };

        Ok(Self {
            peers: PeerTable::new(peers),
            balances,
            transport: TransportConfig {
                ack_timeout: Duration::from_millis(file.transport.ack_timeout_ms),
            },
            ledger: LedgerConfig {
                transfer_period,
                max_transfer: file.ledger.max_transfer,
            },
            faults: file.simulator,
        })
    }

    /// Configuration for the branch with id `local_id`.
    pub fn branch(&self, local_id: PeerId) -> Result<BranchConfig, ConfigError> {
        let initial_balance = *self
            .balances
            .get(&local_id)
            .ok_or(ConfigError::UnknownLocalPeer(local_id))?;
        Ok(BranchConfig {
            local_id,
            initial_balance,
            peers: self.peers.clone(),
            transport: self.transport.clone(),
            ledger: self.ledger.clone(),
            faults: self.faults.clone(),
        })
    }

    /// Sum of every branch's initial balance: the money supply.
    pub fn total_supply(&self) -> u64 {
        self.balances.values().sum()
    }
}
