//! The branch loop: one task that owns every piece of mutable branch state.
//!
//! ```text
//!   Branch (handle) ──BranchEvent──▶ ┐
//!   Router delivery tasks ─transfer─▶ ├─▶ branch_loop ──▶ Ledger
//!   Transport Inbound ──────────────▶ │                  SnapshotCoordinator
//!   transfer ticker ─────────────────▶ ┘
//! ```
//!
//! Inbound messages, periodic transfers, delivery confirmations, and control
//! requests are all multiplexed with `tokio::select!` onto this single task,
//! so the ledger and the coordinator are never mutated concurrently.  Network
//! I/O runs on the transport's own tasks.
//!
//! The [`Branch`] handle owns the only sender of control events: dropping it
//! ends the loop, which drops the transport and closes the socket.

use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval, Interval, MissedTickBehavior};

use crate::config::{BranchConfig, ConfigError};
use crate::ledger::{Ledger, PendingTransfer};
use crate::packet::{PeerId, SnapshotId};
use crate::router::Router;
use crate::snapshot::{SnapshotCoordinator, SnapshotLookup};
use crate::socket::{Socket, SocketError};
use crate::transport::{Inbound, Transport, TransportError};

#[derive(Debug, Error)]
pub enum BranchError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Socket(#[from] SocketError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("branch loop has stopped")]
    Stopped,
}

/// State owned by the branch loop.
#[derive(Debug)]
pub struct BranchState {
    pub ledger: Ledger,
    pub snapshots: SnapshotCoordinator,
}

/// Point-in-time view of the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Balances {
    pub available: u64,
    pub reserved: u64,
}

impl Balances {
    pub fn total(&self) -> u64 {
        self.available + self.reserved
    }
}

/// Everything the branch loop reacts to besides inbound messages and ticks.
#[derive(Debug)]
pub enum BranchEvent {
    StartSnapshot {
        id: SnapshotId,
        reply: oneshot::Sender<bool>,
    },
    Transfer {
        to: PeerId,
        amount: u64,
        reply: oneshot::Sender<bool>,
    },
    Balances {
        reply: oneshot::Sender<Balances>,
    },
    SnapshotResult {
        id: SnapshotId,
        consume: bool,
        reply: oneshot::Sender<SnapshotLookup>,
    },
    ActiveSnapshot {
        reply: oneshot::Sender<Option<SnapshotId>>,
    },
    Stop,
}

/// Handle to a running branch.
#[derive(Debug)]
pub struct Branch {
    id: PeerId,
    local_addr: SocketAddr,
    events: mpsc::UnboundedSender<BranchEvent>,
    task: JoinHandle<()>,
}

impl Branch {
    /// Bind the configured address and start the branch.
    ///
    /// Fault injection from `config.faults` is applied to the new socket.
    pub async fn start(config: BranchConfig) -> Result<Self, BranchError> {
        let addr = config.validate()?;
        let mut socket = Socket::bind(addr).await?;
        if let Some(faults) = config.faults.clone() {
            log::warn!("branch {}: fault injection enabled {faults:?}", config.local_id);
            socket = socket.with_faults(faults);
        }
        Self::start_on(config, socket)
    }

    /// Start the branch on an already-bound socket.
    pub fn start_on(config: BranchConfig, socket: Socket) -> Result<Self, BranchError> {
        config.validate()?;
        let local_id = config.local_id;
        let others: Vec<PeerId> = config.peers.others(local_id).map(|(id, _)| id).collect();

        let (transport, inbound) =
            Transport::start(local_id, &config.peers, socket, &config.transport)?;
        let local_addr = transport.local_addr();

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (delivered_tx, delivered_rx) = mpsc::unbounded_channel();
        let router = Router::new(transport, delivered_tx);
        let state = BranchState {
            ledger: Ledger::new(
                config.initial_balance,
                others.iter().copied(),
                config.ledger.max_transfer,
            ),
            snapshots: SnapshotCoordinator::new(local_id, others),
        };

        let task = tokio::spawn(branch_loop(
            state,
            router,
            inbound,
            events_rx,
            delivered_rx,
            config.ledger.transfer_period,
        ));
        log::info!(
            "branch {local_id} started on {local_addr} with balance {}",
            config.initial_balance
        );

        Ok(Self {
            id: local_id,
            local_addr,
            events: events_tx,
            task,
        })
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Initiate global snapshot `id`.
    ///
    /// Returns `false` if another snapshot is still recording here, `id` was
    /// already used, or the branch has stopped.
    pub async fn start_snapshot(&self, id: SnapshotId) -> bool {
        self.request(|reply| BranchEvent::StartSnapshot { id, reply })
            .await
            .unwrap_or(false)
    }

    /// Send `amount` to `to` right away, outside the random schedule.
    ///
    /// Returns `false` if funds are short or `to` is not a peer.
    pub async fn transfer(&self, to: PeerId, amount: u64) -> Result<bool, BranchError> {
        self.request(|reply| BranchEvent::Transfer { to, amount, reply })
            .await
    }

    pub async fn balances(&self) -> Result<Balances, BranchError> {
        self.request(|reply| BranchEvent::Balances { reply }).await
    }

    pub async fn available_balance(&self) -> Result<u64, BranchError> {
        Ok(self.balances().await?.available)
    }

    pub async fn total_balance(&self) -> Result<u64, BranchError> {
        Ok(self.balances().await?.total())
    }

    pub async fn snapshot_result(&self, id: SnapshotId) -> Result<SnapshotLookup, BranchError> {
        self.request(|reply| BranchEvent::SnapshotResult {
            id,
            consume: false,
            reply,
        })
        .await
    }

    /// The lowest snapshot id this branch is currently recording, if any.
    pub async fn active_snapshot(&self) -> Result<Option<SnapshotId>, BranchError> {
        self.request(|reply| BranchEvent::ActiveSnapshot { reply }).await
    }

    /// Fetch a completed record and drop it from the branch.
    pub async fn take_snapshot_result(
        &self,
        id: SnapshotId,
    ) -> Result<SnapshotLookup, BranchError> {
        self.request(|reply| BranchEvent::SnapshotResult {
            id,
            consume: true,
            reply,
        })
        .await
    }

    /// Stop scheduling new work and wait for the loop to exit.
    ///
    /// Transfers still awaiting an ack are abandoned.
    pub async fn stop(self) {
        let _ = self.events.send(BranchEvent::Stop);
        if let Err(e) = self.task.await {
            log::error!("branch {} loop ended abnormally: {e}", self.id);
        }
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> BranchEvent,
    ) -> Result<T, BranchError> {
        let (reply, rx) = oneshot::channel();
        self.events
            .send(make(reply))
            .map_err(|_| BranchError::Stopped)?;
        rx.await.map_err(|_| BranchError::Stopped)
    }
}

// ---------------------------------------------------------------------------
// Branch loop
// ---------------------------------------------------------------------------

async fn branch_loop(
    mut state: BranchState,
    router: Router,
    mut inbound: Inbound,
    mut events: mpsc::UnboundedReceiver<BranchEvent>,
    mut delivered: mpsc::UnboundedReceiver<PendingTransfer>,
    transfer_period: Option<Duration>,
) {
    let local_id = router.local_id();
    let mut ticker = transfer_period.map(|period| {
        let mut t = interval(period);
        t.set_missed_tick_behavior(MissedTickBehavior::Delay);
        t
    });

    loop {
        tokio::select! {
            envelope = inbound.next() => {
                let Some(envelope) = envelope else {
                    log::warn!("branch {local_id}: transport closed");
                    break;
                };
                router.on_inbound(envelope, &mut state);
            }

            _ = tick(&mut ticker) => {
                if let Some(transfer) = state.ledger.generate_random_transfer() {
                    dispatch(&router, &mut state, transfer);
                }
            }

            Some(transfer) = delivered.recv() => {
                state.ledger.on_transfer_delivered(transfer);
            }

            event = events.recv() => {
                // `None`: the handle was dropped without `stop()`.
                let Some(event) = event else { break };
                match event {
                    BranchEvent::StartSnapshot { id, reply } => {
                        // Recording and marker broadcast happen in one step,
                        // with no transfer in between.
                        let balance = state.ledger.available();
                        let accepted = match state.snapshots.start_snapshot(id, balance) {
                            Ok(broadcast) => {
                                router.broadcast_markers(&broadcast);
                                true
                            }
                            Err(e) => {
                                log::warn!("[snapshot {id}] skipped on branch {local_id}: {e}");
                                false
                            }
                        };
                        let _ = reply.send(accepted);
                    }
                    BranchEvent::Transfer { to, amount, reply } => {
                        let transfer = PendingTransfer { to, amount };
                        let sent = state.ledger.try_reserve(transfer)
                            && dispatch(&router, &mut state, transfer);
                        let _ = reply.send(sent);
                    }
                    BranchEvent::Balances { reply } => {
                        let _ = reply.send(Balances {
                            available: state.ledger.available(),
                            reserved: state.ledger.reserved(),
                        });
                    }
                    BranchEvent::SnapshotResult { id, consume, reply } => {
                        let lookup = if consume {
                            state.snapshots.take(id)
                        } else {
                            state.snapshots.lookup(id)
                        };
                        let _ = reply.send(lookup);
                    }
                    BranchEvent::ActiveSnapshot { reply } => {
                        let _ = reply.send(state.snapshots.active());
                    }
                    BranchEvent::Stop => break,
                }
            }
        }
    }
    log::info!("branch {local_id} stopped");
}

/// Hand a reserved transfer to the router; refund it if it cannot be sent.
fn dispatch(router: &Router, state: &mut BranchState, transfer: PendingTransfer) -> bool {
    match router.send_transfer(transfer) {
        Ok(()) => true,
        Err(e) => {
            log::error!("transfer of {} to {} failed: {e}", transfer.amount, transfer.to);
            state.ledger.abort_transfer(transfer);
            false
        }
    }
}

async fn tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(t) => {
            t.tick().await;
        }
        None => std::future::pending().await,
    }
}
