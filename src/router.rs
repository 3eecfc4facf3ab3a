//! Message router: the seam between the transport and the branch loop.
//!
//! Inbound, it classifies each accepted message and hands it to the ledger
//! or the snapshot coordinator.  Outbound, it sends transfers and markers
//! through the transport.  For transfers it waits for the delivery
//! confirmation on a detached task and posts the transfer back to the branch
//! loop on the delivery channel, so the reservation is released on the loop,
//! never on a transport task.

use tokio::sync::mpsc;

use crate::branch::BranchState;
use crate::ledger::PendingTransfer;
use crate::packet::{Message, PeerId};
use crate::snapshot::MarkerBroadcast;
use crate::transport::{Envelope, Transport, TransportError};

pub struct Router {
    transport: Transport,
    delivered: mpsc::UnboundedSender<PendingTransfer>,
}

impl Router {
    pub fn new(transport: Transport, delivered: mpsc::UnboundedSender<PendingTransfer>) -> Self {
        Self {
            transport,
            delivered,
        }
    }

    pub fn local_id(&self) -> PeerId {
        self.transport.local_id()
    }

    /// Dispatch one inbound message.  Must run on the branch loop.
    pub fn on_inbound(&self, envelope: Envelope, state: &mut BranchState) {
        match envelope.message {
            Message::Transfer { amount } => {
                state
                    .ledger
                    .apply_incoming(envelope.sender, amount, &mut state.snapshots);
            }
            Message::Marker { snapshot_id } => {
                let balance = state.ledger.available();
                if let Some(broadcast) =
                    state
                        .snapshots
                        .on_marker(envelope.sender, snapshot_id, balance)
                {
                    self.broadcast_markers(&broadcast);
                }
            }
        }
    }

    /// Send a transfer whose amount the ledger has already reserved.
    ///
    /// On success the transfer is posted on the delivery channel once the
    /// peer acknowledges it.
    pub fn send_transfer(&self, transfer: PendingTransfer) -> Result<(), TransportError> {
        let handle = self.transport.send(
            transfer.to,
            Message::Transfer {
                amount: transfer.amount,
            },
        )?;
        let delivered_tx = self.delivered.clone();
        tokio::spawn(async move {
            match handle.delivered().await {
                Ok(delivered) => {
                    log::debug!(
                        "transfer of {} to {} delivered after {} attempt(s)",
                        transfer.amount,
                        transfer.to,
                        delivered.attempts
                    );
                    // The loop may already be gone after stop().
                    let _ = delivered_tx.send(transfer);
                }
                Err(e) => log::debug!("transfer to {} not confirmed: {e}", transfer.to),
            }
        });
        Ok(())
    }

    /// Send `Marker(id)` to every destination.
    pub fn broadcast_markers(&self, broadcast: &MarkerBroadcast) {
        let marker = Message::Marker {
            snapshot_id: broadcast.snapshot_id,
        };
        for &peer in &broadcast.destinations {
            if let Err(e) = self.transport.send(peer, marker) {
                log::error!(
                    "[snapshot {}] cannot send marker to {peer}: {e}",
                    broadcast.snapshot_id
                );
            }
        }
    }
}
