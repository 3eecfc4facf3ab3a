//! Reliable transport: ordered, duplicate-free, eventually-delivered messages
//! between branches over a lossy datagram socket.
//!
//! # Architecture
//!
//! ```text
//!   send(peer, msg) ──▶ link queue (mpsc) ──▶ link worker (one per peer)
//!                                               ├── LinkSender (seq, unacked)
//!                                               ├── RetransmitTimer
//!                                               └── acks (mpsc) ◀──┐
//!                                                                  │
//!   Inbound::next() ◀── inbound (mpsc) ◀── receive task ───────────┘
//!                                           ├── LinkReceiver per sender
//!                                           └── re-acks every data frame
//! ```
//!
//! Each link worker sends one message at a time and retransmits it on a fixed
//! timeout until the matching ack arrives; only then does it take the next
//! message from its queue.  That discipline gives per-link FIFO delivery with
//! no reordering buffer on the receiver.  Links are independent tasks, so an
//! unreachable peer never blocks the others.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::config::{PeerTable, TransportConfig};
use crate::packet::{Frame, Message, PeerId, SeqNum};
use crate::receiver::LinkReceiver;
use crate::sender::LinkSender;
use crate::socket::{Socket, SocketError};
use crate::timer::RetransmitTimer;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("no address for branch {0}")]
    UnknownPeer(PeerId),
    #[error("local branch {0} is not in the peer table")]
    UnknownLocalPeer(PeerId),
    #[error("transport stopped")]
    Stopped,
    #[error(transparent)]
    Socket(#[from] SocketError),
}

/// An application message as delivered to the receiving branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Envelope {
    pub sender: PeerId,
    pub seq: SeqNum,
    pub message: Message,
}

/// Confirmation that a peer acknowledged a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delivered {
    pub peer: PeerId,
    pub seq: SeqNum,
    pub message: Message,
    /// Number of transmissions it took (1 = no retransmission).
    pub attempts: u32,
}

/// Completes once the message passed to [`Transport::send`] is acknowledged.
///
/// Dropping the handle does not cancel delivery.
#[derive(Debug)]
pub struct DeliveryHandle {
    rx: oneshot::Receiver<Delivered>,
}

impl DeliveryHandle {
    pub async fn delivered(self) -> Result<Delivered, TransportError> {
        self.rx.await.map_err(|_| TransportError::Stopped)
    }
}

/// Stream of accepted inbound messages, one per non-duplicate data frame.
#[derive(Debug)]
pub struct Inbound {
    rx: mpsc::UnboundedReceiver<Envelope>,
}

impl Inbound {
    /// Next inbound message; `None` once the transport has stopped.
    pub async fn next(&mut self) -> Option<Envelope> {
        self.rx.recv().await
    }
}

struct Outgoing {
    message: Message,
    done: oneshot::Sender<Delivered>,
}

struct Link {
    queue: mpsc::UnboundedSender<Outgoing>,
    worker: JoinHandle<()>,
}

/// The reliable transport of one branch.
///
/// Must be started from within a tokio runtime.  Dropping it stops every
/// worker task.
pub struct Transport {
    local_id: PeerId,
    local_addr: SocketAddr,
    links: HashMap<PeerId, Link>,
    receive_task: JoinHandle<()>,
}

impl Transport {
    /// Spawn one worker per peer plus the receive task on `socket`.
    pub fn start(
        local_id: PeerId,
        peers: &PeerTable,
        socket: Socket,
        config: &TransportConfig,
    ) -> Result<(Self, Inbound), TransportError> {
        if !peers.contains(local_id) {
            return Err(TransportError::UnknownLocalPeer(local_id));
        }

        let local_addr = socket.local_addr;
        let socket = Arc::new(socket);
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        let mut links = HashMap::new();
        let mut ack_routes = HashMap::new();
        let mut addresses = HashMap::new();
        for (peer, addr) in peers.others(local_id) {
            let (queue_tx, queue_rx) = mpsc::unbounded_channel();
            let (ack_tx, ack_rx) = mpsc::unbounded_channel();
            let worker = tokio::spawn(link_worker(
                LinkWorker {
                    local_id,
                    peer,
                    addr,
                    socket: Arc::clone(&socket),
                    ack_timeout: config.ack_timeout,
                },
                queue_rx,
                ack_rx,
            ));
            links.insert(
                peer,
                Link {
                    queue: queue_tx,
                    worker,
                },
            );
            ack_routes.insert(peer, ack_tx);
            addresses.insert(peer, addr);
        }

        let receive_task = tokio::spawn(receive_loop(
            local_id, socket, addresses, ack_routes, inbound_tx,
        ));

        log::info!("[transport {local_id}] listening on {local_addr}");
        Ok((
            Self {
                local_id,
                local_addr,
                links,
                receive_task,
            },
            Inbound { rx: inbound_rx },
        ))
    }

    pub fn local_id(&self) -> PeerId {
        self.local_id
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Queue `message` for reliable delivery to `peer`.
    ///
    /// Messages to the same peer are transmitted strictly in call order.
    pub fn send(&self, peer: PeerId, message: Message) -> Result<DeliveryHandle, TransportError> {
        let link = self
            .links
            .get(&peer)
            .ok_or(TransportError::UnknownPeer(peer))?;
        let (done, rx) = oneshot::channel();
        link.queue
            .send(Outgoing { message, done })
            .map_err(|_| TransportError::Stopped)?;
        Ok(DeliveryHandle { rx })
    }

    /// Stop every worker.  Pending deliveries never complete.
    pub fn stop(&self) {
        self.receive_task.abort();
        for link in self.links.values() {
            link.worker.abort();
        }
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.stop();
    }
}

// ---------------------------------------------------------------------------
// Link worker (one per directed outgoing link)
// ---------------------------------------------------------------------------

struct LinkWorker {
    local_id: PeerId,
    peer: PeerId,
    addr: SocketAddr,
    socket: Arc<Socket>,
    ack_timeout: Duration,
}

async fn link_worker(
    link: LinkWorker,
    mut queue: mpsc::UnboundedReceiver<Outgoing>,
    mut acks: mpsc::UnboundedReceiver<SeqNum>,
) {
    let LinkWorker {
        local_id,
        peer,
        addr,
        socket,
        ack_timeout,
    } = link;
    let mut sender = LinkSender::new(local_id);
    let mut timer = RetransmitTimer::new(ack_timeout);
    let mut pending: Option<Outgoing> = None;

    loop {
        tokio::select! {
            // ── Branch 1: next message, only while the link is idle ───────
            next = queue.recv(), if !sender.has_unacked() => {
                let Some(out) = next else { break };
                let frame = sender.start(out.message);
                if let Err(e) = socket.send_to(&frame, addr).await {
                    // Treated like a lost datagram; the timer retries.
                    log::warn!("[link {local_id}→{peer}] send failed: {e}");
                }
                let seq = sender.next_seq.wrapping_sub(1);
                log::debug!("[link {local_id}→{peer}] → DATA seq={seq} {:?}", out.message);
                pending = Some(out);
                timer.arm();
            }

            // ── Branch 2: ack routed here by the receive task ─────────────
            Some(seq) = acks.recv() => {
                match sender.on_ack(seq) {
                    Some(entry) => {
                        timer.cancel();
                        let tx = entry.tx_count;
                        log::debug!("[link {local_id}→{peer}] ← ACK seq={seq} after {tx} tx");
                        if let Some(out) = pending.take() {
                            // The caller may have dropped its handle.
                            let _ = out.done.send(Delivered {
                                peer,
                                seq,
                                message: out.message,
                                attempts: entry.tx_count,
                            });
                        }
                    }
                    None => log::debug!("[link {local_id}→{peer}] ← stale ACK seq={seq}"),
                }
            }

            // ── Branch 3: retransmit timeout ──────────────────────────────
            _ = timer.fired() => {
                if let Some(frame) = sender.retransmit() {
                    log::debug!("[link {local_id}→{peer}] timeout; retransmitting {frame:?}");
                    if let Err(e) = socket.send_to(&frame, addr).await {
                        log::warn!("[link {local_id}→{peer}] resend failed: {e}");
                    }
                    timer.arm();
                }
            }
        }
    }
    log::debug!("[link {local_id}→{peer}] worker exiting");
}

// ---------------------------------------------------------------------------
// Receive task (one per branch)
// ---------------------------------------------------------------------------

async fn receive_loop(
    local_id: PeerId,
    socket: Arc<Socket>,
    addresses: HashMap<PeerId, SocketAddr>,
    ack_routes: HashMap<PeerId, mpsc::UnboundedSender<SeqNum>>,
    inbound: mpsc::UnboundedSender<Envelope>,
) {
    let mut receivers: HashMap<PeerId, LinkReceiver> = HashMap::new();

    loop {
        let (frame, from) = match socket.recv_from().await {
            Ok(v) => v,
            Err(SocketError::Packet(e)) => {
                log::warn!("[transport {local_id}] dropping undecodable datagram: {e}");
                continue;
            }
            Err(SocketError::Io(e)) => {
                log::warn!("[transport {local_id}] receive error: {e}");
                continue;
            }
        };

        match frame {
            Frame::Data {
                seq,
                sender,
                message,
            } => {
                let Some(&addr) = addresses.get(&sender) else {
                    log::warn!(
                        "[transport {local_id}] data from unknown branch {sender} at {from}"
                    );
                    continue;
                };
                let accepted = receivers.entry(sender).or_default().on_data(seq);

                // Always re-ack, so a sender whose ack was lost terminates.
                let ack = Frame::Ack {
                    seq,
                    sender: local_id,
                };
                if let Err(e) = socket.send_to(&ack, addr).await {
                    log::warn!("[link {sender}→{local_id}] ack send failed: {e}");
                }

                if !accepted {
                    log::debug!("[link {sender}→{local_id}] ← duplicate DATA seq={seq}; re-acked");
                    continue;
                }
                log::debug!("[link {sender}→{local_id}] ← DATA seq={seq} {message:?}");
                let envelope = Envelope {
                    sender,
                    seq,
                    message,
                };
                if inbound.send(envelope).is_err() {
                    break;
                }
            }
            Frame::Ack { seq, sender } => match ack_routes.get(&sender) {
                Some(route) => {
                    let _ = route.send(seq);
                }
                None => log::warn!("[transport {local_id}] ack from unknown branch {sender}"),
            },
        }
    }
    log::debug!("[transport {local_id}] receive task exiting");
}
