//! Async UDP socket abstraction.
//!
//! [`Socket`] is a thin wrapper around `tokio::net::UdpSocket` that speaks
//! [`crate::packet::Frame`] instead of raw bytes.  All protocol logic lives
//! elsewhere; this module owns only byte I/O and, when configured, the fault
//! model from [`crate::simulator`].

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio::net::UdpSocket;

use crate::packet::{Frame, PacketError};
use crate::simulator::{Delivery, Simulator, SimulatorConfig};

/// Largest datagram we ever expect; anything bigger is malformed anyway.
const MAX_DATAGRAM: usize = 1024;

/// Errors that can arise from socket operations.
#[derive(Debug, Error)]
pub enum SocketError {
    #[error("socket I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("frame decode error: {0}")]
    Packet(#[from] PacketError),
}

/// An async, frame-oriented UDP socket.
///
/// All methods are `&self` so the socket can be shared across tasks.
#[derive(Debug)]
pub struct Socket {
    /// Address this socket is bound to (filled in after OS assigns ephemeral port).
    pub local_addr: SocketAddr,
    inner: Arc<UdpSocket>,
    faults: Option<Mutex<Simulator>>,
}

impl Socket {
    /// Bind a new socket to `local_addr`.
    ///
    /// Passing `127.0.0.1:0` lets the OS choose an ephemeral port.
    pub async fn bind(local_addr: SocketAddr) -> Result<Self, SocketError> {
        let inner = UdpSocket::bind(local_addr).await?;
        let local_addr = inner.local_addr()?;
        Ok(Self {
            local_addr,
            inner: Arc::new(inner),
            faults: None,
        })
    }

    /// Route every outgoing datagram through a fault simulator.
    pub fn with_faults(mut self, config: SimulatorConfig) -> Self {
        self.faults = Some(Mutex::new(Simulator::new(config)));
        self
    }

    /// Encode `frame` and send it as a single UDP datagram to `dest`.
    ///
    /// With a simulator attached the datagram may be dropped, duplicated, or
    /// delayed; delayed copies are sent from a detached task.
    pub async fn send_to(&self, frame: &Frame, dest: SocketAddr) -> Result<(), SocketError> {
        let bytes = frame.encode();

        let plan = match &self.faults {
            None => vec![Delivery::Now],
            Some(sim) => match sim.lock() {
                Ok(mut sim) => sim.plan(),
                Err(poisoned) => poisoned.into_inner().plan(),
            },
        };

        for delivery in plan {
            match delivery {
                Delivery::Now => {
                    self.inner.send_to(&bytes, dest).await?;
                }
                Delivery::After(delay) => {
                    let inner = Arc::clone(&self.inner);
                    let bytes = bytes.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        if let Err(e) = inner.send_to(&bytes, dest).await {
                            log::debug!("[sim] delayed send to {dest} failed: {e}");
                        }
                    });
                }
            }
        }
        Ok(())
    }

    /// Receive the next datagram and decode it into a [`Frame`].
    ///
    /// Returns `(frame, sender_address)`.  Datagrams that fail to decode are
    /// returned as `Err`; the caller decides whether to keep going.
    pub async fn recv_from(&self) -> Result<(Frame, SocketAddr), SocketError> {
        let mut buf = [0u8; MAX_DATAGRAM];
        let (n, addr) = self.inner.recv_from(&mut buf).await?;
        let frame = Frame::decode(&buf[..n])?;
        Ok((frame, addr))
    }

    /// Send raw bytes, bypassing the codec and the simulator.
    pub async fn send_raw(&self, bytes: &[u8], dest: SocketAddr) -> Result<(), SocketError> {
        self.inner.send_to(bytes, dest).await?;
        Ok(())
    }
}
