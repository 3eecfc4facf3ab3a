//! Outbound state for one directed link (stop-and-wait reliability).
//!
//! [`LinkSender`] tracks the next sequence number and the single in-flight
//! frame.  It does **not** touch the socket; the link worker in
//! [`crate::transport`] calls these methods and owns the actual I/O.
//!
//! # Stop-and-Wait contract
//! - At most **one** frame is in flight at any moment (`unacked`).
//! - A new frame may only be sent once `unacked` is `None`.
//! - Sequence numbers start at 0 and are assigned once, before the first
//!   transmission; retransmissions reuse the identical frame.
//! - On matching ACK: clear `unacked`.

use std::time::Instant;

use crate::packet::{Frame, Message, PeerId, SeqNum};

/// A frame that has been sent but not yet acknowledged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetransmitEntry {
    /// The frame on the wire.
    pub frame: Frame,
    /// Sequence number carried by `frame`.
    pub seq: SeqNum,
    /// How many times this frame has been transmitted (1 = first send).
    pub tx_count: u32,
    /// Time of the first transmission.
    pub first_sent: Instant,
}

/// Stop-and-wait send-side state for one directed link.
#[derive(Debug)]
pub struct LinkSender {
    /// Id stamped on every outgoing frame.
    local_id: PeerId,

    /// Sequence number of the **next** frame to send.
    pub next_seq: SeqNum,

    /// The in-flight frame, or `None` when the link is idle.
    pub unacked: Option<RetransmitEntry>,
}

impl LinkSender {
    pub fn new(local_id: PeerId) -> Self {
        Self {
            local_id,
            next_seq: 0,
            unacked: None,
        }
    }

    /// Assign the next sequence number to `message` and place the resulting
    /// frame into the in-flight slot.
    ///
    /// Returns the frame to transmit.
    ///
    /// Panics in debug mode if a frame is already in flight.
    pub fn start(&mut self, message: Message) -> Frame {
        debug_assert!(
            self.unacked.is_none(),
            "start called while a frame is already in flight"
        );
        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);
        let frame = Frame::Data {
            seq,
            sender: self.local_id,
            message,
        };
        self.unacked = Some(RetransmitEntry {
            frame: frame.clone(),
            seq,
            tx_count: 1,
            first_sent: Instant::now(),
        });
        frame
    }

    /// Process an inbound ACK sequence number.
    ///
    /// Returns the completed entry if this ACK matches the in-flight frame;
    /// `None` for a duplicate or stale ACK.
    pub fn on_ack(&mut self, seq: SeqNum) -> Option<RetransmitEntry> {
        match &self.unacked {
            Some(entry) if entry.seq == seq => self.unacked.take(),
            _ => None,
        }
    }

    /// The in-flight frame to resend, bumping its transmit count.
    pub fn retransmit(&mut self) -> Option<Frame> {
        self.unacked.as_mut().map(|e| {
            e.tx_count += 1;
            e.frame.clone()
        })
    }

    /// `true` when a frame is waiting for an ACK.
    pub fn has_unacked(&self) -> bool {
        self.unacked.is_some()
    }
}
