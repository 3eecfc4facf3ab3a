//! Inbound state for one directed link.
//!
//! [`LinkReceiver`] decides whether an inbound data frame is new:
//! - A frame is **accepted** only when its sequence number is strictly
//!   greater than the highest one accepted so far (`last_in_seq`).
//! - Anything else is a duplicate or a late retransmission and is discarded.
//!
//! Either way the caller must re-acknowledge the frame, so a sender whose ack
//! was lost still terminates.  The receiver does not send acks itself.

use crate::packet::SeqNum;

/// Receive-side state for one directed link.
#[derive(Debug, Default)]
pub struct LinkReceiver {
    /// Highest accepted sequence number, `None` before the first frame.
    pub last_in_seq: Option<SeqNum>,
    accepted: u64,
    discarded: u64,
}

impl LinkReceiver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Process an inbound data frame's sequence number.
    ///
    /// Returns `true` if the frame should be delivered to the application.
    pub fn on_data(&mut self, seq: SeqNum) -> bool {
        let fresh = self.last_in_seq.map_or(true, |last| seq > last);
        if fresh {
            self.last_in_seq = Some(seq);
            self.accepted += 1;
        } else {
            self.discarded += 1;
        }
        fresh
    }

    /// Frames delivered so far.
    pub fn accepted(&self) -> u64 {
        self.accepted
    }

    /// Duplicates and stale frames dropped so far.
    pub fn discarded(&self) -> u64 {
        self.discarded
    }
}
