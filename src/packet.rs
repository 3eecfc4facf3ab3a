//! Wire-format definitions for link frames and application messages.
//!
//! Every datagram exchanged between branches is a [`Frame`].  This module is
//! responsible for:
//! - Defining the on-wire binary layout (link tag, sequence number, sender id,
//!   application tag, payload).
//! - Serialising a [`Frame`] into a byte buffer ready for transmission.
//! - Deserialising a raw byte slice back into a [`Frame`], returning errors
//!   for malformed, truncated, or unknown input.
//!
//! No I/O happens here; this is pure data transformation.
//!
//! # Wire format
//!
//! All multi-byte integers are **big-endian**.
//!
//! ```text
//!  Data frame (18 bytes)
//!  +--------+----------------+----------------+--------+--------------------------------+
//!  | 0x01   | sequence (u32) | sender id (u32)| apptag | payload (u64)                  |
//!  +--------+----------------+----------------+--------+--------------------------------+
//!   apptag 0x01 = Transfer (payload = amount)
//!   apptag 0x02 = Marker   (payload = snapshot id)
//!
//!  Ack frame (9 bytes)
//!  +--------+----------------+----------------+
//!  | 0x02   | sequence (u32) | sender id (u32)|
//!  +--------+----------------+----------------+
//! ```

use thiserror::Error;

/// Identifier of a branch in the peer table.
pub type PeerId = u32;

/// Identifier of a global snapshot.
pub type SnapshotId = u64;

/// Per-link sequence number.
pub type SeqNum = u32;

/// Link-level tag constants (first byte of every datagram).
pub mod link_tag {
    pub const DATA: u8 = 0x1;
    pub const ACK: u8 = 0x2;
}

/// Application-level tag constants (first byte after the data header).
pub mod app_tag {
    pub const TRANSFER: u8 = 0x1;
    pub const MARKER: u8 = 0x2;
}

/// Byte length of a data frame on the wire.
pub const DATA_LEN: usize = 18;

/// Byte length of an ack frame on the wire.
pub const ACK_LEN: usize = 9;

// Byte offsets within a serialised frame.
const OFF_TAG: usize = 0;
const OFF_SEQ: usize = 1;
const OFF_SENDER: usize = 5;
const OFF_APP_TAG: usize = 9;
const OFF_PAYLOAD: usize = 10;

/// Application message carried inside a data frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Message {
    /// Money moving from the sender to the receiver.
    Transfer { amount: u64 },
    /// Chandy–Lamport marker delimiting a snapshot on one channel.
    Marker { snapshot_id: SnapshotId },
}

impl Message {
    fn tag_and_payload(&self) -> (u8, u64) {
        match *self {
            Message::Transfer { amount } => (app_tag::TRANSFER, amount),
            Message::Marker { snapshot_id } => (app_tag::MARKER, snapshot_id),
        }
    }
}

/// A complete link-layer datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Application message with its link metadata.
    Data {
        seq: SeqNum,
        sender: PeerId,
        message: Message,
    },
    /// Acknowledgement of `seq`, sent by branch `sender`.
    Ack { seq: SeqNum, sender: PeerId },
}

impl Frame {
    /// Serialise this frame into a newly allocated byte vector.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Frame::Data {
                seq,
                sender,
                message,
            } => {
                let mut buf = vec![0u8; DATA_LEN];
                buf[OFF_TAG] = link_tag::DATA;
                buf[OFF_SEQ..OFF_SEQ + 4].copy_from_slice(&seq.to_be_bytes());
                buf[OFF_SENDER..OFF_SENDER + 4].copy_from_slice(&sender.to_be_bytes());
                let (tag, payload) = message.tag_and_payload();
                buf[OFF_APP_TAG] = tag;
                buf[OFF_PAYLOAD..OFF_PAYLOAD + 8].copy_from_slice(&payload.to_be_bytes());
                buf
            }
            Frame::Ack { seq, sender } => {
                let mut buf = vec![0u8; ACK_LEN];
                buf[OFF_TAG] = link_tag::ACK;
                buf[OFF_SEQ..OFF_SEQ + 4].copy_from_slice(&seq.to_be_bytes());
                buf[OFF_SENDER..OFF_SENDER + 4].copy_from_slice(&sender.to_be_bytes());
                buf
            }
        }
    }

    /// Parse a [`Frame`] from a raw byte slice.
    ///
    /// Returns [`Err`] if:
    /// - `buf` is empty or shorter than the frame its tag announces,
    /// - `buf` carries trailing bytes,
    /// - the link or application tag is unknown, or
    /// - a transfer carries a zero amount.
    pub fn decode(buf: &[u8]) -> Result<Self, PacketError> {
        let tag = *buf.first().ok_or(PacketError::BufferTooShort)?;
        let expected = match tag {
            link_tag::DATA => DATA_LEN,
            link_tag::ACK => ACK_LEN,
            other => return Err(PacketError::UnknownLinkTag(other)),
        };
        if buf.len() < expected {
            return Err(PacketError::BufferTooShort);
        }
        if buf.len() != expected {
            return Err(PacketError::LengthMismatch {
                expected,
                actual: buf.len(),
            });
        }

        let seq = read_u32(buf, OFF_SEQ);
        let sender = read_u32(buf, OFF_SENDER);

        if tag == link_tag::ACK {
            return Ok(Frame::Ack { seq, sender });
        }

        let payload = read_u64(buf, OFF_PAYLOAD);
        let message = match buf[OFF_APP_TAG] {
            app_tag::TRANSFER if payload == 0 => return Err(PacketError::ZeroAmount),
            app_tag::TRANSFER => Message::Transfer { amount: payload },
            app_tag::MARKER => Message::Marker {
                snapshot_id: payload,
            },
            other => return Err(PacketError::UnknownAppTag(other)),
        };

        Ok(Frame::Data {
            seq,
            sender,
            message,
        })
    }
}

fn read_u32(buf: &[u8], off: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&buf[off..off + 4]);
    u32::from_be_bytes(bytes)
}

fn read_u64(buf: &[u8], off: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[off..off + 8]);
    u64::from_be_bytes(bytes)
}

/// Errors that can arise when parsing a raw datagram.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PacketError {
    #[error("buffer too short to contain a frame")]
    BufferTooShort,
    #[error("expected {expected} bytes, got {actual}")]
    LengthMismatch { expected: usize, actual: usize },
    #[error("unknown link tag {0:#04x}")]
    UnknownLinkTag(u8),
    #[error("unknown application tag {0:#04x}")]
    UnknownAppTag(u8),
    #[error("transfer with zero amount")]
    ZeroAmount,
}
