//! Message exchange with a program running on the target.
//!
//! The channel needs nothing from the NetDimm beyond peek and poke. A handful of fixed
//! target addresses act as a mailbox:
//!
//! ```text
//!   DATA         0xC0DE10   3 payload bytes per word, top byte = 1-based word index
//!   SEND_STATUS  0xC0DE20   target -> host packet length/location (checksummed)
//!   RECV_STATUS  0xC0DE30   host -> target packet length/location (checksummed)
//!   CONFIG       0xC0DE40   bit 0 = protocol running, bit 1 = zlib available
//!   SCRATCH1/2   0xC0DE50/60 plain words for ad-hoc use
//! ```
//!
//! Packets of up to 759 bytes move through the mailbox. Messages are split into
//! fragments that each fit one packet, and reassembled on the far side.

mod channel;
mod fragment;
mod reassembly;
mod registers;

pub use channel::{MessageChannel, TargetConfig};
pub use fragment::{compress, decompress, split, FragmentHeader};
pub use reassembly::{RawMessage, Reassembler};
pub use registers::{
    checksum_stamp, checksum_valid, RegisterAccess, CONFIG_MESSAGE_EXISTS,
    CONFIG_MESSAGE_HAS_ZLIB, CONFIG_REGISTER, CONFIG_REGISTER_SEED, DATA_REGISTER,
    RECV_STATUS_REGISTER, RECV_STATUS_REGISTER_SEED, SCRATCH1_REGISTER, SCRATCH2_REGISTER,
    SEND_STATUS_REGISTER, SEND_STATUS_REGISTER_SEED,
};

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Largest packet the mailbox can carry. Word indexes run 1..=253 so that the top byte
/// of a data word is never 0x00 or 0xFF.
pub const MAX_PACKET_LENGTH: usize = (0xFF - 2) * 3;

/// Fragment header size.
pub const MESSAGE_HEADER_LENGTH: usize = 8;

/// Payload bytes carried per fragment.
pub const MAX_MESSAGE_DATA_LENGTH: usize = MAX_PACKET_LENGTH - MESSAGE_HEADER_LENGTH;

/// Largest message payload, after optional compression.
pub const MAX_MESSAGE_LENGTH: usize = 0xFFFF;

/// Set in a fragment's message id when the payload is zlib compressed.
pub const COMPRESSED_FLAG: u16 = 0x8000;

/// Well-known id for target stdout.
pub const MESSAGE_HOST_STDOUT: u16 = 0x7FFE;

/// Well-known id for target stderr.
pub const MESSAGE_HOST_STDERR: u16 = 0x7FFF;

/// An application datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Message id. Only the low 15 bits are carried.
    pub id: u16,
    pub data: Vec<u8>,
}

impl Message {
    pub fn new(id: u16, data: impl Into<Vec<u8>>) -> Self {
        Self {
            id,
            data: data.into(),
        }
    }
}

/// Message channel timing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageConfig {
    /// How long a status register may fail its checksum before the read gives up.
    #[serde(default = "default_read_timeout", with = "humantime_serde")]
    pub read_timeout: Duration,

    /// Deadline for negotiating and sending one packet.
    #[serde(default = "default_packet_deadline", with = "humantime_serde")]
    pub packet_deadline: Duration,

    /// Consecutive empty data reads before asking the target to resume.
    #[serde(default = "default_max_empty_reads")]
    pub max_empty_reads: u32,

    /// A partially received message with no new fragments for this long forces a resync.
    #[serde(default = "default_stale_timeout", with = "humantime_serde")]
    pub stale_timeout: Duration,
}

fn default_read_timeout() -> Duration {
    Duration::from_secs(2)
}
fn default_packet_deadline() -> Duration {
    Duration::from_secs(1)
}
fn default_max_empty_reads() -> u32 {
    10
}
fn default_stale_timeout() -> Duration {
    Duration::from_secs(3)
}

impl Default for MessageConfig {
    fn default() -> Self {
        Self {
            read_timeout: default_read_timeout(),
            packet_deadline: default_packet_deadline(),
            max_empty_reads: default_max_empty_reads(),
            stale_timeout: default_stale_timeout(),
        }
    }
}

/// Next live sequence number. Zero is never used.
pub fn next_sequence(sequence: u16) -> u16 {
    match sequence.wrapping_add(1) {
        0 => 1,
        next => next,
    }
}

/// Outgoing message sequence numbers, starting at 1.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequenceCounter {
    next: u16,
}

impl Default for SequenceCounter {
    fn default() -> Self {
        Self { next: 1 }
    }
}

impl SequenceCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sequence the next message will use.
    pub fn peek(&self) -> u16 {
        self.next
    }

    /// Hand out the current sequence and move past it.
    pub fn take(&mut self) -> u16 {
        let current = self.next;
        self.next = next_sequence(current);
        current
    }
}
