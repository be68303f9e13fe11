//! Receiver-side message reassembly.
//!
//! Fragments are bucketed by sequence number. Messages are delivered in sequence order,
//! starting from whichever complete sequence is seen first. The receiver resyncs when
//! the target restarts its counter, and when the expected message goes stale. Partial
//! messages that stop growing for the stale timeout are discarded.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use super::fragment::FragmentHeader;
use super::{next_sequence, MAX_MESSAGE_DATA_LENGTH};
use crate::error::ValidationError;

/// A fully reassembled payload, before decompression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    /// Message id including the compressed flag.
    pub msgid: u16,
    pub sequence: u16,
    pub payload: Vec<u8>,
}

#[derive(Debug)]
struct PendingMessage {
    msgid: u16,
    total_length: u16,
    fragments: HashMap<u16, Vec<u8>>,
    touched: Instant,
}

impl PendingMessage {
    fn offsets(&self) -> impl Iterator<Item = u16> {
        (0..usize::from(self.total_length))
            .step_by(MAX_MESSAGE_DATA_LENGTH)
            .map(|offset| offset as u16)
    }

    fn is_complete(&self) -> bool {
        self.offsets()
            .all(|offset| self.fragments.contains_key(&offset))
    }

    fn assemble(mut self) -> Vec<u8> {
        let mut payload = Vec::with_capacity(usize::from(self.total_length));
        for offset in self.offsets().collect::<Vec<_>>() {
            if let Some(chunk) = self.fragments.remove(&offset) {
                payload.extend_from_slice(&chunk);
            }
        }
        payload
    }
}

/// Reassembly state for one receive direction.
#[derive(Debug)]
pub struct Reassembler {
    /// Sequence to deliver next. `None` until the first message, and after a resync.
    expected: Option<u16>,
    /// When `expected` was last set by a delivery.
    advanced: Option<Instant>,
    pending: BTreeMap<u16, PendingMessage>,
    stale_timeout: Duration,
}

impl Reassembler {
    pub fn new(stale_timeout: Duration) -> Self {
        Self {
            expected: None,
            advanced: None,
            pending: BTreeMap::new(),
            stale_timeout,
        }
    }

    pub fn expected(&self) -> Option<u16> {
        self.expected
    }

    /// Number of sequences with fragments outstanding.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    fn is_complete(&self, sequence: u16) -> bool {
        self.pending
            .get(&sequence)
            .is_some_and(PendingMessage::is_complete)
    }

    fn is_stale(&self, touched: Instant, now: Instant) -> bool {
        now.saturating_duration_since(touched) > self.stale_timeout
    }

    /// Drop incomplete buckets that have not grown within the stale timeout.
    /// Complete ones are kept, they can still be delivered.
    fn evict_stale(&mut self, now: Instant) {
        let timeout = self.stale_timeout;
        let before = self.pending.len();
        self.pending.retain(|_, p| {
            p.is_complete() || now.saturating_duration_since(p.touched) <= timeout
        });
        let evicted = before - self.pending.len();
        if evicted > 0 {
            debug!(evicted, "Discarded stale partial messages");
        }
    }

    /// Deliver the expected message if it is complete.
    ///
    /// If instead sequence 1 is complete while a later one is expected, the target
    /// restarted or its counter wrapped, so delivery restarts from 1. When the expected
    /// message has made no progress within the stale timeout while others wait, the
    /// expectation is cleared so [`resync_idle`](Self::resync_idle) can pick a new one.
    pub fn poll_ready(&mut self, now: Instant) -> Option<RawMessage> {
        self.evict_stale(now);

        let expected = self.expected?;
        if self.is_complete(expected) {
            return self.take(expected, now);
        }
        if expected > 1 && self.is_complete(1) {
            debug!(expected, "Message sequence restarted, resyncing to 1");
            return self.take(1, now);
        }

        let last_progress = match (self.pending.get(&expected), self.advanced) {
            (Some(p), Some(advanced)) => p.touched.max(advanced),
            (Some(p), None) => p.touched,
            (None, Some(advanced)) => advanced,
            (None, None) => now,
        };
        if !self.pending.is_empty() && self.is_stale(last_progress, now) {
            debug!(expected, "Expected message went stale, resyncing");
            self.expected = None;
        }
        None
    }

    /// Fold one received packet into its bucket. Duplicate fragments are ignored.
    ///
    /// A bucket left over from an earlier message with the same sequence (stale, or
    /// with a different id or length) is started afresh.
    pub fn insert(&mut self, packet: &[u8], now: Instant) -> Result<(), ValidationError> {
        let (header, data) = FragmentHeader::decode(packet)?;

        let reused = self.pending.get(&header.sequence).is_some_and(|p| {
            p.msgid != header.msgid
                || p.total_length != header.total_length
                || self.is_stale(p.touched, now)
        });
        if reused {
            debug!(sequence = header.sequence, "Sequence reused, discarding old fragments");
            self.pending.remove(&header.sequence);
        }

        let pending = self
            .pending
            .entry(header.sequence)
            .or_insert_with(|| PendingMessage {
                msgid: header.msgid,
                total_length: header.total_length,
                fragments: HashMap::new(),
                touched: now,
            });

        if !pending.fragments.contains_key(&header.offset) {
            pending.fragments.insert(header.offset, data.to_vec());
            pending.touched = now;
        }
        Ok(())
    }

    /// Called when the channel has nothing more to read.
    ///
    /// Without an expected sequence, adopt the lowest pending one. If it is incomplete
    /// but its successor is complete, the start of the lowest was lost for good, so it
    /// is dropped. Returns whether delivery should be attempted again.
    pub fn resync_idle(&mut self) -> bool {
        if self.expected.is_some() {
            return false;
        }
        let Some(&lowest) = self.pending.keys().next() else {
            return false;
        };

        let successor = next_sequence(lowest);
        if !self.is_complete(lowest) && self.is_complete(successor) {
            debug!(dropped = lowest, "Discarding truncated message");
            self.pending.remove(&lowest);
            self.expected = Some(successor);
            true
        } else if self.is_complete(lowest) {
            self.expected = Some(lowest);
            true
        } else {
            false
        }
    }

    fn take(&mut self, sequence: u16, now: Instant) -> Option<RawMessage> {
        let pending = self.pending.remove(&sequence)?;
        self.expected = Some(next_sequence(sequence));
        self.advanced = Some(now);
        Some(RawMessage {
            msgid: pending.msgid,
            sequence,
            payload: pending.assemble(),
        })
    }
}
