//! Reliable-ordered delivery over datagrams.
//!
//! Sequence numbers, selective acknowledgments (SACK), a reorder buffer and
//! retransmission with exponential backoff give exactly-once, in-order
//! delivery on top of UDP. One [`ReliableSession`] exists per remote; all
//! reliable channels of that remote share its sequence space.
//!
//! # Protocol
//!
//! ```text
//! Sender                              Receiver
//!   │                                     │
//!   │  Reliable { seq: 1, message }       │
//!   │────────────────────────────────────>│ (delivers 1)
//!   │                                     │
//!   │  Reliable { seq: 2, message }       │
//!   │─────────────X (dropped)             │
//!   │                                     │
//!   │  Reliable { seq: 3, message }       │
//!   │────────────────────────────────────>│ (buffered, waiting for 2)
//!   │                                     │
//!   │  Ack { ranges: [(1, 1), (3, 3)] }   │
//!   │<────────────────────────────────────│
//!   │                                     │
//!   │  (timeout, retransmit seq: 2)       │
//!   │────────────────────────────────────>│ (delivers 2, then 3)
//!   │                                     │
//!   │  Ack { ranges: [(1, 3)] }           │
//!   │<────────────────────────────────────│
//! ```
//!
//! A message that is still unacknowledged after
//! [`ReliabilityConfig::max_attempts`] transmissions is reported as failed;
//! the endpoint treats that as a dead connection.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use super::framing::{ChannelMessage, Frame};

/// Default base retransmission timeout in milliseconds.
pub const DEFAULT_RETRANSMIT_TIMEOUT_MS: u64 = 200;

/// Default cap for the backed-off retransmission timeout in milliseconds.
pub const DEFAULT_MAX_RETRANSMIT_TIMEOUT_MS: u64 = 5000;

/// Default number of transmissions before a message is declared failed.
pub const DEFAULT_MAX_RETRANSMIT_ATTEMPTS: u32 = 10;

/// Backoff multiplier (1.5x per attempt).
const BACKOFF_FACTOR: f64 = 1.5;

/// How often to re-send an ACK even if no new data arrived.
const ACK_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);

/// Sequences further than this ahead of `next_expected` are dropped unacked.
///
/// Also bounds the reorder buffer. Buffered messages are acknowledged, so
/// they are kept until the gap before them fills; a gap that never fills
/// ends with the sender's `DeliveryFailed`.
const REORDER_WINDOW: u64 = 1024;

/// Retransmission tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReliabilityConfig {
    /// Base timeout before the first retransmission.
    pub retransmit_timeout: Duration,
    /// Upper bound of the backed-off timeout.
    pub max_retransmit_timeout: Duration,
    /// Transmissions (including the first) before giving up.
    pub max_attempts: u32,
}

impl Default for ReliabilityConfig {
    fn default() -> Self {
        Self {
            retransmit_timeout: Duration::from_millis(DEFAULT_RETRANSMIT_TIMEOUT_MS),
            max_retransmit_timeout: Duration::from_millis(DEFAULT_MAX_RETRANSMIT_TIMEOUT_MS),
            max_attempts: DEFAULT_MAX_RETRANSMIT_ATTEMPTS,
        }
    }
}

impl ReliabilityConfig {
    /// Timeout after the given attempt, with exponential backoff and a cap.
    pub fn timeout_for_attempt(&self, attempts: u32) -> Duration {
        let base_ms = self.retransmit_timeout.as_millis() as f64;
        let exponent = i32::try_from(attempts.saturating_sub(1)).unwrap_or(i32::MAX);
        let backoff = base_ms * BACKOFF_FACTOR.powi(exponent);
        let capped = backoff.min(self.max_retransmit_timeout.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }
}

/// Convert a sorted run of sequence numbers to inclusive ranges.
///
/// Example: {1, 2, 3, 5, 7, 8} -> [(1, 3), (5, 5), (7, 8)]
pub fn seqs_to_ranges(seqs: impl IntoIterator<Item = u64>) -> Vec<(u64, u64)> {
    let mut ranges: Vec<(u64, u64)> = Vec::new();
    for seq in seqs {
        match ranges.last_mut() {
            Some((_, end)) if seq == *end + 1 => *end = seq,
            _ => ranges.push((seq, seq)),
        }
    }
    ranges
}

/// An unacknowledged outgoing message.
#[derive(Debug)]
struct PendingMessage {
    message: ChannelMessage,
    last_sent_at: Instant,
    attempts: u32,
}

/// State for reliable sending.
#[derive(Debug)]
pub struct ReliableSender {
    /// Next sequence number to assign (0 is reserved).
    next_seq: u64,
    /// Messages awaiting acknowledgment: seq -> pending info.
    pending: BTreeMap<u64, PendingMessage>,
    config: ReliabilityConfig,
    /// Messages that failed after max attempts: (seq, message).
    failed: Vec<(u64, ChannelMessage)>,
}

impl Default for ReliableSender {
    fn default() -> Self {
        Self::new(ReliabilityConfig::default())
    }
}

impl ReliableSender {
    /// Create a new sender.
    pub fn new(config: ReliabilityConfig) -> Self {
        Self {
            next_seq: 1,
            pending: BTreeMap::new(),
            config,
            failed: Vec::new(),
        }
    }

    /// Assign the next sequence number and track the message until acked.
    pub fn prepare_send(&mut self, message: ChannelMessage) -> Frame {
        let seq = self.next_seq;
        self.next_seq += 1;

        self.pending.insert(
            seq,
            PendingMessage {
                message: message.clone(),
                last_sent_at: Instant::now(),
                attempts: 1,
            },
        );

        Frame::Reliable { seq, message }
    }

    /// Process an ACK, removing acknowledged messages from pending.
    ///
    /// Returns the number of messages newly acknowledged.
    pub fn process_ack(&mut self, ranges: &[(u64, u64)]) -> usize {
        let mut count = 0;
        for &(start, end) in ranges {
            let acked: Vec<u64> = self.pending.range(start..=end).map(|(seq, _)| *seq).collect();
            for seq in acked {
                self.pending.remove(&seq);
                count += 1;
            }
        }
        count
    }

    /// Get frames that need retransmission now.
    ///
    /// A message whose final attempt has timed out is moved to the failed
    /// list instead (see [`Self::take_failed`]).
    pub fn get_retransmits(&mut self) -> Vec<Frame> {
        let now = Instant::now();
        let mut retransmits = Vec::new();
        let mut failed_seqs = Vec::new();

        for (seq, pending) in &mut self.pending {
            let timeout = self.config.timeout_for_attempt(pending.attempts);
            if now.duration_since(pending.last_sent_at) < timeout {
                continue;
            }

            if pending.attempts >= self.config.max_attempts {
                log::error!("Message seq={} exceeded max retransmits, giving up", seq);
                failed_seqs.push(*seq);
                continue;
            }

            pending.last_sent_at = now;
            pending.attempts += 1;
            retransmits.push(Frame::Reliable {
                seq: *seq,
                message: pending.message.clone(),
            });
        }

        for seq in failed_seqs {
            if let Some(pending) = self.pending.remove(&seq) {
                self.failed.push((seq, pending.message));
            }
        }

        retransmits
    }

    /// Take and clear the list of failed messages.
    pub fn take_failed(&mut self) -> Vec<(u64, ChannelMessage)> {
        std::mem::take(&mut self.failed)
    }

    /// Number of messages awaiting acknowledgment.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// The next sequence number that will be assigned.
    pub fn current_seq(&self) -> u64 {
        self.next_seq
    }
}

/// State for reliable receiving.
#[derive(Debug)]
pub struct ReliableReceiver {
    /// Next sequence we expect; everything below it has been delivered.
    next_expected: u64,
    /// Out-of-order messages waiting to be delivered.
    buffer: BTreeMap<u64, ChannelMessage>,
    /// Last time we sent an ACK.
    last_ack_sent: Instant,
}

impl Default for ReliableReceiver {
    fn default() -> Self {
        Self::new()
    }
}

impl ReliableReceiver {
    /// Create a new receiver.
    pub fn new() -> Self {
        Self {
            next_expected: 1,
            buffer: BTreeMap::new(),
            last_ack_sent: Instant::now(),
        }
    }

    /// Process a received reliable frame.
    ///
    /// Returns the messages that can now be delivered in order: empty while
    /// waiting for an earlier sequence, several if this one filled a gap.
    /// Duplicates (already delivered or already buffered) return nothing.
    pub fn receive(&mut self, seq: u64, message: ChannelMessage) -> Vec<ChannelMessage> {
        if seq < self.next_expected || self.buffer.contains_key(&seq) {
            return Vec::new();
        }

        if seq == self.next_expected {
            let mut deliverable = vec![message];
            self.next_expected += 1;

            while let Some(buffered) = self.buffer.remove(&self.next_expected) {
                deliverable.push(buffered);
                self.next_expected += 1;
            }

            return deliverable;
        }

        if seq - self.next_expected > REORDER_WINDOW {
            log::warn!(
                "Dropping seq={} beyond reorder window (next_expected={})",
                seq,
                self.next_expected
            );
            return Vec::new();
        }

        self.buffer.insert(seq, message);
        Vec::new()
    }

    /// Generate an ACK frame covering everything received so far.
    pub fn generate_ack(&mut self) -> Frame {
        self.last_ack_sent = Instant::now();

        let delivered = (self.next_expected > 1).then(|| (1, self.next_expected - 1));
        let ranges = delivered
            .into_iter()
            .chain(seqs_to_ranges(self.buffer.keys().copied()))
            .collect();
        Frame::Ack { ranges }
    }

    /// Check if we should re-send an ACK even without new data.
    pub fn should_send_ack_heartbeat(&self) -> bool {
        (self.next_expected > 1 || !self.buffer.is_empty())
            && self.last_ack_sent.elapsed() >= ACK_HEARTBEAT_INTERVAL
    }

    /// Count of buffered (out-of-order) messages.
    pub fn buffered_count(&self) -> usize {
        self.buffer.len()
    }

    /// The next sequence number expected in order.
    pub fn next_expected(&self) -> u64 {
        self.next_expected
    }
}

/// Per-remote reliable session state.
///
/// Each remote has independent sequence spaces for both directions.
#[derive(Debug, Default)]
pub struct ReliableSession {
    /// Sender state for outgoing messages to this remote.
    pub sender: ReliableSender,
    /// Receiver state for incoming messages from this remote.
    pub receiver: ReliableReceiver,
}

impl ReliableSession {
    /// Create a new reliable session.
    pub fn new(config: ReliabilityConfig) -> Self {
        Self {
            sender: ReliableSender::new(config),
            receiver: ReliableReceiver::new(),
        }
    }
}
