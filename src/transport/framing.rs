//! Wire codec for endpoint datagrams.
//!
//! Every datagram carries one or more length-prefixed frames with a type
//! byte:
//!
//! ```text
//! [u32 LE length] [u8 type] [payload: length-1 bytes]
//! ```
//!
//! Frame types:
//! - `0x01`: Reliable data: `[u64 seq][channel message]`
//! - `0x02`: Unreliable data: `[channel message]`
//! - `0x03`: Selective ack: `[u16 count][count × (u64 start, u64 end)]`
//! - `0x04`: Heartbeat (empty)
//! - `0x05`: Disconnect (empty)
//!
//! A channel message is `[u8 id_len][id bytes (UTF-8)][payload]`.
//! All integers are little-endian.

use anyhow::{anyhow, bail, Result};
use bytes::{Buf, BufMut};

/// Largest UDP payload we ever put on the wire.
pub const MAX_DATAGRAM_SIZE: usize = 65_507;

/// Largest application payload accepted by `send`.
///
/// Leaves room for the frame header, sequence number and a maximal
/// channel id so one message always fits one datagram.
pub const MAX_PAYLOAD_SIZE: usize = 64 * 1024 - 1024;

/// Longest channel id (length is encoded in one byte).
pub const MAX_CHANNEL_ID_LEN: usize = u8::MAX as usize;

/// Most ack ranges carried in one ack frame.
pub const MAX_ACK_RANGES: usize = 512;

/// Frame type constants.
pub mod frame_type {
    /// Sequenced data on a reliable-ordered channel.
    pub const RELIABLE: u8 = 0x01;
    /// Best-effort data on an unreliable-unordered channel.
    pub const UNRELIABLE: u8 = 0x02;
    /// Selective acknowledgement of reliable sequence numbers.
    pub const ACK: u8 = 0x03;
    /// Keepalive, sent when nothing else has been sent recently.
    pub const HEARTBEAT: u8 = 0x04;
    /// Graceful close notification.
    pub const DISCONNECT: u8 = 0x05;
}

/// Payload addressed to one named channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelMessage {
    /// Channel identifier.
    pub channel: String,
    /// Opaque payload bytes (already encoded by the channel codec).
    pub payload: Vec<u8>,
}

impl ChannelMessage {
    /// Create a channel message.
    pub fn new(channel: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            channel: channel.into(),
            payload,
        }
    }

    fn encoded_len(&self) -> usize {
        1 + self.channel.len() + self.payload.len()
    }

    fn put(&self, buf: &mut Vec<u8>) {
        // Channel id length is validated by `TransportHandle::send`.
        buf.put_u8(self.channel.len() as u8);
        buf.put_slice(self.channel.as_bytes());
        buf.put_slice(&self.payload);
    }

    fn parse(mut payload: &[u8]) -> Result<Self> {
        if payload.is_empty() {
            bail!("Channel message missing id length");
        }
        let id_len = payload.get_u8() as usize;
        if payload.len() < id_len {
            bail!(
                "Channel id truncated: need {id_len} bytes, have {}",
                payload.len()
            );
        }
        let channel = std::str::from_utf8(&payload[..id_len])
            .map_err(|e| anyhow!("Channel id is not UTF-8: {e}"))?
            .to_string();
        Ok(Self {
            channel,
            payload: payload[id_len..].to_vec(),
        })
    }
}

/// A decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Reliable data with its sequence number.
    Reliable {
        /// Per-remote sequence number (starts at 1).
        seq: u64,
        /// The carried message.
        message: ChannelMessage,
    },

    /// Unreliable data.
    Unreliable(ChannelMessage),

    /// Selective acknowledgement, e.g. `[(1, 3), (5, 5)]` = "have 1-3 and 5".
    Ack {
        /// Inclusive ranges of received sequence numbers.
        ranges: Vec<(u64, u64)>,
    },

    /// Keepalive.
    Heartbeat,

    /// Graceful close.
    Disconnect,
}

impl Frame {
    /// Encode this frame into wire bytes.
    ///
    /// Returns `[u32 LE length][u8 type][payload]`.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Frame::Reliable { seq, message } => {
                let mut payload = Vec::with_capacity(8 + message.encoded_len());
                payload.put_u64_le(*seq);
                message.put(&mut payload);
                encode_raw(frame_type::RELIABLE, &payload)
            }
            Frame::Unreliable(message) => {
                let mut payload = Vec::with_capacity(message.encoded_len());
                message.put(&mut payload);
                encode_raw(frame_type::UNRELIABLE, &payload)
            }
            Frame::Ack { ranges } => {
                let count = ranges.len().min(MAX_ACK_RANGES);
                let mut payload = Vec::with_capacity(2 + count * 16);
                payload.put_u16_le(count as u16);
                for &(start, end) in ranges.iter().take(count) {
                    payload.put_u64_le(start);
                    payload.put_u64_le(end);
                }
                encode_raw(frame_type::ACK, &payload)
            }
            Frame::Heartbeat => encode_raw(frame_type::HEARTBEAT, &[]),
            Frame::Disconnect => encode_raw(frame_type::DISCONNECT, &[]),
        }
    }
}

/// Encode a raw frame with type byte and payload.
fn encode_raw(frame_type: u8, payload: &[u8]) -> Vec<u8> {
    let length = (payload.len() + 1) as u32; // +1 for type byte
    let mut buf = Vec::with_capacity(4 + 1 + payload.len());
    buf.put_u32_le(length);
    buf.put_u8(frame_type);
    buf.put_slice(payload);
    buf
}

/// Decode a single frame from a type byte and payload.
fn decode_frame(frame_type: u8, mut payload: &[u8]) -> Result<Frame> {
    match frame_type {
        frame_type::RELIABLE => {
            if payload.len() < 8 {
                bail!("Reliable frame too short: {} bytes", payload.len());
            }
            let seq = payload.get_u64_le();
            if seq == 0 {
                bail!("Reliable frame with reserved seq 0");
            }
            Ok(Frame::Reliable {
                seq,
                message: ChannelMessage::parse(payload)?,
            })
        }
        frame_type::UNRELIABLE => Ok(Frame::Unreliable(ChannelMessage::parse(payload)?)),
        frame_type::ACK => {
            if payload.len() < 2 {
                bail!("Ack frame too short: {} bytes", payload.len());
            }
            let count = payload.get_u16_le() as usize;
            if payload.len() != count * 16 {
                bail!(
                    "Ack frame declares {count} ranges but carries {} bytes",
                    payload.len()
                );
            }
            let mut ranges = Vec::with_capacity(count);
            for _ in 0..count {
                let start = payload.get_u64_le();
                let end = payload.get_u64_le();
                if start > end {
                    bail!("Ack range inverted: ({start}, {end})");
                }
                ranges.push((start, end));
            }
            Ok(Frame::Ack { ranges })
        }
        frame_type::HEARTBEAT => Ok(Frame::Heartbeat),
        frame_type::DISCONNECT => Ok(Frame::Disconnect),
        _ => bail!("Unknown frame type: 0x{frame_type:02x}"),
    }
}

/// Decode every frame in one datagram.
///
/// A datagram is self-contained: a trailing partial frame is an error,
/// not something to wait for.
///
/// # Errors
///
/// Returns an error if any frame is malformed, truncated, or of an
/// unknown type. The whole datagram is rejected in that case.
pub fn decode_datagram(mut bytes: &[u8]) -> Result<Vec<Frame>> {
    if bytes.is_empty() {
        bail!("Empty datagram");
    }

    let mut frames = Vec::new();
    while !bytes.is_empty() {
        if bytes.len() < 4 {
            bail!("Truncated frame header: {} bytes", bytes.len());
        }
        let length = bytes.get_u32_le() as usize;
        if length == 0 {
            bail!("Invalid frame: zero length");
        }
        if length > bytes.len() {
            bail!(
                "Truncated frame: declared {length} bytes, have {}",
                bytes.len()
            );
        }
        let frame_type = bytes[0];
        frames.push(decode_frame(frame_type, &bytes[1..length])?);
        bytes.advance(length);
    }

    Ok(frames)
}
