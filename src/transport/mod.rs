//! Datagram transport to companion-app peers.
//!
//! An [`Endpoint`] owns one UDP socket and the state of every peer reached
//! through it. Host code never touches the socket: it sends through a
//! cloneable [`TransportHandle`] and observes peers through a stream of
//! [`TransportEvent`]s.
//!
//! # Delivery modes
//!
//! - [`Reliability::ReliableOrdered`]: exactly once, in send order, retried
//!   until acknowledged or the peer is declared dead.
//! - [`Reliability::UnreliableUnordered`]: best-effort, never retried,
//!   never blocks.
//!
//! # Lifecycle
//!
//! ```text
//! first datagram / connect()        no traffic for liveness_timeout
//!          │                                   │
//!          ▼                                   ▼
//!      Connected ──── Message* ────────► Disconnected (exactly once)
//! ```

pub mod endpoint;
pub mod framing;
pub mod reliable;

use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

pub use endpoint::Endpoint;
pub use reliable::ReliabilityConfig;

use crate::constants::{DEFAULT_HEARTBEAT_INTERVAL, DEFAULT_LIVENESS_TIMEOUT, TRANSPORT_TICK};
use framing::{MAX_CHANNEL_ID_LEN, MAX_PAYLOAD_SIZE};

/// Opaque identifier of one connected peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RemoteId(Uuid);

impl RemoteId {
    /// Generate a fresh id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// The underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for RemoteId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RemoteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // First 8 hex digits are plenty for log lines.
        let simple = self.0.simple().to_string();
        write!(f, "{}", &simple[..8])
    }
}

/// One connected peer: identity plus network endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Remote {
    /// Stable identity for the lifetime of the connection.
    pub id: RemoteId,
    /// Peer socket address.
    pub addr: SocketAddr,
}

impl fmt::Display for Remote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.addr)
    }
}

/// Delivery guarantee of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Reliability {
    /// Exactly once, in send order.
    ReliableOrdered,
    /// Best-effort, no retry, no ordering.
    UnreliableUnordered,
}

impl fmt::Display for Reliability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ReliableOrdered => write!(f, "reliable-ordered"),
            Self::UnreliableUnordered => write!(f, "unreliable-unordered"),
        }
    }
}

/// Why a peer went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// This side asked for it via [`TransportHandle::disconnect`].
    Local,
    /// The peer sent a Disconnect frame.
    RemoteClosed,
    /// Nothing heard from the peer within the liveness timeout.
    LivenessTimeout,
    /// A reliable message ran out of retransmission attempts.
    DeliveryFailed,
    /// The endpoint was shut down.
    Shutdown,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Local => "closed locally",
            Self::RemoteClosed => "closed by peer",
            Self::LivenessTimeout => "liveness timeout",
            Self::DeliveryFailed => "reliable delivery failed",
            Self::Shutdown => "endpoint shutdown",
        };
        f.write_str(text)
    }
}

/// Something that happened on the endpoint.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// A new peer appeared.
    Connected(Remote),
    /// A message arrived on a channel.
    Message {
        /// Sender.
        remote: Remote,
        /// Channel identifier.
        channel: String,
        /// Raw payload.
        payload: Vec<u8>,
        /// Mode it was delivered with.
        reliability: Reliability,
    },
    /// A peer is gone. Fires exactly once per [`Remote`].
    Disconnected {
        /// The departed peer.
        remote: Remote,
        /// Why.
        reason: DisconnectReason,
    },
}

/// Errors from [`TransportHandle`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The endpoint task has stopped.
    Closed,
    /// Payload does not fit in one datagram.
    PayloadTooLarge {
        /// Offending size.
        size: usize,
        /// Largest accepted size.
        max: usize,
    },
    /// Channel id longer than the wire allows.
    ChannelIdTooLong(usize),
    /// Connecting to a peer failed.
    ConnectFailed(String),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "Transport endpoint closed"),
            Self::PayloadTooLarge { size, max } => {
                write!(f, "Payload of {size} bytes exceeds maximum of {max}")
            }
            Self::ChannelIdTooLong(len) => {
                write!(f, "Channel id of {len} bytes exceeds {MAX_CHANNEL_ID_LEN}")
            }
            Self::ConnectFailed(msg) => write!(f, "Connect failed: {msg}"),
        }
    }
}

impl std::error::Error for TransportError {}

/// Endpoint tuning.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransportConfig {
    /// Disconnect a peer after this long without traffic.
    pub liveness_timeout: Duration,
    /// Send a heartbeat after this long without sending.
    pub heartbeat_interval: Duration,
    /// Housekeeping period (retransmits, heartbeats, timeouts).
    pub tick_interval: Duration,
    /// Reliable-ordered retransmission parameters.
    pub reliability: ReliabilityConfig,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            liveness_timeout: DEFAULT_LIVENESS_TIMEOUT,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            tick_interval: TRANSPORT_TICK,
            reliability: ReliabilityConfig::default(),
        }
    }
}

/// Requests from handles to the endpoint task.
#[derive(Debug)]
pub(crate) enum Command {
    Connect {
        addr: SocketAddr,
        reply: oneshot::Sender<Remote>,
    },
    Send {
        remote: RemoteId,
        channel: String,
        payload: Vec<u8>,
        reliability: Reliability,
    },
    Disconnect {
        remote: RemoteId,
    },
    Shutdown,
}

/// Cloneable handle for talking to an [`Endpoint`].
///
/// Every method only enqueues a command, so none of them block.
#[derive(Debug, Clone)]
pub struct TransportHandle {
    command_tx: mpsc::UnboundedSender<Command>,
}

impl TransportHandle {
    pub(crate) fn from_sender(command_tx: mpsc::UnboundedSender<Command>) -> Self {
        Self { command_tx }
    }

    /// A handle wired to a bare command queue, for exercising callers
    /// without a socket.
    #[cfg(test)]
    pub(crate) fn channel() -> (Self, mpsc::UnboundedReceiver<Command>) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        (Self::from_sender(command_tx), command_rx)
    }

    /// Queue a message for `remote`.
    ///
    /// Unknown or already-disconnected remotes are ignored by the endpoint.
    pub fn send(
        &self,
        remote: RemoteId,
        channel: &str,
        payload: Vec<u8>,
        reliability: Reliability,
    ) -> Result<(), TransportError> {
        if channel.len() > MAX_CHANNEL_ID_LEN {
            return Err(TransportError::ChannelIdTooLong(channel.len()));
        }
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(TransportError::PayloadTooLarge {
                size: payload.len(),
                max: MAX_PAYLOAD_SIZE,
            });
        }

        let command = Command::Send {
            remote,
            channel: channel.to_string(),
            payload,
            reliability,
        };
        if self.command_tx.send(command).is_err() {
            return Err(TransportError::Closed);
        }
        Ok(())
    }

    /// Close the connection to `remote`.
    pub fn disconnect(&self, remote: RemoteId) -> Result<(), TransportError> {
        if self.command_tx.send(Command::Disconnect { remote }).is_err() {
            return Err(TransportError::Closed);
        }
        Ok(())
    }

    /// Open a connection to a listening endpoint.
    ///
    /// UDP has no connect handshake; the peer learns about us from the
    /// first datagram, which is sent immediately.
    pub async fn connect(&self, addr: SocketAddr) -> Result<Remote, TransportError> {
        let (reply, reply_rx) = oneshot::channel();
        if self.command_tx.send(Command::Connect { addr, reply }).is_err() {
            return Err(TransportError::Closed);
        }
        reply_rx.await.or(Err(TransportError::Closed))
    }

    /// Returns true once the endpoint task has stopped.
    pub fn is_closed(&self) -> bool {
        self.command_tx.is_closed()
    }

    pub(crate) fn shutdown(&self) {
        // Already stopped is fine.
        let _ = self.command_tx.send(Command::Shutdown);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_rejects_oversized_payload() {
        let (handle, _rx) = TransportHandle::channel();
        let err = handle
            .send(
                RemoteId::new(),
                "x",
                vec![0; MAX_PAYLOAD_SIZE + 1],
                Reliability::UnreliableUnordered,
            )
            .unwrap_err();
        assert_eq!(
            err,
            TransportError::PayloadTooLarge {
                size: MAX_PAYLOAD_SIZE + 1,
                max: MAX_PAYLOAD_SIZE
            }
        );
    }

    #[test]
    fn test_send_rejects_long_channel_id() {
        let (handle, _rx) = TransportHandle::channel();
        let long = "c".repeat(MAX_CHANNEL_ID_LEN + 1);
        let err = handle
            .send(RemoteId::new(), &long, vec![], Reliability::ReliableOrdered)
            .unwrap_err();
        assert_eq!(err, TransportError::ChannelIdTooLong(MAX_CHANNEL_ID_LEN + 1));
    }

    #[test]
    fn test_send_after_endpoint_gone() {
        let (handle, rx) = TransportHandle::channel();
        drop(rx);
        assert!(handle.is_closed());
        assert_eq!(
            handle.send(RemoteId::new(), "x", vec![1], Reliability::ReliableOrdered),
            Err(TransportError::Closed)
        );
    }

    #[test]
    fn test_send_enqueues_command() {
        let (handle, mut rx) = TransportHandle::channel();
        let remote = RemoteId::new();
        handle
            .send(remote, "chan", vec![7], Reliability::UnreliableUnordered)
            .unwrap();

        match rx.try_recv().unwrap() {
            Command::Send {
                remote: r,
                channel,
                payload,
                reliability,
            } => {
                assert_eq!(r, remote);
                assert_eq!(channel, "chan");
                assert_eq!(payload, vec![7]);
                assert_eq!(reliability, Reliability::UnreliableUnordered);
            }
            other => panic!("Expected Send, got {other:?}"),
        }
    }

    #[test]
    fn test_remote_id_display_is_short() {
        assert_eq!(RemoteId::new().to_string().len(), 8);
    }
}
