//! Per-connection channel registry.
//!
//! A [`Protocol`] maps channel identifiers on one remote to typed receivers
//! and senders. Channels are registered before first use; every descriptor
//! declares its reliability and direction, so callers never pick a delivery
//! mode per message.
//!
//! # Architecture
//!
//! ```text
//! TransportEvent::Message { channel, payload }
//!     │
//!     ▼
//! Protocol::dispatch(channel, payload)
//!     │  lookup (lock held only for the lookup)
//!     ▼
//! ChannelReceiver<M>: M::decode(payload) ──► handlers, in subscription order
//!     │
//!     └── on failure: ProtocolError ──► on_error observers, frame dropped
//! ```
//!
//! Both sides of a connection build a `Protocol`: the host with
//! [`Side::Server`] (receives `ToServer` channels, sends `ToClient`), the
//! app with [`Side::Client`].
//!
//! # Usage
//!
//! ```ignore
//! let protocol = Protocol::new(remote, transport, Side::Server);
//! let samples = protocol.add_receiver::<FaceSample>(&channels::FACE_POSE_SAMPLE)?;
//! samples.add_handler(|sample| log::debug!("t={}", sample.timestamp));
//!
//! let assignment = protocol.add_sender::<AssignmentMessage>(&channels::ASSIGNMENT)?;
//! assignment.send(&Json(DeviceAssignment { device: None }))?;
//! ```

pub mod channels;
pub mod codec;
pub mod messages;

use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::event::{SubscriptionId, Subscribers};
use crate::transport::{Reliability, Remote, RemoteId, TransportError, TransportHandle};
use codec::{DecodeError, WireMessage};

/// Which way a channel's messages flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// App to host.
    ToServer,
    /// Host to app.
    ToClient,
}

/// Which end of the connection a [`Protocol`] serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// The host.
    Server,
    /// The companion app.
    Client,
}

impl Side {
    /// Direction of channels this side receives on.
    pub fn inbound(self) -> Direction {
        match self {
            Side::Server => Direction::ToServer,
            Side::Client => Direction::ToClient,
        }
    }

    /// Direction of channels this side sends on.
    pub fn outbound(self) -> Direction {
        match self {
            Side::Server => Direction::ToClient,
            Side::Client => Direction::ToServer,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Server => write!(f, "server"),
            Side::Client => write!(f, "client"),
        }
    }
}

/// Static description of a channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelDescriptor {
    /// Wire identifier, unique per remote.
    pub id: Cow<'static, str>,
    /// Delivery mode used for every message.
    pub reliability: Reliability,
    /// Flow direction.
    pub direction: Direction,
}

impl ChannelDescriptor {
    /// Descriptor with a static id (usable in `const` items).
    pub const fn new(id: &'static str, reliability: Reliability, direction: Direction) -> Self {
        Self {
            id: Cow::Borrowed(id),
            reliability,
            direction,
        }
    }

    /// Descriptor with a runtime id.
    pub fn owned(id: impl Into<String>, reliability: Reliability, direction: Direction) -> Self {
        Self {
            id: Cow::Owned(id.into()),
            reliability,
            direction,
        }
    }
}

/// Errors from channel registration, dispatch and sending.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Inbound message for a channel nobody registered.
    ChannelNotRegistered(String),
    /// Channel id registered twice on one protocol.
    DuplicateChannel(String),
    /// Receiver registered for an outbound channel or vice versa.
    WrongDirection {
        /// Channel id.
        channel: String,
        /// Side that tried to register it.
        side: Side,
    },
    /// Payload failed to decode.
    Malformed {
        /// Channel id.
        channel: String,
        /// Decoder error.
        source: DecodeError,
    },
    /// Transport refused the message.
    Transport(TransportError),
    /// The protocol has been cleared.
    Closed,
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ChannelNotRegistered(channel) => write!(f, "Channel not registered: {channel}"),
            Self::DuplicateChannel(channel) => write!(f, "Channel already registered: {channel}"),
            Self::WrongDirection { channel, side } => {
                write!(f, "Channel {channel} has the wrong direction for the {side} side")
            }
            Self::Malformed { channel, source } => {
                write!(f, "Malformed payload on {channel}: {source}")
            }
            Self::Transport(e) => write!(f, "Transport error: {e}"),
            Self::Closed => write!(f, "Protocol closed"),
        }
    }
}

impl std::error::Error for ProtocolError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Malformed { source, .. } => Some(source),
            Self::Transport(e) => Some(e),
            _ => None,
        }
    }
}

impl From<TransportError> for ProtocolError {
    fn from(e: TransportError) -> Self {
        Self::Transport(e)
    }
}

/// Type-erased inbound channel.
trait InboundChannel: Send + Sync {
    fn dispatch(&self, payload: &[u8]) -> Result<(), DecodeError>;
    fn clear(&self);
}

struct Inbound<M> {
    handlers: Subscribers<M>,
}

impl<M: WireMessage> InboundChannel for Inbound<M> {
    fn dispatch(&self, payload: &[u8]) -> Result<(), DecodeError> {
        let message = M::decode(payload)?;
        self.handlers.emit(&message);
        Ok(())
    }

    fn clear(&self) {
        self.handlers.clear();
    }
}

enum Registration {
    Inbound(Arc<dyn InboundChannel>),
    Outbound,
}

/// Handle to a registered inbound channel.
pub struct ChannelReceiver<M> {
    id: Cow<'static, str>,
    inner: Arc<Inbound<M>>,
}

impl<M> Clone for ChannelReceiver<M> {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<M> fmt::Debug for ChannelReceiver<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelReceiver")
            .field("id", &self.id)
            .field("handlers", &self.inner.handlers.len())
            .finish()
    }
}

impl<M: WireMessage> ChannelReceiver<M> {
    /// Subscribe to every decoded message on this channel.
    pub fn add_handler<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&M) + Send + Sync + 'static,
    {
        self.inner.handlers.subscribe(handler)
    }

    /// Unsubscribe. Returns `false` if the handler was not registered.
    pub fn remove_handler(&self, id: SubscriptionId) -> bool {
        self.inner.handlers.unsubscribe(id)
    }

    /// Number of subscribed handlers.
    pub fn handler_count(&self) -> usize {
        self.inner.handlers.len()
    }

    /// Channel identifier.
    pub fn id(&self) -> &str {
        &self.id
    }
}

/// Handle to a registered outbound channel.
pub struct ChannelSender<M> {
    descriptor: ChannelDescriptor,
    remote: RemoteId,
    transport: TransportHandle,
    closed: Arc<AtomicBool>,
    _message: PhantomData<fn(&M)>,
}

impl<M> Clone for ChannelSender<M> {
    fn clone(&self) -> Self {
        Self {
            descriptor: self.descriptor.clone(),
            remote: self.remote,
            transport: self.transport.clone(),
            closed: Arc::clone(&self.closed),
            _message: PhantomData,
        }
    }
}

impl<M> fmt::Debug for ChannelSender<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelSender")
            .field("id", &self.descriptor.id)
            .field("remote", &self.remote)
            .finish_non_exhaustive()
    }
}

impl<M: WireMessage> ChannelSender<M> {
    /// Send one message with the channel's declared reliability.
    ///
    /// Never blocks: reliable messages are queued until acknowledged.
    pub fn send(&self, message: &M) -> Result<(), ProtocolError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ProtocolError::Closed);
        }
        self.transport.send(
            self.remote,
            &self.descriptor.id,
            message.encode(),
            self.descriptor.reliability,
        )?;
        Ok(())
    }

    /// Channel identifier.
    pub fn id(&self) -> &str {
        &self.descriptor.id
    }

    /// Delivery mode.
    pub fn reliability(&self) -> Reliability {
        self.descriptor.reliability
    }
}

/// Channel registry for one connection.
pub struct Protocol {
    remote: Remote,
    transport: TransportHandle,
    side: Side,
    channels: Mutex<HashMap<String, Registration>>,
    errors: Subscribers<ProtocolError>,
    closed: Arc<AtomicBool>,
}

impl fmt::Debug for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Protocol")
            .field("remote", &self.remote)
            .field("side", &self.side)
            .field("channels", &self.channel_ids())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl Protocol {
    /// Create an empty registry for `remote`.
    pub fn new(remote: Remote, transport: TransportHandle, side: Side) -> Self {
        Self {
            remote,
            transport,
            side,
            channels: Mutex::new(HashMap::new()),
            errors: Subscribers::new(),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// The connection this registry serves.
    pub fn remote(&self) -> Remote {
        self.remote
    }

    /// Which end of the connection this is.
    pub fn side(&self) -> Side {
        self.side
    }

    fn register(
        &self,
        descriptor: &ChannelDescriptor,
        expected: Direction,
        registration: Registration,
    ) -> Result<(), ProtocolError> {
        if self.is_closed() {
            return Err(ProtocolError::Closed);
        }
        if descriptor.direction != expected {
            return Err(ProtocolError::WrongDirection {
                channel: descriptor.id.to_string(),
                side: self.side,
            });
        }

        let mut channels = self.channels.lock().expect("Protocol channels mutex poisoned");
        if channels.contains_key(descriptor.id.as_ref()) {
            return Err(ProtocolError::DuplicateChannel(descriptor.id.to_string()));
        }
        channels.insert(descriptor.id.to_string(), registration);
        Ok(())
    }

    /// Register an inbound channel and return its handle.
    pub fn add_receiver<M: WireMessage>(
        &self,
        descriptor: &ChannelDescriptor,
    ) -> Result<ChannelReceiver<M>, ProtocolError> {
        let inner = Arc::new(Inbound::<M> {
            handlers: Subscribers::new(),
        });
        let erased = Arc::clone(&inner) as Arc<dyn InboundChannel>;
        self.register(descriptor, self.side.inbound(), Registration::Inbound(erased))?;

        log::debug!("[Protocol] {} registered receiver {}", self.remote, descriptor.id);
        Ok(ChannelReceiver {
            id: descriptor.id.clone(),
            inner,
        })
    }

    /// Register an outbound channel and return its handle.
    pub fn add_sender<M: WireMessage>(
        &self,
        descriptor: &ChannelDescriptor,
    ) -> Result<ChannelSender<M>, ProtocolError> {
        self.register(descriptor, self.side.outbound(), Registration::Outbound)?;

        log::debug!("[Protocol] {} registered sender {}", self.remote, descriptor.id);
        Ok(ChannelSender {
            descriptor: descriptor.clone(),
            remote: self.remote.id,
            transport: self.transport.clone(),
            closed: Arc::clone(&self.closed),
            _message: PhantomData,
        })
    }

    /// Route one inbound payload to its channel's handlers.
    ///
    /// Failures are returned and also reported to [`Self::on_error`]
    /// observers; they never affect other channels.
    pub fn dispatch(&self, channel: &str, payload: &[u8]) -> Result<(), ProtocolError> {
        let result = self.try_dispatch(channel, payload);
        if let Err(e) = &result {
            log::debug!("[Protocol] {} dropped frame: {}", self.remote, e);
            self.errors.emit(e);
        }
        result
    }

    fn try_dispatch(&self, channel: &str, payload: &[u8]) -> Result<(), ProtocolError> {
        if self.is_closed() {
            return Err(ProtocolError::Closed);
        }

        let inbound = {
            let channels = self.channels.lock().expect("Protocol channels mutex poisoned");
            match channels.get(channel) {
                Some(Registration::Inbound(inbound)) => Arc::clone(inbound),
                Some(Registration::Outbound) => {
                    return Err(ProtocolError::WrongDirection {
                        channel: channel.to_string(),
                        side: self.side,
                    })
                }
                None => return Err(ProtocolError::ChannelNotRegistered(channel.to_string())),
            }
        };

        inbound
            .dispatch(payload)
            .map_err(|source| ProtocolError::Malformed {
                channel: channel.to_string(),
                source,
            })
    }

    /// Observe dispatch failures.
    pub fn on_error<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&ProtocolError) + Send + Sync + 'static,
    {
        self.errors.subscribe(callback)
    }

    /// Stop observing dispatch failures.
    pub fn remove_error_handler(&self, id: SubscriptionId) -> bool {
        self.errors.unsubscribe(id)
    }

    /// Returns true if `channel` is registered (either direction).
    pub fn is_registered(&self, channel: &str) -> bool {
        self.channels
            .lock()
            .expect("Protocol channels mutex poisoned")
            .contains_key(channel)
    }

    /// Registered channel ids, sorted.
    pub fn channel_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .channels
            .lock()
            .expect("Protocol channels mutex poisoned")
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    /// Unregister every channel and close the registry.
    ///
    /// Handlers are dropped, later dispatches fail with
    /// [`ProtocolError::Closed`] and every sender stops sending.
    pub fn clear(&self) {
        self.closed.store(true, Ordering::Release);
        let drained: Vec<Registration> = self
            .channels
            .lock()
            .expect("Protocol channels mutex poisoned")
            .drain()
            .map(|(_, registration)| registration)
            .collect();
        for registration in drained {
            if let Registration::Inbound(inbound) = registration {
                inbound.clear();
            }
        }
        self.errors.clear();
    }

    /// Returns true once [`Self::clear`] has run.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::codec::Json;
    use crate::protocol::messages::{AssignmentMessage, DeviceAssignment, InitMessage};
    use crate::transport::Command;
    use std::sync::Mutex as StdMutex;

    fn remote() -> Remote {
        Remote {
            id: RemoteId::new(),
            addr: "127.0.0.1:9000".parse().unwrap(),
        }
    }

    fn server_protocol() -> (Protocol, tokio::sync::mpsc::UnboundedReceiver<Command>) {
        let (transport, rx) = TransportHandle::channel();
        (Protocol::new(remote(), transport, Side::Server), rx)
    }

    fn init_bytes(name: &str) -> Vec<u8> {
        Json(messages::ClientInitialization::new("ARKit Face Capture", name, 0)).encode()
    }

    #[test]
    fn test_dispatch_runs_handlers_in_order() {
        let (protocol, _rx) = server_protocol();
        let receiver = protocol.add_receiver::<InitMessage>(&channels::INIT).unwrap();

        let seen = Arc::new(StdMutex::new(Vec::new()));
        for tag in ["first", "second"] {
            let seen = Arc::clone(&seen);
            receiver.add_handler(move |init: &InitMessage| {
                seen.lock().unwrap().push(format!("{tag}:{}", init.0.name));
            });
        }

        protocol.dispatch("companion.init", &init_bytes("PhoneA")).unwrap();
        assert_eq!(*seen.lock().unwrap(), vec!["first:PhoneA", "second:PhoneA"]);
    }

    #[test]
    fn test_remove_handler() {
        let (protocol, _rx) = server_protocol();
        let receiver = protocol.add_receiver::<InitMessage>(&channels::INIT).unwrap();
        let id = receiver.add_handler(|_| panic!("removed handler must not run"));
        assert!(receiver.remove_handler(id));
        protocol.dispatch("companion.init", &init_bytes("x")).unwrap();
        assert_eq!(receiver.handler_count(), 0);
    }

    #[test]
    fn test_duplicate_channel_rejected() {
        let (protocol, _rx) = server_protocol();
        protocol.add_receiver::<InitMessage>(&channels::INIT).unwrap();
        assert_eq!(
            protocol.add_receiver::<InitMessage>(&channels::INIT).unwrap_err(),
            ProtocolError::DuplicateChannel("companion.init".to_string())
        );
    }

    #[test]
    fn test_wrong_direction_rejected() {
        let (protocol, _rx) = server_protocol();
        assert!(matches!(
            protocol.add_receiver::<AssignmentMessage>(&channels::ASSIGNMENT),
            Err(ProtocolError::WrongDirection { side: Side::Server, .. })
        ));
        assert!(matches!(
            protocol.add_sender::<InitMessage>(&channels::INIT),
            Err(ProtocolError::WrongDirection { .. })
        ));
    }

    #[test]
    fn test_unknown_channel_reported_not_fatal() {
        let (protocol, _rx) = server_protocol();
        let errors = Arc::new(StdMutex::new(Vec::new()));
        let errors_ref = Arc::clone(&errors);
        protocol.on_error(move |e| errors_ref.lock().unwrap().push(e.clone()));

        let err = protocol.dispatch("future.channel", b"x").unwrap_err();
        assert_eq!(err, ProtocolError::ChannelNotRegistered("future.channel".to_string()));
        assert_eq!(errors.lock().unwrap().len(), 1);
        assert!(!protocol.is_closed());
    }

    #[test]
    fn test_malformed_payload_dropped_and_channel_survives() {
        let (protocol, _rx) = server_protocol();
        let receiver = protocol.add_receiver::<InitMessage>(&channels::INIT).unwrap();
        let calls = Arc::new(StdMutex::new(0));
        let calls_ref = Arc::clone(&calls);
        receiver.add_handler(move |_| *calls_ref.lock().unwrap() += 1);

        let err = protocol.dispatch("companion.init", b"{oops").unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed { .. }));
        assert_eq!(*calls.lock().unwrap(), 0);

        protocol.dispatch("companion.init", &init_bytes("ok")).unwrap();
        assert_eq!(*calls.lock().unwrap(), 1);
    }

    #[test]
    fn test_inbound_on_outbound_channel_rejected() {
        let (protocol, _rx) = server_protocol();
        protocol.add_sender::<AssignmentMessage>(&channels::ASSIGNMENT).unwrap();
        assert!(matches!(
            protocol.dispatch("companion.assignment", b"{}"),
            Err(ProtocolError::WrongDirection { .. })
        ));
    }

    #[test]
    fn test_sender_uses_declared_reliability() {
        let (protocol, mut rx) = server_protocol();
        let sender = protocol.add_sender::<AssignmentMessage>(&channels::ASSIGNMENT).unwrap();
        sender
            .send(&Json(DeviceAssignment {
                device: Some("Actor1".to_string()),
            }))
            .unwrap();

        match rx.try_recv().unwrap() {
            Command::Send {
                remote,
                channel,
                reliability,
                ..
            } => {
                assert_eq!(remote, protocol.remote().id);
                assert_eq!(channel, "companion.assignment");
                assert_eq!(reliability, Reliability::ReliableOrdered);
            }
            other => panic!("Expected Send, got {other:?}"),
        }
    }

    #[test]
    fn test_clear_closes_everything() {
        let (protocol, mut rx) = server_protocol();
        let receiver = protocol.add_receiver::<InitMessage>(&channels::INIT).unwrap();
        receiver.add_handler(|_| panic!("cleared handler must not run"));
        let sender = protocol.add_sender::<AssignmentMessage>(&channels::ASSIGNMENT).unwrap();

        protocol.clear();

        assert!(protocol.is_closed());
        assert!(protocol.channel_ids().is_empty());
        assert_eq!(
            protocol.dispatch("companion.init", &init_bytes("late")),
            Err(ProtocolError::Closed)
        );
        assert_eq!(
            sender.send(&Json(DeviceAssignment::default())),
            Err(ProtocolError::Closed)
        );
        assert!(rx.try_recv().is_err());
        assert_eq!(
            protocol.add_receiver::<InitMessage>(&channels::INIT).unwrap_err(),
            ProtocolError::Closed
        );
    }
}
