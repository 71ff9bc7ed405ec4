//! Host-side companion-app clients.
//!
//! This module provides:
//! - [`Client`]: the generic, identified connection (remote, handshake,
//!   channel registry, lifecycle state)
//! - [`CompanionClient`] / [`TypedClient`]: capability-specific wrappers
//!   built by composition over a `Client`
//! - [`ClientTypeRegistry`]: type tag → factory, consulted at handshake
//!
//! # Lifecycle
//!
//! ```text
//! Connected ──(ClientInitialization)──► Identified ──(typed wrapper)──► Active
//!                                                                         │
//!                                                 (disconnect/timeout)    ▼
//!                                                                       Removed
//! ```
//!
//! `Connected` peers live in the server's pending set and never surface as
//! a `Client`; host code only ever sees `Active` clients.

pub mod face;
pub mod names;
pub mod virtual_camera;

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};

use crate::mapping::DeviceId;
use crate::protocol::codec::Json;
use crate::protocol::messages::{AssignmentMessage, ClientInitialization, DeviceAssignment};
use crate::protocol::{channels, ChannelSender, Protocol, ProtocolError};
use crate::transport::{Remote, RemoteId};

pub use face::FaceClient;
pub use virtual_camera::VirtualCameraClient;

/// Lifecycle state of one remote.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// Transport connected, handshake pending.
    Connected,
    /// Handshake received, typed wrapper not yet attached.
    Identified,
    /// Visible to host code.
    Active,
    /// Disconnected; nothing is delivered any more.
    Removed,
}

/// An identified companion-app connection.
pub struct Client {
    remote: Remote,
    init: ClientInitialization,
    protocol: Arc<Protocol>,
    state: Mutex<ClientState>,
    connected_at: DateTime<Utc>,
    assignment: ChannelSender<AssignmentMessage>,
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("remote", &self.remote)
            .field("type", &self.init.client_type)
            .field("name", &self.init.name)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Client {
    /// Wrap a connection whose handshake has been received.
    pub(crate) fn new(
        init: ClientInitialization,
        protocol: Arc<Protocol>,
    ) -> Result<Self, ProtocolError> {
        let assignment = protocol.add_sender::<AssignmentMessage>(&channels::ASSIGNMENT)?;
        Ok(Self {
            remote: protocol.remote(),
            init,
            protocol,
            state: Mutex::new(ClientState::Identified),
            connected_at: Utc::now(),
            assignment,
        })
    }

    /// The connection.
    pub fn remote(&self) -> Remote {
        self.remote
    }

    /// Shorthand for `remote().id`.
    pub fn id(&self) -> RemoteId {
        self.remote.id
    }

    /// Display name from the handshake.
    pub fn name(&self) -> &str {
        &self.init.name
    }

    /// Type tag from the handshake.
    pub fn client_type(&self) -> &str {
        &self.init.client_type
    }

    /// The full handshake.
    pub fn init(&self) -> &ClientInitialization {
        &self.init
    }

    /// This connection's channel registry.
    pub fn protocol(&self) -> &Protocol {
        &self.protocol
    }

    /// When the handshake completed.
    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ClientState {
        *self.state.lock().expect("Client state mutex poisoned")
    }

    /// Returns true once the client has been removed.
    pub fn is_removed(&self) -> bool {
        self.state() == ClientState::Removed
    }

    pub(crate) fn set_state(&self, state: ClientState) {
        *self.state.lock().expect("Client state mutex poisoned") = state;
    }

    /// Tell the app which device it now feeds.
    pub(crate) fn send_assignment(&self, device: Option<&DeviceId>) -> Result<(), ProtocolError> {
        self.assignment.send(&Json(DeviceAssignment {
            device: device.map(|d| d.as_str().to_string()),
        }))
    }
}

impl fmt::Display for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}, {})", self.init.name, self.init.client_type, self.remote.id)
    }
}

/// A typed client, as stored by the server.
pub trait CompanionClient: Send + Sync + fmt::Debug + 'static {
    /// The generic client underneath.
    fn client(&self) -> &Client;

    /// Upcast for downcasting to the concrete type.
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

/// A typed client constructible from an identified [`Client`].
pub trait TypedClient: CompanionClient + Sized {
    /// Handshake type tag this wrapper serves.
    const CLIENT_TYPE: &'static str;

    /// Register this type's channels on the client's protocol.
    fn from_client(client: Client) -> Result<Self, ProtocolError>;
}

/// Downcast a stored client to its concrete type.
pub fn downcast<T: TypedClient>(client: Arc<dyn CompanionClient>) -> Option<Arc<T>> {
    client.into_any().downcast::<T>().ok()
}

type ClientFactory =
    Box<dyn Fn(Client) -> Result<Arc<dyn CompanionClient>, ProtocolError> + Send + Sync>;

/// Type tag → typed client factory.
pub struct ClientTypeRegistry {
    factories: BTreeMap<String, ClientFactory>,
}

impl fmt::Debug for ClientTypeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientTypeRegistry")
            .field("types", &self.types())
            .finish()
    }
}

impl Default for ClientTypeRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl ClientTypeRegistry {
    /// An empty registry; every handshake is refused.
    pub fn new() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }

    /// Registry with the built-in face and virtual camera clients.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry
            .register_type::<FaceClient>()
            .register_type::<VirtualCameraClient>();
        registry
    }

    /// Register a typed client under its [`TypedClient::CLIENT_TYPE`].
    pub fn register_type<T: TypedClient>(&mut self) -> &mut Self {
        self.register(T::CLIENT_TYPE, |client| {
            Ok(Arc::new(T::from_client(client)?) as Arc<dyn CompanionClient>)
        })
    }

    /// Register a factory for an arbitrary type tag. Replaces any previous one.
    pub fn register<F>(&mut self, client_type: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn(Client) -> Result<Arc<dyn CompanionClient>, ProtocolError> + Send + Sync + 'static,
    {
        self.factories.insert(client_type.into(), Box::new(factory));
        self
    }

    /// Returns true if `client_type` has a factory.
    pub fn supports(&self, client_type: &str) -> bool {
        self.factories.contains_key(client_type)
    }

    /// Supported type tags, sorted.
    pub fn types(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }

    /// Build the typed client for `client`, or `None` for an unknown type.
    pub(crate) fn create(
        &self,
        client: Client,
    ) -> Option<Result<Arc<dyn CompanionClient>, ProtocolError>> {
        let factory = self.factories.get(client.client_type())?;
        Some(factory(client))
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::identified;
    use super::*;
    use crate::transport::{Command, Reliability};

    #[test]
    fn test_defaults_registered() {
        let registry = ClientTypeRegistry::with_defaults();
        assert!(registry.supports("ARKit Face Capture"));
        assert!(registry.supports("Virtual Camera"));
        assert!(!registry.supports("Unknown"));
        assert_eq!(registry.types(), vec!["ARKit Face Capture", "Virtual Camera"]);
    }

    #[test]
    fn test_create_and_downcast() {
        let registry = ClientTypeRegistry::with_defaults();
        let (client, _rx) = identified("ARKit Face Capture", "PhoneA");

        let typed = registry.create(client).unwrap().unwrap();
        assert_eq!(typed.client().name(), "PhoneA");
        assert!(typed.client().protocol().is_registered("face.pose_sample"));

        let other = Arc::clone(&typed);
        assert!(downcast::<VirtualCameraClient>(other).is_none());
        assert!(downcast::<FaceClient>(typed).is_some());
    }

    #[test]
    fn test_unknown_type_has_no_factory() {
        let registry = ClientTypeRegistry::new();
        let (client, _rx) = identified("ARKit Face Capture", "PhoneA");
        assert!(registry.create(client).is_none());
    }

    #[test]
    fn test_assignment_is_reliable() {
        let (client, mut rx) = identified("ARKit Face Capture", "PhoneA");
        assert_eq!(client.state(), ClientState::Identified);

        client.send_assignment(Some(&DeviceId::from("Actor1"))).unwrap();
        match rx.try_recv().unwrap() {
            Command::Send {
                channel,
                payload,
                reliability,
                ..
            } => {
                assert_eq!(channel, "companion.assignment");
                assert_eq!(payload, br#"{"device":"Actor1"}"#);
                assert_eq!(reliability, Reliability::ReliableOrdered);
            }
            other => panic!("Expected Send, got {other:?}"),
        }
    }
}
