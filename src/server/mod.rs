//! Companion-app server.
//!
//! Accepts remotes on a UDP [`Endpoint`], waits for each one's handshake,
//! builds the matching typed client and publishes it to host code.
//!
//! # Architecture
//!
//! ```text
//! Endpoint ──TransportEvent──► server loop (one task)
//!                                 │
//!     Connected ─────────────────►├── pending (deadline = now + handshake_timeout)
//!     Message(companion.init) ───►├── ClientTypeRegistry factory ──► clients (Active)
//!     Message(other) ────────────►├── Protocol::dispatch
//!     Disconnected ──────────────►├── release pairing ─► clear protocol ─► Removed
//!     tick ──────────────────────►└── expired handshakes ─► disconnect
//!
//! Host code ──► get_clients() / get_client() / mapping() / subscribe()
//! ```
//!
//! The loop is the only writer of the registry. Pairing and server events
//! are published after the registry lock is released.

pub mod registry;

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::{Duration, Instant};

use anyhow::Result;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::client::{downcast, ClientState, CompanionClient, TypedClient};
use crate::client::{Client, ClientTypeRegistry};
use crate::constants::{DEFAULT_BIND_ADDRESS, DEFAULT_HANDSHAKE_TIMEOUT, DEFAULT_PORT, SERVER_TICK};
use crate::event::SubscriptionId;
use crate::mapping::{ClientMappingDatabase, PairingEvent};
use crate::protocol::messages::{InitMessage, PROTOCOL_VERSION};
use crate::protocol::{channels, Protocol, Side};
use crate::transport::{
    DisconnectReason, Endpoint, Remote, RemoteId, TransportConfig, TransportError, TransportEvent,
    TransportHandle,
};
use registry::{ClientRegistry, PendingRemote};

/// Server settings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ServerConfig {
    /// UDP address to listen on.
    pub bind_address: SocketAddr,
    /// How long a new remote has to send its handshake.
    pub handshake_timeout: Duration,
    /// Endpoint tuning.
    pub transport: TransportConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let ip: IpAddr = DEFAULT_BIND_ADDRESS
            .parse()
            .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        Self {
            bind_address: SocketAddr::new(ip, DEFAULT_PORT),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            transport: TransportConfig::default(),
        }
    }
}

/// Client lifecycle notifications for host code.
#[derive(Debug, Clone)]
pub enum ServerEvent {
    /// A client completed its handshake and is now visible.
    ClientConnected(Arc<dyn CompanionClient>),
    /// A visible client went away.
    ClientDisconnected {
        /// The removed client (state [`ClientState::Removed`]).
        client: Arc<dyn CompanionClient>,
        /// Why.
        reason: DisconnectReason,
    },
}

/// State shared between the server loop, host queries and the mapping
/// listener.
#[derive(Debug)]
struct Shared {
    config: ServerConfig,
    transport: TransportHandle,
    types: ClientTypeRegistry,
    mapping: Arc<ClientMappingDatabase>,
    registry: RwLock<ClientRegistry>,
    subscribers: Mutex<Vec<UnboundedSender<ServerEvent>>>,
}

/// The companion-app server.
///
/// There is no global instance: create one with [`Self::start`] and hand
/// references to whatever needs it.
#[derive(Debug)]
pub struct CompanionAppServer {
    shared: Arc<Shared>,
    local_addr: SocketAddr,
    endpoint: Option<Endpoint>,
    task: Option<JoinHandle<()>>,
    mapping_subscription: Option<SubscriptionId>,
}

impl CompanionAppServer {
    /// Bind the endpoint and spawn the server loop.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket cannot be bound.
    pub async fn start(
        config: ServerConfig,
        types: ClientTypeRegistry,
        mapping: Arc<ClientMappingDatabase>,
    ) -> Result<Self> {
        let (endpoint, events) = Endpoint::bind(config.bind_address, config.transport, true).await?;
        let local_addr = endpoint.local_addr();

        let shared = Arc::new(Shared {
            config,
            transport: endpoint.handle(),
            types,
            mapping: Arc::clone(&mapping),
            registry: RwLock::new(ClientRegistry::new()),
            subscribers: Mutex::new(Vec::new()),
        });

        // Weak: the mapping outlives the server and must not keep it alive.
        let weak: Weak<Shared> = Arc::downgrade(&shared);
        let mapping_subscription = mapping.subscribe(move |event| {
            if let Some(shared) = weak.upgrade() {
                shared.push_assignment(event);
            }
        });

        let task = tokio::spawn(run(Arc::clone(&shared), events));

        log::info!(
            "[Server] Companion app server started on {} (types: {})",
            local_addr,
            shared.types.types().join(", ")
        );

        Ok(Self {
            shared,
            local_addr,
            endpoint: Some(endpoint),
            task: Some(task),
            mapping_subscription: Some(mapping_subscription),
        })
    }

    /// Disconnect every remote and stop the server loop.
    ///
    /// Every visible client is removed (and its pairing released) before
    /// this returns.
    pub async fn stop(mut self) {
        if let Some(endpoint) = self.endpoint.take() {
            endpoint.shutdown().await;
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                log::warn!("[Server] Server loop ended abnormally: {e}");
            }
        }
        self.unsubscribe_mapping();
        log::info!("[Server] Companion app server stopped");
    }

    fn unsubscribe_mapping(&mut self) {
        if let Some(id) = self.mapping_subscription.take() {
            self.shared.mapping.unsubscribe(id);
        }
    }

    /// The bound address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The pairing map this server pushes assignments for.
    pub fn mapping(&self) -> &Arc<ClientMappingDatabase> {
        &self.shared.mapping
    }

    /// Every active client, oldest first.
    pub fn get_clients(&self) -> Vec<Arc<dyn CompanionClient>> {
        self.shared.read_registry().all()
    }

    /// Active clients of one concrete type.
    pub fn get_clients_of<T: TypedClient>(&self) -> Vec<Arc<T>> {
        self.shared
            .read_registry()
            .of_type(T::CLIENT_TYPE)
            .into_iter()
            .filter_map(downcast::<T>)
            .collect()
    }

    /// Active clients with a given type tag.
    pub fn get_clients_by_type(&self, client_type: &str) -> Vec<Arc<dyn CompanionClient>> {
        self.shared.read_registry().of_type(client_type)
    }

    /// Active clients announcing every capability bit in `flags`.
    pub fn get_clients_with_capability(&self, flags: u32) -> Vec<Arc<dyn CompanionClient>> {
        self.shared
            .read_registry()
            .all()
            .into_iter()
            .filter(|c| c.client().init().has_capability(flags))
            .collect()
    }

    /// One active client.
    pub fn get_client(&self, id: RemoteId) -> Option<Arc<dyn CompanionClient>> {
        self.shared.read_registry().get(id).cloned()
    }

    /// One active client of a concrete type.
    pub fn get_client_of<T: TypedClient>(&self, id: RemoteId) -> Option<Arc<T>> {
        self.get_client(id).and_then(downcast::<T>)
    }

    /// Lookup from remote id to a live client of type `T`.
    ///
    /// Holds the server weakly; once it is gone every lookup misses.
    pub fn resolver<T: TypedClient>(&self) -> impl Fn(RemoteId) -> Option<Arc<T>> + Send + Sync + 'static {
        let weak = Arc::downgrade(&self.shared);
        move |id| {
            let shared = weak.upgrade()?;
            let client = shared.read_registry().get(id).cloned()?;
            downcast::<T>(client)
        }
    }

    /// Number of remotes still waiting for their handshake.
    pub fn pending_count(&self) -> usize {
        self.shared.read_registry().pending_len()
    }

    /// Close a remote. Removal follows once the transport confirms.
    pub fn disconnect(&self, id: RemoteId) -> Result<(), TransportError> {
        self.shared.transport.disconnect(id)
    }

    /// Receive client lifecycle events from now on.
    pub fn subscribe(&self) -> UnboundedReceiver<ServerEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.shared
            .subscribers
            .lock()
            .expect("Server subscribers mutex poisoned")
            .push(tx);
        rx
    }
}

impl Drop for CompanionAppServer {
    fn drop(&mut self) {
        // The endpoint shuts itself down on drop, which ends the loop.
        self.unsubscribe_mapping();
    }
}

async fn run(shared: Arc<Shared>, mut events: UnboundedReceiver<TransportEvent>) {
    let mut tick = tokio::time::interval(SERVER_TICK);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => shared.handle_transport_event(event),
                // Endpoint gone; every Disconnected has been handled.
                None => break,
            },
            _ = tick.tick() => shared.expire_handshakes(Instant::now()),
        }
    }

    shared.remove_all();
}

impl Shared {
    fn read_registry(&self) -> std::sync::RwLockReadGuard<'_, ClientRegistry> {
        self.registry.read().expect("Client registry lock poisoned")
    }

    fn write_registry(&self) -> std::sync::RwLockWriteGuard<'_, ClientRegistry> {
        self.registry.write().expect("Client registry lock poisoned")
    }

    fn handle_transport_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::Connected(remote) => self.on_connected(remote),
            TransportEvent::Message {
                remote,
                channel,
                payload,
                ..
            } => self.on_message(remote, &channel, &payload),
            TransportEvent::Disconnected { remote, reason } => self.remove_remote(remote.id, reason),
        }
    }

    fn on_connected(&self, remote: Remote) {
        let protocol = Arc::new(Protocol::new(remote, self.transport.clone(), Side::Server));
        let init_receiver = match protocol.add_receiver::<InitMessage>(&channels::INIT) {
            Ok(receiver) => receiver,
            Err(e) => {
                log::error!("[Server] Cannot register handshake channel for {remote}: {e}");
                self.drop_remote(remote.id);
                return;
            }
        };

        let deadline = Instant::now() + self.config.handshake_timeout;
        self.write_registry()
            .add_pending(remote.id, PendingRemote::new(protocol, init_receiver, deadline));
        log::debug!("[Server] {} connected, awaiting handshake", remote);
    }

    fn on_message(&self, remote: Remote, channel: &str, payload: &[u8]) {
        let (client, pending_protocol) = {
            let registry = self.read_registry();
            match registry.get(remote.id) {
                Some(client) => (Some(Arc::clone(client)), None),
                None => (None, registry.pending(remote.id).map(|p| Arc::clone(&p.protocol))),
            }
        };

        if let Some(client) = client {
            if client.client().is_removed() {
                return;
            }
            // Errors are logged and reported by the protocol itself.
            let _ = client.client().protocol().dispatch(channel, payload);
            return;
        }

        let Some(protocol) = pending_protocol else {
            log::debug!("[Server] Message from unknown remote {}", remote);
            return;
        };

        // A malformed handshake leaves the remote pending until its deadline.
        if protocol.dispatch(channel, payload).is_err() {
            return;
        }
        let identified = self
            .read_registry()
            .pending(remote.id)
            .is_some_and(PendingRemote::has_handshake);
        if identified {
            self.complete_handshake(remote);
        }
    }

    fn complete_handshake(&self, remote: Remote) {
        let Some(pending) = self.write_registry().take_pending(remote.id) else {
            return;
        };
        pending.finish();
        let Some(init) = pending.take_handshake() else {
            return;
        };

        if init.protocol_version != PROTOCOL_VERSION {
            log::warn!(
                "[Server] {} speaks protocol v{}, expected v{}; disconnecting",
                remote,
                init.protocol_version,
                PROTOCOL_VERSION
            );
            pending.protocol.clear();
            self.drop_remote(remote.id);
            return;
        }

        let client_type = init.client_type.clone();
        let name = init.name.clone();
        let client = match Client::new(init, Arc::clone(&pending.protocol)) {
            Ok(client) => client,
            Err(e) => {
                log::error!("[Server] Cannot set up client {}: {}", remote, e);
                pending.protocol.clear();
                self.drop_remote(remote.id);
                return;
            }
        };

        let typed = match self.types.create(client) {
            Some(Ok(typed)) => typed,
            Some(Err(e)) => {
                log::error!("[Server] Cannot build {} client for {}: {}", client_type, remote, e);
                pending.protocol.clear();
                self.drop_remote(remote.id);
                return;
            }
            None => {
                log::warn!(
                    "[Server] {} requested unsupported client type {:?}; disconnecting",
                    remote,
                    client_type
                );
                pending.protocol.clear();
                self.drop_remote(remote.id);
                return;
            }
        };

        typed.client().set_state(ClientState::Active);
        self.write_registry().insert(Arc::clone(&typed));

        log::info!("[Server] Client connected: {} ({}) from {}", name, client_type, remote);
        self.publish(&ServerEvent::ClientConnected(typed));
    }

    /// Handshake deadlines.
    fn expire_handshakes(&self, now: Instant) {
        let expired = {
            let mut registry = self.write_registry();
            let ids = registry.expired_pending(now);
            ids.into_iter()
                .filter_map(|id| registry.take_pending(id).map(|p| (id, p)))
                .collect::<Vec<_>>()
        };

        for (id, pending) in expired {
            log::warn!(
                "[Server] Handshake timeout for {}; disconnecting",
                pending.protocol.remote()
            );
            pending.protocol.clear();
            self.drop_remote(id);
        }
    }

    fn drop_remote(&self, id: RemoteId) {
        if let Err(e) = self.transport.disconnect(id) {
            log::debug!("[Server] Disconnect of {} failed: {}", id, e);
        }
    }

    /// Remove a departed remote.
    ///
    /// Release pairing edge, clear protocol, mark `Removed`, drop from the
    /// set: all under the registry write lock. Events go out afterwards.
    fn remove_remote(&self, id: RemoteId, reason: DisconnectReason) {
        let client = {
            let mut registry = self.write_registry();

            if let Some(pending) = registry.take_pending(id) {
                pending.protocol.clear();
                log::debug!("[Server] Pending remote {} gone ({})", id, reason);
                return;
            }
            let Some(client) = registry.get(id).cloned() else {
                return;
            };

            // Retired, so a racing set_client cannot pair it again.
            self.mapping.retire_client(id);
            client.client().protocol().clear();
            client.client().set_state(ClientState::Removed);
            registry.remove(id);
            client
        };

        self.mapping.deliver();
        log::info!(
            "[Server] Client disconnected: {} ({})",
            client.client(),
            reason
        );
        self.publish(&ServerEvent::ClientDisconnected { client, reason });
    }

    /// Anything still registered when the endpoint is gone.
    fn remove_all(&self) {
        let ids = self.read_registry().remote_ids();
        for id in ids {
            self.remove_remote(id, DisconnectReason::Shutdown);
        }
    }

    fn publish(&self, event: &ServerEvent) {
        self.subscribers
            .lock()
            .expect("Server subscribers mutex poisoned")
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Tell a live client about its new assignment.
    fn push_assignment(&self, event: &PairingEvent) {
        let Some(client) = self.read_registry().get(event.client()).cloned() else {
            return;
        };
        if client.client().is_removed() {
            return;
        }

        let device = match event {
            PairingEvent::Assigned { device, .. } => Some(device),
            PairingEvent::Released { .. } => None,
        };
        if let Err(e) = client.client().send_assignment(device) {
            log::warn!(
                "[Server] Failed to send assignment to {}: {}",
                client.client(),
                e
            );
        }
    }
}
