//! Client registry with a by-type reverse index.
//!
//! The registry holds two disjoint sets: remotes still waiting for their
//! handshake (`pending`) and active typed clients (`clients`). Only the
//! latter are ever visible to host code.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::client::CompanionClient;
use crate::event::SubscriptionId;
use crate::protocol::messages::{ClientInitialization, InitMessage};
use crate::protocol::{ChannelReceiver, Protocol};
use crate::transport::RemoteId;

/// A connected remote that has not identified itself yet.
#[derive(Debug)]
pub(crate) struct PendingRemote {
    /// Its channel registry (only `companion.init` is registered).
    pub protocol: Arc<Protocol>,
    /// Drop the remote if no handshake arrived by then.
    pub deadline: Instant,
    init_receiver: ChannelReceiver<InitMessage>,
    init_handler: SubscriptionId,
    handshake: Arc<Mutex<Option<ClientInitialization>>>,
}

impl PendingRemote {
    /// Wrap a fresh protocol whose init channel is registered.
    pub fn new(
        protocol: Arc<Protocol>,
        init_receiver: ChannelReceiver<InitMessage>,
        deadline: Instant,
    ) -> Self {
        let handshake = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&handshake);
        let init_handler = init_receiver.add_handler(move |init: &InitMessage| {
            let mut slot = slot.lock().expect("Handshake slot poisoned");
            // First handshake wins.
            if slot.is_none() {
                *slot = Some(init.0.clone());
            }
        });
        Self {
            protocol,
            deadline,
            init_receiver,
            init_handler,
            handshake,
        }
    }

    /// Returns true once a handshake has been dispatched.
    pub fn has_handshake(&self) -> bool {
        self.handshake.lock().expect("Handshake slot poisoned").is_some()
    }

    /// The handshake, if one has been dispatched.
    pub fn take_handshake(&self) -> Option<ClientInitialization> {
        self.handshake.lock().expect("Handshake slot poisoned").take()
    }

    /// Stop listening for handshakes; later ones are ignored.
    pub fn finish(&self) {
        self.init_receiver.remove_handler(self.init_handler);
    }
}

/// Registry of pending remotes and active clients.
///
/// # Reverse Index
///
/// `by_type` maps a client type tag to the remotes of that type, so
/// filtered queries don't scan every client.
///
/// ```text
/// by_type: {
///     "ARKit Face Capture": { remote-a, remote-c },
///     "Virtual Camera":     { remote-b },
/// }
/// ```
#[derive(Debug, Default)]
pub(crate) struct ClientRegistry {
    /// Remotes awaiting their handshake.
    pending: HashMap<RemoteId, PendingRemote>,

    /// Active clients by remote.
    clients: HashMap<RemoteId, Arc<dyn CompanionClient>>,

    /// Reverse index: client type -> remotes of that type.
    by_type: HashMap<String, HashSet<RemoteId>>,
}

impl ClientRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a remote until it identifies itself.
    pub fn add_pending(&mut self, id: RemoteId, pending: PendingRemote) {
        self.pending.insert(id, pending);
    }

    /// Look up a pending remote.
    pub fn pending(&self, id: RemoteId) -> Option<&PendingRemote> {
        self.pending.get(&id)
    }

    /// Stop tracking a pending remote.
    pub fn take_pending(&mut self, id: RemoteId) -> Option<PendingRemote> {
        self.pending.remove(&id)
    }

    /// Pending remotes whose handshake deadline has passed.
    pub fn expired_pending(&self, now: Instant) -> Vec<RemoteId> {
        self.pending
            .iter()
            .filter(|(_, pending)| pending.deadline <= now)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Number of remotes awaiting their handshake.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Register an active client.
    ///
    /// If a client with the same remote already exists, it is replaced.
    pub fn insert(&mut self, client: Arc<dyn CompanionClient>) {
        let id = client.client().id();
        self.unindex(id);
        self.by_type
            .entry(client.client().client_type().to_string())
            .or_default()
            .insert(id);
        self.clients.insert(id, client);
    }

    /// Unregister a client, cleaning up the type index.
    ///
    /// Returns the removed client if it existed.
    pub fn remove(&mut self, id: RemoteId) -> Option<Arc<dyn CompanionClient>> {
        self.unindex(id);
        self.clients.remove(&id)
    }

    fn unindex(&mut self, id: RemoteId) {
        let Some(client) = self.clients.get(&id) else {
            return;
        };
        let client_type = client.client().client_type();
        if let Some(ids) = self.by_type.get_mut(client_type) {
            ids.remove(&id);
            if ids.is_empty() {
                self.by_type.remove(client_type);
            }
        }
    }

    /// Get client by remote.
    pub fn get(&self, id: RemoteId) -> Option<&Arc<dyn CompanionClient>> {
        self.clients.get(&id)
    }

    /// Every active client, oldest first.
    pub fn all(&self) -> Vec<Arc<dyn CompanionClient>> {
        sorted(self.clients.values().cloned().collect())
    }

    /// Active clients of one type, oldest first.
    pub fn of_type(&self, client_type: &str) -> Vec<Arc<dyn CompanionClient>> {
        let Some(ids) = self.by_type.get(client_type) else {
            return Vec::new();
        };
        sorted(ids.iter().filter_map(|id| self.clients.get(id).cloned()).collect())
    }

    /// Number of active clients.
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    /// Every remote in either set.
    pub fn remote_ids(&self) -> Vec<RemoteId> {
        self.pending.keys().chain(self.clients.keys()).copied().collect()
    }
}

fn sorted(mut clients: Vec<Arc<dyn CompanionClient>>) -> Vec<Arc<dyn CompanionClient>> {
    clients.sort_by(|a, b| {
        a.client()
            .connected_at()
            .cmp(&b.client().connected_at())
            .then_with(|| a.client().id().cmp(&b.client().id()))
    });
    clients
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::test_support::identified;
    use crate::client::ClientTypeRegistry;
    use crate::protocol::codec::{Json, WireMessage};
    use crate::protocol::{channels, Side};
    use crate::transport::TransportHandle;
    use std::time::Duration;

    fn typed(client_type: &str, name: &str) -> Arc<dyn CompanionClient> {
        let (client, _rx) = identified(client_type, name);
        ClientTypeRegistry::with_defaults()
            .create(client)
            .unwrap()
            .unwrap()
    }

    #[test]
    fn test_insert_and_filter_by_type() {
        let mut registry = ClientRegistry::new();
        let face = typed("ARKit Face Capture", "PhoneA");
        let camera = typed("Virtual Camera", "iPad");
        registry.insert(Arc::clone(&face));
        registry.insert(Arc::clone(&camera));

        assert_eq!(registry.len(), 2);
        let faces = registry.of_type("ARKit Face Capture");
        assert_eq!(faces.len(), 1);
        assert_eq!(faces[0].client().name(), "PhoneA");
        assert!(registry.of_type("Nope").is_empty());
    }

    #[test]
    fn test_remove_cleans_index() {
        let mut registry = ClientRegistry::new();
        let face = typed("ARKit Face Capture", "PhoneA");
        let id = face.client().id();
        registry.insert(face);

        assert!(registry.remove(id).is_some());
        assert!(registry.remove(id).is_none());
        assert!(registry.get(id).is_none());
        assert!(registry.of_type("ARKit Face Capture").is_empty());
        assert!(registry.by_type.is_empty());
    }

    #[test]
    fn test_pending_expiry_and_handshake_slot() {
        let mut registry = ClientRegistry::new();
        let (client, _rx) = identified("ARKit Face Capture", "x");
        let (transport, _commands) = TransportHandle::channel();
        let protocol = Arc::new(Protocol::new(client.remote(), transport, Side::Server));
        let receiver = protocol.add_receiver::<InitMessage>(&channels::INIT).unwrap();
        let now = Instant::now();
        let id = client.id();
        registry.add_pending(
            id,
            PendingRemote::new(Arc::clone(&protocol), receiver, now + Duration::from_millis(50)),
        );

        assert!(registry.expired_pending(now).is_empty());
        assert_eq!(
            registry.expired_pending(now + Duration::from_millis(60)),
            vec![id]
        );

        let init = Json(client.init().clone());
        protocol.dispatch("companion.init", &init.encode()).unwrap();

        let pending = registry.pending(id).unwrap();
        assert_eq!(pending.take_handshake().unwrap().name, "x");
        assert!(pending.take_handshake().is_none());

        pending.finish();
        protocol.dispatch("companion.init", &init.encode()).unwrap();
        assert!(pending.take_handshake().is_none(), "handler removed");
        assert_eq!(registry.pending_len(), 1);
    }
}
