//! Client mapping database: which client feeds which device.
//!
//! Both directions live under one `RwLock`, so a reader always sees a
//! complete edge set: a client maps to at most one device and a device to
//! at most one client. Lookups are O(1) either way.
//!
//! Observers get [`PairingEvent`]s after the lock is released, in the order
//! the edges changed, even across concurrent writers: events are queued
//! while the write lock is held and delivered by one caller at a time. A
//! device that loses its client always gets a `Released` event.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, RwLock};

use serde::{Deserialize, Serialize};

use crate::event::{SubscriptionId, Subscribers};
use crate::transport::RemoteId;

/// Identifier of a host-side capture device.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceId(String);

impl DeviceId {
    /// Create a device id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get as string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for DeviceId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// An edge was installed or torn down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PairingEvent {
    /// `client` now feeds `device`.
    Assigned {
        /// The device.
        device: DeviceId,
        /// Its new client.
        client: RemoteId,
    },
    /// `client` no longer feeds `device`.
    Released {
        /// The device.
        device: DeviceId,
        /// Its former client.
        client: RemoteId,
    },
}

impl PairingEvent {
    /// The device this event concerns.
    pub fn device(&self) -> &DeviceId {
        match self {
            Self::Assigned { device, .. } | Self::Released { device, .. } => device,
        }
    }

    /// The client this event concerns.
    pub fn client(&self) -> RemoteId {
        match self {
            Self::Assigned { client, .. } | Self::Released { client, .. } => *client,
        }
    }
}

/// Pairing rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PairingError {
    /// The device already has a different client and `replace` was false.
    Conflict {
        /// The contested device.
        device: DeviceId,
        /// Client that keeps it.
        current: RemoteId,
    },
    /// The client has already been removed by the server.
    ClientRemoved {
        /// The departed client.
        client: RemoteId,
    },
}

impl fmt::Display for PairingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Conflict { device, current } => {
                write!(f, "Device {device} is already assigned to client {current}")
            }
            Self::ClientRemoved { client } => write!(f, "Client {client} has been removed"),
        }
    }
}

impl std::error::Error for PairingError {}

#[derive(Debug, Default)]
struct Edges {
    by_device: HashMap<DeviceId, RemoteId>,
    by_client: HashMap<RemoteId, DeviceId>,
    /// Clients the server removed. Remote ids are never reused.
    retired: HashSet<RemoteId>,
}

impl Edges {
    fn assign(
        &mut self,
        device: &DeviceId,
        client: Option<RemoteId>,
        replace: bool,
        events: &mut Vec<PairingEvent>,
    ) -> Result<(), PairingError> {
        let Some(client) = client else {
            self.release_device(device, events);
            return Ok(());
        };

        if self.retired.contains(&client) {
            return Err(PairingError::ClientRemoved { client });
        }
        match self.by_device.get(device) {
            Some(current) if *current == client => return Ok(()),
            Some(current) if !replace => {
                return Err(PairingError::Conflict {
                    device: device.clone(),
                    current: *current,
                })
            }
            _ => {}
        }

        self.release_device(device, events);
        self.release_client(client, events);

        self.by_device.insert(device.clone(), client);
        self.by_client.insert(client, device.clone());
        events.push(PairingEvent::Assigned {
            device: device.clone(),
            client,
        });
        Ok(())
    }

    fn release_device(&mut self, device: &DeviceId, events: &mut Vec<PairingEvent>) -> Option<RemoteId> {
        let client = self.by_device.remove(device)?;
        self.by_client.remove(&client);
        events.push(PairingEvent::Released {
            device: device.clone(),
            client,
        });
        Some(client)
    }

    fn release_client(&mut self, client: RemoteId, events: &mut Vec<PairingEvent>) -> Option<DeviceId> {
        let device = self.by_client.remove(&client)?;
        self.by_device.remove(&device);
        events.push(PairingEvent::Released {
            device: device.clone(),
            client,
        });
        Some(device)
    }
}

/// Bidirectional device/client pairing map.
#[derive(Debug, Default)]
pub struct ClientMappingDatabase {
    edges: RwLock<Edges>,
    /// Events not yet delivered, oldest first.
    outbox: Mutex<VecDeque<PairingEvent>>,
    delivering: AtomicBool,
    subscribers: Subscribers<PairingEvent>,
}

impl ClientMappingDatabase {
    /// Create an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Assign `client` to `device`, or clear the device with `None`.
    ///
    /// If the device has a different client, the call fails with
    /// [`PairingError::Conflict`] unless `replace` is set, in which case the
    /// old edge is released first. A client already feeding another device
    /// is moved, never duplicated. A client the server removed is refused
    /// with [`PairingError::ClientRemoved`].
    pub fn set_client(
        &self,
        device: &DeviceId,
        client: Option<RemoteId>,
        replace: bool,
    ) -> Result<(), PairingError> {
        let result = self.update(|edges, events| edges.assign(device, client, replace, events));
        self.deliver();
        result
    }

    /// Device fed by `client`, if any.
    pub fn try_get_device(&self, client: RemoteId) -> Option<DeviceId> {
        self.edges
            .read()
            .expect("Mapping lock poisoned")
            .by_client
            .get(&client)
            .cloned()
    }

    /// Client feeding `device`, if any.
    pub fn try_get_client(&self, device: &DeviceId) -> Option<RemoteId> {
        self.edges
            .read()
            .expect("Mapping lock poisoned")
            .by_device
            .get(device)
            .copied()
    }

    /// Drop the edge of a client. Returns the device it fed.
    ///
    /// The client may be paired again later; see [`Self::retire_client`]
    /// for clients that are gone for good.
    pub fn remove_client(&self, client: RemoteId) -> Option<DeviceId> {
        let device = self.update(|edges, events| edges.release_client(client, events));
        self.deliver();
        device
    }

    /// Drop the edge of a departed client and refuse it from now on.
    ///
    /// Events are queued, not delivered; the caller runs [`Self::deliver`]
    /// once its own locks are released.
    pub(crate) fn retire_client(&self, client: RemoteId) -> Option<DeviceId> {
        self.update(|edges, events| {
            edges.retired.insert(client);
            edges.release_client(client, events)
        })
    }

    /// Drop the edge of a device going away. Returns its former client.
    pub fn remove_device(&self, device: &DeviceId) -> Option<RemoteId> {
        let client = self.update(|edges, events| edges.release_device(device, events));
        self.deliver();
        client
    }

    /// Snapshot of every edge, sorted by device.
    pub fn pairings(&self) -> Vec<(DeviceId, RemoteId)> {
        let edges = self.edges.read().expect("Mapping lock poisoned");
        let mut pairs: Vec<(DeviceId, RemoteId)> = edges
            .by_device
            .iter()
            .map(|(device, client)| (device.clone(), *client))
            .collect();
        pairs.sort_by(|a, b| a.0.cmp(&b.0));
        pairs
    }

    /// Number of edges.
    pub fn len(&self) -> usize {
        self.edges.read().expect("Mapping lock poisoned").by_device.len()
    }

    /// Returns true if nothing is paired.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Observe edge changes.
    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&PairingEvent) + Send + Sync + 'static,
    {
        self.subscribers.subscribe(callback)
    }

    /// Stop observing edge changes.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.subscribers.unsubscribe(id)
    }

    /// Apply a change under the write lock and queue its events before the
    /// lock is released, so queue order is edge order.
    fn update<R>(&self, change: impl FnOnce(&mut Edges, &mut Vec<PairingEvent>) -> R) -> R {
        let mut edges = self.edges.write().expect("Mapping lock poisoned");
        let mut events = Vec::new();
        let result = change(&mut edges, &mut events);
        if !events.is_empty() {
            self.outbox
                .lock()
                .expect("Mapping outbox mutex poisoned")
                .extend(events);
        }
        result
    }

    /// Deliver queued events to observers. Never called with the lock held.
    ///
    /// Only one caller delivers at a time. A caller that finds delivery in
    /// progress (another thread, or an observer changing the map from its
    /// callback) returns at once and its events follow the ones before them.
    pub(crate) fn deliver(&self) {
        loop {
            if self.delivering.swap(true, Ordering::Acquire) {
                return;
            }
            while let Some(event) = self.next_queued() {
                log::debug!("[Mapping] {:?}", event);
                self.subscribers.emit(&event);
            }
            self.delivering.store(false, Ordering::Release);

            // An event queued after the last pop but before the flag was
            // cleared has no one else to deliver it.
            if self.outbox.lock().expect("Mapping outbox mutex poisoned").is_empty() {
                return;
            }
        }
    }

    fn next_queued(&self) -> Option<PairingEvent> {
        self.outbox
            .lock()
            .expect("Mapping outbox mutex poisoned")
            .pop_front()
    }

    #[cfg(test)]
    fn assert_consistent(&self) {
        let edges = self.edges.read().unwrap();
        assert_eq!(edges.by_device.len(), edges.by_client.len());
        for (device, client) in &edges.by_device {
            assert_eq!(edges.by_client.get(client), Some(device));
        }
    }
}
