//! Host-side capture devices fed by companion-app clients.
//!
//! A [`CompanionAppDevice`] is the consumer end of a pairing: it asks the
//! [`ClientMappingDatabase`] for an edge to a client, subscribes to that
//! client's samples while the edge exists, keeps the latest sample and
//! re-emits every sample to its own observers.
//!
//! The device follows the map, not the other way round. On every pairing
//! event for its id it re-reads its edge and attaches or detaches to match,
//! whether the edge was changed through the device or straight on the map.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::client::names::{client_options, ClientOption};
use crate::client::{CompanionClient, FaceClient, TypedClient, VirtualCameraClient};
use crate::event::{SubscriptionId, Subscribers};
use crate::face::FaceSample;
use crate::mapping::{ClientMappingDatabase, DeviceId, PairingError, PairingEvent};
use crate::server::CompanionAppServer;
use crate::transport::RemoteId;
use crate::virtual_camera::CameraPoseSample;

/// A typed client that streams samples.
pub trait SampleSource: TypedClient {
    /// One streamed value.
    type Sample: Clone + Send + Sync + 'static;

    /// Subscribe to samples.
    fn subscribe_samples<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&Self::Sample) + Send + Sync + 'static;

    /// Unsubscribe.
    fn unsubscribe_samples(&self, id: SubscriptionId) -> bool;
}

impl SampleSource for FaceClient {
    type Sample = FaceSample;

    fn subscribe_samples<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&FaceSample) + Send + Sync + 'static,
    {
        self.on_face_pose_sample(handler)
    }

    fn unsubscribe_samples(&self, id: SubscriptionId) -> bool {
        self.remove_face_pose_handler(id)
    }
}

impl SampleSource for VirtualCameraClient {
    type Sample = CameraPoseSample;

    fn subscribe_samples<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&CameraPoseSample) + Send + Sync + 'static,
    {
        self.on_camera_pose_sample(handler)
    }

    fn unsubscribe_samples(&self, id: SubscriptionId) -> bool {
        self.remove_camera_pose_handler(id)
    }
}

struct Attached<C> {
    client: Arc<C>,
    subscription: SubscriptionId,
}

type Resolver<C> = Box<dyn Fn(RemoteId) -> Option<Arc<C>> + Send + Sync>;

/// A capture device consuming samples from at most one client.
pub struct CompanionAppDevice<C: SampleSource> {
    id: DeviceId,
    mapping: Arc<ClientMappingDatabase>,
    resolve: Resolver<C>,
    attached: Mutex<Option<Attached<C>>>,
    latest: Mutex<Option<C::Sample>>,
    samples: Subscribers<C::Sample>,
    sample_count: AtomicU64,
    pairing_subscription: SubscriptionId,
    this: Weak<Self>,
}

/// A face capture device.
pub type FaceDevice = CompanionAppDevice<FaceClient>;

/// A virtual camera device.
pub type VirtualCameraDevice = CompanionAppDevice<VirtualCameraClient>;

impl<C: SampleSource> CompanionAppDevice<C> {
    /// Create a device fed by `server`'s clients through its pairing map.
    pub fn new(id: impl Into<DeviceId>, server: &CompanionAppServer) -> Arc<Self> {
        Self::with_resolver(id, Arc::clone(server.mapping()), server.resolver::<C>())
    }

    /// Create a device on `mapping`, looking clients up with `resolve`.
    ///
    /// `resolve` turns the client id of a pairing edge into the client to
    /// subscribe to; edges to ids it does not know leave the device idle.
    pub fn with_resolver<R>(id: impl Into<DeviceId>, mapping: Arc<ClientMappingDatabase>, resolve: R) -> Arc<Self>
    where
        R: Fn(RemoteId) -> Option<Arc<C>> + Send + Sync + 'static,
    {
        let id = id.into();
        let device = Arc::new_cyclic(|this: &Weak<Self>| {
            let weak = Weak::clone(this);
            let pairing_subscription = mapping.subscribe(move |event| {
                if let Some(device) = weak.upgrade() {
                    device.on_pairing_event(event);
                }
            });
            Self {
                id,
                mapping,
                resolve: Box::new(resolve),
                attached: Mutex::new(None),
                latest: Mutex::new(None),
                samples: Subscribers::new(),
                sample_count: AtomicU64::new(0),
                pairing_subscription,
                this: Weak::clone(this),
            }
        });
        // Pick up an edge made before the device existed.
        device.follow_mapping(None);
        device
    }

    /// Device identifier.
    pub fn id(&self) -> &DeviceId {
        &self.id
    }

    /// Assign a client (or clear with `None`).
    ///
    /// Fails with [`PairingError::Conflict`] if another client feeds this
    /// device and `replace` is false, and with
    /// [`PairingError::ClientRemoved`] for a client that already left.
    /// Nothing changes in either case.
    pub fn set_client(&self, client: Option<Arc<C>>, replace: bool) -> Result<(), PairingError> {
        let remote = client.as_ref().map(|c| c.client().id());
        if let Some(client) = &client {
            if client.client().is_removed() {
                return Err(PairingError::ClientRemoved {
                    client: client.client().id(),
                });
            }
        }

        self.mapping.set_client(&self.id, remote, replace)?;
        self.follow_mapping(client.as_ref());
        Ok(())
    }

    /// The client currently feeding this device.
    pub fn client(&self) -> Option<Arc<C>> {
        self.attached
            .lock()
            .expect("Device attach mutex poisoned")
            .as_ref()
            .map(|a| Arc::clone(&a.client))
    }

    /// Returns true if a client feeds this device.
    pub fn is_assigned(&self) -> bool {
        self.client().is_some()
    }

    /// Observe every sample this device receives.
    pub fn on_sample<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&C::Sample) + Send + Sync + 'static,
    {
        self.samples.subscribe(handler)
    }

    /// Stop observing samples.
    pub fn remove_sample_handler(&self, id: SubscriptionId) -> bool {
        self.samples.unsubscribe(id)
    }

    /// The most recent sample, if any arrived.
    pub fn latest_sample(&self) -> Option<C::Sample> {
        self.latest.lock().expect("Device sample mutex poisoned").clone()
    }

    /// Samples received since creation.
    pub fn sample_count(&self) -> u64 {
        self.sample_count.load(Ordering::Relaxed)
    }

    /// Selection list for this device over the server's clients of type `C`.
    pub fn client_options(&self, server: &CompanionAppServer) -> Vec<ClientOption> {
        let clients = server.get_clients_of::<C>();
        let current = self.mapping.try_get_client(&self.id);
        client_options(clients.iter().map(|c| c.client()), current, &self.mapping)
    }

    /// Make the attached client match the map's edge for this device.
    ///
    /// `offered` is tried before the resolver. Runs under the attach lock,
    /// so concurrent calls settle on the map's latest state.
    fn follow_mapping(&self, offered: Option<&Arc<C>>) {
        let mut attached = self.attached.lock().expect("Device attach mutex poisoned");
        let wanted = self.mapping.try_get_client(&self.id);
        if wanted == attached.as_ref().map(|a| a.client.client().id()) {
            return;
        }

        if let Some(previous) = attached.take() {
            previous.client.unsubscribe_samples(previous.subscription);
            log::info!("[Device] {} released {}", self.id, previous.client.client());
        }

        let Some(wanted) = wanted else {
            return;
        };
        let next = offered
            .filter(|c| c.client().id() == wanted)
            .cloned()
            .or_else(|| (self.resolve)(wanted))
            .filter(|c| !c.client().is_removed());
        let Some(client) = next else {
            log::debug!("[Device] {} paired with unknown client {}", self.id, wanted);
            return;
        };

        let weak = Weak::clone(&self.this);
        let subscription = client.subscribe_samples(move |sample| {
            if let Some(device) = weak.upgrade() {
                device.ingest(sample);
            }
        });
        log::info!("[Device] {} now fed by {}", self.id, client.client());
        *attached = Some(Attached {
            client,
            subscription,
        });
    }

    fn detach(&self) {
        let previous = self
            .attached
            .lock()
            .expect("Device attach mutex poisoned")
            .take();
        if let Some(previous) = previous {
            previous.client.unsubscribe_samples(previous.subscription);
            log::info!("[Device] {} released {}", self.id, previous.client.client());
        }
    }

    fn on_pairing_event(&self, event: &PairingEvent) {
        if *event.device() == self.id {
            self.follow_mapping(None);
        }
    }

    fn ingest(&self, sample: &C::Sample) {
        *self.latest.lock().expect("Device sample mutex poisoned") = Some(sample.clone());
        self.sample_count.fetch_add(1, Ordering::Relaxed);
        self.samples.emit(sample);
    }
}

impl<C: SampleSource> Drop for CompanionAppDevice<C> {
    fn drop(&mut self) {
        self.mapping.unsubscribe(self.pairing_subscription);
        self.detach();
        // Clearing never conflicts.
        let _ = self.mapping.set_client(&self.id, None, true);
    }
}

impl<C: SampleSource> fmt::Debug for CompanionAppDevice<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompanionAppDevice")
            .field("id", &self.id)
            .field("client", &self.client().map(|c| c.client().id()))
            .field("samples", &self.sample_count())
            .finish_non_exhaustive()
    }
}
