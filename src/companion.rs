//! App-side connection to a companion-app server.
//!
//! This is what a phone app does, minus the phone: bind a client endpoint,
//! reach the server, identify with a [`ClientInitialization`] and then
//! stream samples over whatever channels the client type defines. The
//! simulator and the integration tests drive the server through it.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::event::SubscriptionId;
use crate::protocol::codec::{Json, WireMessage};
use crate::protocol::messages::{AssignmentMessage, ClientInitialization, DeviceAssignment, InitMessage};
use crate::protocol::{
    channels, ChannelDescriptor, ChannelReceiver, ChannelSender, Protocol, ProtocolError, Side,
};
use crate::transport::{DisconnectReason, Endpoint, Remote, TransportConfig, TransportEvent};

/// A live connection from the app side.
#[derive(Debug)]
pub struct CompanionAppConnection {
    protocol: Arc<Protocol>,
    init: ClientInitialization,
    assignment: ChannelReceiver<AssignmentMessage>,
    assigned_device: Arc<Mutex<Option<String>>>,
    closed: watch::Receiver<Option<DisconnectReason>>,
    endpoint: Option<Endpoint>,
    task: Option<JoinHandle<()>>,
}

impl CompanionAppConnection {
    /// Connect to `server` and send the handshake.
    ///
    /// Returns once the handshake is queued; the server acknowledges it by
    /// pushing the client's assignment, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the local socket cannot be bound or the
    /// handshake cannot be sent.
    pub async fn connect(
        server: SocketAddr,
        init: ClientInitialization,
        config: TransportConfig,
    ) -> Result<Self> {
        let unspecified: IpAddr = if server.is_ipv4() {
            Ipv4Addr::UNSPECIFIED.into()
        } else {
            Ipv6Addr::UNSPECIFIED.into()
        };
        let (endpoint, events) = Endpoint::bind(SocketAddr::new(unspecified, 0), config, false)
            .await
            .context("Failed to bind app endpoint")?;

        let transport = endpoint.handle();
        let remote = transport
            .connect(server)
            .await
            .with_context(|| format!("Failed to reach server at {server}"))?;

        let protocol = Arc::new(Protocol::new(remote, transport, Side::Client));

        let assigned_device = Arc::new(Mutex::new(None));
        let assignment = protocol.add_receiver::<AssignmentMessage>(&channels::ASSIGNMENT)?;
        let slot = Arc::clone(&assigned_device);
        assignment.add_handler(move |message: &AssignmentMessage| {
            *slot.lock().expect("Assignment mutex poisoned") = message.0.device.clone();
        });

        let handshake = protocol.add_sender::<InitMessage>(&channels::INIT)?;
        handshake
            .send(&Json(init.clone()))
            .context("Failed to send handshake")?;

        log::info!(
            "[Companion] {} ({}) connecting to {}",
            init.name,
            init.client_type,
            server
        );

        let (closed_tx, closed) = watch::channel(None);
        let task = tokio::spawn(pump(Arc::clone(&protocol), events, closed_tx));

        Ok(Self {
            protocol,
            init,
            assignment,
            assigned_device,
            closed,
            endpoint: Some(endpoint),
            task: Some(task),
        })
    }

    /// The server, as seen from here.
    pub fn remote(&self) -> Remote {
        self.protocol.remote()
    }

    /// The handshake this connection identified with.
    pub fn init(&self) -> &ClientInitialization {
        &self.init
    }

    /// The app-side channel registry.
    pub fn protocol(&self) -> &Arc<Protocol> {
        &self.protocol
    }

    /// Register an outgoing channel.
    pub fn add_sender<M: WireMessage>(
        &self,
        descriptor: &ChannelDescriptor,
    ) -> Result<ChannelSender<M>, ProtocolError> {
        self.protocol.add_sender(descriptor)
    }

    /// Register an incoming channel.
    pub fn add_receiver<M: WireMessage>(
        &self,
        descriptor: &ChannelDescriptor,
    ) -> Result<ChannelReceiver<M>, ProtocolError> {
        self.protocol.add_receiver(descriptor)
    }

    /// Observe assignment changes pushed by the server.
    pub fn on_assignment<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&DeviceAssignment) + Send + Sync + 'static,
    {
        self.assignment
            .add_handler(move |message: &AssignmentMessage| handler(&message.0))
    }

    /// The device this app currently feeds, as last reported by the server.
    pub fn assigned_device(&self) -> Option<String> {
        self.assigned_device
            .lock()
            .expect("Assignment mutex poisoned")
            .clone()
    }

    /// Returns true until the transport reports the server gone.
    pub fn is_connected(&self) -> bool {
        self.closed.borrow().is_none()
    }

    /// Wait until the connection ends and return why.
    pub async fn closed(&self) -> DisconnectReason {
        let mut closed = self.closed.clone();
        loop {
            if let Some(reason) = *closed.borrow_and_update() {
                return reason;
            }
            if closed.changed().await.is_err() {
                return DisconnectReason::Shutdown;
            }
        }
    }

    /// Disconnect from the server and release the socket.
    pub async fn close(mut self) {
        let server = self.protocol.remote().id;
        if let Some(endpoint) = self.endpoint.take() {
            // Already gone is fine.
            let _ = endpoint.handle().disconnect(server);
            endpoint.shutdown().await;
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                log::warn!("[Companion] Event pump ended abnormally: {e}");
            }
        }
    }
}

async fn pump(
    protocol: Arc<Protocol>,
    mut events: UnboundedReceiver<TransportEvent>,
    closed: watch::Sender<Option<DisconnectReason>>,
) {
    while let Some(event) = events.recv().await {
        match event {
            TransportEvent::Message {
                channel, payload, ..
            } => {
                // Errors are logged and reported by the protocol itself.
                let _ = protocol.dispatch(&channel, &payload);
            }
            TransportEvent::Disconnected { remote, reason } => {
                log::info!("[Companion] Disconnected from {} ({})", remote, reason);
                protocol.clear();
                closed.send_replace(Some(reason));
            }
            TransportEvent::Connected(_) => {}
        }
    }
    if closed.borrow().is_none() {
        protocol.clear();
        closed.send_replace(Some(DisconnectReason::Shutdown));
    }
}
