//! End-to-end scenarios over loopback UDP: a real server, real app-side
//! connections and a raw endpoint that never identifies itself.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use companion_link::client::CompanionClient;
use companion_link::protocol::channels;
use companion_link::protocol::messages::{capability, ClientInitialization};
use companion_link::transport::{Endpoint, TransportEvent};
use companion_link::virtual_camera::VideoStreamState;
use companion_link::{
    ClientMappingDatabase, ClientTypeRegistry, CompanionAppConnection, CompanionAppServer,
    DisconnectReason, FaceClient, FaceDevice, ServerConfig, ServerEvent, TransportConfig,
    TypedClient, VirtualCameraClient,
};
use companion_link::face::{FaceBlendShape, FaceSample};
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

fn loopback() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

async fn start_server(handshake_timeout: Duration) -> (CompanionAppServer, Arc<ClientMappingDatabase>) {
    let mapping = Arc::new(ClientMappingDatabase::new());
    let config = ServerConfig {
        bind_address: loopback(),
        handshake_timeout,
        transport: TransportConfig::default(),
    };
    let server = CompanionAppServer::start(config, ClientTypeRegistry::with_defaults(), Arc::clone(&mapping))
        .await
        .unwrap();
    (server, mapping)
}

async fn next_connected(events: &mut UnboundedReceiver<ServerEvent>) -> Arc<dyn CompanionClient> {
    loop {
        match timeout(WAIT, events.recv()).await.unwrap().unwrap() {
            ServerEvent::ClientConnected(client) => return client,
            ServerEvent::ClientDisconnected { .. } => {}
        }
    }
}

async fn next_disconnected(events: &mut UnboundedReceiver<ServerEvent>) -> (Arc<dyn CompanionClient>, DisconnectReason) {
    loop {
        match timeout(WAIT, events.recv()).await.unwrap().unwrap() {
            ServerEvent::ClientDisconnected { client, reason } => return (client, reason),
            ServerEvent::ClientConnected(_) => {}
        }
    }
}

async fn wait_for<F: Fn() -> bool>(condition: F) {
    timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
}

fn face_init(name: &str) -> ClientInitialization {
    ClientInitialization::new(FaceClient::CLIENT_TYPE, name, capability::FACE_TRACKING)
}

#[tokio::test]
async fn test_face_app_streams_to_assigned_device() {
    let (server, mapping) = start_server(Duration::from_secs(5)).await;
    let mut events = server.subscribe();

    let phone = CompanionAppConnection::connect(server.local_addr(), face_init("PhoneA"), TransportConfig::default())
        .await
        .unwrap();

    let connected = next_connected(&mut events).await;
    assert_eq!(connected.client().name(), "PhoneA");
    assert_eq!(connected.client().client_type(), "ARKit Face Capture");

    let faces = server.get_clients_of::<FaceClient>();
    assert_eq!(faces.len(), 1);
    let face = Arc::clone(&faces[0]);

    let device = FaceDevice::new("Actor1", &server);
    let (sample_tx, mut samples) = mpsc::unbounded_channel();
    device.on_sample(move |sample: &FaceSample| {
        let _ = sample_tx.send(sample.timestamp);
    });
    device.set_client(Some(Arc::clone(&face)), false).unwrap();

    assert_eq!(mapping.try_get_device(face.client().id()).unwrap().as_str(), "Actor1");
    wait_for(|| phone.assigned_device().as_deref() == Some("Actor1")).await;

    let sender = phone.add_sender::<FaceSample>(&channels::FACE_POSE_SAMPLE).unwrap();
    for timestamp in [2.0, 1.0, 3.0] {
        let mut sample = FaceSample {
            timestamp,
            ..FaceSample::default()
        };
        sample.blend_shapes[FaceBlendShape::JawOpen] = 0.5;
        sender.send(&sample).unwrap();
    }

    let mut seen = Vec::new();
    while seen.len() < 3 {
        seen.push(timeout(WAIT, samples.recv()).await.unwrap().unwrap());
    }
    // Unreliable samples are delivered in arrival order, never re-sorted.
    assert_eq!(seen, vec![2.0, 1.0, 3.0]);
    assert_eq!(device.latest_sample().unwrap().blend_shapes[FaceBlendShape::JawOpen], 0.5);

    phone.close().await;
    server.stop().await;
}

#[tokio::test]
async fn test_edge_set_on_mapping_feeds_device() {
    let (server, mapping) = start_server(Duration::from_secs(5)).await;
    let mut events = server.subscribe();

    let phone = CompanionAppConnection::connect(server.local_addr(), face_init("PhoneA"), TransportConfig::default())
        .await
        .unwrap();
    let connected = next_connected(&mut events).await;

    let device = FaceDevice::new("Actor1", &server);
    let (sample_tx, mut samples) = mpsc::unbounded_channel();
    device.on_sample(move |sample: &FaceSample| {
        let _ = sample_tx.send(sample.timestamp);
    });

    // Inspector-style assignment straight on the map.
    mapping
        .set_client(device.id(), Some(connected.client().id()), false)
        .unwrap();
    assert_eq!(device.client().unwrap().client().id(), connected.client().id());
    wait_for(|| phone.assigned_device().as_deref() == Some("Actor1")).await;

    let sender = phone.add_sender::<FaceSample>(&channels::FACE_POSE_SAMPLE).unwrap();
    sender
        .send(&FaceSample {
            timestamp: 7.0,
            ..FaceSample::default()
        })
        .unwrap();
    assert_eq!(timeout(WAIT, samples.recv()).await.unwrap(), Some(7.0));

    phone.close().await;
    server.stop().await;
}

#[tokio::test]
async fn test_clients_filtered_by_capability() {
    let (server, _mapping) = start_server(Duration::from_secs(5)).await;
    let mut events = server.subscribe();

    let face = CompanionAppConnection::connect(server.local_addr(), face_init("PhoneA"), TransportConfig::default())
        .await
        .unwrap();
    let camera_init = ClientInitialization::new(
        VirtualCameraClient::CLIENT_TYPE,
        "iPad",
        capability::CAMERA_TRACKING | capability::VIDEO_STREAM,
    );
    let camera = CompanionAppConnection::connect(server.local_addr(), camera_init, TransportConfig::default())
        .await
        .unwrap();
    next_connected(&mut events).await;
    next_connected(&mut events).await;

    let streaming = server.get_clients_with_capability(capability::VIDEO_STREAM);
    assert_eq!(streaming.len(), 1);
    assert_eq!(streaming[0].client().name(), "iPad");
    assert_eq!(server.get_clients_with_capability(capability::FACE_TRACKING).len(), 1);
    assert_eq!(server.get_clients_with_capability(0).len(), 2);

    face.close().await;
    camera.close().await;
    server.stop().await;
}

#[tokio::test]
async fn test_silent_remote_is_dropped_and_never_visible() {
    let (server, _mapping) = start_server(Duration::from_millis(200)).await;
    let mut events = server.subscribe();

    let (raw, mut raw_events) = Endpoint::bind(loopback(), TransportConfig::default(), false)
        .await
        .unwrap();
    let remote = raw.handle().connect(server.local_addr()).await.unwrap();

    wait_for(|| server.pending_count() == 1).await;
    assert!(server.get_clients().is_empty());

    let reason = timeout(WAIT, async {
        loop {
            match raw_events.recv().await {
                Some(TransportEvent::Disconnected { remote: gone, reason }) => {
                    assert_eq!(gone.id, remote.id);
                    return reason;
                }
                Some(_) => {}
                None => panic!("raw endpoint closed"),
            }
        }
    })
    .await
    .unwrap();

    assert_eq!(reason, DisconnectReason::RemoteClosed);
    wait_for(|| server.pending_count() == 0).await;
    assert!(server.get_clients().is_empty());
    assert!(events.try_recv().is_err(), "no server events for unidentified remotes");

    raw.shutdown().await;
    server.stop().await;
}

#[tokio::test]
async fn test_unsupported_client_type_disconnected() {
    let (server, _mapping) = start_server(Duration::from_secs(5)).await;

    let init = ClientInitialization::new("Toaster", "Kitchen", 0);
    let app = CompanionAppConnection::connect(server.local_addr(), init, TransportConfig::default())
        .await
        .unwrap();

    let reason = timeout(WAIT, app.closed()).await.unwrap();
    assert_eq!(reason, DisconnectReason::RemoteClosed);
    assert!(server.get_clients().is_empty());

    server.stop().await;
}

#[tokio::test]
async fn test_incompatible_protocol_version_disconnected() {
    let (server, _mapping) = start_server(Duration::from_secs(5)).await;

    let mut init = face_init("Old Phone");
    init.protocol_version = 99;
    let app = CompanionAppConnection::connect(server.local_addr(), init, TransportConfig::default())
        .await
        .unwrap();

    assert_eq!(timeout(WAIT, app.closed()).await.unwrap(), DisconnectReason::RemoteClosed);
    assert!(server.get_clients().is_empty());

    server.stop().await;
}

#[tokio::test]
async fn test_app_disconnect_releases_pairing() {
    let (server, mapping) = start_server(Duration::from_secs(5)).await;
    let mut events = server.subscribe();

    let phone = CompanionAppConnection::connect(server.local_addr(), face_init("PhoneA"), TransportConfig::default())
        .await
        .unwrap();
    let connected = next_connected(&mut events).await;
    let id = connected.client().id();

    let device = FaceDevice::new("Actor1", &server);
    let face = server.get_client_of::<FaceClient>(id).unwrap();
    device.set_client(Some(face), false).unwrap();
    assert!(device.is_assigned());

    phone.close().await;

    let (gone, reason) = next_disconnected(&mut events).await;
    assert_eq!(gone.client().id(), id);
    assert_eq!(reason, DisconnectReason::RemoteClosed);
    assert!(gone.client().is_removed());
    assert!(mapping.try_get_device(id).is_none());
    assert!(!device.is_assigned());
    assert!(server.get_client(id).is_none());

    // A departed client cannot be paired again.
    assert!(mapping.set_client(device.id(), Some(id), true).is_err());
    assert!(mapping.try_get_device(id).is_none());

    server.stop().await;
}

#[tokio::test]
async fn test_camera_receives_video_stream_state() {
    let (server, _mapping) = start_server(Duration::from_secs(5)).await;
    let mut events = server.subscribe();

    let init = ClientInitialization::new(
        VirtualCameraClient::CLIENT_TYPE,
        "iPad",
        capability::CAMERA_TRACKING | capability::VIDEO_STREAM,
    );
    let app = CompanionAppConnection::connect(server.local_addr(), init, TransportConfig::default())
        .await
        .unwrap();
    let (state_tx, mut states) = mpsc::unbounded_channel();
    app.add_receiver::<VideoStreamState>(&channels::VCAM_VIDEO_STREAM_STATE)
        .unwrap()
        .add_handler(move |state: &VideoStreamState| {
            let _ = state_tx.send(*state);
        });

    let connected = next_connected(&mut events).await;
    let camera = server
        .get_client_of::<VirtualCameraClient>(connected.client().id())
        .unwrap();
    let state = VideoStreamState {
        is_running: true,
        port: 9001,
    };
    camera.send_video_stream_state(state).unwrap();

    assert_eq!(timeout(WAIT, states.recv()).await.unwrap().unwrap(), state);

    app.close().await;
    server.stop().await;
}

#[tokio::test]
async fn test_stop_removes_every_client() {
    let (server, mapping) = start_server(Duration::from_secs(5)).await;
    let mut events = server.subscribe();

    let phone = CompanionAppConnection::connect(server.local_addr(), face_init("PhoneA"), TransportConfig::default())
        .await
        .unwrap();
    let connected = next_connected(&mut events).await;
    mapping
        .set_client(&"Actor1".into(), Some(connected.client().id()), false)
        .unwrap();

    server.stop().await;

    let (_, reason) = next_disconnected(&mut events).await;
    assert_eq!(reason, DisconnectReason::Shutdown);
    assert!(mapping.is_empty());
    assert_eq!(timeout(WAIT, phone.closed()).await.unwrap(), DisconnectReason::RemoteClosed);
}
