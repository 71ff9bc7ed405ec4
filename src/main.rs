//! Companion Link CLI - serve companion apps, or pretend to be one.
//!
//! This is the main binary entry point. See the `companion_link` library
//! for the core functionality.

use anyhow::{Context, Result};
use companion_link::client::downcast;
use companion_link::config::DeviceConfig;
use companion_link::constants::{
    SIMULATED_CAMERA_RATE_HZ, SIMULATED_FACE_RATE_HZ, STATS_LOG_INTERVAL,
};
use companion_link::face::{FaceBlendShape, FaceSample};
use companion_link::protocol::channels;
use companion_link::protocol::messages::{capability, ClientInitialization};
use companion_link::virtual_camera::{CameraPoseSample, VideoStreamState};
use companion_link::{
    ClientMappingDatabase, ClientTypeRegistry, CompanionAppConnection, CompanionAppDevice,
    CompanionAppServer, CompanionClient, Config, FaceClient, FaceDevice, SampleSource,
    ServerEvent, TypedClient, VirtualCameraClient, VirtualCameraDevice,
};
use mimalloc::MiMalloc;

/// Global allocator configured per M-MIMALLOC-APPS guideline.
/// mimalloc provides better multi-threaded performance than the system allocator.
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;
use clap::{Parser, Subcommand, ValueEnum};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Global flag for signal-triggered shutdown (as Arc for signal-hook compatibility)
static SHUTDOWN_FLAG: std::sync::LazyLock<Arc<AtomicBool>> =
    std::sync::LazyLock::new(|| Arc::new(AtomicBool::new(false)));

/// How often the async loops look at the shutdown flag.
const SHUTDOWN_POLL: Duration = Duration::from_millis(100);

fn register_signals() -> Result<()> {
    use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGTERM};
    use signal_hook::flag;
    flag::register(SIGINT, Arc::clone(&SHUTDOWN_FLAG))?;
    flag::register(SIGTERM, Arc::clone(&SHUTDOWN_FLAG))?;
    flag::register(SIGHUP, Arc::clone(&SHUTDOWN_FLAG))?;
    Ok(())
}

fn shutting_down() -> bool {
    SHUTDOWN_FLAG.load(Ordering::Relaxed)
}

/// Host devices built from the config file.
struct Devices {
    face: Vec<(DeviceConfig, Arc<FaceDevice>)>,
    camera: Vec<(DeviceConfig, Arc<VirtualCameraDevice>)>,
}

impl Devices {
    fn from_config(config: &Config, server: &CompanionAppServer) -> Self {
        let mut devices = Self {
            face: Vec::new(),
            camera: Vec::new(),
        };
        for device in &config.devices {
            let client_type = device.client_type.as_str();
            if client_type == FaceClient::CLIENT_TYPE {
                devices.face.push((
                    device.clone(),
                    FaceDevice::new(device.name.as_str(), server),
                ));
            } else if client_type == VirtualCameraClient::CLIENT_TYPE {
                devices.camera.push((
                    device.clone(),
                    VirtualCameraDevice::new(device.name.as_str(), server),
                ));
            } else {
                log::warn!(
                    "[Serve] Device {:?} has unsupported client type {:?}; skipped",
                    device.name,
                    client_type
                );
            }
        }
        devices
    }

    fn on_client_connected(&self, client: &Arc<dyn CompanionClient>, video_port: Option<u16>) {
        if let Some(face) = downcast::<FaceClient>(Arc::clone(client)) {
            auto_assign(&self.face, &face);
        } else if let Some(camera) = downcast::<VirtualCameraClient>(Arc::clone(client)) {
            auto_assign(&self.camera, &camera);
            if let Some(port) = video_port {
                let state = VideoStreamState {
                    is_running: true,
                    port: i32::from(port),
                };
                if let Err(e) = camera.send_video_stream_state(state) {
                    log::warn!("[Serve] Failed to send video stream state: {e}");
                }
            }
        }
    }

    fn log_rates(&self, previous: &mut Vec<u64>, elapsed: Duration) {
        let counts: Vec<(String, u64)> = self
            .face
            .iter()
            .map(|(_, d)| (d.id().to_string(), d.sample_count()))
            .chain(
                self.camera
                    .iter()
                    .map(|(_, d)| (d.id().to_string(), d.sample_count())),
            )
            .collect();
        previous.resize(counts.len(), 0);

        for ((name, count), last) in counts.into_iter().zip(previous.iter_mut()) {
            let rate = (count - *last) as f64 / elapsed.as_secs_f64().max(f64::EPSILON);
            if count != *last {
                log::info!("[Serve] {}: {:.1} samples/s", name, rate);
            }
            *last = count;
        }
    }
}

/// Pair `client` with the first device that wants it.
///
/// A device naming the client as preferred wins; otherwise the first
/// unassigned device without a preference takes it.
fn auto_assign<C: SampleSource>(devices: &[(DeviceConfig, Arc<CompanionAppDevice<C>>)], client: &Arc<C>) {
    let name = client.client().name();
    let preferred = devices
        .iter()
        .find(|(config, _)| config.preferred_client.as_deref() == Some(name));
    let fallback = || {
        devices
            .iter()
            .find(|(config, device)| config.preferred_client.is_none() && !device.is_assigned())
    };

    let Some((_, device)) = preferred.or_else(fallback) else {
        log::info!("[Serve] No free device for {}", client.client());
        return;
    };
    match device.set_client(Some(Arc::clone(client)), false) {
        Ok(()) => log::info!("[Serve] Assigned {} to {}", client.client(), device.id()),
        Err(e) => log::info!("[Serve] Not assigning {}: {}", client.client(), e),
    }
}

async fn run_serve(port: Option<u16>, video_port: Option<u16>) -> Result<()> {
    register_signals()?;

    let mut config = Config::load()?;
    if let Some(port) = port {
        config.port = port;
    }

    let mapping = Arc::new(ClientMappingDatabase::new());
    let server = CompanionAppServer::start(
        config.server_config()?,
        ClientTypeRegistry::with_defaults(),
        Arc::clone(&mapping),
    )
    .await?;
    let devices = Devices::from_config(&config, &server);
    let mut events = server.subscribe();

    println!("Listening on {} ({} devices)", server.local_addr(), config.devices.len());

    let mut poll = tokio::time::interval(SHUTDOWN_POLL);
    let mut stats = tokio::time::interval(STATS_LOG_INTERVAL);
    let mut previous = Vec::new();
    let mut last_stats = Instant::now();

    while !shutting_down() {
        tokio::select! {
            Some(event) = events.recv() => match event {
                ServerEvent::ClientConnected(client) => {
                    devices.on_client_connected(&client, video_port);
                }
                ServerEvent::ClientDisconnected { client, reason } => {
                    log::info!("[Serve] {} left ({})", client.client(), reason);
                }
            },
            _ = stats.tick() => {
                devices.log_rates(&mut previous, last_stats.elapsed());
                last_stats = Instant::now();
                for (_, device) in &devices.face {
                    log::debug!("[Serve] {} options: {:?}", device.id(), device.client_options(&server));
                }
            }
            _ = poll.tick() => {}
        }
    }

    println!("Shutting down...");
    server.stop().await;
    Ok(())
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum SimulatedApp {
    /// ARKit face capture.
    Face,
    /// Virtual camera.
    Camera,
}

async fn run_simulate(
    kind: SimulatedApp,
    server: SocketAddr,
    name: String,
    duration: Option<u64>,
) -> Result<()> {
    register_signals()?;

    let config = Config::load()?;
    let init = match kind {
        SimulatedApp::Face => {
            ClientInitialization::new(FaceClient::CLIENT_TYPE, name, capability::FACE_TRACKING)
        }
        SimulatedApp::Camera => ClientInitialization::new(
            VirtualCameraClient::CLIENT_TYPE,
            name,
            capability::CAMERA_TRACKING | capability::VIDEO_STREAM,
        ),
    };
    let connection = CompanionAppConnection::connect(server, init, config.transport_config())
        .await
        .context("Failed to connect")?;
    connection.on_assignment(|assignment| match &assignment.device {
        Some(device) => println!("Assigned to {device}"),
        None => println!("Not assigned"),
    });

    let rate = match kind {
        SimulatedApp::Face => SIMULATED_FACE_RATE_HZ,
        SimulatedApp::Camera => SIMULATED_CAMERA_RATE_HZ,
    };
    let face = connection.add_sender::<FaceSample>(&channels::FACE_POSE_SAMPLE)?;
    let camera = connection.add_sender::<CameraPoseSample>(&channels::VCAM_POSE_SAMPLE)?;
    if matches!(kind, SimulatedApp::Camera) {
        let stream = connection.add_receiver::<VideoStreamState>(&channels::VCAM_VIDEO_STREAM_STATE)?;
        stream.add_handler(|state| println!("Video stream {state}"));
    }

    let started = Instant::now();
    let deadline = duration.map(|secs| started + Duration::from_secs(secs));
    let mut frames = tokio::time::interval(Duration::from_secs(1) / rate.max(1));

    while !shutting_down() && connection.is_connected() {
        if deadline.is_some_and(|d| Instant::now() >= d) {
            break;
        }
        frames.tick().await;
        let t = started.elapsed().as_secs_f64();
        let sent = match kind {
            SimulatedApp::Face => face.send(&synthetic_face(t)),
            SimulatedApp::Camera => camera.send(&synthetic_camera(t)),
        };
        if let Err(e) = sent {
            log::warn!("[Simulate] Send failed: {e}");
            break;
        }
    }

    if connection.is_connected() {
        connection.close().await;
    } else {
        println!("Server closed the connection ({})", connection.closed().await);
    }
    Ok(())
}

fn synthetic_face(t: f64) -> FaceSample {
    let mut sample = FaceSample {
        timestamp: t,
        head_orientation: [0.0, (t * 0.5).sin() as f32 * 0.2, 0.0, 1.0],
        ..FaceSample::default()
    };
    let blink = ((t * 3.0).sin().max(0.0)) as f32;
    sample.blend_shapes[FaceBlendShape::EyeBlinkLeft] = blink;
    sample.blend_shapes[FaceBlendShape::EyeBlinkRight] = blink;
    sample.blend_shapes[FaceBlendShape::JawOpen] = ((t.sin() + 1.0) / 2.0) as f32;
    sample
}

fn synthetic_camera(t: f64) -> CameraPoseSample {
    CameraPoseSample {
        timestamp: t,
        position: [t.sin() as f32, 1.6, t.cos() as f32],
        orientation: [0.0, 0.0, 0.0, 1.0],
        focal_length: 35.0,
        focus_distance: 2.0,
        aperture: 2.8,
    }
}

fn print_channels() {
    for channel in channels::ALL {
        println!(
            "{:<26} {:<22} {:?}",
            channel.id, channel.reliability, channel.direction
        );
    }
}

// CLI
#[derive(Parser)]
#[command(name = "companion-link")]
#[command(version)]
#[command(about = "Host server for companion capture apps")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Accept companion apps and feed the configured devices
    Serve {
        /// UDP port (overrides the config file)
        #[arg(long)]
        port: Option<u16>,
        /// Advertise a running video stream on this port to camera apps
        #[arg(long)]
        video_port: Option<u16>,
    },
    /// Pretend to be a companion app and stream synthetic samples
    Simulate {
        /// Which app to simulate
        #[arg(value_enum)]
        kind: SimulatedApp,
        /// Server address
        #[arg(long, default_value = "127.0.0.1:9000")]
        server: SocketAddr,
        /// Client name shown on the host
        #[arg(long, default_value = "Simulator")]
        name: String,
        /// Stop after this many seconds
        #[arg(long)]
        duration: Option<u64>,
    },
    /// Print the effective configuration
    Config {
        /// Print the file path instead
        #[arg(long)]
        path: bool,
        /// Write the effective configuration to disk
        #[arg(long)]
        save: bool,
    },
    /// List the built-in channels
    Channels,
}

#[tokio::main]
async fn main() -> Result<()> {
    // COMPANION_LOG_FILE sends logs to a file, stderr otherwise.
    let mut logger =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    if let Ok(path) = std::env::var("COMPANION_LOG_FILE") {
        let log_file = std::fs::File::create(&path)
            .with_context(|| format!("Failed to create log file at {path:?}"))?;
        logger.target(env_logger::Target::Pipe(Box::new(log_file)));
    }
    logger.format_timestamp_secs().init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { port, video_port } => run_serve(port, video_port).await?,
        Commands::Simulate {
            kind,
            server,
            name,
            duration,
        } => run_simulate(kind, server, name, duration).await?,
        Commands::Config { path, save } => {
            if path {
                println!("{}", Config::config_path()?.display());
            } else {
                let config = Config::load()?;
                if save {
                    println!("Saved to {}", config.save()?.display());
                }
                println!("{}", serde_json::to_string_pretty(&config)?);
            }
        }
        Commands::Channels => print_channels(),
    }

    Ok(())
}
