//! Companion Link - host-side server for companion capture apps.
//!
//! Phones and tablets running a companion app stream face tracking and
//! camera poses to a host over the local network. This crate provides the
//! host side: the datagram transport, the per-connection channel registry,
//! the client registry with its handshake, and the pairing map that binds
//! host devices to clients.
//!
//! # Architecture
//!
//! ```text
//! app ──UDP──► transport::Endpoint ──events──► server::CompanionAppServer
//!                                                │
//!                          protocol::Protocol ◄──┤ (one per remote)
//!                                                │
//!                     client::{FaceClient, ..} ◄─┘ (typed, after handshake)
//!                                │
//!   mapping::ClientMappingDatabase ◄──► device::CompanionAppDevice
//! ```
//!
//! # Modules
//!
//! - [`transport`] - Remotes, reliable/unreliable datagram delivery
//! - [`protocol`] - Named channels, codecs, built-in messages
//! - [`server`] - Handshake and client registry
//! - [`client`] - Typed client wrappers and selection labels
//! - [`mapping`] - Device ↔ client pairing
//! - [`device`] - Host-side sample consumers
//! - [`companion`] - App-side connection (simulator, tests)
//! - [`config`] - Configuration loading/saving

// Library modules
pub mod client;
pub mod companion;
pub mod device;
pub mod mapping;
pub mod protocol;
pub mod server;
pub mod transport;

pub mod config;
pub mod constants;
pub mod event;
pub mod face;
pub mod virtual_camera;

// Re-export commonly used types
pub use client::{Client, ClientTypeRegistry, CompanionClient, FaceClient, TypedClient, VirtualCameraClient};
pub use companion::CompanionAppConnection;
pub use config::Config;
pub use device::{CompanionAppDevice, FaceDevice, SampleSource, VirtualCameraDevice};
pub use mapping::{ClientMappingDatabase, DeviceId, PairingError, PairingEvent};
pub use protocol::{ChannelDescriptor, Protocol, ProtocolError};
pub use server::{CompanionAppServer, ServerConfig, ServerEvent};
pub use transport::{DisconnectReason, Remote, RemoteId, TransportConfig};
