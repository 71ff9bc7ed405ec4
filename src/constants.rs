//! Application-wide constants for companion-link.
//!
//! This module centralizes the timing and network defaults used across the
//! crate. Constants are grouped by domain; most of them can be overridden
//! through [`crate::config::Config`].
//!
//! # Categories
//!
//! - **Network**: Default bind address and port
//! - **Timeouts**: Handshake and liveness deadlines
//! - **Polling & Heartbeat**: Housekeeping intervals
//! - **Simulation**: Sample rates used by the app-side simulator

use std::time::Duration;

// ============================================================================
// Network
// ============================================================================

/// Default address the server binds to.
///
/// Companion apps run on phones on the same LAN, so the server listens on
/// every interface by default.
pub const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0";

/// Default UDP port for the companion-app server.
pub const DEFAULT_PORT: u16 = 9000;

// ============================================================================
// Timeouts
// ============================================================================

/// How long a freshly connected peer has to send its handshake.
///
/// A peer that never identifies itself is dropped once this expires and
/// never becomes visible to host code.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Disconnect a peer after this long without receiving anything from it.
///
/// Ten heartbeat intervals: a few lost heartbeats on a busy Wi-Fi network
/// must not drop the connection.
pub const DEFAULT_LIVENESS_TIMEOUT: Duration = Duration::from_secs(10);

// ============================================================================
// Polling & Heartbeat
// ============================================================================

/// Send a heartbeat after this long without sending anything else.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);

/// Endpoint housekeeping period.
///
/// Drives retransmissions, ack heartbeats and liveness checks. Must be well
/// below the base retransmit timeout (200ms) to keep backoff accurate.
pub const TRANSPORT_TICK: Duration = Duration::from_millis(20);

/// Server housekeeping period (handshake deadlines).
pub const SERVER_TICK: Duration = Duration::from_millis(100);

/// How often `serve` logs per-device sample rates.
pub const STATS_LOG_INTERVAL: Duration = Duration::from_secs(5);

// ============================================================================
// Simulation
// ============================================================================

/// Face samples per second sent by `simulate face`.
///
/// Matches the ARKit face tracking rate.
pub const SIMULATED_FACE_RATE_HZ: u32 = 60;

/// Camera pose samples per second sent by `simulate camera`.
pub const SIMULATED_CAMERA_RATE_HZ: u32 = 60;
