//! Virtual camera samples and host video stream state.

use std::fmt;

use bytes::{Buf, BufMut};

use crate::protocol::codec::{expect_len, get_f32s, put_f32s, DecodeError, WireMessage};

/// One frame of camera tracking data (48 bytes on the wire).
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct CameraPoseSample {
    /// Capture time on the app, in seconds.
    pub timestamp: f64,
    /// Camera position in meters.
    pub position: [f32; 3],
    /// Camera rotation quaternion (x, y, z, w).
    pub orientation: [f32; 4],
    /// Focal length in millimeters.
    pub focal_length: f32,
    /// Focus distance in meters.
    pub focus_distance: f32,
    /// Aperture in f-stops.
    pub aperture: f32,
}

impl CameraPoseSample {
    /// Encoded size in bytes.
    pub const WIRE_SIZE: usize = 8 + 3 * 4 + 4 * 4 + 3 * 4;
}

impl WireMessage for CameraPoseSample {
    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::WIRE_SIZE);
        buf.put_f64_le(self.timestamp);
        put_f32s(&mut buf, &self.position);
        put_f32s(&mut buf, &self.orientation);
        buf.put_f32_le(self.focal_length);
        buf.put_f32_le(self.focus_distance);
        buf.put_f32_le(self.aperture);
        buf
    }

    fn decode(mut bytes: &[u8]) -> Result<Self, DecodeError> {
        expect_len(bytes, Self::WIRE_SIZE)?;
        Ok(Self {
            timestamp: bytes.get_f64_le(),
            position: get_f32s(&mut bytes),
            orientation: get_f32s(&mut bytes),
            focal_length: bytes.get_f32_le(),
            focus_distance: bytes.get_f32_le(),
            aperture: bytes.get_f32_le(),
        })
    }
}

/// State of the host's video streaming server, as told to the app.
///
/// Packed as `[u8 is_running][i32 LE port]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct VideoStreamState {
    /// Is the video streaming server active.
    pub is_running: bool,
    /// The port the video streaming server listens on.
    pub port: i32,
}

impl VideoStreamState {
    /// Encoded size in bytes.
    pub const WIRE_SIZE: usize = 5;
}

impl fmt::Display for VideoStreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(IsRunning {}, Port {})", self.is_running, self.port)
    }
}

impl WireMessage for VideoStreamState {
    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::WIRE_SIZE);
        buf.put_u8(u8::from(self.is_running));
        buf.put_i32_le(self.port);
        buf
    }

    fn decode(mut bytes: &[u8]) -> Result<Self, DecodeError> {
        expect_len(bytes, Self::WIRE_SIZE)?;
        let is_running = match bytes.get_u8() {
            0 => false,
            1 => true,
            other => return Err(DecodeError::Invalid(format!("bool byte {other}"))),
        };
        Ok(Self {
            is_running,
            port: bytes.get_i32_le(),
        })
    }
}
