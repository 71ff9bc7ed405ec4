//! Control messages shared by both sides.

use serde::{Deserialize, Serialize};

use super::codec::Json;

/// Current protocol version. Peers with a different major version are
/// refused at handshake.
pub const PROTOCOL_VERSION: u16 = 1;

/// Capability flags advertised in [`ClientInitialization::capabilities`].
pub mod capability {
    /// Streams face pose samples.
    pub const FACE_TRACKING: u32 = 1 << 0;
    /// Streams camera pose samples.
    pub const CAMERA_TRACKING: u32 = 1 << 1;
    /// Can display the host video stream.
    pub const VIDEO_STREAM: u32 = 1 << 2;
}

/// Handshake payload, sent once by the app immediately after connecting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientInitialization {
    /// Type tag selecting the typed client on the host, e.g. "ARKit Face Capture".
    pub client_type: String,
    /// Display name, e.g. the phone's name.
    pub name: String,
    /// Bitwise OR of [`capability`] flags.
    #[serde(default)]
    pub capabilities: u32,
    /// Protocol version the app speaks.
    #[serde(default = "default_protocol_version")]
    pub protocol_version: u16,
}

fn default_protocol_version() -> u16 {
    PROTOCOL_VERSION
}

impl ClientInitialization {
    /// Handshake for the current protocol version.
    pub fn new(client_type: impl Into<String>, name: impl Into<String>, capabilities: u32) -> Self {
        Self {
            client_type: client_type.into(),
            name: name.into(),
            capabilities,
            protocol_version: PROTOCOL_VERSION,
        }
    }

    /// Returns true if every bit of `flags` is advertised.
    pub fn has_capability(&self, flags: u32) -> bool {
        self.capabilities & flags == flags
    }
}

/// Which host device the app currently feeds, if any.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DeviceAssignment {
    /// Device name, or `None` when unassigned.
    pub device: Option<String>,
}

/// Wire form of [`ClientInitialization`].
pub type InitMessage = Json<ClientInitialization>;

/// Wire form of [`DeviceAssignment`].
pub type AssignmentMessage = Json<DeviceAssignment>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::codec::WireMessage;

    #[test]
    fn test_init_defaults_for_older_apps() {
        let json = br#"{"client_type":"ARKit Face Capture","name":"PhoneA"}"#;
        let init = InitMessage::decode(json).unwrap().0;
        assert_eq!(init.name, "PhoneA");
        assert_eq!(init.capabilities, 0);
        assert_eq!(init.protocol_version, PROTOCOL_VERSION);
    }

    #[test]
    fn test_has_capability() {
        let init = ClientInitialization::new(
            "Virtual Camera",
            "iPad",
            capability::CAMERA_TRACKING | capability::VIDEO_STREAM,
        );
        assert!(init.has_capability(capability::VIDEO_STREAM));
        assert!(!init.has_capability(capability::FACE_TRACKING));
    }

    #[test]
    fn test_assignment_wire_form() {
        let bytes = Json(DeviceAssignment {
            device: Some("Actor1".to_string()),
        })
        .encode();
        assert_eq!(bytes, br#"{"device":"Actor1"}"#);
        assert_eq!(
            AssignmentMessage::decode(br#"{"device":null}"#).unwrap().0,
            DeviceAssignment::default()
        );
    }
}
