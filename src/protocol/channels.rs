//! Built-in channel table.
//!
//! Identifiers are part of the wire format; never rename one without
//! bumping [`super::messages::PROTOCOL_VERSION`].

use super::{ChannelDescriptor, Direction};
use crate::transport::Reliability::{ReliableOrdered, UnreliableUnordered};

/// Handshake, sent once by the app right after connecting.
pub const INIT: ChannelDescriptor =
    ChannelDescriptor::new("companion.init", ReliableOrdered, Direction::ToServer);

/// Device assignment pushed to the app whenever its pairing changes.
pub const ASSIGNMENT: ChannelDescriptor =
    ChannelDescriptor::new("companion.assignment", ReliableOrdered, Direction::ToClient);

/// Streamed face pose samples.
pub const FACE_POSE_SAMPLE: ChannelDescriptor =
    ChannelDescriptor::new("face.pose_sample", UnreliableUnordered, Direction::ToServer);

/// Streamed virtual camera pose samples.
pub const VCAM_POSE_SAMPLE: ChannelDescriptor =
    ChannelDescriptor::new("vcam.pose_sample", UnreliableUnordered, Direction::ToServer);

/// Host video stream state, sent to the virtual camera app.
pub const VCAM_VIDEO_STREAM_STATE: ChannelDescriptor = ChannelDescriptor::new(
    "vcam.video_stream_state",
    ReliableOrdered,
    Direction::ToClient,
);

/// Every built-in channel.
pub const ALL: &[ChannelDescriptor] = &[
    INIT,
    ASSIGNMENT,
    FACE_POSE_SAMPLE,
    VCAM_POSE_SAMPLE,
    VCAM_VIDEO_STREAM_STATE,
];

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::framing::MAX_CHANNEL_ID_LEN;
    use std::collections::HashSet;

    #[test]
    fn test_ids_unique_and_fit_wire() {
        let mut seen = HashSet::new();
        for channel in ALL {
            assert!(seen.insert(channel.id.as_ref()), "duplicate id {}", channel.id);
            assert!(channel.id.len() <= MAX_CHANNEL_ID_LEN);
        }
    }

    #[test]
    fn test_samples_unreliable_control_reliable() {
        assert_eq!(FACE_POSE_SAMPLE.reliability, UnreliableUnordered);
        assert_eq!(VCAM_POSE_SAMPLE.reliability, UnreliableUnordered);
        assert_eq!(INIT.reliability, ReliableOrdered);
        assert_eq!(ASSIGNMENT.reliability, ReliableOrdered);
        assert_eq!(VCAM_VIDEO_STREAM_STATE.reliability, ReliableOrdered);
    }
}
