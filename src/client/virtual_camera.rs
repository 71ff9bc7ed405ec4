//! Virtual camera client ("Virtual Camera").

use std::any::Any;
use std::fmt;
use std::sync::{Arc, Mutex};

use super::{Client, CompanionClient, TypedClient};
use crate::event::SubscriptionId;
use crate::protocol::{channels, ChannelReceiver, ChannelSender, ProtocolError};
use crate::virtual_camera::{CameraPoseSample, VideoStreamState};

/// Host-side virtual camera client.
///
/// Receives camera poses from the app and tells it where to find the host
/// video stream.
pub struct VirtualCameraClient {
    client: Client,
    poses: ChannelReceiver<CameraPoseSample>,
    video_stream_state: ChannelSender<VideoStreamState>,
    last_video_stream_state: Mutex<Option<VideoStreamState>>,
}

impl VirtualCameraClient {
    /// Subscribe to incoming camera pose samples.
    pub fn on_camera_pose_sample<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&CameraPoseSample) + Send + Sync + 'static,
    {
        self.poses.add_handler(handler)
    }

    /// Unsubscribe a camera pose handler.
    pub fn remove_camera_pose_handler(&self, id: SubscriptionId) -> bool {
        self.poses.remove_handler(id)
    }

    /// Send the video stream state. Unchanged states are not resent.
    pub fn send_video_stream_state(&self, state: VideoStreamState) -> Result<(), ProtocolError> {
        let mut last = self
            .last_video_stream_state
            .lock()
            .expect("Video stream state mutex poisoned");
        if *last == Some(state) {
            return Ok(());
        }
        self.video_stream_state.send(&state)?;
        *last = Some(state);
        Ok(())
    }
}

impl TypedClient for VirtualCameraClient {
    const CLIENT_TYPE: &'static str = "Virtual Camera";

    fn from_client(client: Client) -> Result<Self, ProtocolError> {
        let protocol = client.protocol();
        let poses = protocol.add_receiver::<CameraPoseSample>(&channels::VCAM_POSE_SAMPLE)?;
        let video_stream_state =
            protocol.add_sender::<VideoStreamState>(&channels::VCAM_VIDEO_STREAM_STATE)?;
        Ok(Self {
            client,
            poses,
            video_stream_state,
            last_video_stream_state: Mutex::new(None),
        })
    }
}

impl CompanionClient for VirtualCameraClient {
    fn client(&self) -> &Client {
        &self.client
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

impl fmt::Debug for VirtualCameraClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VirtualCameraClient")
            .field("client", &self.client)
            .field("handlers", &self.poses.handler_count())
            .finish_non_exhaustive()
    }
}

impl fmt::Display for VirtualCameraClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(Self::CLIENT_TYPE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::test_support::identified;
    use crate::protocol::codec::WireMessage;
    use crate::transport::{Command, Reliability};

    #[test]
    fn test_pose_samples_dispatched() {
        let (client, _rx) = identified(VirtualCameraClient::CLIENT_TYPE, "iPad");
        let camera = VirtualCameraClient::from_client(client).unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_ref = Arc::clone(&seen);
        camera.on_camera_pose_sample(move |s| seen_ref.lock().unwrap().push(s.focal_length));

        let pose = CameraPoseSample {
            focal_length: 50.0,
            ..CameraPoseSample::default()
        };
        camera
            .client()
            .protocol()
            .dispatch("vcam.pose_sample", &pose.encode())
            .unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![50.0]);
    }

    #[test]
    fn test_video_stream_state_sent_reliably_once() {
        let (client, mut rx) = identified(VirtualCameraClient::CLIENT_TYPE, "iPad");
        let camera = VirtualCameraClient::from_client(client).unwrap();
        let state = VideoStreamState {
            is_running: true,
            port: 9001,
        };

        camera.send_video_stream_state(state).unwrap();
        camera.send_video_stream_state(state).unwrap();

        match rx.try_recv().unwrap() {
            Command::Send {
                channel,
                payload,
                reliability,
                ..
            } => {
                assert_eq!(channel, "vcam.video_stream_state");
                assert_eq!(payload, state.encode());
                assert_eq!(reliability, Reliability::ReliableOrdered);
            }
            other => panic!("Expected Send, got {other:?}"),
        }
        assert!(rx.try_recv().is_err(), "unchanged state is not resent");
    }
}
