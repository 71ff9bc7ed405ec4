//! Face capture client ("ARKit Face Capture").

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use super::{Client, CompanionClient, TypedClient};
use crate::event::SubscriptionId;
use crate::face::FaceSample;
use crate::protocol::{channels, ChannelReceiver, ProtocolError};

/// Host-side face capture client.
///
/// Samples arrive on an unreliable channel: each is a complete pose, so a
/// lost or late one is simply missed.
pub struct FaceClient {
    client: Client,
    samples: ChannelReceiver<FaceSample>,
}

impl FaceClient {
    /// Subscribe to incoming face pose samples.
    pub fn on_face_pose_sample<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&FaceSample) + Send + Sync + 'static,
    {
        self.samples.add_handler(handler)
    }

    /// Unsubscribe a face pose handler.
    pub fn remove_face_pose_handler(&self, id: SubscriptionId) -> bool {
        self.samples.remove_handler(id)
    }
}

impl TypedClient for FaceClient {
    const CLIENT_TYPE: &'static str = "ARKit Face Capture";

    fn from_client(client: Client) -> Result<Self, ProtocolError> {
        let samples = client
            .protocol()
            .add_receiver::<FaceSample>(&channels::FACE_POSE_SAMPLE)?;
        Ok(Self { client, samples })
    }
}

impl CompanionClient for FaceClient {
    fn client(&self) -> &Client {
        &self.client
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

impl fmt::Debug for FaceClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FaceClient")
            .field("client", &self.client)
            .field("handlers", &self.samples.handler_count())
            .finish()
    }
}

impl fmt::Display for FaceClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(Self::CLIENT_TYPE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::test_support::identified;
    use crate::face::FaceBlendShape;
    use crate::protocol::codec::WireMessage;
    use std::sync::Mutex;

    fn sample(timestamp: f64) -> FaceSample {
        let mut sample = FaceSample {
            timestamp,
            ..FaceSample::default()
        };
        sample.blend_shapes[FaceBlendShape::JawOpen] = timestamp as f32;
        sample
    }

    #[test]
    fn test_samples_delivered_as_they_arrive() {
        let (client, _rx) = identified(FaceClient::CLIENT_TYPE, "PhoneA");
        let face = FaceClient::from_client(client).unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_ref = Arc::clone(&seen);
        face.on_face_pose_sample(move |s| seen_ref.lock().unwrap().push(s.timestamp));

        let protocol = face.client().protocol();
        for t in [2.0, 1.0, 3.0] {
            protocol
                .dispatch("face.pose_sample", &sample(t).encode())
                .unwrap();
        }

        // No reordering on an unreliable channel.
        assert_eq!(*seen.lock().unwrap(), vec![2.0, 1.0, 3.0]);
    }

    #[test]
    fn test_loss_duplicates_and_garbage_tolerated() {
        let (client, _rx) = identified(FaceClient::CLIENT_TYPE, "PhoneA");
        let face = FaceClient::from_client(client).unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_ref = Arc::clone(&seen);
        face.on_face_pose_sample(move |s| seen_ref.lock().unwrap().push(s.timestamp));

        let errors = Arc::new(Mutex::new(0));
        let errors_ref = Arc::clone(&errors);
        let protocol = face.client().protocol();
        protocol.on_error(move |_| *errors_ref.lock().unwrap() += 1);

        // Frame 2 lost, frame 4 duplicated and late, one truncated frame.
        let truncated = sample(9.0).encode()[..100].to_vec();
        let frames = vec![
            sample(1.0).encode(),
            sample(3.0).encode(),
            sample(4.0).encode(),
            truncated,
            sample(5.0).encode(),
            sample(4.0).encode(),
        ];
        let results: Vec<bool> = frames
            .iter()
            .map(|f| protocol.dispatch("face.pose_sample", f).is_ok())
            .collect();

        assert_eq!(results, vec![true, true, true, false, true, true]);
        assert_eq!(*seen.lock().unwrap(), vec![1.0, 3.0, 4.0, 5.0, 4.0]);
        assert_eq!(*errors.lock().unwrap(), 1);
        assert!(!protocol.is_closed());
    }

    #[test]
    fn test_remove_handler_stops_delivery() {
        let (client, _rx) = identified(FaceClient::CLIENT_TYPE, "PhoneA");
        let face = FaceClient::from_client(client).unwrap();

        let count = Arc::new(Mutex::new(0));
        let count_ref = Arc::clone(&count);
        let id = face.on_face_pose_sample(move |_| *count_ref.lock().unwrap() += 1);

        let bytes = sample(1.0).encode();
        face.client().protocol().dispatch("face.pose_sample", &bytes).unwrap();
        assert!(face.remove_face_pose_handler(id));
        face.client().protocol().dispatch("face.pose_sample", &bytes).unwrap();

        assert_eq!(*count.lock().unwrap(), 1);
    }

    #[test]
    fn test_display_is_type_tag() {
        let (client, _rx) = identified(FaceClient::CLIENT_TYPE, "PhoneA");
        let face = FaceClient::from_client(client).unwrap();
        assert_eq!(face.to_string(), "ARKit Face Capture");
    }
}
