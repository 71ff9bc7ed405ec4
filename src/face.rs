//! Face capture samples.
//!
//! A [`FaceSample`] is one complete frame of ARKit face tracking: head pose,
//! eye orientations and the 52 blend shape weights. Samples are streamed on
//! an unreliable channel, so each one is self-contained.
//!
//! # Wire layout (276 bytes, little-endian)
//!
//! ```text
//! offset  size  field
//!      0     8  timestamp (f64, seconds)
//!      8    12  head_position (3 × f32)
//!     20    16  head_orientation (4 × f32, quaternion x y z w)
//!     36    16  left_eye_orientation
//!     52    16  right_eye_orientation
//!     68   208  blend_shapes (52 × f32, in FaceBlendShape order)
//! ```

use std::fmt;
use std::ops::{Index, IndexMut};
use std::str::FromStr;

use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};

use crate::protocol::codec::{expect_len, get_f32s, put_f32s, DecodeError, WireMessage};

/// Number of supported blend shapes.
pub const SHAPE_COUNT: usize = 52;

macro_rules! blend_shapes {
    ($($name:ident),+ $(,)?) => {
        /// The ARKit face blend shapes, in wire order.
        #[allow(missing_docs)]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[repr(u8)]
        pub enum FaceBlendShape {
            $($name),+
        }

        impl FaceBlendShape {
            /// Every shape, in wire order.
            pub const ALL: [FaceBlendShape; SHAPE_COUNT] = [$(FaceBlendShape::$name),+];

            /// The shape's name, e.g. `"EyeBlinkLeft"`.
            pub fn name(self) -> &'static str {
                match self {
                    $(FaceBlendShape::$name => stringify!($name)),+
                }
            }
        }
    };
}

blend_shapes! {
    BrowDownLeft,
    BrowDownRight,
    BrowInnerUp,
    BrowOuterUpLeft,
    BrowOuterUpRight,
    CheekPuff,
    CheekSquintLeft,
    CheekSquintRight,
    EyeBlinkLeft,
    EyeBlinkRight,
    EyeLookDownLeft,
    EyeLookDownRight,
    EyeLookInLeft,
    EyeLookInRight,
    EyeLookOutLeft,
    EyeLookOutRight,
    EyeLookUpLeft,
    EyeLookUpRight,
    EyeSquintLeft,
    EyeSquintRight,
    EyeWideLeft,
    EyeWideRight,
    JawForward,
    JawLeft,
    JawOpen,
    JawRight,
    MouthClose,
    MouthDimpleLeft,
    MouthDimpleRight,
    MouthFrownLeft,
    MouthFrownRight,
    MouthFunnel,
    MouthLeft,
    MouthLowerDownLeft,
    MouthLowerDownRight,
    MouthPressLeft,
    MouthPressRight,
    MouthPucker,
    MouthRight,
    MouthRollLower,
    MouthRollUpper,
    MouthShrugLower,
    MouthShrugUpper,
    MouthSmileLeft,
    MouthSmileRight,
    MouthStretchLeft,
    MouthStretchRight,
    MouthUpperUpLeft,
    MouthUpperUpRight,
    NoseSneerLeft,
    NoseSneerRight,
    TongueOut,
}

impl FaceBlendShape {
    /// Position in [`FaceBlendShape::ALL`] and on the wire.
    pub fn index(self) -> usize {
        self as usize
    }

    /// Look a shape up by name.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|shape| shape.name() == name)
    }

    /// The same shape on the other side of the face.
    ///
    /// ARKit names sides from the subject's point of view; shapes without a
    /// side map to themselves.
    pub fn mirrored(self) -> Self {
        let name = self.name();
        let swapped = if name.contains("Left") {
            name.replace("Left", "Right")
        } else if name.contains("Right") {
            name.replace("Right", "Left")
        } else {
            return self;
        };
        Self::from_name(&swapped).unwrap_or(self)
    }
}

impl fmt::Display for FaceBlendShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for FaceBlendShape {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_name(s).ok_or_else(|| format!("Unknown blend shape: {s}"))
    }
}

/// Weights for every blend shape, each nominally in `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FaceBlendShapePose {
    values: [f32; SHAPE_COUNT],
}

impl Default for FaceBlendShapePose {
    fn default() -> Self {
        Self {
            values: [0.0; SHAPE_COUNT],
        }
    }
}

impl FaceBlendShapePose {
    /// Weight at a wire index, or `None` if out of range.
    pub fn get(&self, index: usize) -> Option<f32> {
        self.values.get(index).copied()
    }

    /// Set the weight at a wire index. Returns `false` if out of range.
    pub fn set(&mut self, index: usize, value: f32) -> bool {
        match self.values.get_mut(index) {
            Some(slot) => {
                *slot = value;
                true
            }
            None => false,
        }
    }

    /// All weights in wire order.
    pub fn as_array(&self) -> &[f32; SHAPE_COUNT] {
        &self.values
    }

    /// `(shape, weight)` pairs in wire order.
    pub fn iter(&self) -> impl Iterator<Item = (FaceBlendShape, f32)> + '_ {
        FaceBlendShape::ALL.iter().copied().zip(self.values.iter().copied())
    }

    /// Mirror the pose by swapping every Left shape with its Right twin.
    pub fn flip_horizontally(&mut self) {
        for shape in FaceBlendShape::ALL {
            let twin = shape.mirrored();
            // Swap each pair once.
            if twin.index() > shape.index() {
                self.values.swap(shape.index(), twin.index());
            }
        }
    }
}

impl From<[f32; SHAPE_COUNT]> for FaceBlendShapePose {
    fn from(values: [f32; SHAPE_COUNT]) -> Self {
        Self { values }
    }
}

impl Index<FaceBlendShape> for FaceBlendShapePose {
    type Output = f32;

    fn index(&self, shape: FaceBlendShape) -> &f32 {
        &self.values[shape.index()]
    }
}

impl IndexMut<FaceBlendShape> for FaceBlendShapePose {
    fn index_mut(&mut self, shape: FaceBlendShape) -> &mut f32 {
        &mut self.values[shape.index()]
    }
}

/// One frame of face capture data.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct FaceSample {
    /// Capture time on the app, in seconds.
    pub timestamp: f64,
    /// Head position in meters.
    pub head_position: [f32; 3],
    /// Head rotation quaternion (x, y, z, w).
    pub head_orientation: [f32; 4],
    /// Left eye rotation quaternion.
    pub left_eye_orientation: [f32; 4],
    /// Right eye rotation quaternion.
    pub right_eye_orientation: [f32; 4],
    /// Blend shape weights.
    pub blend_shapes: FaceBlendShapePose,
}

impl FaceSample {
    /// Encoded size in bytes.
    pub const WIRE_SIZE: usize = 8 + 3 * 4 + 3 * 4 * 4 + SHAPE_COUNT * 4;
}

impl WireMessage for FaceSample {
    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::WIRE_SIZE);
        buf.put_f64_le(self.timestamp);
        put_f32s(&mut buf, &self.head_position);
        put_f32s(&mut buf, &self.head_orientation);
        put_f32s(&mut buf, &self.left_eye_orientation);
        put_f32s(&mut buf, &self.right_eye_orientation);
        put_f32s(&mut buf, self.blend_shapes.as_array());
        buf
    }

    fn decode(mut bytes: &[u8]) -> Result<Self, DecodeError> {
        expect_len(bytes, Self::WIRE_SIZE)?;
        Ok(Self {
            timestamp: bytes.get_f64_le(),
            head_position: get_f32s(&mut bytes),
            head_orientation: get_f32s(&mut bytes),
            left_eye_orientation: get_f32s(&mut bytes),
            right_eye_orientation: get_f32s(&mut bytes),
            blend_shapes: FaceBlendShapePose::from(get_f32s::<SHAPE_COUNT>(&mut bytes)),
        })
    }
}
