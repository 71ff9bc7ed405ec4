//! Payload codecs for channel messages.
//!
//! High-rate samples use fixed little-endian layouts so their size is known
//! up front and a wrong-length payload is rejected before any field is read.
//! Control messages are JSON via the [`Json`] wrapper.

use std::fmt;

use bytes::{Buf, BufMut};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// A type that can travel as a channel payload.
pub trait WireMessage: Sized + Send + Sync + 'static {
    /// Serialize to payload bytes.
    fn encode(&self) -> Vec<u8>;

    /// Parse payload bytes.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError`] if the payload is not a valid encoding.
    fn decode(bytes: &[u8]) -> Result<Self, DecodeError>;
}

/// Why a payload could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Fixed-size layout with the wrong number of bytes.
    WrongLength {
        /// Bytes the layout needs.
        expected: usize,
        /// Bytes received.
        actual: usize,
    },
    /// Structurally invalid content.
    Invalid(String),
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WrongLength { expected, actual } => {
                write!(f, "Expected {expected} bytes, got {actual}")
            }
            Self::Invalid(msg) => write!(f, "Invalid payload: {msg}"),
        }
    }
}

impl std::error::Error for DecodeError {}

/// Reject a payload whose length differs from a fixed layout.
pub fn expect_len(bytes: &[u8], expected: usize) -> Result<(), DecodeError> {
    if bytes.len() == expected {
        Ok(())
    } else {
        Err(DecodeError::WrongLength {
            expected,
            actual: bytes.len(),
        })
    }
}

/// Write `N` little-endian floats.
pub fn put_f32s<const N: usize>(buf: &mut Vec<u8>, values: &[f32; N]) {
    for value in values {
        buf.put_f32_le(*value);
    }
}

/// Read `N` little-endian floats. The caller has checked the length.
pub fn get_f32s<const N: usize>(buf: &mut &[u8]) -> [f32; N] {
    let mut values = [0.0; N];
    for value in &mut values {
        *value = buf.get_f32_le();
    }
    values
}

/// JSON payload wrapper for control messages.
///
/// ```
/// use companion_link::protocol::codec::{Json, WireMessage};
///
/// let bytes = Json(vec![1, 2, 3]).encode();
/// assert_eq!(bytes, b"[1,2,3]");
/// assert_eq!(Json::<Vec<u8>>::decode(&bytes).unwrap().0, vec![1, 2, 3]);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Json<T>(pub T);

impl<T> WireMessage for Json<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn encode(&self) -> Vec<u8> {
        // Only non-string map keys can fail here; the receiver reports the
        // empty payload as malformed.
        serde_json::to_vec(&self.0).unwrap_or_else(|e| {
            log::error!("[Protocol] Failed to serialize JSON payload: {e}");
            Vec::new()
        })
    }

    fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        serde_json::from_slice(bytes)
            .map(Json)
            .map_err(|e| DecodeError::Invalid(e.to_string()))
    }
}

/// Opaque bytes, passed through unchanged.
impl WireMessage for Vec<u8> {
    fn encode(&self) -> Vec<u8> {
        self.clone()
    }

    fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        Ok(bytes.to_vec())
    }
}
