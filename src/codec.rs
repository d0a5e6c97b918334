//! Opaque payloads for call arguments, results and object memory.
//!
//! The host never looks inside a [`Payload`]. Callers and hosted objects agree
//! on an encoding through a [`PayloadCodec`]; [`JsonCodec`] is the one shipped
//! with the crate and the one the builtin objects speak.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Opaque byte payload. Cheap to clone.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Payload(Bytes);

impl Payload {
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    pub fn empty() -> Self {
        Self(Bytes::new())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.0.to_vec()
    }
}

impl From<Vec<u8>> for Payload {
    fn from(v: Vec<u8>) -> Self {
        Self(Bytes::from(v))
    }
}

impl From<&'static [u8]> for Payload {
    fn from(v: &'static [u8]) -> Self {
        Self(Bytes::from_static(v))
    }
}

impl From<&'static str> for Payload {
    fn from(v: &'static str) -> Self {
        Self(Bytes::from_static(v.as_bytes()))
    }
}

impl From<String> for Payload {
    fn from(v: String) -> Self {
        Self(Bytes::from(v))
    }
}

impl From<Bytes> for Payload {
    fn from(v: Bytes) -> Self {
        Self(v)
    }
}

impl From<Payload> for Bytes {
    fn from(p: Payload) -> Self {
        p.0
    }
}

impl AsRef<[u8]> for Payload {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Error raised by a codec when a value cannot be encoded or decoded.
#[derive(Debug, thiserror::Error)]
#[error("{codec} codec: {message}")]
pub struct CodecError {
    pub codec: &'static str,
    pub message: String,
}

/// Pluggable serializer for payloads.
pub trait PayloadCodec: Send + Sync + 'static {
    /// Short name, reported in errors.
    fn name(&self) -> &'static str;

    fn encode<T: Serialize>(&self, value: &T) -> Result<Payload, CodecError>;

    fn decode<T: DeserializeOwned>(&self, payload: &Payload) -> Result<T, CodecError>;
}

/// JSON payloads via `serde_json`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl PayloadCodec for JsonCodec {
    fn name(&self) -> &'static str {
        "json"
    }

    fn encode<T: Serialize>(&self, value: &T) -> Result<Payload, CodecError> {
        serde_json::to_vec(value).map(Payload::from).map_err(|e| CodecError {
            codec: self.name(),
            message: e.to_string(),
        })
    }

    fn decode<T: DeserializeOwned>(&self, payload: &Payload) -> Result<T, CodecError> {
        serde_json::from_slice(payload.as_bytes()).map_err(|e| CodecError {
            codec: self.name(),
            message: e.to_string(),
        })
    }
}
