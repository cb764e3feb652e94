use std::fmt;
use std::marker::PhantomData;

use bincode::Options;
use serde::de::DeserializeOwned;

use crate::MAX_MESSAGE_BYTES;

#[derive(Clone, Debug, thiserror::Error, PartialEq, Eq)]
#[error("invalid request payload: {message}")]
pub struct DecodeError {
    pub message: String,
}

impl DecodeError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Turns the opaque request bytes of a push/pull request into a handler's request type.
///
/// Decoding is total: malformed input is reported as a [`DecodeError`], never by panicking.
pub trait RequestPrototype<T>: Send + Sync {
    fn decode(&self, bytes: &[u8]) -> Result<T, DecodeError>;
}

impl<T, F> RequestPrototype<T> for F
where
    F: Fn(&[u8]) -> Result<T, DecodeError> + Send + Sync,
{
    fn decode(&self, bytes: &[u8]) -> Result<T, DecodeError> {
        self(bytes)
    }
}

/// Decodes request payloads encoded with bincode (the same options as the framing codec).
pub struct BincodePrototype<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> BincodePrototype<T> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for BincodePrototype<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for BincodePrototype<T> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for BincodePrototype<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BincodePrototype")
            .field("type", &std::any::type_name::<T>())
            .finish()
    }
}

impl<T: DeserializeOwned> RequestPrototype<T> for BincodePrototype<T> {
    fn decode(&self, bytes: &[u8]) -> Result<T, DecodeError> {
        bincode::DefaultOptions::new()
            .with_limit(MAX_MESSAGE_BYTES as u64)
            .reject_trailing_bytes()
            .deserialize(bytes)
            .map_err(|err| DecodeError::new(err.to_string()))
    }
}

impl<T: serde::Serialize> BincodePrototype<T> {
    /// Encode a request the way [`BincodePrototype::decode`] expects it.
    pub fn encode(request: &T) -> Result<Vec<u8>, DecodeError> {
        bincode::DefaultOptions::new()
            .with_limit(MAX_MESSAGE_BYTES as u64)
            .reject_trailing_bytes()
            .serialize(request)
            .map_err(|err| DecodeError::new(err.to_string()))
    }
}

/// Decodes UTF-8 JSON request payloads.
pub struct JsonPrototype<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> JsonPrototype<T> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for JsonPrototype<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for JsonPrototype<T> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for JsonPrototype<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JsonPrototype")
            .field("type", &std::any::type_name::<T>())
            .finish()
    }
}

impl<T: DeserializeOwned> RequestPrototype<T> for JsonPrototype<T> {
    fn decode(&self, bytes: &[u8]) -> Result<T, DecodeError> {
        // Don't echo the payload back: serde_json's message only carries position and category.
        serde_json::from_slice(bytes).map_err(|err| DecodeError::new(err.to_string()))
    }
}
