//! Ticket Types
//!
//! A ticket is one cache entry: its key, where it currently lives, and the
//! caller's payload. The cache never looks inside a payload; it only needs
//! the [`Payload`] capability to turn it into bytes and back.

use std::fmt;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Where a ticket is in its lifecycle
///
/// ```text
/// Caching ──▶ InMemory ──▶ Caching ──▶ OnDisk ──▶ Resumed (popped from disk)
///                                 └──▶ Lost
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TicketStatus {
    /// Being placed, or moving from memory to disk
    Caching,
    /// Held by the memory tier
    InMemory,
    /// Persisted by the disk tier
    OnDisk,
    /// Re-materialized from disk bytes by a pop
    Resumed,
    /// Eviction write failed; the payload is gone
    Lost,
}

impl TicketStatus {
    /// Whether the payload can still be returned by a pop
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, TicketStatus::Lost)
    }
}

impl fmt::Display for TicketStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TicketStatus::Caching => write!(f, "CACHING"),
            TicketStatus::InMemory => write!(f, "IN_MEMORY"),
            TicketStatus::OnDisk => write!(f, "ON_DISK"),
            TicketStatus::Resumed => write!(f, "RESUMED"),
            TicketStatus::Lost => write!(f, "LOST"),
        }
    }
}

/// Capability a value needs to be cached
pub trait Payload: Send + Sized + 'static {
    /// Serialize into the bytes the disk tier persists
    fn to_bytes(&self) -> Result<Vec<u8>>;

    /// Rebuild a value from bytes produced by [`Payload::to_bytes`]
    fn from_bytes(bytes: &[u8]) -> Result<Self>;

    /// Size in bytes charged against tier capacity, if known without
    /// serializing. `None` makes the memory tier serialize once to measure.
    fn size_hint(&self) -> Option<u64> {
        None
    }
}

impl Payload for Vec<u8> {
    fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(self.clone())
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(bytes.to_vec())
    }

    fn size_hint(&self) -> Option<u64> {
        Some(self.len() as u64)
    }
}

impl Payload for Bytes {
    fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(self.to_vec())
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(Bytes::copy_from_slice(bytes))
    }

    fn size_hint(&self) -> Option<u64> {
        Some(self.len() as u64)
    }
}

impl Payload for String {
    fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(self.as_bytes().to_vec())
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self> {
        String::from_utf8(bytes.to_vec()).map_err(|e| Error::Payload(e.to_string()))
    }

    fn size_hint(&self) -> Option<u64> {
        Some(self.len() as u64)
    }
}

/// Caches any serde value by encoding it as JSON
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Json<T>(pub T);

impl<T> Json<T> {
    /// Unwrap the inner value
    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T> Payload for Json<T>
where
    T: Serialize + DeserializeOwned + Send + 'static,
{
    fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&self.0)?)
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(Json(serde_json::from_slice(bytes)?))
    }
}

/// A cache entry
///
/// The key is fixed at construction; only the cache changes the status.
#[derive(Debug, Clone, PartialEq)]
pub struct Ticket<P> {
    id: String,
    status: TicketStatus,
    payload: P,
}

impl<P> Ticket<P> {
    /// Create a ticket in the `Caching` state
    pub(crate) fn new(id: String, payload: P) -> Self {
        Self {
            id,
            status: TicketStatus::Caching,
            payload,
        }
    }

    /// Rebuild a ticket with a known status
    pub(crate) fn with_status(id: String, status: TicketStatus, payload: P) -> Self {
        Self {
            id,
            status,
            payload,
        }
    }

    /// Ticket key
    #[inline]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Current status
    #[inline]
    pub fn status(&self) -> TicketStatus {
        self.status
    }

    #[inline]
    pub(crate) fn set_status(&mut self, status: TicketStatus) {
        self.status = status;
    }

    /// Borrow the payload
    #[inline]
    pub fn payload(&self) -> &P {
        &self.payload
    }

    /// Take the payload
    pub fn into_payload(self) -> P {
        self.payload
    }

    /// Split into key, status and payload
    pub fn into_parts(self) -> (String, TicketStatus, P) {
        (self.id, self.status, self.payload)
    }
}

impl<P: Payload> Ticket<P> {
    /// Bytes charged against tier capacity
    pub(crate) fn weight(&self) -> Result<u64> {
        match self.payload.size_hint() {
            Some(size) => Ok(size),
            None => Ok(self.payload.to_bytes()?.len() as u64),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
