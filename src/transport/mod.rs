//! Message plumbing between the controller and worker processes.
//!
//! The transport is assumed reliable and ordered per worker. Messages are
//! identified by name; names carry a prefix so several subsystems can share
//! one bus. Payloads are JSON values.

pub mod memory;

use std::path::PathBuf;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::DEFAULT_MESSAGE_PREFIX;
use crate::error::TransportError;
use crate::unit::WorkerId;

pub use memory::{InMemoryBus, WorkerEndpoint};

/// Prefixed names of the write-queue message kinds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageNames {
    /// worker -> controller, payload [`WriteRequest`]
    pub request_write: String,
    /// controller -> worker, payload [`WriteGrant`]
    pub allow_write: String,
    /// worker -> controller, payload [`WriteRequest`]
    pub release_write: String,
    /// worker/controller -> controller, empty payload
    pub release_worker: String,
}

impl MessageNames {
    pub fn new(prefix: &str) -> Self {
        Self {
            request_write: format!("{}_request_write", prefix),
            allow_write: format!("{}_allow_write", prefix),
            release_write: format!("{}_release_write", prefix),
            release_worker: format!("{}_release_worker", prefix),
        }
    }
}

impl Default for MessageNames {
    fn default() -> Self {
        Self::new(DEFAULT_MESSAGE_PREFIX)
    }
}

/// A named message with a JSON payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub name: String,
    pub payload: Value,
}

impl Message {
    pub fn new<T: Serialize>(name: impl Into<String>, payload: &T) -> Result<Self, TransportError> {
        Ok(Self {
            name: name.into(),
            payload: serde_json::to_value(payload)?,
        })
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, TransportError> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}

/// A message received by the controller, tagged with its sender.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub worker_id: WorkerId,
    pub message: Message,
}

/// Payload of `request_write` and `release_write`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteRequest {
    pub request_id: String,
}

/// Payload of `allow_write`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteGrant {
    pub request_id: String,
    pub file_name: PathBuf,
}

/// Controller-side sending half of a transport.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Deliver `message` to one worker.
    async fn send(&self, worker_id: &WorkerId, message: Message) -> Result<(), TransportError>;
}
