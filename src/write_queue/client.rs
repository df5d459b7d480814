//! Worker-side access to the write queue.

use std::collections::HashMap;
use std::path::PathBuf;

use serde_json::json;
use tracing::debug;

use crate::error::TransportError;
use crate::transport::{Message, MessageNames, WorkerEndpoint, WriteGrant, WriteRequest};

/// Requests write slots from the controller over a worker endpoint.
#[derive(Debug)]
pub struct WriteAccessClient {
    endpoint: WorkerEndpoint,
    names: MessageNames,
    early_grants: HashMap<String, PathBuf>,
}

impl WriteAccessClient {
    pub fn new(endpoint: WorkerEndpoint, names: MessageNames) -> Self {
        Self {
            endpoint,
            names,
            early_grants: HashMap::new(),
        }
    }

    pub fn endpoint(&self) -> &WorkerEndpoint {
        &self.endpoint
    }

    /// Ask for a write slot and wait until it is granted. Returns the file
    /// path reserved for this request.
    pub async fn acquire(&mut self, request_id: &str) -> Result<PathBuf, TransportError> {
        self.endpoint.send(Message::new(
            self.names.request_write.clone(),
            &WriteRequest {
                request_id: request_id.to_string(),
            },
        )?)?;
        self.wait_for_grant(request_id).await
    }

    /// Wait for the grant of a request sent earlier.
    pub async fn wait_for_grant(&mut self, request_id: &str) -> Result<PathBuf, TransportError> {
        loop {
            if let Some(path) = self.early_grants.remove(request_id) {
                return Ok(path);
            }

            let message = self.endpoint.recv().await.ok_or(TransportError::Closed)?;
            if message.name != self.names.allow_write {
                debug!(name = %message.name, "Skipping unrelated message");
                continue;
            }
            let grant: WriteGrant = message.decode()?;
            if grant.request_id == request_id {
                return Ok(grant.file_name);
            }
            self.early_grants.insert(grant.request_id, grant.file_name);
        }
    }

    /// Send a write request without waiting for the grant.
    pub fn request(&self, request_id: &str) -> Result<(), TransportError> {
        self.endpoint.send(Message::new(
            self.names.request_write.clone(),
            &WriteRequest {
                request_id: request_id.to_string(),
            },
        )?)
    }

    /// Give the slot for `request_id` back.
    pub fn release(&self, request_id: &str) -> Result<(), TransportError> {
        self.endpoint.send(Message::new(
            self.names.release_write.clone(),
            &WriteRequest {
                request_id: request_id.to_string(),
            },
        )?)
    }

    /// Drop every request this worker holds or waits on.
    pub fn release_worker(&self) -> Result<(), TransportError> {
        self.endpoint
            .send(Message::new(self.names.release_worker.clone(), &json!({}))?)
    }
}
