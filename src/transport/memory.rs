//! In-process transport built on tokio channels.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use super::{Envelope, Message, Transport};
use crate::error::TransportError;
use crate::unit::WorkerId;

/// A bus with one controller inbox and one inbox per connected worker.
#[derive(Debug, Clone)]
pub struct InMemoryBus {
    controller_tx: mpsc::UnboundedSender<Envelope>,
    workers: Arc<Mutex<HashMap<WorkerId, mpsc::UnboundedSender<Message>>>>,
}

impl InMemoryBus {
    /// Create a bus and the receiver the controller reads from.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Envelope>) {
        let (controller_tx, controller_rx) = mpsc::unbounded_channel();
        let bus = Self {
            controller_tx,
            workers: Arc::new(Mutex::new(HashMap::new())),
        };
        (bus, controller_rx)
    }

    /// Register a worker and hand back its endpoint. Reconnecting replaces
    /// the previous endpoint.
    pub fn connect(&self, worker_id: impl Into<WorkerId>) -> WorkerEndpoint {
        let worker_id = worker_id.into();
        let (tx, rx) = mpsc::unbounded_channel();
        if let Ok(mut workers) = self.workers.lock() {
            workers.insert(worker_id.clone(), tx);
        }
        debug!(worker_id = %worker_id, "Worker connected");
        WorkerEndpoint {
            worker_id,
            controller_tx: self.controller_tx.clone(),
            inbox: rx,
        }
    }

    pub fn disconnect(&self, worker_id: &WorkerId) -> bool {
        self.workers
            .lock()
            .map(|mut workers| workers.remove(worker_id).is_some())
            .unwrap_or(false)
    }

    /// Inject a message into the controller inbox as if `worker_id` sent it.
    pub fn send_to_controller(
        &self,
        worker_id: impl Into<WorkerId>,
        message: Message,
    ) -> Result<(), TransportError> {
        self.controller_tx
            .send(Envelope {
                worker_id: worker_id.into(),
                message,
            })
            .map_err(|_| TransportError::Closed)
    }
}

#[async_trait]
impl Transport for InMemoryBus {
    async fn send(&self, worker_id: &WorkerId, message: Message) -> Result<(), TransportError> {
        let sender = self
            .workers
            .lock()
            .ok()
            .and_then(|workers| workers.get(worker_id).cloned())
            .ok_or_else(|| TransportError::UnknownWorker(worker_id.clone()))?;
        sender.send(message).map_err(|_| TransportError::Closed)
    }
}

/// The worker side of an [`InMemoryBus`] connection.
#[derive(Debug)]
pub struct WorkerEndpoint {
    worker_id: WorkerId,
    controller_tx: mpsc::UnboundedSender<Envelope>,
    inbox: mpsc::UnboundedReceiver<Message>,
}

impl WorkerEndpoint {
    pub fn worker_id(&self) -> &WorkerId {
        &self.worker_id
    }

    /// Send a message to the controller.
    pub fn send(&self, message: Message) -> Result<(), TransportError> {
        self.controller_tx
            .send(Envelope {
                worker_id: self.worker_id.clone(),
                message,
            })
            .map_err(|_| TransportError::Closed)
    }

    /// Next message from the controller, `None` once disconnected.
    pub async fn recv(&mut self) -> Option<Message> {
        self.inbox.recv().await
    }
}
