//! Error types shared across the scheduler and the write queue.
//!
//! Unit failures are not errors in this sense: they are carried as data in
//! [`crate::runner::RunOutcome`] and never bubble out of a run.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::hooks::HookError;
use crate::unit::WorkerId;

/// Invalid or unloadable configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// A numeric limit that must be positive was zero.
    #[error("`{field}` must be greater than zero")]
    ZeroLimit { field: &'static str },

    /// The layered file/environment loader failed.
    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("Invalid TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to render TOML: {0}")]
    Render(#[from] toml::ser::Error),
}

/// Errors raised by a message transport.
#[derive(Error, Debug)]
pub enum TransportError {
    /// No endpoint is registered under the destination id.
    #[error("Unknown worker: {0}")]
    UnknownWorker(WorkerId),

    /// The receiving side of a channel has gone away.
    #[error("Channel closed")]
    Closed,

    /// A payload could not be encoded or decoded.
    #[error("Payload error: {0}")]
    Payload(#[from] serde_json::Error),
}

/// Errors raised while spawning or tearing down worker instances.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Failed to spawn worker: {0}")]
    Spawn(String),

    #[error("Failed to kill worker {worker_id}: {reason}")]
    Kill { worker_id: WorkerId, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Errors raised by the write-queue control plane.
#[derive(Error, Debug)]
pub enum QueueServerError {
    /// `init` was called on a server that already left the `New` state.
    #[error("Cannot reinitialize component (queue server is singleton)")]
    AlreadyInitialized,

    /// A message arrived before `init` completed.
    #[error("Queue server is not initialized")]
    NotInitialized,

    /// Directory creation failed for a reason other than "already exists".
    #[error("Failed to prepare {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Name generation kept colliding with live records.
    #[error("Could not generate a unique file name for {worker_id}/{request_id} after {attempts} attempts")]
    FileNameCollision {
        worker_id: WorkerId,
        request_id: String,
        attempts: usize,
    },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Hook(#[from] HookError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Result type for control-plane operations.
pub type QueueServerResult<T> = Result<T, QueueServerError>;
