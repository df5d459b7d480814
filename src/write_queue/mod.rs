//! Exclusive write access shared between workers.
//!
//! Workers ask the controller for a write slot with a `request_write`
//! message and get an `allow_write` reply carrying a unique file path once a
//! slot is free. The controller side is split in two:
//!
//! - **admission**: the bounded FIFO slot queue itself
//! - **server**: message handling, file name generation and bookkeeping
//!
//! Workers use **client** to talk to the server.

pub mod admission;
pub mod client;
pub mod server;

pub use admission::{AcquireEvent, AdmissionHooks, AdmissionQueue, EntryState};
pub use client::WriteAccessClient;
pub use server::{
    ensure_dir, FileNameRequest, InitState, QueueServer, QueueServerHooks, ReleaseEvent,
};
