//! Control plane exposing the admission queue to remote workers.
//!
//! The server consumes [`Envelope`]s from the controller inbox, feeds
//! `request_write`/`release_write`/`release_worker` messages into an
//! [`AdmissionQueue`], and answers each grant with an `allow_write` message
//! carrying a freshly generated, currently unique file path.
//!
//! Lifecycle: `New -> InitStarted -> Initialized`. `init` may run only once.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};

use chrono::Local;
use rand::distributions::Alphanumeric;
use rand::Rng;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use super::admission::{AcquireEvent, AdmissionQueue, EntryState};
use crate::config::WriteQueueConfig;
use crate::error::{QueueServerError, QueueServerResult};
use crate::hooks::Hook;
use crate::transport::{Envelope, Message, MessageNames, Transport, WriteGrant, WriteRequest};
use crate::unit::WorkerId;

/// Regeneration attempts before a name collision is reported.
pub const MAX_FILE_NAME_ATTEMPTS: usize = 16;

/// Extension used for generated names.
pub const DEFAULT_EXTENSION: &str = "png";

const SALT_LENGTH: usize = 5;
const SERVER_PLUGIN: &str = "queue-server";

/// Initialization state of a [`QueueServer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitState {
    New,
    InitStarted,
    Initialized,
}

/// Payload of the `onFileName` hook. Plugins may rewrite both fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileNameRequest {
    pub worker_id: WorkerId,
    pub request_id: String,
    pub file_name: String,
    pub path: PathBuf,
}

/// Payload of the `onRelease` hook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseEvent {
    pub worker_id: WorkerId,
    pub request_id: String,
}

/// Hook points exposed by [`QueueServer`].
#[derive(Debug)]
pub struct QueueServerHooks {
    pub on_file_name: Hook<FileNameRequest>,
    pub on_release: Hook<ReleaseEvent>,
}

impl Default for QueueServerHooks {
    fn default() -> Self {
        Self {
            on_file_name: Hook::new("onFileName"),
            on_release: Hook::new("onRelease"),
        }
    }
}

#[derive(Debug, Clone)]
struct FileNameRecord {
    worker_id: WorkerId,
    request_id: String,
}

/// Write-queue control plane.
pub struct QueueServer<T: Transport> {
    transport: T,
    names: MessageNames,
    state: InitState,
    queue: Option<AdmissionQueue>,
    save_path: PathBuf,
    file_names: HashMap<PathBuf, FileNameRecord>,
    hooks: QueueServerHooks,
    grants_tx: mpsc::UnboundedSender<AcquireEvent>,
    grants_rx: mpsc::UnboundedReceiver<AcquireEvent>,
}

impl<T: Transport> QueueServer<T> {
    pub fn new(transport: T) -> Self {
        let (grants_tx, grants_rx) = mpsc::unbounded_channel();
        Self {
            transport,
            names: MessageNames::default(),
            state: InitState::New,
            queue: None,
            save_path: PathBuf::new(),
            file_names: HashMap::new(),
            hooks: QueueServerHooks::default(),
            grants_tx,
            grants_rx,
        }
    }

    pub fn init_state(&self) -> InitState {
        self.state
    }

    pub fn hooks(&self) -> &QueueServerHooks {
        &self.hooks
    }

    pub fn names(&self) -> &MessageNames {
        &self.names
    }

    /// The admission queue, once initialized.
    pub fn queue(&self) -> Option<&AdmissionQueue> {
        self.queue.as_ref()
    }

    /// Absolute directory generated names are placed in.
    pub fn save_path(&self) -> &Path {
        &self.save_path
    }

    /// Set up the admission queue and the target directory.
    pub async fn init(&mut self, config: &WriteQueueConfig) -> QueueServerResult<()> {
        if self.state != InitState::New {
            return Err(QueueServerError::AlreadyInitialized);
        }
        self.state = InitState::InitStarted;

        config.validate()?;
        self.names = MessageNames::new(&config.message_prefix);
        self.save_path = absolute(&config.save_path_base)?;

        let queue = AdmissionQueue::new(config.max_write_thread_count);
        let grants = self.grants_tx.clone();
        queue
            .hooks()
            .on_acquire
            .read_hook(SERVER_PLUGIN, move |event: &AcquireEvent| {
                grants
                    .send(event.clone())
                    .map_err(|_| "queue server stopped".into())
            });
        self.queue = Some(queue);

        ensure_dir(&self.save_path).await?;

        self.state = InitState::Initialized;
        info!(
            save_path = %self.save_path.display(),
            max_write_thread_count = config.max_write_thread_count,
            prefix = %config.message_prefix,
            "Write queue server initialized"
        );
        Ok(())
    }

    /// Process one inbound message, including any grants it causes.
    pub async fn handle(&mut self, envelope: Envelope) -> QueueServerResult<()> {
        if self.state != InitState::Initialized {
            return Err(QueueServerError::NotInitialized);
        }
        let Envelope { worker_id, message } = envelope;

        if message.name == self.names.request_write {
            let WriteRequest { request_id } = message.decode()?;
            debug!(worker_id = %worker_id, request_id = %request_id, "Write requested");
            self.queue_mut()?.acquire(worker_id, request_id);
        } else if message.name == self.names.release_write {
            let WriteRequest { request_id } = message.decode()?;
            debug!(worker_id = %worker_id, request_id = %request_id, "Write released");
            let event = ReleaseEvent {
                worker_id: worker_id.clone(),
                request_id: request_id.clone(),
            };
            if let Err(err) = self.hooks.on_release.call(event).await {
                warn!(worker_id = %worker_id, error = %err, "onRelease hook failed");
            }
            self.remove_file_names(&worker_id, Some(&request_id));
            self.queue_mut()?.release(&worker_id, &request_id);
        } else if message.name == self.names.release_worker {
            debug!(worker_id = %worker_id, "Worker released");
            self.clean_worker(&worker_id)?;
        } else {
            debug!(name = %message.name, "Ignoring message for another subsystem");
            return Ok(());
        }

        self.process_grants().await
    }

    /// Serve messages until `inbox` closes or `shutdown` flips to `true`,
    /// then hand the server back.
    pub async fn run(
        mut self,
        mut inbox: mpsc::UnboundedReceiver<Envelope>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Self {
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                envelope = inbox.recv() => {
                    let Some(envelope) = envelope else {
                        break;
                    };
                    let worker_id = envelope.worker_id.clone();
                    if let Err(err) = self.handle(envelope).await {
                        error!(worker_id = %worker_id, error = %err, "Write queue request failed");
                    }
                }
            }
        }
        debug!("Write queue server stopped");
        self
    }

    /// Live resolved names.
    pub fn name_list(&self) -> Vec<PathBuf> {
        let mut names: Vec<PathBuf> = self.file_names.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn remove_file_name(&mut self, path: &Path) -> bool {
        self.file_names.remove(path).is_some()
    }

    /// Drop the records owned by `worker_id`, optionally only those issued
    /// for `request_id`. Returns how many were removed.
    pub fn remove_file_names(&mut self, worker_id: &WorkerId, request_id: Option<&str>) -> usize {
        let before = self.file_names.len();
        self.file_names.retain(|_, record| {
            let owned = record.worker_id == *worker_id
                && request_id.map_or(true, |id| id == record.request_id);
            !owned
        });
        before - self.file_names.len()
    }

    fn queue_mut(&mut self) -> QueueServerResult<&mut AdmissionQueue> {
        self.queue.as_mut().ok_or(QueueServerError::NotInitialized)
    }

    fn clean_worker(&mut self, worker_id: &WorkerId) -> QueueServerResult<()> {
        self.queue_mut()?.clean(worker_id);
        self.remove_file_names(worker_id, None);
        Ok(())
    }

    // Grants are reported by the onAcquire hook into `grants_rx`. Failing to
    // answer one grant frees its slot, which may queue further grants, so
    // keep draining until the channel is empty.
    async fn process_grants(&mut self) -> QueueServerResult<()> {
        let mut first_error = None;
        while let Ok(grant) = self.grants_rx.try_recv() {
            // A failed send earlier in this drain may have cleaned the worker.
            let state = self
                .queue
                .as_ref()
                .and_then(|queue| queue.state_of(&grant.worker_id, &grant.request_id));
            if state != Some(EntryState::Granted) {
                debug!(
                    worker_id = %grant.worker_id,
                    request_id = %grant.request_id,
                    "Skipping grant that is no longer held"
                );
                continue;
            }
            if let Err(err) = self.answer_grant(&grant).await {
                error!(
                    worker_id = %grant.worker_id,
                    request_id = %grant.request_id,
                    error = %err,
                    "Failed to answer write grant"
                );
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    async fn answer_grant(&mut self, grant: &AcquireEvent) -> QueueServerResult<()> {
        let AcquireEvent {
            worker_id,
            request_id,
        } = grant;

        let file_name = match self
            .generate_unique_file_name(worker_id, request_id, DEFAULT_EXTENSION)
            .await
        {
            Ok(file_name) => file_name,
            Err(err) => {
                self.queue_mut()?.release(worker_id, request_id);
                return Err(err);
            }
        };

        let message = Message::new(
            self.names.allow_write.clone(),
            &WriteGrant {
                request_id: request_id.clone(),
                file_name: file_name.clone(),
            },
        )?;
        if let Err(err) = self.transport.send(worker_id, message).await {
            // The worker is unreachable; reclaim everything it held.
            self.clean_worker(worker_id)?;
            return Err(err.into());
        }

        debug!(
            worker_id = %worker_id,
            request_id = %request_id,
            file_name = %file_name.display(),
            "Write allowed"
        );
        Ok(())
    }

    /// Generate a name no live record uses, passing each candidate through
    /// the `onFileName` hook.
    pub async fn generate_unique_file_name(
        &mut self,
        worker_id: &WorkerId,
        request_id: &str,
        extension: &str,
    ) -> QueueServerResult<PathBuf> {
        for attempt in 0..MAX_FILE_NAME_ATTEMPTS {
            let candidate = FileNameRequest {
                worker_id: worker_id.clone(),
                request_id: request_id.to_string(),
                file_name: base_file_name(worker_id, request_id, extension),
                path: self.save_path.clone(),
            };
            let resolved = self.hooks.on_file_name.call(candidate).await?;
            let full_path = resolved.path.join(&resolved.file_name);

            if self.file_names.contains_key(&full_path) {
                debug!(attempt, file_name = %full_path.display(), "File name collision, regenerating");
                continue;
            }

            self.file_names.insert(
                full_path.clone(),
                FileNameRecord {
                    worker_id: worker_id.clone(),
                    request_id: request_id.to_string(),
                },
            );
            return Ok(full_path);
        }

        Err(QueueServerError::FileNameCollision {
            worker_id: worker_id.clone(),
            request_id: request_id.to_string(),
            attempts: MAX_FILE_NAME_ATTEMPTS,
        })
    }
}

/// `<worker>-<request>-<salt>-<time>.<ext>`. Both ids come from workers, so
/// path separators in them are replaced to keep the name a single component.
fn base_file_name(worker_id: &WorkerId, request_id: &str, extension: &str) -> String {
    let salt: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(SALT_LENGTH)
        .map(char::from)
        .collect();
    let timestamp = Local::now().format("%H-%M-%S_%a_%b_%d_%Y");
    format!(
        "{}-{}-{}-{}.{}",
        path_component(worker_id.as_str()),
        path_component(request_id),
        salt,
        timestamp,
        extension
    )
}

fn path_component(id: &str) -> String {
    id.replace(['/', '\\'], ".")
}

fn absolute(path: &Path) -> QueueServerResult<PathBuf> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    std::env::current_dir()
        .map(|cwd| cwd.join(path))
        .map_err(|source| QueueServerError::Io {
            path: path.to_path_buf(),
            source,
        })
}

/// Create `path` and its parents. An existing directory is fine.
pub async fn ensure_dir(path: &Path) -> QueueServerResult<()> {
    match tokio::fs::create_dir_all(path).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists && path.is_dir() => Ok(()),
        Err(source) => Err(QueueServerError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}
