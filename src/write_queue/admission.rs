//! Bounded write-slot admission.
//!
//! At most `max_concurrent` `(worker, request)` pairs hold a slot at once.
//! Everything else waits in a FIFO list and is promoted strictly in arrival
//! order as slots free up. Each grant fires the `onAcquire` hook.
//!
//! The queue is a plain `&mut self` state machine; its owner serializes
//! calls, so no two admission decisions can interleave.

use std::collections::VecDeque;

use tracing::{debug, warn};

use crate::hooks::Hook;
use crate::unit::WorkerId;

/// Payload of the `onAcquire` hook: a pair that was just granted a slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcquireEvent {
    pub worker_id: WorkerId,
    pub request_id: String,
}

/// Where a pair currently sits in the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    Waiting,
    Granted,
}

/// Hook points exposed by [`AdmissionQueue`].
#[derive(Debug)]
pub struct AdmissionHooks {
    pub on_acquire: Hook<AcquireEvent>,
}

impl Default for AdmissionHooks {
    fn default() -> Self {
        Self {
            on_acquire: Hook::new("onAcquire"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Ticket {
    worker_id: WorkerId,
    request_id: String,
}

impl Ticket {
    fn matches(&self, worker_id: &WorkerId, request_id: &str) -> bool {
        self.worker_id == *worker_id && self.request_id == request_id
    }
}

/// FIFO admission queue over a fixed number of write slots.
#[derive(Debug)]
pub struct AdmissionQueue {
    max_concurrent: usize,
    granted: Vec<Ticket>,
    waiting: VecDeque<Ticket>,
    hooks: AdmissionHooks,
}

impl AdmissionQueue {
    /// Create a queue. A capacity of zero is raised to one so the queue
    /// can always make progress.
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            max_concurrent: max_concurrent.max(1),
            granted: Vec::new(),
            waiting: VecDeque::new(),
            hooks: AdmissionHooks::default(),
        }
    }

    pub fn hooks(&self) -> &AdmissionHooks {
        &self.hooks
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    pub fn granted_count(&self) -> usize {
        self.granted.len()
    }

    pub fn waiting_count(&self) -> usize {
        self.waiting.len()
    }

    pub fn state_of(&self, worker_id: &WorkerId, request_id: &str) -> Option<EntryState> {
        if self.granted.iter().any(|t| t.matches(worker_id, request_id)) {
            Some(EntryState::Granted)
        } else if self.waiting.iter().any(|t| t.matches(worker_id, request_id)) {
            Some(EntryState::Waiting)
        } else {
            None
        }
    }

    /// Ask for a slot. Grants immediately when capacity allows, otherwise
    /// queues the pair. Repeating an acquire for a live pair changes nothing.
    pub fn acquire(&mut self, worker_id: WorkerId, request_id: impl Into<String>) -> EntryState {
        let request_id = request_id.into();
        if let Some(state) = self.state_of(&worker_id, &request_id) {
            debug!(worker_id = %worker_id, request_id = %request_id, "Duplicate acquire ignored");
            return state;
        }

        let ticket = Ticket {
            worker_id,
            request_id,
        };
        if self.granted.len() < self.max_concurrent {
            self.grant(ticket);
            EntryState::Granted
        } else {
            debug!(
                worker_id = %ticket.worker_id,
                request_id = %ticket.request_id,
                position = self.waiting.len(),
                "Write slot busy, waiting"
            );
            self.waiting.push_back(ticket);
            EntryState::Waiting
        }
    }

    /// Give back a slot and promote the oldest waiter. Releasing a pair
    /// that is still waiting withdraws it; unknown pairs are ignored.
    /// Returns whether anything was removed.
    pub fn release(&mut self, worker_id: &WorkerId, request_id: &str) -> bool {
        if let Some(index) = self.granted.iter().position(|t| t.matches(worker_id, request_id)) {
            self.granted.remove(index);
            self.promote();
            return true;
        }
        if let Some(index) = self.waiting.iter().position(|t| t.matches(worker_id, request_id)) {
            self.waiting.remove(index);
            return true;
        }
        debug!(worker_id = %worker_id, request_id = %request_id, "Release for unknown request ignored");
        false
    }

    /// Drop every entry owned by `worker_id` and hand freed slots to the
    /// longest-waiting remaining entries. Returns how many entries were removed.
    pub fn clean(&mut self, worker_id: &WorkerId) -> usize {
        let before = self.granted.len() + self.waiting.len();
        self.waiting.retain(|t| t.worker_id != *worker_id);
        self.granted.retain(|t| t.worker_id != *worker_id);
        let removed = before - (self.granted.len() + self.waiting.len());
        if removed > 0 {
            debug!(worker_id = %worker_id, removed, "Cleaned worker entries");
            self.promote();
        }
        removed
    }

    fn promote(&mut self) {
        while self.granted.len() < self.max_concurrent {
            let Some(ticket) = self.waiting.pop_front() else {
                break;
            };
            self.grant(ticket);
        }
    }

    fn grant(&mut self, ticket: Ticket) {
        let event = AcquireEvent {
            worker_id: ticket.worker_id.clone(),
            request_id: ticket.request_id.clone(),
        };
        self.granted.push(ticket);
        // Observers cannot undo a grant; their failures are only reported.
        if let Err(err) = self.hooks.on_acquire.notify(&event) {
            warn!(
                worker_id = %event.worker_id,
                request_id = %event.request_id,
                error = %err,
                "onAcquire hook failed"
            );
        }
    }
}
