//! Table of live interactive sessions.
//!
//! A slot is reserved before a process is spawned and released when the
//! [`SessionSlot`] is dropped, so the table never outlives the bridge that
//! owns the session. The control queue and cancel token exist from the moment
//! of reservation, so commands and cancels sent while the process is still
//! launching are not lost.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use lxd_shim_core::{Error, OperationId, Result};

use crate::bridge::ControlCommand;

/// Pending control commands per session.
pub const CONTROL_DEPTH: usize = 16;

#[derive(Debug)]
struct LiveSession {
    control: mpsc::Sender<ControlCommand>,
    cancel: CancellationToken,
}

type Slots = HashMap<OperationId, LiveSession>;

fn lock(slots: &Mutex<Slots>) -> MutexGuard<'_, Slots> {
    slots.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Live sessions keyed by operation id, bounded by a maximum count.
#[derive(Debug, Clone)]
pub struct SessionTable {
    slots: Arc<Mutex<Slots>>,
    max_sessions: usize,
}

impl SessionTable {
    /// Create a table holding at most `max_sessions` sessions.
    pub fn new(max_sessions: usize) -> Self {
        Self {
            slots: Arc::new(Mutex::new(HashMap::new())),
            max_sessions,
        }
    }

    /// Reserve a slot for the session behind `id`.
    pub fn reserve(&self, id: OperationId) -> Result<SessionSlot> {
        let mut slots = lock(&self.slots);
        if slots.contains_key(&id) {
            return Err(Error::AlreadyExists(id));
        }
        if slots.len() >= self.max_sessions {
            return Err(Error::SessionLimitReached(self.max_sessions));
        }

        let (control_tx, control_rx) = mpsc::channel(CONTROL_DEPTH);
        let cancel = CancellationToken::new();
        slots.insert(
            id,
            LiveSession {
                control: control_tx,
                cancel: cancel.clone(),
            },
        );
        Ok(SessionSlot {
            id,
            slots: Arc::clone(&self.slots),
            control: Some(control_rx),
            cancel,
        })
    }

    /// Whether another session would exceed the limit.
    pub fn is_full(&self) -> bool {
        lock(&self.slots).len() >= self.max_sessions
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        lock(&self.slots).len()
    }

    /// Whether no session is live.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether a session is live for `id`.
    pub fn contains(&self, id: &OperationId) -> bool {
        lock(&self.slots).contains_key(id)
    }

    /// Queue a control command for the session, if any.
    ///
    /// Returns `false` if no session is live or its control queue is full.
    pub fn send(&self, id: &OperationId, command: ControlCommand) -> bool {
        let sender = lock(&self.slots).get(id).map(|live| live.control.clone());
        let Some(sender) = sender else {
            debug!("No live session for operation {}", id);
            return false;
        };
        match sender.try_send(command) {
            Ok(()) => true,
            Err(TrySendError::Full(command)) => {
                warn!("Control queue full for {}, dropping {:?}", id, command);
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// End the session behind `id`, whether it is launching or relaying.
    ///
    /// Returns `false` if no session is live.
    pub fn cancel(&self, id: &OperationId) -> bool {
        match lock(&self.slots).get(id) {
            Some(live) => {
                live.cancel.cancel();
                true
            }
            None => false,
        }
    }
}

/// A reserved place in the [`SessionTable`], released on drop.
#[derive(Debug)]
pub struct SessionSlot {
    id: OperationId,
    slots: Arc<Mutex<Slots>>,
    control: Option<mpsc::Receiver<ControlCommand>>,
    cancel: CancellationToken,
}

impl SessionSlot {
    /// Operation this slot belongs to.
    pub fn id(&self) -> OperationId {
        self.id
    }

    /// Take the receiving end of the control queue; `None` once taken.
    pub fn take_control(&mut self) -> Option<mpsc::Receiver<ControlCommand>> {
        self.control.take()
    }

    /// Token cancelled by [`SessionTable::cancel`].
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Whether the session was cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Drop for SessionSlot {
    fn drop(&mut self) {
        lock(&self.slots).remove(&self.id);
        debug!("Released session slot for operation {}", self.id);
    }
}
