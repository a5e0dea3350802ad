//! In-process event buses.
//!
//! `ChangeBus` carries "actions were appended" events from the write path to
//! parked generic sync watches. `UserEventBus` carries directory changes
//! (membership, active flag, profile) from the out-of-scope administration
//! layer into the subject watch hub. Both are broadcast channels; slow
//! consumers lag and re-poll instead of blocking writers.

use caresync_core::users::Role;
use tokio::sync::broadcast;

const BUS_CAPACITY: usize = 256;

/// Actions were appended to a project table.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub project: String,
    pub table: String,
    pub subjects: Vec<String>,
}

#[derive(Clone)]
pub struct ChangeBus {
    tx: broadcast::Sender<ChangeEvent>,
}

impl ChangeBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BUS_CAPACITY);
        Self { tx }
    }

    pub fn publish(&self, event: ChangeEvent) {
        // No receivers parked is the common case and not an error.
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.tx.subscribe()
    }
}

impl Default for ChangeBus {
    fn default() -> Self {
        Self::new()
    }
}

/// A directory change that may affect subject watches.
#[derive(Debug, Clone)]
pub enum UserEvent {
    AddedToProject {
        userid: String,
        project: String,
        role: Role,
    },
    RemovedFromProject {
        userid: String,
        project: String,
        role: Role,
    },
    ActiveChanged {
        userid: String,
        active: bool,
    },
    ProfileUpdated {
        userid: String,
    },
}

#[derive(Clone)]
pub struct UserEventBus {
    tx: broadcast::Sender<UserEvent>,
}

impl UserEventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BUS_CAPACITY);
        Self { tx }
    }

    pub fn publish(&self, event: UserEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UserEvent> {
        self.tx.subscribe()
    }
}

impl Default for UserEventBus {
    fn default() -> Self {
        Self::new()
    }
}
