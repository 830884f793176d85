//! Ref change notifications.

use std::sync::Arc;

use parking_lot::RwLock;

use crate::bus::fault::FaultRegister;
use crate::storage::{CommitId, RefName, StorageResult};

/// One ref that moved, was created or was deleted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefChange {
    pub name: RefName,
    pub old: Option<CommitId>,
    pub new: Option<CommitId>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefsChanged {
    pub changes: Vec<RefChange>,
}

impl RefsChanged {
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }
}

/// Something that keeps derived state per ref, e.g. a cache.
pub trait RefListener: Send + Sync {
    fn refs_changed(&self, event: &RefsChanged) -> StorageResult<()>;
}

/// Fans ref change events out to every listener.
///
/// A listener failure doesn't stop the others; it ends up in the fault
/// register instead.
pub struct NotificationBus {
    listeners: RwLock<Vec<Arc<dyn RefListener>>>,
    faults: Arc<FaultRegister>,
}

impl NotificationBus {
    pub fn new(faults: Arc<FaultRegister>) -> Self {
        Self {
            listeners: RwLock::new(Vec::new()),
            faults,
        }
    }

    pub fn subscribe(&self, listener: Arc<dyn RefListener>) {
        self.listeners.write().push(listener);
    }

    pub fn faults(&self) -> &Arc<FaultRegister> {
        &self.faults
    }

    pub fn notify(&self, event: &RefsChanged) {
        if event.is_empty() {
            return;
        }
        let listeners = self.listeners.read().clone();
        for listener in listeners {
            if let Err(e) = listener.refs_changed(event) {
                self.faults.record("bus", format!("ref listener failed: {e}"));
            }
        }
    }
}

impl std::fmt::Debug for NotificationBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationBus")
            .field("listeners", &self.listeners.read().len())
            .finish()
    }
}
