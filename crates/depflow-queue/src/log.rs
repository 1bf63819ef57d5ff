use depflow_core::Result;
use metrics::counter;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, info};

use crate::entry::{QueueEntry, QueueEntryId};
use crate::store::QueueStore;

/// Single-writer outbox in front of a [`QueueStore`].
///
/// Appends are serialized so ids are assigned in commit order. Every append
/// wakes the consumer.
pub struct EventLog {
    store: Arc<dyn QueueStore>,
    append_lock: Mutex<()>,
    notify: Arc<Notify>,
}

impl EventLog {
    pub fn new(store: Arc<dyn QueueStore>) -> Self {
        Self {
            store,
            append_lock: Mutex::new(()),
            notify: Arc::new(Notify::new()),
        }
    }

    pub fn store(&self) -> &Arc<dyn QueueStore> {
        &self.store
    }

    /// Woken whenever something is appended or a blocker is released.
    pub fn notifier(&self) -> Arc<Notify> {
        self.notify.clone()
    }

    pub fn append(&self, entry: QueueEntry) -> Result<QueueEntryId> {
        let id = {
            let _guard = self.append_lock.lock();
            self.store.append(entry)?
        };
        counter!("depflow_queue_entries_appended").increment(1);
        debug!(id, "Appended queue entry");
        self.notify.notify_one();
        Ok(id)
    }

    /// Marks the point up to which a publish run must wait for propagation.
    pub fn publish_barrier(&self) -> Result<QueueEntryId> {
        let id = self.append(QueueEntry::publish_marker())?;
        info!(id, "Publish marker queued");
        Ok(id)
    }

    /// Holds back consumption of everything queued after this point.
    pub fn append_blocker(&self) -> Result<QueueEntryId> {
        let id = self.append(QueueEntry::blocker_marker())?;
        info!(id, "Queue blocker added");
        Ok(id)
    }

    pub fn release_blocker(&self, id: QueueEntryId) -> Result<bool> {
        let removed = self.store.remove(id)?;
        if removed {
            info!(id, "Queue blocker released");
            self.notify.notify_one();
        }
        Ok(removed)
    }
}
