use depflow_core::{DepflowError, Result};
use parking_lot::Mutex;
use sled::IVec;
use std::collections::BTreeSet;
use std::path::Path;
use tracing::info;

use crate::entry::{QueueEntry, QueueEntryId, QueueRow};
use crate::store::{select_claimable, QueueFilter, QueueStore};

const QUEUE_TREE: &str = "queue";

/// Queue entries in a sled tree keyed by big-endian id, so iteration order is
/// insertion order.
///
/// Claims live in memory only: sled holds the database open for one process,
/// and entries claimed when that process died are handed out again on reopen.
pub struct SledQueueStore {
    db: sled::Db,
    entries: sled::Tree,
    claimed: Mutex<BTreeSet<QueueEntryId>>,
}

impl SledQueueStore {
    pub fn open(path: &Path) -> Result<Self> {
        let db = sled::open(path)
            .map_err(|e| DepflowError::persistence(format!("opening {}", path.display()), e))?;
        Self::with_db(db)
    }

    pub fn with_db(db: sled::Db) -> Result<Self> {
        let entries = db
            .open_tree(QUEUE_TREE)
            .map_err(|e| DepflowError::persistence("opening queue tree", e))?;
        info!(entries = entries.len(), "Opened sled queue store");
        Ok(Self {
            db,
            entries,
            claimed: Mutex::new(BTreeSet::new()),
        })
    }

    fn key(id: QueueEntryId) -> IVec {
        IVec::from(&id.to_be_bytes()[..])
    }

    fn decode(value: &[u8]) -> Result<QueueEntry> {
        let row: QueueRow = serde_json::from_slice(value)?;
        QueueEntry::from_row(&row)
    }

    fn write(&self, entry: &QueueEntry) -> Result<()> {
        let id = entry
            .id
            .ok_or_else(|| DepflowError::InvalidOperation("queue entry without id".to_string()))?;
        self.entries
            .insert(Self::key(id), serde_json::to_vec(&entry.to_row())?)
            .map_err(|e| DepflowError::persistence("writing queue entry", e))?;
        Ok(())
    }

    fn scan(&self) -> impl Iterator<Item = Result<QueueEntry>> + '_ {
        self.entries.iter().map(|item| {
            let (_, value) = item.map_err(|e| DepflowError::persistence("scanning queue", e))?;
            Self::decode(&value)
        })
    }

    pub fn flush(&self) -> Result<()> {
        self.entries
            .flush()
            .map_err(|e| DepflowError::persistence("flushing queue", e))?;
        Ok(())
    }
}

impl QueueStore for SledQueueStore {
    fn append(&self, mut entry: QueueEntry) -> Result<QueueEntryId> {
        let id = self
            .db
            .generate_id()
            .map_err(|e| DepflowError::persistence("allocating queue id", e))?
            + 1;
        entry.id = Some(id);
        self.write(&entry)?;
        Ok(id)
    }

    fn next_pending(&self) -> Result<Option<QueueEntry>> {
        for entry in self.scan() {
            let entry = entry?;
            if !entry.failed {
                return Ok(Some(entry));
            }
        }
        Ok(None)
    }

    fn claim_next(&self) -> Result<Option<QueueEntry>> {
        let mut claimed = self.claimed.lock();
        let next = select_claimable(self.scan(), &claimed)?;
        if let Some(entry) = &next {
            if let (Some(id), false) = (entry.id, entry.is_blocker()) {
                claimed.insert(id);
            }
        }
        Ok(next)
    }

    fn release(&self, id: QueueEntryId) -> Result<()> {
        self.claimed.lock().remove(&id);
        Ok(())
    }

    fn get(&self, id: QueueEntryId) -> Result<Option<QueueEntry>> {
        self.entries
            .get(Self::key(id))
            .map_err(|e| DepflowError::persistence("reading queue entry", e))?
            .map(|value| Self::decode(&value))
            .transpose()
    }

    fn list(&self, filter: &QueueFilter) -> Result<Vec<QueueEntry>> {
        let mut out = Vec::new();
        for entry in self.scan() {
            let entry = entry?;
            if filter.matches(&entry) {
                out.push(entry);
                if filter.limit.is_some_and(|limit| out.len() >= limit) {
                    break;
                }
            }
        }
        Ok(out)
    }

    fn remove(&self, id: QueueEntryId) -> Result<bool> {
        self.claimed.lock().remove(&id);
        Ok(self
            .entries
            .remove(Self::key(id))
            .map_err(|e| DepflowError::persistence("removing queue entry", e))?
            .is_some())
    }

    fn mark_failed(&self, id: QueueEntryId, reason: &str) -> Result<()> {
        let mut entry = self
            .get(id)?
            .ok_or_else(|| DepflowError::NotFound(format!("queue entry {}", id)))?;
        entry.failed = true;
        entry.fail_reason = Some(reason.to_string());
        self.write(&entry)?;
        self.claimed.lock().remove(&id);
        Ok(())
    }

    fn delete(&self, filter: &QueueFilter) -> Result<usize> {
        let mut batch = sled::Batch::default();
        let mut count = 0;
        for entry in self.scan() {
            let entry = entry?;
            if let (true, Some(id)) = (filter.matches(&entry), entry.id) {
                batch.remove(Self::key(id));
                count += 1;
            }
        }
        self.entries
            .apply_batch(batch)
            .map_err(|e| DepflowError::persistence("deleting queue entries", e))?;
        Ok(count)
    }

    fn count(&self, filter: &QueueFilter) -> Result<usize> {
        let mut count = 0;
        for entry in self.scan() {
            if filter.matches(&entry?) {
                count += 1;
            }
        }
        Ok(count)
    }
}
