use depflow_core::{DepflowError, ObjectType, Result};
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};

use crate::entry::{QueueEntry, QueueEntryId, QueueEntryKind};

/// Selection of queue entries. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueFilter {
    pub failed: Option<bool>,
    pub obj_type: Option<ObjectType>,
    pub limit: Option<usize>,
}

impl QueueFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn pending() -> Self {
        Self {
            failed: Some(false),
            ..Self::default()
        }
    }

    pub fn failed() -> Self {
        Self {
            failed: Some(true),
            ..Self::default()
        }
    }

    pub fn of_type(mut self, kind: ObjectType) -> Self {
        self.obj_type = Some(kind);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, entry: &QueueEntry) -> bool {
        self.failed.map_or(true, |failed| entry.failed == failed)
            && self
                .obj_type
                .map_or(true, |kind| entry.obj_type.map(ObjectType::canonical) == Some(kind.canonical()))
    }
}

/// Picks the entry `claim_next` hands out from pending entries in id order.
///
/// Entries claimed by another consumer are skipped. A blocker is returned
/// without being claimed and hides everything behind it. A publish marker
/// is only claimable once no earlier entry is in flight.
pub(crate) fn select_claimable<I>(
    pending: I,
    claimed: &BTreeSet<QueueEntryId>,
) -> Result<Option<QueueEntry>>
where
    I: IntoIterator<Item = Result<QueueEntry>>,
{
    let mut in_flight = false;
    for entry in pending {
        let entry = entry?;
        if entry.failed {
            continue;
        }
        if entry.id.is_some_and(|id| claimed.contains(&id)) {
            in_flight = true;
            continue;
        }
        return Ok(match entry.classify().ok() {
            Some(QueueEntryKind::PublishMarker) if in_flight => None,
            _ => Some(entry),
        });
    }
    Ok(None)
}

/// Durable, ordered storage of queue entries.
///
/// Ids are assigned by `append` and strictly increase; listing is oldest
/// first. Consumers take entries with `claim_next`; a claimed entry is not
/// handed out again until it is removed, marked failed or released.
pub trait QueueStore: Send + Sync {
    fn append(&self, entry: QueueEntry) -> Result<QueueEntryId>;

    /// Oldest entry that has not failed, claimed or not.
    fn next_pending(&self) -> Result<Option<QueueEntry>>;

    /// Atomically claims the oldest pending entry no other consumer holds.
    /// Blocker markers are returned unclaimed.
    fn claim_next(&self) -> Result<Option<QueueEntry>>;

    /// Gives a claimed entry back without consuming it.
    fn release(&self, id: QueueEntryId) -> Result<()>;

    fn get(&self, id: QueueEntryId) -> Result<Option<QueueEntry>>;

    fn list(&self, filter: &QueueFilter) -> Result<Vec<QueueEntry>>;

    /// Removes a consumed entry and its claim. Returns whether it existed.
    fn remove(&self, id: QueueEntryId) -> Result<bool>;

    /// Marks the entry failed and drops its claim.
    fn mark_failed(&self, id: QueueEntryId, reason: &str) -> Result<()>;

    /// Deletes the matching entries, ignoring the filter's limit.
    fn delete(&self, filter: &QueueFilter) -> Result<usize>;

    fn count(&self, filter: &QueueFilter) -> Result<usize>;
}

#[derive(Debug, Default)]
struct MemoryQueue {
    entries: BTreeMap<QueueEntryId, QueueEntry>,
    claimed: BTreeSet<QueueEntryId>,
    last_id: QueueEntryId,
}

#[derive(Debug, Default)]
pub struct MemoryQueueStore {
    state: RwLock<MemoryQueue>,
}

impl MemoryQueueStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl QueueStore for MemoryQueueStore {
    fn append(&self, mut entry: QueueEntry) -> Result<QueueEntryId> {
        let mut state = self.state.write();
        state.last_id += 1;
        let id = state.last_id;
        entry.id = Some(id);
        state.entries.insert(id, entry);
        Ok(id)
    }

    fn next_pending(&self) -> Result<Option<QueueEntry>> {
        Ok(self
            .state
            .read()
            .entries
            .values()
            .find(|entry| !entry.failed)
            .cloned())
    }

    fn claim_next(&self) -> Result<Option<QueueEntry>> {
        let mut state = self.state.write();
        let state = &mut *state;
        let next = select_claimable(state.entries.values().cloned().map(Ok), &state.claimed)?;
        if let Some(entry) = &next {
            if let (Some(id), false) = (entry.id, entry.is_blocker()) {
                state.claimed.insert(id);
            }
        }
        Ok(next)
    }

    fn release(&self, id: QueueEntryId) -> Result<()> {
        self.state.write().claimed.remove(&id);
        Ok(())
    }

    fn get(&self, id: QueueEntryId) -> Result<Option<QueueEntry>> {
        Ok(self.state.read().entries.get(&id).cloned())
    }

    fn list(&self, filter: &QueueFilter) -> Result<Vec<QueueEntry>> {
        let state = self.state.read();
        let matching = state.entries.values().filter(|entry| filter.matches(entry));
        Ok(match filter.limit {
            Some(limit) => matching.take(limit).cloned().collect(),
            None => matching.cloned().collect(),
        })
    }

    fn remove(&self, id: QueueEntryId) -> Result<bool> {
        let mut state = self.state.write();
        state.claimed.remove(&id);
        Ok(state.entries.remove(&id).is_some())
    }

    fn mark_failed(&self, id: QueueEntryId, reason: &str) -> Result<()> {
        let mut state = self.state.write();
        state.claimed.remove(&id);
        let entry = state
            .entries
            .get_mut(&id)
            .ok_or_else(|| DepflowError::NotFound(format!("queue entry {}", id)))?;
        entry.failed = true;
        entry.fail_reason = Some(reason.to_string());
        Ok(())
    }

    fn delete(&self, filter: &QueueFilter) -> Result<usize> {
        let mut state = self.state.write();
        let before = state.entries.len();
        state.entries.retain(|_, entry| !filter.matches(entry));
        let MemoryQueue { entries, claimed, .. } = &mut *state;
        claimed.retain(|id| entries.contains_key(id));
        Ok(before - entries.len())
    }

    fn count(&self, filter: &QueueFilter) -> Result<usize> {
        Ok(self
            .state
            .read()
            .entries
            .values()
            .filter(|entry| filter.matches(entry))
            .count())
    }
}
