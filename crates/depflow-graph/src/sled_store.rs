use depflow_core::{DepflowError, Result};
use parking_lot::Mutex;
use sled::{Batch, IVec};
use std::path::Path;
use tracing::{debug, info};

use crate::dependency::DependencyId;
use crate::store::{check_snapshot, DependencyRow, DependencyStore, DependencyWrite, RowFilter};

const ROWS_TREE: &str = "dependencies";

/// Dependency rows in a sled tree, keyed by big-endian row id.
pub struct SledDependencyStore {
    db: sled::Db,
    rows: sled::Tree,
    /// Serialises validation and batch application of write sets.
    write_lock: Mutex<()>,
}

impl SledDependencyStore {
    pub fn open(path: &Path) -> Result<Self> {
        let db = sled::open(path)
            .map_err(|e| DepflowError::persistence(format!("opening {}", path.display()), e))?;
        Self::with_db(db)
    }

    pub fn with_db(db: sled::Db) -> Result<Self> {
        let rows = db
            .open_tree(ROWS_TREE)
            .map_err(|e| DepflowError::persistence("opening dependency tree", e))?;
        info!(rows = rows.len(), "Opened sled dependency store");
        Ok(Self {
            db,
            rows,
            write_lock: Mutex::new(()),
        })
    }

    pub fn flush(&self) -> Result<()> {
        self.rows
            .flush()
            .map_err(|e| DepflowError::persistence("flushing dependency tree", e))?;
        Ok(())
    }

    fn id_to_key(id: DependencyId) -> IVec {
        IVec::from(&id.to_be_bytes()[..])
    }

    fn scan(&self) -> Result<Vec<DependencyRow>> {
        let mut out = Vec::new();
        for item in self.rows.iter() {
            let (_, value) =
                item.map_err(|e| DepflowError::persistence("scanning dependency tree", e))?;
            out.push(serde_json::from_slice(&value)?);
        }
        Ok(out)
    }

    fn get(&self, id: DependencyId) -> Result<Option<DependencyRow>> {
        let value = self
            .rows
            .get(Self::id_to_key(id))
            .map_err(|e| DepflowError::persistence("reading dependency row", e))?;
        match value {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn next_id(&self) -> Result<DependencyId> {
        let id = self
            .db
            .generate_id()
            .map_err(|e| DepflowError::persistence("allocating dependency id", e))?;
        Ok(id + 1)
    }
}

impl DependencyStore for SledDependencyStore {
    fn query(&self, filter: &RowFilter) -> Result<Vec<DependencyRow>> {
        Ok(self
            .scan()?
            .into_iter()
            .filter(|row| filter.matches(row))
            .collect())
    }

    fn apply(&self, writes: &[DependencyWrite]) -> Result<Vec<DependencyId>> {
        let _guard = self.write_lock.lock();

        let existing = self.scan()?;
        for write in writes {
            match write {
                DependencyWrite::Insert(row) => {
                    let key = row.key();
                    if existing.iter().any(|stored| stored.key() == key) {
                        return Err(DepflowError::Conflict(format!(
                            "a row for {} -> {} already exists",
                            row.source, row.dependent
                        )));
                    }
                }
                DependencyWrite::Update { row, expected } => {
                    let id = row.id.ok_or_else(|| {
                        DepflowError::InvalidOperation("update without row id".to_string())
                    })?;
                    check_snapshot(id, self.get(id)?.as_ref(), expected.as_ref())?;
                }
                DependencyWrite::Delete { id, expected } => {
                    check_snapshot(*id, self.get(*id)?.as_ref(), expected.as_ref())?;
                }
            }
        }

        let mut batch = Batch::default();
        let mut inserted = Vec::new();
        for write in writes {
            match write {
                DependencyWrite::Insert(row) => {
                    let id = self.next_id()?;
                    let mut row = row.clone();
                    row.id = Some(id);
                    batch.insert(Self::id_to_key(id), serde_json::to_vec(&row)?);
                    inserted.push(id);
                }
                DependencyWrite::Update { row, .. } => {
                    if let Some(id) = row.id {
                        batch.insert(Self::id_to_key(id), serde_json::to_vec(row)?);
                    }
                }
                DependencyWrite::Delete { id, .. } => batch.remove(Self::id_to_key(*id)),
            }
        }
        self.rows
            .apply_batch(batch)
            .map_err(|e| DepflowError::persistence("applying dependency writes", e))?;
        debug!(writes = writes.len(), inserted = inserted.len(), "Applied dependency writes");
        Ok(inserted)
    }

    fn delete_matching(&self, filter: &RowFilter) -> Result<usize> {
        let _guard = self.write_lock.lock();
        let mut batch = Batch::default();
        let mut count = 0;
        for row in self.scan()? {
            if let (true, Some(id)) = (filter.matches(&row), row.id) {
                batch.remove(Self::id_to_key(id));
                count += 1;
            }
        }
        self.rows
            .apply_batch(batch)
            .map_err(|e| DepflowError::persistence("deleting dependency rows", e))?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ObjectMatch;
    use depflow_core::{DependencyObject, EntityRef, EventMask, ObjectType};
    use tempfile::TempDir;

    fn row(dependent: u32) -> DependencyRow {
        DependencyRow {
            id: None,
            source: DependencyObject::instance(EntityRef::new(ObjectType::Page, 1)),
            source_property: Some("name".into()),
            dependent: DependencyObject::instance(EntityRef::new(ObjectType::Page, dependent)),
            dependent_channels: "0".into(),
            event_mask: EventMask::UPDATE,
            dependent_properties: Some("name".into()),
        }
    }

    #[test]
    fn rows_survive_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let store = SledDependencyStore::open(dir.path()).unwrap();
            let ids = store
                .apply(&[DependencyWrite::Insert(row(2)), DependencyWrite::Insert(row(3))])
                .unwrap();
            assert_eq!(ids.len(), 2);
            assert!(ids[0] < ids[1]);
            store.flush().unwrap();
        }
        let store = SledDependencyStore::open(dir.path()).unwrap();
        assert_eq!(store.query(&RowFilter::default()).unwrap().len(), 2);
    }

    #[test]
    fn duplicate_key_insert_conflicts() {
        let dir = TempDir::new().unwrap();
        let store = SledDependencyStore::open(dir.path()).unwrap();
        store.apply(&[DependencyWrite::Insert(row(2))]).unwrap();

        let err = store.apply(&[DependencyWrite::Insert(row(2))]).unwrap_err();
        assert!(err.is_retryable());
        let err = store.apply(&[DependencyWrite::delete(999)]).unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(store.query(&RowFilter::default()).unwrap().len(), 1);
    }

    #[test]
    fn update_of_changed_row_conflicts() {
        let dir = TempDir::new().unwrap();
        let store = SledDependencyStore::open(dir.path()).unwrap();
        store.apply(&[DependencyWrite::Insert(row(2))]).unwrap();
        let loaded = store.query(&RowFilter::default()).unwrap().remove(0);

        let mut first = loaded.clone();
        first.dependent_channels = "0,4".into();
        store
            .apply(&[DependencyWrite::update(first.clone(), Some(loaded.clone()))])
            .unwrap();

        let mut second = loaded.clone();
        second.dependent_channels = "0,5".into();
        let err = store
            .apply(&[DependencyWrite::update(second, Some(loaded))])
            .unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(store.query(&RowFilter::default()).unwrap(), vec![first]);
    }

    #[test]
    fn delete_matching_by_dependent() {
        let dir = TempDir::new().unwrap();
        let store = SledDependencyStore::open(dir.path()).unwrap();
        store
            .apply(&[DependencyWrite::Insert(row(2)), DependencyWrite::Insert(row(3))])
            .unwrap();
        let filter = RowFilter::dependent(ObjectMatch::Instance(ObjectType::Page, 3));
        assert_eq!(store.delete_matching(&filter).unwrap(), 1);
        assert_eq!(store.query(&RowFilter::default()).unwrap().len(), 1);
    }
}
