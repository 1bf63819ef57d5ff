use depflow_core::{DependencyObject, DepflowError, EventMask, ObjectId, ObjectType, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::dependency::{DependencyId, DependencyKey};

/// One persisted dependency edge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyRow {
    pub id: Option<DependencyId>,
    /// Modifying object and element.
    pub source: DependencyObject,
    /// Modifying property.
    pub source_property: Option<String>,
    pub dependent: DependencyObject,
    /// Comma separated channel ids, `"0"` for master.
    pub dependent_channels: String,
    pub event_mask: EventMask,
    /// Condensed or structured dependent-property encoding.
    pub dependent_properties: Option<String>,
}

impl DependencyRow {
    pub fn key(&self) -> DependencyKey {
        DependencyKey {
            source: self.source,
            source_property: self.source_property.clone(),
            dependent: self.dependent,
        }
    }
}

/// Match on the object slot of a row side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectMatch {
    Any,
    /// Type only, any id.
    Class(ObjectType),
    Instance(ObjectType, ObjectId),
    /// Null-aware equality: `None` only matches a null column.
    Exact(Option<ObjectType>, Option<ObjectId>),
}

impl ObjectMatch {
    pub fn matches(&self, object: &DependencyObject) -> bool {
        match *self {
            ObjectMatch::Any => true,
            ObjectMatch::Class(kind) => object.object_type() == Some(kind.canonical()),
            ObjectMatch::Instance(kind, id) => {
                object.object_type() == Some(kind.canonical()) && object.object_id() == Some(id)
            }
            ObjectMatch::Exact(kind, id) => {
                object.object_type() == kind.map(ObjectType::canonical) && object.object_id() == id
            }
        }
    }
}

/// Match on the element slot of the source side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementMatch {
    Any,
    /// Row has no element.
    Absent,
    /// Element of this class (any id), or no element at all.
    ClassOrNull(ObjectType),
    Instance(ObjectType, ObjectId),
}

impl ElementMatch {
    pub fn matches(&self, object: &DependencyObject) -> bool {
        match *self {
            ElementMatch::Any => true,
            ElementMatch::Absent => object.element_type().is_none(),
            ElementMatch::ClassOrNull(kind) => match object.element_type() {
                None => true,
                Some(t) => t == kind.canonical(),
            },
            ElementMatch::Instance(kind, id) => {
                object.element_type() == Some(kind.canonical()) && object.element_id() == Some(id)
            }
        }
    }
}

/// Three-valued filter on the source property.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum PropertyFilter {
    #[default]
    Any,
    /// Only rows without a source property.
    AbsentOnly,
    In(Vec<String>),
}

impl PropertyFilter {
    /// `None` means any, an empty list means property-less rows only.
    pub fn from_properties(properties: Option<&[String]>) -> Self {
        match properties {
            None => PropertyFilter::Any,
            Some([]) => PropertyFilter::AbsentOnly,
            Some(list) => PropertyFilter::In(list.to_vec()),
        }
    }

    pub fn matches(&self, property: Option<&str>) -> bool {
        match self {
            PropertyFilter::Any => true,
            PropertyFilter::AbsentOnly => property.is_none(),
            PropertyFilter::In(list) => property.is_some_and(|p| list.iter().any(|l| l == p)),
        }
    }
}

/// Storage-level predicate over dependency rows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowFilter {
    pub source: ObjectMatch,
    pub source_element: ElementMatch,
    pub source_property: PropertyFilter,
    pub dependent: ObjectMatch,
    /// Row matches when it shares at least one bit; `None` skips the test.
    pub event_mask: Option<EventMask>,
}

impl Default for RowFilter {
    fn default() -> Self {
        Self {
            source: ObjectMatch::Any,
            source_element: ElementMatch::Any,
            source_property: PropertyFilter::Any,
            dependent: ObjectMatch::Any,
            event_mask: None,
        }
    }
}

impl RowFilter {
    pub fn dependent(dependent: ObjectMatch) -> Self {
        Self {
            dependent,
            ..Self::default()
        }
    }

    pub fn matches(&self, row: &DependencyRow) -> bool {
        self.source.matches(&row.source)
            && self.source_element.matches(&row.source)
            && self.source_property.matches(row.source_property.as_deref())
            && self.dependent.matches(&row.dependent)
            && self
                .event_mask
                .map_or(true, |mask| EventMask::is_event(row.event_mask, mask))
    }
}

/// One operation of an atomic write set.
///
/// Updates and deletes carry the row as it was read. The write only applies
/// while the stored row still equals that snapshot.
#[derive(Debug, Clone, PartialEq)]
pub enum DependencyWrite {
    Insert(DependencyRow),
    Update {
        row: DependencyRow,
        expected: Option<DependencyRow>,
    },
    Delete {
        id: DependencyId,
        expected: Option<DependencyRow>,
    },
}

impl DependencyWrite {
    pub fn update(row: DependencyRow, expected: Option<DependencyRow>) -> Self {
        DependencyWrite::Update { row, expected }
    }

    /// Delete checked for existence only.
    pub fn delete(id: DependencyId) -> Self {
        DependencyWrite::Delete { id, expected: None }
    }
}

/// Compare-and-set check of an update or delete against the stored row.
pub(crate) fn check_snapshot(
    id: DependencyId,
    current: Option<&DependencyRow>,
    expected: Option<&DependencyRow>,
) -> Result<()> {
    match (current, expected) {
        (None, _) => Err(DepflowError::Conflict(format!("row {} vanished", id))),
        (Some(current), Some(expected)) if current != expected => Err(DepflowError::Conflict(
            format!("row {} was changed by another writer", id),
        )),
        _ => Ok(()),
    }
}

/// Persistence contract for dependency rows.
///
/// `apply` is atomic: either every write of the set is applied or none is.
/// Writes racing with another writer fail with [`DepflowError::Conflict`]:
/// inserting a key that already has a row, or updating/deleting a row that
/// no longer exists or no longer matches the snapshot the write carries.
pub trait DependencyStore: Send + Sync {
    fn query(&self, filter: &RowFilter) -> Result<Vec<DependencyRow>>;

    /// Returns the ids assigned to the inserts, in write order.
    fn apply(&self, writes: &[DependencyWrite]) -> Result<Vec<DependencyId>>;

    fn delete_matching(&self, filter: &RowFilter) -> Result<usize>;
}

#[derive(Debug, Default)]
struct MemoryState {
    rows: BTreeMap<DependencyId, DependencyRow>,
    next_id: DependencyId,
}

/// In-memory dependency store.
#[derive(Debug, Default)]
pub struct MemoryDependencyStore {
    state: RwLock<MemoryState>,
}

impl MemoryDependencyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.state.read().rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn rows(&self) -> Vec<DependencyRow> {
        self.state.read().rows.values().cloned().collect()
    }

    /// Inserts a row as-is, bypassing the one-row-per-key rule. Used to load
    /// legacy data that still holds duplicate rows.
    pub fn insert_raw(&self, mut row: DependencyRow) -> DependencyId {
        let mut state = self.state.write();
        state.next_id += 1;
        let id = state.next_id;
        row.id = Some(id);
        state.rows.insert(id, row);
        id
    }
}

impl DependencyStore for MemoryDependencyStore {
    fn query(&self, filter: &RowFilter) -> Result<Vec<DependencyRow>> {
        Ok(self
            .state
            .read()
            .rows
            .values()
            .filter(|row| filter.matches(row))
            .cloned()
            .collect())
    }

    fn apply(&self, writes: &[DependencyWrite]) -> Result<Vec<DependencyId>> {
        let mut state = self.state.write();

        // validate the whole set before touching anything
        for write in writes {
            match write {
                DependencyWrite::Insert(row) => {
                    let key = row.key();
                    if state.rows.values().any(|existing| existing.key() == key) {
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
                    check_snapshot(id, state.rows.get(&id), expected.as_ref())?;
                }
                DependencyWrite::Delete { id, expected } => {
                    check_snapshot(*id, state.rows.get(id), expected.as_ref())?;
                }
            }
        }

        let mut inserted = Vec::new();
        for write in writes {
            match write {
                DependencyWrite::Insert(row) => {
                    state.next_id += 1;
                    let id = state.next_id;
                    let mut row = row.clone();
                    row.id = Some(id);
                    state.rows.insert(id, row);
                    inserted.push(id);
                }
                DependencyWrite::Update { row, .. } => {
                    if let Some(id) = row.id {
                        state.rows.insert(id, row.clone());
                    }
                }
                DependencyWrite::Delete { id, .. } => {
                    state.rows.remove(id);
                }
            }
        }
        Ok(inserted)
    }

    fn delete_matching(&self, filter: &RowFilter) -> Result<usize> {
        let mut state = self.state.write();
        let before = state.rows.len();
        state.rows.retain(|_, row| !filter.matches(row));
        Ok(before - state.rows.len())
    }
}
