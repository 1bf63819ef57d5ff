//! Addressable endpoints of dependency edges.
//!
//! A [`DependencyObject`] names an object slot (class and optional id) and an
//! optional element slot inside it, e.g. a content tag inside a page. Image
//! classes are rewritten to file classes on construction so that image and
//! file dependencies have one identity.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

use crate::traits::EntityRegistry;
use crate::types::{ChannelId, EntityHandle, EntityRef, ObjectId, ObjectType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DependencyObject {
    object_type: Option<ObjectType>,
    object_id: Option<ObjectId>,
    element_type: Option<ObjectType>,
    element_id: Option<ObjectId>,
}

impl DependencyObject {
    /// Full constructor; all other constructors funnel through here.
    pub fn new(
        object_type: Option<ObjectType>,
        object_id: Option<ObjectId>,
        element_type: Option<ObjectType>,
        element_id: Option<ObjectId>,
    ) -> Self {
        Self {
            object_type: object_type.map(ObjectType::canonical),
            object_id,
            element_type: element_type.map(ObjectType::canonical),
            element_id,
        }
    }

    pub fn class(object_type: ObjectType) -> Self {
        Self::new(Some(object_type), None, None, None)
    }

    pub fn instance(entity: EntityRef) -> Self {
        Self::new(Some(entity.kind), Some(entity.id), None, None)
    }

    pub fn class_with_element_class(object_type: ObjectType, element_type: ObjectType) -> Self {
        Self::new(Some(object_type), None, Some(element_type), None)
    }

    pub fn class_with_element(object_type: ObjectType, element: EntityRef) -> Self {
        Self::new(Some(object_type), None, Some(element.kind), Some(element.id))
    }

    pub fn instance_with_element(entity: EntityRef, element: EntityRef) -> Self {
        Self::new(
            Some(entity.kind),
            Some(entity.id),
            Some(element.kind),
            Some(element.id),
        )
    }

    pub fn object_type(&self) -> Option<ObjectType> {
        self.object_type
    }

    pub fn object_id(&self) -> Option<ObjectId> {
        self.object_id
    }

    pub fn element_type(&self) -> Option<ObjectType> {
        self.element_type
    }

    pub fn element_id(&self) -> Option<ObjectId> {
        self.element_id
    }

    pub fn has_element(&self) -> bool {
        self.element_type.is_some()
    }

    /// The same object without its element slot.
    pub fn without_element(&self) -> Self {
        Self::new(self.object_type, self.object_id, None, None)
    }

    pub fn object_ref(&self) -> Option<EntityRef> {
        Some(EntityRef::new(self.object_type?, self.object_id?))
    }

    pub fn element_ref(&self) -> Option<EntityRef> {
        Some(EntityRef::new(self.element_type?, self.element_id?))
    }

    /// Resolves the object through the registry. A vanished entity yields a
    /// placeholder so traversal can continue on deleted objects.
    pub fn get_object(
        &self,
        registry: &dyn EntityRegistry,
        channel: ChannelId,
    ) -> Option<EntityHandle> {
        let target = self.object_ref()?;
        Some(resolve_or_placeholder(registry, target, channel))
    }

    pub fn get_element(
        &self,
        registry: &dyn EntityRegistry,
        channel: ChannelId,
    ) -> Option<EntityHandle> {
        let target = self.element_ref()?;
        Some(resolve_or_placeholder(registry, target, channel))
    }
}

fn resolve_or_placeholder(
    registry: &dyn EntityRegistry,
    target: EntityRef,
    channel: ChannelId,
) -> EntityHandle {
    registry
        .resolve(target.kind, target.id, channel)
        .unwrap_or_else(|| EntityHandle::placeholder(target.kind, target.id))
}

impl From<EntityRef> for DependencyObject {
    fn from(entity: EntityRef) -> Self {
        Self::instance(entity)
    }
}

impl From<&EntityHandle> for DependencyObject {
    fn from(entity: &EntityHandle) -> Self {
        Self::instance(entity.entity_ref())
    }
}

impl Ord for DependencyObject {
    // `None` sorts before any class, ids compare numerically.
    fn cmp(&self, other: &Self) -> Ordering {
        self.object_type
            .cmp(&other.object_type)
            .then_with(|| self.object_id.cmp(&other.object_id))
            .then_with(|| self.element_type.cmp(&other.element_type))
            .then_with(|| self.element_id.cmp(&other.element_id))
    }
}

impl PartialOrd for DependencyObject {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for DependencyObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn slot(f: &mut fmt::Formatter<'_>, t: Option<ObjectType>, id: Option<ObjectId>) -> fmt::Result {
            match (t, id) {
                (Some(t), Some(id)) => write!(f, "{}({})", t, id),
                (Some(t), None) => write!(f, "{}", t),
                (None, Some(id)) => write!(f, "?({})", id),
                (None, None) => f.write_str("-"),
            }
        }
        slot(f, self.object_type, self.object_id)?;
        if self.has_element() {
            f.write_str("/")?;
            slot(f, self.element_type, self.element_id)?;
        }
        Ok(())
    }
}
