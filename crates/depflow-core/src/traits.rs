//! Contracts of the collaborators surrounding the dependency engine.
//!
//! The engine never talks to the platform's storage, renderer or plugins
//! directly; everything it needs is reached through these traits.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{ChannelId, ChannelInfo, EntityHandle, EntityRef, EventMask, ObjectId, ObjectType, Result, TypeInfo};

/// Resolves entities and structural metadata.
pub trait EntityRegistry: Send + Sync {
    /// Looks up a live entity as seen from `channel`. `None` if it no longer exists.
    fn resolve(&self, kind: ObjectType, id: ObjectId, channel: ChannelId) -> Option<EntityHandle>;

    fn type_info(&self, kind: ObjectType) -> Option<TypeInfo> {
        Some(TypeInfo {
            kind,
            container: matches!(kind, ObjectType::Node | ObjectType::Folder),
            has_variants: kind.has_variants(),
        })
    }

    /// Channel hierarchy information for a node id.
    fn channel(&self, node_id: ChannelId) -> Option<ChannelInfo>;

    /// All language and channel variants of an entity, excluding itself.
    fn variants(&self, kind: ObjectType, id: ObjectId) -> Vec<EntityRef>;
}

/// Read cache of rendered or loaded entities.
pub trait CacheInvalidator: Send + Sync {
    fn invalidate(&self, kind: ObjectType, id: ObjectId);
}

/// The publish queue: where dirted entities are recorded for re-rendering.
pub trait PublishQueue: Send + Sync {
    fn dirt(&self, entity: &EntityHandle, channel: ChannelId, properties: &[String]) -> Result<()>;

    /// Executes a bulk maintenance action, returning the number of affected entities.
    fn maintain(&self, action: &MaintenanceAction) -> Result<u64>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MaintenanceKind {
    /// Mark everything matching for re-rendering.
    Redirty,
    /// Postpone pending publish work.
    Delay,
    /// Re-render even if nothing changed.
    Republish,
    /// Mark pending work as done without rendering.
    MarkPublished,
    /// Move pending dirts into the publish queue.
    Migrate,
}

impl MaintenanceKind {
    pub fn from_mask(mask: EventMask) -> Option<Self> {
        if mask.has(EventMask::MAINTENANCE_PUBLISH) {
            Some(Self::Redirty)
        } else if mask.has(EventMask::MAINTENANCE_DELAY) {
            Some(Self::Delay)
        } else if mask.has(EventMask::MAINTENANCE_REPUBLISH) {
            Some(Self::Republish)
        } else if mask.has(EventMask::MAINTENANCE_MARKPUBLISHED) {
            Some(Self::MarkPublished)
        } else if mask.has(EventMask::MAINTENANCE_MIGRATE) {
            Some(Self::Migrate)
        } else {
            None
        }
    }

    pub fn mask(self) -> EventMask {
        match self {
            Self::Redirty => EventMask::MAINTENANCE_PUBLISH,
            Self::Delay => EventMask::MAINTENANCE_DELAY,
            Self::Republish => EventMask::MAINTENANCE_REPUBLISH,
            Self::MarkPublished => EventMask::MAINTENANCE_MARKPUBLISHED,
            Self::Migrate => EventMask::MAINTENANCE_MIGRATE,
        }
    }
}

/// A bulk action over all entities of a type, optionally scoped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaintenanceAction {
    pub kind: MaintenanceKind,
    pub object_type: Option<ObjectType>,
    pub node: Option<ChannelId>,
    /// Inclusive unix-seconds range on the entity's last modification.
    pub start: Option<i64>,
    pub end: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstantPublishResult {
    Success,
    Skipped,
    Failed(String),
}

/// Synchronous re-publication right after a mutation.
pub trait InstantPublisher: Send + Sync {
    fn publish(&self, entity: &EntityHandle) -> Result<InstantPublishResult>;

    fn cache_enabled(&self) -> bool;

    fn set_cache_enabled(&self, enabled: bool);
}

/// What plugins and sync hooks learn about a mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventNotice {
    pub entity: EntityRef,
    pub properties: Vec<String>,
    pub mask: EventMask,
    pub session: Option<String>,
}

/// External "events service" plugin.
pub trait EventService: Send + Sync {
    fn name(&self) -> &str;

    fn on_event(&self, notice: &EventNotice) -> Result<()>;
}

/// Keeps derived structures (e.g. synchronized folders) in line with a mutation.
pub trait StructureSyncHook: Send + Sync {
    fn on_event(&self, notice: &EventNotice) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PublishedObject {
    pub entity: EntityRef,
    pub node_id: ChannelId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    Running,
    Ok,
    Error,
}

impl fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CheckStatus::Running => "running",
            CheckStatus::Ok => "ok",
            CheckStatus::Error => "error",
        })
    }
}

/// A content repository that receives published entities.
pub trait ContentRepository: Send + Sync {
    fn published_objects(&self, cr_id: ObjectId) -> Result<Vec<PublishedObject>>;

    fn remove(&self, cr_id: ObjectId, object: &PublishedObject) -> Result<()>;

    fn set_check_status(&self, cr_id: ObjectId, status: CheckStatus, report: &str) -> Result<()>;

    /// Nodes whose content is published into this repository.
    fn nodes(&self, cr_id: ObjectId) -> Result<Vec<ChannelId>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maintenance_kind_round_trips_through_mask() {
        for kind in [
            MaintenanceKind::Redirty,
            MaintenanceKind::Delay,
            MaintenanceKind::Republish,
            MaintenanceKind::MarkPublished,
            MaintenanceKind::Migrate,
        ] {
            assert_eq!(MaintenanceKind::from_mask(kind.mask()), Some(kind));
        }
        assert_eq!(MaintenanceKind::from_mask(EventMask::UPDATE), None);
    }
}
