use dashmap::DashMap;

use crate::traits::EntityRegistry;
use crate::types::{ChannelId, ChannelInfo, EntityHandle, EntityRef, ObjectId, ObjectType};

/// In-memory entity registry.
///
/// Entities are stored per channel; a lookup for a channel falls back to the
/// channel's master and finally to the master scope (`0`), mirroring how
/// channel variants inherit from their master objects.
#[derive(Debug, Default)]
pub struct StaticRegistry {
    entities: DashMap<(ObjectType, ObjectId, ChannelId), EntityHandle>,
    channels: DashMap<ChannelId, ChannelInfo>,
}

impl StaticRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `entity` under its own channel id.
    pub fn insert(&self, entity: EntityHandle) {
        let key = (entity.kind.canonical(), entity.id, entity.channel_id);
        self.entities.insert(key, entity);
    }

    pub fn remove(&self, kind: ObjectType, id: ObjectId, channel: ChannelId) -> Option<EntityHandle> {
        self.entities
            .remove(&(kind.canonical(), id, channel))
            .map(|(_, entity)| entity)
    }

    pub fn add_master_node(&self, id: ChannelId) {
        self.channels.insert(id, ChannelInfo { id, master: None });
    }

    pub fn add_channel(&self, id: ChannelId, master: ChannelId) {
        self.channels.insert(
            id,
            ChannelInfo {
                id,
                master: Some(master),
            },
        );
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

impl EntityRegistry for StaticRegistry {
    fn resolve(&self, kind: ObjectType, id: ObjectId, channel: ChannelId) -> Option<EntityHandle> {
        let kind = kind.canonical();
        let mut current = Some(channel);
        // Bounded by the number of registered channels; guards against cyclic master links.
        let mut hops = self.channels.len() + 1;
        while let Some(scope) = current {
            if let Some(found) = self.entities.get(&(kind, id, scope)) {
                return Some(found.clone());
            }
            if scope == 0 || hops == 0 {
                break;
            }
            hops -= 1;
            current = Some(self.channels.get(&scope).and_then(|c| c.master).unwrap_or(0));
        }
        None
    }

    fn channel(&self, node_id: ChannelId) -> Option<ChannelInfo> {
        self.channels.get(&node_id).map(|c| *c)
    }

    fn variants(&self, kind: ObjectType, id: ObjectId) -> Vec<EntityRef> {
        let kind = kind.canonical();
        let mut out: Vec<EntityRef> = self
            .entities
            .iter()
            .filter(|e| e.key().0 == kind && e.key().1 == id)
            .flat_map(|e| e.value().variants.clone())
            .filter(|v| !(v.kind.canonical() == kind && v.id == id))
            .collect();
        out.sort();
        out.dedup();
        out
    }
}
