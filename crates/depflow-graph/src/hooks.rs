use depflow_core::{
    CacheInvalidator, ChannelId, EntityHandle, EventMask, ObjectType, PublishQueue, Result,
};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

use crate::context::PropagationContext;

/// What the walk does after a hook handled a triggered dependent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookOutcome {
    Stop,
    /// Propagate onward from the dependent with this mask.
    Cascade(EventMask),
}

/// A dependent reached by the walk.
#[derive(Debug)]
pub struct DirtRequest<'a> {
    pub entity: &'a EntityHandle,
    pub properties: &'a [String],
    pub mask: EventMask,
    pub depth: usize,
    pub channel: ChannelId,
}

/// Side-effect targets of a dirt.
#[derive(Clone, Copy)]
pub struct DirtServices<'a> {
    pub cache: &'a dyn CacheInvalidator,
    pub publish_queue: &'a dyn PublishQueue,
}

/// Reaction of an entity kind to being triggered through a dependency.
pub trait TriggerHook: Send + Sync {
    fn on_trigger(
        &self,
        ctx: &mut PropagationContext,
        services: &DirtServices<'_>,
        request: &DirtRequest<'_>,
    ) -> Result<HookOutcome>;
}

/// Counts and records the dirt. Outside simulation the cache entry is
/// dropped and the entity is handed to the publish queue.
pub fn dirt(
    ctx: &mut PropagationContext,
    services: &DirtServices<'_>,
    request: &DirtRequest<'_>,
) -> Result<bool> {
    let entity = request.entity;
    if entity.placeholder {
        debug!(entity = %entity.entity_ref(), "Dependent no longer exists, not dirting");
        return Ok(false);
    }

    ctx.record_dirt(entity.entity_ref(), request.channel, request.properties);
    if ctx.is_simulation() {
        return Ok(true);
    }

    services.cache.invalidate(entity.kind, entity.id);
    services
        .publish_queue
        .dirt(entity, request.channel, request.properties)?;
    debug!(
        entity = %entity.entity_ref(),
        channel = request.channel,
        depth = request.depth,
        "Dirted dependent"
    );
    Ok(true)
}

/// Dirts the dependent and stops.
#[derive(Debug, Default, Clone, Copy)]
pub struct DirtHook;

impl TriggerHook for DirtHook {
    fn on_trigger(
        &self,
        ctx: &mut PropagationContext,
        services: &DirtServices<'_>,
        request: &DirtRequest<'_>,
    ) -> Result<HookOutcome> {
        dirt(ctx, services, request)?;
        Ok(HookOutcome::Stop)
    }
}

/// Dirts the dependent, then triggers its own dependencies.
#[derive(Debug, Default, Clone, Copy)]
pub struct CascadeHook {
    /// Mask for the onward pass; the incoming mask when unset.
    pub mask: Option<EventMask>,
}

impl TriggerHook for CascadeHook {
    fn on_trigger(
        &self,
        ctx: &mut PropagationContext,
        services: &DirtServices<'_>,
        request: &DirtRequest<'_>,
    ) -> Result<HookOutcome> {
        if dirt(ctx, services, request)? {
            Ok(HookOutcome::Cascade(self.mask.unwrap_or(request.mask)))
        } else {
            Ok(HookOutcome::Stop)
        }
    }
}

/// Trigger hooks by entity kind. Kinds without a registration use [`DirtHook`].
#[derive(Clone)]
pub struct HookRegistry {
    hooks: HashMap<ObjectType, Arc<dyn TriggerHook>>,
    fallback: Arc<dyn TriggerHook>,
}

impl Default for HookRegistry {
    fn default() -> Self {
        Self {
            hooks: HashMap::new(),
            fallback: Arc::new(DirtHook),
        }
    }
}

impl fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut kinds: Vec<_> = self.hooks.keys().collect();
        kinds.sort();
        f.debug_struct("HookRegistry").field("kinds", &kinds).finish()
    }
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Folders and nodes re-propagate as structural parents of what they list.
    pub fn standard() -> Self {
        let mut registry = Self::new();
        registry.register(ObjectType::Folder, Arc::new(CascadeHook::default()));
        registry.register(ObjectType::Node, Arc::new(CascadeHook::default()));
        registry
    }

    pub fn register(&mut self, kind: ObjectType, hook: Arc<dyn TriggerHook>) {
        self.hooks.insert(kind.canonical(), hook);
    }

    pub fn hook_for(&self, kind: ObjectType) -> Arc<dyn TriggerHook> {
        self.hooks
            .get(&kind.canonical())
            .cloned()
            .unwrap_or_else(|| Arc::clone(&self.fallback))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use depflow_core::{MaintenanceAction, ObjectId, PropagationConfig};
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        invalidated: Mutex<Vec<(ObjectType, ObjectId)>>,
        dirted: Mutex<Vec<(ObjectId, ChannelId)>>,
    }

    impl CacheInvalidator for Recorder {
        fn invalidate(&self, kind: ObjectType, id: ObjectId) {
            self.invalidated.lock().push((kind, id));
        }
    }

    impl PublishQueue for Recorder {
        fn dirt(&self, entity: &EntityHandle, channel: ChannelId, _: &[String]) -> Result<()> {
            self.dirted.lock().push((entity.id, channel));
            Ok(())
        }

        fn maintain(&self, _: &MaintenanceAction) -> Result<u64> {
            Ok(0)
        }
    }

    fn request(entity: &EntityHandle) -> DirtRequest<'_> {
        DirtRequest {
            entity,
            properties: &[],
            mask: EventMask::UPDATE,
            depth: 1,
            channel: 0,
        }
    }

    #[test]
    fn dirt_hook_invalidates_and_queues() {
        let recorder = Recorder::default();
        let services = DirtServices {
            cache: &recorder,
            publish_queue: &recorder,
        };
        let mut ctx = PropagationContext::new(&PropagationConfig::default(), false);
        let page = EntityHandle::new(ObjectType::Page, 4);

        let outcome = DirtHook.on_trigger(&mut ctx, &services, &request(&page)).unwrap();
        assert_eq!(outcome, HookOutcome::Stop);
        assert_eq!(ctx.dirt_count(), 1);
        assert_eq!(*recorder.invalidated.lock(), vec![(ObjectType::Page, 4)]);
        assert_eq!(*recorder.dirted.lock(), vec![(4, 0)]);
    }

    #[test]
    fn simulation_has_no_side_effects() {
        let recorder = Recorder::default();
        let services = DirtServices {
            cache: &recorder,
            publish_queue: &recorder,
        };
        let mut ctx = PropagationContext::new(&PropagationConfig::default(), true);
        let folder = EntityHandle::new(ObjectType::Folder, 2);

        let outcome = CascadeHook::default()
            .on_trigger(&mut ctx, &services, &request(&folder))
            .unwrap();
        assert_eq!(outcome, HookOutcome::Cascade(EventMask::UPDATE));
        assert_eq!(ctx.simulated().len(), 1);
        assert!(recorder.invalidated.lock().is_empty());
        assert!(recorder.dirted.lock().is_empty());
    }

    #[test]
    fn placeholders_are_not_dirted() {
        let recorder = Recorder::default();
        let services = DirtServices {
            cache: &recorder,
            publish_queue: &recorder,
        };
        let mut ctx = PropagationContext::new(&PropagationConfig::default(), false);
        let gone = EntityHandle::placeholder(ObjectType::Folder, 9);

        let outcome = CascadeHook::default()
            .on_trigger(&mut ctx, &services, &request(&gone))
            .unwrap();
        assert_eq!(outcome, HookOutcome::Stop);
        assert_eq!(ctx.dirt_count(), 0);
    }

    #[test]
    fn registry_falls_back_and_canonicalizes() {
        let mut registry = HookRegistry::new();
        registry.register(
            ObjectType::Image,
            Arc::new(CascadeHook {
                mask: Some(EventMask::DIRT),
            }),
        );
        let recorder = Recorder::default();
        let services = DirtServices {
            cache: &recorder,
            publish_queue: &recorder,
        };
        let mut ctx = PropagationContext::new(&PropagationConfig::default(), false);
        let file = EntityHandle::new(ObjectType::File, 1);

        let outcome = registry
            .hook_for(ObjectType::File)
            .on_trigger(&mut ctx, &services, &request(&file))
            .unwrap();
        assert_eq!(outcome, HookOutcome::Cascade(EventMask::DIRT));

        let page = EntityHandle::new(ObjectType::Page, 1);
        let outcome = registry
            .hook_for(ObjectType::Page)
            .on_trigger(&mut ctx, &services, &request(&page))
            .unwrap();
        assert_eq!(outcome, HookOutcome::Stop);
    }
}
