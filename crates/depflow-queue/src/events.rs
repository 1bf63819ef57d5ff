//! The synchronous mutation entry point.
//!
//! Every mutation of a content entity passes through [`Events::trigger`]:
//! read caches are invalidated right away, the dirt event is queued for the
//! consumer, plugins are notified and, when enabled, the entity is published
//! immediately.

use depflow_core::{
    CacheInvalidator, EntityHandle, EntityRef, EntityRegistry, EventMask, EventNotice,
    EventService, EventsConfig, InstantPublishResult, InstantPublisher, ObjectType, Result,
    StructureSyncHook,
};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::entry::{QueueEntry, QueueEntryId};
use crate::log::EventLog;

/// Properties whose change alters an entity's visibility in its parents.
const STATUS_PROPERTIES: [&str; 3] = ["online", "status", "published"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerOutcome {
    pub entry_id: QueueEntryId,
    /// Entities whose cached state was dropped.
    pub invalidated: Vec<EntityRef>,
    /// Non-fatal problems the caller may want to show to the user.
    pub messages: Vec<String>,
}

pub struct Events {
    log: Arc<EventLog>,
    registry: Arc<dyn EntityRegistry>,
    cache: Arc<dyn CacheInvalidator>,
    sync_hooks: Vec<Arc<dyn StructureSyncHook>>,
    services: Vec<Arc<dyn EventService>>,
    instant_publisher: Option<Arc<dyn InstantPublisher>>,
    config: EventsConfig,
}

impl Events {
    pub fn new(
        log: Arc<EventLog>,
        registry: Arc<dyn EntityRegistry>,
        cache: Arc<dyn CacheInvalidator>,
        config: &EventsConfig,
    ) -> Self {
        Self {
            log,
            registry,
            cache,
            sync_hooks: Vec::new(),
            services: Vec::new(),
            instant_publisher: None,
            config: config.clone(),
        }
    }

    pub fn with_sync_hook(mut self, hook: Arc<dyn StructureSyncHook>) -> Self {
        self.sync_hooks.push(hook);
        self
    }

    pub fn with_event_service(mut self, service: Arc<dyn EventService>) -> Self {
        self.services.push(service);
        self
    }

    pub fn with_instant_publisher(mut self, publisher: Arc<dyn InstantPublisher>) -> Self {
        self.instant_publisher = Some(publisher);
        self
    }

    pub fn log(&self) -> &Arc<EventLog> {
        &self.log
    }

    /// Records a mutation of `entity`.
    ///
    /// Only a failure to queue the event is an error. Plugin and instant
    /// publish failures are logged and reported in the outcome.
    pub fn trigger(
        &self,
        entity: EntityRef,
        properties: &[String],
        mask: EventMask,
        session: Option<&str>,
    ) -> Result<TriggerOutcome> {
        let handle = self.registry.resolve(entity.kind, entity.id, 0);
        let invalidated = self.invalidate_caches(entity, handle.as_ref(), properties, mask);

        let entry_id = self.log.append(QueueEntry::event(
            entity,
            mask,
            properties.to_vec(),
            session.map(str::to_string),
        ))?;
        debug!(entry_id, entity = %entity, %mask, "Queued dirt event");

        let notice = EventNotice {
            entity,
            properties: properties.to_vec(),
            mask,
            session: session.map(str::to_string),
        };
        self.notify(&notice);

        let mut messages = Vec::new();
        if let Some(message) = self.instant_publish(handle.as_ref(), mask) {
            messages.push(message);
        }

        Ok(TriggerOutcome {
            entry_id,
            invalidated,
            messages,
        })
    }

    fn invalidate_caches(
        &self,
        entity: EntityRef,
        handle: Option<&EntityHandle>,
        properties: &[String],
        mask: EventMask,
    ) -> Vec<EntityRef> {
        let mut targets = BTreeSet::new();
        targets.insert(entity);

        let status_change = properties
            .iter()
            .any(|p| STATUS_PROPERTIES.contains(&p.as_str()));
        if mask.has(EventMask::STRUCTURAL) || status_change {
            if let Some(handle) = handle {
                targets.extend(handle.parents.iter().copied());
                targets.extend(handle.variants.iter().copied());
            }
        }
        if mask.has(EventMask::CREATE | EventMask::DELETE) && entity.kind.has_variants() {
            targets.extend(self.registry.variants(entity.kind, entity.id));
        }

        for target in &targets {
            self.cache.invalidate(target.kind, target.id);
        }
        targets.into_iter().collect()
    }

    fn notify(&self, notice: &EventNotice) {
        for hook in &self.sync_hooks {
            if let Err(e) = hook.on_event(notice) {
                warn!(entity = %notice.entity, error = %e.chain(), "Structure sync failed");
            }
        }
        for service in &self.services {
            if let Err(e) = service.on_event(notice) {
                warn!(
                    service = service.name(),
                    entity = %notice.entity,
                    error = %e.chain(),
                    "Event service failed"
                );
            }
        }
    }

    fn instant_publish(&self, handle: Option<&EntityHandle>, mask: EventMask) -> Option<String> {
        if !self.config.instant_publish || mask.has(EventMask::DELETE) {
            return None;
        }
        let publisher = self.instant_publisher.as_ref()?;
        let handle = handle?;

        let _cache = CacheStateGuard::disable(publisher.as_ref());
        let reason = match publisher.publish(handle) {
            Ok(InstantPublishResult::Success) => return None,
            Ok(InstantPublishResult::Skipped) => {
                debug!(entity = %handle.entity_ref(), "Instant publishing skipped");
                return None;
            }
            Ok(InstantPublishResult::Failed(reason)) => reason,
            Err(e) => e.chain(),
        };
        warn!(entity = %handle.entity_ref(), reason = %reason, "Instant publishing failed");
        Some(format!(
            "Instant publishing of {} {} failed: {}",
            entity_label(handle.kind),
            handle.id,
            reason
        ))
    }
}

fn entity_label(kind: ObjectType) -> &'static str {
    match kind {
        ObjectType::Page => "page",
        ObjectType::File => "file",
        ObjectType::Image => "image",
        ObjectType::Folder => "folder",
        ObjectType::Template => "template",
        ObjectType::Form => "form",
        _ => "object",
    }
}

/// Turns the instant publish cache off and restores the previous state on drop.
struct CacheStateGuard<'a> {
    publisher: &'a dyn InstantPublisher,
    previous: bool,
}

impl<'a> CacheStateGuard<'a> {
    fn disable(publisher: &'a dyn InstantPublisher) -> Self {
        let previous = publisher.cache_enabled();
        publisher.set_cache_enabled(false);
        Self {
            publisher,
            previous,
        }
    }
}

impl Drop for CacheStateGuard<'_> {
    fn drop(&mut self) {
        self.publisher.set_cache_enabled(self.previous);
    }
}
