use depflow_core::{
    CacheInvalidator, ChannelId, DependencyObject, DepflowConfig, EntityHandle, EntityRef,
    EventMask, MaintenanceAction, ObjectId, ObjectType, PublishQueue, Result, StaticRegistry,
};
use depflow_graph::{
    CascadeHook, Dependency, DependencyManager, DependencyQuery, DependencyRow, DependencyStore,
    DependencyWrite, HookRegistry, MemoryDependencyStore, PropertyFilter, RowFilter,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};

#[derive(Default)]
struct RecordingCache {
    invalidated: Mutex<Vec<(ObjectType, ObjectId)>>,
}

impl CacheInvalidator for RecordingCache {
    fn invalidate(&self, kind: ObjectType, id: ObjectId) {
        self.invalidated.lock().push((kind, id));
    }
}

#[derive(Default)]
struct RecordingPublishQueue {
    dirted: Mutex<Vec<(EntityRef, ChannelId, Vec<String>)>>,
}

impl PublishQueue for RecordingPublishQueue {
    fn dirt(&self, entity: &EntityHandle, channel: ChannelId, properties: &[String]) -> Result<()> {
        self.dirted
            .lock()
            .push((entity.entity_ref(), channel, properties.to_vec()));
        Ok(())
    }

    fn maintain(&self, _: &MaintenanceAction) -> Result<u64> {
        Ok(0)
    }
}

/// Counts write calls reaching the wrapped store.
#[derive(Default)]
struct CountingStore {
    inner: MemoryDependencyStore,
    writes: AtomicUsize,
}

impl DependencyStore for CountingStore {
    fn query(&self, filter: &RowFilter) -> Result<Vec<DependencyRow>> {
        self.inner.query(filter)
    }

    fn apply(&self, writes: &[DependencyWrite]) -> Result<Vec<u64>> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.inner.apply(writes)
    }

    fn delete_matching(&self, filter: &RowFilter) -> Result<usize> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.inner.delete_matching(filter)
    }
}

struct Fixture {
    store: Arc<MemoryDependencyStore>,
    registry: Arc<StaticRegistry>,
    cache: Arc<RecordingCache>,
    queue: Arc<RecordingPublishQueue>,
    manager: DependencyManager,
}

fn fixture_with(config: DepflowConfig, hooks: HookRegistry) -> Fixture {
    let store = Arc::new(MemoryDependencyStore::new());
    let registry = Arc::new(StaticRegistry::new());
    for id in 1..=10 {
        registry.insert(EntityHandle::new(ObjectType::Page, id));
    }
    registry.insert(EntityHandle::new(ObjectType::Folder, 20));
    registry.insert(EntityHandle::new(ObjectType::File, 30));
    let cache = Arc::new(RecordingCache::default());
    let queue = Arc::new(RecordingPublishQueue::default());
    let manager = DependencyManager::new(
        store.clone(),
        registry.clone(),
        cache.clone(),
        queue.clone(),
        &config,
    )
    .with_hooks(hooks);
    Fixture {
        store,
        registry,
        cache,
        queue,
        manager,
    }
}

fn fixture() -> Fixture {
    fixture_with(DepflowConfig::default(), HookRegistry::standard())
}

fn page(id: u32) -> DependencyObject {
    DependencyObject::instance(EntityRef::new(ObjectType::Page, id))
}

fn edge_row(
    source: DependencyObject,
    property: Option<&str>,
    dependent: DependencyObject,
    mask: EventMask,
    channels: &str,
) -> DependencyRow {
    DependencyRow {
        id: None,
        source,
        source_property: property.map(str::to_string),
        dependent,
        dependent_channels: channels.into(),
        event_mask: mask,
        dependent_properties: None,
    }
}

fn props(names: &[&str]) -> Vec<String> {
    names.iter().map(|n| n.to_string()).collect()
}

#[test]
fn update_on_source_property_dirts_dependent() {
    let fx = fixture();
    fx.store.insert_raw(edge_row(page(1), Some("content"), page(2), EventMask::UPDATE, "0"));

    let mut ctx = fx.manager.init_dependency_triggering(false);
    fx.manager
        .trigger_event(&mut ctx, &page(1), &props(&["content"]), EventMask::UPDATE, 0, None)
        .unwrap();
    let report = fx.manager.reset_dependency_triggering(&mut ctx, true);

    assert_eq!(report.dirt_count, 1);
    assert_eq!(*fx.cache.invalidated.lock(), vec![(ObjectType::Page, 2)]);
    let dirted = fx.queue.dirted.lock();
    assert_eq!(dirted[0].0, EntityRef::new(ObjectType::Page, 2));
    assert_eq!(dirted[0].1, 0);
}

#[test]
fn unrelated_property_or_mask_does_not_trigger() {
    let fx = fixture();
    fx.store.insert_raw(edge_row(page(1), Some("content"), page(2), EventMask::UPDATE, "0"));

    let mut ctx = fx.manager.init_dependency_triggering(false);
    fx.manager
        .trigger_event(&mut ctx, &page(1), &props(&["title"]), EventMask::UPDATE, 0, None)
        .unwrap();
    fx.manager
        .trigger_event(&mut ctx, &page(1), &props(&["content"]), EventMask::MOVE, 0, None)
        .unwrap();
    assert_eq!(ctx.dirt_count(), 0);
}

#[test]
fn property_less_edges_fire_for_any_property() {
    let fx = fixture();
    fx.store.insert_raw(edge_row(page(1), None, page(2), EventMask::UPDATE, "0"));

    let mut ctx = fx.manager.init_dependency_triggering(false);
    fx.manager
        .trigger_event(&mut ctx, &page(1), &props(&["title"]), EventMask::UPDATE, 0, None)
        .unwrap();
    assert_eq!(ctx.dirt_count(), 1);
}

#[test]
fn duplicate_rows_load_as_one_merged_edge() {
    let fx = fixture();
    let first = fx.store.insert_raw(edge_row(page(1), None, page(2), EventMask::UPDATE, "0"));
    let second = fx.store.insert_raw(edge_row(page(1), None, page(2), EventMask::UPDATE, "3"));

    let deps = fx
        .manager
        .get_dependencies_for_object(&page(2), None, None)
        .unwrap();
    assert_eq!(deps.len(), 1);
    assert_eq!(deps[0].id(), Some(first));
    assert_eq!(deps[0].channel_ids(), &[0, 3]);
    assert_eq!(deps[0].merged_deps(), &[second]);

    // re-confirming the edge writes the union and drops the duplicate row
    let recorded = fx
        .manager
        .create_dependency(page(1), None, page(2), EventMask::UPDATE);
    let mut deps = fx.manager.reconcile(deps, vec![recorded], 0);
    let ctx = fx.manager.init_dependency_triggering(false);
    let summary = fx.manager.store_dependencies(&ctx, &mut deps, 0).unwrap();
    assert_eq!(summary.updated, 1);
    let rows = fx.store.rows();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].dependent_channels, "0,3");
}

#[test]
fn delete_query_ignores_element_and_property() {
    let fx = fixture();
    let tag = EntityRef::new(ObjectType::ContentTag, 7);
    fx.store.insert_raw(edge_row(
        DependencyObject::instance_with_element(EntityRef::new(ObjectType::Page, 1), tag),
        Some("text"),
        page(2),
        EventMask::UPDATE | EventMask::DELETE,
        "0",
    ));

    let by_update = DependencyQuery::instance(EntityRef::new(ObjectType::Page, 1))
        .properties(PropertyFilter::AbsentOnly)
        .event_mask(EventMask::UPDATE);
    assert!(fx.manager.get_all_dependencies(&by_update).unwrap().is_empty());

    let by_delete = DependencyQuery::instance(EntityRef::new(ObjectType::Page, 1))
        .properties(PropertyFilter::AbsentOnly)
        .event_mask(EventMask::DELETE);
    assert_eq!(fx.manager.get_all_dependencies(&by_delete).unwrap().len(), 1);

    let elsewhere = by_delete.channel(5);
    assert!(fx.manager.get_all_dependencies(&elsewhere).unwrap().is_empty());
}

#[test]
fn simulation_never_writes() {
    let store = Arc::new(CountingStore::default());
    let registry = Arc::new(StaticRegistry::new());
    let manager = DependencyManager::new(
        store.clone(),
        registry,
        Arc::new(RecordingCache::default()),
        Arc::new(RecordingPublishQueue::default()),
        &DepflowConfig::default(),
    );
    store
        .inner
        .insert_raw(edge_row(page(1), None, page(2), EventMask::UPDATE, "0"));

    let loaded = manager.get_dependencies_for_object(&page(2), None, None).unwrap();
    let new = manager.create_dependency(page(3), None, page(2), EventMask::UPDATE);
    let mut deps = manager.reconcile(loaded, vec![new], 0);
    deps[0].add_dependent_property("name", 0);

    let ctx = manager.init_dependency_triggering(true);
    let summary = manager.store_dependencies(&ctx, &mut deps, 0).unwrap();
    assert_eq!(summary, Default::default());
    assert_eq!(store.writes.load(Ordering::SeqCst), 0);
    assert_eq!(store.inner.len(), 1);
}

#[test]
fn simulated_pass_records_without_side_effects() {
    let fx = fixture();
    fx.store.insert_raw(edge_row(page(1), None, page(2), EventMask::UPDATE, "0"));
    let only = fx.store.insert_raw(edge_row(page(1), None, page(3), EventMask::UPDATE, "0"));

    let mut ctx = fx.manager.init_dependency_triggering(true);
    ctx.set_simulation_filter(Some(only));
    fx.manager
        .trigger_event(&mut ctx, &page(1), &[], EventMask::UPDATE, 0, None)
        .unwrap();
    let report = fx.manager.reset_dependency_triggering(&mut ctx, true);

    assert_eq!(report.dirt_count, 1);
    assert_eq!(report.simulated.len(), 1);
    assert_eq!(report.simulated[0].entity, EntityRef::new(ObjectType::Page, 3));
    assert_eq!(report.simulated[0].trigger_path.len(), 1);
    assert!(fx.cache.invalidated.lock().is_empty());
    assert!(fx.queue.dirted.lock().is_empty());
}

#[test]
fn cycles_terminate_through_per_channel_dedup() {
    let mut hooks = HookRegistry::standard();
    hooks.register(ObjectType::Page, Arc::new(CascadeHook::default()));
    let fx = fixture_with(DepflowConfig::default(), hooks);
    fx.store.insert_raw(edge_row(page(1), None, page(2), EventMask::UPDATE, "0"));
    fx.store.insert_raw(edge_row(page(2), None, page(1), EventMask::UPDATE, "0"));

    let mut ctx = fx.manager.init_dependency_triggering(false);
    fx.manager
        .trigger_event(&mut ctx, &page(1), &[], EventMask::UPDATE, 0, None)
        .unwrap();
    assert_eq!(ctx.dirt_count(), 2);
}

#[test]
fn folder_dirt_cascades_to_its_dependents() {
    let fx = fixture();
    let folder = DependencyObject::instance(EntityRef::new(ObjectType::Folder, 20));
    fx.store.insert_raw(edge_row(page(1), None, folder, EventMask::UPDATE, "0"));
    fx.store.insert_raw(edge_row(folder, None, page(4), EventMask::UPDATE, "0"));

    let mut ctx = fx.manager.init_dependency_triggering(false);
    fx.manager
        .trigger_event(&mut ctx, &page(1), &[], EventMask::UPDATE, 0, None)
        .unwrap();
    let dirted: Vec<EntityRef> = ctx.dirted().iter().map(|d| d.entity).collect();
    assert_eq!(
        dirted,
        vec![EntityRef::new(ObjectType::Folder, 20), EntityRef::new(ObjectType::Page, 4)]
    );
}

#[test]
fn class_level_edges_fire_for_every_instance() {
    let fx = fixture();
    fx.store.insert_raw(edge_row(
        DependencyObject::class(ObjectType::Page),
        None,
        page(5),
        EventMask::CREATE,
        "0",
    ));

    let mut ctx = fx.manager.init_dependency_triggering(false);
    fx.manager
        .trigger_event(&mut ctx, &page(9), &[], EventMask::CREATE, 0, None)
        .unwrap();
    assert_eq!(ctx.dirt_count(), 1);
}

#[test]
fn image_edges_fire_for_file_events() {
    let fx = fixture();
    fx.store.insert_raw(edge_row(
        DependencyObject::instance(EntityRef::new(ObjectType::Image, 30)),
        None,
        page(2),
        EventMask::UPDATE,
        "0",
    ));
    let mut ctx = fx.manager.init_dependency_triggering(false);
    let file = DependencyObject::instance(EntityRef::new(ObjectType::File, 30));
    fx.manager
        .trigger_event(&mut ctx, &file, &[], EventMask::UPDATE, 0, None)
        .unwrap();
    assert_eq!(ctx.dirt_count(), 1);
}

#[test]
fn channel_edges_dirt_in_their_channel() {
    let fx = fixture();
    fx.registry.add_master_node(1);
    fx.registry.add_channel(3, 1);
    fx.registry
        .insert(EntityHandle::new(ObjectType::Page, 8).with_channel(3).with_node(3));
    fx.store.insert_raw(edge_row(page(1), None, page(8), EventMask::UPDATE, "3"));

    let mut ctx = fx.manager.init_dependency_triggering(false);
    fx.manager
        .trigger_event(&mut ctx, &page(1), &[], EventMask::UPDATE, 0, None)
        .unwrap();
    let dirted = fx.queue.dirted.lock();
    assert_eq!(dirted.len(), 1);
    assert_eq!(dirted[0].1, 3);
}

#[test]
fn master_channel_is_normalized_to_owning_node() {
    let fx = fixture();
    fx.registry.add_master_node(1);
    fx.registry
        .insert(EntityHandle::new(ObjectType::Page, 6).with_node(1));
    fx.store.insert_raw(edge_row(page(1), None, page(6), EventMask::UPDATE, "0"));

    let mut ctx = fx.manager.init_dependency_triggering(false);
    fx.manager
        .trigger_event(&mut ctx, &page(1), &[], EventMask::UPDATE, 0, None)
        .unwrap();
    let dirted = fx.queue.dirted.lock();
    assert_eq!(dirted.len(), 1);
    assert_eq!(dirted[0].0, EntityRef::new(ObjectType::Page, 6));
    assert_eq!(dirted[0].1, 1);
}

#[test]
fn dependent_properties_follow_the_dirted_channel() {
    let fx = fixture();
    fx.store.insert_raw(DependencyRow {
        dependent_properties: Some(r#"{"name":[0],"title":[0,4]}"#.into()),
        ..edge_row(page(1), None, page(2), EventMask::UPDATE, "0,4")
    });

    let mut ctx = fx.manager.init_dependency_triggering(false);
    fx.manager
        .trigger_event(&mut ctx, &page(1), &[], EventMask::UPDATE, 0, None)
        .unwrap();
    let mut dirted = fx.queue.dirted.lock().clone();
    dirted.sort_by_key(|d| d.1);
    assert_eq!(dirted[0].2, props(&["name", "title"]));
    assert_eq!(dirted[1].1, 4);
    assert_eq!(dirted[1].2, props(&["title"]));
}

#[test]
fn trace_is_materialized_above_threshold() {
    let mut config = DepflowConfig::default();
    config.propagation.trace_enabled = true;
    config.propagation.trace_threshold = 1;
    let fx = fixture_with(config, HookRegistry::standard());
    fx.store.insert_raw(edge_row(page(1), None, page(2), EventMask::UPDATE, "0"));

    let mut ctx = fx.manager.init_dependency_triggering(false);
    fx.manager
        .trigger_event(&mut ctx, &page(1), &[], EventMask::UPDATE, 0, None)
        .unwrap();
    let report = fx.manager.reset_dependency_triggering(&mut ctx, true);
    let trace = report.trace.unwrap();
    assert!(trace.contains("<event"));
    assert!(trace.contains("<dependency"));
}

#[test]
fn file_usage_is_built_once_per_transaction() {
    let fx = fixture();
    let file = DependencyObject::instance(EntityRef::new(ObjectType::File, 30));
    fx.store.insert_raw(edge_row(file, None, page(2), EventMask::UPDATE, "0"));

    fx.manager.start_publish_transaction();
    assert!(fx.manager.is_file_used(30, 0).unwrap());
    assert!(fx.manager.is_file_used(30, 4).unwrap());

    // rows added mid-transaction are not seen until the next one
    fx.store.insert_raw(edge_row(
        DependencyObject::instance(EntityRef::new(ObjectType::File, 31)),
        None,
        page(2),
        EventMask::UPDATE,
        "0",
    ));
    assert!(!fx.manager.is_file_used(31, 0).unwrap());
    fx.manager.commit_publish_transaction();

    fx.manager.start_publish_transaction();
    assert!(fx.manager.is_file_used(31, 0).unwrap());
    fx.manager.rollback_publish_transaction();
}

#[test]
fn file_usage_outside_a_transaction_sees_new_rows() {
    let fx = fixture();
    assert!(!fx.manager.is_file_used(31, 0).unwrap());

    let file = DependencyObject::instance(EntityRef::new(ObjectType::File, 31));
    let recorded = fx
        .manager
        .create_dependency(file, None, page(2), EventMask::UPDATE);
    let mut deps = fx.manager.reconcile(Vec::new(), vec![recorded], 0);
    let ctx = fx.manager.init_dependency_triggering(false);
    fx.manager.store_dependencies(&ctx, &mut deps, 0).unwrap();
    assert!(fx.manager.is_file_used(31, 0).unwrap());

    // a committed transaction leaves no snapshot behind
    fx.manager.start_publish_transaction();
    assert!(!fx.manager.is_file_used(32, 0).unwrap());
    fx.manager.commit_publish_transaction();
    fx.store.insert_raw(edge_row(
        DependencyObject::instance(EntityRef::new(ObjectType::File, 32)),
        None,
        page(3),
        EventMask::UPDATE,
        "0",
    ));
    assert!(fx.manager.is_file_used(32, 0).unwrap());
}

#[test]
fn explicit_node_only_follows_recorded_channels() {
    let fx = fixture();
    fx.store.insert_raw(DependencyRow {
        dependent_properties: Some(r#"{"title":[4]}"#.into()),
        ..edge_row(page(1), None, page(2), EventMask::UPDATE, "4")
    });

    let mut ctx = fx.manager.init_dependency_triggering(false);
    fx.manager
        .trigger_event(&mut ctx, &page(1), &[], EventMask::UPDATE, 0, Some(0))
        .unwrap();
    assert_eq!(ctx.dirt_count(), 0);

    fx.manager
        .trigger_event(&mut ctx, &page(1), &[], EventMask::UPDATE, 0, Some(4))
        .unwrap();
    assert_eq!(ctx.dirt_count(), 1);
    let dirted = fx.queue.dirted.lock();
    assert_eq!(dirted.len(), 1);
    assert_eq!(dirted[0].1, 4);
    assert_eq!(dirted[0].2, props(&["title"]));
}

#[test]
fn new_edge_without_channels_is_not_stored() {
    let fx = fixture();
    let mut deps = vec![fx
        .manager
        .create_dependency(page(1), None, page(2), EventMask::UPDATE)];
    let ctx = fx.manager.init_dependency_triggering(false);

    let summary = fx.manager.store_dependencies(&ctx, &mut deps, 0).unwrap();
    assert_eq!(summary.inserted, 0);
    assert_eq!(summary.untouched, 1);
    assert!(fx.store.is_empty());
    assert!(deps[0].is_new());
}

/// Loads the edges of page 2 and records page 1 -> page 2 for `channel`.
fn record_for_channel(manager: &DependencyManager, channel: ChannelId) -> Vec<Dependency> {
    let loaded = manager.get_dependencies_for_object(&page(2), None, None).unwrap();
    let recorded = manager.create_dependency(page(1), None, page(2), EventMask::UPDATE);
    manager.reconcile(loaded, vec![recorded], channel)
}

fn second_manager(fx: &Fixture, config: &DepflowConfig) -> DependencyManager {
    DependencyManager::new(
        fx.store.clone(),
        fx.registry.clone(),
        fx.cache.clone(),
        fx.queue.clone(),
        config,
    )
}

#[test]
fn interleaved_writers_keep_both_channels() {
    let fx = fixture();
    fx.store.insert_raw(edge_row(page(1), None, page(2), EventMask::UPDATE, "0"));
    let other = second_manager(&fx, &DepflowConfig::default());

    let mut ours = record_for_channel(&fx.manager, 4);
    let mut theirs = record_for_channel(&other, 5);
    let ctx = fx.manager.init_dependency_triggering(false);

    let first = fx.manager.store_dependencies(&ctx, &mut ours, 4).unwrap();
    assert_eq!(first.updated, 1);
    assert_eq!(first.retries, 0);

    let second = other.store_dependencies(&ctx, &mut theirs, 5).unwrap();
    assert_eq!(second.updated, 1);
    assert_eq!(second.retries, 1);

    let rows = fx.store.rows();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].dependent_channels, "0,4,5");
}

#[test]
fn interleaved_removal_keeps_concurrently_added_channel() {
    let fx = fixture();
    fx.store.insert_raw(edge_row(page(1), None, page(2), EventMask::UPDATE, "3"));
    let other = second_manager(&fx, &DepflowConfig::default());

    // channel 3 re-rendered without the edge while channel 6 still uses it
    let loaded = fx.manager.get_dependencies_for_object(&page(2), None, None).unwrap();
    let mut dropping = fx.manager.reconcile(loaded, Vec::new(), 3);
    let mut adding = record_for_channel(&other, 6);
    let ctx = fx.manager.init_dependency_triggering(false);

    other.store_dependencies(&ctx, &mut adding, 6).unwrap();
    let summary = fx.manager.store_dependencies(&ctx, &mut dropping, 3).unwrap();
    assert_eq!(summary.retries, 1);
    assert_eq!(summary.deleted, 0);
    assert_eq!(summary.updated, 1);

    let rows = fx.store.rows();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].dependent_channels, "6");
}

#[test]
fn concurrent_writers_on_one_edge_lose_no_channel() {
    const WRITERS: u32 = 6;
    let mut config = DepflowConfig::default();
    config.store.max_retries = WRITERS * 2;
    config.store.retry_backoff_ms = 1;
    let fx = fixture_with(config.clone(), HookRegistry::standard());
    fx.store.insert_raw(edge_row(page(1), None, page(2), EventMask::UPDATE, "0"));

    let barrier = Barrier::new(WRITERS as usize);
    std::thread::scope(|scope| {
        for channel in 1..=WRITERS {
            let manager = second_manager(&fx, &config);
            let barrier = &barrier;
            scope.spawn(move || {
                let mut deps = record_for_channel(&manager, channel);
                barrier.wait();
                let ctx = manager.init_dependency_triggering(false);
                manager.store_dependencies(&ctx, &mut deps, channel).unwrap();
            });
        }
    });

    let rows = fx.store.rows();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].dependent_channels, "0,1,2,3,4,5,6");
}
