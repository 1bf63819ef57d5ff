//! Orchestration of dependency edges: loading, reconciling, storing and the
//! depth-first dirt propagation walk.

use depflow_core::{
    CacheInvalidator, ChannelId, DependencyObject, DepflowConfig, DepflowError, EntityHandle,
    EntityRegistry, EventMask, ObjectId, ObjectType, PropagationConfig, PublishQueue, Result,
    StoreConfig,
};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::context::{PassReport, PropagationContext};
use crate::dependency::{Dependency, DependencyId, DependencyKey};
use crate::file_usage::FileUsageMap;
use crate::filter::{filter_for_channel, filter_for_property, DependencyQuery};
use crate::hooks::{DirtRequest, DirtServices, HookOutcome, HookRegistry};
use crate::store::{
    DependencyRow, DependencyStore, DependencyWrite, ObjectMatch, PropertyFilter, RowFilter,
};

/// Prefetch hit statistics of a publish transaction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AccessStats {
    pub hits: u64,
    pub misses: u64,
}

#[derive(Debug, Default)]
struct PublishTransaction {
    prefetched: HashMap<DependencyObject, Vec<Dependency>>,
    stats: AccessStats,
}

/// Write counts of one `store_dependencies` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreSummary {
    pub inserted: usize,
    pub updated: usize,
    pub deleted: usize,
    pub untouched: usize,
    pub retries: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteAction {
    Insert,
    Update,
    Delete,
}

#[derive(Debug)]
struct PlannedWrite {
    index: usize,
    action: WriteAction,
    deletes: Vec<DependencyId>,
}

pub struct DependencyManager {
    store: Arc<dyn DependencyStore>,
    registry: Arc<dyn EntityRegistry>,
    cache: Arc<dyn CacheInvalidator>,
    publish_queue: Arc<dyn PublishQueue>,
    hooks: HookRegistry,
    propagation: PropagationConfig,
    store_config: StoreConfig,
    transaction: Mutex<Option<PublishTransaction>>,
    file_usage: Mutex<Option<Arc<FileUsageMap>>>,
}

impl DependencyManager {
    pub fn new(
        store: Arc<dyn DependencyStore>,
        registry: Arc<dyn EntityRegistry>,
        cache: Arc<dyn CacheInvalidator>,
        publish_queue: Arc<dyn PublishQueue>,
        config: &DepflowConfig,
    ) -> Self {
        Self {
            store,
            registry,
            cache,
            publish_queue,
            hooks: HookRegistry::standard(),
            propagation: config.propagation.clone(),
            store_config: config.store.clone(),
            transaction: Mutex::new(None),
            file_usage: Mutex::new(None),
        }
    }

    pub fn with_hooks(mut self, hooks: HookRegistry) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn registry(&self) -> &Arc<dyn EntityRegistry> {
        &self.registry
    }

    pub fn store(&self) -> &Arc<dyn DependencyStore> {
        &self.store
    }

    pub fn propagation_config(&self) -> &PropagationConfig {
        &self.propagation
    }

    // ---- publish transaction ----

    /// Opens the publish transaction scope. Returns `false` when one is already open.
    pub fn start_publish_transaction(&self) -> bool {
        let mut transaction = self.transaction.lock();
        if transaction.is_some() {
            return false;
        }
        *transaction = Some(PublishTransaction::default());
        *self.file_usage.lock() = None;
        debug!("Publish transaction started");
        true
    }

    /// Closes the scope and returns its prefetch statistics, `None` if no
    /// transaction was open.
    pub fn commit_publish_transaction(&self) -> Option<AccessStats> {
        let transaction = self.transaction.lock().take()?;
        *self.file_usage.lock() = None;
        let stats = transaction.stats;
        info!(
            hits = stats.hits,
            misses = stats.misses,
            prefetched = transaction.prefetched.len(),
            "Publish transaction committed"
        );
        Some(stats)
    }

    pub fn rollback_publish_transaction(&self) {
        if self.transaction.lock().take().is_some() {
            *self.file_usage.lock() = None;
            debug!("Publish transaction rolled back");
        }
    }

    pub fn in_publish_transaction(&self) -> bool {
        self.transaction.lock().is_some()
    }

    /// Loads the dependencies of the given dependents into the transaction's
    /// prefetch cache.
    pub fn prefetch_dependencies(&self, dependents: &[DependencyObject]) -> Result<usize> {
        if !self.in_publish_transaction() {
            return Err(DepflowError::InvalidOperation(
                "prefetch outside of a publish transaction".to_string(),
            ));
        }
        let mut loaded = Vec::with_capacity(dependents.len());
        for dependent in dependents {
            loaded.push((*dependent, self.load_for_dependent(dependent)?));
        }
        let count = loaded.len();
        if let Some(transaction) = self.transaction.lock().as_mut() {
            transaction.prefetched.extend(loaded);
        }
        debug!(count, "Prefetched dependencies");
        Ok(count)
    }

    // ---- pass lifecycle ----

    pub fn init_dependency_triggering(&self, simulation: bool) -> PropagationContext {
        PropagationContext::new(&self.propagation, simulation)
    }

    pub fn reset_dependency_triggering(
        &self,
        ctx: &mut PropagationContext,
        close_log: bool,
    ) -> PassReport {
        ctx.reset(close_log)
    }

    // ---- queries ----

    /// Dependent-side lookup, served from the prefetch cache when possible.
    pub fn get_dependencies_for_object(
        &self,
        dependent: &DependencyObject,
        channel: Option<ChannelId>,
        property: Option<&str>,
    ) -> Result<Vec<Dependency>> {
        let cached = {
            let mut transaction = self.transaction.lock();
            match transaction.as_mut() {
                Some(transaction) => match transaction.prefetched.get(dependent) {
                    Some(deps) => {
                        transaction.stats.hits += 1;
                        Some(deps.clone())
                    }
                    None => {
                        transaction.stats.misses += 1;
                        None
                    }
                },
                None => None,
            }
        };

        let mut deps = match cached {
            Some(deps) => deps,
            None => self.load_for_dependent(dependent)?,
        };
        if let Some(property) = property {
            filter_for_property(&mut deps, property);
        }
        if let Some(channel) = channel {
            filter_for_channel(&mut deps, channel);
        }
        Ok(deps)
    }

    pub fn get_all_dependencies(&self, query: &DependencyQuery) -> Result<Vec<Dependency>> {
        let rows = self.query_rows(&query.row_filter())?;
        let mut deps = load_merged(rows)?;
        if let Some(channel) = query.channel {
            filter_for_channel(&mut deps, channel);
        }
        Ok(deps)
    }

    fn load_for_dependent(&self, dependent: &DependencyObject) -> Result<Vec<Dependency>> {
        let filter = RowFilter::dependent(ObjectMatch::Exact(
            dependent.object_type(),
            dependent.object_id(),
        ));
        load_merged(self.query_rows(&filter)?)
    }

    fn query_rows(&self, filter: &RowFilter) -> Result<Vec<DependencyRow>> {
        self.store
            .query(filter)
            .map_err(|e| e.into_persistence("loading dependencies"))
    }

    pub fn filter_for_channel(dependencies: &mut Vec<Dependency>, channel: ChannelId) {
        filter_for_channel(dependencies, channel);
    }

    pub fn filter_for_property(dependencies: &mut Vec<Dependency>, property: &str) {
        filter_for_property(dependencies, property);
    }

    // ---- edges ----

    pub fn create_dependency(
        &self,
        source: DependencyObject,
        source_property: Option<String>,
        dependent: DependencyObject,
        mask: EventMask,
    ) -> Dependency {
        Dependency::new(source, source_property, dependent, mask)
    }

    /// Folds the edges recorded while rendering in `channel` into the stored
    /// edges of the same dependent. Re-confirmed edges become existing and gain
    /// the channel; unmatched recordings are appended as new edges. Loaded
    /// edges that were not recorded again stay old.
    pub fn reconcile(
        &self,
        loaded: Vec<Dependency>,
        recorded: Vec<Dependency>,
        channel: ChannelId,
    ) -> Vec<Dependency> {
        let mut by_key: BTreeMap<DependencyKey, Dependency> =
            loaded.into_iter().map(|dep| (dep.key(), dep)).collect();

        for mut recording in recorded {
            match by_key.entry(recording.key()) {
                Entry::Occupied(mut slot) => {
                    let dep = slot.get_mut();
                    dep.set_existing();
                    dep.add_channel_id(channel);
                    for (name, channels) in recording.dependent_properties() {
                        for c in channels {
                            dep.add_dependent_property(name.clone(), *c);
                        }
                    }
                }
                Entry::Vacant(slot) => {
                    recording.add_channel_id(channel);
                    slot.insert(recording);
                }
            }
        }
        by_key.into_values().collect()
    }

    /// Persists one reconciliation pass for `channel`.
    ///
    /// Old edges lose the channel first and are deleted once no channel is
    /// left; otherwise the properties of the other channels are preserved and
    /// the edge is updated if modified. New edges are inserted. Simulated
    /// passes write nothing.
    pub fn store_dependencies(
        &self,
        ctx: &PropagationContext,
        dependencies: &mut [Dependency],
        channel: ChannelId,
    ) -> Result<StoreSummary> {
        let mut summary = StoreSummary::default();
        if ctx.is_simulation() {
            debug!(
                count = dependencies.len(),
                "Simulation mode, not storing dependencies"
            );
            return Ok(summary);
        }

        let mut plan = Vec::new();
        for (index, dep) in dependencies.iter_mut().enumerate() {
            if dep.is_old() {
                dep.remove_channel_id(channel);
                if dep.channel_ids().is_empty() {
                    let deletes = dep.id().into_iter().chain(dep.merged_deps().iter().copied());
                    plan.push(PlannedWrite {
                        index,
                        action: WriteAction::Delete,
                        deletes: deletes.collect(),
                    });
                    continue;
                }
                dep.preserve_other_dependent_properties(channel);
            } else if dep.is_new() {
                if dep.channel_ids().is_empty() {
                    debug!(dependency = %dep, "New dependency without channels, not stored");
                    summary.untouched += 1;
                    continue;
                }
                plan.push(PlannedWrite {
                    index,
                    action: WriteAction::Insert,
                    deletes: Vec::new(),
                });
                continue;
            } else {
                dep.preserve_other_dependent_properties(channel);
            }

            if dep.is_modified() {
                plan.push(PlannedWrite {
                    index,
                    action: WriteAction::Update,
                    deletes: dep.merged_deps().to_vec(),
                });
            } else {
                summary.untouched += 1;
            }
        }

        if plan.is_empty() {
            info!(untouched = summary.untouched, "Dependencies unchanged");
            return Ok(summary);
        }

        let mut attempt = 0;
        let inserted_ids = loop {
            let writes = build_writes(dependencies, &plan)?;
            match self.store.apply(&writes) {
                Ok(ids) => break ids,
                Err(err) if err.is_retryable() && attempt < self.store_config.max_retries => {
                    attempt += 1;
                    warn!(attempt, error = %err, "Dependency write conflict, retrying");
                    std::thread::sleep(Duration::from_millis(
                        self.store_config.retry_backoff_ms * u64::from(attempt),
                    ));
                    self.remerge(dependencies, &mut plan, channel)?;
                }
                Err(err) => return Err(err.into_persistence("storing dependencies")),
            }
        };
        summary.retries = attempt;

        let mut inserted_ids = inserted_ids.into_iter();
        for planned in &plan {
            let dep = &mut dependencies[planned.index];
            match planned.action {
                WriteAction::Insert => {
                    if let Some(id) = inserted_ids.next() {
                        dep.mark_stored(id)?;
                    }
                    summary.inserted += 1;
                }
                WriteAction::Update => {
                    if let Some(id) = dep.id() {
                        dep.mark_stored(id)?;
                    }
                    summary.updated += 1;
                }
                WriteAction::Delete => summary.deleted += 1,
            }
        }

        info!(
            inserted = summary.inserted,
            updated = summary.updated,
            deleted = summary.deleted,
            untouched = summary.untouched,
            retries = summary.retries,
            "Stored dependencies"
        );
        Ok(summary)
    }

    /// Re-reads the rows behind a conflicting write set and replays this
    /// pass's change for `channel` on top of them. Edges whose rows vanished
    /// are inserted again; inserts racing with another writer's row become
    /// updates of that row; an edge left without channels is deleted.
    fn remerge(
        &self,
        dependencies: &mut [Dependency],
        plan: &mut [PlannedWrite],
        channel: ChannelId,
    ) -> Result<()> {
        for planned in plan.iter_mut() {
            let dep = &mut dependencies[planned.index];
            let mut rows = self.rows_for_key(&dep.key())?;
            if let Some(pos) = dep
                .id()
                .and_then(|id| rows.iter().position(|row| row.id == Some(id)))
            {
                let own = rows.remove(pos);
                rows.insert(0, own);
            }

            let Some((primary, others)) = rows.split_first() else {
                planned.deletes.clear();
                if planned.action != WriteAction::Delete {
                    dep.detach();
                    planned.action = WriteAction::Insert;
                }
                continue;
            };

            let mut stored = Dependency::from_row(primary)?;
            for other in others {
                stored.merge(&Dependency::from_row(other)?);
            }
            debug!(dependency = %dep, row = ?primary.id, "Merging with concurrently stored row");
            dep.rebase_onto(stored, channel);
            if dep.channel_ids().is_empty() {
                planned.action = WriteAction::Delete;
                planned.deletes = dep
                    .id()
                    .into_iter()
                    .chain(dep.merged_deps().iter().copied())
                    .collect();
            } else {
                planned.action = WriteAction::Update;
                planned.deletes = dep.merged_deps().to_vec();
            }
        }
        Ok(())
    }

    fn rows_for_key(&self, key: &DependencyKey) -> Result<Vec<DependencyRow>> {
        let filter = RowFilter {
            source: ObjectMatch::Exact(key.source.object_type(), key.source.object_id()),
            dependent: ObjectMatch::Exact(key.dependent.object_type(), key.dependent.object_id()),
            ..RowFilter::default()
        };
        Ok(self
            .query_rows(&filter)?
            .into_iter()
            .filter(|row| row.key() == *key)
            .collect())
    }

    /// Deletes every stored edge of `dependent`.
    pub fn clear_dependencies(&self, dependent: &DependencyObject) -> Result<usize> {
        let filter = RowFilter::dependent(ObjectMatch::Exact(
            dependent.object_type(),
            dependent.object_id(),
        ));
        let deleted = self
            .store
            .delete_matching(&filter)
            .map_err(|e| e.into_persistence("clearing dependencies"))?;
        if let Some(transaction) = self.transaction.lock().as_mut() {
            transaction.prefetched.remove(dependent);
        }
        debug!(dependent = %dependent, deleted, "Cleared dependencies");
        Ok(deleted)
    }

    // ---- file usage ----

    /// Index of files used by pages and folders. Inside a publish
    /// transaction it is built once and reused until the transaction ends;
    /// outside of one it is read fresh on every call.
    pub fn file_usage_map(&self) -> Result<Arc<FileUsageMap>> {
        if let Some(map) = self.file_usage.lock().as_ref() {
            return Ok(Arc::clone(map));
        }
        let rows = self.query_rows(&RowFilter {
            source: ObjectMatch::Class(ObjectType::File),
            ..RowFilter::default()
        })?;
        let map = Arc::new(FileUsageMap::from_rows(&rows));
        debug!(files = map.len(), "Built file usage map");
        if self.in_publish_transaction() {
            *self.file_usage.lock() = Some(Arc::clone(&map));
        }
        Ok(map)
    }

    pub fn is_file_used(&self, file_id: ObjectId, channel: ChannelId) -> Result<bool> {
        Ok(self.file_usage_map()?.is_file_used(file_id, channel))
    }

    // ---- propagation walk ----

    /// Triggers the dependencies of a changed object. The object itself is
    /// not dirted at depth 0.
    pub fn trigger_event(
        &self,
        ctx: &mut PropagationContext,
        source: &DependencyObject,
        properties: &[String],
        mask: EventMask,
        depth: usize,
        node: Option<ChannelId>,
    ) -> Result<()> {
        if !ctx.is_triggering_active() {
            return Ok(());
        }
        if depth > ctx.max_depth() {
            warn!(source = %source, depth, "Propagation depth limit reached");
            return Err(DepflowError::RecursionLimit {
                depth: ctx.max_depth(),
            });
        }
        if let Some(trace) = ctx.trace_mut() {
            trace.event(depth, format!("{} {:?} [{}]", source, properties, mask));
        }

        let deps = self.dependencies_triggered_by(source, properties, mask)?;
        debug!(source = %source, %mask, depth, count = deps.len(), "Triggering dependencies");
        for dep in &deps {
            dep.trigger_dependency(ctx, self, mask, depth, node)?;
        }
        Ok(())
    }

    /// Stored edges reacting to a change of `source`: rows on the exact
    /// object shape plus class-level rows of its type. With properties, rows
    /// on one of them and property-less rows match.
    pub fn dependencies_triggered_by(
        &self,
        source: &DependencyObject,
        properties: &[String],
        mask: EventMask,
    ) -> Result<Vec<Dependency>> {
        let Some(query) = DependencyQuery::for_object(source) else {
            return Ok(Vec::new());
        };
        let query = query.event_mask(mask);
        let queries = if properties.is_empty() {
            vec![query.properties(PropertyFilter::Any)]
        } else {
            vec![
                query.clone().properties(PropertyFilter::In(properties.to_vec())),
                query.properties(PropertyFilter::AbsentOnly),
            ]
        };

        let mut filters: Vec<RowFilter> = queries.iter().map(DependencyQuery::row_filter).collect();
        if source.object_id().is_some() {
            let class_level: Vec<RowFilter> = filters
                .iter()
                .map(|filter| RowFilter {
                    source: ObjectMatch::Exact(source.object_type(), None),
                    ..filter.clone()
                })
                .collect();
            filters.extend(class_level);
        }

        let mut rows: BTreeMap<Option<DependencyId>, DependencyRow> = BTreeMap::new();
        for filter in &filters {
            for row in self.query_rows(filter)? {
                rows.entry(row.id).or_insert(row);
            }
        }
        load_merged(rows.into_values().collect())
    }

    /// Channel a dependent lives in when its edge was recorded for the master.
    fn owning_channel(&self, dependent: &DependencyObject) -> ChannelId {
        dependent
            .get_object(self.registry.as_ref(), 0)
            .map(|entity| {
                if entity.channel_id != 0 {
                    entity.channel_id
                } else {
                    entity.node_id.unwrap_or(0)
                }
            })
            .unwrap_or(0)
    }

    fn is_master_node(&self, channel: ChannelId) -> bool {
        channel != 0
            && self
                .registry
                .channel(channel)
                .is_some_and(|info| info.is_master())
    }

    fn dispatch(
        &self,
        ctx: &mut PropagationContext,
        entity: &EntityHandle,
        properties: &[String],
        mask: EventMask,
        depth: usize,
        channel: ChannelId,
    ) -> Result<()> {
        let hook = self.hooks.hook_for(entity.kind);
        let services = DirtServices {
            cache: self.cache.as_ref(),
            publish_queue: self.publish_queue.as_ref(),
        };
        let request = DirtRequest {
            entity,
            properties,
            mask,
            depth,
            channel,
        };
        match hook.on_trigger(ctx, &services, &request)? {
            HookOutcome::Stop => Ok(()),
            HookOutcome::Cascade(next) => self.trigger_event(
                ctx,
                &DependencyObject::from(entity),
                properties,
                next,
                depth,
                Some(channel),
            ),
        }
    }
}

impl Dependency {
    /// Follows this edge to its dependent, once per target channel.
    ///
    /// With an explicit `node` the dependent is triggered for that channel
    /// only, and only when the edge records it (directly, or through the
    /// master channel `0` of a dependent owned by `node`). Otherwise it is
    /// triggered for every stored channel, `0` standing for the dependent's
    /// own channel or owning node.
    pub fn trigger_dependency(
        &self,
        ctx: &mut PropagationContext,
        manager: &DependencyManager,
        mask: EventMask,
        depth: usize,
        node: Option<ChannelId>,
    ) -> Result<()> {
        if !ctx.follows(self.id()) {
            return Ok(());
        }
        if self.dependent().object_ref().is_none() {
            debug!(dependency = %self, "Dependent has no id, skipping");
            return Ok(());
        }
        if let Some(trace) = ctx.trace_mut() {
            trace.dependency(depth, self.to_string());
        }

        let targets: Vec<(ChannelId, ChannelId)> = match node {
            Some(node) => self
                .channel_ids()
                .iter()
                .copied()
                .filter(|&recorded| {
                    recorded == node
                        || (recorded == 0
                            && !self.has_channel(node)
                            && manager.owning_channel(self.dependent()) == node)
                })
                .take(1)
                .map(|recorded| (recorded, node))
                .collect(),
            None => self
                .channel_ids()
                .iter()
                .map(|&recorded| {
                    let channel = if recorded == 0 {
                        manager.owning_channel(self.dependent())
                    } else {
                        recorded
                    };
                    (recorded, channel)
                })
                .collect(),
        };

        for (recorded, channel) in targets {
            let first_visit = ctx.mark_triggered(channel, *self.dependent());
            if !first_visit && !ctx.attribute_dirting() {
                continue;
            }

            let lookup_channel = if manager.is_master_node(channel) { 0 } else { channel };
            let Some(entity) = self
                .dependent()
                .get_object(manager.registry.as_ref(), lookup_channel)
            else {
                continue;
            };
            let properties = self.properties_for_channel(recorded);

            ctx.push_frame(self.to_string());
            let result = manager.dispatch(ctx, &entity, &properties, mask, depth + 1, channel);
            ctx.pop_frame();
            result?;
        }
        Ok(())
    }
}

/// Loads rows into edges, collapsing rows with the same key into one edge.
pub fn load_merged(rows: Vec<DependencyRow>) -> Result<Vec<Dependency>> {
    let mut by_key: BTreeMap<DependencyKey, Dependency> = BTreeMap::new();
    for row in &rows {
        let dep = Dependency::from_row(row)?;
        match by_key.entry(dep.key()) {
            Entry::Occupied(mut slot) => slot.get_mut().merge(&dep),
            Entry::Vacant(slot) => {
                slot.insert(dep);
            }
        }
    }
    Ok(by_key.into_values().collect())
}

fn build_writes(dependencies: &[Dependency], plan: &[PlannedWrite]) -> Result<Vec<DependencyWrite>> {
    let mut writes = Vec::with_capacity(plan.len());
    for planned in plan {
        let dep = &dependencies[planned.index];
        match planned.action {
            WriteAction::Insert => writes.push(DependencyWrite::Insert(dep.to_row()?)),
            WriteAction::Update => writes.push(DependencyWrite::update(
                dep.to_row()?,
                dep.loaded_row().cloned(),
            )),
            WriteAction::Delete => {}
        }
        for &id in &planned.deletes {
            let expected = if dep.id() == Some(id) {
                dep.loaded_row().cloned()
            } else {
                None
            };
            writes.push(DependencyWrite::Delete { id, expected });
        }
    }
    Ok(writes)
}
