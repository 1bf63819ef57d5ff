use depflow_core::{ChannelId, DependencyObject, EntityRef, PropagationConfig};
use serde::Serialize;
use std::collections::{HashMap, HashSet};

use crate::dependency::DependencyId;
use crate::trace::TraceLogger;

/// Number of objects dirted during one pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DirtCounter(usize);

impl DirtCounter {
    pub fn increment(&mut self) {
        self.0 += 1;
    }

    pub fn get(&self) -> usize {
        self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DirtedObject {
    pub entity: EntityRef,
    pub channel: ChannelId,
    pub properties: Vec<String>,
}

/// A dirt computed by a simulated pass, with the trigger path that led to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SimulatedDirt {
    pub entity: EntityRef,
    pub channel: ChannelId,
    pub properties: Vec<String>,
    pub trigger_path: Vec<String>,
}

/// Outcome of a propagation pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PassReport {
    pub dirt_count: usize,
    pub dirted: Vec<DirtedObject>,
    pub simulated: Vec<SimulatedDirt>,
    pub trace: Option<String>,
}

/// State of a single propagation pass, owned by the unit of work that
/// processes one queue entry.
#[derive(Debug)]
pub struct PropagationContext {
    triggered: HashMap<ChannelId, HashSet<DependencyObject>>,
    dirt_counter: DirtCounter,
    dirted: Vec<DirtedObject>,
    simulation: bool,
    simulation_filter: Option<DependencyId>,
    trigger_stack: Vec<String>,
    simulated: Vec<SimulatedDirt>,
    trace: Option<TraceLogger>,
    triggering_active: bool,
    attribute_dirting: bool,
    max_depth: usize,
}

impl PropagationContext {
    pub fn new(config: &PropagationConfig, simulation: bool) -> Self {
        Self {
            triggered: HashMap::new(),
            dirt_counter: DirtCounter::default(),
            dirted: Vec::new(),
            simulation,
            simulation_filter: None,
            trigger_stack: Vec::new(),
            simulated: Vec::new(),
            trace: config
                .trace_enabled
                .then(|| TraceLogger::new(config.trace_threshold)),
            triggering_active: true,
            attribute_dirting: config.attribute_dirting,
            max_depth: config.max_depth,
        }
    }

    pub fn is_simulation(&self) -> bool {
        self.simulation
    }

    pub fn is_triggering_active(&self) -> bool {
        self.triggering_active
    }

    pub fn attribute_dirting(&self) -> bool {
        self.attribute_dirting
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    /// Restricts a simulated pass to the edge with this id.
    pub fn set_simulation_filter(&mut self, id: Option<DependencyId>) {
        self.simulation_filter = id;
    }

    pub fn simulation_filter(&self) -> Option<DependencyId> {
        self.simulation_filter
    }

    /// Whether the walk follows the edge with `id` in this pass.
    pub fn follows(&self, id: Option<DependencyId>) -> bool {
        match (self.simulation, self.simulation_filter) {
            (true, Some(only)) => id == Some(only),
            _ => true,
        }
    }

    /// Records `object` as triggered for `channel`. Returns `false` when it
    /// already was.
    pub fn mark_triggered(&mut self, channel: ChannelId, object: DependencyObject) -> bool {
        self.triggered.entry(channel).or_default().insert(object)
    }

    pub fn is_triggered(&self, channel: ChannelId, object: &DependencyObject) -> bool {
        self.triggered
            .get(&channel)
            .is_some_and(|objects| objects.contains(object))
    }

    pub fn dirt_count(&self) -> usize {
        self.dirt_counter.get()
    }

    pub fn record_dirt(&mut self, entity: EntityRef, channel: ChannelId, properties: &[String]) {
        self.dirt_counter.increment();
        let dirted = DirtedObject {
            entity,
            channel,
            properties: properties.to_vec(),
        };
        if self.simulation {
            self.simulated.push(SimulatedDirt {
                entity: dirted.entity,
                channel,
                properties: dirted.properties.clone(),
                trigger_path: self.trigger_stack.clone(),
            });
        }
        self.dirted.push(dirted);
    }

    pub fn dirted(&self) -> &[DirtedObject] {
        &self.dirted
    }

    pub fn simulated(&self) -> &[SimulatedDirt] {
        &self.simulated
    }

    pub(crate) fn push_frame(&mut self, frame: String) {
        self.trigger_stack.push(frame);
    }

    pub(crate) fn pop_frame(&mut self) {
        self.trigger_stack.pop();
    }

    pub fn trace(&self) -> Option<&TraceLogger> {
        self.trace.as_ref()
    }

    pub fn trace_mut(&mut self) -> Option<&mut TraceLogger> {
        self.trace.as_mut()
    }

    pub fn enable_trace(&mut self, threshold: usize) {
        if self.trace.is_none() {
            self.trace = Some(TraceLogger::new(threshold));
        }
    }

    /// Releases all per-pass state. With `close_log` the trace is flushed
    /// down to depth 0 and materialized into the report.
    pub fn reset(&mut self, close_log: bool) -> PassReport {
        let dirt_count = self.dirt_counter.get();
        let trace = match self.trace.as_mut() {
            Some(trace) if close_log => trace.materialize(dirt_count),
            Some(trace) => {
                trace.close_to(0);
                None
            }
            None => None,
        };
        let report = PassReport {
            dirt_count,
            dirted: std::mem::take(&mut self.dirted),
            simulated: std::mem::take(&mut self.simulated),
            trace,
        };
        self.triggered.clear();
        self.dirt_counter = DirtCounter::default();
        self.trigger_stack.clear();
        self.simulation_filter = None;
        self.triggering_active = false;
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use depflow_core::ObjectType;

    fn page(id: u32) -> EntityRef {
        EntityRef::new(ObjectType::Page, id)
    }

    #[test]
    fn dedup_is_per_channel() {
        let mut ctx = PropagationContext::new(&PropagationConfig::default(), false);
        let object = DependencyObject::instance(page(1));
        assert!(ctx.mark_triggered(0, object));
        assert!(!ctx.mark_triggered(0, object));
        assert!(ctx.mark_triggered(3, object));
        assert!(ctx.is_triggered(3, &object));
    }

    #[test]
    fn simulation_filter_only_applies_to_simulated_passes() {
        let mut live = PropagationContext::new(&PropagationConfig::default(), false);
        live.set_simulation_filter(Some(7));
        assert!(live.follows(Some(8)));

        let mut sim = PropagationContext::new(&PropagationConfig::default(), true);
        sim.set_simulation_filter(Some(7));
        assert!(sim.follows(Some(7)));
        assert!(!sim.follows(Some(8)));
        assert!(!sim.follows(None));
    }

    #[test]
    fn simulated_dirts_capture_trigger_path() {
        let mut ctx = PropagationContext::new(&PropagationConfig::default(), true);
        ctx.push_frame("page:1".into());
        ctx.push_frame("page:2".into());
        ctx.record_dirt(page(2), 0, &["name".to_string()]);
        ctx.pop_frame();

        assert_eq!(ctx.simulated()[0].trigger_path, vec!["page:1", "page:2"]);
        let report = ctx.reset(true);
        assert_eq!(report.dirt_count, 1);
        assert_eq!(report.simulated.len(), 1);
        assert!(!ctx.is_triggering_active());
        assert_eq!(ctx.dirt_count(), 0);
    }

    #[test]
    fn reset_flushes_the_trace() {
        let config = PropagationConfig {
            trace_enabled: true,
            trace_threshold: 1,
            ..PropagationConfig::default()
        };
        let mut ctx = PropagationContext::new(&config, false);
        if let Some(trace) = ctx.trace_mut() {
            trace.event(0, "page:1");
            trace.dependency(0, "page:1 -> page:2");
        }
        ctx.record_dirt(page(2), 0, &[]);
        let report = ctx.reset(true);
        assert!(report.trace.is_some());
        assert_eq!(ctx.trace().map(TraceLogger::open_spans), Some(0));
    }
}
