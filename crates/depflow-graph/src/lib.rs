//! Dependency edges between content objects, their storage, and the
//! propagation walk that dirts everything derived from a changed object.

pub mod context;
pub mod dependency;
pub mod file_usage;
pub mod filter;
pub mod hooks;
pub mod manager;
pub mod properties;
#[cfg(feature = "sled")]
pub mod sled_store;
pub mod store;
pub mod trace;

pub use context::{DirtCounter, DirtedObject, PassReport, PropagationContext, SimulatedDirt};
pub use dependency::{Dependency, DependencyId, DependencyKey};
pub use file_usage::FileUsageMap;
pub use filter::{DependencyQuery, ElementSelector, SourceSelector};
pub use hooks::{
    CascadeHook, DirtHook, DirtRequest, DirtServices, HookOutcome, HookRegistry, TriggerHook,
};
pub use manager::{load_merged, AccessStats, DependencyManager, StoreSummary};
pub use properties::{decode_dependent_properties, encode_dependent_properties, PropertyChannels};
#[cfg(feature = "sled")]
pub use sled_store::SledDependencyStore;
pub use store::{
    DependencyRow, DependencyStore, DependencyWrite, ElementMatch, MemoryDependencyStore,
    ObjectMatch, PropertyFilter, RowFilter,
};
pub use trace::{SpanKind, TraceLine, TraceLogger};
