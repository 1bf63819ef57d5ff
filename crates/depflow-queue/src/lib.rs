//! Durable dirt-event queue: the mutation entry point that fills it and the
//! consumer that drains it through the dependency graph.

pub mod cr_check;
pub mod entry;
pub mod events;
pub mod log;
pub mod maintenance;
pub mod processor;
#[cfg(feature = "sled")]
pub mod sled_store;
pub mod store;
pub mod worker;

pub use cr_check::{check_content_repository, CheckReport};
pub use entry::{
    QueueEntry, QueueEntryId, QueueEntryKind, QueueRow, SimulationMode, BLOCKER_MARKER,
    PUBLISH_MARKER,
};
pub use events::{Events, TriggerOutcome};
pub use log::EventLog;
pub use maintenance::run_maintenance;
pub use processor::{DrainSummary, ProcessOutcome, QueueProcessor};
#[cfg(feature = "sled")]
pub use sled_store::SledQueueStore;
pub use store::{MemoryQueueStore, QueueFilter, QueueStore};
pub use worker::QueueWorker;
