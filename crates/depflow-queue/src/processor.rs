//! Consumption of queued entries, one at a time and oldest first.

use depflow_core::{
    ContentRepository, DependencyObject, DepflowError, EventMask, PublishQueue, QueueConfig,
    Result,
};
use depflow_graph::{DependencyManager, PassReport};
use metrics::{counter, histogram};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::cr_check::check_content_repository;
use crate::entry::{QueueEntry, QueueEntryId, QueueEntryKind};
use crate::log::EventLog;
use crate::maintenance::run_maintenance;
use crate::store::QueueStore;

/// Result of one `process_next` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Nothing pending that this consumer may take.
    Idle,
    /// A blocker marker heads the queue.
    Blocked(QueueEntryId),
    Processed {
        id: QueueEntryId,
        /// Dirted objects for propagation passes, affected entities for
        /// maintenance, removed orphans for repository checks.
        affected: u64,
    },
    Failed {
        id: QueueEntryId,
        reason: String,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DrainSummary {
    pub processed: usize,
    pub failed: usize,
    pub affected: u64,
    pub blocked: bool,
}

/// Gives a claimed entry back if it was neither removed nor marked failed.
struct ClaimGuard<'a> {
    store: &'a dyn QueueStore,
    id: QueueEntryId,
    settled: bool,
}

impl Drop for ClaimGuard<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        if let Err(e) = self.store.release(self.id) {
            warn!(entry_id = self.id, error = %e, "Failed to release queue entry");
        }
    }
}

pub struct QueueProcessor {
    log: Arc<EventLog>,
    manager: Arc<DependencyManager>,
    publish_queue: Arc<dyn PublishQueue>,
    content_repository: Option<Arc<dyn ContentRepository>>,
    config: QueueConfig,
    trace_logging: AtomicBool,
    publish_markers: watch::Sender<Option<QueueEntryId>>,
}

impl QueueProcessor {
    pub fn new(
        log: Arc<EventLog>,
        manager: Arc<DependencyManager>,
        publish_queue: Arc<dyn PublishQueue>,
        config: &QueueConfig,
    ) -> Self {
        let (publish_markers, _) = watch::channel(None);
        Self {
            log,
            manager,
            publish_queue,
            content_repository: None,
            config: config.clone(),
            trace_logging: AtomicBool::new(false),
            publish_markers,
        }
    }

    pub fn with_content_repository(mut self, repository: Arc<dyn ContentRepository>) -> Self {
        self.content_repository = Some(repository);
        self
    }

    pub fn log(&self) -> &Arc<EventLog> {
        &self.log
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Id of the latest publish marker reached by the consumer.
    pub fn subscribe_publish_markers(&self) -> watch::Receiver<Option<QueueEntryId>> {
        self.publish_markers.subscribe()
    }

    pub fn trace_logging(&self) -> bool {
        self.trace_logging.load(Ordering::Relaxed)
    }

    /// Claims and consumes the oldest pending entry no other consumer holds.
    /// A failing entry is marked failed and kept; the failure is reported,
    /// not returned.
    pub fn process_next(&self) -> Result<ProcessOutcome> {
        let store = self.log.store();
        let Some(entry) = store.claim_next()? else {
            return Ok(ProcessOutcome::Idle);
        };
        let id = entry
            .id
            .ok_or_else(|| DepflowError::InvalidOperation("stored queue entry without id".into()))?;
        let mut claim = ClaimGuard {
            store: store.as_ref(),
            id,
            settled: entry.is_blocker(),
        };

        let started = Instant::now();
        let handled = entry.classify().and_then(|kind| {
            if kind == QueueEntryKind::BlockerMarker {
                return Ok(None);
            }
            self.handle(&entry, kind).map(Some)
        });

        match handled {
            Ok(None) => {
                debug!(entry_id = id, "Queue is blocked");
                Ok(ProcessOutcome::Blocked(id))
            }
            Ok(Some(affected)) => {
                store.remove(id)?;
                claim.settled = true;
                counter!("depflow_queue_entries_processed").increment(1);
                histogram!("depflow_queue_entry_seconds").record(started.elapsed().as_secs_f64());
                debug!(entry_id = id, affected, "Processed queue entry");
                Ok(ProcessOutcome::Processed { id, affected })
            }
            Err(e) => {
                let reason = e.chain();
                error!(entry_id = id, entry = %entry, error = %reason, "Queue entry failed");
                store.mark_failed(id, &reason)?;
                claim.settled = true;
                counter!("depflow_queue_entries_failed").increment(1);
                Ok(ProcessOutcome::Failed { id, reason })
            }
        }
    }

    /// Processes entries until the queue is empty, blocked, or `limit`
    /// entries were consumed.
    pub fn drain(&self, limit: Option<usize>) -> Result<DrainSummary> {
        let mut summary = DrainSummary::default();
        while limit.map_or(true, |limit| summary.processed + summary.failed < limit) {
            match self.process_next()? {
                ProcessOutcome::Idle => break,
                ProcessOutcome::Blocked(_) => {
                    summary.blocked = true;
                    break;
                }
                ProcessOutcome::Processed { affected, .. } => {
                    summary.processed += 1;
                    summary.affected += affected;
                }
                ProcessOutcome::Failed { .. } => summary.failed += 1,
            }
        }
        if summary.processed + summary.failed > 0 {
            info!(
                processed = summary.processed,
                failed = summary.failed,
                blocked = summary.blocked,
                "Drained queue"
            );
        }
        Ok(summary)
    }

    fn handle(&self, entry: &QueueEntry, kind: QueueEntryKind) -> Result<u64> {
        match kind {
            QueueEntryKind::PublishMarker => {
                info!(entry_id = ?entry.id, "Publish marker reached");
                self.publish_markers.send_replace(entry.id);
                Ok(0)
            }
            QueueEntryKind::BlockerMarker => Ok(0),
            QueueEntryKind::Logging { start } => {
                self.trace_logging.store(start, Ordering::Relaxed);
                info!(enabled = start, "Dependency trace logging toggled");
                Ok(0)
            }
            QueueEntryKind::Maintenance(action) => {
                run_maintenance(self.publish_queue.as_ref(), &action)
            }
            QueueEntryKind::ContentRepositoryCheck { cr_id, repair } => {
                let repository = self.content_repository.as_ref().ok_or_else(|| {
                    DepflowError::InvalidOperation(format!(
                        "no content repository configured for check of {}",
                        cr_id
                    ))
                })?;
                let report = check_content_repository(
                    repository.as_ref(),
                    self.manager.registry().as_ref(),
                    cr_id,
                    repair,
                    self.config.cr_check_max_details,
                )?;
                Ok(report.removed as u64)
            }
            QueueEntryKind::HideReveal { hide } => {
                let mask = if hide {
                    EventMask::DELETE | EventMask::HIDE
                } else {
                    EventMask::CREATE | EventMask::REVEAL
                };
                self.propagate(entry, mask).map(|report| report.dirt_count as u64)
            }
            QueueEntryKind::Dirt => self
                .propagate(entry, entry.mask())
                .map(|report| report.dirt_count as u64),
        }
    }

    /// Runs one propagation pass with a context owned by this entry.
    fn propagate(&self, entry: &QueueEntry, mask: EventMask) -> Result<PassReport> {
        let entity = entry.entity().ok_or_else(|| {
            DepflowError::InvalidOperation(format!("dirt event {} names no object", entry))
        })?;
        let source = DependencyObject::instance(entity);
        let handle = source
            .get_object(self.manager.registry().as_ref(), 0)
            .ok_or_else(|| DepflowError::NotFound(entity.to_string()))?;
        if handle.placeholder {
            debug!(entity = %entity, "Propagating from a deleted object");
        }

        let mut ctx = self
            .manager
            .init_dependency_triggering(entry.simulation.is_simulation());
        if self.trace_logging() {
            ctx.enable_trace(self.manager.propagation_config().trace_threshold);
        }
        let walked = self.manager.trigger_event(
            &mut ctx,
            &DependencyObject::from(&handle),
            &entry.properties,
            mask,
            0,
            None,
        );
        let report = self.manager.reset_dependency_triggering(&mut ctx, true);
        walked?;

        histogram!("depflow_dirt_count").record(report.dirt_count as f64);
        if report.dirt_count > 0 {
            info!(entry_id = ?entry.id, entity = %entity, dirt_count = report.dirt_count, "Dirted dependents");
        }
        if !report.simulated.is_empty() {
            info!(
                entry_id = ?entry.id,
                simulated = report.simulated.len(),
                "Simulated pass would dirt objects"
            );
        }
        Ok(report)
    }
}
