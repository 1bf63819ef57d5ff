use depflow_core::{DepflowError, MaintenanceAction, PublishQueue, Result};
use metrics::counter;
use tracing::info;

/// Runs a bulk maintenance action against the publish queue.
pub fn run_maintenance(publish_queue: &dyn PublishQueue, action: &MaintenanceAction) -> Result<u64> {
    if let (Some(start), Some(end)) = (action.start, action.end) {
        if start > end {
            return Err(DepflowError::InvalidOperation(format!(
                "maintenance range starts after it ends ({} > {})",
                start, end
            )));
        }
    }

    let affected = publish_queue.maintain(action)?;
    counter!("depflow_maintenance_actions").increment(1);
    info!(
        kind = ?action.kind,
        object_type = ?action.object_type,
        node = ?action.node,
        affected,
        "Maintenance action executed"
    );
    Ok(affected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use depflow_core::{ChannelId, EntityHandle, MaintenanceKind, ObjectType};
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Queue(Mutex<Vec<MaintenanceAction>>);

    impl PublishQueue for Queue {
        fn dirt(&self, _: &EntityHandle, _: ChannelId, _: &[String]) -> Result<()> {
            Ok(())
        }

        fn maintain(&self, action: &MaintenanceAction) -> Result<u64> {
            self.0.lock().push(action.clone());
            Ok(7)
        }
    }

    #[test]
    fn inverted_range_is_rejected_before_the_queue_sees_it() {
        let queue = Queue::default();
        let mut action = MaintenanceAction {
            kind: MaintenanceKind::Republish,
            object_type: Some(ObjectType::Page),
            node: None,
            start: Some(200),
            end: Some(100),
        };
        assert!(run_maintenance(&queue, &action).is_err());
        assert!(queue.0.lock().is_empty());

        action.end = None;
        assert_eq!(run_maintenance(&queue, &action).unwrap(), 7);
    }
}
