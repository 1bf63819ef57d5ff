//! Consistency check of a content repository against the live entities.

use depflow_core::{CheckStatus, ContentRepository, EntityRegistry, ObjectId, Result};
use serde::Serialize;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckReport {
    pub cr_id: ObjectId,
    pub checked: usize,
    pub orphans: usize,
    pub removed: usize,
    pub failures: usize,
    pub status: CheckStatus,
    pub text: String,
}

/// Verifies that every published object still exists and belongs to one of
/// the repository's nodes. With `repair`, orphans are removed.
///
/// Per-object problems are collected into the report instead of aborting;
/// only failing to list the repository is an error.
pub fn check_content_repository(
    repository: &dyn ContentRepository,
    registry: &dyn EntityRegistry,
    cr_id: ObjectId,
    repair: bool,
    max_details: usize,
) -> Result<CheckReport> {
    repository.set_check_status(cr_id, CheckStatus::Running, "")?;

    let listing = repository
        .nodes(cr_id)
        .and_then(|nodes| Ok((nodes, repository.published_objects(cr_id)?)));
    let (nodes, objects) = match listing {
        Ok(listing) => listing,
        Err(e) => {
            let text = format!("Listing content repository {} failed: {}", cr_id, e.chain());
            repository.set_check_status(cr_id, CheckStatus::Error, &text)?;
            return Err(e);
        }
    };

    let mut details = Vec::new();
    let (mut orphans, mut removed, mut failures) = (0, 0, 0);
    for object in &objects {
        let live = nodes.contains(&object.node_id)
            && registry
                .resolve(object.entity.kind, object.entity.id, object.node_id)
                .is_some_and(|handle| !handle.placeholder);
        if live {
            continue;
        }
        orphans += 1;
        if !repair {
            details.push(format!("{} in node {} does not belong", object.entity, object.node_id));
            continue;
        }
        match repository.remove(cr_id, object) {
            Ok(()) => {
                removed += 1;
                details.push(format!("{} in node {} removed", object.entity, object.node_id));
            }
            Err(e) => {
                failures += 1;
                details.push(format!(
                    "{} in node {} could not be removed: {}",
                    object.entity,
                    object.node_id,
                    e.chain()
                ));
            }
        }
    }

    let status = if failures > 0 || (orphans > 0 && !repair) {
        CheckStatus::Error
    } else {
        CheckStatus::Ok
    };
    let text = render_report(objects.len(), orphans, removed, &details, max_details);
    repository.set_check_status(cr_id, status, &text)?;

    if status == CheckStatus::Ok {
        info!(cr_id, checked = objects.len(), removed, "Content repository check passed");
    } else {
        warn!(cr_id, checked = objects.len(), orphans, failures, "Content repository check found problems");
    }
    Ok(CheckReport {
        cr_id,
        checked: objects.len(),
        orphans,
        removed,
        failures,
        status,
        text,
    })
}

fn render_report(
    checked: usize,
    orphans: usize,
    removed: usize,
    details: &[String],
    max_details: usize,
) -> String {
    let mut lines = vec![format!(
        "Checked {} objects, {} orphaned, {} removed",
        checked, orphans, removed
    )];
    lines.extend(details.iter().take(max_details).cloned());
    if details.len() > max_details {
        lines.push(format!("... and {} more", details.len() - max_details));
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use depflow_core::{
        ChannelId, DepflowError, EntityHandle, EntityRef, ObjectType, PublishedObject,
        StaticRegistry,
    };
    use parking_lot::Mutex;

    struct Repository {
        objects: Vec<PublishedObject>,
        fail_remove: bool,
        statuses: Mutex<Vec<(CheckStatus, String)>>,
        removed: Mutex<Vec<PublishedObject>>,
    }

    impl Repository {
        fn new(objects: Vec<PublishedObject>, fail_remove: bool) -> Self {
            Self {
                objects,
                fail_remove,
                statuses: Mutex::new(Vec::new()),
                removed: Mutex::new(Vec::new()),
            }
        }
    }

    impl ContentRepository for Repository {
        fn published_objects(&self, _cr_id: ObjectId) -> Result<Vec<PublishedObject>> {
            Ok(self.objects.clone())
        }

        fn remove(&self, _cr_id: ObjectId, object: &PublishedObject) -> Result<()> {
            if self.fail_remove {
                return Err(DepflowError::InvalidOperation("read only".into()));
            }
            self.removed.lock().push(*object);
            Ok(())
        }

        fn set_check_status(&self, _cr_id: ObjectId, status: CheckStatus, report: &str) -> Result<()> {
            self.statuses.lock().push((status, report.to_string()));
            Ok(())
        }

        fn nodes(&self, _cr_id: ObjectId) -> Result<Vec<ChannelId>> {
            Ok(vec![1])
        }
    }

    fn published(id: ObjectId, node_id: ChannelId) -> PublishedObject {
        PublishedObject {
            entity: EntityRef::new(ObjectType::Page, id),
            node_id,
        }
    }

    fn registry() -> StaticRegistry {
        let registry = StaticRegistry::new();
        registry.insert(EntityHandle::new(ObjectType::Page, 1));
        registry
    }

    #[test]
    fn report_is_capped() {
        let objects = (1..=5).map(|id| published(id, 1)).collect();
        let repository = Repository::new(objects, false);

        let report = check_content_repository(&repository, &registry(), 3, false, 2).unwrap();

        assert_eq!(report.orphans, 4);
        assert_eq!(report.status, CheckStatus::Error);
        assert_eq!(report.text.lines().count(), 4);
        assert!(report.text.ends_with("... and 2 more"));
        let statuses = repository.statuses.lock();
        assert_eq!(statuses[0].0, CheckStatus::Running);
        assert_eq!(statuses[1].0, CheckStatus::Error);
    }

    #[test]
    fn repair_removes_orphans_from_foreign_nodes() {
        let repository = Repository::new(vec![published(1, 1), published(1, 9)], false);

        let report = check_content_repository(&repository, &registry(), 3, true, 10).unwrap();

        assert_eq!(report.status, CheckStatus::Ok);
        assert_eq!(report.removed, 1);
        assert_eq!(*repository.removed.lock(), vec![published(1, 9)]);
    }

    #[test]
    fn failed_removals_are_collected() {
        let repository = Repository::new(vec![published(2, 1)], true);

        let report = check_content_repository(&repository, &registry(), 3, true, 10).unwrap();

        assert_eq!(report.failures, 1);
        assert_eq!(report.status, CheckStatus::Error);
        assert!(report.text.contains("could not be removed"));
    }
}
