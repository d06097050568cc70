//! Reference discovery in rendered content and link reconciliation.
//!
//! Extraction is best-effort: the patterns find the reference forms this
//! service emits and nothing else.

use std::collections::BTreeSet;
use std::sync::{Arc, OnceLock};

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::service::BatchOutcome;
use crate::storage::models::{EntityRef, FileFilter, LinkRecord};
use crate::storage::{Connector, ConnectorError};

const UUID: &str = r"[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}";

const SCAN_PAGE: u32 = 200;

fn patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            // Content endpoint paths, absolute or relative
            format!(r"/content/({UUID})\b"),
            // Markup attributes
            format!(r#"data-file-uid\s*=\s*["']({UUID})["']"#),
            // Inline reference syntax
            format!(r"fm://({UUID})\b"),
        ]
        .iter()
        .map(|p| Regex::new(p).expect("link pattern is valid"))
        .collect()
    })
}

/// Every file uid referenced in `body`, lower-cased and deduplicated.
pub fn extract_file_uids(body: &str) -> BTreeSet<String> {
    patterns()
        .iter()
        .flat_map(|re| re.captures_iter(body))
        .filter_map(|caps| caps.get(1))
        .map(|m| m.as_str().to_ascii_lowercase())
        .collect()
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconcileOutcome {
    pub created: BatchOutcome<String>,
    pub removed: BatchOutcome<String>,
    pub unchanged: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentAction {
    Create,
    Update,
    Publish,
    Restore,
    /// Soft delete. Links are kept so a restore is consistent.
    Trash,
    Delete,
}

/// Write-hook payload from the content-management side.
#[derive(Debug, Clone, Deserialize)]
pub struct ContentEvent {
    pub action: ContentAction,
    pub entity_type: String,
    pub entity_uid: String,
    #[serde(default)]
    pub field: Option<String>,
    #[serde(default)]
    pub body: String,
}

pub struct LinkTracker {
    connector: Arc<dyn Connector>,
}

impl LinkTracker {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self { connector }
    }

    pub async fn handle_event(&self, event: &ContentEvent) -> Result<ReconcileOutcome, ConnectorError> {
        let entity = EntityRef::new(&event.entity_type, &event.entity_uid);
        match event.action {
            ContentAction::Create
            | ContentAction::Update
            | ContentAction::Publish
            | ContentAction::Restore => {
                let current = extract_file_uids(&event.body);
                self.reconcile_links(&entity, event.field.as_deref(), &current)
                    .await
            }
            ContentAction::Trash => Ok(ReconcileOutcome::default()),
            ContentAction::Delete => Ok(ReconcileOutcome {
                removed: self.remove_entity_links(&entity).await?,
                ..Default::default()
            }),
        }
    }

    /// Bring the entity's links for `field` in line with `current`.
    ///
    /// Individual create/delete failures are recorded in the outcome and do
    /// not stop the rest. Listing the existing links is the only hard failure.
    pub async fn reconcile_links(
        &self,
        entity: &EntityRef,
        field: Option<&str>,
        current: &BTreeSet<String>,
    ) -> Result<ReconcileOutcome, ConnectorError> {
        let existing: BTreeSet<String> = self
            .entity_links(entity)
            .await?
            .into_iter()
            .filter(|link| link.linked_field.as_deref() == field)
            .map(|link| link.file_uid)
            .collect();

        let mut outcome = ReconcileOutcome {
            unchanged: existing.intersection(current).cloned().collect(),
            ..Default::default()
        };

        for uid in current.difference(&existing) {
            match self.link_existing_file(uid, entity, field).await {
                Ok(()) => outcome.created.succeed(uid.clone()),
                Err(reason) => {
                    tracing::warn!(file_uid = %uid, entity = %entity.entity_uid, %reason, "Failed to create link");
                    outcome.created.fail(uid.clone(), reason);
                }
            }
        }

        for uid in existing.difference(current) {
            let link = LinkRecord::new(uid.as_str(), entity, field);
            match self.connector.delete_link(&link).await {
                Ok(_) => outcome.removed.succeed(uid.clone()),
                Err(e) => {
                    tracing::warn!(file_uid = %uid, entity = %entity.entity_uid, error = %e, "Failed to remove link");
                    outcome.removed.fail(uid.clone(), e);
                }
            }
        }

        tracing::debug!(
            entity_type = %entity.entity_type,
            entity_uid = %entity.entity_uid,
            created = outcome.created.succeeded.len(),
            removed = outcome.removed.succeeded.len(),
            "Links reconciled"
        );
        Ok(outcome)
    }

    /// Delete every link held by an entity, whatever the field.
    pub async fn remove_entity_links(
        &self,
        entity: &EntityRef,
    ) -> Result<BatchOutcome<String>, ConnectorError> {
        let mut outcome = BatchOutcome::new();
        for link in self.entity_links(entity).await? {
            match self.connector.delete_link(&link).await {
                Ok(_) => outcome.succeed(link.file_uid),
                Err(e) => {
                    tracing::warn!(file_uid = %link.file_uid, error = %e, "Failed to remove link");
                    outcome.fail(link.file_uid, e);
                }
            }
        }
        Ok(outcome)
    }

    /// Explicitly link a file. Returns false when the link already existed.
    pub async fn create_link(
        &self,
        file_uid: &str,
        entity: &EntityRef,
        field: Option<&str>,
    ) -> Result<bool, ConnectorError> {
        self.connector
            .create_link(&LinkRecord::new(file_uid, entity, field))
            .await
    }

    pub async fn delete_link(
        &self,
        file_uid: &str,
        entity: &EntityRef,
        field: Option<&str>,
    ) -> Result<bool, ConnectorError> {
        self.connector
            .delete_link(&LinkRecord::new(file_uid, entity, field))
            .await
    }

    pub async fn links_for_file(&self, file_uid: &str) -> Result<Vec<LinkRecord>, ConnectorError> {
        self.connector.links_for_file(file_uid).await
    }

    async fn link_existing_file(
        &self,
        uid: &str,
        entity: &EntityRef,
        field: Option<&str>,
    ) -> Result<(), String> {
        match self.connector.get_file(uid).await {
            Ok(Some(_)) => {}
            Ok(None) => return Err(format!("file '{uid}' does not exist")),
            Err(e) => return Err(e.to_string()),
        }
        self.connector
            .create_link(&LinkRecord::new(uid, entity, field))
            .await
            .map(|_| ())
            .map_err(|e| e.to_string())
    }

    /// Links held by an entity, through the connector's index when it has
    /// one, else by scanning every file.
    async fn entity_links(&self, entity: &EntityRef) -> Result<Vec<LinkRecord>, ConnectorError> {
        if self.connector.capabilities().entity_link_listing {
            return self
                .connector
                .links_for_entity(&entity.entity_type, &entity.entity_uid)
                .await;
        }

        let mut links = Vec::new();
        let mut filter = FileFilter {
            include_archived: true,
            include_provisional: true,
            limit: SCAN_PAGE,
            ..Default::default()
        };
        loop {
            let page = self.connector.list_files(&filter).await?;
            for file in &page.items {
                links.extend(
                    self.connector
                        .links_for_file(&file.uid)
                        .await?
                        .into_iter()
                        .filter(|link| link.entity() == *entity),
                );
            }
            let seen = u64::from(filter.offset) + page.items.len() as u64;
            if page.items.is_empty() || seen >= page.total {
                break;
            }
            filter.offset += SCAN_PAGE;
        }
        Ok(links)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::Actor;
    use crate::testutil::{test_service, test_service_with, TestHarness};

    fn tracker(h: &TestHarness) -> LinkTracker {
        LinkTracker::new(Arc::clone(h.service.connector()))
    }

    fn page() -> EntityRef {
        EntityRef::new("page", "home")
    }

    fn set<S: AsRef<str>>(uids: &[S]) -> BTreeSet<String> {
        uids.iter().map(|u| u.as_ref().to_string()).collect()
    }

    #[test]
    fn test_extract_known_reference_forms() {
        let body = r#"
            <img src="https://cdn.example.com/content/0B6F4C1E-1111-4222-8333-444455556666?w=320">
            <figure data-file-uid="aaaaaaaa-bbbb-4ccc-8ddd-eeeeeeeeeeee"></figure>
            See fm://12345678-1234-4234-8234-123456789abc for details.
            Again /content/0b6f4c1e-1111-4222-8333-444455556666 and /content/not-a-uid
        "#;
        let uids = extract_file_uids(body);
        assert_eq!(
            uids,
            set::<&str>(&[
                "0b6f4c1e-1111-4222-8333-444455556666",
                "12345678-1234-4234-8234-123456789abc",
                "aaaaaaaa-bbbb-4ccc-8ddd-eeeeeeeeeeee",
            ])
        );
    }

    #[test]
    fn test_extract_ignores_bare_uuids() {
        assert!(extract_file_uids("id 0b6f4c1e-1111-4222-8333-444455556666 alone").is_empty());
    }

    #[tokio::test]
    async fn test_reconcile_creates_removes_and_is_idempotent() {
        let h = test_service().await;
        let a = h.upload_image(&Actor::user("u"), 4, 4).await;
        let b = h.upload_image(&Actor::user("u"), 4, 4).await;
        let c = h.upload_image(&Actor::user("u"), 4, 4).await;
        let tracker = tracker(&h);

        let first = tracker
            .reconcile_links(&page(), Some("body"), &set(&[&a.uid, &b.uid]))
            .await
            .unwrap();
        assert_eq!(first.created.succeeded.len(), 2);

        let second = tracker
            .reconcile_links(&page(), Some("body"), &set(&[&b.uid, &c.uid]))
            .await
            .unwrap();
        assert_eq!(second.created.succeeded, vec![c.uid.clone()]);
        assert_eq!(second.removed.succeeded, vec![a.uid.clone()]);
        assert_eq!(second.unchanged, vec![b.uid.clone()]);

        let third = tracker
            .reconcile_links(&page(), Some("body"), &set(&[&b.uid, &c.uid]))
            .await
            .unwrap();
        assert!(third.created.is_empty());
        assert!(third.removed.is_empty());
        assert_eq!(h.db.count_links_for_file(&a.uid).unwrap(), 0);
        assert_eq!(h.db.count_links_for_file(&c.uid).unwrap(), 1);
    }

    #[tokio::test]
    async fn test_unknown_uid_does_not_block_others() {
        let h = test_service().await;
        let a = h.upload_image(&Actor::user("u"), 4, 4).await;
        let ghost = "ffffffff-ffff-4fff-8fff-ffffffffffff";

        let outcome = tracker(&h)
            .reconcile_links(&page(), None, &set(&[a.uid.as_str(), ghost]))
            .await
            .unwrap();
        assert_eq!(outcome.created.succeeded, vec![a.uid.clone()]);
        assert_eq!(outcome.created.failed.len(), 1);
        assert_eq!(outcome.created.failed[0].item, ghost);
    }

    #[tokio::test]
    async fn test_fields_reconcile_independently() {
        let h = test_service().await;
        let a = h.upload_image(&Actor::user("u"), 4, 4).await;
        let tracker = tracker(&h);

        tracker
            .reconcile_links(&page(), Some("hero"), &set(&[&a.uid]))
            .await
            .unwrap();
        let outcome = tracker
            .reconcile_links(&page(), Some("body"), &BTreeSet::new())
            .await
            .unwrap();
        assert!(outcome.removed.is_empty());
        assert_eq!(h.db.count_links_for_file(&a.uid).unwrap(), 1);
    }

    #[tokio::test]
    async fn test_events_trash_keeps_and_delete_removes() {
        let h = test_service_with(false).await;
        let a = h.upload_image(&Actor::user("u"), 4, 4).await;
        let tracker = tracker(&h);

        let event = |action| ContentEvent {
            action,
            entity_type: "page".to_string(),
            entity_uid: "home".to_string(),
            field: None,
            body: format!(r#"<img src="/content/{}">"#, a.uid),
        };

        let outcome = tracker.handle_event(&event(ContentAction::Publish)).await.unwrap();
        assert_eq!(outcome.created.succeeded, vec![a.uid.clone()]);

        tracker.handle_event(&event(ContentAction::Trash)).await.unwrap();
        assert_eq!(h.db.count_links_for_file(&a.uid).unwrap(), 1);

        let outcome = tracker.handle_event(&event(ContentAction::Delete)).await.unwrap();
        assert_eq!(outcome.removed.succeeded, vec![a.uid.clone()]);
        assert_eq!(h.db.count_links_for_file(&a.uid).unwrap(), 0);
    }
}
