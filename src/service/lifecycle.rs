use chrono::Utc;
use serde::{Deserialize, Serialize};

use super::{Actor, BatchOutcome, FileService, RequestContext, ServiceError};
use crate::object_store::{key, ObjectRef};
use crate::storage::models::{FileFilter, FileRecord, Page, Patch, VariantRecord, WriteOp};

/// Result of a delete request.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "lowercase")]
pub enum DeleteOutcome {
    /// The file is still referenced and was archived instead.
    Archived { link_count: u64 },
    /// Rows and objects are gone. `cleanup` reports variant objects that
    /// could not be removed.
    Deleted {
        link_count: u64,
        cleanup: BatchOutcome<ObjectRef>,
    },
}

#[derive(Debug, Clone, Deserialize)]
pub struct MoveRequest {
    /// Target bucket; defaults to the file's current bucket.
    #[serde(default)]
    pub bucket: Option<String>,
    #[serde(default)]
    pub folder: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct MoveOutcome {
    pub file: FileRecord,
    /// Deletion of the objects at the old location.
    pub cleanup: BatchOutcome<ObjectRef>,
}

/// Partial metadata update.
#[derive(Debug, Clone, Default)]
pub struct MetadataPatch {
    pub filename: Option<String>,
    pub title: Patch<String>,
    pub alt_text: Patch<String>,
    pub tags: Option<Vec<String>>,
    pub is_public: Option<bool>,
}

impl FileService {
    /// Fetch a file the actor may see. Provisional and archived files are only
    /// visible to their owner.
    pub async fn get_file(&self, actor: &Actor, uid: &str) -> Result<FileRecord, ServiceError> {
        let file = self.load_file(uid).await?;
        let visible = actor.owns(&file)
            || (file.is_public && file.is_finalized() && !file.is_archived());
        if !visible {
            return Err(ServiceError::Forbidden(uid.to_string()));
        }
        Ok(file)
    }

    /// List files. Non-admins only ever see their own.
    pub async fn list_files(
        &self,
        actor: &Actor,
        mut filter: FileFilter,
    ) -> Result<Page<FileRecord>, ServiceError> {
        if !actor.is_admin {
            filter.owner_id = Some(actor.id.clone());
        }
        Ok(self.connector.list_files(&filter).await?)
    }

    pub async fn list_variants(
        &self,
        actor: &Actor,
        uid: &str,
    ) -> Result<Vec<VariantRecord>, ServiceError> {
        let file = self.get_file(actor, uid).await?;
        Ok(self.connector.list_variants(&file.uid).await?)
    }

    pub async fn update_metadata(
        &self,
        actor: &Actor,
        uid: &str,
        patch: MetadataPatch,
    ) -> Result<FileRecord, ServiceError> {
        let mut file = self.load_owned(actor, uid).await?;
        let was_public = file.is_public;

        if let Some(filename) = patch.filename {
            if filename.trim().is_empty() {
                return Err(ServiceError::InvalidRequest(
                    "filename must not be empty".to_string(),
                ));
            }
            file.filename = filename;
        }
        patch.title.apply_to(&mut file.title);
        patch.alt_text.apply_to(&mut file.alt_text);
        if let Some(tags) = patch.tags {
            file.tags = tags;
        }
        if let Some(is_public) = patch.is_public {
            file.is_public = is_public;
        }
        file.updated_at = Utc::now();

        self.save(&file).await?;
        if file.is_public != was_public {
            self.cache.invalidate_file(uid);
        }
        Ok(file)
    }

    /// Soft-delete. Storage is untouched.
    pub async fn archive(&self, actor: &Actor, uid: &str) -> Result<FileRecord, ServiceError> {
        let mut file = self.load_owned(actor, uid).await?;
        if file.archived_at.is_none() {
            let now = Utc::now();
            file.archived_at = Some(now);
            file.updated_at = now;
            self.save(&file).await?;
            self.cache.invalidate_file(uid);
            tracing::debug!(file_uid = uid, "File archived");
        }
        Ok(file)
    }

    pub async fn restore(&self, actor: &Actor, uid: &str) -> Result<FileRecord, ServiceError> {
        let mut file = self.load_owned(actor, uid).await?;
        if file.archived_at.is_some() {
            file.archived_at = None;
            file.updated_at = Utc::now();
            self.save(&file).await?;
            tracing::debug!(file_uid = uid, "File restored");
        }
        Ok(file)
    }

    /// Delete a file, or archive it while links still reference it and
    /// `force` is not set.
    ///
    /// Steps run in an order that can be re-run after a crash: the original
    /// object, variant objects (best-effort), then the rows with the file row last.
    pub async fn delete_file(
        &self,
        ctx: &RequestContext,
        actor: &Actor,
        uid: &str,
        force: bool,
    ) -> Result<DeleteOutcome, ServiceError> {
        let file = self.load_owned(actor, uid).await?;
        let link_count = self.connector.count_links_for_file(uid).await?;

        if link_count > 0 && !force {
            self.archive(actor, uid).await?;
            tracing::info!(file_uid = uid, link_count, "File still linked, archived instead of deleted");
            return Ok(DeleteOutcome::Archived { link_count });
        }

        let variants = self.connector.list_variants(uid).await?;

        // A failure here aborts before any object or row is touched.
        ctx.run("delete", self.store.delete(&file.object_ref()))
            .await?;
        let cleanup = self
            .delete_objects(ctx, variants.iter().map(VariantRecord::object_ref).collect())
            .await;

        let links = if link_count > 0 {
            self.connector.links_for_file(uid).await?
        } else {
            Vec::new()
        };

        let capabilities = self.connector.capabilities();
        if capabilities.transactions {
            let mut ops = vec![WriteOp::DeleteVariantsForFile {
                file_uid: uid.to_string(),
            }];
            ops.extend(links.into_iter().map(WriteOp::DeleteLink));
            ops.push(WriteOp::DeleteFile {
                uid: uid.to_string(),
            });
            self.connector.apply_atomic(&ops).await?;
        } else {
            if capabilities.batch_variant_delete {
                self.connector.delete_variants_for_file(uid).await?;
            } else {
                for variant in &variants {
                    self.connector.delete_variant(uid, variant.kind).await?;
                }
            }
            for link in &links {
                self.connector.delete_link(link).await?;
            }
            self.connector.delete_file(uid).await?;
        }

        self.cache.invalidate_file(uid);
        tracing::info!(
            file_uid = uid,
            link_count,
            variants = variants.len(),
            cleanup_failures = cleanup.failed.len(),
            "File deleted"
        );
        Ok(DeleteOutcome::Deleted {
            link_count,
            cleanup,
        })
    }

    /// Move a file and its variants to a new bucket/folder.
    ///
    /// Objects are copied first and the rows updated only when every copy
    /// succeeded; old objects are deleted last, best-effort. A failed copy
    /// leaves the original objects and rows untouched.
    pub async fn move_file(
        &self,
        ctx: &RequestContext,
        actor: &Actor,
        uid: &str,
        req: MoveRequest,
    ) -> Result<MoveOutcome, ServiceError> {
        let mut file = self.load_owned(actor, uid).await?;
        if !file.is_finalized() {
            return Err(ServiceError::InvalidState(format!(
                "File '{uid}' has not been finalized"
            )));
        }
        if !self.store.capabilities().copy {
            return Err(ServiceError::CapabilityMissing("copy"));
        }

        let bucket = match req.bucket.as_deref() {
            Some(bucket) => self.resolve_bucket(Some(bucket), file.is_public)?,
            None => file.bucket.clone(),
        };
        let target = ObjectRef::new(&bucket, key::encode(&req.folder, uid, None)?);
        let source = file.object_ref();
        if target == source {
            return Ok(MoveOutcome {
                file,
                cleanup: BatchOutcome::new(),
            });
        }

        let mut variants: Vec<VariantRecord> = self
            .connector
            .list_variants(uid)
            .await?
            .into_iter()
            .filter(VariantRecord::is_finalized)
            .collect();

        let mut plan = vec![(source, target.clone())];
        for variant in &variants {
            let to = ObjectRef::new(&bucket, key::encode(&req.folder, uid, Some(variant.kind))?);
            plan.push((variant.object_ref(), to));
        }

        let mut copied = Vec::with_capacity(plan.len());
        for (from, to) in &plan {
            if let Err(e) = ctx.run("copy", self.store.copy(from, to)).await {
                tracing::warn!(file_uid = uid, from = %from, to = %to, error = %e, "Copy failed, abandoning move");
                self.delete_objects(ctx, copied).await;
                return Err(e);
            }
            copied.push(to.clone());
        }

        let now = Utc::now();
        file.bucket = target.bucket.clone();
        file.object_key = target.key.clone();
        file.updated_at = now;
        for (variant, (_, to)) in variants.iter_mut().zip(plan.iter().skip(1)) {
            variant.bucket = to.bucket.clone();
            variant.object_key = to.key.clone();
            variant.updated_at = now;
        }

        if let Err(e) = self.save_moved(&file, &variants).await {
            self.delete_objects(ctx, copied).await;
            return Err(e);
        }
        self.cache.invalidate_file(uid);

        let old = plan.into_iter().map(|(from, _)| from).collect();
        let cleanup = self.delete_objects(ctx, old).await;
        tracing::debug!(file_uid = uid, object = %target, "File moved");
        Ok(MoveOutcome { file, cleanup })
    }

    async fn save(&self, file: &FileRecord) -> Result<(), ServiceError> {
        if !self.connector.update_file(file).await? {
            return Err(ServiceError::FileNotFound(file.uid.clone()));
        }
        Ok(())
    }

    async fn save_moved(
        &self,
        file: &FileRecord,
        variants: &[VariantRecord],
    ) -> Result<(), ServiceError> {
        if self.connector.capabilities().transactions {
            let mut ops = vec![WriteOp::PutFile(file.clone())];
            ops.extend(variants.iter().cloned().map(WriteOp::PutVariant));
            self.connector.apply_atomic(&ops).await?;
            return Ok(());
        }
        self.save(file).await?;
        for variant in variants {
            self.connector.put_variant(variant).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::ErrorKind;
    use crate::storage::models::{EntityRef, LinkRecord, VariantKind};
    use crate::testutil::{test_service, test_service_with, TestHarness};

    fn alice() -> Actor {
        Actor::user("alice")
    }

    async fn link(h: &TestHarness, file_uid: &str, entity_uid: &str) {
        let entity = EntityRef::new("page", entity_uid);
        h.db.create_link(&LinkRecord::new(file_uid, &entity, Some("body")))
            .unwrap();
    }

    #[tokio::test]
    async fn test_delete_linked_file_archives() {
        let h = test_service().await;
        let file = h.upload_image(&alice(), 8, 8).await;
        link(&h, &file.uid, "p1").await;
        link(&h, &file.uid, "p2").await;

        let outcome = h
            .service
            .delete_file(&h.service.context(), &alice(), &file.uid, false)
            .await
            .unwrap();
        assert!(matches!(outcome, DeleteOutcome::Archived { link_count: 2 }));

        let stored = h.db.get_file(&file.uid).unwrap().unwrap();
        assert!(stored.is_archived());
        assert!(h.store.head_now(&file.object_ref()).await.is_some());
    }

    #[tokio::test]
    async fn test_delete_unlinked_file_removes_everything() {
        let h = test_service().await;
        let file = h.upload_image(&alice(), 400, 200).await;
        h.service
            .derive_variants(&h.service.context(), &alice(), &file.uid, vec![])
            .await
            .unwrap();
        let variants = h.db.list_variants(&file.uid).unwrap();
        assert_eq!(variants.len(), 3);

        let outcome = h
            .service
            .delete_file(&h.service.context(), &alice(), &file.uid, false)
            .await
            .unwrap();
        match outcome {
            DeleteOutcome::Deleted {
                link_count,
                cleanup,
            } => {
                assert_eq!(link_count, 0);
                assert!(cleanup.is_complete());
                assert_eq!(cleanup.succeeded.len(), 3);
            }
            other => panic!("expected deletion, got {other:?}"),
        }

        assert!(h.db.get_file(&file.uid).unwrap().is_none());
        assert!(h.db.list_variants(&file.uid).unwrap().is_empty());
        assert!(h.store.head_now(&file.object_ref()).await.is_none());
        for variant in variants {
            assert!(h.store.head_now(&variant.object_ref()).await.is_none());
        }
    }

    #[tokio::test]
    async fn test_forced_delete_with_sequential_connector() {
        let h = test_service_with(false).await;
        let file = h.upload_image(&alice(), 8, 8).await;
        link(&h, &file.uid, "p1").await;

        let outcome = h
            .service
            .delete_file(&h.service.context(), &alice(), &file.uid, true)
            .await
            .unwrap();
        assert!(matches!(outcome, DeleteOutcome::Deleted { link_count: 1, .. }));
        assert!(h.db.get_file(&file.uid).unwrap().is_none());
        assert!(h.db.links_for_file(&file.uid).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_variant_delete_failure_is_reported_not_fatal() {
        let h = test_service().await;
        let file = h.upload_image(&alice(), 400, 200).await;
        h.service
            .derive_variants(&h.service.context(), &alice(), &file.uid, vec![])
            .await
            .unwrap();
        let thumb = h.db.get_variant(&file.uid, VariantKind::Thumbnail).unwrap().unwrap();
        h.store.fail_delete_of(&thumb.object_ref());

        let outcome = h
            .service
            .delete_file(&h.service.context(), &alice(), &file.uid, false)
            .await
            .unwrap();
        let DeleteOutcome::Deleted { cleanup, .. } = outcome else {
            panic!("expected deletion");
        };
        assert_eq!(cleanup.failed.len(), 1);
        assert_eq!(cleanup.failed[0].item, thumb.object_ref());
        assert_eq!(cleanup.succeeded.len(), 2);
        assert!(h.db.get_file(&file.uid).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_failed_original_delete_leaves_variants_intact() {
        let h = test_service().await;
        let file = h.upload_image(&alice(), 400, 200).await;
        h.service
            .derive_variants(&h.service.context(), &alice(), &file.uid, vec![])
            .await
            .unwrap();
        h.store.fail_delete_of(&file.object_ref());

        let err = h
            .service
            .delete_file(&h.service.context(), &alice(), &file.uid, false)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Infrastructure);

        assert!(h.db.get_file(&file.uid).unwrap().is_some());
        let variants = h.db.list_variants(&file.uid).unwrap();
        assert_eq!(variants.len(), 3);
        for variant in variants {
            assert!(h.store.head_now(&variant.object_ref()).await.is_some());
        }
    }

    #[tokio::test]
    async fn test_delete_by_non_owner_is_forbidden() {
        let h = test_service().await;
        let file = h.upload_image(&alice(), 8, 8).await;
        let err = h
            .service
            .delete_file(&h.service.context(), &Actor::user("bob"), &file.uid, true)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Authorization);

        h.service
            .delete_file(&h.service.context(), &Actor::admin("root"), &file.uid, true)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_archive_and_restore() {
        let h = test_service().await;
        let file = h.upload_image(&alice(), 8, 8).await;

        let archived = h.service.archive(&alice(), &file.uid).await.unwrap();
        assert!(archived.is_archived());
        let again = h.service.archive(&alice(), &file.uid).await.unwrap();
        assert_eq!(again.archived_at, archived.archived_at);

        let restored = h.service.restore(&alice(), &file.uid).await.unwrap();
        assert!(!restored.is_archived());
        assert!(h.store.head_now(&file.object_ref()).await.is_some());
    }

    #[tokio::test]
    async fn test_move_copies_then_deletes_old_objects() {
        let h = test_service().await;
        let file = h.upload_image(&alice(), 400, 200).await;
        h.service
            .derive_variants(&h.service.context(), &alice(), &file.uid, vec![])
            .await
            .unwrap();

        let outcome = h
            .service
            .move_file(
                &h.service.context(),
                &alice(),
                &file.uid,
                MoveRequest {
                    bucket: None,
                    folder: "archive/2024".to_string(),
                },
            )
            .await
            .unwrap();

        assert!(outcome.cleanup.is_complete());
        assert_eq!(outcome.file.object_key, format!("archive/2024/{}", file.uid));
        assert!(h.store.head_now(&outcome.file.object_ref()).await.is_some());
        assert!(h.store.head_now(&file.object_ref()).await.is_none());

        let stored = h.db.get_file(&file.uid).unwrap().unwrap();
        assert_eq!(stored.object_key, outcome.file.object_key);
        for variant in h.db.list_variants(&file.uid).unwrap() {
            assert!(variant.object_key.starts_with("archive/2024/"));
            assert!(h.store.head_now(&variant.object_ref()).await.is_some());
        }
    }

    #[tokio::test]
    async fn test_failed_copy_leaves_file_untouched() {
        let h = test_service().await;
        let file = h.upload_image(&alice(), 8, 8).await;
        h.store.set_fail_copy(true);

        let err = h
            .service
            .move_file(
                &h.service.context(),
                &alice(),
                &file.uid,
                MoveRequest {
                    bucket: None,
                    folder: "elsewhere".to_string(),
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Infrastructure);

        let stored = h.db.get_file(&file.uid).unwrap().unwrap();
        assert_eq!(stored.object_key, file.object_key);
        assert!(h.store.head_now(&file.object_ref()).await.is_some());
    }

    #[tokio::test]
    async fn test_move_without_copy_capability() {
        let h = test_service().await;
        let file = h.upload_image(&alice(), 8, 8).await;
        h.store.set_copy(false);
        let err = h
            .service
            .move_file(
                &h.service.context(),
                &alice(),
                &file.uid,
                MoveRequest {
                    bucket: None,
                    folder: "x".to_string(),
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), "capability_missing");
    }

    #[tokio::test]
    async fn test_update_metadata_patch() {
        let h = test_service().await;
        let file = h.upload_image(&alice(), 8, 8).await;

        let updated = h
            .service
            .update_metadata(
                &alice(),
                &file.uid,
                MetadataPatch {
                    title: Patch::Value("Sunset".to_string()),
                    tags: Some(vec!["nature".to_string()]),
                    is_public: Some(true),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.title.as_deref(), Some("Sunset"));
        assert!(updated.is_public);

        let cleared = h
            .service
            .update_metadata(
                &alice(),
                &file.uid,
                MetadataPatch {
                    title: Patch::Null,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(cleared.title, None);
        assert_eq!(cleared.tags, vec!["nature".to_string()]);
    }

    #[tokio::test]
    async fn test_list_files_scoped_to_owner() {
        let h = test_service().await;
        h.upload_image(&alice(), 8, 8).await;
        h.upload_image(&Actor::user("bob"), 8, 8).await;

        let mine = h
            .service
            .list_files(&alice(), FileFilter::default())
            .await
            .unwrap();
        assert_eq!(mine.total, 1);
        assert_eq!(mine.items[0].owner_id, "alice");

        let all = h
            .service
            .list_files(&Actor::admin("root"), FileFilter::default())
            .await
            .unwrap();
        assert_eq!(all.total, 2);
    }

    #[tokio::test]
    async fn test_private_file_hidden_from_others() {
        let h = test_service().await;
        let file = h.upload_image(&alice(), 8, 8).await;
        let err = h
            .service
            .get_file(&Actor::user("bob"), &file.uid)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "forbidden");
    }
}
