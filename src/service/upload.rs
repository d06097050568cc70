use bytes::Bytes;
use chrono::Utc;
use ring::digest;
use serde::Serialize;
use uuid::Uuid;

use super::{Actor, BatchOutcome, FileService, RequestContext, ServiceError};
use crate::object_store::{hex_digest, key, ObjectRef, PresignedRequest};
use crate::policy::{PolicyViolation, Purpose};
use crate::sniff::{normalize_mime, sniff, Sniffed, SNIFF_LEN};
use crate::storage::models::{FileRecord, FileType, VariantKind, VariantRecord};
use crate::variants::{EncodedVariant, OutputFormat};

/// Description of a file about to be uploaded.
#[derive(Debug, Clone)]
pub struct NewUpload {
    pub purpose: Purpose,
    pub filename: String,
    /// Declared type. Guessed from the filename when absent.
    pub mime_type: Option<String>,
    /// Declared size. Ignored for proxied uploads, which measure the body.
    pub size: u64,
    pub folder: String,
    pub bucket: Option<String>,
    pub is_public: bool,
    pub title: Option<String>,
    pub alt_text: Option<String>,
    pub tags: Vec<String>,
}

impl NewUpload {
    pub fn new(purpose: Purpose, filename: impl Into<String>, size: u64) -> Self {
        Self {
            purpose,
            filename: filename.into(),
            mime_type: None,
            size,
            folder: String::new(),
            bucket: None,
            is_public: false,
            title: None,
            alt_text: None,
            tags: Vec::new(),
        }
    }
}

/// How the client transfers the bytes.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum TransferMode {
    /// PUT directly to storage, then call finalize.
    Presigned { request: PresignedRequest },
    /// PUT the body to this service endpoint.
    Proxied { endpoint: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct UploadTicket {
    pub file_uid: String,
    pub object: ObjectRef,
    #[serde(flatten)]
    pub transfer: TransferMode,
}

#[derive(Debug, Clone, Serialize)]
pub struct VariantTicket {
    pub file_uid: String,
    pub kind: VariantKind,
    pub object: ObjectRef,
    #[serde(flatten)]
    pub transfer: TransferMode,
}

fn declared_mime(mime_type: Option<&str>, filename: &str) -> String {
    match mime_type.map(normalize_mime).filter(|m| !m.is_empty()) {
        Some(mime) => mime,
        None => mime_guess::from_path(filename)
            .first_or_octet_stream()
            .essence_str()
            .to_string(),
    }
}

fn leading(data: &Bytes) -> &[u8] {
    &data[..data.len().min(SNIFF_LEN as usize)]
}

fn sha256_hex(data: &[u8]) -> String {
    hex_digest(digest::digest(&digest::SHA256, data))
}

fn check_filename(filename: &str) -> Result<(), ServiceError> {
    if filename.trim().is_empty() {
        return Err(ServiceError::InvalidRequest(
            "filename must not be empty".to_string(),
        ));
    }
    Ok(())
}

/// Variants are always images, whatever the parent purpose allows.
fn check_variant_mime(file: &FileRecord, mime_type: &str) -> Result<(), ServiceError> {
    if normalize_mime(mime_type).starts_with("image/") {
        Ok(())
    } else {
        Err(PolicyViolation::MimeNotAllowed {
            purpose: file.purpose,
            mime_type: mime_type.to_string(),
        }
        .into())
    }
}

fn ensure_variant_source(file: &FileRecord) -> Result<(), ServiceError> {
    if !file.is_finalized() {
        return Err(ServiceError::InvalidState(format!(
            "File '{}' has not been finalized",
            file.uid
        )));
    }
    if file.file_type() != FileType::Image {
        return Err(ServiceError::InvalidRequest(format!(
            "Variants are only supported for images, '{}' is {}",
            file.uid, file.mime_type
        )));
    }
    Ok(())
}

impl FileService {
    // ========================================================================
    // Original uploads
    // ========================================================================

    /// Validate an upload, reserve its location and issue transfer instructions.
    /// The returned file is provisional until [`FileService::upload_finalize`].
    pub async fn upload_init(
        &self,
        ctx: &RequestContext,
        actor: &Actor,
        req: NewUpload,
    ) -> Result<UploadTicket, ServiceError> {
        check_filename(&req.filename)?;
        let mime_type = declared_mime(req.mime_type.as_deref(), &req.filename);
        self.policy.validate(req.purpose, &mime_type, req.size)?;

        let bucket = self.resolve_bucket(req.bucket.as_deref(), req.is_public)?;
        let uid = Uuid::new_v4().to_string();
        let obj = ObjectRef::new(bucket, key::encode(&req.folder, &uid, None)?);

        let transfer = self
            .transfer_for(ctx, &obj, &mime_type, req.size, format!("/uploads/{uid}/content"))
            .await?;

        let size = req.size;
        let file = self.new_record(actor, req, &uid, mime_type, size, &obj);
        self.connector.insert_file(&file).await?;

        tracing::debug!(file_uid = %uid, object = %obj, "Upload initialised");
        Ok(UploadTicket {
            file_uid: uid,
            object: obj,
            transfer,
        })
    }

    /// Confirm a presigned upload landed, then sniff, hash and finalize it.
    /// Finalizing an already finalized file returns it unchanged.
    pub async fn upload_finalize(
        &self,
        ctx: &RequestContext,
        actor: &Actor,
        uid: &str,
        written: Option<&ObjectRef>,
    ) -> Result<FileRecord, ServiceError> {
        let file = self.load_owned(actor, uid).await?;
        let expected = file.object_ref();
        if let Some(actual) = written {
            if *actual != expected {
                return Err(ServiceError::LocationConflict {
                    expected,
                    actual: actual.clone(),
                });
            }
        }
        if file.is_finalized() {
            return Ok(file);
        }
        self.finalize_file(ctx, file).await
    }

    /// Receive the body of an initialised upload through the service.
    pub async fn upload_content(
        &self,
        ctx: &RequestContext,
        actor: &Actor,
        uid: &str,
        data: Bytes,
    ) -> Result<FileRecord, ServiceError> {
        let file = self.load_owned(actor, uid).await?;
        if file.is_finalized() {
            return Err(ServiceError::InvalidState(format!(
                "File '{uid}' is already finalized"
            )));
        }

        self.policy.check_size(file.purpose, data.len() as u64)?;
        let sniffed = sniff(leading(&data), Some(&file.mime_type), Some(&file.filename));
        self.policy.check_mime(file.purpose, &sniffed.mime_type)?;

        ctx.run(
            "put",
            self.store.put(&file.object_ref(), data, &sniffed.mime_type),
        )
        .await?;
        self.finalize_file(ctx, file).await
    }

    /// Single-step upload: validate, write and finalize in one call.
    pub async fn upload_proxied(
        &self,
        ctx: &RequestContext,
        actor: &Actor,
        req: NewUpload,
        data: Bytes,
    ) -> Result<FileRecord, ServiceError> {
        check_filename(&req.filename)?;
        let declared = declared_mime(req.mime_type.as_deref(), &req.filename);
        let size = data.len() as u64;
        let sniffed = sniff(leading(&data), Some(&declared), Some(&req.filename));
        self.policy.validate(req.purpose, &sniffed.mime_type, size)?;

        let bucket = self.resolve_bucket(req.bucket.as_deref(), req.is_public)?;
        let uid = Uuid::new_v4().to_string();
        let obj = ObjectRef::new(bucket, key::encode(&req.folder, &uid, None)?);

        ctx.run("put", self.store.put(&obj, data.clone(), &sniffed.mime_type))
            .await?;

        let Sniffed {
            mime_type,
            width,
            height,
        } = sniffed;
        let mut file = self.new_record(actor, req, &uid, mime_type, size, &obj);
        file.content_hash = Some(sha256_hex(&data));
        file.width = width;
        file.height = height;

        if let Err(e) = self.connector.insert_file(&file).await {
            self.discard_object(ctx, &obj).await;
            return Err(e.into());
        }

        tracing::debug!(file_uid = %uid, object = %obj, size, "Proxied upload stored");
        Ok(file)
    }

    // ========================================================================
    // Variant uploads
    // ========================================================================

    pub async fn variant_upload_init(
        &self,
        ctx: &RequestContext,
        actor: &Actor,
        file_uid: &str,
        kind: VariantKind,
        mime_type: &str,
        size: u64,
    ) -> Result<VariantTicket, ServiceError> {
        let file = self.load_owned(actor, file_uid).await?;
        ensure_variant_source(&file)?;
        let mime_type = normalize_mime(mime_type);
        check_variant_mime(&file, &mime_type)?;
        self.policy.check_size(file.purpose, size)?;

        let obj = self.variant_ref(&file, kind)?;
        let transfer = self
            .transfer_for(
                ctx,
                &obj,
                &mime_type,
                size,
                format!("/files/{file_uid}/variants/{kind}/content"),
            )
            .await?;

        let now = Utc::now();
        let variant = VariantRecord {
            file_uid: file.uid.clone(),
            kind,
            mime_type,
            byte_size: size,
            bucket: obj.bucket.clone(),
            object_key: obj.key.clone(),
            provider: self.store.provider().to_string(),
            created_at: now,
            updated_at: now,
            content_hash: None,
            width: None,
            height: None,
        };
        self.connector.put_variant(&variant).await?;

        tracing::debug!(file_uid, %kind, object = %obj, "Variant upload initialised");
        Ok(VariantTicket {
            file_uid: file.uid,
            kind,
            object: obj,
            transfer,
        })
    }

    pub async fn variant_upload_finalize(
        &self,
        ctx: &RequestContext,
        actor: &Actor,
        file_uid: &str,
        kind: VariantKind,
    ) -> Result<VariantRecord, ServiceError> {
        let file = self.load_owned(actor, file_uid).await?;
        let variant = self.load_variant(file_uid, kind).await?;
        if variant.is_finalized() {
            return Ok(variant);
        }
        self.finalize_variant(ctx, &file, variant).await
    }

    pub async fn variant_upload_content(
        &self,
        ctx: &RequestContext,
        actor: &Actor,
        file_uid: &str,
        kind: VariantKind,
        data: Bytes,
    ) -> Result<VariantRecord, ServiceError> {
        let file = self.load_owned(actor, file_uid).await?;
        let variant = self.load_variant(file_uid, kind).await?;
        if variant.is_finalized() {
            return Err(ServiceError::InvalidState(format!(
                "Variant '{kind}' of file '{file_uid}' is already finalized"
            )));
        }

        self.policy.check_size(file.purpose, data.len() as u64)?;
        let sniffed = sniff(leading(&data), Some(&variant.mime_type), None);
        check_variant_mime(&file, &sniffed.mime_type)?;

        ctx.run(
            "put",
            self.store
                .put(&variant.object_ref(), data, &sniffed.mime_type),
        )
        .await?;
        self.finalize_variant(ctx, &file, variant).await
    }

    /// Render every variant kind from the stored original.
    pub async fn derive_variants(
        &self,
        ctx: &RequestContext,
        actor: &Actor,
        file_uid: &str,
        formats: Vec<OutputFormat>,
    ) -> Result<BatchOutcome<VariantKind>, ServiceError> {
        let file = self.load_owned(actor, file_uid).await?;
        ensure_variant_source(&file)?;
        if !self.store.capabilities().range_read {
            return Err(ServiceError::CapabilityMissing("range_read"));
        }
        let source = ctx
            .run(
                "read_range",
                self.store.read_range(&file.object_ref(), 0..file.byte_size),
            )
            .await?;
        self.render_variants(ctx, &file, source, formats).await
    }

    /// Render every variant kind from bytes the caller already holds.
    pub async fn derive_variants_from(
        &self,
        ctx: &RequestContext,
        actor: &Actor,
        file_uid: &str,
        source: Bytes,
        formats: Vec<OutputFormat>,
    ) -> Result<BatchOutcome<VariantKind>, ServiceError> {
        let file = self.load_owned(actor, file_uid).await?;
        ensure_variant_source(&file)?;
        self.render_variants(ctx, &file, source, formats).await
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    fn new_record(
        &self,
        actor: &Actor,
        req: NewUpload,
        uid: &str,
        mime_type: String,
        byte_size: u64,
        obj: &ObjectRef,
    ) -> FileRecord {
        let now = Utc::now();
        FileRecord {
            uid: uid.to_string(),
            owner_id: actor.id.clone(),
            filename: req.filename,
            mime_type,
            byte_size,
            purpose: req.purpose,
            bucket: obj.bucket.clone(),
            object_key: obj.key.clone(),
            provider: self.store.provider().to_string(),
            is_public: req.is_public,
            created_at: now,
            updated_at: now,
            content_hash: None,
            width: None,
            height: None,
            title: req.title,
            alt_text: req.alt_text,
            tags: req.tags,
            archived_at: None,
        }
    }

    async fn transfer_for(
        &self,
        ctx: &RequestContext,
        obj: &ObjectRef,
        mime_type: &str,
        size: u64,
        endpoint: String,
    ) -> Result<TransferMode, ServiceError> {
        if !self.store.capabilities().presign_put {
            return Ok(TransferMode::Proxied { endpoint });
        }
        let request = ctx
            .run(
                "presign_put",
                self.store
                    .presign_put(obj, mime_type, size, self.options.presign_ttl),
            )
            .await?;
        Ok(TransferMode::Presigned { request })
    }

    async fn load_variant(
        &self,
        file_uid: &str,
        kind: VariantKind,
    ) -> Result<VariantRecord, ServiceError> {
        self.connector
            .get_variant(file_uid, kind)
            .await?
            .ok_or_else(|| ServiceError::VariantNotFound {
                file_uid: file_uid.to_string(),
                kind,
            })
    }

    fn variant_ref(&self, file: &FileRecord, kind: VariantKind) -> Result<ObjectRef, ServiceError> {
        let folder = Self::folder_of(file)?;
        Ok(ObjectRef::new(
            &file.bucket,
            key::encode(&folder, &file.uid, Some(kind))?,
        ))
    }

    /// HEAD the object, then sniff its leading bytes when ranged reads exist.
    /// Returns the stored size and the sniff result.
    async fn inspect(
        &self,
        ctx: &RequestContext,
        obj: &ObjectRef,
        declared: &str,
        filename: Option<&str>,
        purpose: Purpose,
    ) -> Result<(u64, Sniffed), ServiceError> {
        let head = ctx
            .run("head", self.store.head(obj))
            .await?
            .ok_or_else(|| ServiceError::ObjectMissing(obj.clone()))?;

        if let Err(violation) = self.policy.check_size(purpose, head.size) {
            self.discard_object(ctx, obj).await;
            return Err(violation.into());
        }

        let head_bytes = if self.store.capabilities().range_read {
            ctx.run(
                "read_range",
                self.store.read_range(obj, 0..SNIFF_LEN.min(head.size)),
            )
            .await?
        } else {
            Bytes::new()
        };
        Ok((head.size, sniff(&head_bytes, Some(declared), filename)))
    }

    async fn finalize_file(
        &self,
        ctx: &RequestContext,
        mut file: FileRecord,
    ) -> Result<FileRecord, ServiceError> {
        let obj = file.object_ref();
        let (size, sniffed) = self
            .inspect(ctx, &obj, &file.mime_type, Some(&file.filename), file.purpose)
            .await?;

        if let Err(violation) = self.policy.check_mime(file.purpose, &sniffed.mime_type) {
            self.discard_object(ctx, &obj).await;
            return Err(violation.into());
        }

        let hash = ctx.run("sha256", self.store.sha256(&obj)).await?;

        file.mime_type = sniffed.mime_type;
        file.byte_size = size;
        file.width = sniffed.width;
        file.height = sniffed.height;
        file.content_hash = Some(hash);
        file.updated_at = Utc::now();

        if !self.connector.update_file(&file).await? {
            return Err(ServiceError::FileNotFound(file.uid));
        }

        tracing::debug!(file_uid = %file.uid, mime_type = %file.mime_type, size, "Upload finalized");
        Ok(file)
    }

    async fn finalize_variant(
        &self,
        ctx: &RequestContext,
        file: &FileRecord,
        mut variant: VariantRecord,
    ) -> Result<VariantRecord, ServiceError> {
        let obj = variant.object_ref();
        let (size, sniffed) = self
            .inspect(ctx, &obj, &variant.mime_type, None, file.purpose)
            .await?;

        if let Err(e) = check_variant_mime(file, &sniffed.mime_type) {
            self.discard_object(ctx, &obj).await;
            return Err(e);
        }

        let hash = ctx.run("sha256", self.store.sha256(&obj)).await?;

        variant.mime_type = sniffed.mime_type;
        variant.byte_size = size;
        variant.width = sniffed.width;
        variant.height = sniffed.height;
        variant.content_hash = Some(hash);
        variant.updated_at = Utc::now();
        self.connector.put_variant(&variant).await?;
        self.cache.invalidate_file(&file.uid);

        tracing::debug!(file_uid = %file.uid, kind = %variant.kind, "Variant finalized");
        Ok(variant)
    }

    async fn render_variants(
        &self,
        ctx: &RequestContext,
        file: &FileRecord,
        source: Bytes,
        formats: Vec<OutputFormat>,
    ) -> Result<BatchOutcome<VariantKind>, ServiceError> {
        let widths = VariantKind::ALL.iter().map(|k| k.target_width()).collect();
        let rendered = self.pipeline.generate(source, widths, formats).await?;

        let mut outcome = BatchOutcome::new();
        for kind in VariantKind::ALL {
            // Smallest rendering that covers the bucket, else the largest one.
            let encoded = rendered
                .iter()
                .find(|v| v.width >= kind.target_width())
                .or_else(|| rendered.last());
            let Some(encoded) = encoded else {
                outcome.fail(kind, "no rendering produced");
                continue;
            };

            match self.store_variant(ctx, file, kind, encoded).await {
                Ok(()) => outcome.succeed(kind),
                Err(e) => {
                    tracing::warn!(file_uid = %file.uid, %kind, error = %e, "Failed to store variant");
                    outcome.fail(kind, e);
                }
            }
        }
        self.cache.invalidate_file(&file.uid);
        Ok(outcome)
    }

    async fn store_variant(
        &self,
        ctx: &RequestContext,
        file: &FileRecord,
        kind: VariantKind,
        encoded: &EncodedVariant,
    ) -> Result<(), ServiceError> {
        let obj = self.variant_ref(file, kind)?;
        let mime_type = encoded.format.mime_type();
        ctx.run("put", self.store.put(&obj, encoded.data.clone(), mime_type))
            .await?;

        let now = Utc::now();
        let variant = VariantRecord {
            file_uid: file.uid.clone(),
            kind,
            mime_type: mime_type.to_string(),
            byte_size: encoded.data.len() as u64,
            bucket: obj.bucket,
            object_key: obj.key,
            provider: self.store.provider().to_string(),
            created_at: now,
            updated_at: now,
            content_hash: Some(sha256_hex(&encoded.data)),
            width: Some(encoded.width),
            height: Some(encoded.height),
        };
        self.connector.put_variant(&variant).await?;
        Ok(())
    }

    /// Remove an object that failed validation after it was written.
    async fn discard_object(&self, ctx: &RequestContext, obj: &ObjectRef) {
        if let Err(e) = ctx.run("delete", self.store.delete(obj)).await {
            tracing::warn!(object = %obj, error = %e, "Failed to discard rejected object");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::ErrorKind;
    use crate::testutil::{png_bytes, test_service, TestHarness};

    fn alice() -> Actor {
        Actor::user("alice")
    }

    async fn presigned_init(h: &TestHarness, req: NewUpload) -> UploadTicket {
        h.service
            .upload_init(&h.service.context(), &alice(), req)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_init_creates_provisional_record() {
        let h = test_service().await;
        let mut req = NewUpload::new(Purpose::General, "report.pdf", 1024);
        req.folder = "reports/2024".to_string();

        let first = presigned_init(&h, req.clone()).await;
        let second = presigned_init(&h, req).await;
        assert_ne!(first.file_uid, second.file_uid);
        assert!(first.object.key.starts_with("reports/2024/"));
        assert!(matches!(first.transfer, TransferMode::Presigned { .. }));

        let record = h.db.get_file(&first.file_uid).unwrap().unwrap();
        assert!(!record.is_finalized());
        assert_eq!(record.width, None);
        assert_eq!(record.mime_type, "application/pdf");
        assert_eq!(record.owner_id, "alice");
    }

    #[tokio::test]
    async fn test_init_rejects_policy_violation_without_storage_io() {
        let h = test_service().await;
        let mut req = NewUpload::new(Purpose::Avatar, "page.html", 100);
        req.mime_type = Some("text/html".to_string());

        let err = h
            .service
            .upload_init(&h.service.context(), &alice(), req)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "mime_not_allowed");
        assert_eq!(h.store.presign_calls(), 0);

        let err = h
            .service
            .upload_init(
                &h.service.context(),
                &alice(),
                NewUpload::new(Purpose::Avatar, "me.png", 6 * 1024 * 1024),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), "file_too_large");
    }

    #[tokio::test]
    async fn test_init_falls_back_to_proxied_transfer() {
        let h = test_service().await;
        h.store.set_presign(false);
        let ticket = presigned_init(&h, NewUpload::new(Purpose::General, "a.txt", 5)).await;
        match ticket.transfer {
            TransferMode::Proxied { endpoint } => {
                assert_eq!(endpoint, format!("/uploads/{}/content", ticket.file_uid));
            }
            other => panic!("expected proxied transfer, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_finalize_missing_object_leaves_record_provisional() {
        let h = test_service().await;
        let ticket = presigned_init(&h, NewUpload::new(Purpose::General, "a.txt", 5)).await;

        let err = h
            .service
            .upload_finalize(&h.service.context(), &alice(), &ticket.file_uid, None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(err.code(), "object_missing");

        let record = h.db.get_file(&ticket.file_uid).unwrap().unwrap();
        assert!(!record.is_finalized());
        assert_eq!(record.byte_size, 5);
    }

    #[tokio::test]
    async fn test_finalize_sniffs_and_hashes() {
        let h = test_service().await;
        let png = png_bytes(40, 30);
        let mut req = NewUpload::new(Purpose::Avatar, "me.png", png.len() as u64);
        req.mime_type = Some("image/png".to_string());
        let ticket = presigned_init(&h, req).await;

        h.put_object(&ticket.object, png.clone()).await;
        let file = h
            .service
            .upload_finalize(
                &h.service.context(),
                &alice(),
                &ticket.file_uid,
                Some(&ticket.object),
            )
            .await
            .unwrap();

        assert!(file.is_finalized());
        assert_eq!(file.content_hash.as_deref(), Some(sha256_hex(&png).as_str()));
        assert_eq!((file.width, file.height), (Some(40), Some(30)));
        assert_eq!(file.byte_size, png.len() as u64);

        // Second finalize is a no-op.
        let again = h
            .service
            .upload_finalize(&h.service.context(), &alice(), &ticket.file_uid, None)
            .await
            .unwrap();
        assert_eq!(again, file);
    }

    #[tokio::test]
    async fn test_finalize_rejects_disguised_content() {
        let h = test_service().await;
        let mut req = NewUpload::new(Purpose::Avatar, "me.png", 64);
        req.mime_type = Some("image/png".to_string());
        let ticket = presigned_init(&h, req).await;

        h.put_object(&ticket.object, Bytes::from_static(b"%PDF-1.7\n%fake\n"))
            .await;
        let err = h
            .service
            .upload_finalize(&h.service.context(), &alice(), &ticket.file_uid, None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "mime_not_allowed");
        assert!(h.store.head_now(&ticket.object).await.is_none());
        assert!(!h.db.get_file(&ticket.file_uid).unwrap().unwrap().is_finalized());
    }

    #[tokio::test]
    async fn test_finalize_conflicting_location() {
        let h = test_service().await;
        let ticket = presigned_init(&h, NewUpload::new(Purpose::General, "a.txt", 5)).await;
        let other = ObjectRef::new("files", "elsewhere");
        let err = h
            .service
            .upload_finalize(&h.service.context(), &alice(), &ticket.file_uid, Some(&other))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "location_conflict");
    }

    #[tokio::test]
    async fn test_finalize_by_other_user_is_forbidden() {
        let h = test_service().await;
        let ticket = presigned_init(&h, NewUpload::new(Purpose::General, "a.txt", 5)).await;
        let err = h
            .service
            .upload_finalize(
                &h.service.context(),
                &Actor::user("mallory"),
                &ticket.file_uid,
                None,
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Authorization);
    }

    #[tokio::test]
    async fn test_upload_content_finalizes() {
        let h = test_service().await;
        let ticket = presigned_init(&h, NewUpload::new(Purpose::General, "notes.txt", 11)).await;
        let file = h
            .service
            .upload_content(
                &h.service.context(),
                &alice(),
                &ticket.file_uid,
                Bytes::from_static(b"hello world"),
            )
            .await
            .unwrap();
        assert!(file.is_finalized());
        assert_eq!(file.mime_type, "text/plain");

        let err = h
            .service
            .upload_content(
                &h.service.context(),
                &alice(),
                &ticket.file_uid,
                Bytes::from_static(b"again"),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), "invalid_state");
    }

    #[tokio::test]
    async fn test_proxied_upload_is_finalized_immediately() {
        let h = test_service().await;
        let png = png_bytes(16, 8);
        let file = h
            .service
            .upload_proxied(
                &h.service.context(),
                &alice(),
                NewUpload::new(Purpose::Embedded, "diagram.png", 0),
                png.clone(),
            )
            .await
            .unwrap();
        assert!(file.is_finalized());
        assert_eq!(file.mime_type, "image/png");
        assert_eq!((file.width, file.height), (Some(16), Some(8)));
        assert_eq!(h.store.head_now(&file.object_ref()).await.unwrap().size, png.len() as u64);
    }

    #[tokio::test]
    async fn test_proxied_upload_rejects_empty_body() {
        let h = test_service().await;
        let err = h
            .service
            .upload_proxied(
                &h.service.context(),
                &alice(),
                NewUpload::new(Purpose::General, "empty.bin", 0),
                Bytes::new(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), "empty_file");
    }

    #[tokio::test]
    async fn test_variant_upload_round() {
        let h = test_service().await;
        let original = h.upload_image(&alice(), 64, 64).await;
        let thumb = png_bytes(32, 32);

        let ticket = h
            .service
            .variant_upload_init(
                &h.service.context(),
                &alice(),
                &original.uid,
                VariantKind::Thumbnail,
                "image/png",
                thumb.len() as u64,
            )
            .await
            .unwrap();
        assert!(ticket.object.key.ends_with("@thumbnail"));

        h.put_object(&ticket.object, thumb).await;
        let variant = h
            .service
            .variant_upload_finalize(
                &h.service.context(),
                &alice(),
                &original.uid,
                VariantKind::Thumbnail,
            )
            .await
            .unwrap();
        assert!(variant.is_finalized());
        assert_eq!(variant.width, Some(32));
    }

    #[tokio::test]
    async fn test_variant_requires_image_parent() {
        let h = test_service().await;
        let doc = h
            .service
            .upload_proxied(
                &h.service.context(),
                &alice(),
                NewUpload::new(Purpose::General, "a.txt", 0),
                Bytes::from_static(b"text"),
            )
            .await
            .unwrap();
        let err = h
            .service
            .variant_upload_init(
                &h.service.context(),
                &alice(),
                &doc.uid,
                VariantKind::Web,
                "image/webp",
                10,
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), "invalid_request");
    }

    #[tokio::test]
    async fn test_derive_variants_stores_every_kind() {
        let h = test_service().await;
        let original = h.upload_image(&alice(), 900, 300).await;

        let outcome = h
            .service
            .derive_variants(
                &h.service.context(),
                &alice(),
                &original.uid,
                vec![OutputFormat::WebP],
            )
            .await
            .unwrap();
        assert!(outcome.is_complete());
        assert_eq!(outcome.succeeded, VariantKind::ALL.to_vec());

        let thumb = h.db.get_variant(&original.uid, VariantKind::Thumbnail).unwrap().unwrap();
        assert_eq!(thumb.width, Some(320));
        let web = h.db.get_variant(&original.uid, VariantKind::Web).unwrap().unwrap();
        assert_eq!(web.width, Some(900));
        assert_eq!(web.mime_type, "image/webp");
    }
}
