//! File service: upload lifecycle, delete/archive/move decisions and content
//! access resolution on top of an [`ObjectStore`] and a host [`Connector`].

mod access;
mod context;
mod error;
mod lifecycle;
mod outcome;
mod upload;

pub use access::{ContentAccess, ContentRequest};
pub use context::RequestContext;
pub use error::{ErrorKind, ServiceError};
pub use lifecycle::{DeleteOutcome, MetadataPatch, MoveOutcome, MoveRequest};
pub use outcome::{BatchOutcome, ItemFailure};
pub use upload::{NewUpload, TransferMode, UploadTicket, VariantTicket};

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cache::RedirectCache;
use crate::object_store::{key, ObjectRef, ObjectStore};
use crate::policy::UploadPolicy;
use crate::storage::models::FileRecord;
use crate::storage::Connector;
use crate::variants::ImageVariantPipeline;

/// Identity of the caller, as asserted by the host's auth layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub id: String,
    pub is_admin: bool,
}

impl Actor {
    pub fn user(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            is_admin: false,
        }
    }

    pub fn admin(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            is_admin: true,
        }
    }

    pub fn owns(&self, file: &FileRecord) -> bool {
        self.is_admin || self.id == file.owner_id
    }
}

#[derive(Debug, Clone)]
pub struct ServiceOptions {
    pub default_bucket: String,
    /// Bucket whose objects may be served through direct public URLs.
    pub public_bucket: Option<String>,
    pub presign_ttl: Duration,
    pub storage_timeout: Duration,
    /// Serve the original when a requested variant does not exist.
    pub variant_fallback: bool,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Self {
            default_bucket: "files".to_string(),
            public_bucket: None,
            presign_ttl: Duration::from_secs(900),
            storage_timeout: Duration::from_secs(30),
            variant_fallback: true,
        }
    }
}

pub struct FileService {
    store: Arc<dyn ObjectStore>,
    connector: Arc<dyn Connector>,
    policy: UploadPolicy,
    cache: RedirectCache,
    pipeline: ImageVariantPipeline,
    options: ServiceOptions,
}

impl FileService {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        connector: Arc<dyn Connector>,
        policy: UploadPolicy,
        cache: RedirectCache,
        pipeline: ImageVariantPipeline,
        options: ServiceOptions,
    ) -> Self {
        Self {
            store,
            connector,
            policy,
            cache,
            pipeline,
            options,
        }
    }

    /// A fresh request context bounded by the configured storage timeout.
    pub fn context(&self) -> RequestContext {
        RequestContext::new(self.options.storage_timeout)
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    pub fn connector(&self) -> &Arc<dyn Connector> {
        &self.connector
    }

    pub fn policy(&self) -> &UploadPolicy {
        &self.policy
    }

    pub fn cache(&self) -> &RedirectCache {
        &self.cache
    }

    pub fn options(&self) -> &ServiceOptions {
        &self.options
    }

    async fn load_file(&self, uid: &str) -> Result<FileRecord, ServiceError> {
        self.connector
            .get_file(uid)
            .await?
            .ok_or_else(|| ServiceError::FileNotFound(uid.to_string()))
    }

    /// Load a file the actor may modify.
    async fn load_owned(&self, actor: &Actor, uid: &str) -> Result<FileRecord, ServiceError> {
        let file = self.load_file(uid).await?;
        if !actor.owns(&file) {
            return Err(ServiceError::Forbidden(uid.to_string()));
        }
        Ok(file)
    }

    /// Pick the bucket for a new or moved object. Only configured buckets are
    /// accepted; public files land in the public bucket when one exists.
    fn resolve_bucket(&self, hint: Option<&str>, is_public: bool) -> Result<String, ServiceError> {
        let bucket = match hint {
            Some(bucket) => {
                let known = bucket == self.options.default_bucket
                    || self.options.public_bucket.as_deref() == Some(bucket);
                if !known {
                    return Err(ServiceError::InvalidRequest(format!(
                        "Unknown bucket '{bucket}'"
                    )));
                }
                bucket.to_string()
            }
            None if is_public => self
                .options
                .public_bucket
                .clone()
                .unwrap_or_else(|| self.options.default_bucket.clone()),
            None => self.options.default_bucket.clone(),
        };
        key::validate_bucket(&bucket)?;
        Ok(bucket)
    }

    /// Folder path a file's object lives under.
    fn folder_of(file: &FileRecord) -> Result<String, ServiceError> {
        Ok(key::decode(&file.object_key)?.folder.join("/"))
    }

    /// Delete objects best-effort, collecting per-object failures.
    async fn delete_objects(
        &self,
        ctx: &RequestContext,
        objects: Vec<ObjectRef>,
    ) -> BatchOutcome<ObjectRef> {
        let mut outcome = BatchOutcome::new();
        for obj in objects {
            match ctx.run("delete", self.store.delete(&obj)).await {
                Ok(()) => outcome.succeed(obj),
                Err(e) => {
                    tracing::warn!(object = %obj, error = %e, "Failed to delete object");
                    outcome.fail(obj, e);
                }
            }
        }
        outcome
    }
}
