mod local;
mod s3;

pub mod key;

pub use local::{LocalStore, SignedQuery};
pub use s3::S3Store;

use std::fmt;
use std::ops::Range;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ObjectStoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Object not found: {0}")]
    NotFound(String),
    #[error("Invalid object key: {0}")]
    InvalidKey(String),
    #[error("Invalid or expired signature")]
    InvalidSignature,
    #[error("Operation not supported by this backend: {0}")]
    Unsupported(&'static str),
    #[error("Backend error: {0}")]
    Backend(String),
}

/// Address of an object: a bucket plus a key produced by [`key::encode`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectRef {
    pub bucket: String,
    pub key: String,
}

impl ObjectRef {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
        }
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.bucket, self.key)
    }
}

/// Optional operations a backend supports. Callers check the flag before
/// invoking the matching method; unsupported methods return
/// [`ObjectStoreError::Unsupported`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Capabilities {
    pub presign_put: bool,
    pub presign_get: bool,
    pub range_read: bool,
    pub copy: bool,
    pub public_url: bool,
    /// Objects are plain files the service can serve from disk.
    pub local_path: bool,
}

/// Result of a HEAD request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectHead {
    pub size: u64,
    pub content_type: Option<String>,
}

/// A time-limited request the client performs directly against storage.
#[derive(Debug, Clone, Serialize)]
pub struct PresignedRequest {
    pub method: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub expires_at: DateTime<Utc>,
}

/// Response header overrides baked into a presigned GET.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseOverrides {
    pub content_type: String,
    pub content_disposition: String,
}

/// Abstraction over object storage backends.
/// Keys are opaque; the raw blobs are meaningless without the metadata rows.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Provider tag recorded on file rows.
    fn provider(&self) -> &'static str;

    fn capabilities(&self) -> Capabilities;

    /// Size and content type, or `None` when the object does not exist.
    async fn head(&self, obj: &ObjectRef) -> Result<Option<ObjectHead>, ObjectStoreError>;

    async fn put(
        &self,
        obj: &ObjectRef,
        data: Bytes,
        content_type: &str,
    ) -> Result<(), ObjectStoreError>;

    /// Delete an object. Deleting a missing object succeeds.
    async fn delete(&self, obj: &ObjectRef) -> Result<(), ObjectStoreError>;

    /// Hex SHA-256 of the object, computed by streaming it in chunks.
    async fn sha256(&self, obj: &ObjectRef) -> Result<String, ObjectStoreError>;

    async fn presign_put(
        &self,
        _obj: &ObjectRef,
        _content_type: &str,
        _size: u64,
        _ttl: Duration,
    ) -> Result<PresignedRequest, ObjectStoreError> {
        Err(ObjectStoreError::Unsupported("presign_put"))
    }

    async fn presign_get(
        &self,
        _obj: &ObjectRef,
        _overrides: &ResponseOverrides,
        _ttl: Duration,
    ) -> Result<PresignedRequest, ObjectStoreError> {
        Err(ObjectStoreError::Unsupported("presign_get"))
    }

    /// Read a byte range. Ranges past the end are truncated.
    async fn read_range(
        &self,
        _obj: &ObjectRef,
        _range: Range<u64>,
    ) -> Result<Bytes, ObjectStoreError> {
        Err(ObjectStoreError::Unsupported("range_read"))
    }

    async fn copy(&self, _from: &ObjectRef, _to: &ObjectRef) -> Result<(), ObjectStoreError> {
        Err(ObjectStoreError::Unsupported("copy"))
    }

    fn public_url(&self, _obj: &ObjectRef) -> Option<String> {
        None
    }

    fn local_path(&self, _obj: &ObjectRef) -> Result<PathBuf, ObjectStoreError> {
        Err(ObjectStoreError::Unsupported("local_path"))
    }
}

pub(crate) fn hex_digest(digest: ring::digest::Digest) -> String {
    hex::encode(digest.as_ref())
}
