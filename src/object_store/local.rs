use std::io::SeekFrom;
use std::ops::Range;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use bytes::Bytes;
use chrono::Utc;
use ring::hmac;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use super::key;
use super::{
    hex_digest, Capabilities, ObjectHead, ObjectRef, ObjectStore, ObjectStoreError,
    PresignedRequest, ResponseOverrides,
};

const HASH_CHUNK: usize = 64 * 1024;

/// Local filesystem object store. Buckets are directories under the root.
///
/// With a signing secret configured the store also issues presigned URLs that
/// point at the service's own `/_storage` endpoint.
pub struct LocalStore {
    base_path: PathBuf,
    signer: Option<UrlSigner>,
}

struct UrlSigner {
    key: hmac::Key,
    base_url: String,
}

/// Query string carried by a locally signed URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedQuery {
    pub expires: i64,
    pub sig: String,
    #[serde(default)]
    pub ct: Option<String>,
    #[serde(default)]
    pub cd: Option<String>,
}

impl LocalStore {
    pub fn new<P: AsRef<Path>>(base_path: P) -> Result<Self, std::io::Error> {
        let base_path = base_path.as_ref().to_path_buf();
        std::fs::create_dir_all(&base_path)?;
        Ok(Self {
            base_path,
            signer: None,
        })
    }

    /// Enable presigned URLs rooted at `base_url`.
    pub fn with_signing(mut self, secret: &[u8], base_url: &str) -> Self {
        self.signer = Some(UrlSigner {
            key: hmac::Key::new(hmac::HMAC_SHA256, secret),
            base_url: base_url.trim_end_matches('/').to_string(),
        });
        self
    }

    fn object_path(&self, obj: &ObjectRef) -> Result<PathBuf, ObjectStoreError> {
        key::validate_bucket(&obj.bucket)
            .map_err(|e| ObjectStoreError::InvalidKey(e.to_string()))?;
        key::check_relative(&obj.key).map_err(|e| ObjectStoreError::InvalidKey(e.to_string()))?;

        let mut path = self.base_path.join(&obj.bucket);
        for segment in obj.key.split('/') {
            path.push(segment);
        }

        // The joined path must stay under the root.
        let confined = path
            .strip_prefix(&self.base_path)
            .map(|rel| rel.components().all(|c| matches!(c, Component::Normal(_))))
            .unwrap_or(false);
        if !confined {
            return Err(ObjectStoreError::InvalidKey(obj.to_string()));
        }
        Ok(path)
    }

    fn signer(&self) -> Result<&UrlSigner, ObjectStoreError> {
        self.signer
            .as_ref()
            .ok_or(ObjectStoreError::Unsupported("signing"))
    }

    fn sign(
        &self,
        method: &str,
        obj: &ObjectRef,
        expires: i64,
        ct: Option<&str>,
        cd: Option<&str>,
    ) -> Result<String, ObjectStoreError> {
        let signer = self.signer()?;
        let message = signing_message(method, obj, expires, ct, cd);
        let tag = hmac::sign(&signer.key, message.as_bytes());
        Ok(base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(tag.as_ref()))
    }

    fn signed_url(
        &self,
        method: &str,
        obj: &ObjectRef,
        ttl: Duration,
        ct: Option<&str>,
        cd: Option<&str>,
    ) -> Result<PresignedRequest, ObjectStoreError> {
        let signer = self.signer()?;
        let expires_at = Utc::now()
            + chrono::Duration::from_std(ttl)
                .map_err(|e| ObjectStoreError::Backend(e.to_string()))?;
        let expires = expires_at.timestamp();
        let query = SignedQuery {
            expires,
            sig: self.sign(method, obj, expires, ct, cd)?,
            ct: ct.map(str::to_string),
            cd: cd.map(str::to_string),
        };
        let query =
            serde_qs::to_string(&query).map_err(|e| ObjectStoreError::Backend(e.to_string()))?;

        Ok(PresignedRequest {
            method: method.to_string(),
            // Escape '%' so the router's percent-decoding yields the key verbatim.
            url: format!(
                "{}/_storage/{}/{}?{}",
                signer.base_url,
                obj.bucket,
                obj.key.replace('%', "%25"),
                query
            ),
            headers: Vec::new(),
            expires_at,
        })
    }

    /// Check a signed URL presented to the `/_storage` endpoint.
    pub fn verify(
        &self,
        method: &str,
        obj: &ObjectRef,
        query: &SignedQuery,
    ) -> Result<(), ObjectStoreError> {
        let signer = self.signer()?;
        if query.expires < Utc::now().timestamp() {
            return Err(ObjectStoreError::InvalidSignature);
        }
        let tag = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .decode(&query.sig)
            .map_err(|_| ObjectStoreError::InvalidSignature)?;
        let message = signing_message(
            method,
            obj,
            query.expires,
            query.ct.as_deref(),
            query.cd.as_deref(),
        );
        hmac::verify(&signer.key, message.as_bytes(), &tag)
            .map_err(|_| ObjectStoreError::InvalidSignature)
    }
}

fn signing_message(
    method: &str,
    obj: &ObjectRef,
    expires: i64,
    ct: Option<&str>,
    cd: Option<&str>,
) -> String {
    format!(
        "{method}\n{}\n{}\n{expires}\n{}\n{}",
        obj.bucket,
        obj.key,
        ct.unwrap_or_default(),
        cd.unwrap_or_default()
    )
}

fn not_found_as(obj: &ObjectRef) -> impl Fn(std::io::Error) -> ObjectStoreError + '_ {
    move |e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            ObjectStoreError::NotFound(obj.to_string())
        } else {
            ObjectStoreError::Io(e)
        }
    }
}

#[async_trait]
impl ObjectStore for LocalStore {
    fn provider(&self) -> &'static str {
        "local"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            presign_put: self.signer.is_some(),
            presign_get: self.signer.is_some(),
            range_read: true,
            copy: true,
            public_url: false,
            local_path: true,
        }
    }

    async fn head(&self, obj: &ObjectRef) -> Result<Option<ObjectHead>, ObjectStoreError> {
        let path = self.object_path(obj)?;
        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => Ok(Some(ObjectHead {
                size: meta.len(),
                content_type: None,
            })),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn put(
        &self,
        obj: &ObjectRef,
        data: Bytes,
        _content_type: &str,
    ) -> Result<(), ObjectStoreError> {
        let path = self.object_path(obj)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        // Write to a sibling temp file and rename so readers never see a partial object.
        let tmp = path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4().simple()));
        tokio::fs::write(&tmp, &data).await?;
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn delete(&self, obj: &ObjectRef) -> Result<(), ObjectStoreError> {
        let path = self.object_path(obj)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn sha256(&self, obj: &ObjectRef) -> Result<String, ObjectStoreError> {
        let path = self.object_path(obj)?;
        let mut file = tokio::fs::File::open(&path).await.map_err(not_found_as(obj))?;

        let mut ctx = ring::digest::Context::new(&ring::digest::SHA256);
        let mut buf = vec![0u8; HASH_CHUNK];
        loop {
            let n = file.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            ctx.update(&buf[..n]);
        }
        Ok(hex_digest(ctx.finish()))
    }

    async fn presign_put(
        &self,
        obj: &ObjectRef,
        content_type: &str,
        _size: u64,
        ttl: Duration,
    ) -> Result<PresignedRequest, ObjectStoreError> {
        self.object_path(obj)?;
        let mut req = self.signed_url("PUT", obj, ttl, Some(content_type), None)?;
        req.headers
            .push(("content-type".to_string(), content_type.to_string()));
        Ok(req)
    }

    async fn presign_get(
        &self,
        obj: &ObjectRef,
        overrides: &ResponseOverrides,
        ttl: Duration,
    ) -> Result<PresignedRequest, ObjectStoreError> {
        self.object_path(obj)?;
        self.signed_url(
            "GET",
            obj,
            ttl,
            Some(&overrides.content_type),
            Some(&overrides.content_disposition),
        )
    }

    async fn read_range(
        &self,
        obj: &ObjectRef,
        range: Range<u64>,
    ) -> Result<Bytes, ObjectStoreError> {
        let path = self.object_path(obj)?;
        let mut file = tokio::fs::File::open(&path).await.map_err(not_found_as(obj))?;
        if range.end <= range.start {
            return Ok(Bytes::new());
        }

        file.seek(SeekFrom::Start(range.start)).await?;
        let mut buf = Vec::new();
        file.take(range.end - range.start).read_to_end(&mut buf).await?;
        Ok(Bytes::from(buf))
    }

    async fn copy(&self, from: &ObjectRef, to: &ObjectRef) -> Result<(), ObjectStoreError> {
        let src = self.object_path(from)?;
        let dst = self.object_path(to)?;
        if let Some(parent) = dst.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(&src, &dst).await.map_err(not_found_as(from))?;
        Ok(())
    }

    fn local_path(&self, obj: &ObjectRef) -> Result<PathBuf, ObjectStoreError> {
        self.object_path(obj)
    }
}
