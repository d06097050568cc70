use std::ops::Range;
use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_s3::config::Region;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use bytes::Bytes;
use chrono::Utc;

use super::{
    hex_digest, Capabilities, ObjectHead, ObjectRef, ObjectStore, ObjectStoreError,
    PresignedRequest, ResponseOverrides,
};

/// S3-compatible object store backend (AWS, MinIO, R2, ...).
pub struct S3Store {
    client: Client,
    /// Base URL for public buckets (e.g. a CDN in front of the bucket).
    public_base_url: Option<String>,
}

impl S3Store {
    /// Build a client from the default AWS credential chain.
    pub async fn new(
        endpoint: Option<&str>,
        region: Option<&str>,
        force_path_style: bool,
        public_base_url: Option<String>,
    ) -> Self {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
        if let Some(endpoint) = endpoint {
            loader = loader.endpoint_url(endpoint);
        }
        if let Some(region) = region {
            loader = loader.region(Region::new(region.to_string()));
        }
        let shared = loader.load().await;

        let conf = aws_sdk_s3::config::Builder::from(&shared)
            .force_path_style(force_path_style)
            .build();

        Self::from_client(Client::from_conf(conf), public_base_url)
    }

    pub fn from_client(client: Client, public_base_url: Option<String>) -> Self {
        Self {
            client,
            public_base_url: public_base_url.map(|u| u.trim_end_matches('/').to_string()),
        }
    }
}

fn backend<E>(op: &str, err: E) -> ObjectStoreError
where
    E: std::error::Error + 'static,
{
    ObjectStoreError::Backend(format!("{op} failed: {}", DisplayErrorContext(err)))
}

fn presigning_config(ttl: Duration) -> Result<PresigningConfig, ObjectStoreError> {
    PresigningConfig::expires_in(ttl)
        .map_err(|e| ObjectStoreError::Backend(format!("Invalid presigning config: {e}")))
}

fn to_presigned(
    req: aws_sdk_s3::presigning::PresignedRequest,
    ttl: Duration,
) -> Result<PresignedRequest, ObjectStoreError> {
    let expires_at = Utc::now()
        + chrono::Duration::from_std(ttl).map_err(|e| ObjectStoreError::Backend(e.to_string()))?;
    Ok(PresignedRequest {
        method: req.method().to_string(),
        url: req.uri().to_string(),
        headers: req
            .headers()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
        expires_at,
    })
}

#[async_trait]
impl ObjectStore for S3Store {
    fn provider(&self) -> &'static str {
        "s3"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            presign_put: true,
            presign_get: true,
            range_read: true,
            copy: true,
            public_url: self.public_base_url.is_some(),
            local_path: false,
        }
    }

    async fn head(&self, obj: &ObjectRef) -> Result<Option<ObjectHead>, ObjectStoreError> {
        let result = self
            .client
            .head_object()
            .bucket(&obj.bucket)
            .key(&obj.key)
            .send()
            .await;

        match result {
            Ok(out) => Ok(Some(ObjectHead {
                size: out.content_length().unwrap_or(0).max(0) as u64,
                content_type: out.content_type().map(str::to_string),
            })),
            Err(err) => {
                if err.as_service_error().is_some_and(|e| e.is_not_found()) {
                    return Ok(None);
                }
                Err(backend("head_object", err))
            }
        }
    }

    async fn put(
        &self,
        obj: &ObjectRef,
        data: Bytes,
        content_type: &str,
    ) -> Result<(), ObjectStoreError> {
        self.client
            .put_object()
            .bucket(&obj.bucket)
            .key(&obj.key)
            .content_type(content_type)
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(|e| backend("put_object", e))?;

        tracing::debug!(object = %obj, "Object written to S3");
        Ok(())
    }

    async fn delete(&self, obj: &ObjectRef) -> Result<(), ObjectStoreError> {
        self.client
            .delete_object()
            .bucket(&obj.bucket)
            .key(&obj.key)
            .send()
            .await
            .map_err(|e| backend("delete_object", e))?;
        Ok(())
    }

    async fn sha256(&self, obj: &ObjectRef) -> Result<String, ObjectStoreError> {
        let out = self
            .client
            .get_object()
            .bucket(&obj.bucket)
            .key(&obj.key)
            .send()
            .await
            .map_err(|e| {
                if e.as_service_error().is_some_and(|se| se.is_no_such_key()) {
                    ObjectStoreError::NotFound(obj.to_string())
                } else {
                    backend("get_object", e)
                }
            })?;

        let mut ctx = ring::digest::Context::new(&ring::digest::SHA256);
        let mut body = out.body;
        while let Some(chunk) = body
            .try_next()
            .await
            .map_err(|e| backend("read object body", e))?
        {
            ctx.update(&chunk);
        }
        Ok(hex_digest(ctx.finish()))
    }

    async fn presign_put(
        &self,
        obj: &ObjectRef,
        content_type: &str,
        size: u64,
        ttl: Duration,
    ) -> Result<PresignedRequest, ObjectStoreError> {
        let req = self
            .client
            .put_object()
            .bucket(&obj.bucket)
            .key(&obj.key)
            .content_type(content_type)
            .content_length(size as i64)
            .presigned(presigning_config(ttl)?)
            .await
            .map_err(|e| backend("presign put_object", e))?;
        to_presigned(req, ttl)
    }

    async fn presign_get(
        &self,
        obj: &ObjectRef,
        overrides: &ResponseOverrides,
        ttl: Duration,
    ) -> Result<PresignedRequest, ObjectStoreError> {
        let req = self
            .client
            .get_object()
            .bucket(&obj.bucket)
            .key(&obj.key)
            .response_content_type(&overrides.content_type)
            .response_content_disposition(&overrides.content_disposition)
            .presigned(presigning_config(ttl)?)
            .await
            .map_err(|e| backend("presign get_object", e))?;
        to_presigned(req, ttl)
    }

    async fn read_range(
        &self,
        obj: &ObjectRef,
        range: Range<u64>,
    ) -> Result<Bytes, ObjectStoreError> {
        if range.end <= range.start {
            return Ok(Bytes::new());
        }

        let out = self
            .client
            .get_object()
            .bucket(&obj.bucket)
            .key(&obj.key)
            .range(format!("bytes={}-{}", range.start, range.end - 1))
            .send()
            .await
            .map_err(|e| {
                if e.as_service_error().is_some_and(|se| se.is_no_such_key()) {
                    ObjectStoreError::NotFound(obj.to_string())
                } else {
                    backend("ranged get_object", e)
                }
            })?;

        let data = out
            .body
            .collect()
            .await
            .map_err(|e| backend("read object body", e))?
            .into_bytes();
        Ok(data)
    }

    async fn copy(&self, from: &ObjectRef, to: &ObjectRef) -> Result<(), ObjectStoreError> {
        // The copy source is a URL path; keys may carry percent escapes of their own.
        let source = format!("{}/{}", from.bucket, from.key.replace('%', "%25"));
        self.client
            .copy_object()
            .copy_source(source)
            .bucket(&to.bucket)
            .key(&to.key)
            .send()
            .await
            .map_err(|e| backend("copy_object", e))?;
        Ok(())
    }

    fn public_url(&self, obj: &ObjectRef) -> Option<String> {
        self.public_base_url
            .as_ref()
            .map(|base| format!("{base}/{}/{}", obj.bucket, obj.key.replace('%', "%25")))
    }
}
