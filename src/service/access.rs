use std::path::PathBuf;

use serde::Deserialize;

use super::{Actor, FileService, RequestContext, ServiceError};
use crate::cache::{CacheKey, CachedRedirect};
use crate::object_store::{ObjectRef, ResponseOverrides};
use crate::sniff::is_dangerous_mime;
use crate::storage::models::{FileRecord, VariantKind};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ContentRequest {
    #[serde(default)]
    pub variant: Option<VariantKind>,
    /// Responsive width hint, mapped to the smallest covering variant.
    #[serde(default, rename = "w")]
    pub width_hint: Option<u32>,
    #[serde(default)]
    pub download: bool,
}

impl ContentRequest {
    fn requested_kind(&self) -> Option<VariantKind> {
        self.variant
            .or_else(|| self.width_hint.map(VariantKind::for_width))
    }
}

/// How the caller should deliver content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentAccess {
    Redirect {
        url: String,
        content_type: String,
        disposition: String,
    },
    Local {
        path: PathBuf,
        content_type: String,
        byte_size: u64,
        disposition: String,
    },
}

struct Served {
    kind: Option<VariantKind>,
    object: ObjectRef,
    content_type: String,
    byte_size: u64,
}

/// `Content-Disposition` value with a header-safe ASCII filename.
pub(crate) fn content_disposition(attachment: bool, filename: &str) -> String {
    let safe: String = filename
        .chars()
        .map(|c| match c {
            '"' | '\\' | ';' => '_',
            c if c.is_ascii_graphic() || c == ' ' => c,
            _ => '_',
        })
        .collect();
    let disposition = if attachment { "attachment" } else { "inline" };
    format!("{disposition}; filename=\"{safe}\"")
}

impl FileService {
    /// Resolve how to serve a file or one of its variants.
    ///
    /// Authorization is checked on every call, before the cache is consulted.
    /// A missing variant falls back to the original when enabled.
    pub async fn resolve_content_access(
        &self,
        ctx: &RequestContext,
        actor: Option<&Actor>,
        uid: &str,
        req: &ContentRequest,
    ) -> Result<ContentAccess, ServiceError> {
        let file = self.load_file(uid).await?;
        if !file.is_finalized() {
            return Err(ServiceError::FileNotFound(uid.to_string()));
        }
        let owner = actor.is_some_and(|a| a.owns(&file));
        if !owner && !(file.is_public && !file.is_archived()) {
            return Err(ServiceError::Forbidden(uid.to_string()));
        }

        let served = self.select_served(&file, req.requested_kind()).await?;
        let attachment = req.download || is_dangerous_mime(&served.content_type);
        let disposition = content_disposition(attachment, &file.filename);
        let capabilities = self.store.capabilities();

        if capabilities.local_path {
            let path = self.store.local_path(&served.object)?;
            return Ok(ContentAccess::Local {
                path,
                content_type: served.content_type,
                byte_size: served.byte_size,
                disposition,
            });
        }

        let cache_key = CacheKey {
            file_uid: file.uid.clone(),
            variant: served.kind,
            attachment,
        };
        if let Some(hit) = self.cache.get(&cache_key) {
            return Ok(ContentAccess::Redirect {
                url: hit.url,
                content_type: hit.content_type,
                disposition,
            });
        }

        let url = match self.public_url(&file, &served, attachment) {
            Some(url) => url,
            None if capabilities.presign_get => {
                let overrides = ResponseOverrides {
                    content_type: served.content_type.clone(),
                    content_disposition: disposition.clone(),
                };
                ctx.run(
                    "presign_get",
                    self.store
                        .presign_get(&served.object, &overrides, self.options.presign_ttl),
                )
                .await?
                .url
            }
            None => return Err(ServiceError::CapabilityMissing("presign_get")),
        };

        self.cache.insert(
            cache_key,
            CachedRedirect {
                url: url.clone(),
                content_type: served.content_type.clone(),
            },
        );
        tracing::debug!(file_uid = uid, variant = ?served.kind, "Resolved content redirect");
        Ok(ContentAccess::Redirect {
            url,
            content_type: served.content_type,
            disposition,
        })
    }

    async fn select_served(
        &self,
        file: &FileRecord,
        kind: Option<VariantKind>,
    ) -> Result<Served, ServiceError> {
        let original = || Served {
            kind: None,
            object: file.object_ref(),
            content_type: file.mime_type.clone(),
            byte_size: file.byte_size,
        };
        let Some(kind) = kind else {
            return Ok(original());
        };

        match self.connector.get_variant(&file.uid, kind).await? {
            Some(variant) if variant.is_finalized() => Ok(Served {
                kind: Some(kind),
                object: variant.object_ref(),
                content_type: variant.mime_type,
                byte_size: variant.byte_size,
            }),
            _ if self.options.variant_fallback => {
                tracing::debug!(file_uid = %file.uid, %kind, "Variant missing, serving original");
                Ok(original())
            }
            _ => Err(ServiceError::VariantNotFound {
                file_uid: file.uid.clone(),
                kind,
            }),
        }
    }

    /// Direct URL for inline content of public files in the public bucket.
    fn public_url(&self, file: &FileRecord, served: &Served, attachment: bool) -> Option<String> {
        let in_public_bucket = self.options.public_bucket.as_deref() == Some(served.object.bucket.as_str());
        if attachment || !file.is_public || !in_public_bucket || !self.store.capabilities().public_url {
            return None;
        }
        self.store.public_url(&served.object)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object_store::{Capabilities, ObjectStore};
    use crate::policy::Purpose;
    use crate::service::{ErrorKind, NewUpload};
    use crate::testutil::{test_service, TestHarness};
    use bytes::Bytes;

    fn alice() -> Actor {
        Actor::user("alice")
    }

    fn remote(h: &TestHarness) {
        h.store.set_capabilities(Capabilities {
            presign_put: true,
            presign_get: true,
            range_read: true,
            copy: true,
            public_url: false,
            local_path: false,
        });
    }

    async fn upload_html(h: &TestHarness, is_public: bool) -> FileRecord {
        let mut req = NewUpload::new(Purpose::General, "page.html", 0);
        req.is_public = is_public;
        h.service
            .upload_proxied(
                &h.service.context(),
                &alice(),
                req,
                Bytes::from_static(b"<!DOCTYPE html><html><body>hi</body></html>"),
            )
            .await
            .unwrap()
    }

    #[test]
    fn test_content_disposition_sanitises_filename() {
        assert_eq!(
            content_disposition(true, "a\"b;c\u{e9}.txt"),
            "attachment; filename=\"a_b_c_.txt\""
        );
        assert_eq!(content_disposition(false, "x.png"), "inline; filename=\"x.png\"");
    }

    #[tokio::test]
    async fn test_dangerous_content_forced_to_attachment() {
        let h = test_service().await;
        let file = upload_html(&h, true).await;
        assert_eq!(file.mime_type, "text/html");

        let access = h
            .service
            .resolve_content_access(&h.service.context(), None, &file.uid, &ContentRequest::default())
            .await
            .unwrap();
        let ContentAccess::Local { disposition, .. } = access else {
            panic!("expected local access");
        };
        assert!(disposition.starts_with("attachment"));
    }

    #[tokio::test]
    async fn test_download_flag_and_inline_default() {
        let h = test_service().await;
        let file = h.upload_image(&alice(), 8, 8).await;

        let inline = h
            .service
            .resolve_content_access(&h.service.context(), Some(&alice()), &file.uid, &ContentRequest::default())
            .await
            .unwrap();
        let ContentAccess::Local {
            disposition,
            content_type,
            path,
            ..
        } = inline
        else {
            panic!("expected local access");
        };
        assert!(disposition.starts_with("inline"));
        assert_eq!(content_type, "image/png");
        assert!(path.exists());

        let download = ContentRequest {
            download: true,
            ..Default::default()
        };
        let access = h
            .service
            .resolve_content_access(&h.service.context(), Some(&alice()), &file.uid, &download)
            .await
            .unwrap();
        assert!(matches!(access, ContentAccess::Local { disposition, .. } if disposition.starts_with("attachment")));
    }

    #[tokio::test]
    async fn test_private_content_requires_owner() {
        let h = test_service().await;
        let file = h.upload_image(&alice(), 8, 8).await;

        for actor in [None, Some(Actor::user("bob"))] {
            let err = h
                .service
                .resolve_content_access(&h.service.context(), actor.as_ref(), &file.uid, &ContentRequest::default())
                .await
                .unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Authorization);
        }

        h.service
            .resolve_content_access(
                &h.service.context(),
                Some(&Actor::admin("root")),
                &file.uid,
                &ContentRequest::default(),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_provisional_file_is_not_served() {
        let h = test_service().await;
        let ticket = h
            .service
            .upload_init(
                &h.service.context(),
                &alice(),
                NewUpload::new(Purpose::General, "a.txt", 4),
            )
            .await
            .unwrap();
        let err = h
            .service
            .resolve_content_access(&h.service.context(), Some(&alice()), &ticket.file_uid, &ContentRequest::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_missing_variant_falls_back_to_original() {
        let h = test_service().await;
        let file = h.upload_image(&alice(), 8, 8).await;
        let req = ContentRequest {
            variant: Some(VariantKind::Preview),
            ..Default::default()
        };
        let access = h
            .service
            .resolve_content_access(&h.service.context(), Some(&alice()), &file.uid, &req)
            .await
            .unwrap();
        let ContentAccess::Local { path, .. } = access else {
            panic!("expected local access");
        };
        assert_eq!(path, h.store.local_path(&file.object_ref()).unwrap());
    }

    #[tokio::test]
    async fn test_missing_variant_without_fallback() {
        let h = crate::testutil::test_service_without_fallback().await;
        let file = h.upload_image(&alice(), 8, 8).await;
        let req = ContentRequest {
            width_hint: Some(200),
            ..Default::default()
        };
        let err = h
            .service
            .resolve_content_access(&h.service.context(), Some(&alice()), &file.uid, &req)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "variant_not_found");
    }

    #[tokio::test]
    async fn test_redirects_are_cached_but_authorization_is_not() {
        let h = test_service().await;
        remote(&h);
        let file = h.upload_image(&alice(), 8, 8).await;

        let first = h
            .service
            .resolve_content_access(&h.service.context(), Some(&alice()), &file.uid, &ContentRequest::default())
            .await
            .unwrap();
        let second = h
            .service
            .resolve_content_access(&h.service.context(), Some(&alice()), &file.uid, &ContentRequest::default())
            .await
            .unwrap();
        assert!(matches!(first, ContentAccess::Redirect { .. }));
        assert_eq!(first, second);
        assert_eq!(h.store.presign_get_calls(), 1);

        let err = h
            .service
            .resolve_content_access(&h.service.context(), Some(&Actor::user("bob")), &file.uid, &ContentRequest::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Authorization);
    }

    #[tokio::test]
    async fn test_attachment_and_inline_cached_separately() {
        let h = test_service().await;
        remote(&h);
        let file = h.upload_image(&alice(), 8, 8).await;
        let download = ContentRequest {
            download: true,
            ..Default::default()
        };

        h.service
            .resolve_content_access(&h.service.context(), Some(&alice()), &file.uid, &ContentRequest::default())
            .await
            .unwrap();
        h.service
            .resolve_content_access(&h.service.context(), Some(&alice()), &file.uid, &download)
            .await
            .unwrap();
        assert_eq!(h.store.presign_get_calls(), 2);
        assert_eq!(h.service.cache().len(), 2);
    }

    #[tokio::test]
    async fn test_delete_invalidates_cached_redirect() {
        let h = test_service().await;
        remote(&h);
        let file = h.upload_image(&alice(), 8, 8).await;
        h.service
            .resolve_content_access(&h.service.context(), Some(&alice()), &file.uid, &ContentRequest::default())
            .await
            .unwrap();
        assert_eq!(h.service.cache().len(), 1);

        h.service
            .delete_file(&h.service.context(), &alice(), &file.uid, false)
            .await
            .unwrap();
        assert!(h.service.cache().is_empty());
    }

    #[tokio::test]
    async fn test_no_redirect_capability() {
        let h = test_service().await;
        let file = h.upload_image(&alice(), 8, 8).await;
        h.store.set_capabilities(Capabilities {
            range_read: true,
            ..Default::default()
        });
        let err = h
            .service
            .resolve_content_access(&h.service.context(), Some(&alice()), &file.uid, &ContentRequest::default())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "capability_missing");
    }
}
