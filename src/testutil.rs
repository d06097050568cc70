//! Shared test helpers: a local-backed store with switchable capabilities and
//! failure injection, and a connector without optional capabilities.

use std::collections::HashSet;
use std::io::Cursor;
use std::ops::Range;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::cache::RedirectCache;
use crate::config::Config;
use crate::links::LinkTracker;
use crate::object_store::{
    Capabilities, LocalStore, ObjectHead, ObjectRef, ObjectStore, ObjectStoreError,
    PresignedRequest, ResponseOverrides,
};
use crate::policy::{Purpose, UploadPolicy};
use crate::service::{Actor, FileService, NewUpload, ServiceOptions};
use crate::storage::models::{
    FileFilter, FileRecord, LinkRecord, Page, VariantKind, VariantRecord,
};
use crate::storage::{Connector, ConnectorError, Database};
use crate::variants::ImageVariantPipeline;
use crate::AppState;

pub fn png_bytes(width: u32, height: u32) -> Bytes {
    let img = image::RgbImage::from_fn(width, height, |x, y| {
        image::Rgb([(x % 256) as u8, (y % 256) as u8, 90])
    });
    let mut buf = Cursor::new(Vec::new());
    img.write_to(&mut buf, image::ImageFormat::Png)
        .expect("encode test png");
    Bytes::from(buf.into_inner())
}

pub struct TestStore {
    inner: LocalStore,
    caps: Mutex<Capabilities>,
    fail_copy: AtomicBool,
    fail_delete: Mutex<HashSet<ObjectRef>>,
    presign_put_calls: AtomicUsize,
    presign_get_calls: AtomicUsize,
}

impl TestStore {
    pub fn new(root: PathBuf) -> Self {
        let inner = LocalStore::new(root)
            .expect("create test store")
            .with_signing(TEST_SIGNING_SECRET, "http://localhost:8080");
        let caps = inner.capabilities();
        Self {
            inner,
            caps: Mutex::new(caps),
            fail_copy: AtomicBool::new(false),
            fail_delete: Mutex::new(HashSet::new()),
            presign_put_calls: AtomicUsize::new(0),
            presign_get_calls: AtomicUsize::new(0),
        }
    }

    pub fn set_capabilities(&self, caps: Capabilities) {
        *self.caps.lock().unwrap() = caps;
    }

    pub fn set_presign(&self, enabled: bool) {
        let mut caps = self.caps.lock().unwrap();
        caps.presign_put = enabled;
        caps.presign_get = enabled;
    }

    pub fn set_copy(&self, enabled: bool) {
        self.caps.lock().unwrap().copy = enabled;
    }

    pub fn set_fail_copy(&self, fail: bool) {
        self.fail_copy.store(fail, Ordering::SeqCst);
    }

    pub fn fail_delete_of(&self, obj: &ObjectRef) {
        self.fail_delete.lock().unwrap().insert(obj.clone());
    }

    pub fn presign_calls(&self) -> usize {
        self.presign_put_calls.load(Ordering::SeqCst)
    }

    pub fn presign_get_calls(&self) -> usize {
        self.presign_get_calls.load(Ordering::SeqCst)
    }

    pub async fn head_now(&self, obj: &ObjectRef) -> Option<ObjectHead> {
        self.inner.head(obj).await.unwrap()
    }
}

#[async_trait]
impl ObjectStore for TestStore {
    fn provider(&self) -> &'static str {
        self.inner.provider()
    }

    fn capabilities(&self) -> Capabilities {
        *self.caps.lock().unwrap()
    }

    async fn head(&self, obj: &ObjectRef) -> Result<Option<ObjectHead>, ObjectStoreError> {
        self.inner.head(obj).await
    }

    async fn put(
        &self,
        obj: &ObjectRef,
        data: Bytes,
        content_type: &str,
    ) -> Result<(), ObjectStoreError> {
        self.inner.put(obj, data, content_type).await
    }

    async fn delete(&self, obj: &ObjectRef) -> Result<(), ObjectStoreError> {
        if self.fail_delete.lock().unwrap().contains(obj) {
            return Err(ObjectStoreError::Backend("injected delete failure".into()));
        }
        self.inner.delete(obj).await
    }

    async fn sha256(&self, obj: &ObjectRef) -> Result<String, ObjectStoreError> {
        self.inner.sha256(obj).await
    }

    async fn presign_put(
        &self,
        obj: &ObjectRef,
        content_type: &str,
        size: u64,
        ttl: Duration,
    ) -> Result<PresignedRequest, ObjectStoreError> {
        self.presign_put_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.presign_put(obj, content_type, size, ttl).await
    }

    async fn presign_get(
        &self,
        obj: &ObjectRef,
        overrides: &ResponseOverrides,
        ttl: Duration,
    ) -> Result<PresignedRequest, ObjectStoreError> {
        self.presign_get_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.presign_get(obj, overrides, ttl).await
    }

    async fn read_range(&self, obj: &ObjectRef, range: Range<u64>) -> Result<Bytes, ObjectStoreError> {
        self.inner.read_range(obj, range).await
    }

    async fn copy(&self, from: &ObjectRef, to: &ObjectRef) -> Result<(), ObjectStoreError> {
        if self.fail_copy.load(Ordering::SeqCst) {
            return Err(ObjectStoreError::Backend("injected copy failure".into()));
        }
        self.inner.copy(from, to).await
    }

    fn public_url(&self, obj: &ObjectRef) -> Option<String> {
        self.inner.public_url(obj)
    }

    fn local_path(&self, obj: &ObjectRef) -> Result<PathBuf, ObjectStoreError> {
        self.inner.local_path(obj)
    }
}

/// Connector exposing only the required operations, so the service takes its
/// sequential fallback paths.
pub struct BasicConnector(pub Database);

#[async_trait]
impl Connector for BasicConnector {
    async fn insert_file(&self, file: &FileRecord) -> Result<(), ConnectorError> {
        Ok(self.0.put_file(file)?)
    }

    async fn get_file(&self, uid: &str) -> Result<Option<FileRecord>, ConnectorError> {
        Ok(self.0.get_file(uid)?)
    }

    async fn update_file(&self, file: &FileRecord) -> Result<bool, ConnectorError> {
        Ok(self.0.update_file(file)?)
    }

    async fn delete_file(&self, uid: &str) -> Result<bool, ConnectorError> {
        Ok(self.0.delete_file(uid)?)
    }

    async fn list_files(&self, filter: &FileFilter) -> Result<Page<FileRecord>, ConnectorError> {
        Ok(self.0.list_files(filter)?)
    }

    async fn put_variant(&self, variant: &VariantRecord) -> Result<(), ConnectorError> {
        Ok(self.0.put_variant(variant)?)
    }

    async fn get_variant(
        &self,
        file_uid: &str,
        kind: VariantKind,
    ) -> Result<Option<VariantRecord>, ConnectorError> {
        Ok(self.0.get_variant(file_uid, kind)?)
    }

    async fn list_variants(&self, file_uid: &str) -> Result<Vec<VariantRecord>, ConnectorError> {
        Ok(self.0.list_variants(file_uid)?)
    }

    async fn delete_variant(
        &self,
        file_uid: &str,
        kind: VariantKind,
    ) -> Result<bool, ConnectorError> {
        Ok(self.0.delete_variant(file_uid, kind)?)
    }

    async fn create_link(&self, link: &LinkRecord) -> Result<bool, ConnectorError> {
        Ok(self.0.create_link(link)?)
    }

    async fn delete_link(&self, link: &LinkRecord) -> Result<bool, ConnectorError> {
        Ok(self.0.delete_link(link)?)
    }

    async fn links_for_file(&self, file_uid: &str) -> Result<Vec<LinkRecord>, ConnectorError> {
        Ok(self.0.links_for_file(file_uid)?)
    }

    async fn count_links_for_file(&self, file_uid: &str) -> Result<u64, ConnectorError> {
        Ok(self.0.count_links_for_file(file_uid)?)
    }
}

pub const TEST_SIGNING_SECRET: &[u8] = b"test-secret";

pub struct TestHarness {
    dir: tempfile::TempDir,
    pub service: Arc<FileService>,
    pub db: Database,
    pub store: Arc<TestStore>,
}

impl TestHarness {
    pub async fn put_object(&self, obj: &ObjectRef, data: Bytes) {
        self.store
            .put(obj, data, "application/octet-stream")
            .await
            .unwrap();
    }

    /// Proxied upload of a finalized PNG owned by `actor`.
    pub async fn upload_image(&self, actor: &Actor, width: u32, height: u32) -> FileRecord {
        self.service
            .upload_proxied(
                &self.service.context(),
                actor,
                NewUpload::new(Purpose::General, "image.png", 0),
                png_bytes(width, height),
            )
            .await
            .unwrap()
    }

    /// HTTP state over this harness. The local store shares the harness root
    /// and signing secret, so URLs signed by the service verify.
    pub fn app_state(&self) -> Arc<AppState> {
        let local = LocalStore::new(self.dir.path().join("files"))
            .unwrap()
            .with_signing(TEST_SIGNING_SECRET, "http://localhost:8080");
        Arc::new(AppState {
            config: Config::default(),
            service: Arc::clone(&self.service),
            links: LinkTracker::new(Arc::new(self.db.clone())),
            local_store: Some(Arc::new(local)),
        })
    }
}

fn build(transactions: bool, options: ServiceOptions) -> TestHarness {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open(dir.path().join("data")).unwrap();
    let store = Arc::new(TestStore::new(dir.path().join("files")));

    let connector: Arc<dyn Connector> = if transactions {
        Arc::new(db.clone())
    } else {
        Arc::new(BasicConnector(db.clone()))
    };

    let service = FileService::new(
        Arc::clone(&store) as Arc<dyn ObjectStore>,
        connector,
        UploadPolicy::with_defaults(10 * 1024 * 1024, 5 * 1024 * 1024),
        RedirectCache::new(64, Duration::from_secs(60)),
        ImageVariantPipeline::new(2),
        options,
    );

    TestHarness {
        dir,
        service: Arc::new(service),
        db,
        store,
    }
}

/// Service over a transactional connector with every capability enabled.
pub async fn test_service() -> TestHarness {
    build(true, ServiceOptions::default())
}

pub async fn test_service_with(transactions: bool) -> TestHarness {
    build(transactions, ServiceOptions::default())
}

pub async fn test_service_without_fallback() -> TestHarness {
    build(
        true,
        ServiceOptions {
            variant_fallback: false,
            ..Default::default()
        },
    )
}
