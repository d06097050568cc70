//! Persistence port implemented by the host application.

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use super::db::{Database, DatabaseError};
use super::models::{
    FileFilter, FileRecord, LinkRecord, Page, VariantKind, VariantRecord, WriteOp,
};

#[derive(Debug, Error)]
pub enum ConnectorError {
    #[error("Connector does not support {0}")]
    Unsupported(&'static str),
    #[error("Persistence error: {0}")]
    Backend(String),
}

impl From<DatabaseError> for ConnectorError {
    fn from(e: DatabaseError) -> Self {
        ConnectorError::Backend(e.to_string())
    }
}

/// Optional operations a connector offers. The service uses them when present
/// and falls back to sequential single-row calls otherwise.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ConnectorCapabilities {
    pub transactions: bool,
    pub batch_variant_delete: bool,
    pub entity_link_listing: bool,
}

/// CRUD for file, variant and link rows. Lookups return `Ok(None)` or an empty
/// collection for absent rows; `Err` is reserved for transport failures.
#[async_trait]
pub trait Connector: Send + Sync {
    fn capabilities(&self) -> ConnectorCapabilities {
        ConnectorCapabilities::default()
    }

    async fn insert_file(&self, file: &FileRecord) -> Result<(), ConnectorError>;
    async fn get_file(&self, uid: &str) -> Result<Option<FileRecord>, ConnectorError>;
    /// Replace an existing row. Returns false when the row is absent.
    async fn update_file(&self, file: &FileRecord) -> Result<bool, ConnectorError>;
    async fn delete_file(&self, uid: &str) -> Result<bool, ConnectorError>;
    async fn list_files(&self, filter: &FileFilter) -> Result<Page<FileRecord>, ConnectorError>;

    /// Insert or replace the variant for `(file_uid, kind)`.
    async fn put_variant(&self, variant: &VariantRecord) -> Result<(), ConnectorError>;
    async fn get_variant(
        &self,
        file_uid: &str,
        kind: VariantKind,
    ) -> Result<Option<VariantRecord>, ConnectorError>;
    async fn list_variants(&self, file_uid: &str) -> Result<Vec<VariantRecord>, ConnectorError>;
    async fn delete_variant(&self, file_uid: &str, kind: VariantKind)
        -> Result<bool, ConnectorError>;

    /// Returns false when an identical link already exists.
    async fn create_link(&self, link: &LinkRecord) -> Result<bool, ConnectorError>;
    async fn delete_link(&self, link: &LinkRecord) -> Result<bool, ConnectorError>;
    async fn links_for_file(&self, file_uid: &str) -> Result<Vec<LinkRecord>, ConnectorError>;
    async fn count_links_for_file(&self, file_uid: &str) -> Result<u64, ConnectorError>;

    /// Apply all operations atomically. Requires `transactions`.
    async fn apply_atomic(&self, _ops: &[WriteOp]) -> Result<(), ConnectorError> {
        Err(ConnectorError::Unsupported("transactions"))
    }

    /// Requires `batch_variant_delete`.
    async fn delete_variants_for_file(&self, _file_uid: &str) -> Result<u64, ConnectorError> {
        Err(ConnectorError::Unsupported("batch variant deletion"))
    }

    /// Requires `entity_link_listing`.
    async fn links_for_entity(
        &self,
        _entity_type: &str,
        _entity_uid: &str,
    ) -> Result<Vec<LinkRecord>, ConnectorError> {
        Err(ConnectorError::Unsupported("entity link listing"))
    }
}

#[async_trait]
impl Connector for Database {
    fn capabilities(&self) -> ConnectorCapabilities {
        ConnectorCapabilities {
            transactions: true,
            batch_variant_delete: true,
            entity_link_listing: true,
        }
    }

    async fn insert_file(&self, file: &FileRecord) -> Result<(), ConnectorError> {
        Ok(self.put_file(file)?)
    }

    async fn get_file(&self, uid: &str) -> Result<Option<FileRecord>, ConnectorError> {
        Ok(Database::get_file(self, uid)?)
    }

    async fn update_file(&self, file: &FileRecord) -> Result<bool, ConnectorError> {
        Ok(Database::update_file(self, file)?)
    }

    async fn delete_file(&self, uid: &str) -> Result<bool, ConnectorError> {
        Ok(Database::delete_file(self, uid)?)
    }

    async fn list_files(&self, filter: &FileFilter) -> Result<Page<FileRecord>, ConnectorError> {
        Ok(Database::list_files(self, filter)?)
    }

    async fn put_variant(&self, variant: &VariantRecord) -> Result<(), ConnectorError> {
        Ok(Database::put_variant(self, variant)?)
    }

    async fn get_variant(
        &self,
        file_uid: &str,
        kind: VariantKind,
    ) -> Result<Option<VariantRecord>, ConnectorError> {
        Ok(Database::get_variant(self, file_uid, kind)?)
    }

    async fn list_variants(&self, file_uid: &str) -> Result<Vec<VariantRecord>, ConnectorError> {
        Ok(Database::list_variants(self, file_uid)?)
    }

    async fn delete_variant(
        &self,
        file_uid: &str,
        kind: VariantKind,
    ) -> Result<bool, ConnectorError> {
        Ok(Database::delete_variant(self, file_uid, kind)?)
    }

    async fn create_link(&self, link: &LinkRecord) -> Result<bool, ConnectorError> {
        Ok(Database::create_link(self, link)?)
    }

    async fn delete_link(&self, link: &LinkRecord) -> Result<bool, ConnectorError> {
        Ok(Database::delete_link(self, link)?)
    }

    async fn links_for_file(&self, file_uid: &str) -> Result<Vec<LinkRecord>, ConnectorError> {
        Ok(Database::links_for_file(self, file_uid)?)
    }

    async fn count_links_for_file(&self, file_uid: &str) -> Result<u64, ConnectorError> {
        Ok(Database::count_links_for_file(self, file_uid)?)
    }

    async fn apply_atomic(&self, ops: &[WriteOp]) -> Result<(), ConnectorError> {
        Ok(self.apply(ops)?)
    }

    async fn delete_variants_for_file(&self, file_uid: &str) -> Result<u64, ConnectorError> {
        Ok(Database::delete_variants_for_file(self, file_uid)?)
    }

    async fn links_for_entity(
        &self,
        entity_type: &str,
        entity_uid: &str,
    ) -> Result<Vec<LinkRecord>, ConnectorError> {
        Ok(Database::links_for_entity(self, entity_type, entity_uid)?)
    }
}
