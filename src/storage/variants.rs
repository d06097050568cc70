use redb::{ReadableTable, WriteTransaction};

use super::db::{Database, DatabaseError};
use super::models::{VariantKind, VariantRecord};
use super::tables::*;

fn variant_key(file_uid: &str, kind: VariantKind) -> String {
    format!("{file_uid}/{}", kind.as_str())
}

/// Key range covering every variant of a file. `'0'` is the successor of `'/'`.
fn file_range(file_uid: &str) -> (String, String) {
    (format!("{file_uid}/"), format!("{file_uid}0"))
}

pub(super) fn put_variant_in(
    txn: &WriteTransaction,
    variant: &VariantRecord,
) -> Result<(), DatabaseError> {
    let mut table = txn.open_table(VARIANTS)?;
    let data = rmp_serde::to_vec_named(variant)?;
    let key = variant_key(&variant.file_uid, variant.kind);
    table.insert(key.as_str(), data.as_slice())?;
    Ok(())
}

pub(super) fn delete_variant_in(
    txn: &WriteTransaction,
    file_uid: &str,
    kind: VariantKind,
) -> Result<bool, DatabaseError> {
    let mut table = txn.open_table(VARIANTS)?;
    let key = variant_key(file_uid, kind);
    let removed = table.remove(key.as_str())?.is_some();
    Ok(removed)
}

pub(super) fn delete_variants_for_file_in(
    txn: &WriteTransaction,
    file_uid: &str,
) -> Result<u64, DatabaseError> {
    let (start, end) = file_range(file_uid);
    let keys: Vec<String> = {
        let table = txn.open_table(VARIANTS)?;
        let keys = table
            .range(start.as_str()..end.as_str())?
            .map(|r| r.map(|(k, _)| k.value().to_string()))
            .collect::<Result<Vec<_>, _>>()?;
        keys
    };

    let mut table = txn.open_table(VARIANTS)?;
    for key in &keys {
        table.remove(key.as_str())?;
    }
    Ok(keys.len() as u64)
}

impl Database {
    // ========================================================================
    // Variant operations
    // ========================================================================

    /// Insert or replace the variant for `(file_uid, kind)`
    pub fn put_variant(&self, variant: &VariantRecord) -> Result<(), DatabaseError> {
        let write_txn = self.begin_write()?;
        put_variant_in(&write_txn, variant)?;
        write_txn.commit()?;
        Ok(())
    }

    pub fn get_variant(
        &self,
        file_uid: &str,
        kind: VariantKind,
    ) -> Result<Option<VariantRecord>, DatabaseError> {
        let read_txn = self.begin_read()?;
        let table = read_txn.open_table(VARIANTS)?;
        let key = variant_key(file_uid, kind);

        match table.get(key.as_str())? {
            Some(data) => Ok(Some(rmp_serde::from_slice(data.value())?)),
            None => Ok(None),
        }
    }

    /// All variants of a file, ordered by kind name
    pub fn list_variants(&self, file_uid: &str) -> Result<Vec<VariantRecord>, DatabaseError> {
        let read_txn = self.begin_read()?;
        let table = read_txn.open_table(VARIANTS)?;
        let (start, end) = file_range(file_uid);

        let mut variants = Vec::new();
        for result in table.range(start.as_str()..end.as_str())? {
            let (_, value) = result?;
            variants.push(rmp_serde::from_slice(value.value())?);
        }
        Ok(variants)
    }

    pub fn delete_variant(&self, file_uid: &str, kind: VariantKind) -> Result<bool, DatabaseError> {
        let write_txn = self.begin_write()?;
        let deleted = delete_variant_in(&write_txn, file_uid, kind)?;
        write_txn.commit()?;
        Ok(deleted)
    }

    /// Delete every variant row of a file, returning how many were removed
    pub fn delete_variants_for_file(&self, file_uid: &str) -> Result<u64, DatabaseError> {
        let write_txn = self.begin_write()?;
        let deleted = delete_variants_for_file_in(&write_txn, file_uid)?;
        write_txn.commit()?;
        Ok(deleted)
    }
}
