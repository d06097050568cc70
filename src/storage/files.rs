use redb::{ReadableTable, WriteTransaction};

use super::db::{Database, DatabaseError};
use super::models::{FileFilter, FileOrderBy, FileRecord, Page};
use super::tables::*;

pub(super) fn put_file_in(txn: &WriteTransaction, file: &FileRecord) -> Result<(), DatabaseError> {
    debug_assert!(!file.uid.is_empty(), "file uid must not be empty");

    let mut table = txn.open_table(FILES)?;
    let data = rmp_serde::to_vec_named(file)?;
    table.insert(file.uid.as_str(), data.as_slice())?;
    Ok(())
}

pub(super) fn delete_file_in(txn: &WriteTransaction, uid: &str) -> Result<bool, DatabaseError> {
    let mut table = txn.open_table(FILES)?;
    let removed = table.remove(uid)?.is_some();
    Ok(removed)
}

impl Database {
    // ========================================================================
    // File operations
    // ========================================================================

    /// Insert or replace a file row
    pub fn put_file(&self, file: &FileRecord) -> Result<(), DatabaseError> {
        let write_txn = self.begin_write()?;
        put_file_in(&write_txn, file)?;
        write_txn.commit()?;
        Ok(())
    }

    /// Get a file by its uid
    pub fn get_file(&self, uid: &str) -> Result<Option<FileRecord>, DatabaseError> {
        let read_txn = self.begin_read()?;
        let table = read_txn.open_table(FILES)?;

        match table.get(uid)? {
            Some(data) => {
                let file: FileRecord = rmp_serde::from_slice(data.value())?;
                Ok(Some(file))
            }
            None => Ok(None),
        }
    }

    /// Replace an existing file row. Returns false when the row is absent.
    pub fn update_file(&self, file: &FileRecord) -> Result<bool, DatabaseError> {
        let write_txn = self.begin_write()?;
        let exists = {
            let table = write_txn.open_table(FILES)?;
            let found = table.get(file.uid.as_str())?.is_some();
            found
        };
        if exists {
            put_file_in(&write_txn, file)?;
        }
        write_txn.commit()?;
        Ok(exists)
    }

    /// Delete a file row. Variants and links are removed separately.
    pub fn delete_file(&self, uid: &str) -> Result<bool, DatabaseError> {
        let write_txn = self.begin_write()?;
        let deleted = delete_file_in(&write_txn, uid)?;
        write_txn.commit()?;
        Ok(deleted)
    }

    /// List files matching `filter`, ordered and paginated
    pub fn list_files(&self, filter: &FileFilter) -> Result<Page<FileRecord>, DatabaseError> {
        let read_txn = self.begin_read()?;
        let table = read_txn.open_table(FILES)?;

        let mut files = Vec::new();
        for result in table.iter()? {
            let (_, value) = result?;
            let file: FileRecord = rmp_serde::from_slice(value.value())?;
            if filter.matches(&file) {
                files.push(file);
            }
        }

        match filter.order_by {
            FileOrderBy::CreatedAt => files.sort_by(|a, b| a.created_at.cmp(&b.created_at)),
            FileOrderBy::Filename => files.sort_by(|a, b| {
                a.filename
                    .to_lowercase()
                    .cmp(&b.filename.to_lowercase())
            }),
            FileOrderBy::ByteSize => files.sort_by_key(|f| f.byte_size),
        }
        if filter.descending {
            files.reverse();
        }

        let total = files.len() as u64;
        let items = files
            .into_iter()
            .skip(filter.offset as usize)
            .take(filter.limit as usize)
            .collect();

        Ok(Page { items, total })
    }
}
