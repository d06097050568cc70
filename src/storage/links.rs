use redb::{ReadableTable, WriteTransaction};

use super::db::{Database, DatabaseError};
use super::models::LinkRecord;
use super::tables::*;

fn link_key(link: &LinkRecord) -> String {
    format!(
        "{}{SEP}{}{SEP}{}{SEP}{}",
        link.file_uid,
        link.entity_type,
        link.entity_uid,
        link.linked_field.as_deref().unwrap_or_default()
    )
}

fn entity_key(link: &LinkRecord) -> String {
    format!(
        "{}{SEP}{}{SEP}{}{SEP}{}",
        link.entity_type,
        link.entity_uid,
        link.file_uid,
        link.linked_field.as_deref().unwrap_or_default()
    )
}

/// Returns true when the link did not exist before.
pub(super) fn create_link_in(txn: &WriteTransaction, link: &LinkRecord) -> Result<bool, DatabaseError> {
    let key = link_key(link);
    let mut table = txn.open_table(LINKS)?;
    if table.get(key.as_str())?.is_some() {
        return Ok(false);
    }
    let data = rmp_serde::to_vec_named(link)?;
    table.insert(key.as_str(), data.as_slice())?;

    let mut index = txn.open_table(ENTITY_LINKS)?;
    index.insert(entity_key(link).as_str(), key.as_str())?;
    Ok(true)
}

pub(super) fn delete_link_in(txn: &WriteTransaction, link: &LinkRecord) -> Result<bool, DatabaseError> {
    let key = link_key(link);
    let mut table = txn.open_table(LINKS)?;
    let removed = table.remove(key.as_str())?.is_some();

    let mut index = txn.open_table(ENTITY_LINKS)?;
    index.remove(entity_key(link).as_str())?;
    Ok(removed)
}

impl Database {
    // ========================================================================
    // Link operations
    // ========================================================================

    pub fn create_link(&self, link: &LinkRecord) -> Result<bool, DatabaseError> {
        let write_txn = self.begin_write()?;
        let created = create_link_in(&write_txn, link)?;
        write_txn.commit()?;
        Ok(created)
    }

    pub fn delete_link(&self, link: &LinkRecord) -> Result<bool, DatabaseError> {
        let write_txn = self.begin_write()?;
        let deleted = delete_link_in(&write_txn, link)?;
        write_txn.commit()?;
        Ok(deleted)
    }

    pub fn links_for_file(&self, file_uid: &str) -> Result<Vec<LinkRecord>, DatabaseError> {
        let read_txn = self.begin_read()?;
        let table = read_txn.open_table(LINKS)?;
        let start = format!("{file_uid}{SEP}");
        let end = format!("{file_uid}{SEP_END}");

        let mut links = Vec::new();
        for result in table.range(start.as_str()..end.as_str())? {
            let (_, value) = result?;
            links.push(rmp_serde::from_slice(value.value())?);
        }
        Ok(links)
    }

    pub fn count_links_for_file(&self, file_uid: &str) -> Result<u64, DatabaseError> {
        let read_txn = self.begin_read()?;
        let table = read_txn.open_table(LINKS)?;
        let start = format!("{file_uid}{SEP}");
        let end = format!("{file_uid}{SEP_END}");

        let mut count = 0;
        for result in table.range(start.as_str()..end.as_str())? {
            result?;
            count += 1;
        }
        Ok(count)
    }

    /// Links held by one entity, resolved through the entity index
    pub fn links_for_entity(
        &self,
        entity_type: &str,
        entity_uid: &str,
    ) -> Result<Vec<LinkRecord>, DatabaseError> {
        let read_txn = self.begin_read()?;
        let index = read_txn.open_table(ENTITY_LINKS)?;
        let links_table = read_txn.open_table(LINKS)?;
        let start = format!("{entity_type}{SEP}{entity_uid}{SEP}");
        let end = format!("{entity_type}{SEP}{entity_uid}{SEP_END}");

        let mut links = Vec::new();
        for result in index.range(start.as_str()..end.as_str())? {
            let (_, link_key) = result?;
            if let Some(data) = links_table.get(link_key.value())? {
                links.push(rmp_serde::from_slice(data.value())?);
            }
        }
        Ok(links)
    }
}
