use redb::TableDefinition;

/// File rows: uid -> FileRecord (msgpack)
pub const FILES: TableDefinition<&str, &[u8]> = TableDefinition::new("files");

/// Variant rows: "{file_uid}/{kind}" -> VariantRecord (msgpack)
pub const VARIANTS: TableDefinition<&str, &[u8]> = TableDefinition::new("variants");

/// Link rows keyed file-first: "{file_uid}\x1f{entity_type}\x1f{entity_uid}\x1f{field}" -> LinkRecord (msgpack)
pub const LINKS: TableDefinition<&str, &[u8]> = TableDefinition::new("links");

/// Entity index: "{entity_type}\x1f{entity_uid}\x1f{file_uid}\x1f{field}" -> LINKS key
pub const ENTITY_LINKS: TableDefinition<&str, &str> = TableDefinition::new("entity_links");

/// Separator for composite keys. Sorts below every printable character.
pub const SEP: char = '\u{1f}';

/// Exclusive upper bound for a prefix scan ending in [`SEP`].
pub const SEP_END: char = '\u{20}';
