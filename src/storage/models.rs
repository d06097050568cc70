use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::object_store::ObjectRef;
use crate::policy::Purpose;

/// Three-state patch value for partial updates that survives serialization round-trips.
/// Unlike `Option<Option<T>>`, each variant has a distinct wire representation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub enum Patch<T> {
    /// Field was not included in the request (no change).
    #[default]
    Absent,
    /// Field was explicitly set to null (clear it).
    Null,
    /// Field was set to a new value.
    Value(T),
}

impl<T> From<Option<Option<T>>> for Patch<T> {
    fn from(v: Option<Option<T>>) -> Self {
        match v {
            None => Patch::Absent,
            Some(None) => Patch::Null,
            Some(Some(v)) => Patch::Value(v),
        }
    }
}

impl<T> Patch<T> {
    pub fn is_absent(&self) -> bool {
        matches!(self, Patch::Absent)
    }

    /// Apply the patch to an optional field in place.
    pub fn apply_to(self, field: &mut Option<T>) {
        match self {
            Patch::Absent => {}
            Patch::Null => *field = None,
            Patch::Value(v) => *field = Some(v),
        }
    }
}

/// Classification of a file derived from its MIME type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileType {
    Audio,
    Binary,
    Document,
    Image,
    Video,
}

impl FileType {
    /// Derive a file type classification from a MIME type string.
    pub fn from_mime(mime_type: &str) -> Self {
        let primary = mime_type.split('/').next().unwrap_or("");
        match primary {
            "audio" => FileType::Audio,
            "image" => FileType::Image,
            "video" => FileType::Video,
            "text" | "application" => {
                let sub = mime_type.split('/').nth(1).unwrap_or("");
                match sub {
                    "pdf"
                    | "msword"
                    | "rtf"
                    | "csv"
                    | "vnd.openxmlformats-officedocument.wordprocessingml.document"
                    | "vnd.openxmlformats-officedocument.spreadsheetml.sheet"
                    | "vnd.openxmlformats-officedocument.presentationml.presentation"
                    | "vnd.ms-excel"
                    | "vnd.ms-powerpoint" => FileType::Document,
                    _ if primary == "text" => FileType::Document,
                    _ => FileType::Binary,
                }
            }
            _ => FileType::Binary,
        }
    }
}

/// Derived image sizes. Each kind is a width bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VariantKind {
    Thumbnail,
    Preview,
    Web,
}

impl VariantKind {
    /// All kinds, smallest bucket first.
    pub const ALL: [VariantKind; 3] = [VariantKind::Thumbnail, VariantKind::Preview, VariantKind::Web];

    pub fn as_str(&self) -> &'static str {
        match self {
            VariantKind::Thumbnail => "thumbnail",
            VariantKind::Preview => "preview",
            VariantKind::Web => "web",
        }
    }

    /// Target pixel width of the bucket.
    pub fn target_width(&self) -> u32 {
        match self {
            VariantKind::Thumbnail => 320,
            VariantKind::Preview => 800,
            VariantKind::Web => 1600,
        }
    }

    /// Map a responsive width hint to the smallest bucket that covers it.
    pub fn for_width(width: u32) -> Self {
        Self::ALL
            .into_iter()
            .find(|kind| kind.target_width() >= width)
            .unwrap_or(VariantKind::Web)
    }
}

impl fmt::Display for VariantKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VariantKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "thumbnail" | "thumb" => Ok(VariantKind::Thumbnail),
            "preview" => Ok(VariantKind::Preview),
            "web" => Ok(VariantKind::Web),
            other => Err(format!("unknown variant kind '{other}'")),
        }
    }
}

/// A file row. Provisional until `content_hash` is set by finalize.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
    pub uid: String,
    pub owner_id: String,
    pub filename: String,
    pub mime_type: String,
    pub byte_size: u64,
    pub purpose: Purpose,
    pub bucket: String,
    pub object_key: String,
    pub provider: String,
    pub is_public: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    // Set by finalize
    #[serde(default)]
    pub content_hash: Option<String>,
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,

    // CMS fields (all optional)
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub alt_text: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,

    #[serde(default)]
    pub archived_at: Option<DateTime<Utc>>,
}

impl FileRecord {
    pub fn is_finalized(&self) -> bool {
        self.content_hash.is_some()
    }

    pub fn is_archived(&self) -> bool {
        self.archived_at.is_some()
    }

    pub fn object_ref(&self) -> ObjectRef {
        ObjectRef::new(&self.bucket, &self.object_key)
    }

    pub fn file_type(&self) -> FileType {
        FileType::from_mime(&self.mime_type)
    }
}

/// A derived copy of a file, unique per `(file_uid, kind)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariantRecord {
    pub file_uid: String,
    pub kind: VariantKind,
    pub mime_type: String,
    pub byte_size: u64,
    pub bucket: String,
    pub object_key: String,
    pub provider: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub content_hash: Option<String>,
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
}

impl VariantRecord {
    pub fn is_finalized(&self) -> bool {
        self.content_hash.is_some()
    }

    pub fn object_ref(&self) -> ObjectRef {
        ObjectRef::new(&self.bucket, &self.object_key)
    }
}

/// Association between a file and an external entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkRecord {
    pub file_uid: String,
    pub entity_type: String,
    pub entity_uid: String,
    #[serde(default)]
    pub linked_field: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl LinkRecord {
    pub fn new(
        file_uid: impl Into<String>,
        entity: &EntityRef,
        linked_field: Option<&str>,
    ) -> Self {
        Self {
            file_uid: file_uid.into(),
            entity_type: entity.entity_type.clone(),
            entity_uid: entity.entity_uid.clone(),
            linked_field: linked_field.map(str::to_string),
            created_at: Utc::now(),
        }
    }

    pub fn entity(&self) -> EntityRef {
        EntityRef::new(&self.entity_type, &self.entity_uid)
    }
}

/// Identity of an entity owned by the content-management side.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityRef {
    pub entity_type: String,
    pub entity_uid: String,
}

impl EntityRef {
    pub fn new(entity_type: impl Into<String>, entity_uid: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            entity_uid: entity_uid.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileOrderBy {
    #[default]
    CreatedAt,
    Filename,
    ByteSize,
}

/// Filters accepted by `Connector::list_files`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileFilter {
    #[serde(default)]
    pub search: Option<String>,
    #[serde(default)]
    pub owner_id: Option<String>,
    #[serde(default)]
    pub is_public: Option<bool>,
    #[serde(default)]
    pub file_type: Option<FileType>,
    #[serde(default)]
    pub include_archived: bool,
    #[serde(default)]
    pub include_provisional: bool,
    #[serde(default)]
    pub order_by: FileOrderBy,
    #[serde(default)]
    pub descending: bool,
    #[serde(default)]
    pub offset: u32,
    #[serde(default = "default_limit")]
    pub limit: u32,
}

fn default_limit() -> u32 {
    20
}

impl Default for FileFilter {
    fn default() -> Self {
        Self {
            search: None,
            owner_id: None,
            is_public: None,
            file_type: None,
            include_archived: false,
            include_provisional: false,
            order_by: FileOrderBy::default(),
            descending: false,
            offset: 0,
            limit: default_limit(),
        }
    }
}

impl FileFilter {
    /// Whether a record passes every filter except pagination.
    pub fn matches(&self, file: &FileRecord) -> bool {
        if !self.include_archived && file.is_archived() {
            return false;
        }
        if !self.include_provisional && !file.is_finalized() {
            return false;
        }
        if let Some(ref owner) = self.owner_id {
            if &file.owner_id != owner {
                return false;
            }
        }
        if let Some(public) = self.is_public {
            if file.is_public != public {
                return false;
            }
        }
        if let Some(file_type) = self.file_type {
            if file.file_type() != file_type {
                return false;
            }
        }
        if let Some(ref term) = self.search {
            let term = term.to_lowercase();
            let hit = file.filename.to_lowercase().contains(&term)
                || file
                    .title
                    .as_deref()
                    .is_some_and(|t| t.to_lowercase().contains(&term))
                || file.tags.iter().any(|t| t.to_lowercase() == term);
            if !hit {
                return false;
            }
        }
        true
    }
}

/// One page of a listing.
#[derive(Debug, Clone, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: u64,
}

/// Persistence operations, applied atomically by connectors that support transactions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WriteOp {
    PutFile(FileRecord),
    DeleteFile { uid: String },
    PutVariant(VariantRecord),
    DeleteVariant { file_uid: String, kind: VariantKind },
    DeleteVariantsForFile { file_uid: String },
    CreateLink(LinkRecord),
    DeleteLink(LinkRecord),
}
