use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use surrealdb::types::RecordId;

/// A text file in a project's canonical tree.
///
/// `path` is the full canonical path (`folder.path/folder.name/name`,
/// bare name at root) and `(project, path)` is the dedup key. `size` is
/// always the UTF-8 byte length of `content`; the two are updated
/// together. A `FileVersion` snapshot is appended before any overwrite.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct File {
    #[serde(skip_serializing)]
    pub id: Option<RecordId>,
    pub project: RecordId,
    pub name: String,
    pub path: String,
    pub folder: RecordId,
    pub content: String,
    pub size: i64,
    pub is_locked: bool,
    pub locked_by: Option<RecordId>,
    pub version: i64,
    pub versions: Vec<FileVersion>,
    pub created_by: Option<RecordId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One historical revision of a file's content.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FileVersion {
    pub version: i64,
    pub content: String,
    pub size: i64,
    pub saved_by: Option<RecordId>,
    pub saved_at: DateTime<Utc>,
}
