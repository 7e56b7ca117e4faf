use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use surrealdb::types::RecordId;

/// A directory in a project's canonical tree.
///
/// `path` is the canonical path of the parent chain, not including the
/// folder's own name; the root folder has empty `path` and empty `name`.
/// `(project, path, name)` is the dedup key reconciliation works with.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Folder {
    #[serde(skip_serializing)]
    pub id: Option<RecordId>,
    pub project: RecordId,
    pub name: String,
    pub path: String,
    pub parent: Option<RecordId>,
    pub files: Vec<RecordId>,
    pub subfolders: Vec<RecordId>,
    pub level: i64,
    pub archived: bool,
    pub created_by: Option<RecordId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
