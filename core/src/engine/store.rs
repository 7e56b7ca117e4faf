//! Document-store query layer for files and folders.
//!
//! Raw SurrealQL with bound parameters throughout. Rows come back as
//! JSON values and are decoded into the lightweight row structs below;
//! file content is fetched separately so listings stay small.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use surrealdb::types::RecordId;
use thiserror::Error;

use crate::db::DbHandle;
use crate::models::{File, Folder, Project};
use crate::paths;

#[derive(Debug, Error)]
pub enum StoreError {
	#[error("database error: {0}")]
	Db(String),

	#[error("record not found: {0}")]
	NotFound(String),

	#[error("failed to decode record: {0}")]
	Decode(String),
}

fn db_err(e: surrealdb::Error) -> StoreError {
	StoreError::Db(e.to_string())
}

fn decode_err(e: serde_json::Error) -> StoreError {
	StoreError::Decode(e.to_string())
}

/// Folder fields the engine works with (content-free).
#[derive(Debug, Clone, Deserialize)]
pub struct FolderRow {
	pub id: RecordId,
	pub name: String,
	pub path: String,
	pub parent: Option<RecordId>,
	pub level: i64,
	pub created_at: DateTime<Utc>,
}

impl FolderRow {
	/// Canonical directory this folder denotes ("" for the root).
	pub fn dir(&self) -> String {
		paths::folder_dir(&self.path, &self.name)
	}
}

/// File fields the engine works with (content fetched on demand).
#[derive(Debug, Clone, Deserialize)]
pub struct FileRow {
	pub id: RecordId,
	pub name: String,
	pub path: String,
	pub folder: RecordId,
	pub size: i64,
	pub version: i64,
	pub is_locked: bool,
	pub locked_by: Option<RecordId>,
	pub created_at: DateTime<Utc>,
}

const FOLDER_FIELDS: &str = "id, name, path, parent, level, created_at";
const FILE_FIELDS: &str = "id, name, path, folder, size, version, is_locked, locked_by, created_at";

fn rows_to<T: serde::de::DeserializeOwned>(rows: Vec<Value>) -> Result<Vec<T>, StoreError> {
	rows.into_iter()
		.map(|row| serde_json::from_value(row).map_err(decode_err))
		.collect()
}

// ---- folders ----

/// Find the root folder of a project, creating it on first use.
pub async fn ensure_root_folder(
	db: &DbHandle,
	project: &RecordId,
	user: Option<&RecordId>,
) -> Result<FolderRow, StoreError> {
	if let Some(root) = root_folder(db, project).await? {
		return Ok(root);
	}

	let user_expr = if user.is_some() { "$user" } else { "NONE" };
	let query = format!(
		"CREATE folder CONTENT {{
            project: $project,
            name: '',
            path: '',
            parent: NONE,
            files: [],
            subfolders: [],
            level: 0,
            archived: false,
            created_by: {user_expr},
            created_at: time::now(),
            updated_at: time::now(),
        }} RETURN {FOLDER_FIELDS}"
	);

	let mut q = db.db.query(query).bind(("project", project.clone()));
	if let Some(user) = user {
		q = q.bind(("user", user.clone()));
	}
	let mut response = q.await.map_err(db_err)?;
	let row: Option<Value> = response.take(0).map_err(db_err)?;
	let row = row.ok_or_else(|| StoreError::Db("root folder create returned nothing".into()))?;
	serde_json::from_value(row).map_err(decode_err)
}

/// Fetch a folder row by record id.
pub async fn get_folder(db: &DbHandle, folder: &RecordId) -> Result<Option<FolderRow>, StoreError> {
	let mut response = db
		.db
		.query(format!("SELECT {FOLDER_FIELDS} FROM $id"))
		.bind(("id", folder.clone()))
		.await
		.map_err(db_err)?;
	let row: Option<Value> = response.take(0).map_err(db_err)?;
	row.map(|r| serde_json::from_value(r).map_err(decode_err)).transpose()
}

/// Full folder document including the `files`/`subfolders` link arrays.
pub async fn get_folder_document(
	db: &DbHandle,
	folder: &RecordId,
) -> Result<Option<Folder>, StoreError> {
	let mut response = db
		.db
		.query("SELECT * FROM $id")
		.bind(("id", folder.clone()))
		.await
		.map_err(db_err)?;
	let row: Option<Value> = response.take(0).map_err(db_err)?;
	row.map(|r| serde_json::from_value(r).map_err(decode_err)).transpose()
}

pub async fn root_folder(db: &DbHandle, project: &RecordId) -> Result<Option<FolderRow>, StoreError> {
	let mut response = db
		.db
		.query(format!(
			"SELECT {FOLDER_FIELDS} FROM folder WHERE project = $project AND parent IS NONE LIMIT 1"
		))
		.bind(("project", project.clone()))
		.await
		.map_err(db_err)?;
	let row: Option<Value> = response.take(0).map_err(db_err)?;
	row.map(|r| serde_json::from_value(r).map_err(decode_err)).transpose()
}

/// Look a folder up by its canonical `(path, name)` key.
pub async fn find_folder(
	db: &DbHandle,
	project: &RecordId,
	parent_path: &str,
	name: &str,
) -> Result<Option<FolderRow>, StoreError> {
	let mut response = db
		.db
		.query(format!(
			"SELECT {FOLDER_FIELDS} FROM folder
             WHERE project = $project AND path = $path AND name = $name LIMIT 1"
		))
		.bind(("project", project.clone()))
		.bind(("path", paths::normalize(parent_path)))
		.bind(("name", name.to_string()))
		.await
		.map_err(db_err)?;
	let row: Option<Value> = response.take(0).map_err(db_err)?;
	row.map(|r| serde_json::from_value(r).map_err(decode_err)).transpose()
}

/// Look a folder up by `(name, parent record)` — the second leg of the
/// duplicate check.
pub async fn find_folder_by_parent(
	db: &DbHandle,
	project: &RecordId,
	parent: &RecordId,
	name: &str,
) -> Result<Option<FolderRow>, StoreError> {
	let mut response = db
		.db
		.query(format!(
			"SELECT {FOLDER_FIELDS} FROM folder
             WHERE project = $project AND parent = $parent AND name = $name LIMIT 1"
		))
		.bind(("project", project.clone()))
		.bind(("parent", parent.clone()))
		.bind(("name", name.to_string()))
		.await
		.map_err(db_err)?;
	let row: Option<Value> = response.take(0).map_err(db_err)?;
	row.map(|r| serde_json::from_value(r).map_err(decode_err)).transpose()
}

/// All folders of a project in insertion order.
pub async fn list_folders(db: &DbHandle, project: &RecordId) -> Result<Vec<FolderRow>, StoreError> {
	let mut response = db
		.db
		.query(format!(
			"SELECT {FOLDER_FIELDS} FROM folder WHERE project = $project ORDER BY created_at ASC"
		))
		.bind(("project", project.clone()))
		.await
		.map_err(db_err)?;
	let rows: Vec<Value> = response.take(0).map_err(db_err)?;
	rows_to(rows)
}

/// Create a folder under `parent` and link it into the parent's
/// subfolder list. If the canonical key already exists this is a no-op
/// returning the existing record (duplicate-insert recovery).
pub async fn create_folder(
	db: &DbHandle,
	project: &RecordId,
	parent: &FolderRow,
	name: &str,
	user: Option<&RecordId>,
) -> Result<FolderRow, StoreError> {
	let parent_path = parent.dir();
	if let Some(existing) = find_folder(db, project, &parent_path, name).await? {
		return Ok(existing);
	}

	let user_expr = if user.is_some() { "$user" } else { "NONE" };
	let query = format!(
		"CREATE folder CONTENT {{
            project: $project,
            name: $name,
            path: $path,
            parent: $parent,
            files: [],
            subfolders: [],
            level: $level,
            archived: false,
            created_by: {user_expr},
            created_at: time::now(),
            updated_at: time::now(),
        }} RETURN {FOLDER_FIELDS}"
	);

	let mut q = db
		.db
		.query(query)
		.bind(("project", project.clone()))
		.bind(("name", name.to_string()))
		.bind(("path", parent_path.clone()))
		.bind(("parent", parent.id.clone()))
		.bind(("level", parent.level + 1));
	if let Some(user) = user {
		q = q.bind(("user", user.clone()));
	}
	let mut response = q.await.map_err(db_err)?;
	let row: Option<Value> = response.take(0).map_err(db_err)?;
	let created: FolderRow = serde_json::from_value(
		row.ok_or_else(|| StoreError::Db("folder create returned nothing".into()))?,
	)
	.map_err(decode_err)?;

	db.db
		.query("UPDATE $id SET subfolders += $child, updated_at = time::now()")
		.bind(("id", parent.id.clone()))
		.bind(("child", created.id.clone()))
		.await
		.map_err(db_err)?
		.check()
		.map_err(db_err)?;

	Ok(created)
}

/// Walk (and create where missing) the folder chain down to `dir`.
/// Returns the folder denoting `dir`; the root for an empty dir.
pub async fn ensure_folder_chain(
	db: &DbHandle,
	project: &RecordId,
	dir: &str,
	user: Option<&RecordId>,
) -> Result<FolderRow, StoreError> {
	let mut current = ensure_root_folder(db, project, user).await?;
	let dir = paths::normalize(dir);
	if dir.is_empty() {
		return Ok(current);
	}
	for seg in dir.split('/') {
		current = match find_folder(db, project, &current.dir(), seg).await? {
			Some(existing) => existing,
			None => create_folder(db, project, &current, seg, user).await?,
		};
	}
	Ok(current)
}

/// Delete a folder record and unlink it from its parent.
/// Children must already be gone; recursive deletion walks the tree in
/// the workspace manager.
pub async fn delete_folder_record(db: &DbHandle, folder: &FolderRow) -> Result<(), StoreError> {
	if let Some(parent) = &folder.parent {
		db.db
			.query("UPDATE $id SET subfolders -= $child, updated_at = time::now()")
			.bind(("id", parent.clone()))
			.bind(("child", folder.id.clone()))
			.await
			.map_err(db_err)?
			.check()
			.map_err(db_err)?;
	}
	db.db
		.query("DELETE $id")
		.bind(("id", folder.id.clone()))
		.await
		.map_err(db_err)?
		.check()
		.map_err(db_err)?;
	Ok(())
}

// ---- files ----

pub async fn find_file_by_path(
	db: &DbHandle,
	project: &RecordId,
	path: &str,
) -> Result<Option<FileRow>, StoreError> {
	let mut response = db
		.db
		.query(format!(
			"SELECT {FILE_FIELDS} FROM file WHERE project = $project AND path = $path LIMIT 1"
		))
		.bind(("project", project.clone()))
		.bind(("path", paths::normalize(path)))
		.await
		.map_err(db_err)?;
	let row: Option<Value> = response.take(0).map_err(db_err)?;
	row.map(|r| serde_json::from_value(r).map_err(decode_err)).transpose()
}

pub async fn find_file_in_folder(
	db: &DbHandle,
	project: &RecordId,
	folder: &RecordId,
	name: &str,
) -> Result<Option<FileRow>, StoreError> {
	let mut response = db
		.db
		.query(format!(
			"SELECT {FILE_FIELDS} FROM file
             WHERE project = $project AND folder = $folder AND name = $name LIMIT 1"
		))
		.bind(("project", project.clone()))
		.bind(("folder", folder.clone()))
		.bind(("name", name.to_string()))
		.await
		.map_err(db_err)?;
	let row: Option<Value> = response.take(0).map_err(db_err)?;
	row.map(|r| serde_json::from_value(r).map_err(decode_err)).transpose()
}

/// All files of a project in insertion order.
pub async fn list_files(db: &DbHandle, project: &RecordId) -> Result<Vec<FileRow>, StoreError> {
	let mut response = db
		.db
		.query(format!(
			"SELECT {FILE_FIELDS} FROM file WHERE project = $project ORDER BY created_at ASC"
		))
		.bind(("project", project.clone()))
		.await
		.map_err(db_err)?;
	let rows: Vec<Value> = response.take(0).map_err(db_err)?;
	rows_to(rows)
}

/// Files belonging to one folder record.
pub async fn list_files_in_folder(
	db: &DbHandle,
	folder: &RecordId,
) -> Result<Vec<FileRow>, StoreError> {
	let mut response = db
		.db
		.query(format!("SELECT {FILE_FIELDS} FROM file WHERE folder = $folder"))
		.bind(("folder", folder.clone()))
		.await
		.map_err(db_err)?;
	let rows: Vec<Value> = response.take(0).map_err(db_err)?;
	rows_to(rows)
}

/// Full file document, content and version history included. Listing
/// paths use [`FileRow`]; this is for history views and exports.
pub async fn get_file_document(
	db: &DbHandle,
	file: &RecordId,
) -> Result<Option<File>, StoreError> {
	let mut response = db
		.db
		.query("SELECT * FROM $id")
		.bind(("id", file.clone()))
		.await
		.map_err(db_err)?;
	let row: Option<Value> = response.take(0).map_err(db_err)?;
	row.map(|r| serde_json::from_value(r).map_err(decode_err)).transpose()
}

pub async fn get_file_content(db: &DbHandle, file: &RecordId) -> Result<String, StoreError> {
	let mut response = db
		.db
		.query("SELECT content FROM $id")
		.bind(("id", file.clone()))
		.await
		.map_err(db_err)?;
	let content: Option<String> = response.take("content").map_err(db_err)?;
	content.ok_or_else(|| StoreError::NotFound(format!("{file:?}")))
}

/// Create a file record inside `folder` and link it into the folder's
/// file list. Size is always derived from the content's UTF-8 bytes.
pub async fn create_file(
	db: &DbHandle,
	project: &RecordId,
	folder: &FolderRow,
	name: &str,
	content: &str,
	user: Option<&RecordId>,
) -> Result<FileRow, StoreError> {
	let path = paths::file_path(&folder.path, &folder.name, name);
	let user_expr = if user.is_some() { "$user" } else { "NONE" };
	let query = format!(
		"CREATE file CONTENT {{
            project: $project,
            name: $name,
            path: $path,
            folder: $folder,
            content: $content,
            size: $size,
            is_locked: false,
            locked_by: NONE,
            version: 1,
            versions: [],
            created_by: {user_expr},
            created_at: time::now(),
            updated_at: time::now(),
        }} RETURN {FILE_FIELDS}"
	);

	let mut q = db
		.db
		.query(query)
		.bind(("project", project.clone()))
		.bind(("name", name.to_string()))
		.bind(("path", path))
		.bind(("folder", folder.id.clone()))
		.bind(("content", content.to_string()))
		.bind(("size", content.len() as i64));
	if let Some(user) = user {
		q = q.bind(("user", user.clone()));
	}
	let mut response = q.await.map_err(db_err)?;
	let row: Option<Value> = response.take(0).map_err(db_err)?;
	let created: FileRow = serde_json::from_value(
		row.ok_or_else(|| StoreError::Db("file create returned nothing".into()))?,
	)
	.map_err(decode_err)?;

	db.db
		.query("UPDATE $id SET files += $child, updated_at = time::now()")
		.bind(("id", folder.id.clone()))
		.bind(("child", created.id.clone()))
		.await
		.map_err(db_err)?
		.check()
		.map_err(db_err)?;

	Ok(created)
}

/// Overwrite a file's content, appending a version snapshot of the
/// previous state first. Content and size always change together.
pub async fn update_file_content(
	db: &DbHandle,
	file: &FileRow,
	content: &str,
	user: Option<&RecordId>,
) -> Result<(), StoreError> {
	let old_content = get_file_content(db, &file.id).await?;
	let user_expr = if user.is_some() { "$user" } else { "NONE" };
	let query = format!(
		"UPDATE $id SET
            versions += {{
                version: $old_version,
                content: $old_content,
                size: $old_size,
                saved_by: {user_expr},
                saved_at: time::now(),
            }},
            content = $content,
            size = $size,
            version = $old_version + 1,
            updated_at = time::now()"
	);

	let mut q = db
		.db
		.query(query)
		.bind(("id", file.id.clone()))
		.bind(("old_version", file.version))
		.bind(("old_content", old_content))
		.bind(("old_size", file.size))
		.bind(("content", content.to_string()))
		.bind(("size", content.len() as i64));
	if let Some(user) = user {
		q = q.bind(("user", user.clone()));
	}
	q.await.map_err(db_err)?.check().map_err(db_err)?;
	Ok(())
}

/// Delete a file record and unlink it from its folder.
pub async fn delete_file_record(db: &DbHandle, file: &FileRow) -> Result<(), StoreError> {
	db.db
		.query("UPDATE $id SET files -= $child, updated_at = time::now()")
		.bind(("id", file.folder.clone()))
		.bind(("child", file.id.clone()))
		.await
		.map_err(db_err)?
		.check()
		.map_err(db_err)?;
	db.db
		.query("DELETE $id")
		.bind(("id", file.id.clone()))
		.await
		.map_err(db_err)?
		.check()
		.map_err(db_err)?;
	Ok(())
}

pub async fn set_file_lock(db: &DbHandle, file: &RecordId, user: &RecordId) -> Result<(), StoreError> {
	db.db
		.query("UPDATE $id SET is_locked = true, locked_by = $user, updated_at = time::now()")
		.bind(("id", file.clone()))
		.bind(("user", user.clone()))
		.await
		.map_err(db_err)?
		.check()
		.map_err(db_err)?;
	Ok(())
}

pub async fn clear_file_lock(db: &DbHandle, file: &RecordId) -> Result<(), StoreError> {
	db.db
		.query("UPDATE $id SET is_locked = false, locked_by = NONE, updated_at = time::now()")
		.bind(("id", file.clone()))
		.await
		.map_err(db_err)?
		.check()
		.map_err(db_err)?;
	Ok(())
}

// ---- projects (read-only from the engine's point of view) ----

pub async fn get_project(
	db: &DbHandle,
	project: &RecordId,
) -> Result<Option<Project>, StoreError> {
	let mut response = db
		.db
		.query("SELECT * FROM $id")
		.bind(("id", project.clone()))
		.await
		.map_err(db_err)?;
	let row: Option<Value> = response.take(0).map_err(db_err)?;
	row.map(|r| serde_json::from_value(r).map_err(decode_err)).transpose()
}

/// Active projects with their owners, for watcher startup.
pub async fn list_active_projects(db: &DbHandle) -> Result<Vec<(RecordId, RecordId)>, StoreError> {
	let mut response = db
		.db
		.query("SELECT id, owner FROM project WHERE status = 'active'")
		.await
		.map_err(db_err)?;
	let rows: Vec<Value> = response.take(0).map_err(db_err)?;
	let mut out = Vec::with_capacity(rows.len());
	for row in rows {
		let id: RecordId = serde_json::from_value(row["id"].clone()).map_err(decode_err)?;
		let owner: RecordId = serde_json::from_value(row["owner"].clone()).map_err(decode_err)?;
		out.push((id, owner));
	}
	Ok(out)
}

pub async fn create_user(db: &DbHandle, name: &str) -> Result<RecordId, StoreError> {
	let mut response = db
		.db
		.query("CREATE user CONTENT { name: $name, email: NONE, created_at: time::now() } RETURN id")
		.bind(("name", name.to_string()))
		.await
		.map_err(db_err)?;
	let row: Option<Value> = response.take(0).map_err(db_err)?;
	let row = row.ok_or_else(|| StoreError::Db("user create returned nothing".into()))?;
	serde_json::from_value(row["id"].clone()).map_err(decode_err)
}

pub async fn create_project(
	db: &DbHandle,
	name: &str,
	owner: &RecordId,
) -> Result<RecordId, StoreError> {
	let mut response = db
		.db
		.query(
			"CREATE project CONTENT {
                name: $name,
                owner: $owner,
                status: 'active',
                created_at: time::now(),
                updated_at: time::now(),
            } RETURN id",
		)
		.bind(("name", name.to_string()))
		.bind(("owner", owner.clone()))
		.await
		.map_err(db_err)?;
	let row: Option<Value> = response.take(0).map_err(db_err)?;
	let row = row.ok_or_else(|| StoreError::Db("project create returned nothing".into()))?;
	serde_json::from_value(row["id"].clone()).map_err(decode_err)
}
