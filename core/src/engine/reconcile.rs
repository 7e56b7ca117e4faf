//! Duplicate and orphan reconciliation.
//!
//! The database tree and the container filesystem drift apart under
//! races and partial failures; these passes pull them back together.
//! Everything is keyed on canonical paths — path collisions, not content
//! collisions, are the failure mode this corrects.
//!
//! Direction matters: a container entry with no database record is an
//! orphan and is deleted from the container, but a database record with
//! no container file is left alone — the database is the durable source
//! of record for content, and a transient partial listing must never
//! cause data loss.

use std::collections::{HashMap, HashSet};

use surrealdb::types::RecordId;
use thiserror::Error;
use tracing::{info, warn};

use crate::db::DbHandle;
use crate::engine::store::{self, StoreError};
use crate::engine::workspace::{WorkspaceError, WorkspaceManager};
use crate::paths;

#[derive(Debug, Error)]
pub enum ReconcileError {
	#[error(transparent)]
	Store(#[from] StoreError),

	#[error(transparent)]
	Workspace(#[from] WorkspaceError),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CleanupReport {
	pub orphan_files: u64,
	pub orphan_folders: u64,
	pub duplicate_files: u64,
	pub duplicate_folders: u64,
}

impl CleanupReport {
	pub fn total(&self) -> u64 {
		self.orphan_files + self.orphan_folders + self.duplicate_files + self.duplicate_folders
	}
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncTotals {
	pub folders_created: u64,
	pub files_created: u64,
}

// ---- duplicate checks (applied before creating records) ----

/// Whether creating a file at `raw_path` would duplicate an existing
/// record: an exact canonical-path match (slash formatting ignored) or a
/// `(name, folder)` match — either blocks creation.
pub async fn check_file_duplicate(
	db: &DbHandle,
	project: &RecordId,
	raw_path: &str,
) -> Result<bool, ReconcileError> {
	let norm = paths::normalize(raw_path);
	if store::find_file_by_path(db, project, &norm).await?.is_some() {
		return Ok(true);
	}
	let (dir, name) = paths::split_parent(&norm);
	let (parent_path, folder_name) = paths::split_parent(&dir);
	if let Some(folder) = store::find_folder(db, project, &parent_path, &folder_name).await? {
		if store::find_file_in_folder(db, project, &folder.id, &name).await?.is_some() {
			return Ok(true);
		}
	}
	Ok(false)
}

/// Folder equivalent: exact `(path, name)` key match or a record with
/// the same name under the same parent record.
pub async fn check_folder_duplicate(
	db: &DbHandle,
	project: &RecordId,
	raw_dir: &str,
) -> Result<bool, ReconcileError> {
	let norm = paths::normalize(raw_dir);
	let (parent_path, name) = paths::split_parent(&norm);
	if store::find_folder(db, project, &parent_path, &name).await?.is_some() {
		return Ok(true);
	}
	let (grandparent, parent_name) = paths::split_parent(&parent_path);
	let parent = if parent_path.is_empty() {
		store::root_folder(db, project).await?
	} else {
		store::find_folder(db, project, &grandparent, &parent_name).await?
	};
	if let Some(parent) = parent {
		if store::find_folder_by_parent(db, project, &parent.id, &name).await?.is_some() {
			return Ok(true);
		}
	}
	Ok(false)
}

// ---- duplicate removal (last-resort cleanup for records that slipped
// past the creation-time check, e.g. two racing sync passes) ----

/// Group file records by canonical path; keep the first of each group
/// (insertion order), delete the rest.
pub async fn remove_duplicate_files(
	db: &DbHandle,
	project: &RecordId,
) -> Result<u64, ReconcileError> {
	let rows = store::list_files(db, project).await?;
	let mut groups: HashMap<String, Vec<store::FileRow>> = HashMap::new();
	let mut order: Vec<String> = Vec::new();
	for row in rows {
		let key = paths::normalize(&row.path);
		if !groups.contains_key(&key) {
			order.push(key.clone());
		}
		groups.entry(key).or_default().push(row);
	}

	let mut removed = 0u64;
	for key in order {
		let group = &groups[&key];
		for dup in group.iter().skip(1) {
			warn!(path = %key, "removing duplicate file record");
			store::delete_file_record(db, dup).await?;
			removed += 1;
		}
	}
	Ok(removed)
}

/// Same keep-first policy for folder records, keyed on the directory
/// they denote. The root folder is exempt.
pub async fn remove_duplicate_folders(
	db: &DbHandle,
	project: &RecordId,
) -> Result<u64, ReconcileError> {
	let rows = store::list_folders(db, project).await?;
	let mut groups: HashMap<String, Vec<store::FolderRow>> = HashMap::new();
	let mut order: Vec<String> = Vec::new();
	for row in rows {
		if row.parent.is_none() {
			continue;
		}
		let key = row.dir();
		if !groups.contains_key(&key) {
			order.push(key.clone());
		}
		groups.entry(key).or_default().push(row);
	}

	let mut removed = 0u64;
	for key in order {
		let group = &groups[&key];
		for dup in group.iter().skip(1) {
			warn!(dir = %key, "removing duplicate folder record");
			store::delete_folder_record(db, dup).await?;
			removed += 1;
		}
	}
	Ok(removed)
}

// ---- orphan cleanup (container entries with no database record) ----

pub async fn cleanup_orphaned_files(
	db: &DbHandle,
	ws: &WorkspaceManager,
	project: &RecordId,
) -> Result<u64, ReconcileError> {
	let known: HashSet<String> = store::list_files(db, project)
		.await?
		.into_iter()
		.map(|f| paths::normalize(&f.path))
		.collect();

	let mut removed = 0u64;
	for path in ws.list_files_recursive(project, None).await? {
		if known.contains(&path) {
			continue;
		}
		match ws.remove_container_path(project, &path, false).await {
			Ok(()) => {
				info!(%path, "removed orphaned container file");
				removed += 1;
			}
			Err(err) => warn!(%path, %err, "orphan file removal failed"),
		}
	}
	Ok(removed)
}

pub async fn cleanup_orphaned_folders(
	db: &DbHandle,
	ws: &WorkspaceManager,
	project: &RecordId,
) -> Result<u64, ReconcileError> {
	let known: HashSet<String> = store::list_folders(db, project)
		.await?
		.into_iter()
		.map(|f| f.dir())
		.collect();

	let mut dirs = ws.list_dirs(project).await?;
	dirs.sort_by_key(|d| paths::level_of(d));

	let mut removed_roots: Vec<String> = Vec::new();
	let mut removed = 0u64;
	for dir in dirs {
		if known.contains(&dir) {
			continue;
		}
		// already gone with a removed ancestor
		if removed_roots.iter().any(|r| paths::is_under(&dir, r)) {
			continue;
		}
		match ws.remove_container_path(project, &dir, true).await {
			Ok(()) => {
				info!(%dir, "removed orphaned container directory");
				removed += 1;
				removed_roots.push(dir);
			}
			Err(err) => warn!(%dir, %err, "orphan directory removal failed"),
		}
	}
	Ok(removed)
}

// ---- missing-record sync (the complement of orphan cleanup) ----

/// Materialize container-only files as database records, creating the
/// full parent folder chain first so depth never matters.
pub async fn sync_missing_files(
	db: &DbHandle,
	ws: &WorkspaceManager,
	project: &RecordId,
	user: Option<&RecordId>,
) -> Result<u64, ReconcileError> {
	let mut created = 0u64;
	for path in ws.list_files_recursive(project, None).await? {
		if check_file_duplicate(db, project, &path).await? {
			continue;
		}
		let Some(content) = ws.read_file(project, &path).await? else {
			continue;
		};
		let (dir, name) = paths::split_parent(&path);
		let folder = store::ensure_folder_chain(db, project, &dir, user).await?;
		store::create_file(db, project, &folder, &name, &content, user).await?;
		created += 1;
	}
	Ok(created)
}

/// Materialize container-only directories as folder records.
pub async fn sync_missing_folders(
	db: &DbHandle,
	ws: &WorkspaceManager,
	project: &RecordId,
	user: Option<&RecordId>,
) -> Result<u64, ReconcileError> {
	let mut dirs = ws.list_dirs(project).await?;
	dirs.sort_by_key(|d| paths::level_of(d));

	let mut created = 0u64;
	for dir in dirs {
		if check_folder_duplicate(db, project, &dir).await? {
			continue;
		}
		store::ensure_folder_chain(db, project, &dir, user).await?;
		created += 1;
	}
	Ok(created)
}

// ---- combined passes ----

/// Orphans first, then duplicates, so duplicate grouping runs on an
/// already-pruned container tree.
pub async fn full_cleanup(
	db: &DbHandle,
	ws: &WorkspaceManager,
	project: &RecordId,
) -> Result<CleanupReport, ReconcileError> {
	let report = CleanupReport {
		orphan_files: cleanup_orphaned_files(db, ws, project).await?,
		orphan_folders: cleanup_orphaned_folders(db, ws, project).await?,
		duplicate_files: remove_duplicate_files(db, project).await?,
		duplicate_folders: remove_duplicate_folders(db, project).await?,
	};
	info!(
		orphan_files = report.orphan_files,
		orphan_folders = report.orphan_folders,
		duplicate_files = report.duplicate_files,
		duplicate_folders = report.duplicate_folders,
		"cleanup pass complete"
	);
	Ok(report)
}

/// Folders before files: a file record needs its owning folder.
pub async fn full_sync(
	db: &DbHandle,
	ws: &WorkspaceManager,
	project: &RecordId,
	user: Option<&RecordId>,
) -> Result<SyncTotals, ReconcileError> {
	let totals = SyncTotals {
		folders_created: sync_missing_folders(db, ws, project, user).await?,
		files_created: sync_missing_files(db, ws, project, user).await?,
	};
	info!(
		folders_created = totals.folders_created,
		files_created = totals.files_created,
		"sync pass complete"
	);
	Ok(totals)
}
