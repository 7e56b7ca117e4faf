//! Workspace manager.
//!
//! Owns one container + named volume per project and the file/folder
//! primitives against it. The document store is the durable source of
//! record; the container is a derived mirror, so container failures on
//! the write path degrade the result instead of failing the caller.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use surrealdb::types::RecordId;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::db::DbHandle;
use crate::engine::command::{self, ContainerOp, FileMeta};
use crate::engine::runtime::{
	container_name, volume_name, ContainerRuntime, ContainerSpec, ContainerState, ExecOutput,
	RuntimeError,
};
use crate::engine::store::{self, FileRow, FolderRow, StoreError};
use crate::models::FileVersion;
use crate::paths;

#[derive(Debug, Error)]
pub enum WorkspaceError {
	#[error("workspace unavailable for {project}: {reason}")]
	Unavailable { project: String, reason: String },

	#[error("container exec failed: {0}")]
	ExecFailed(String),

	#[error("file {path} is locked by another user")]
	LockedByOther { path: String },

	#[error("file not found: {0}")]
	FileNotFound(String),

	#[error("folder not found: {0}")]
	FolderNotFound(String),

	#[error("the root folder cannot be deleted")]
	RootFolder,

	#[error(transparent)]
	Store(#[from] StoreError),

	#[error(transparent)]
	Runtime(#[from] RuntimeError),
}

/// Live container reference for one project.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkspaceHandle {
	pub container: String,
	pub volume: String,
}

/// Result of a save: the database write succeeded either way; `Degraded`
/// means the container mirror did not (callers may surface a warning).
#[derive(Debug, Clone, PartialEq)]
pub enum SaveOutcome {
	Saved { file: RecordId, version: i64 },
	Degraded { file: RecordId, version: i64, reason: String },
}

impl SaveOutcome {
	pub fn is_degraded(&self) -> bool {
		matches!(self, SaveOutcome::Degraded { .. })
	}

	pub fn file(&self) -> &RecordId {
		match self {
			SaveOutcome::Saved { file, .. } | SaveOutcome::Degraded { file, .. } => file,
		}
	}
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncReport {
	pub created: u64,
	pub updated: u64,
	pub degraded: u64,
}

/// Stable string key for a project record id (its JSON form is the
/// `table:key` string).
pub fn project_key(project: &RecordId) -> String {
	match serde_json::to_value(project) {
		Ok(Value::String(s)) => s,
		_ => format!("{project:?}"),
	}
}

pub struct WorkspaceManager {
	db: DbHandle,
	runtime: Arc<dyn ContainerRuntime>,
	cfg: EngineConfig,
	// one slot per project; the outer map lock is never held across an
	// engine call, so projects stay independent
	handles: Mutex<HashMap<String, Arc<Mutex<Option<WorkspaceHandle>>>>>,
}

impl WorkspaceManager {
	pub fn new(db: DbHandle, runtime: Arc<dyn ContainerRuntime>, cfg: EngineConfig) -> Self {
		Self {
			db,
			runtime,
			cfg,
			handles: Mutex::new(HashMap::new()),
		}
	}

	pub fn db(&self) -> &DbHandle {
		&self.db
	}

	pub fn config(&self) -> &EngineConfig {
		&self.cfg
	}

	/// Absolute container path for a canonical (root-relative) path.
	fn abs(&self, rel: &str) -> String {
		let root = self.cfg.workspace_root.trim_end_matches('/');
		let rel = paths::normalize(rel);
		if rel.is_empty() {
			root.to_string()
		} else {
			format!("{root}/{rel}")
		}
	}

	// ---- container lifecycle ----

	/// Fetch-or-insert the project's handle slot; the map lock is held
	/// only for that.
	async fn slot(&self, key: &str) -> Arc<Mutex<Option<WorkspaceHandle>>> {
		let mut handles = self.handles.lock().await;
		handles.entry(key.to_string()).or_default().clone()
	}

	/// Return a verified-running handle, restarting or recreating the
	/// container as needed. Verification and creation run under the
	/// project's own slot lock: racing creates for one project converge
	/// on one container, and a slow engine call for one project never
	/// stalls another.
	pub async fn get_or_create_workspace(
		&self,
		project: &RecordId,
	) -> Result<WorkspaceHandle, WorkspaceError> {
		let key = project_key(project);
		let slot = self.slot(&key).await;
		let mut slot = slot.lock().await;

		if let Some(handle) = slot.as_ref() {
			if let Ok(ContainerState::Running) = self.runtime.container_state(&handle.container).await {
				return Ok(handle.clone());
			}
			debug!(project = %key, "cached workspace handle is stale");
		}

		let handle = self
			.materialize(&key)
			.await
			.map_err(|e| WorkspaceError::Unavailable {
				project: key.clone(),
				reason: e.to_string(),
			})?;
		*slot = Some(handle.clone());
		Ok(handle)
	}

	async fn materialize(&self, key: &str) -> Result<WorkspaceHandle, RuntimeError> {
		let container = container_name(key);
		let volume = volume_name(key);

		match self.runtime.container_state(&container).await? {
			ContainerState::Running => {}
			ContainerState::Created | ContainerState::Exited => {
				if let Err(err) = self.runtime.start_container(&container).await {
					// stale container that cannot be relaunched
					warn!(%container, %err, "removing unstartable workspace container");
					self.runtime.remove_container(&container).await?;
					self.create_fresh(&container, &volume).await?;
				}
			}
			ContainerState::Missing => self.create_fresh(&container, &volume).await?,
		}

		Ok(WorkspaceHandle { container, volume })
	}

	async fn create_fresh(&self, container: &str, volume: &str) -> Result<(), RuntimeError> {
		self.runtime.create_volume(volume).await?;
		let spec = ContainerSpec {
			name: container.to_string(),
			image: self.cfg.image.clone(),
			volume: volume.to_string(),
			mount_path: self.cfg.workspace_root.clone(),
			memory_limit: self.cfg.memory_limit.clone(),
			cpu_shares: self.cfg.cpu_shares,
		};
		if let Err(err) = self.runtime.create_container(&spec).await {
			// name conflict with a stale record: remove and retry once
			warn!(%container, %err, "container create failed, removing conflicting container");
			let _ = self.runtime.remove_container(container).await;
			self.runtime.create_container(&spec).await?;
		}
		self.runtime.start_container(container).await?;
		info!(%container, "workspace container started");
		self.bootstrap(container).await;
		Ok(())
	}

	/// Directory layout and toolchain setup inside a fresh container.
	/// Best-effort: a failed setup command leaves a usable workspace.
	async fn bootstrap(&self, container: &str) {
		let root = ContainerOp::MakeDirs { path: self.cfg.workspace_root.clone() };
		if let Err(err) = self.runtime.exec(container, &root).await {
			warn!(%container, %err, "workspace root init failed");
		}
		for script in &self.cfg.setup_commands {
			let op = ContainerOp::Raw { script: script.clone() };
			match self.runtime.exec(container, &op).await {
				Ok(out) if !out.ok() => {
					warn!(%container, script, stderr = %out.stderr.trim(), "setup command failed");
				}
				Err(err) => warn!(%container, script, %err, "setup command failed"),
				Ok(_) => {}
			}
		}
	}

	/// Stop and remove the project's container. The volume is kept; the
	/// database remains the durable copy either way.
	pub async fn remove_workspace(&self, project: &RecordId) -> Result<(), WorkspaceError> {
		let key = project_key(project);
		let container = container_name(&key);
		*self.slot(&key).await.lock().await = None;
		match self.runtime.container_state(&container).await? {
			ContainerState::Missing => Ok(()),
			_ => {
				let _ = self.runtime.stop_container(&container).await;
				self.runtime.remove_container(&container).await?;
				Ok(())
			}
		}
	}

	/// Run one op in the project's workspace, transparently relaunching
	/// a container that died since the handle was cached.
	async fn exec(&self, project: &RecordId, op: &ContainerOp) -> Result<ExecOutput, WorkspaceError> {
		let handle = self.get_or_create_workspace(project).await?;
		match self.runtime.exec(&handle.container, op).await {
			Err(RuntimeError::NotRunning(_)) | Err(RuntimeError::Missing(_)) => {
				*self.slot(&project_key(project)).await.lock().await = None;
				let handle = self.get_or_create_workspace(project).await?;
				Ok(self.runtime.exec(&handle.container, op).await?)
			}
			other => Ok(other?),
		}
	}

	// ---- file primitives ----

	/// Read a file from the container. Missing file is `None`, never an
	/// error; a payload that does not decode is treated the same way.
	pub async fn read_file(
		&self,
		project: &RecordId,
		path: &str,
	) -> Result<Option<String>, WorkspaceError> {
		let out = self
			.exec(project, &ContainerOp::ReadFile { path: self.abs(path) })
			.await?;
		if !out.ok() {
			return Ok(None);
		}
		match command::decode_content(&out.stdout) {
			Some(content) => Ok(Some(content)),
			None => {
				warn!(path, "container read returned undecodable payload");
				Ok(None)
			}
		}
	}

	/// Save a file. The database write is authoritative; the container
	/// mirror (atomic write + read-back verification) is best-effort and
	/// downgrades the outcome instead of failing the save.
	pub async fn write_file(
		&self,
		project: &RecordId,
		path: &str,
		content: &str,
		user: Option<&RecordId>,
	) -> Result<SaveOutcome, WorkspaceError> {
		let norm = paths::normalize(path);
		let (file, version) = self.save_to_db(project, &norm, content, user).await?;

		match self.mirror_write(project, &norm, content).await {
			Ok(()) => Ok(SaveOutcome::Saved { file, version }),
			Err(reason) => {
				warn!(path = %norm, %reason, "container mirror write failed; database copy is authoritative");
				Ok(SaveOutcome::Degraded { file, version, reason })
			}
		}
	}

	async fn save_to_db(
		&self,
		project: &RecordId,
		norm: &str,
		content: &str,
		user: Option<&RecordId>,
	) -> Result<(RecordId, i64), WorkspaceError> {
		if let Some(row) = store::find_file_by_path(&self.db, project, norm).await? {
			self.check_lock(&row, user, norm)?;
			store::update_file_content(&self.db, &row, content, user).await?;
			return Ok((row.id, row.version + 1));
		}

		let (dir, name) = paths::split_parent(norm);
		let folder = store::ensure_folder_chain(&self.db, project, &dir, user).await?;
		// (name, folder) leg of the duplicate check: a record reachable
		// under a differently formatted path must be updated, not doubled
		if let Some(existing) = store::find_file_in_folder(&self.db, project, &folder.id, &name).await? {
			self.check_lock(&existing, user, norm)?;
			store::update_file_content(&self.db, &existing, content, user).await?;
			return Ok((existing.id, existing.version + 1));
		}

		let created = store::create_file(&self.db, project, &folder, &name, content, user).await?;
		Ok((created.id, created.version))
	}

	fn check_lock(
		&self,
		row: &FileRow,
		user: Option<&RecordId>,
		path: &str,
	) -> Result<(), WorkspaceError> {
		if row.is_locked && row.locked_by.as_ref() != user {
			return Err(WorkspaceError::LockedByOther { path: path.to_string() });
		}
		Ok(())
	}

	async fn mirror_write(&self, project: &RecordId, norm: &str, content: &str) -> Result<(), String> {
		let abs = self.abs(norm);
		let write = ContainerOp::write_file(&abs, content);
		let out = self.exec(project, &write).await.map_err(|e| e.to_string())?;
		if !out.ok() {
			return Err(format!(
				"write exited {}: {}",
				out.exit_code,
				out.stderr.trim()
			));
		}

		// verify byte-for-byte
		let read = self
			.exec(project, &ContainerOp::ReadFile { path: abs })
			.await
			.map_err(|e| e.to_string())?;
		if !read.ok() {
			return Err("verification read failed".to_string());
		}
		match command::decode_content(&read.stdout) {
			Some(observed) if observed == content => Ok(()),
			_ => Err("write verification mismatch".to_string()),
		}
	}

	/// Delete a file record and its container mirror. If the parent
	/// directory is left empty it is pruned from the container as a
	/// courtesy; the Folder record always stays.
	pub async fn delete_file(&self, project: &RecordId, path: &str) -> Result<(), WorkspaceError> {
		let norm = paths::normalize(path);
		let row = store::find_file_by_path(&self.db, project, &norm)
			.await?
			.ok_or_else(|| WorkspaceError::FileNotFound(norm.clone()))?;
		store::delete_file_record(&self.db, &row).await?;

		let abs = self.abs(&norm);
		match self
			.exec(project, &ContainerOp::RemovePath { path: abs, recursive: false })
			.await
		{
			Ok(out) if out.ok() => {
				let (dir, _) = paths::split_parent(&norm);
				if !dir.is_empty() {
					let _ = self
						.exec(project, &ContainerOp::RemoveDirIfEmpty { path: self.abs(&dir) })
						.await;
				}
			}
			Ok(out) => warn!(path = %norm, stderr = %out.stderr.trim(), "container file delete failed"),
			Err(err) => warn!(path = %norm, %err, "container file delete failed"),
		}
		Ok(())
	}

	// ---- folder primitives ----

	/// Create a folder under `parent` (the root when `None`). Creating
	/// an already-existing folder returns the existing record.
	pub async fn create_folder(
		&self,
		project: &RecordId,
		parent: Option<&RecordId>,
		name: &str,
		user: Option<&RecordId>,
	) -> Result<FolderRow, WorkspaceError> {
		let parent_row = match parent {
			Some(id) => store::get_folder(&self.db, id)
				.await?
				.ok_or_else(|| WorkspaceError::FolderNotFound(format!("{id:?}")))?,
			None => store::ensure_root_folder(&self.db, project, user).await?,
		};
		let created = store::create_folder(&self.db, project, &parent_row, name, user).await?;

		let abs = self.abs(&created.dir());
		match self.exec(project, &ContainerOp::MakeDirs { path: abs }).await {
			Ok(out) if !out.ok() => {
				warn!(dir = %created.dir(), stderr = %out.stderr.trim(), "container mkdir failed")
			}
			Err(err) => warn!(dir = %created.dir(), %err, "container mkdir failed"),
			Ok(_) => {}
		}
		Ok(created)
	}

	/// Recursively delete a folder: one batch load of the project tree,
	/// in-memory traversal, children removed before parents, then one
	/// recursive container removal.
	pub async fn delete_folder(
		&self,
		project: &RecordId,
		folder: &RecordId,
	) -> Result<(), WorkspaceError> {
		let folders = store::list_folders(&self.db, project).await?;
		let files = store::list_files(&self.db, project).await?;

		let target = folders
			.iter()
			.find(|f| &f.id == folder)
			.cloned()
			.ok_or_else(|| WorkspaceError::FolderNotFound(format!("{folder:?}")))?;
		if target.parent.is_none() {
			return Err(WorkspaceError::RootFolder);
		}

		// adjacency from the single batch read, keyed by id string
		let mut children: HashMap<String, Vec<&FolderRow>> = HashMap::new();
		for f in &folders {
			if let Some(parent) = &f.parent {
				children.entry(project_key(parent)).or_default().push(f);
			}
		}

		// depth-first: collect the subtree, deepest last
		let mut subtree: Vec<&FolderRow> = Vec::new();
		let mut stack: Vec<&FolderRow> = vec![&target];
		while let Some(f) = stack.pop() {
			subtree.push(f);
			if let Some(kids) = children.get(&project_key(&f.id)) {
				stack.extend(kids.iter().copied());
			}
		}

		let subtree_ids: Vec<String> = subtree.iter().map(|f| project_key(&f.id)).collect();
		for file in files.iter().filter(|f| subtree_ids.contains(&project_key(&f.folder))) {
			store::delete_file_record(&self.db, file).await?;
		}
		for f in subtree.iter().rev() {
			store::delete_folder_record(&self.db, f).await?;
		}

		let abs = self.abs(&target.dir());
		match self
			.exec(project, &ContainerOp::RemovePath { path: abs, recursive: true })
			.await
		{
			Ok(out) if !out.ok() => {
				warn!(dir = %target.dir(), stderr = %out.stderr.trim(), "container folder delete failed")
			}
			Err(err) => warn!(dir = %target.dir(), %err, "container folder delete failed"),
			Ok(_) => {}
		}
		Ok(())
	}

	// ---- listings ----

	/// Root-relative canonical paths of every container file, with the
	/// dependency/VCS and transient exclusions applied.
	pub async fn list_files_recursive(
		&self,
		project: &RecordId,
		subpath: Option<&str>,
	) -> Result<Vec<String>, WorkspaceError> {
		Ok(self
			.list_files_meta(project, subpath)
			.await?
			.into_iter()
			.map(|m| m.path)
			.collect())
	}

	/// Same listing with size/mtime metadata (the watcher snapshot feed).
	pub async fn list_files_meta(
		&self,
		project: &RecordId,
		subpath: Option<&str>,
	) -> Result<Vec<FileMeta>, WorkspaceError> {
		let sub = subpath.map(paths::normalize).unwrap_or_default();
		let root = self.abs(&sub);
		let out = self.exec(project, &ContainerOp::ListFiles { root }).await?;
		if !out.ok() {
			return Err(WorkspaceError::ExecFailed(format!(
				"file listing exited {}: {}",
				out.exit_code,
				out.stderr.trim()
			)));
		}
		let mut metas = command::parse_file_listing(&out.stdout);
		if !sub.is_empty() {
			for m in &mut metas {
				m.path = paths::join(&[&sub, &m.path]);
			}
		}
		Ok(metas)
	}

	/// Root-relative canonical paths of every container directory.
	pub async fn list_dirs(&self, project: &RecordId) -> Result<Vec<String>, WorkspaceError> {
		let root = self.abs("");
		let out = self.exec(project, &ContainerOp::ListDirs { root }).await?;
		if !out.ok() {
			return Err(WorkspaceError::ExecFailed(format!(
				"dir listing exited {}: {}",
				out.exit_code,
				out.stderr.trim()
			)));
		}
		Ok(command::parse_dir_listing(&out.stdout))
	}

	/// Whether a path exists in the container filesystem.
	pub async fn path_exists(&self, project: &RecordId, path: &str) -> Result<bool, WorkspaceError> {
		let abs = self.abs(&paths::normalize(path));
		let out = self.exec(project, &ContainerOp::PathExists { path: abs }).await?;
		Ok(out.ok())
	}

	/// Remove a container path without touching the database (orphan
	/// cleanup uses this).
	pub async fn remove_container_path(
		&self,
		project: &RecordId,
		path: &str,
		recursive: bool,
	) -> Result<(), WorkspaceError> {
		let abs = self.abs(&paths::normalize(path));
		let out = self
			.exec(project, &ContainerOp::RemovePath { path: abs, recursive })
			.await?;
		if !out.ok() {
			return Err(WorkspaceError::ExecFailed(format!(
				"remove exited {}: {}",
				out.exit_code,
				out.stderr.trim()
			)));
		}
		Ok(())
	}

	// ---- bidirectional sync ----

	/// Materialize the database tree into the container: folders first in
	/// path order, then file contents. Used when a terminal session
	/// starts. Per-entry failures degrade the report, never abort it.
	pub async fn sync_database_to_container(
		&self,
		project: &RecordId,
	) -> Result<SyncReport, WorkspaceError> {
		let mut report = SyncReport::default();

		let mut folders = store::list_folders(&self.db, project).await?;
		folders.sort_by(|a, b| (a.level, a.dir()).cmp(&(b.level, b.dir())));
		for f in folders.iter().filter(|f| f.parent.is_some()) {
			let op = ContainerOp::MakeDirs { path: self.abs(&f.dir()) };
			match self.exec(project, &op).await {
				Ok(out) if out.ok() => report.created += 1,
				Ok(out) => {
					warn!(dir = %f.dir(), stderr = %out.stderr.trim(), "folder push failed");
					report.degraded += 1;
				}
				Err(err) => {
					warn!(dir = %f.dir(), %err, "folder push failed");
					report.degraded += 1;
				}
			}
		}

		for file in store::list_files(&self.db, project).await? {
			let content = store::get_file_content(&self.db, &file.id).await?;
			match self.mirror_write(project, &file.path, &content).await {
				Ok(()) => report.created += 1,
				Err(reason) => {
					warn!(path = %file.path, %reason, "file push failed");
					report.degraded += 1;
				}
			}
		}

		Ok(report)
	}

	/// The inverse direction: fold the container's current tree into the
	/// database. Creates records for new paths (duplicate policy applied)
	/// and refreshes content that differs. Never deletes database records
	/// missing from the container — a partial listing must not wipe
	/// durable state.
	pub async fn sync_container_to_database(
		&self,
		project: &RecordId,
		user: Option<&RecordId>,
	) -> Result<SyncReport, WorkspaceError> {
		let mut report = SyncReport::default();

		for path in self.list_files_recursive(project, None).await? {
			let Some(content) = self.read_file(project, &path).await? else {
				// vanished between listing and read
				continue;
			};

			if let Some(row) = store::find_file_by_path(&self.db, project, &path).await? {
				let current = store::get_file_content(&self.db, &row.id).await?;
				if current != content {
					store::update_file_content(&self.db, &row, &content, user).await?;
					report.updated += 1;
				}
				continue;
			}

			let (dir, name) = paths::split_parent(&path);
			let folder = store::ensure_folder_chain(&self.db, project, &dir, user).await?;
			if let Some(existing) = store::find_file_in_folder(&self.db, project, &folder.id, &name).await? {
				let current = store::get_file_content(&self.db, &existing.id).await?;
				if current != content {
					store::update_file_content(&self.db, &existing, &content, user).await?;
					report.updated += 1;
				}
				continue;
			}

			store::create_file(&self.db, project, &folder, &name, &content, user).await?;
			report.created += 1;
		}

		Ok(report)
	}

	/// Version history of a file, oldest snapshot first. The current
	/// content is not part of the list; it only becomes a snapshot when
	/// the next save lands.
	pub async fn file_history(
		&self,
		project: &RecordId,
		path: &str,
	) -> Result<Vec<FileVersion>, WorkspaceError> {
		let norm = paths::normalize(path);
		let row = store::find_file_by_path(&self.db, project, &norm)
			.await?
			.ok_or_else(|| WorkspaceError::FileNotFound(norm.clone()))?;
		let doc = store::get_file_document(&self.db, &row.id)
			.await?
			.ok_or(WorkspaceError::FileNotFound(norm))?;
		Ok(doc.versions)
	}

	// ---- cooperative edit locks ----

	pub async fn lock_file(
		&self,
		project: &RecordId,
		path: &str,
		user: &RecordId,
	) -> Result<(), WorkspaceError> {
		let norm = paths::normalize(path);
		let row = store::find_file_by_path(&self.db, project, &norm)
			.await?
			.ok_or_else(|| WorkspaceError::FileNotFound(norm.clone()))?;
		if row.is_locked && row.locked_by.as_ref() != Some(user) {
			return Err(WorkspaceError::LockedByOther { path: norm });
		}
		store::set_file_lock(&self.db, &row.id, user).await?;
		Ok(())
	}

	pub async fn unlock_file(
		&self,
		project: &RecordId,
		path: &str,
		user: &RecordId,
	) -> Result<(), WorkspaceError> {
		let norm = paths::normalize(path);
		let row = store::find_file_by_path(&self.db, project, &norm)
			.await?
			.ok_or_else(|| WorkspaceError::FileNotFound(norm.clone()))?;
		if !row.is_locked {
			return Ok(());
		}
		if row.locked_by.as_ref() != Some(user) {
			return Err(WorkspaceError::LockedByOther { path: norm });
		}
		store::clear_file_lock(&self.db, &row.id).await?;
		Ok(())
	}
}
