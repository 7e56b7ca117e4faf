//! Polling change watchers.
//!
//! One watcher task per `(project, kind)` pair polls the container on a
//! fixed interval, diffs the listing against the previous snapshot, and
//! broadcasts change events. Bursts of changes are coalesced by a
//! debounce before the reconciling sync runs.
//!
//! Stopping comes in two grades: `stop_watching` raises a flag the task
//! honors at its next tick (an in-flight sync finishes), while
//! `emergency_stop` aborts every task synchronously for shutdown paths
//! that cannot await.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use surrealdb::types::RecordId;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::engine::reconcile::{self, ReconcileError};
use crate::engine::workspace::{project_key, WorkspaceError, WorkspaceManager};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WatchKind {
	Files,
	Folders,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
	Requested,
	ErrorThreshold,
}

/// Broadcast to every subscriber; `project` is the project's record id
/// in string form, paths are canonical (root-relative).
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeEvent {
	Created { project: String, path: String },
	Modified { project: String, path: String },
	Deleted { project: String, path: String },
	Stopped { project: String, kind: WatchKind, reason: StopReason },
}

#[derive(Debug, Clone, PartialEq)]
pub struct WatcherStatus {
	pub active: bool,
	pub error_count: u32,
	pub last_scan: Option<DateTime<Utc>>,
	pub sync_pending: bool,
}

/// State visible from outside the watcher task.
struct WatcherShared {
	active: AtomicBool,
	error_count: AtomicU32,
	sync_pending: AtomicBool,
	last_scan: Mutex<Option<DateTime<Utc>>>,
	debounce: Mutex<Option<JoinHandle<()>>>,
}

impl WatcherShared {
	fn new() -> Arc<Self> {
		Arc::new(Self {
			active: AtomicBool::new(true),
			error_count: AtomicU32::new(0),
			sync_pending: AtomicBool::new(false),
			last_scan: Mutex::new(None),
			debounce: Mutex::new(None),
		})
	}
}

struct WatcherEntry {
	stop: Arc<AtomicBool>,
	task: JoinHandle<()>,
	shared: Arc<WatcherShared>,
}

pub struct WatcherService {
	ws: Arc<WorkspaceManager>,
	events: broadcast::Sender<ChangeEvent>,
	// std Mutex so emergency_stop stays callable from sync shutdown code
	watchers: Mutex<HashMap<(String, WatchKind), WatcherEntry>>,
}

impl WatcherService {
	pub fn new(ws: Arc<WorkspaceManager>) -> Self {
		let (events, _) = broadcast::channel(256);
		Self {
			ws,
			events,
			watchers: Mutex::new(HashMap::new()),
		}
	}

	pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
		self.events.subscribe()
	}

	/// Spawn a watcher for `(project, kind)`. Returns false if one is
	/// already active. A watcher that stopped itself after repeated scan
	/// failures is replaced.
	pub fn start_watching(
		&self,
		project: &RecordId,
		kind: WatchKind,
		user: Option<RecordId>,
	) -> bool {
		let key = project_key(project);
		let mut watchers = self.watchers.lock().unwrap();
		if let Some(entry) = watchers.get(&(key.clone(), kind)) {
			if entry.shared.active.load(Ordering::Relaxed) {
				return false;
			}
		}

		let stop = Arc::new(AtomicBool::new(false));
		let shared = WatcherShared::new();
		let task = tokio::spawn(watch_loop(WatchContext {
			ws: self.ws.clone(),
			events: self.events.clone(),
			project: project.clone(),
			key: key.clone(),
			kind,
			user,
			stop: stop.clone(),
			shared: shared.clone(),
		}));
		info!(project = %key, ?kind, "watcher started");
		watchers.insert((key, kind), WatcherEntry { stop, task, shared });
		true
	}

	/// Cooperative stop: the task exits at its next tick and any pending
	/// debounced sync is allowed to finish.
	pub fn stop_watching(&self, project: &RecordId, kind: WatchKind) -> bool {
		let key = project_key(project);
		let mut watchers = self.watchers.lock().unwrap();
		match watchers.remove(&(key.clone(), kind)) {
			Some(entry) => {
				entry.stop.store(true, Ordering::Relaxed);
				info!(project = %key, ?kind, "watcher stop requested");
				true
			}
			None => false,
		}
	}

	pub fn stop_all(&self) {
		let mut watchers = self.watchers.lock().unwrap();
		for ((key, kind), entry) in watchers.drain() {
			entry.stop.store(true, Ordering::Relaxed);
			debug!(project = %key, ?kind, "watcher stop requested");
		}
	}

	/// Hard shutdown: abort every watcher task and pending debounce
	/// immediately. Safe to call without a runtime handle of its own.
	pub fn emergency_stop(&self) {
		let mut watchers = self.watchers.lock().unwrap();
		for ((key, kind), entry) in watchers.drain() {
			entry.stop.store(true, Ordering::Relaxed);
			entry.task.abort();
			if let Some(pending) = entry.shared.debounce.lock().unwrap().take() {
				pending.abort();
			}
			entry.shared.active.store(false, Ordering::Relaxed);
			warn!(project = %key, ?kind, "watcher aborted");
		}
	}

	/// Run the watcher's sync immediately, bypassing the debounce.
	pub async fn force_sync(
		&self,
		project: &RecordId,
		kind: WatchKind,
		user: Option<&RecordId>,
	) -> Result<(), ReconcileError> {
		run_sync(&self.ws, project, kind, user).await
	}

	pub fn watcher_status(&self, project: &RecordId, kind: WatchKind) -> Option<WatcherStatus> {
		let watchers = self.watchers.lock().unwrap();
		watchers.get(&(project_key(project), kind)).map(|entry| WatcherStatus {
			active: entry.shared.active.load(Ordering::Relaxed),
			error_count: entry.shared.error_count.load(Ordering::Relaxed),
			last_scan: *entry.shared.last_scan.lock().unwrap(),
			sync_pending: entry.shared.sync_pending.load(Ordering::Relaxed),
		})
	}
}

struct WatchContext {
	ws: Arc<WorkspaceManager>,
	events: broadcast::Sender<ChangeEvent>,
	project: RecordId,
	key: String,
	kind: WatchKind,
	user: Option<RecordId>,
	stop: Arc<AtomicBool>,
	shared: Arc<WatcherShared>,
}

/// Snapshot entry: (size, mtime) for files, zeroes for folders (a
/// folder only ever appears or disappears).
type Snapshot = HashMap<String, (u64, i64)>;

async fn watch_loop(ctx: WatchContext) {
	let cfg = ctx.ws.config();
	let poll = cfg.poll_interval();
	let debounce = cfg.debounce();
	let max_failures = cfg.max_scan_failures;

	let mut interval = tokio::time::interval(poll);
	interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

	let mut snapshot: Option<Snapshot> = None;
	let reason = loop {
		interval.tick().await;
		if ctx.stop.load(Ordering::Relaxed) {
			break StopReason::Requested;
		}

		match scan(&ctx.ws, &ctx.project, ctx.kind).await {
			Ok(current) => {
				ctx.shared.error_count.store(0, Ordering::Relaxed);
				*ctx.shared.last_scan.lock().unwrap() = Some(Utc::now());

				// the first scan only seeds the snapshot; pre-existing
				// content is not a change
				if let Some(prev) = &snapshot {
					let changed = emit_diff(&ctx, prev, &current);
					if changed {
						schedule_sync(&ctx, debounce);
					}
				}
				snapshot = Some(current);
			}
			Err(err) => {
				let failures = ctx.shared.error_count.fetch_add(1, Ordering::Relaxed) + 1;
				warn!(project = %ctx.key, kind = ?ctx.kind, %err, failures, "watcher scan failed");
				if failures >= max_failures {
					break StopReason::ErrorThreshold;
				}
			}
		}
	};

	ctx.shared.active.store(false, Ordering::Relaxed);
	info!(project = %ctx.key, kind = ?ctx.kind, ?reason, "watcher stopped");
	let _ = ctx.events.send(ChangeEvent::Stopped {
		project: ctx.key.clone(),
		kind: ctx.kind,
		reason,
	});
}

async fn scan(
	ws: &WorkspaceManager,
	project: &RecordId,
	kind: WatchKind,
) -> Result<Snapshot, WorkspaceError> {
	match kind {
		WatchKind::Files => Ok(ws
			.list_files_meta(project, None)
			.await?
			.into_iter()
			.map(|m| (m.path, (m.size, m.mtime)))
			.collect()),
		WatchKind::Folders => Ok(ws
			.list_dirs(project)
			.await?
			.into_iter()
			.map(|d| (d, (0, 0)))
			.collect()),
	}
}

fn emit_diff(ctx: &WatchContext, prev: &Snapshot, current: &Snapshot) -> bool {
	let mut changed = false;
	for (path, meta) in current {
		match prev.get(path) {
			None => {
				changed = true;
				let _ = ctx.events.send(ChangeEvent::Created {
					project: ctx.key.clone(),
					path: path.clone(),
				});
			}
			Some(old) if old != meta => {
				changed = true;
				let _ = ctx.events.send(ChangeEvent::Modified {
					project: ctx.key.clone(),
					path: path.clone(),
				});
			}
			Some(_) => {}
		}
	}
	for path in prev.keys() {
		if !current.contains_key(path) {
			changed = true;
			let _ = ctx.events.send(ChangeEvent::Deleted {
				project: ctx.key.clone(),
				path: path.clone(),
			});
		}
	}
	changed
}

/// (Re)arm the debounced sync: a fresh change aborts the pending timer
/// and starts the wait over, so a burst syncs once.
fn schedule_sync(ctx: &WatchContext, debounce: std::time::Duration) {
	let mut slot = ctx.shared.debounce.lock().unwrap();
	if let Some(pending) = slot.take() {
		pending.abort();
	}
	ctx.shared.sync_pending.store(true, Ordering::Relaxed);

	let ws = ctx.ws.clone();
	let project = ctx.project.clone();
	let key = ctx.key.clone();
	let kind = ctx.kind;
	let user = ctx.user.clone();
	let shared = ctx.shared.clone();
	*slot = Some(tokio::spawn(async move {
		tokio::time::sleep(debounce).await;
		if let Err(err) = run_sync(&ws, &project, kind, user.as_ref()).await {
			warn!(project = %key, ?kind, %err, "debounced sync failed");
		}
		shared.sync_pending.store(false, Ordering::Relaxed);
	}));
}

async fn run_sync(
	ws: &WorkspaceManager,
	project: &RecordId,
	kind: WatchKind,
	user: Option<&RecordId>,
) -> Result<(), ReconcileError> {
	match kind {
		WatchKind::Files => {
			ws.sync_container_to_database(project, user).await?;
		}
		WatchKind::Folders => {
			reconcile::sync_missing_folders(ws.db(), ws, project, user).await?;
		}
	}
	Ok(())
}

#[cfg(test)]
mod tests {
	use std::time::Duration;

	use super::*;
	use crate::config::EngineConfig;
	use crate::db::{self, DbHandle};
	use crate::engine::runtime::container_name;
	use crate::engine::store;
	use crate::engine::testing::FakeRuntime;

	struct Fixture {
		db: DbHandle,
		runtime: Arc<FakeRuntime>,
		ws: Arc<WorkspaceManager>,
		svc: WatcherService,
		project: RecordId,
		user: RecordId,
	}

	async fn setup() -> Fixture {
		let handle = db::init_mem().await;
		let user = store::create_user(&handle, "ada").await.unwrap();
		let project = store::create_project(&handle, "demo", &user).await.unwrap();
		let runtime = Arc::new(FakeRuntime::new());
		let cfg = EngineConfig {
			poll_interval_ms: 25,
			debounce_ms: 40,
			..EngineConfig::default()
		};
		let ws = Arc::new(WorkspaceManager::new(handle.clone(), runtime.clone(), cfg));
		ws.get_or_create_workspace(&project).await.unwrap();
		let svc = WatcherService::new(ws.clone());
		Fixture { db: handle, runtime, ws, svc, project, user }
	}

	impl Fixture {
		fn container(&self) -> String {
			container_name(&project_key(&self.project))
		}
	}

	async fn next_event(rx: &mut broadcast::Receiver<ChangeEvent>) -> ChangeEvent {
		tokio::time::timeout(Duration::from_secs(5), rx.recv())
			.await
			.expect("event within deadline")
			.expect("channel open")
	}

	#[tokio::test]
	async fn new_file_emits_created_and_lands_in_database() {
		let fx = setup().await;
		let mut rx = fx.svc.subscribe();
		assert!(fx.svc.start_watching(&fx.project, WatchKind::Files, Some(fx.user.clone())));

		// let the first scan seed the snapshot
		tokio::time::sleep(Duration::from_millis(100)).await;
		fx.runtime.seed_file(&fx.container(), "z.txt", "fresh");

		let event = next_event(&mut rx).await;
		assert_eq!(
			event,
			ChangeEvent::Created {
				project: project_key(&fx.project),
				path: "z.txt".into()
			}
		);

		// record appears once the debounced sync has run
		let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
		loop {
			if store::find_file_by_path(&fx.db, &fx.project, "z.txt")
				.await
				.unwrap()
				.is_some()
			{
				break;
			}
			assert!(tokio::time::Instant::now() < deadline, "sync never landed");
			tokio::time::sleep(Duration::from_millis(20)).await;
		}

		fx.svc.stop_watching(&fx.project, WatchKind::Files);
	}

	#[tokio::test]
	async fn changed_content_emits_modified_and_syncs() {
		let fx = setup().await;
		fx.ws
			.write_file(&fx.project, "state.txt", "v1", Some(&fx.user))
			.await
			.unwrap();

		let mut rx = fx.svc.subscribe();
		assert!(fx.svc.start_watching(&fx.project, WatchKind::Files, Some(fx.user.clone())));
		tokio::time::sleep(Duration::from_millis(100)).await;

		// different byte length, so the (size, mtime) snapshot entry moves
		fx.runtime.seed_file(&fx.container(), "state.txt", "version two");

		let event = next_event(&mut rx).await;
		assert_eq!(
			event,
			ChangeEvent::Modified {
				project: project_key(&fx.project),
				path: "state.txt".into()
			}
		);

		// the debounced sync folds the new content into the database
		let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
		loop {
			let row = store::find_file_by_path(&fx.db, &fx.project, "state.txt")
				.await
				.unwrap()
				.unwrap();
			if store::get_file_content(&fx.db, &row.id).await.unwrap() == "version two" {
				assert_eq!(row.version, 2);
				break;
			}
			assert!(tokio::time::Instant::now() < deadline, "content sync never landed");
			tokio::time::sleep(Duration::from_millis(20)).await;
		}

		fx.svc.stop_watching(&fx.project, WatchKind::Files);
	}

	#[tokio::test]
	async fn deleted_file_emits_deleted_but_record_survives() {
		let fx = setup().await;
		fx.ws
			.write_file(&fx.project, "keep.txt", "v1", Some(&fx.user))
			.await
			.unwrap();

		let mut rx = fx.svc.subscribe();
		assert!(fx.svc.start_watching(&fx.project, WatchKind::Files, Some(fx.user.clone())));
		tokio::time::sleep(Duration::from_millis(100)).await;

		std::fs::remove_file(fx.runtime.workspace_path(&fx.container(), "keep.txt")).unwrap();

		let event = next_event(&mut rx).await;
		assert_eq!(
			event,
			ChangeEvent::Deleted {
				project: project_key(&fx.project),
				path: "keep.txt".into()
			}
		);

		// the sync direction never deletes database records
		tokio::time::sleep(Duration::from_millis(150)).await;
		assert!(store::find_file_by_path(&fx.db, &fx.project, "keep.txt")
			.await
			.unwrap()
			.is_some());

		fx.svc.stop_watching(&fx.project, WatchKind::Files);
	}

	#[tokio::test]
	async fn second_start_is_rejected_while_active() {
		let fx = setup().await;
		assert!(fx.svc.start_watching(&fx.project, WatchKind::Files, None));
		assert!(!fx.svc.start_watching(&fx.project, WatchKind::Files, None));
		// a different kind is its own watcher
		assert!(fx.svc.start_watching(&fx.project, WatchKind::Folders, None));
		fx.svc.stop_all();
	}

	#[tokio::test]
	async fn repeated_scan_failures_stop_the_watcher() {
		let fx = setup().await;
		let mut rx = fx.svc.subscribe();
		assert!(fx.svc.start_watching(&fx.project, WatchKind::Files, None));
		tokio::time::sleep(Duration::from_millis(100)).await;

		fx.runtime.set_fail_exec(true);

		let event = next_event(&mut rx).await;
		assert_eq!(
			event,
			ChangeEvent::Stopped {
				project: project_key(&fx.project),
				kind: WatchKind::Files,
				reason: StopReason::ErrorThreshold,
			}
		);

		let status = fx.svc.watcher_status(&fx.project, WatchKind::Files).unwrap();
		assert!(!status.active);

		// the dead entry may be replaced
		fx.runtime.set_fail_exec(false);
		assert!(fx.svc.start_watching(&fx.project, WatchKind::Files, None));
		fx.svc.stop_all();
	}

	#[tokio::test]
	async fn folder_watcher_syncs_new_directories() {
		let fx = setup().await;
		let mut rx = fx.svc.subscribe();
		assert!(fx.svc.start_watching(&fx.project, WatchKind::Folders, Some(fx.user.clone())));
		tokio::time::sleep(Duration::from_millis(100)).await;

		fx.runtime.seed_dir(&fx.container(), "notes");

		let event = next_event(&mut rx).await;
		assert_eq!(
			event,
			ChangeEvent::Created {
				project: project_key(&fx.project),
				path: "notes".into()
			}
		);

		let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
		loop {
			if store::find_folder(&fx.db, &fx.project, "", "notes")
				.await
				.unwrap()
				.is_some()
			{
				break;
			}
			assert!(tokio::time::Instant::now() < deadline, "folder sync never landed");
			tokio::time::sleep(Duration::from_millis(20)).await;
		}

		fx.svc.stop_watching(&fx.project, WatchKind::Folders);
	}

	#[tokio::test]
	async fn force_sync_bypasses_debounce() {
		let fx = setup().await;
		fx.runtime.seed_file(&fx.container(), "direct.txt", "now");

		fx.svc
			.force_sync(&fx.project, WatchKind::Files, Some(&fx.user))
			.await
			.unwrap();

		assert!(store::find_file_by_path(&fx.db, &fx.project, "direct.txt")
			.await
			.unwrap()
			.is_some());
	}

	#[tokio::test]
	async fn emergency_stop_clears_every_watcher() {
		let fx = setup().await;
		assert!(fx.svc.start_watching(&fx.project, WatchKind::Files, None));
		assert!(fx.svc.start_watching(&fx.project, WatchKind::Folders, None));

		fx.svc.emergency_stop();

		assert!(fx.svc.watcher_status(&fx.project, WatchKind::Files).is_none());
		assert!(fx.svc.watcher_status(&fx.project, WatchKind::Folders).is_none());
		// immediately restartable
		assert!(fx.svc.start_watching(&fx.project, WatchKind::Files, None));
		fx.svc.stop_all();
	}
}
