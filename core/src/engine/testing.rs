//! In-process container runtime for tests.
//!
//! Interprets [`ContainerOp`] directly against a tempdir, producing the
//! same stdout formats as the docker rendering, so everything above the
//! [`ContainerRuntime`] trait runs unchanged. Volume-mounted paths live
//! under a per-volume directory, so workspace content survives container
//! recreation exactly like a named docker volume.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::UNIX_EPOCH;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use tokio::sync::Notify;
use walkdir::WalkDir;

use crate::engine::command::{self, ContainerOp};
use crate::engine::runtime::{
	ContainerRuntime, ContainerSpec, ContainerState, ExecOutput, RuntimeError,
};

struct FakeContainer {
	state: ContainerState,
	volume: String,
	mount_path: String,
}

#[derive(Default)]
struct FakeState {
	containers: HashMap<String, FakeContainer>,
	volumes: Vec<String>,
	create_calls: u64,
	raw_scripts: Vec<String>,
	create_gates: HashMap<String, Arc<Notify>>,
	fail_exec: bool,
}

pub struct FakeRuntime {
	root: tempfile::TempDir,
	state: Mutex<FakeState>,
}

impl FakeRuntime {
	pub fn new() -> Self {
		Self {
			root: tempfile::tempdir().expect("fake runtime tempdir"),
			state: Mutex::new(FakeState::default()),
		}
	}

	pub fn create_calls(&self) -> u64 {
		self.state.lock().unwrap().create_calls
	}

	pub fn raw_scripts(&self) -> Vec<String> {
		self.state.lock().unwrap().raw_scripts.clone()
	}

	/// Make every exec fail until cleared (dead-container simulation).
	pub fn set_fail_exec(&self, fail: bool) {
		self.state.lock().unwrap().fail_exec = fail;
	}

	/// Hold the next create of `container` open until the returned
	/// handle is notified (slow-engine simulation).
	pub fn gate_create(&self, container: &str) -> Arc<Notify> {
		let gate = Arc::new(Notify::new());
		self.state
			.lock()
			.unwrap()
			.create_gates
			.insert(container.to_string(), gate.clone());
		gate
	}

	/// Force a container's observed state (external stop/kill).
	pub fn force_state(&self, container: &str, state: ContainerState) {
		if let Some(c) = self.state.lock().unwrap().containers.get_mut(container) {
			c.state = state;
		}
	}

	fn volume_dir(&self, volume: &str) -> PathBuf {
		self.root.path().join("volumes").join(volume)
	}

	/// Host path backing an absolute in-container path.
	fn host_path(&self, container: &str, abs: &str) -> Result<PathBuf, RuntimeError> {
		let state = self.state.lock().unwrap();
		let c = state
			.containers
			.get(container)
			.ok_or_else(|| RuntimeError::Missing(container.to_string()))?;
		let mount = c.mount_path.trim_end_matches('/');
		if abs == mount || abs.starts_with(&format!("{mount}/")) {
			let rel = abs[mount.len()..].trim_start_matches('/');
			Ok(self.volume_dir(&c.volume).join(rel))
		} else {
			Ok(self
				.root
				.path()
				.join("containers")
				.join(container)
				.join(abs.trim_start_matches('/')))
		}
	}

	/// Host path of a workspace-relative file (test seeding/inspection).
	pub fn workspace_path(&self, container: &str, rel: &str) -> PathBuf {
		let state = self.state.lock().unwrap();
		let c = state.containers.get(container).expect("container exists");
		self.volume_dir(&c.volume).join(rel.trim_start_matches('/'))
	}

	pub fn seed_file(&self, container: &str, rel: &str, content: &str) {
		let path = self.workspace_path(container, rel);
		fs::create_dir_all(path.parent().unwrap()).unwrap();
		fs::write(path, content).unwrap();
	}

	pub fn seed_dir(&self, container: &str, rel: &str) {
		fs::create_dir_all(self.workspace_path(container, rel)).unwrap();
	}

	pub fn workspace_file(&self, container: &str, rel: &str) -> Option<String> {
		fs::read_to_string(self.workspace_path(container, rel)).ok()
	}

	fn check_running(&self, container: &str) -> Result<(), RuntimeError> {
		let state = self.state.lock().unwrap();
		if state.fail_exec {
			return Err(RuntimeError::Spawn("injected exec failure".into()));
		}
		match state.containers.get(container) {
			None => Err(RuntimeError::Missing(container.to_string())),
			Some(c) if c.state != ContainerState::Running => {
				Err(RuntimeError::NotRunning(container.to_string()))
			}
			Some(_) => Ok(()),
		}
	}

	fn interpret(&self, container: &str, op: &ContainerOp) -> Result<ExecOutput, RuntimeError> {
		let ok = |stdout: String| ExecOutput { stdout, stderr: String::new(), exit_code: 0 };
		let fail = |stderr: &str| ExecOutput {
			stdout: String::new(),
			stderr: stderr.to_string(),
			exit_code: 1,
		};

		Ok(match op {
			ContainerOp::MakeDirs { path } => {
				let host = self.host_path(container, path)?;
				match fs::create_dir_all(&host) {
					Ok(()) => ok(String::new()),
					Err(e) => fail(&e.to_string()),
				}
			}
			ContainerOp::WriteFile { path, content_b64 } => {
				let host = self.host_path(container, path)?;
				let Ok(bytes) = B64.decode(content_b64) else {
					return Ok(fail("base64: invalid input"));
				};
				if let Some(parent) = host.parent() {
					if let Err(e) = fs::create_dir_all(parent) {
						return Ok(fail(&e.to_string()));
					}
				}
				match fs::write(&host, bytes) {
					Ok(()) => ok(String::new()),
					Err(e) => fail(&e.to_string()),
				}
			}
			ContainerOp::ReadFile { path } => {
				let host = self.host_path(container, path)?;
				match fs::read(&host) {
					Ok(bytes) => ok(B64.encode(bytes)),
					Err(_) => fail("No such file or directory"),
				}
			}
			ContainerOp::RemovePath { path, recursive } => {
				let host = self.host_path(container, path)?;
				if !host.exists() {
					// rm -f semantics
					return Ok(ok(String::new()));
				}
				let result = if *recursive {
					fs::remove_dir_all(&host)
				} else if host.is_dir() {
					return Ok(fail("Is a directory"));
				} else {
					fs::remove_file(&host)
				};
				match result {
					Ok(()) => ok(String::new()),
					Err(e) => fail(&e.to_string()),
				}
			}
			ContainerOp::RemoveDirIfEmpty { path } => {
				let host = self.host_path(container, path)?;
				let _ = fs::remove_dir(&host);
				ok(String::new())
			}
			ContainerOp::ListFiles { root } => {
				let host = self.host_path(container, root)?;
				if !host.is_dir() {
					return Ok(fail("No such file or directory"));
				}
				let mut lines = Vec::new();
				for entry in WalkDir::new(&host).into_iter().filter_map(|e| e.ok()) {
					if !entry.file_type().is_file() {
						continue;
					}
					let rel = entry
						.path()
						.strip_prefix(&host)
						.expect("walkdir entry under root")
						.to_string_lossy()
						.to_string();
					if command::is_excluded_file(&rel) {
						continue;
					}
					let meta = entry.metadata().map_err(|e| RuntimeError::Spawn(e.to_string()))?;
					let mtime = meta
						.modified()
						.ok()
						.and_then(|t| t.duration_since(UNIX_EPOCH).ok())
						.map(|d| d.as_secs())
						.unwrap_or(0);
					lines.push(format!("{}\t{}\t{}", meta.len(), mtime, rel));
				}
				ok(lines.join("\n"))
			}
			ContainerOp::ListDirs { root } => {
				let host = self.host_path(container, root)?;
				if !host.is_dir() {
					return Ok(fail("No such file or directory"));
				}
				let mut lines = Vec::new();
				for entry in WalkDir::new(&host).into_iter().filter_map(|e| e.ok()) {
					if !entry.file_type().is_dir() {
						continue;
					}
					let rel = entry
						.path()
						.strip_prefix(&host)
						.expect("walkdir entry under root")
						.to_string_lossy()
						.to_string();
					if rel.is_empty() || command::is_excluded_dir(&rel) {
						continue;
					}
					lines.push(rel);
				}
				ok(lines.join("\n"))
			}
			ContainerOp::PathExists { path } => {
				let host = self.host_path(container, path)?;
				if host.exists() {
					ok(String::new())
				} else {
					fail("")
				}
			}
			ContainerOp::Raw { script } => {
				self.state.lock().unwrap().raw_scripts.push(script.clone());
				ok(String::new())
			}
		})
	}
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
	async fn create_volume(&self, name: &str) -> Result<(), RuntimeError> {
		fs::create_dir_all(self.volume_dir(name)).map_err(|e| RuntimeError::Spawn(e.to_string()))?;
		let mut state = self.state.lock().unwrap();
		if !state.volumes.contains(&name.to_string()) {
			state.volumes.push(name.to_string());
		}
		Ok(())
	}

	async fn create_container(&self, spec: &ContainerSpec) -> Result<(), RuntimeError> {
		let gate = self.state.lock().unwrap().create_gates.remove(&spec.name);
		if let Some(gate) = gate {
			gate.notified().await;
		}
		let mut state = self.state.lock().unwrap();
		if state.containers.contains_key(&spec.name) {
			return Err(RuntimeError::CommandFailed {
				command: format!("create {}", spec.name),
				stderr: format!("container name \"{}\" is already in use", spec.name),
			});
		}
		state.create_calls += 1;
		state.containers.insert(
			spec.name.clone(),
			FakeContainer {
				state: ContainerState::Created,
				volume: spec.volume.clone(),
				mount_path: spec.mount_path.clone(),
			},
		);
		Ok(())
	}

	async fn start_container(&self, name: &str) -> Result<(), RuntimeError> {
		let mut state = self.state.lock().unwrap();
		match state.containers.get_mut(name) {
			Some(c) => {
				c.state = ContainerState::Running;
				Ok(())
			}
			None => Err(RuntimeError::Missing(name.to_string())),
		}
	}

	async fn stop_container(&self, name: &str) -> Result<(), RuntimeError> {
		let mut state = self.state.lock().unwrap();
		match state.containers.get_mut(name) {
			Some(c) => {
				c.state = ContainerState::Exited;
				Ok(())
			}
			None => Err(RuntimeError::Missing(name.to_string())),
		}
	}

	async fn remove_container(&self, name: &str) -> Result<(), RuntimeError> {
		self.state.lock().unwrap().containers.remove(name);
		let dir = self.root.path().join("containers").join(name);
		let _ = fs::remove_dir_all(dir);
		Ok(())
	}

	async fn container_state(&self, name: &str) -> Result<ContainerState, RuntimeError> {
		let state = self.state.lock().unwrap();
		Ok(state
			.containers
			.get(name)
			.map(|c| c.state)
			.unwrap_or(ContainerState::Missing))
	}

	async fn exec(&self, name: &str, op: &ContainerOp) -> Result<ExecOutput, RuntimeError> {
		self.check_running(name)?;
		self.interpret(name, op)
	}
}
