//! Container engine client.
//!
//! Thin wrapper over a docker-compatible CLI. Everything above it talks
//! to the [`ContainerRuntime`] trait so tests can substitute an
//! in-process runtime.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

use crate::engine::command::ContainerOp;

#[derive(Debug, Error)]
pub enum RuntimeError {
	#[error("failed to spawn container engine: {0}")]
	Spawn(String),

	#[error("container engine call timed out after {0:?}")]
	Timeout(Duration),

	#[error("container {0} is not running")]
	NotRunning(String),

	#[error("container {0} does not exist")]
	Missing(String),

	#[error("container engine command failed: {command}: {stderr}")]
	CommandFailed { command: String, stderr: String },
}

/// Observed container state, collapsed to what the engine acts on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
	Missing,
	Created,
	Running,
	Exited,
}

/// Parameters for creating a workspace container: fixed resource
/// ceiling, one named volume mounted at the workspace root.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerSpec {
	pub name: String,
	pub image: String,
	pub volume: String,
	pub mount_path: String,
	pub memory_limit: String,
	pub cpu_shares: u32,
}

/// Captured output of one exec.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecOutput {
	pub stdout: String,
	pub stderr: String,
	pub exit_code: i32,
}

impl ExecOutput {
	pub fn ok(&self) -> bool {
		self.exit_code == 0
	}
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
	async fn create_volume(&self, name: &str) -> Result<(), RuntimeError>;
	async fn create_container(&self, spec: &ContainerSpec) -> Result<(), RuntimeError>;
	async fn start_container(&self, name: &str) -> Result<(), RuntimeError>;
	async fn stop_container(&self, name: &str) -> Result<(), RuntimeError>;
	async fn remove_container(&self, name: &str) -> Result<(), RuntimeError>;
	async fn container_state(&self, name: &str) -> Result<ContainerState, RuntimeError>;

	/// Run one typed op inside the container, stdout/stderr captured.
	/// A nonzero exit from the op itself is reported in [`ExecOutput`],
	/// not as an error; engine-level failures (daemon unreachable,
	/// container gone, timeout) are errors.
	async fn exec(&self, name: &str, op: &ContainerOp) -> Result<ExecOutput, RuntimeError>;
}

/// Container/volume naming convention, derived from the project record
/// id. The id's display form (`project:abc`) is sanitized so one scheme
/// covers any id shape.
pub fn container_name(project_key: &str) -> String {
	format!("workspace-{}", sanitize(project_key))
}

pub fn volume_name(project_key: &str) -> String {
	format!("volume-{}", sanitize(project_key))
}

fn sanitize(key: &str) -> String {
	key.chars()
		.map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '-' })
		.collect()
}

/// Docker-compatible CLI client (`docker` or `podman`).
pub struct DockerCli {
	bin: String,
	exec_timeout: Duration,
}

impl DockerCli {
	pub fn new(bin: impl Into<String>, exec_timeout: Duration) -> Self {
		Self { bin: bin.into(), exec_timeout }
	}

	async fn run(&self, args: &[&str]) -> Result<ExecOutput, RuntimeError> {
		debug!(bin = %self.bin, ?args, "container engine call");
		let fut = Command::new(&self.bin)
			.args(args)
			.kill_on_drop(true)
			.output();

		let output = tokio::time::timeout(self.exec_timeout, fut)
			.await
			.map_err(|_| RuntimeError::Timeout(self.exec_timeout))?
			.map_err(|e| RuntimeError::Spawn(e.to_string()))?;

		Ok(ExecOutput {
			stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
			stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
			exit_code: output.status.code().unwrap_or(-1),
		})
	}

	async fn run_checked(&self, args: &[&str]) -> Result<ExecOutput, RuntimeError> {
		let out = self.run(args).await?;
		if !out.ok() {
			return Err(RuntimeError::CommandFailed {
				command: format!("{} {}", self.bin, args.join(" ")),
				stderr: out.stderr.trim().to_string(),
			});
		}
		Ok(out)
	}
}

#[async_trait]
impl ContainerRuntime for DockerCli {
	async fn create_volume(&self, name: &str) -> Result<(), RuntimeError> {
		// `volume create` is idempotent for an existing name.
		self.run_checked(&["volume", "create", name]).await?;
		Ok(())
	}

	async fn create_container(&self, spec: &ContainerSpec) -> Result<(), RuntimeError> {
		let memory = format!("--memory={}", spec.memory_limit);
		let cpu = format!("--cpu-shares={}", spec.cpu_shares);
		let mount = format!("{}:{}", spec.volume, spec.mount_path);
		self.run_checked(&[
			"create",
			"--name",
			&spec.name,
			&memory,
			&cpu,
			"-v",
			&mount,
			"-w",
			&spec.mount_path,
			&spec.image,
			"sleep",
			"infinity",
		])
		.await?;
		Ok(())
	}

	async fn start_container(&self, name: &str) -> Result<(), RuntimeError> {
		self.run_checked(&["start", name]).await?;
		Ok(())
	}

	async fn stop_container(&self, name: &str) -> Result<(), RuntimeError> {
		self.run_checked(&["stop", name]).await?;
		Ok(())
	}

	async fn remove_container(&self, name: &str) -> Result<(), RuntimeError> {
		self.run_checked(&["rm", "-f", name]).await?;
		Ok(())
	}

	async fn container_state(&self, name: &str) -> Result<ContainerState, RuntimeError> {
		let out = self
			.run(&["inspect", "-f", "{{.State.Status}}", name])
			.await?;
		if !out.ok() {
			if out.stderr.contains("No such") {
				return Ok(ContainerState::Missing);
			}
			return Err(RuntimeError::CommandFailed {
				command: format!("{} inspect {name}", self.bin),
				stderr: out.stderr.trim().to_string(),
			});
		}
		Ok(match out.stdout.trim() {
			"running" => ContainerState::Running,
			"created" => ContainerState::Created,
			// paused/restarting/removing/dead all need the same
			// recreate-or-restart handling as a plain exit
			_ => ContainerState::Exited,
		})
	}

	async fn exec(&self, name: &str, op: &ContainerOp) -> Result<ExecOutput, RuntimeError> {
		let script = op.render_script();
		let out = self.run(&["exec", name, "sh", "-c", &script]).await?;
		if !out.ok() {
			if out.stderr.contains("is not running") || out.stderr.contains("not started") {
				return Err(RuntimeError::NotRunning(name.to_string()));
			}
			if out.stderr.contains("No such container") {
				return Err(RuntimeError::Missing(name.to_string()));
			}
		}
		Ok(out)
	}
}
