//! Sandbox executor (C8): creates/runs/removes a hardened container per
//! skill invocation, demultiplexing stdout/stderr.

mod docker;
mod fake;

use std::path::PathBuf;
use std::pin::Pin;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::AsyncRead;

pub use docker::DockerRuntime;
pub use fake::FakeRuntime;
pub use fake::ScriptedContainer;

pub const DEFAULT_IMAGE_USER: &str = "1000:1000";
pub const MANAGED_BY_LABEL: &str = "managed_by";
pub const MANAGED_BY_VALUE: &str = "aegisclaw";
pub const SKILL_LABEL: &str = "aegisclaw.skill";

const MEMORY_LIMIT_BYTES: i64 = 512 * 1024 * 1024;
const SWAP_LIMIT_BYTES: i64 = 512 * 1024 * 1024;
const NANO_CPUS: i64 = 1_000_000_000;
const PIDS_LIMIT: i64 = 100;

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("image {0:?} could not be pulled: {1}")]
    ImagePull(String, String),
    #[error("container create failed: {0}")]
    Create(String),
    #[error("container start failed: {0}")]
    Start(String),
    #[error("container wait failed: {0}")]
    Wait(String),
    #[error("unsupported sandbox runtime {0:?}")]
    UnknownRuntime(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("docker error: {0}")]
    Docker(String),
}

/// A single bind mount into the container.
#[derive(Debug, Clone)]
pub struct BindMount {
    pub src: PathBuf,
    pub dst: PathBuf,
    pub ro: bool,
}

/// Input to `ContainerRuntime::create` (spec §3 "Sandbox config").
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    pub skill_name: String,
    pub image: String,
    pub command: Vec<String>,
    pub env: Vec<String>,
    pub work_dir: Option<String>,
    pub mounts: Vec<BindMount>,
    pub network: bool,
    pub allowed_domains: Vec<String>,
    pub runtime: String,
    pub seccomp_path: Option<PathBuf>,
}

/// Handle returned by `create`, opaque beyond the id the runtime needs to
/// address the container in later calls.
#[derive(Debug, Clone)]
pub struct ContainerHandle {
    pub id: String,
}

/// Demultiplexed log streams, one reader per channel.
pub struct LogStreams {
    pub stdout: Pin<Box<dyn AsyncRead + Send>>,
    pub stderr: Pin<Box<dyn AsyncRead + Send>>,
}

/// Outcome of waiting on a container to exit.
#[derive(Debug, Clone, Copy)]
pub struct SandboxResult {
    pub exit_code: i64,
}

/// Abstracts container lifecycle so the orchestrator's state machine is
/// unit-testable without a Docker daemon in the loop.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn create(&self, config: &SandboxConfig) -> Result<ContainerHandle, SandboxError>;
    async fn start(&self, handle: &ContainerHandle) -> Result<(), SandboxError>;
    async fn logs(&self, handle: &ContainerHandle) -> Result<LogStreams, SandboxError>;
    async fn wait(&self, handle: &ContainerHandle) -> Result<SandboxResult, SandboxError>;
    async fn kill(&self, handle: &ContainerHandle) -> Result<(), SandboxError>;
    async fn remove(&self, handle: &ContainerHandle) -> Result<(), SandboxError>;
    /// Lists containers bearing `managed_by=aegisclaw` (including stopped)
    /// and forcibly removes each.
    async fn kill_all_labeled(&self) -> Result<usize, SandboxError>;
}

/// Maps a human-facing runtime name to the value `bollard`/the Docker
/// daemon expects for `HostConfig.runtime` (spec §4.8.6).
pub fn resolve_runtime(name: &str) -> Result<String, SandboxError> {
    match name {
        "" | "docker" => Ok(String::new()),
        "gvisor" | "runsc" => Ok("runsc".to_string()),
        "kata" | "kata-runtime" => Ok("kata-runtime".to_string()),
        "firecracker" | "kata-fc" => Ok("kata-fc".to_string()),
        other => Err(SandboxError::UnknownRuntime(other.to_string())),
    }
}
