//! In-memory `ContainerRuntime` used by the orchestrator's own test suite
//! so the state machine (hardening assembly, timeout/cancel handling,
//! cleanup ordering) is exercised without a Docker daemon.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::io::AsyncRead;

use super::ContainerHandle;
use super::ContainerRuntime;
use super::LogStreams;
use super::SandboxConfig;
use super::SandboxError;
use super::SandboxResult;

/// One scripted container: the config it was created with, the output it
/// should replay, and the exit code `wait` should report.
#[derive(Debug, Clone)]
pub struct ScriptedContainer {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: i64,
}

impl Default for ScriptedContainer {
    fn default() -> Self {
        Self {
            stdout: Vec::new(),
            stderr: Vec::new(),
            exit_code: 0,
        }
    }
}

struct Created {
    config: SandboxConfig,
    container: ScriptedContainer,
    removed: bool,
}

/// A `ContainerRuntime` backed by a fixed script rather than a Docker
/// daemon. `next_result` is consumed (in FIFO order) by each `create` call;
/// once exhausted, `create` replays `ScriptedContainer::default()`.
pub struct FakeRuntime {
    scripted: Mutex<VecDeque<ScriptedContainer>>,
    created: Mutex<HashMap<String, Created>>,
    next_id: Mutex<u64>,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self {
            scripted: Mutex::new(VecDeque::new()),
            created: Mutex::new(HashMap::new()),
            next_id: Mutex::new(0),
        }
    }

    /// Queues the result the next `create` call should produce.
    pub fn push_result(&self, container: ScriptedContainer) {
        self.scripted.lock().unwrap().push_back(container);
    }

    /// Configs passed to every `create` call so far, in order — lets tests
    /// assert on the assembled hardening/env without a Docker daemon.
    pub fn created_configs(&self) -> Vec<SandboxConfig> {
        let created = self.created.lock().unwrap();
        let mut ids: Vec<&String> = created.keys().collect();
        ids.sort();
        ids.into_iter().map(|id| created[id].config.clone()).collect()
    }

    pub fn live_count(&self) -> usize {
        self.created.lock().unwrap().values().filter(|c| !c.removed).count()
    }
}

impl Default for FakeRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn create(&self, config: &SandboxConfig) -> Result<ContainerHandle, SandboxError> {
        let mut next_id = self.next_id.lock().unwrap();
        *next_id += 1;
        let id = format!("fake-{next_id}");
        drop(next_id);

        let container = self
            .scripted
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_default();

        self.created.lock().unwrap().insert(
            id.clone(),
            Created {
                config: config.clone(),
                container,
                removed: false,
            },
        );
        Ok(ContainerHandle { id })
    }

    async fn start(&self, handle: &ContainerHandle) -> Result<(), SandboxError> {
        if self.created.lock().unwrap().contains_key(&handle.id) {
            Ok(())
        } else {
            Err(SandboxError::Start(format!("unknown container {}", handle.id)))
        }
    }

    async fn logs(&self, handle: &ContainerHandle) -> Result<LogStreams, SandboxError> {
        let created = self.created.lock().unwrap();
        let entry = created
            .get(&handle.id)
            .ok_or_else(|| SandboxError::Docker(format!("unknown container {}", handle.id)))?;
        let stdout: std::pin::Pin<Box<dyn AsyncRead + Send>> =
            Box::pin(std::io::Cursor::new(entry.container.stdout.clone()));
        let stderr: std::pin::Pin<Box<dyn AsyncRead + Send>> =
            Box::pin(std::io::Cursor::new(entry.container.stderr.clone()));
        Ok(LogStreams { stdout, stderr })
    }

    async fn wait(&self, handle: &ContainerHandle) -> Result<SandboxResult, SandboxError> {
        let created = self.created.lock().unwrap();
        let entry = created
            .get(&handle.id)
            .ok_or_else(|| SandboxError::Wait(format!("unknown container {}", handle.id)))?;
        Ok(SandboxResult {
            exit_code: entry.container.exit_code,
        })
    }

    async fn kill(&self, handle: &ContainerHandle) -> Result<(), SandboxError> {
        if self.created.lock().unwrap().contains_key(&handle.id) {
            Ok(())
        } else {
            Err(SandboxError::Docker(format!("unknown container {}", handle.id)))
        }
    }

    async fn remove(&self, handle: &ContainerHandle) -> Result<(), SandboxError> {
        if let Some(entry) = self.created.lock().unwrap().get_mut(&handle.id) {
            entry.removed = true;
        }
        Ok(())
    }

    async fn kill_all_labeled(&self) -> Result<usize, SandboxError> {
        let mut created = self.created.lock().unwrap();
        let mut removed = 0;
        for entry in created.values_mut() {
            if !entry.removed {
                entry.removed = true;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> SandboxConfig {
        SandboxConfig {
            skill_name: "echo-skill".to_string(),
            image: "alpine:latest".to_string(),
            command: vec!["echo".to_string(), "hi".to_string()],
            env: Vec::new(),
            work_dir: None,
            mounts: Vec::new(),
            network: false,
            allowed_domains: Vec::new(),
            runtime: String::new(),
            seccomp_path: None,
        }
    }

    #[tokio::test]
    async fn create_start_wait_remove_round_trip() {
        let runtime = FakeRuntime::new();
        runtime.push_result(ScriptedContainer {
            stdout: b"hi\n".to_vec(),
            stderr: Vec::new(),
            exit_code: 0,
        });
        let handle = runtime.create(&config()).await.unwrap();
        runtime.start(&handle).await.unwrap();
        assert_eq!(runtime.live_count(), 1);
        let result = runtime.wait(&handle).await.unwrap();
        assert_eq!(result.exit_code, 0);
        runtime.remove(&handle).await.unwrap();
        assert_eq!(runtime.live_count(), 0);
    }

    #[tokio::test]
    async fn kill_all_labeled_removes_every_live_container() {
        let runtime = FakeRuntime::new();
        let a = runtime.create(&config()).await.unwrap();
        let b = runtime.create(&config()).await.unwrap();
        runtime.start(&a).await.unwrap();
        runtime.start(&b).await.unwrap();
        assert_eq!(runtime.kill_all_labeled().await.unwrap(), 2);
        assert_eq!(runtime.live_count(), 0);
    }
}
