//! `ContainerRuntime` implementation over the Docker Engine API via
//! `bollard`, with the mandatory hardening from spec §4.8 baked into every
//! container's `HostConfig`.

use std::collections::HashMap;
use std::pin::Pin;

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::Config as ContainerConfig;
use bollard::container::CreateContainerOptions;
use bollard::container::KillContainerOptions;
use bollard::container::LogsOptions;
use bollard::container::RemoveContainerOptions;
use bollard::container::WaitContainerOptions;
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use bollard::models::Mount as DockerMount;
use bollard::models::MountTypeEnum;
use bollard::query_parameters::ListContainersOptionsBuilder;
use futures_util::StreamExt;
use tokio::io::AsyncRead;
use tokio_util::io::StreamReader;

use super::ContainerHandle;
use super::ContainerRuntime;
use super::LogStreams;
use super::MANAGED_BY_LABEL;
use super::MANAGED_BY_VALUE;
use super::MEMORY_LIMIT_BYTES;
use super::NANO_CPUS;
use super::PIDS_LIMIT;
use super::SKILL_LABEL;
use super::SWAP_LIMIT_BYTES;
use super::SandboxConfig;
use super::SandboxError;
use super::SandboxResult;
use super::resolve_runtime;

pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Connects using the platform-default local Docker socket.
    pub fn connect() -> Result<Self, SandboxError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| SandboxError::Docker(e.to_string()))?;
        Ok(Self { docker })
    }

    async fn ensure_image(&self, image: &str) -> Result<(), SandboxError> {
        if self.docker.inspect_image(image).await.is_ok() {
            return Ok(());
        }
        let options = CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        };
        let mut stream = self.docker.create_image(Some(options), None, None);
        while let Some(event) = stream.next().await {
            event.map_err(|e| SandboxError::ImagePull(image.to_string(), e.to_string()))?;
        }
        Ok(())
    }

    fn host_config(config: &SandboxConfig) -> Result<HostConfig, SandboxError> {
        let mut mounts = Vec::new();
        for mount in &config.mounts {
            mounts.push(DockerMount {
                target: Some(mount.dst.display().to_string()),
                source: Some(mount.src.display().to_string()),
                typ: Some(MountTypeEnum::BIND),
                read_only: Some(mount.ro),
                ..Default::default()
            });
        }
        mounts.push(DockerMount {
            target: Some("/tmp".to_string()),
            typ: Some(MountTypeEnum::TMPFS),
            ..Default::default()
        });
        // `HostConfig::binds` is left unset; mounts are expressed entirely
        // through the `mounts` field above.

        let mut security_opt = vec!["no-new-privileges".to_string()];
        if let Some(seccomp_path) = &config.seccomp_path {
            let profile = std::fs::read_to_string(seccomp_path)?;
            security_opt.push(format!("seccomp={profile}"));
        }

        let network_mode = if config.network {
            None
        } else {
            Some("none".to_string())
        };

        let extra_hosts = if config.network {
            Some(vec!["host.docker.internal:host-gateway".to_string()])
        } else {
            None
        };

        Ok(HostConfig {
            cap_drop: Some(vec!["ALL".to_string()]),
            security_opt: Some(security_opt),
            readonly_rootfs: Some(true),
            memory: Some(MEMORY_LIMIT_BYTES),
            memory_swap: Some(MEMORY_LIMIT_BYTES + SWAP_LIMIT_BYTES),
            nano_cpus: Some(NANO_CPUS),
            pids_limit: Some(PIDS_LIMIT),
            extra_hosts,
            network_mode,
            mounts: Some(mounts),
            runtime: {
                let runtime = resolve_runtime(&config.runtime)?;
                (!runtime.is_empty()).then_some(runtime)
            },
            ..Default::default()
        })
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn create(&self, config: &SandboxConfig) -> Result<ContainerHandle, SandboxError> {
        self.ensure_image(&config.image).await?;

        let mut labels = HashMap::new();
        labels.insert(MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string());
        labels.insert(SKILL_LABEL.to_string(), config.skill_name.clone());

        let host_config = Self::host_config(config)?;

        let container_config = ContainerConfig {
            image: Some(config.image.clone()),
            cmd: Some(config.command.clone()),
            env: Some(config.env.clone()),
            working_dir: config.work_dir.clone(),
            user: Some(super::DEFAULT_IMAGE_USER.to_string()),
            tty: Some(false),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            labels: Some(labels),
            host_config: Some(host_config),
            ..Default::default()
        };

        let name = format!("aegisclaw-{}", uuid::Uuid::new_v4());
        let options = CreateContainerOptions {
            name: Some(name),
            platform: None,
        };
        let response = self
            .docker
            .create_container(Some(options), container_config)
            .await
            .map_err(|e| SandboxError::Create(e.to_string()))?;

        Ok(ContainerHandle { id: response.id })
    }

    async fn start(&self, handle: &ContainerHandle) -> Result<(), SandboxError> {
        self.docker
            .start_container::<String>(&handle.id, None)
            .await
            .map_err(|e| SandboxError::Start(e.to_string()))
    }

    async fn logs(&self, handle: &ContainerHandle) -> Result<LogStreams, SandboxError> {
        let stdout_opts = LogsOptions::<String> {
            follow: true,
            stdout: true,
            stderr: false,
            ..Default::default()
        };
        let stderr_opts = LogsOptions::<String> {
            follow: true,
            stdout: false,
            stderr: true,
            ..Default::default()
        };

        let stdout_stream = self.docker.logs(&handle.id, Some(stdout_opts));
        let stderr_stream = self.docker.logs(&handle.id, Some(stderr_opts));

        let stdout = stream_to_reader(stdout_stream);
        let stderr = stream_to_reader(stderr_stream);

        Ok(LogStreams { stdout, stderr })
    }

    async fn wait(&self, handle: &ContainerHandle) -> Result<SandboxResult, SandboxError> {
        let mut stream = self
            .docker
            .wait_container(&handle.id, None::<WaitContainerOptions<String>>);
        match stream.next().await {
            Some(Ok(response)) => Ok(SandboxResult {
                exit_code: response.status_code,
            }),
            Some(Err(e)) => Err(SandboxError::Wait(e.to_string())),
            None => Err(SandboxError::Wait("wait stream ended with no response".to_string())),
        }
    }

    async fn kill(&self, handle: &ContainerHandle) -> Result<(), SandboxError> {
        let options = KillContainerOptions { signal: "SIGKILL" };
        self.docker
            .kill_container(&handle.id, Some(options))
            .await
            .map_err(|e| SandboxError::Docker(e.to_string()))
    }

    async fn remove(&self, handle: &ContainerHandle) -> Result<(), SandboxError> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        // Best-effort: removal runs with a fresh, non-cancelled context in
        // spirit by not propagating a caller-supplied cancellation token.
        self.docker
            .remove_container(&handle.id, Some(options))
            .await
            .map_err(|e| SandboxError::Docker(e.to_string()))
    }

    async fn kill_all_labeled(&self) -> Result<usize, SandboxError> {
        let mut filters = HashMap::new();
        filters.insert(
            "label".to_string(),
            vec![format!("{MANAGED_BY_LABEL}={MANAGED_BY_VALUE}")],
        );
        let options = ListContainersOptionsBuilder::default()
            .all(true)
            .filters(&filters)
            .build();
        let containers = self
            .docker
            .list_containers(Some(options))
            .await
            .map_err(|e| SandboxError::Docker(e.to_string()))?;

        let mut removed = 0;
        for container in containers {
            let Some(id) = container.id else { continue };
            let options = RemoveContainerOptions {
                force: true,
                ..Default::default()
            };
            if self.docker.remove_container(&id, Some(options)).await.is_ok() {
                removed += 1;
            }
        }
        Ok(removed)
    }
}

fn stream_to_reader(
    stream: impl futures_util::Stream<Item = Result<bollard::container::LogOutput, bollard::errors::Error>>
    + Send
    + 'static,
) -> Pin<Box<dyn AsyncRead + Send>> {
    let bytes_stream = stream.map(|item| {
        item.map(|output| output.into_bytes())
            .map_err(std::io::Error::other)
    });
    let reader = StreamReader::new(bytes_stream);
    Box::pin(reader)
}
