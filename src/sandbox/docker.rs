//! Docker-backed sandboxes via bollard.
//!
//! Each session is one container kept alive by `sleep infinity`. Files are uploaded as
//! tar archives, commands run through `exec`, and the server port is published on an
//! ephemeral host port. Lifetime is enforced by a spawned expiry task that force-removes
//! the container; `sweep_expired` catches containers left behind by a dead process.

use async_trait::async_trait;
use bollard::{
    container::{
        Config, CreateContainerOptions, ListContainersOptions, LogOutput, RemoveContainerOptions,
        StartContainerOptions, UploadToContainerOptions,
    },
    exec::{CreateExecOptions, StartExecOptions, StartExecResults},
    image::CreateImageOptions,
    models::{HostConfig, PortBinding},
    Docker,
};
use futures_util::StreamExt;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use super::{CommandOutput, SandboxProvider, SandboxSession};
use crate::constants::{SANDBOX_CREATED_LABEL, SANDBOX_LABEL};
use crate::types::{Result, SitesmithError};

const IMAGE_PULL_TIMEOUT: Duration = Duration::from_secs(600);

#[derive(Debug, Clone)]
pub struct DockerSandboxConfig {
    pub port: u16,
    pub site_root: String,
    /// Hostname clients use to reach published ports.
    pub preview_host: String,
}

pub struct DockerSandboxProvider {
    client: Docker,
    config: DockerSandboxConfig,
}

impl DockerSandboxProvider {
    pub fn connect(config: DockerSandboxConfig) -> Result<Self> {
        let client = Docker::connect_with_local_defaults()
            .map_err(|e| SitesmithError::SandboxProvision(format!("docker unavailable: {}", e)))?;
        Ok(Self::with_client(client, config))
    }

    pub fn with_client(client: Docker, config: DockerSandboxConfig) -> Self {
        Self { client, config }
    }

    fn container_config(&self, image: &str) -> Config<String> {
        let container_port = format!("{}/tcp", self.config.port);

        let mut labels = HashMap::new();
        labels.insert(SANDBOX_LABEL.to_string(), "true".to_string());
        labels.insert(
            SANDBOX_CREATED_LABEL.to_string(),
            chrono::Utc::now().to_rfc3339(),
        );

        let mut exposed_ports = HashMap::new();
        exposed_ports.insert(container_port.clone(), HashMap::new());

        // Empty host port lets the daemon pick an ephemeral one
        let mut port_bindings = HashMap::new();
        port_bindings.insert(
            container_port,
            Some(vec![PortBinding {
                host_ip: Some("0.0.0.0".to_string()),
                host_port: Some(String::new()),
            }]),
        );

        Config {
            image: Some(image.to_string()),
            cmd: Some(vec!["sleep".to_string(), "infinity".to_string()]),
            labels: Some(labels),
            exposed_ports: Some(exposed_ports),
            host_config: Some(HostConfig {
                port_bindings: Some(port_bindings),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    async fn ensure_image(&self, image: &str) -> Result<()> {
        match self.client.inspect_image(image).await {
            Ok(_) => return Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => {}
            Err(e) => return Err(SitesmithError::SandboxProvision(e.to_string()).into()),
        }

        tracing::info!("[SANDBOX] Pulling image {}", image);
        let options = CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        };
        let mut stream = self.client.create_image(Some(options), None, None);
        let pulled = tokio::time::timeout(IMAGE_PULL_TIMEOUT, async {
            while let Some(item) = stream.next().await {
                match item {
                    Ok(info) => {
                        if let Some(error) = info.error {
                            return Err(error);
                        }
                    }
                    Err(e) => return Err(e.to_string()),
                }
            }
            Ok(())
        })
        .await;

        match pulled {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(SitesmithError::SandboxProvision(format!(
                "failed to pull {}: {}",
                image, e
            ))
            .into()),
            Err(_) => Err(SitesmithError::SandboxProvision(format!(
                "timed out pulling {} after {:?}",
                image, IMAGE_PULL_TIMEOUT
            ))
            .into()),
        }
    }
}

#[async_trait]
impl SandboxProvider for DockerSandboxProvider {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn create(&self, template: &str) -> Result<Box<dyn SandboxSession>> {
        self.ensure_image(template).await?;

        let name = format!("sitesmith-{}", uuid::Uuid::new_v4().simple());
        let options = CreateContainerOptions {
            name: name.clone(),
            platform: None,
        };
        let container = self
            .client
            .create_container(Some(options), self.container_config(template))
            .await
            .map_err(|e| SitesmithError::SandboxProvision(e.to_string()))?;

        if let Err(e) = self
            .client
            .start_container(&container.id, None::<StartContainerOptions<String>>)
            .await
        {
            let _ = remove(&self.client, &container.id).await;
            return Err(SitesmithError::SandboxProvision(e.to_string()).into());
        }

        tracing::debug!("[SANDBOX] Started container {} ({})", name, container.id);

        Ok(Box::new(DockerSandboxSession {
            client: self.client.clone(),
            id: container.id,
            site_root: self.config.site_root.clone(),
            preview_host: self.config.preview_host.clone(),
            expiry: Mutex::new(None),
        }))
    }

    async fn sweep_expired(&self, max_age: Duration) -> Result<usize> {
        let mut filters = HashMap::new();
        filters.insert("label".to_string(), vec![format!("{}=true", SANDBOX_LABEL)]);
        let options = ListContainersOptions {
            all: true,
            filters,
            ..Default::default()
        };

        let containers = self
            .client
            .list_containers(Some(options))
            .await
            .map_err(|e| SitesmithError::internal(format!("listing sandboxes failed: {}", e)))?;

        let cutoff = chrono::Utc::now().timestamp() - max_age.as_secs() as i64;
        let mut removed = 0;
        for container in containers {
            let (Some(id), Some(created)) = (container.id, container.created) else {
                continue;
            };
            if created >= cutoff {
                continue;
            }
            match remove(&self.client, &id).await {
                Ok(()) => removed += 1,
                Err(e) => tracing::warn!("[SANDBOX] Sweep could not remove {}: {}", id, e),
            }
        }

        if removed > 0 {
            tracing::info!("[SANDBOX] Swept {} expired sandboxes", removed);
        }
        Ok(removed)
    }
}

pub struct DockerSandboxSession {
    client: Docker,
    id: String,
    site_root: String,
    preview_host: String,
    expiry: Mutex<Option<JoinHandle<()>>>,
}

impl DockerSandboxSession {
    fn archive_path(&self, path: &str) -> String {
        format!("{}/{}", self.site_root.trim_matches('/'), path)
    }
}

#[async_trait]
impl SandboxSession for DockerSandboxSession {
    fn id(&self) -> &str {
        &self.id
    }

    async fn set_timeout(&self, timeout: Duration) -> Result<()> {
        let client = self.client.clone();
        let id = self.id.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            tracing::info!("[SANDBOX] {} reached its timeout; removing", id);
            if let Err(e) = remove(&client, &id).await {
                tracing::warn!("[SANDBOX] Expiry removal of {} failed: {}", id, e);
            }
        });

        let mut slot = self.expiry.lock().await;
        if let Some(previous) = slot.replace(task) {
            previous.abort();
        }
        Ok(())
    }

    async fn write_file(&self, path: &str, content: &str) -> Result<()> {
        let archive = tar_single_file(&self.archive_path(path), content.as_bytes())?;
        let options = UploadToContainerOptions {
            path: "/".to_string(),
            ..Default::default()
        };
        self.client
            .upload_to_container(&self.id, Some(options), archive.into())
            .await
            .map_err(|e| SitesmithError::FileWrite {
                path: path.to_string(),
                message: e.to_string(),
            })?;
        Ok(())
    }

    async fn run_command(&self, command: &str, background: bool) -> Result<CommandOutput> {
        let exec = self
            .client
            .create_exec(
                &self.id,
                CreateExecOptions {
                    cmd: Some(vec!["sh".to_string(), "-c".to_string(), command.to_string()]),
                    attach_stdout: Some(!background),
                    attach_stderr: Some(!background),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| SitesmithError::internal(format!("exec create failed: {}", e)))?;

        let start_options = StartExecOptions {
            detach: background,
            ..Default::default()
        };
        let started = self
            .client
            .start_exec(&exec.id, Some(start_options))
            .await
            .map_err(|e| SitesmithError::internal(format!("exec start failed: {}", e)))?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        match started {
            StartExecResults::Attached { mut output, .. } => {
                while let Some(msg) = output.next().await {
                    match msg {
                        Ok(LogOutput::StdOut { message }) => stdout.extend_from_slice(&message),
                        Ok(LogOutput::StdErr { message }) => stderr.extend_from_slice(&message),
                        Ok(LogOutput::Console { message }) => stdout.extend_from_slice(&message),
                        _ => {}
                    }
                }
            }
            StartExecResults::Detached => {
                return Ok(CommandOutput::default());
            }
        }

        let inspect = self
            .client
            .inspect_exec(&exec.id)
            .await
            .map_err(|e| SitesmithError::internal(format!("exec inspect failed: {}", e)))?;

        Ok(CommandOutput {
            exit_code: inspect.exit_code.unwrap_or(-1),
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
        })
    }

    async fn host(&self, port: u16) -> Result<String> {
        let inspect = self
            .client
            .inspect_container(&self.id, None)
            .await
            .map_err(|e| SitesmithError::internal(format!("inspect failed: {}", e)))?;

        let key = format!("{}/tcp", port);
        let host_port = inspect
            .network_settings
            .and_then(|ns| ns.ports)
            .and_then(|ports| ports.get(&key).cloned().flatten())
            .and_then(|bindings| bindings.into_iter().find_map(|b| b.host_port))
            .filter(|p| !p.is_empty());

        match host_port {
            Some(p) => Ok(format!("{}:{}", self.preview_host, p)),
            None => Err(SitesmithError::internal(format!("port {} is not published", port)).into()),
        }
    }

    async fn kill(&self) -> Result<()> {
        if let Some(task) = self.expiry.lock().await.take() {
            task.abort();
        }
        remove(&self.client, &self.id).await
    }
}

async fn remove(client: &Docker, id: &str) -> Result<()> {
    let options = RemoveContainerOptions {
        force: true,
        v: true,
        ..Default::default()
    };
    match client.remove_container(id, Some(options)).await {
        Ok(()) => Ok(()),
        Err(bollard::errors::Error::DockerResponseServerError {
            status_code: 404, ..
        }) => Ok(()),
        Err(e) => Err(SitesmithError::internal(format!("remove of {} failed: {}", id, e)).into()),
    }
}

fn tar_single_file(path: &str, data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    let mut header = tar::Header::new_gnu();
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_mtime(chrono::Utc::now().timestamp().max(0) as u64);
    header.set_cksum();
    builder.append_data(&mut header, path, data)?;
    builder.into_inner()
}
