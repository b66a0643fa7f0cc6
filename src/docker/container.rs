use bollard::container::{
    DownloadFromContainerOptions, LogsOptions, StartContainerOptions, UploadToContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::models::{ContainerState, Mount, MountTypeEnum, PortBinding};
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::docker::provider::DockerProvider;
use crate::docker::wait::WaitStrategy;
use crate::error::{Error, Result};
use crate::event::{self, ContainerEventData, Event};

/// Parameters for a container the provider should create.
#[derive(Debug, Default)]
pub struct ContainerRequest {
    pub image: String,
    pub name: String,
    pub entrypoint: Option<Vec<String>>,
    pub cmd: Vec<String>,
    pub env: HashMap<String, String>,
    /// Container ports ("80" or "80/tcp") published on a random host port.
    pub exposed_ports: Vec<String>,
    pub labels: HashMap<String, String>,
    pub mounts: Vec<ContainerMount>,
    pub waiting_for: Option<WaitStrategy>,
    pub hostname: Option<String>,
    pub privileged: bool,
    pub networks: Vec<String>,
    pub network_aliases: HashMap<String, Vec<String>>,
    /// e.g. `container:<pauseId>`; mutually exclusive with `networks`.
    pub network_mode: Option<String>,
    pub dns: Vec<String>,
    pub cap_add: Vec<String>,
    pub cap_drop: Vec<String>,
    pub user: Option<String>,
    pub working_dir: Option<String>,
    pub auto_remove: bool,
    pub always_pull_image: bool,
    /// Pin the image platform as `os/arch[/variant]`. A locally cached image
    /// of a different os/architecture is re-pulled.
    pub platform: Option<String>,
}

impl ContainerRequest {
    pub fn validate(&self) -> Result<()> {
        if self.image.is_empty() {
            return Err(Error::Validation("you must specify an image".to_string()));
        }
        let mut targets = HashMap::new();
        for mount in &self.mounts {
            let target = mount.target();
            if targets.insert(target.to_string(), true).is_some() {
                return Err(Error::Validation(format!(
                    "duplicate mount target detected: {target}"
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub enum ContainerMount {
    Bind {
        source: String,
        target: String,
        read_only: bool,
    },
    Volume {
        name: String,
        target: String,
    },
}

impl ContainerMount {
    pub fn bind(source: impl Into<String>, target: impl Into<String>) -> Self {
        ContainerMount::Bind {
            source: source.into(),
            target: target.into(),
            read_only: false,
        }
    }

    pub fn bind_ro(source: impl Into<String>, target: impl Into<String>) -> Self {
        ContainerMount::Bind {
            source: source.into(),
            target: target.into(),
            read_only: true,
        }
    }

    pub fn volume(name: impl Into<String>, target: impl Into<String>) -> Self {
        ContainerMount::Volume {
            name: name.into(),
            target: target.into(),
        }
    }

    pub fn target(&self) -> &str {
        match self {
            ContainerMount::Bind { target, .. } => target,
            ContainerMount::Volume { target, .. } => target,
        }
    }

    pub(super) fn to_docker_mount(&self) -> Mount {
        match self {
            ContainerMount::Bind {
                source,
                target,
                read_only,
            } => Mount {
                source: Some(source.clone()),
                target: Some(target.clone()),
                typ: Some(MountTypeEnum::BIND),
                read_only: Some(*read_only),
                ..Default::default()
            },
            ContainerMount::Volume { name, target } => Mount {
                source: Some(name.clone()),
                target: Some(target.clone()),
                typ: Some(MountTypeEnum::VOLUME),
                ..Default::default()
            },
        }
    }
}

/// A created container plus enough metadata to wait on it and to tag the
/// events it emits.
pub struct ContainerHandle {
    pub id: String,
    pub image: String,
    pub name: String,
    session_id: String,
    pod_name: String,
    container_name: String,
    waiting_for: Option<WaitStrategy>,
    provider: Arc<DockerProvider>,
}

impl ContainerHandle {
    pub(super) fn new(
        id: String,
        req: &ContainerRequest,
        session_id: &str,
        waiting_for: Option<WaitStrategy>,
        provider: Arc<DockerProvider>,
    ) -> Self {
        ContainerHandle {
            id,
            image: req.image.clone(),
            name: req.name.clone(),
            session_id: session_id.to_string(),
            pod_name: req
                .labels
                .get(super::LABEL_POD_NAME)
                .cloned()
                .unwrap_or_default(),
            container_name: req
                .labels
                .get(super::LABEL_CONTAINER_NAME)
                .cloned()
                .unwrap_or_default(),
            waiting_for,
            provider,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    fn event_data(&self, event_type: &str) -> ContainerEventData {
        ContainerEventData {
            name: self.name.clone(),
            image: self.image.clone(),
            id: self.id.clone(),
            r#type: event_type.to_string(),
            event_time: None,
            state: None,
            container_name: self.container_name.clone(),
            pod_name: self.pod_name.clone(),
        }
    }

    /// Start the container and, when a readiness strategy is attached, block
    /// until it reports success, the container dies, or the deadline passes.
    pub async fn start(&self) -> Result<()> {
        self.provider
            .bus()
            .publish(Event::Container(self.event_data(event::CONTAINER_EVENT_START)));
        let short_id = &self.id[..12.min(self.id.len())];
        debug!("starting container id: {} image: {}", short_id, self.image);

        self.provider
            .docker()
            .start_container(&self.id, None::<StartContainerOptions<String>>)
            .await?;

        if let Some(strategy) = &self.waiting_for {
            debug!("waiting for container id: {} image: {}", short_id, self.image);
            strategy.wait_until_ready(self).await?;
        }

        match self.state().await {
            Ok(state) if state.running == Some(true) => {
                debug!("container is ready id: {} image: {}", short_id, self.image);
                self.provider
                    .bus()
                    .publish(Event::Container(self.event_data(event::CONTAINER_EVENT_READY)));
            }
            _ => {
                debug!("container is gone id: {} image: {}", short_id, self.image);
                self.provider
                    .bus()
                    .publish(Event::Container(self.event_data(event::CONTAINER_EVENT_REMOVE)));
            }
        }
        Ok(())
    }

    pub async fn state(&self) -> Result<ContainerState> {
        let inspect = self.provider.inspect(&self.id).await?;
        inspect
            .state
            .ok_or_else(|| Error::Other(anyhow::anyhow!("container {} has no state", self.id)))
    }

    /// Host where mapped ports of this container are exposed.
    pub async fn host(&self) -> Result<String> {
        self.provider.daemon_host().await
    }

    /// Externally mapped host port for a container port, if one is bound yet.
    pub async fn mapped_port(&self, port: u16) -> Result<Option<u16>> {
        let inspect = self.provider.inspect(&self.id).await?;
        if let Some(host_config) = &inspect.host_config {
            if host_config.network_mode.as_deref() == Some("host") {
                return Ok(Some(port));
            }
        }
        let key = format!("{port}/tcp");
        let bindings = inspect
            .network_settings
            .and_then(|s| s.ports)
            .and_then(|mut ports| ports.remove(&key))
            .flatten()
            .unwrap_or_default();
        Ok(first_host_port(&bindings))
    }

    /// All host-port bindings, keyed by container port spec ("8080/tcp").
    pub async fn ports(&self) -> Result<HashMap<String, Option<u16>>> {
        let inspect = self.provider.inspect(&self.id).await?;
        let mut result = HashMap::new();
        if let Some(ports) = inspect.network_settings.and_then(|s| s.ports) {
            for (port, bindings) in ports {
                result.insert(port, first_host_port(&bindings.unwrap_or_default()));
            }
        }
        Ok(result)
    }

    pub async fn logs(&self, tail: Option<usize>) -> Result<String> {
        self.provider.logs(&self.id, tail).await
    }

    /// Run a command in the container and return its exit code and combined
    /// output.
    pub async fn exec(&self, cmd: Vec<String>) -> Result<(i64, String)> {
        let docker = self.provider.docker();
        let exec = docker
            .create_exec(
                &self.id,
                CreateExecOptions {
                    cmd: Some(cmd),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await?;

        let mut output = String::new();
        if let StartExecResults::Attached { output: mut stream, .. } =
            docker.start_exec(&exec.id, None).await?
        {
            while let Some(msg) = stream.next().await {
                match msg {
                    Ok(msg) => output.push_str(&msg.to_string()),
                    Err(e) => warn!("error reading exec output: {e}"),
                }
            }
        }

        loop {
            let inspect = docker.inspect_exec(&exec.id).await?;
            if inspect.running != Some(true) {
                return Ok((inspect.exit_code.unwrap_or(0), output));
            }
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        }
    }

    /// Copy one file into the container at `container_path`.
    pub async fn copy_in(&self, content: &[u8], container_path: &str, mode: i64) -> Result<()> {
        let path = std::path::Path::new(container_path);
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| Error::Validation(format!("invalid container path {container_path}")))?;
        let dir = path
            .parent()
            .and_then(|p| p.to_str())
            .unwrap_or("/")
            .to_string();

        let mut archive = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(mode as u32);
        header.set_cksum();
        archive
            .append_data(&mut header, file_name, content)
            .map_err(Error::Io)?;
        let body = archive.into_inner().map_err(Error::Io)?;

        self.provider
            .docker()
            .upload_to_container(
                &self.id,
                Some(UploadToContainerOptions {
                    path: dir,
                    ..Default::default()
                }),
                body.into(),
            )
            .await?;
        Ok(())
    }

    /// Copy one file out of the container.
    pub async fn copy_out(&self, container_path: &str) -> Result<Vec<u8>> {
        let mut stream = self.provider.docker().download_from_container(
            &self.id,
            Some(DownloadFromContainerOptions {
                path: container_path.to_string(),
            }),
        );
        let mut raw = Vec::new();
        while let Some(chunk) = stream.next().await {
            raw.extend_from_slice(&chunk?);
        }
        let mut archive = tar::Archive::new(raw.as_slice());
        let mut entries = archive.entries().map_err(Error::Io)?;
        if let Some(entry) = entries.next() {
            let mut content = Vec::new();
            std::io::Read::read_to_end(&mut entry.map_err(Error::Io)?, &mut content)
                .map_err(Error::Io)?;
            return Ok(content);
        }
        Err(Error::Other(anyhow::anyhow!(
            "no file at {container_path} in container {}",
            self.id
        )))
    }

    /// Follow the container's log stream, printing each line with a prefix.
    pub fn follow_output(&self, prefix: String) {
        let docker = self.provider.docker().clone();
        let id = self.id.clone();
        tokio::spawn(async move {
            let options = LogsOptions::<String> {
                stdout: true,
                stderr: true,
                follow: true,
                ..Default::default()
            };
            let mut stream = docker.logs(&id, Some(options));
            while let Some(msg) = stream.next().await {
                match msg {
                    Ok(log) => print!("{} | {}", prefix.trim_start_matches('/'), log),
                    Err(_) => break,
                }
            }
        });
    }
}

fn first_host_port(bindings: &[PortBinding]) -> Option<u16> {
    bindings
        .iter()
        .filter_map(|b| b.host_port.as_deref())
        .find_map(|p| p.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_rejects_empty_image() {
        let req = ContainerRequest::default();
        assert!(req.validate().is_err());
    }

    #[test]
    fn validate_rejects_duplicate_mount_targets() {
        let req = ContainerRequest {
            image: "busybox".into(),
            mounts: vec![
                ContainerMount::volume("a", "/data"),
                ContainerMount::bind("/tmp/b", "/data"),
            ],
            ..Default::default()
        };
        let err = req.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate mount target"));
    }

    #[test]
    fn first_host_port_skips_unparseable_bindings() {
        let bindings = vec![
            PortBinding {
                host_ip: Some("0.0.0.0".into()),
                host_port: Some("".into()),
            },
            PortBinding {
                host_ip: Some("0.0.0.0".into()),
                host_port: Some("49153".into()),
            },
        ];
        assert_eq!(first_host_port(&bindings), Some(49153));
    }
}
