use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, LogsOptions, NetworkingConfig,
    RemoveContainerOptions, StopContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::{
    ContainerInspectResponse, ContainerSummary, EndpointSettings, HostConfig, ImageInspect,
    Network, PortBinding, Volume,
};
use bollard::network::{
    ConnectNetworkOptions, CreateNetworkOptions, InspectNetworkOptions, ListNetworksOptions,
};
use bollard::volume::{CreateVolumeOptions, ListVolumesOptions, RemoveVolumeOptions};
use bollard::Docker;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::docker::container::{ContainerHandle, ContainerRequest};
use crate::docker::{
    in_a_container, AGENT_TYPE_CLEANER, BRIDGE, DEFAULT_NETWORK, LABEL_AGENT_TYPE,
    LABEL_CONTAINER_NAME, LABEL_POD_MANAGED, LABEL_POD_NAME, LABEL_SESSION, LABEL_VOLUME_GROUP,
};
use crate::error::{Error, Result};
use crate::event::{self, ContainerEventData, Event, EventBus};

const PULL_BACKOFF_INITIAL: Duration = Duration::from_millis(500);
const PULL_BACKOFF_MAX: Duration = Duration::from_secs(30);
const PULL_MAX_ELAPSED: Duration = Duration::from_secs(15 * 60);

pub struct DockerProvider {
    docker: Docker,
    bus: Arc<EventBus>,
    default_network: String,
    host_cache: Mutex<Option<String>>,
}

impl DockerProvider {
    /// Connect to the daemon, verify it answers, and make sure a default
    /// bridge network exists.
    pub async fn new(bus: Arc<EventBus>) -> Result<Arc<Self>> {
        let docker = Docker::connect_with_socket_defaults()?;
        docker
            .ping()
            .await
            .map_err(|e| Error::EngineUnavailable(e.to_string()))?;
        let default_network = ensure_default_network(&docker).await?;
        Ok(Arc::new(DockerProvider {
            docker,
            bus,
            default_network,
            host_cache: Mutex::new(None),
        }))
    }

    pub fn docker(&self) -> &Docker {
        &self.docker
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn default_network(&self) -> &str {
        &self.default_network
    }

    pub async fn health(&self) -> Result<()> {
        self.docker
            .ping()
            .await
            .map_err(|e| Error::EngineUnavailable(e.to_string()))?;
        Ok(())
    }

    /// Create a container without starting it, applying the universal labels
    /// and pulling the image when needed.
    pub async fn create_container(
        self: &Arc<Self>,
        mut req: ContainerRequest,
        session_id: &str,
    ) -> Result<ContainerHandle> {
        req.labels
            .insert(LABEL_POD_MANAGED.to_string(), "true".to_string());
        req.labels
            .insert(LABEL_SESSION.to_string(), session_id.to_string());
        req.validate()?;

        let platform = match req.platform.as_deref() {
            Some(spec) if !spec.is_empty() => Some(parse_platform(spec)?),
            _ => None,
        };
        let should_pull = if req.always_pull_image {
            true
        } else {
            match self.docker.inspect_image(&req.image).await {
                Ok(image) => platform_mismatch(&image, platform.as_ref()),
                Err(bollard::errors::Error::DockerResponseServerError {
                    status_code: 404, ..
                }) => true,
                Err(e) => return Err(e.into()),
            }
        };
        if should_pull {
            self.bus
                .publish(Event::Container(pull_event(&req, event::CONTAINER_EVENT_PULL_START)));
            if let Err(e) = self
                .attempt_to_pull_image(&req.image, req.platform.as_deref())
                .await
            {
                self.bus
                    .publish(Event::Container(pull_event(&req, event::CONTAINER_EVENT_PULL_FAIL)));
                return Err(e);
            }
            self.bus
                .publish(Event::Container(pull_event(&req, event::CONTAINER_EVENT_PULL_SUCCESS)));
        }

        let env: Vec<String> = req.env.iter().map(|(k, v)| format!("{k}={v}")).collect();
        let mut exposed_ports = HashMap::new();
        let mut port_bindings = HashMap::new();
        // Specs are "80", "80/tcp" or "host:container". An empty host port
        // asks the engine for a random one.
        for port in &req.exposed_ports {
            let (host_port, container_port) = match port.split_once(':') {
                Some((host, container)) => (host.to_string(), container.to_string()),
                None => (String::new(), port.clone()),
            };
            let key = if container_port.contains('/') {
                container_port
            } else {
                format!("{container_port}/tcp")
            };
            exposed_ports.insert(key.clone(), HashMap::new());
            port_bindings.insert(
                key,
                Some(vec![PortBinding {
                    host_ip: None,
                    host_port: Some(host_port),
                }]),
            );
        }

        let host_config = HostConfig {
            mounts: Some(req.mounts.iter().map(|m| m.to_docker_mount()).collect()),
            port_bindings: Some(port_bindings),
            auto_remove: Some(req.auto_remove),
            privileged: Some(req.privileged),
            network_mode: req.network_mode.clone(),
            dns: Some(req.dns.clone()),
            cap_add: Some(req.cap_add.clone()),
            cap_drop: Some(req.cap_drop.clone()),
            ..Default::default()
        };

        // The engine accepts a single network at create time; the rest are
        // attached afterwards.
        let mut endpoints_config = HashMap::new();
        if let Some(first) = req.networks.first() {
            if let Ok(network) = self.get_network(first).await {
                endpoints_config.insert(
                    first.clone(),
                    EndpointSettings {
                        aliases: req.network_aliases.get(first).cloned(),
                        network_id: network.id,
                        ..Default::default()
                    },
                );
            }
        }

        let config = Config {
            image: Some(req.image.clone()),
            env: Some(env),
            cmd: if req.cmd.is_empty() {
                None
            } else {
                Some(req.cmd.clone())
            },
            entrypoint: req.entrypoint.clone(),
            exposed_ports: Some(exposed_ports),
            labels: Some(req.labels.clone()),
            hostname: req.hostname.clone(),
            user: req.user.clone(),
            working_dir: req.working_dir.clone(),
            host_config: Some(host_config),
            networking_config: Some(NetworkingConfig { endpoints_config }),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: req.name.as_str(),
            platform: req.platform.as_deref(),
        };
        let response = self.docker.create_container(Some(options), config).await?;

        for network_name in req.networks.iter().skip(1) {
            let network = self.get_network(network_name).await?;
            self.docker
                .connect_network(
                    network.id.as_deref().unwrap_or(network_name),
                    ConnectNetworkOptions {
                        container: response.id.as_str(),
                        endpoint_config: EndpointSettings {
                            aliases: req.network_aliases.get(network_name).cloned(),
                            ..Default::default()
                        },
                    },
                )
                .await?;
        }

        let waiting_for = req.waiting_for.take();
        let handle = ContainerHandle::new(
            response.id,
            &req,
            session_id,
            waiting_for,
            Arc::clone(self),
        );
        self.bus.publish(Event::Container(ContainerEventData {
            name: req.name.clone(),
            image: req.image.clone(),
            id: handle.id.clone(),
            r#type: event::CONTAINER_EVENT_CREATED.to_string(),
            event_time: None,
            state: None,
            container_name: req
                .labels
                .get(LABEL_CONTAINER_NAME)
                .cloned()
                .unwrap_or_default(),
            pod_name: req.labels.get(LABEL_POD_NAME).cloned().unwrap_or_default(),
        }));
        Ok(handle)
    }

    /// Create and start a container in one go.
    pub async fn run_container(
        self: &Arc<Self>,
        req: ContainerRequest,
        session_id: &str,
    ) -> Result<ContainerHandle> {
        let handle = self.create_container(req, session_id).await?;
        handle.start().await?;
        Ok(handle)
    }

    /// Pull with exponential back-off. A not-found answer is terminal and
    /// never retried; cancellation arrives by dropping this future.
    async fn attempt_to_pull_image(&self, image: &str, platform: Option<&str>) -> Result<()> {
        let started = Instant::now();
        let mut delay = PULL_BACKOFF_INITIAL;
        loop {
            let options = CreateImageOptions {
                from_image: image,
                platform: platform.unwrap_or_default(),
                ..Default::default()
            };
            let mut stream = self.docker.create_image(Some(options), None, None);
            let mut pull_err = None;
            while let Some(progress) = stream.next().await {
                match progress {
                    Ok(info) => {
                        if let Some(status) = info.status {
                            debug!("pull status: {status}");
                        }
                    }
                    Err(e) => {
                        pull_err = Some(e);
                        break;
                    }
                }
            }
            match pull_err {
                None => return Ok(()),
                Some(bollard::errors::Error::DockerResponseServerError {
                    status_code: 404,
                    ..
                }) => return Err(Error::ImageNotFound(image.to_string())),
                Some(e) => {
                    if started.elapsed() > PULL_MAX_ELAPSED {
                        return Err(e.into());
                    }
                    warn!("failed to pull image {image}: {e}, will retry");
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(PULL_BACKOFF_MAX);
                }
            }
        }
    }

    pub async fn stop_container(&self, id: &str, grace: Option<i64>) -> Result<()> {
        let options = StopContainerOptions {
            t: grace.unwrap_or(10),
        };
        self.docker.stop_container(id, Some(options)).await?;
        Ok(())
    }

    /// Force-remove a container, emitting the remove event tagged with the
    /// pod labels it carried.
    pub async fn remove_container(&self, id: &str) -> Result<()> {
        debug!("remove container : {id}");
        if let Ok(inspect) = self.inspect(id).await {
            let labels = inspect
                .config
                .as_ref()
                .and_then(|c| c.labels.clone())
                .unwrap_or_default();
            self.bus.publish(Event::Container(ContainerEventData {
                name: inspect.name.clone().unwrap_or_default(),
                image: inspect.image.clone().unwrap_or_default(),
                id: id.to_string(),
                r#type: event::CONTAINER_EVENT_REMOVE.to_string(),
                event_time: None,
                state: None,
                container_name: labels.get(LABEL_CONTAINER_NAME).cloned().unwrap_or_default(),
                pod_name: labels.get(LABEL_POD_NAME).cloned().unwrap_or_default(),
            }));
        }
        self.docker
            .remove_container(
                id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await?;
        Ok(())
    }

    pub async fn inspect(&self, id: &str) -> Result<ContainerInspectResponse> {
        Ok(self.docker.inspect_container(id, None).await?)
    }

    pub async fn logs(&self, id: &str, tail: Option<usize>) -> Result<String> {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            tail: tail.map(|t| t.to_string()).unwrap_or_else(|| "all".to_string()),
            ..Default::default()
        };
        let mut stream = self.docker.logs(id, Some(options));
        let mut logs = String::new();
        while let Some(msg) = stream.next().await {
            match msg {
                Ok(msg) => logs.push_str(&msg.to_string()),
                Err(e) => warn!("error reading logs: {e}"),
            }
        }
        Ok(logs)
    }

    /// Create a session-scoped volume. The engine-level name is
    /// `<name>_<session>`.
    pub async fn create_volume(
        &self,
        name: &str,
        session_id: &str,
        volume_group: Option<&str>,
    ) -> Result<String> {
        let engine_name = format!("{name}_{session_id}");
        let mut labels = HashMap::new();
        labels.insert(LABEL_POD_MANAGED.to_string(), "true".to_string());
        labels.insert(LABEL_SESSION.to_string(), session_id.to_string());
        if let Some(group) = volume_group {
            labels.insert(LABEL_VOLUME_GROUP.to_string(), group.to_string());
        }
        self.docker
            .create_volume(CreateVolumeOptions {
                name: engine_name.clone(),
                driver: "local".to_string(),
                labels,
                ..Default::default()
            })
            .await?;
        Ok(engine_name)
    }

    pub async fn remove_volume(&self, name: &str, session_id: &str, force: bool) -> Result<()> {
        let engine_name = if name.ends_with(session_id) {
            name.to_string()
        } else {
            format!("{name}_{session_id}")
        };
        debug!("remove volume : {engine_name}");
        self.docker
            .remove_volume(&engine_name, Some(RemoveVolumeOptions { force }))
            .await?;
        Ok(())
    }

    pub async fn create_network(&self, name: &str, session_id: &str) -> Result<()> {
        let mut labels = HashMap::new();
        labels.insert(LABEL_POD_MANAGED.to_string(), "true".to_string());
        labels.insert(LABEL_SESSION.to_string(), session_id.to_string());
        self.docker
            .create_network(CreateNetworkOptions {
                name: name.to_string(),
                driver: BRIDGE.to_string(),
                check_duplicate: true,
                labels,
                ..Default::default()
            })
            .await?;
        Ok(())
    }

    pub async fn get_network(&self, name: &str) -> Result<Network> {
        Ok(self
            .docker
            .inspect_network(
                name,
                Some(InspectNetworkOptions::<String> {
                    verbose: true,
                    ..Default::default()
                }),
            )
            .await?)
    }

    pub async fn remove_network(&self, id: &str) -> Result<()> {
        debug!("remove network : {id}");
        self.docker.remove_network(id).await?;
        Ok(())
    }

    /// Gateway IP of the default network; used to reach mapped ports from
    /// inside a container when the daemon listens on a unix socket.
    pub async fn gateway_ip(&self) -> Result<String> {
        let network = self.get_network(&self.default_network).await?;
        let ip = network
            .ipam
            .and_then(|ipam| ipam.config)
            .unwrap_or_default()
            .into_iter()
            .find_map(|c| c.gateway.filter(|g| !g.is_empty()));
        ip.ok_or_else(|| {
            Error::Other(anyhow::anyhow!(
                "failed to get gateway IP from network settings"
            ))
        })
    }

    /// Host or IP where mapped container ports are reachable from this
    /// process.
    pub async fn daemon_host(&self) -> Result<String> {
        let mut cache = self.host_cache.lock().await;
        if let Some(host) = cache.as_ref() {
            return Ok(host.clone());
        }
        let host = match std::env::var("DOCKER_HOST") {
            Ok(docker_host) if !docker_host.is_empty() => parse_daemon_host(&docker_host),
            _ => None,
        };
        let host = match host {
            Some(host) => host,
            None if in_a_container() => match self.gateway_ip().await {
                Ok(ip) => ip,
                Err(_) => default_gateway_ip().unwrap_or_else(|| "localhost".to_string()),
            },
            None => "localhost".to_string(),
        };
        *cache = Some(host.clone());
        Ok(host)
    }

    pub async fn find_containers_by_session(
        &self,
        session_id: &str,
    ) -> Result<Vec<ContainerSummary>> {
        self.list_containers(Some(session_id), true).await
    }

    pub async fn find_all_pod_containers(&self) -> Result<Vec<ContainerSummary>> {
        self.list_containers(None, true).await
    }

    async fn list_containers(
        &self,
        session_id: Option<&str>,
        all: bool,
    ) -> Result<Vec<ContainerSummary>> {
        let mut label_filters = vec![format!("{LABEL_POD_MANAGED}=true")];
        if let Some(session_id) = session_id {
            label_filters.push(format!("{LABEL_SESSION}={session_id}"));
        }
        let mut filters = HashMap::new();
        filters.insert("label".to_string(), label_filters);
        Ok(self
            .docker
            .list_containers(Some(ListContainersOptions {
                all,
                filters,
                ..Default::default()
            }))
            .await?)
    }

    pub async fn find_container_by_name(&self, name: &str) -> Result<Option<ContainerSummary>> {
        let mut filters = HashMap::new();
        filters.insert("name".to_string(), vec![name.to_string()]);
        let list = self
            .docker
            .list_containers(Some(ListContainersOptions {
                all: true,
                filters,
                ..Default::default()
            }))
            .await?;
        Ok(list.into_iter().next())
    }

    pub async fn find_volumes_by_session(&self, session_id: &str) -> Result<Vec<Volume>> {
        self.list_volumes(Some(session_id)).await
    }

    pub async fn find_all_pod_volumes(&self) -> Result<Vec<Volume>> {
        self.list_volumes(None).await
    }

    async fn list_volumes(&self, session_id: Option<&str>) -> Result<Vec<Volume>> {
        let mut label_filters = vec![format!("{LABEL_POD_MANAGED}=true")];
        if let Some(session_id) = session_id {
            label_filters.push(format!("{LABEL_SESSION}={session_id}"));
        }
        let mut filters = HashMap::new();
        filters.insert("label".to_string(), label_filters);
        let response = self
            .docker
            .list_volumes(Some(ListVolumesOptions { filters }))
            .await?;
        Ok(response.volumes.unwrap_or_default())
    }

    pub async fn find_all_pod_networks(&self) -> Result<Vec<Network>> {
        let mut filters = HashMap::new();
        filters.insert(
            "label".to_string(),
            vec![format!("{LABEL_POD_MANAGED}=true")],
        );
        Ok(self
            .docker
            .list_networks(Some(ListNetworksOptions { filters }))
            .await?)
    }

    /// Remove every container, volume and network carrying the session label.
    /// A container labelled as the cleaner role is skipped: a cleaner must
    /// never remove itself.
    pub async fn clear_with_session(&self, session_id: &str) {
        if session_id.is_empty() {
            return;
        }
        info!("clearing session:{session_id}");
        if let Ok(containers) = self.find_containers_by_session(session_id).await {
            for container in containers {
                let labels = container.labels.clone().unwrap_or_default();
                if labels.get(LABEL_AGENT_TYPE).map(String::as_str) == Some(AGENT_TYPE_CLEANER) {
                    continue;
                }
                let id = container.id.unwrap_or_default();
                info!("remove container:{id}");
                if let Err(e) = self
                    .docker
                    .remove_container(
                        &id,
                        Some(RemoveContainerOptions {
                            force: true,
                            v: true,
                            ..Default::default()
                        }),
                    )
                    .await
                {
                    error!("{e}");
                }
            }
        }
        if let Ok(volumes) = self.find_volumes_by_session(session_id).await {
            for volume in volumes {
                info!("remove volume:{}", volume.name);
                if let Err(e) = self
                    .docker
                    .remove_volume(&volume.name, Some(RemoveVolumeOptions { force: true }))
                    .await
                {
                    error!("{e}");
                }
            }
        }
        if let Ok(networks) = self.find_all_pod_networks().await {
            for network in networks {
                let labels = network.labels.clone().unwrap_or_default();
                if labels.get(LABEL_SESSION).map(String::as_str) != Some(session_id) {
                    continue;
                }
                let id = network.id.unwrap_or_default();
                info!("remove network:{id}");
                if let Err(e) = self.docker.remove_network(&id).await {
                    error!("{e}");
                }
            }
        }
    }
}

/// Split an `os/arch[/variant]` platform spec into its os and architecture.
fn parse_platform(spec: &str) -> Result<(String, String)> {
    let mut parts = spec.split('/');
    match (parts.next(), parts.next()) {
        (Some(os), Some(arch)) if !os.is_empty() && !arch.is_empty() => {
            Ok((os.to_string(), arch.to_string()))
        }
        _ => Err(Error::Validation(format!(
            "invalid platform {spec}, want os/arch"
        ))),
    }
}

/// True when a platform is pinned and the cached image was built for a
/// different os or architecture.
fn platform_mismatch(image: &ImageInspect, platform: Option<&(String, String)>) -> bool {
    match platform {
        Some((os, arch)) => {
            image.os.as_deref() != Some(os.as_str())
                || image.architecture.as_deref() != Some(arch.as_str())
        }
        None => false,
    }
}

fn pull_event(req: &ContainerRequest, event_type: &str) -> ContainerEventData {
    ContainerEventData {
        name: req.name.clone(),
        image: req.image.clone(),
        id: String::new(),
        r#type: event_type.to_string(),
        event_time: None,
        state: None,
        container_name: req
            .labels
            .get(LABEL_CONTAINER_NAME)
            .cloned()
            .unwrap_or_default(),
        pod_name: req.labels.get(LABEL_POD_NAME).cloned().unwrap_or_default(),
    }
}

/// Pick the network used for host resolution and agent attachment: the
/// engine's bridge network when it exists, otherwise a dedicated attachable
/// bridge we create once. Leftover empty session networks are swept here.
async fn ensure_default_network(docker: &Docker) -> Result<String> {
    let networks = docker
        .list_networks(None::<ListNetworksOptions<String>>)
        .await?;

    for network in &networks {
        let empty = network
            .containers
            .as_ref()
            .map(|c| c.is_empty())
            .unwrap_or(true);
        let managed = network
            .labels
            .as_ref()
            .and_then(|l| l.get(LABEL_POD_MANAGED))
            .map(String::as_str)
            == Some("true");
        if empty && managed {
            if let Some(id) = &network.id {
                let _ = docker.remove_network(id).await;
            }
        }
    }

    let mut default_exists = false;
    for network in &networks {
        match network.name.as_deref() {
            Some(name) if name == BRIDGE => return Ok(BRIDGE.to_string()),
            Some(name) if name == DEFAULT_NETWORK => default_exists = true,
            _ => {}
        }
    }
    if !default_exists {
        docker
            .create_network(CreateNetworkOptions {
                name: DEFAULT_NETWORK.to_string(),
                driver: BRIDGE.to_string(),
                attachable: true,
                ..Default::default()
            })
            .await?;
    }
    Ok(DEFAULT_NETWORK.to_string())
}

fn parse_daemon_host(docker_host: &str) -> Option<String> {
    let (scheme, rest) = docker_host.split_once("://")?;
    match scheme {
        "tcp" | "http" | "https" => {
            let authority = rest.split('/').next().unwrap_or(rest);
            let host = authority.rsplit_once(':').map(|(h, _)| h).unwrap_or(authority);
            Some(host.to_string())
        }
        _ => None,
    }
}

fn default_gateway_ip() -> Option<String> {
    let output = std::process::Command::new("sh")
        .arg("-c")
        .arg("ip route|awk '/default/ { print $3 }'")
        .output()
        .ok()?;
    let ip = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if ip.is_empty() {
        None
    } else {
        Some(ip)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn platform_specs_parse_and_reject_garbage() {
        assert_eq!(
            parse_platform("linux/amd64").unwrap(),
            ("linux".to_string(), "amd64".to_string())
        );
        assert_eq!(
            parse_platform("linux/arm64/v8").unwrap(),
            ("linux".to_string(), "arm64".to_string())
        );
        assert!(parse_platform("linux").is_err());
        assert!(parse_platform("/amd64").is_err());
    }

    #[test]
    fn pinned_platform_forces_a_pull_on_arch_mismatch() {
        let image = ImageInspect {
            os: Some("linux".to_string()),
            architecture: Some("amd64".to_string()),
            ..Default::default()
        };
        let pinned = ("linux".to_string(), "arm64".to_string());
        assert!(platform_mismatch(&image, Some(&pinned)));
        let matching = ("linux".to_string(), "amd64".to_string());
        assert!(!platform_mismatch(&image, Some(&matching)));
        assert!(!platform_mismatch(&image, None));
    }

    #[test]
    fn daemon_host_parses_tcp_urls() {
        assert_eq!(
            parse_daemon_host("tcp://192.168.59.103:2376"),
            Some("192.168.59.103".to_string())
        );
        assert_eq!(
            parse_daemon_host("https://docker.example.com:2376/v1.41"),
            Some("docker.example.com".to_string())
        );
        assert_eq!(parse_daemon_host("unix:///var/run/docker.sock"), None);
        assert_eq!(parse_daemon_host("not a url"), None);
    }
}
