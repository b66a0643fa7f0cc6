//! Worker containers.
//!
//! Filesystem work (volume seeding, data swaps, cleanup, ingress config)
//! happens in short-lived containers of the agent image invoked with a
//! subcommand, because mount views differ between the host and the agent:
//! only a container can see the session volumes the way the engine does.

use serde::Deserialize;
use std::collections::HashMap;
use tracing::debug;

use crate::common::{
    AGENT_CONTEXT_PATH, AGENT_PORT, AGENT_VOLUME_PATH, EVENT_BUS_PORT, CONTAINER_NAME_PREFIX,
    ENV_DEBUG, ENV_HOST_CONTEXT_PATH, ENV_IMAGES, ENV_INSTANCE_NAME, ENV_SESSION_ID,
    EXIT_TIMEOUT_SECS, INGRESS_VOLUME_NAME,
};
use crate::compose::ComposeProvider;
use crate::config::{self, VolumeGroupConfig};
use crate::docker::wait::WaitStrategy;
use crate::docker::{
    ContainerHandle, ContainerMount, ContainerRequest, AGENT_TYPE_CLEANER, AGENT_TYPE_INGRESS,
    AGENT_TYPE_INGRESS_VOLUME, AGENT_TYPE_SERVER, AGENT_TYPE_VOLUME, LABEL_AGENT_TYPE,
};
use crate::error::{Error, Result};

const DOCKER_SOCKET: &str = "/var/run/docker.sock";

pub struct Workers<'a> {
    provider: &'a dyn ComposeProvider,
}

impl<'a> Workers<'a> {
    pub fn new(provider: &'a dyn ComposeProvider) -> Self {
        Workers { provider }
    }

    fn session_id(&self) -> &str {
        self.provider.session_id()
    }

    fn base_env(&self) -> HashMap<String, String> {
        HashMap::from([
            (ENV_SESSION_ID.to_string(), self.session_id().to_string()),
            (
                ENV_HOST_CONTEXT_PATH.to_string(),
                self.provider
                    .context_path_for_mount()
                    .to_string_lossy()
                    .into_owned(),
            ),
            (ENV_IMAGES.to_string(), config::images_json()),
        ])
    }

    fn base_mounts(&self) -> Vec<ContainerMount> {
        vec![
            ContainerMount::bind(DOCKER_SOCKET, DOCKER_SOCKET),
            ContainerMount::bind_ro(
                self.provider
                    .context_path_for_mount()
                    .to_string_lossy()
                    .into_owned(),
                AGENT_CONTEXT_PATH.trim_end_matches('/'),
            ),
        ]
    }

    /// Start the long-lived agent container and wait for its health endpoint.
    pub async fn spawn_server(&self, auto_start: bool, debug: bool) -> Result<ContainerHandle> {
        let session_id = self.session_id();
        let network = self
            .provider
            .config()
            .network_name(session_id);
        let mut env = self.base_env();
        env.insert(ENV_INSTANCE_NAME.to_string(), session_id.to_string());
        if debug {
            env.insert(ENV_DEBUG.to_string(), "true".to_string());
        }
        self.provider
            .docker()
            .run_container(
                ContainerRequest {
                    name: format!("{CONTAINER_NAME_PREFIX}agent_{session_id}"),
                    image: config::images().agent,
                    exposed_ports: vec![AGENT_PORT.to_string(), EVENT_BUS_PORT.to_string()],
                    mounts: self.base_mounts(),
                    env,
                    networks: vec![
                        self.provider.docker().default_network().to_string(),
                        network.clone(),
                    ],
                    network_aliases: HashMap::from([(network, vec!["agent".to_string()])]),
                    cmd: vec![
                        "agent".to_string(),
                        "serve".to_string(),
                        format!("--autoStart={auto_start}"),
                    ],
                    labels: HashMap::from([(
                        LABEL_AGENT_TYPE.to_string(),
                        AGENT_TYPE_SERVER.to_string(),
                    )]),
                    waiting_for: Some(
                        WaitStrategy::for_http(crate::common::AGENT_HEALTH_ENDPOINT, AGENT_PORT)
                            .with_method("GET")
                            .into(),
                    ),
                    // Keep the container around for debugging sessions.
                    auto_remove: !debug,
                    ..Default::default()
                },
                session_id,
            )
            .await
    }

    /// Seed every declared volume from its workspace directory.
    pub async fn seed_volumes(&self) -> Result<()> {
        let mut mounts = self.base_mounts();
        for volume in &self.provider.config().volumes {
            if volume.path.is_some() {
                mounts.push(ContainerMount::volume(
                    format!("{}_{}", volume.name, self.session_id()),
                    format!("{AGENT_VOLUME_PATH}{}", volume.name),
                ));
            }
        }
        self.run_and_collect_error(ContainerRequest {
            name: format!(
                "{CONTAINER_NAME_PREFIX}agent_volume_{}",
                self.session_id()
            ),
            image: config::images().agent,
            env: self.base_env(),
            mounts,
            cmd: vec!["agent".to_string(), "prepareVolume".to_string()],
            labels: HashMap::from([(
                LABEL_AGENT_TYPE.to_string(),
                AGENT_TYPE_VOLUME.to_string(),
            )]),
            ..Default::default()
        })
        .await
    }

    /// Seed the volumes of one group from its alternative dataset.
    /// `agent_type` distinguishes the start-time seed from a data swap.
    pub async fn seed_volume_group(
        &self,
        group: &VolumeGroupConfig,
        agent_type: &str,
    ) -> Result<()> {
        let mut mounts = self.base_mounts();
        for volume in &group.volumes {
            mounts.push(ContainerMount::volume(
                format!("{}_{}", volume.name, self.session_id()),
                format!("{AGENT_VOLUME_PATH}{}", volume.name),
            ));
        }
        self.run_and_collect_error(ContainerRequest {
            name: format!(
                "{CONTAINER_NAME_PREFIX}agent_switch_{}",
                self.session_id()
            ),
            image: config::images().agent,
            env: self.base_env(),
            mounts,
            cmd: vec![
                "agent".to_string(),
                "prepareVolumeGroup".to_string(),
                "--select".to_string(),
                group.name.clone(),
            ],
            labels: HashMap::from([(LABEL_AGENT_TYPE.to_string(), agent_type.to_string())]),
            ..Default::default()
        })
        .await
    }

    /// Schedule a detached cleaner that sweeps the whole session. The
    /// cleaner auto-removes itself; the agent cannot remove it.
    pub async fn spawn_cleaner(&self) -> Result<()> {
        let handle = self
            .provider
            .docker()
            .create_container(
                ContainerRequest {
                    name: format!(
                        "{CONTAINER_NAME_PREFIX}agent_clean_{}",
                        self.session_id()
                    ),
                    image: config::images().agent,
                    mounts: vec![ContainerMount::bind(DOCKER_SOCKET, DOCKER_SOCKET)],
                    env: HashMap::from([(
                        ENV_SESSION_ID.to_string(),
                        self.session_id().to_string(),
                    )]),
                    cmd: vec!["agent".to_string(), "clean".to_string()],
                    labels: HashMap::from([(
                        LABEL_AGENT_TYPE.to_string(),
                        AGENT_TYPE_CLEANER.to_string(),
                    )]),
                    auto_remove: true,
                    ..Default::default()
                },
                self.session_id(),
            )
            .await?;
        handle.start().await
    }

    /// Reconfigure the ingress proxy: rebuild the config volume through a
    /// worker, then (re)create the envoy container exposing each target port.
    pub async fn prepare_ingress(
        &self,
        mappings: &HashMap<String, String>,
    ) -> Result<Vec<(String, u16, u16)>> {
        let parsed = super::ingress::parse_port_mappings(mappings)?;
        let session_id = self.session_id();
        let docker = self.provider.docker();
        let container_name = format!("{CONTAINER_NAME_PREFIX}agent_ingress_{session_id}");

        // Drop the previous proxy and its config volume before rebuilding.
        if let Ok(Some(existing)) = docker.find_container_by_name(&container_name).await {
            let _ = docker
                .remove_container(&existing.id.unwrap_or_default())
                .await;
        }
        let _ = docker
            .remove_volume(INGRESS_VOLUME_NAME, session_id, true)
            .await;
        let engine_volume = docker
            .create_volume(INGRESS_VOLUME_NAME, session_id, None)
            .await?;

        let mut cmd = vec![
            "agent".to_string(),
            "prepareIngressVolume".to_string(),
        ];
        for (service, src, dst) in &parsed {
            cmd.push("--ports".to_string());
            cmd.push(format!("{service}={src}:{dst}"));
        }
        let mut mounts = self.base_mounts();
        mounts.push(ContainerMount::volume(
            engine_volume.clone(),
            format!("{AGENT_VOLUME_PATH}{INGRESS_VOLUME_NAME}"),
        ));
        self.run_and_collect_error(ContainerRequest {
            name: format!(
                "{CONTAINER_NAME_PREFIX}agent_ingress_volume_{session_id}"
            ),
            image: config::images().agent,
            env: self.base_env(),
            mounts,
            cmd,
            labels: HashMap::from([(
                LABEL_AGENT_TYPE.to_string(),
                AGENT_TYPE_INGRESS_VOLUME.to_string(),
            )]),
            ..Default::default()
        })
        .await?;

        let exposed_ports = parsed
            .iter()
            .map(|(_, _, dst)| format!("{dst}:{dst}"))
            .collect();
        docker
            .run_container(
                ContainerRequest {
                    name: container_name,
                    image: config::images().ingress,
                    mounts: vec![ContainerMount::volume(engine_volume, "/etc/envoy")],
                    exposed_ports,
                    networks: vec![self.provider.config().network_name(session_id)],
                    labels: HashMap::from([(
                        LABEL_AGENT_TYPE.to_string(),
                        AGENT_TYPE_INGRESS.to_string(),
                    )]),
                    ..Default::default()
                },
                session_id,
            )
            .await?;
        Ok(parsed)
    }

    /// Run a worker to completion. On a non-zero exit the worker's logs are
    /// scanned for the first JSON error line, which becomes the failure
    /// message; the raw tail is the fallback.
    async fn run_and_collect_error(&self, mut req: ContainerRequest) -> Result<()> {
        req.waiting_for = Some(
            WaitStrategy::for_exit()
                .with_exit_timeout(std::time::Duration::from_secs(EXIT_TIMEOUT_SECS))
                .into(),
        );
        let auto_remove = req.auto_remove;
        let docker = self.provider.docker();
        let handle = docker.create_container(req, self.session_id()).await?;
        handle.start().await?;
        // An auto-removed worker leaves no logs behind to inspect.
        if auto_remove {
            return Ok(());
        }
        let exit_code = match handle.state().await {
            Ok(state) => state.exit_code.unwrap_or(0),
            Err(e) if crate::docker::wait::is_not_found(&e) => 0,
            Err(e) => return Err(e),
        };
        let result = if exit_code != 0 {
            let logs = handle.logs(None).await.unwrap_or_default();
            debug!("worker {} failed, logs:\n{logs}", handle.name);
            Err(Error::WorkerFailed(
                parse_worker_error_log(&logs).unwrap_or_else(|| tail_of(&logs, 20)),
            ))
        } else {
            Ok(())
        };
        let _ = docker.remove_container(&handle.id).await;
        result
    }
}

#[derive(Deserialize)]
struct WorkerLogLine {
    level: String,
    #[serde(default)]
    fields: WorkerLogFields,
}

#[derive(Deserialize, Default)]
struct WorkerLogFields {
    #[serde(default)]
    message: Option<String>,
}

/// First `level=error` message in a stream of JSON log lines. Lines may be
/// prefixed with multiplexing noise, so parsing starts at the first brace.
pub fn parse_worker_error_log(log: &str) -> Option<String> {
    for line in log.lines() {
        let Some(idx) = line.find('{') else { continue };
        let Ok(parsed) = serde_json::from_str::<WorkerLogLine>(&line[idx..]) else {
            continue;
        };
        if parsed.level.eq_ignore_ascii_case("error") {
            if let Some(message) = parsed.fields.message {
                return Some(message);
            }
        }
    }
    None
}

fn tail_of(log: &str, lines: usize) -> String {
    let all: Vec<&str> = log.lines().collect();
    let start = all.len().saturating_sub(lines);
    all[start..].join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn picks_the_first_error_line_out_of_json_logs() {
        let log = concat!(
            r#"{"timestamp":"2024-01-01T00:00:00Z","level":"INFO","fields":{"message":"seed volume d"},"target":"podyard"}"#,
            "\n",
            r#"{"timestamp":"2024-01-01T00:00:01Z","level":"ERROR","fields":{"message":"seed path /home/context/b is not a directory"},"target":"podyard"}"#,
            "\n",
            r#"{"timestamp":"2024-01-01T00:00:02Z","level":"ERROR","fields":{"message":"second error"},"target":"podyard"}"#,
        );
        assert_eq!(
            parse_worker_error_log(log).as_deref(),
            Some("seed path /home/context/b is not a directory")
        );
    }

    #[test]
    fn skips_unparseable_lines_and_falls_back_to_none() {
        let log = "plain panic output\nno json here";
        assert_eq!(parse_worker_error_log(log), None);
        assert_eq!(tail_of(log, 1), "no json here");
    }

    #[test]
    fn tolerates_a_stream_prefix_before_the_json() {
        let log = r#"x{"level":"error","fields":{"message":"boom"}}"#;
        assert_eq!(parse_worker_error_log(log).as_deref(), Some("boom"));
    }
}
