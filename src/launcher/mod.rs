//! Host-side launcher: starts the agent container for a session and offers
//! the `ps` / `clean` / `shutdown` sweeps. All engine mutations beyond
//! spawning the agent happen inside the agent.

use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

use crate::common::{AGENT_PORT, CONFIG_FILE_NAME, EVENT_BUS_PORT};
use crate::compose::Compose;
use crate::docker::{
    DockerProvider, AGENT_TYPE_SERVER, LABEL_AGENT_TYPE, LABEL_SESSION,
};
use crate::error::{Error, Result};
use crate::event::EventBus;
use crate::agent::worker::Workers;

pub struct Launcher {
    compose: Compose,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct ConfigDump {
    session_id: String,
    manager_port: String,
    event_bus_port: String,
}

/// One row of `ps` output.
pub struct SessionRow {
    pub name: String,
    pub alive: bool,
    pub agent_port: String,
    pub event_bus_port: String,
}

impl Launcher {
    pub async fn new(context_path: impl Into<PathBuf>, session_id: &str) -> Result<Self> {
        let context_path: PathBuf = context_path.into();
        let context_path = context_path.canonicalize().unwrap_or(context_path);
        let config_bytes = std::fs::read(context_path.join(CONFIG_FILE_NAME))?;
        let bus = Arc::new(EventBus::new());
        let compose = Compose::new(
            &config_bytes,
            session_id,
            context_path.clone(),
            Some(context_path),
            bus,
        )
        .await?;
        Ok(Launcher { compose })
    }

    pub fn session_id(&self) -> &str {
        self.compose.session_id()
    }

    /// Refuse to reuse a session id that still owns live containers.
    async fn verify(&self) -> Result<()> {
        let existing = self
            .compose
            .provider()
            .find_containers_by_session(self.compose.session_id())
            .await?;
        if !existing.is_empty() {
            return Err(Error::Validation(format!(
                "session name:{} is exist in system, please change name and try again",
                self.compose.session_id()
            )));
        }
        Ok(())
    }

    /// Prepare the session network and start the agent container, surfacing
    /// its API and event-bus ports.
    pub async fn start(
        &self,
        auto_start: bool,
        debug: bool,
        config_dump_file: Option<&str>,
    ) -> Result<()> {
        self.verify().await?;
        self.compose.prepare_network().await?;
        if !auto_start {
            info!("auto start is not enabled, call the agent start api to start compose");
        }
        let agent = Workers::new(&self.compose)
            .spawn_server(auto_start, debug)
            .await?;

        let manager_port = agent
            .mapped_port(AGENT_PORT)
            .await?
            .map(|p| p.to_string())
            .unwrap_or_default();
        let event_bus_port = agent
            .mapped_port(EVENT_BUS_PORT)
            .await?
            .map(|p| p.to_string())
            .unwrap_or_default();
        info!(
            "compose started, session: {}, agent port: {}, event bus port: {}",
            self.compose.session_id(),
            manager_port,
            event_bus_port
        );

        if let Some(path) = config_dump_file {
            let dump = ConfigDump {
                session_id: self.compose.session_id().to_string(),
                manager_port,
                event_bus_port,
            };
            std::fs::write(path, serde_json::to_vec(&dump).unwrap_or_default())?;
        }

        if debug {
            // Keep the launcher attached so the agent's stream stays visible.
            agent.follow_output(format!("agent_{}", self.compose.session_id()));
            let _ = tokio::signal::ctrl_c().await;
        }
        Ok(())
    }
}

async fn host_provider() -> Result<Arc<DockerProvider>> {
    DockerProvider::new(Arc::new(EventBus::new())).await
}

async fn list_sessions(provider: &Arc<DockerProvider>) -> Result<Vec<SessionRow>> {
    let containers = provider.find_all_pod_containers().await?;
    let mut rows = HashMap::new();
    for container in containers {
        let labels = container.labels.clone().unwrap_or_default();
        if labels.get(LABEL_AGENT_TYPE).map(String::as_str) != Some(AGENT_TYPE_SERVER) {
            continue;
        }
        let Some(session) = labels.get(LABEL_SESSION) else {
            continue;
        };
        let alive = container.state.as_deref() == Some("running");
        let ports = container.ports.unwrap_or_default();
        let public_port = |private: u16| {
            ports
                .iter()
                .find(|p| p.private_port == private && p.public_port.is_some())
                .and_then(|p| p.public_port)
                .map(|p| p.to_string())
                .unwrap_or_default()
        };
        rows.insert(
            session.clone(),
            SessionRow {
                name: session.clone(),
                alive,
                agent_port: public_port(AGENT_PORT),
                event_bus_port: public_port(EVENT_BUS_PORT),
            },
        );
    }
    let mut rows: Vec<SessionRow> = rows.into_values().collect();
    rows.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(rows)
}

/// `ps`: one line per agent container found on the engine.
pub async fn ps() -> Result<()> {
    let provider = host_provider().await?;
    let rows = list_sessions(&provider).await?;
    println!(
        "{:<20} {:<8} {:<12} {:<14}",
        "NAME", "ALIVE", "AGENT_PORT", "EVENT_BUS_PORT"
    );
    for row in rows {
        println!(
            "{:<20} {:<8} {:<12} {:<14}",
            row.name, row.alive, row.agent_port, row.event_bus_port
        );
    }
    Ok(())
}

/// `shutdown <session>…`: ask each agent to clean up and exit.
pub async fn shutdown(sessions: &[String]) -> Result<()> {
    let provider = host_provider().await?;
    let rows = list_sessions(&provider).await?;
    let host = provider.daemon_host().await?;
    let client = reqwest::Client::new();
    for session in sessions {
        let Some(row) = rows.iter().find(|r| &r.name == session) else {
            return Err(Error::Validation(format!(
                "session {session} is not found"
            )));
        };
        if row.agent_port.is_empty() {
            return Err(Error::Validation(format!(
                "session {session} has no reachable agent port"
            )));
        }
        let url = format!("http://{host}:{}/shutdown", row.agent_port);
        info!("shutting down session {session} via {url}");
        client
            .post(&url)
            .send()
            .await
            .map_err(|e| Error::Other(e.into()))?
            .error_for_status()
            .map_err(|e| Error::Other(e.into()))?;
    }
    Ok(())
}

/// `clean [--all]`: sweep every `pod-managed` object; without `--all`, the
/// sessions that still have an agent container are protected.
pub async fn clean(all: bool) -> Result<()> {
    let provider = host_provider().await?;
    let mut protect = HashSet::new();
    if !all {
        for row in list_sessions(&provider).await? {
            protect.insert(row.name);
        }
    }
    let session_of = |labels: &Option<HashMap<String, String>>| {
        labels
            .as_ref()
            .and_then(|l| l.get(LABEL_SESSION))
            .cloned()
            .unwrap_or_default()
    };

    match provider.find_all_pod_containers().await {
        Ok(containers) => {
            for container in containers {
                if protect.contains(&session_of(&container.labels)) {
                    continue;
                }
                let id = container.id.unwrap_or_default();
                info!("remove container:{id}");
                if let Err(e) = provider.remove_container(&id).await {
                    error!("{e}");
                }
            }
        }
        Err(e) => error!("{e}"),
    }
    match provider.find_all_pod_volumes().await {
        Ok(volumes) => {
            for volume in volumes {
                if protect.contains(&session_of(&volume.labels.clone().into())) {
                    continue;
                }
                info!("remove volume:{}", volume.name);
                if let Err(e) = provider.remove_volume(&volume.name, "", true).await {
                    error!("{e}");
                }
            }
        }
        Err(e) => error!("{e}"),
    }
    match provider.find_all_pod_networks().await {
        Ok(networks) => {
            for network in networks {
                if protect.contains(&session_of(&network.labels)) {
                    continue;
                }
                let id = network.id.unwrap_or_default();
                info!("remove network:{id}");
                if let Err(e) = provider.remove_network(&id).await {
                    error!("{e}");
                }
            }
        }
        Err(e) => error!("{e}"),
    }
    Ok(())
}
