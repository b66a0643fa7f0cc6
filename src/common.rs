//! Constants and wire DTOs shared between the launcher, the agent and the
//! worker subcommands.

use serde::{Deserialize, Serialize};

/// Workspace mount point inside the agent and worker containers.
pub const AGENT_CONTEXT_PATH: &str = "/home/context/";
/// Mount root for session volumes inside worker containers.
pub const AGENT_VOLUME_PATH: &str = "/home/volumes/";
/// Log directory inside the agent container.
pub const AGENT_LOG_PATH: &str = "/home/logs/";

pub const CONFIG_FILE_NAME: &str = "compose.yml";

pub const AGENT_PORT: u16 = 8080;
pub const EVENT_BUS_PORT: u16 = 8081;

// NOTE: the endpoint is spelled this way on the wire; clients depend on it.
pub const AGENT_HEALTH_ENDPOINT: &str = "/heath";

pub const ENV_SESSION_ID: &str = "SESSION_ID";
pub const ENV_HOST_CONTEXT_PATH: &str = "HOST_CONTEXT_PATH";
pub const ENV_DEBUG: &str = "PODYARD_DEBUG";
pub const ENV_INSTANCE_NAME: &str = "PODYARD_NAME";
pub const ENV_IMAGES: &str = "PODYARD_IMAGES";

pub const CONTAINER_NAME_PREFIX: &str = "podyard_";

/// Engine-level name of the volume holding the ingress proxy configuration.
pub const INGRESS_VOLUME_NAME: &str = "ingress";

/// Deadline for init containers and worker containers to exit.
pub const EXIT_TIMEOUT_SECS: u64 = 60;
/// Grace given to in-flight HTTP handlers when the agent shuts down.
pub const SHUTDOWN_GRACE_SECS: u64 = 5;

/// Payload of `GET /info`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Info {
    pub session_id: String,
    pub is_ready: bool,
    pub volume_infos: Vec<VolumeInfo>,
    pub pod_infos: Vec<PodInfo>,
    pub ingress_infos: Vec<IngressInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeInfo {
    pub name: String,
    pub volume_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodInfo {
    pub name: String,
    pub container_infos: Vec<ContainerInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerInfo {
    pub name: String,
    pub container_id: String,
    pub state: String,
    pub image: String,
    pub created: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngressInfo {
    pub service_name: String,
    pub service_port: String,
    pub host_port: String,
}
