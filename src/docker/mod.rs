//! Thin typed façade over the Docker daemon.
//!
//! Every object the provider creates carries the two universal labels
//! (`pod-managed=true`, `session=<id>`) plus whatever role labels the caller
//! supplies. All queries are scoped by the session label.

pub mod container;
pub mod provider;
pub mod wait;

pub use container::{ContainerHandle, ContainerMount, ContainerRequest};
pub use provider::DockerProvider;

/// Marker on every engine object this tool manages.
pub const LABEL_POD_MANAGED: &str = "pod-managed";
/// Session scope label; the sole multi-tenancy boundary.
pub const LABEL_SESSION: &str = "session";
/// Role of infrastructure containers.
pub const LABEL_AGENT_TYPE: &str = "agent-type";
pub const LABEL_POD_NAME: &str = "pod-name";
pub const LABEL_CONTAINER_NAME: &str = "container-name";
/// Set on volumes created for a volume group.
pub const LABEL_VOLUME_GROUP: &str = "volume-group";

pub const AGENT_TYPE_SERVER: &str = "server";
pub const AGENT_TYPE_CLEANER: &str = "cleaner";
pub const AGENT_TYPE_VOLUME: &str = "volume";
pub const AGENT_TYPE_SWITCH_DATA: &str = "switchData";
pub const AGENT_TYPE_INGRESS: &str = "ingress";
pub const AGENT_TYPE_INGRESS_VOLUME: &str = "ingressVolume";

/// Bridge driver name, and the fallback network created when the daemon has
/// no bridge network.
pub const BRIDGE: &str = "bridge";
pub const DEFAULT_NETWORK: &str = "podyard_default";

/// True when this process itself runs inside a container.
pub fn in_a_container() -> bool {
    std::path::Path::new("/.dockerenv").exists()
}
