//! Typed model of the compose document plus validation, and the image
//! defaults that the launcher may override per invocation.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::sync::RwLock;
use tracing::info;

/// Images used for infrastructure containers. Overridable from the launcher
/// via `--fromConfigJson` and forwarded to the agent through the environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Images {
    #[serde(default)]
    pub agent: String,
    #[serde(default)]
    pub ingress: String,
    #[serde(default)]
    pub pause: String,
}

impl Default for Images {
    fn default() -> Self {
        Images {
            agent: "podyard/agent".to_string(),
            ingress: "envoyproxy/envoy:v1.23-latest".to_string(),
            pause: "gcr.io/google_containers/pause:3.0".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct ImagesOverride {
    #[serde(default)]
    image: Option<Images>,
}

static IMAGES: RwLock<Option<Images>> = RwLock::new(None);

pub fn images() -> Images {
    IMAGES.read().unwrap().clone().unwrap_or_default()
}

/// Apply a `{"image": {"agent": …, "ingress": …, "pause": …}}` override.
/// Empty fields keep their current value.
pub fn set_images_from_json(config_json: &str) -> Result<()> {
    info!("reset image config: {config_json}");
    let over: ImagesOverride = serde_json::from_str(config_json)
        .map_err(|e| Error::Validation(format!("invalid image config json: {e}")))?;
    if let Some(image) = over.image {
        let mut current = images();
        if !image.agent.is_empty() {
            current.agent = image.agent;
        }
        if !image.ingress.is_empty() {
            current.ingress = image.ingress;
        }
        if !image.pause.is_empty() {
            current.pause = image.pause;
        }
        *IMAGES.write().unwrap() = Some(current);
    }
    Ok(())
}

pub fn images_json() -> String {
    serde_json::to_string(&ImagesOverride {
        image: Some(images()),
    })
    .unwrap_or_default()
}

/// Generate a short opaque session id.
pub fn gen_session_id() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    id[..12].to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ComposeConfig {
    pub version: String,
    #[serde(default)]
    pub network: Option<String>,
    #[serde(default)]
    pub volumes: Vec<VolumeConfig>,
    #[serde(default)]
    pub volume_groups: Vec<VolumeGroupConfig>,
    #[serde(default)]
    pub pods: Vec<PodConfig>,
    #[serde(default)]
    pub task_groups: Vec<TaskGroup>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct VolumeConfig {
    pub name: String,
    #[serde(default)]
    pub path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct VolumeGroupConfig {
    pub name: String,
    #[serde(default)]
    pub volumes: Vec<VolumeConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct PodConfig {
    pub name: String,
    #[serde(default)]
    pub dns: Vec<String>,
    #[serde(default)]
    pub depends: Vec<String>,
    #[serde(default)]
    pub init_containers: Vec<ContainerConfig>,
    #[serde(default)]
    pub containers: Vec<ContainerConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct TaskGroup {
    pub name: String,
    #[serde(default)]
    pub event: Option<String>,
    #[serde(default)]
    pub tasks: Vec<ContainerConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ContainerConfig {
    pub name: String,
    pub image: String,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub env: std::collections::HashMap<String, String>,
    #[serde(default)]
    pub privileged: bool,
    #[serde(default)]
    pub always_pull_image: bool,
    #[serde(default)]
    pub volume_mounts: Vec<VolumeMountConfig>,
    #[serde(default)]
    pub bind_mounts: Vec<BindMountConfig>,
    #[serde(default)]
    pub cap: Option<CapConfig>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub working_dir: Option<String>,
    #[serde(default)]
    pub waiting_for: Option<WaitingForConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct VolumeMountConfig {
    pub name: String,
    pub mount_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct BindMountConfig {
    pub host_path: String,
    pub mount_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct CapConfig {
    #[serde(default)]
    pub add: Vec<String>,
    #[serde(default)]
    pub drop: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct WaitingForConfig {
    #[serde(default)]
    pub http_get: Option<HttpGetConfig>,
    #[serde(default)]
    pub tcp_socket: Option<TcpSocketConfig>,
    #[serde(default)]
    pub initial_delay_seconds: u64,
    #[serde(default)]
    pub period_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct HttpGetConfig {
    pub method: String,
    pub path: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct TcpSocketConfig {
    pub port: u16,
}

impl ComposeConfig {
    pub fn network_name(&self, session_id: &str) -> String {
        match &self.network {
            Some(network) if !network.is_empty() => network.clone(),
            _ => format!("podyard_net_{session_id}"),
        }
    }

    pub fn task_group(&self, name: &str) -> Option<&TaskGroup> {
        self.task_groups.iter().find(|g| g.name == name)
    }

    pub fn task_groups_for_event(&self, event: &str) -> Vec<&TaskGroup> {
        self.task_groups
            .iter()
            .filter(|g| g.event.as_deref() == Some(event))
            .collect()
    }

    pub fn volume_group(&self, name: &str) -> Option<&VolumeGroupConfig> {
        self.volume_groups.iter().find(|g| g.name == name)
    }

    pub fn pod(&self, name: &str) -> Option<&PodConfig> {
        self.pods.iter().find(|p| p.name == name)
    }

    /// Validate the document against the workspace it was loaded from.
    pub fn check(&self, context_path: &Path) -> Result<()> {
        if self.version != "1" {
            return Err(Error::Validation("version must be 1".to_string()));
        }
        let mut pod_names = HashSet::new();
        for pod in &self.pods {
            if pod.name.is_empty() {
                return Err(Error::Validation("pod name must be set".to_string()));
            }
            if !pod_names.insert(pod.name.as_str()) {
                return Err(Error::Validation(format!(
                    "duplicate pod name:{}",
                    pod.name
                )));
            }
        }
        for pod in &self.pods {
            pod.check(self)?;
        }
        let declared: HashSet<&str> = self.volumes.iter().map(|v| v.name.as_str()).collect();
        for volume in &self.volumes {
            volume.check(context_path)?;
        }
        for group in &self.volume_groups {
            for volume in &group.volumes {
                if !declared.contains(volume.name.as_str()) {
                    return Err(Error::Validation(format!(
                        "volumeGroup name:{}, volume {} is not declared",
                        group.name, volume.name
                    )));
                }
                volume.check(context_path)?;
            }
        }
        for mount_name in self.mounted_volume_names() {
            if !declared.contains(mount_name.as_str()) {
                return Err(Error::Validation(format!(
                    "can not found volume {mount_name}"
                )));
            }
        }
        Ok(())
    }

    fn mounted_volume_names(&self) -> Vec<String> {
        let mut names = Vec::new();
        let mut collect = |c: &ContainerConfig| {
            for vm in &c.volume_mounts {
                names.push(vm.name.clone());
            }
        };
        for group in &self.task_groups {
            group.tasks.iter().for_each(&mut collect);
        }
        for pod in &self.pods {
            pod.init_containers.iter().for_each(&mut collect);
            pod.containers.iter().for_each(&mut collect);
        }
        names
    }
}

impl PodConfig {
    fn check(&self, config: &ComposeConfig) -> Result<()> {
        for depend in &self.depends {
            if depend == &self.name {
                return Err(Error::Validation(format!(
                    "{} depend:{} cannot rely on itself",
                    self.name, depend
                )));
            }
            if config.pod(depend).is_none() {
                return Err(Error::Validation(format!(
                    "{} depend:{} not found in pods",
                    self.name, depend
                )));
            }
        }
        for container in self.init_containers.iter().chain(self.containers.iter()) {
            container.check()?;
        }
        Ok(())
    }
}

impl ContainerConfig {
    fn check(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::Validation("container name must be set".to_string()));
        }
        if self.image.is_empty() {
            return Err(Error::Validation(format!(
                "container {} must set an image",
                self.name
            )));
        }
        Ok(())
    }
}

impl VolumeConfig {
    fn check(&self, context_path: &Path) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::Validation("volume name must be set".to_string()));
        }
        if let Some(path) = &self.path {
            let seed = context_path.join(path);
            if !seed.exists() {
                return Err(Error::Validation(format!(
                    "volume {} seed path {} does not exist",
                    self.name,
                    seed.display()
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_yaml() -> &'static str {
        r#"
version: "1"
pods:
  - name: db
    containers:
      - name: postgres
        image: postgres:15
  - name: web
    depends: [db]
    containers:
      - name: nginx
        image: nginx:1.25
        waitingFor:
          tcpSocket:
            port: 80
"#
    }

    #[test]
    fn parses_and_validates_a_minimal_document() {
        let config: ComposeConfig = serde_yaml::from_str(minimal_yaml()).unwrap();
        config.check(Path::new("/tmp")).unwrap();
        assert_eq!(config.pods.len(), 2);
        assert_eq!(config.pods[1].depends, vec!["db"]);
        let wait = config.pods[1].containers[0].waiting_for.as_ref().unwrap();
        assert_eq!(wait.tcp_socket.as_ref().unwrap().port, 80);
    }

    #[test]
    fn rejects_unknown_top_level_keys() {
        let yaml = "version: \"1\"\nreplicas: 3\n";
        assert!(serde_yaml::from_str::<ComposeConfig>(yaml).is_err());
    }

    #[test]
    fn rejects_wrong_version() {
        let config = ComposeConfig {
            version: "2".into(),
            ..Default::default()
        };
        let err = config.check(Path::new("/tmp")).unwrap_err();
        assert!(err.to_string().contains("version must be 1"));
    }

    #[test]
    fn rejects_duplicate_pod_names() {
        let mut config: ComposeConfig = serde_yaml::from_str(minimal_yaml()).unwrap();
        config.pods[1].name = "db".into();
        config.pods[1].depends.clear();
        let err = config.check(Path::new("/tmp")).unwrap_err();
        assert!(err.to_string().contains("duplicate pod name"));
    }

    #[test]
    fn rejects_self_dependency_and_unknown_depends() {
        let mut config: ComposeConfig = serde_yaml::from_str(minimal_yaml()).unwrap();
        config.pods[1].depends = vec!["web".into()];
        assert!(config.check(Path::new("/tmp")).is_err());
        config.pods[1].depends = vec!["cache".into()];
        assert!(config.check(Path::new("/tmp")).is_err());
    }

    #[test]
    fn rejects_group_volume_that_is_not_declared() {
        let mut config: ComposeConfig = serde_yaml::from_str(minimal_yaml()).unwrap();
        config.volume_groups.push(VolumeGroupConfig {
            name: "g1".into(),
            volumes: vec![VolumeConfig {
                name: "data".into(),
                path: None,
            }],
        });
        let err = config.check(Path::new("/tmp")).unwrap_err();
        assert!(err.to_string().contains("is not declared"));
    }

    #[test]
    fn rejects_mount_of_undeclared_volume() {
        let mut config: ComposeConfig = serde_yaml::from_str(minimal_yaml()).unwrap();
        config.pods[0].containers[0].volume_mounts.push(VolumeMountConfig {
            name: "data".into(),
            mount_path: "/var/lib/data".into(),
        });
        let err = config.check(Path::new("/tmp")).unwrap_err();
        assert!(err.to_string().contains("can not found volume data"));
    }

    #[test]
    fn rejects_missing_seed_path() {
        let dir = tempfile::tempdir().unwrap();
        let mut config: ComposeConfig = serde_yaml::from_str(minimal_yaml()).unwrap();
        config.volumes.push(VolumeConfig {
            name: "data".into(),
            path: Some("./seed".into()),
        });
        assert!(config.check(dir.path()).is_err());
        std::fs::create_dir_all(dir.path().join("seed")).unwrap();
        config.check(dir.path()).unwrap();
    }

    #[test]
    fn network_name_defaults_to_session_scoped() {
        let config: ComposeConfig = serde_yaml::from_str(minimal_yaml()).unwrap();
        assert_eq!(config.network_name("abc123"), "podyard_net_abc123");
        let mut named = config.clone();
        named.network = Some("shared".into());
        assert_eq!(named.network_name("abc123"), "shared");
    }

    #[test]
    fn session_ids_are_short_and_unique() {
        let a = gen_session_id();
        let b = gen_session_id();
        assert_eq!(a.len(), 12);
        assert_ne!(a, b);
    }

    #[test]
    fn image_override_keeps_unset_fields() {
        set_images_from_json(r#"{"image":{"pause":"registry.k8s.io/pause:3.9"}}"#).unwrap();
        let images = images();
        assert_eq!(images.pause, "registry.k8s.io/pause:3.9");
        assert_eq!(images.agent, "podyard/agent");
    }
}
