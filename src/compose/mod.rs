//! Compose root: ties the parsed config, the engine provider, the pod engine
//! and the volume manager together for one session.

pub mod depend;
pub mod observe;
pub mod pod;
pub mod volume;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::{self, ComposeConfig, TaskGroup, VolumeGroupConfig};
use crate::docker::DockerProvider;
use crate::error::{Error, Result};
use crate::event::EventBus;
use pod::PodCompose;
use volume::VolumeManager;

/// Capability set handed to everything that spawns worker containers on
/// behalf of a compose session.
pub trait ComposeProvider: Send + Sync {
    /// Workspace path as the engine daemon sees it (the host path when this
    /// process runs inside a container).
    fn context_path_for_mount(&self) -> &Path;
    fn docker(&self) -> &Arc<DockerProvider>;
    fn session_id(&self) -> &str;
    fn config(&self) -> &ComposeConfig;
    fn is_ready(&self) -> bool;
}

pub struct Compose {
    config: ComposeConfig,
    session_id: String,
    context_path: PathBuf,
    host_context_path: Option<PathBuf>,
    provider: Arc<DockerProvider>,
    pod_compose: PodCompose,
    volumes: VolumeManager,
    bus: Arc<EventBus>,
}

impl Compose {
    /// Parse, validate and wire a compose session. Fails without touching
    /// the engine when the document is invalid or the graph has a cycle.
    pub async fn new(
        config_bytes: &[u8],
        session_id: &str,
        context_path: impl Into<PathBuf>,
        host_context_path: Option<PathBuf>,
        bus: Arc<EventBus>,
    ) -> Result<Self> {
        let context_path: PathBuf = context_path.into();
        let context_path = context_path
            .canonicalize()
            .unwrap_or(context_path);
        let config: ComposeConfig = serde_yaml::from_slice(config_bytes)?;
        let session_id = if session_id.is_empty() {
            config::gen_session_id()
        } else {
            session_id.to_string()
        };
        config.check(&context_path)?;

        let provider = DockerProvider::new(Arc::clone(&bus)).await?;
        let pod_compose = PodCompose::new(
            session_id.clone(),
            config.pods.clone(),
            config.network_name(&session_id),
            host_context_path
                .clone()
                .unwrap_or_else(|| context_path.clone()),
            Arc::clone(&provider),
            Arc::clone(&bus),
        )?;
        let volumes = VolumeManager::new(
            config.volumes.clone(),
            Arc::clone(&provider),
            session_id.clone(),
        );
        Ok(Compose {
            config,
            session_id,
            context_path,
            host_context_path,
            provider,
            pod_compose,
            volumes,
            bus,
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn config(&self) -> &ComposeConfig {
        &self.config
    }

    pub fn provider(&self) -> &Arc<DockerProvider> {
        &self.provider
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn network_name(&self) -> String {
        self.config.network_name(&self.session_id)
    }

    pub fn context_path(&self) -> &Path {
        &self.context_path
    }

    /// Workspace path usable in engine mount specs.
    pub fn context_path_for_mount(&self) -> &Path {
        self.host_context_path
            .as_deref()
            .unwrap_or(&self.context_path)
    }

    /// Make sure the session network exists before anything is started: a
    /// generated network is created here, an externally named one must
    /// already exist.
    pub async fn prepare_network(&self) -> Result<()> {
        match &self.config.network {
            Some(network) if !network.is_empty() => {
                self.provider.get_network(network).await.map_err(|_| {
                    Error::Validation(format!("network: {network} is not exist"))
                })?;
            }
            _ => {
                self.provider
                    .create_network(&self.network_name(), &self.session_id)
                    .await?;
            }
        }
        Ok(())
    }

    pub async fn start_pods(&self) -> Result<()> {
        self.pod_compose.start().await
    }

    pub async fn restart_pods<F>(&self, pod_names: &[String], before_start: F) -> Result<()>
    where
        F: std::future::Future<Output = Result<()>>,
    {
        for name in pod_names {
            if !self.pod_compose.has_pod(name) {
                return Err(Error::UnknownPod(name.clone()));
            }
        }
        self.pod_compose.restart_pods(pod_names, before_start).await
    }

    pub async fn create_volumes(&self) -> Result<()> {
        self.volumes.create_volumes().await
    }

    pub fn volume_group(&self, name: &str) -> Result<&VolumeGroupConfig> {
        self.config
            .volume_group(name)
            .ok_or_else(|| Error::UnknownVolumeGroup(name.to_string()))
    }

    pub async fn recreate_volumes_with_group(&self, group: &VolumeGroupConfig) -> Result<()> {
        self.volumes.recreate_volumes_with_group(group).await
    }

    pub fn find_pods_who_used_volumes(&self, volume_names: &[String]) -> Vec<String> {
        self.pod_compose.find_pods_who_used_volumes(volume_names)
    }

    pub async fn run_task_group(&self, group: &TaskGroup) -> Result<()> {
        self.pod_compose.run_task_group(group).await
    }
}

impl ComposeProvider for Compose {
    fn context_path_for_mount(&self) -> &Path {
        Compose::context_path_for_mount(self)
    }

    fn docker(&self) -> &Arc<DockerProvider> {
        &self.provider
    }

    fn session_id(&self) -> &str {
        &self.session_id
    }

    fn config(&self) -> &ComposeConfig {
        &self.config
    }

    // The launcher and worker subcommands never serve mutations, so they
    // report not-ready.
    fn is_ready(&self) -> bool {
        false
    }
}
