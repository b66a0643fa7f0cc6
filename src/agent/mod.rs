//! Agent orchestrator: owns the engine state machine and every mutation of
//! the session, delegating filesystem work to worker containers.

pub mod api;
pub mod ingress;
pub mod seed;
pub mod worker;

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::Mutex;
use tracing::{error, info};

use crate::common::{ContainerInfo, Info, IngressInfo, PodInfo, VolumeInfo};
use crate::compose::{Compose, ComposeProvider};
use crate::config::ComposeConfig;
use crate::docker::{
    DockerProvider, AGENT_TYPE_SERVER, AGENT_TYPE_SWITCH_DATA, AGENT_TYPE_VOLUME,
    LABEL_AGENT_TYPE, LABEL_CONTAINER_NAME, LABEL_POD_NAME,
};
use crate::error::{Error, Result};
use crate::event::{self, ComposeEventData, ErrorData, Event};
use worker::Workers;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Idle,
    Starting,
    Ready,
    Restarting,
    Stopping,
    Stopped,
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EngineState::Idle => "idle",
            EngineState::Starting => "starting",
            EngineState::Ready => "ready",
            EngineState::Restarting => "restarting",
            EngineState::Stopping => "stopping",
            EngineState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

pub struct Starter {
    compose: Compose,
    state: StdMutex<EngineState>,
    /// Serializes user-triggered task groups.
    task_lock: Mutex<()>,
    ingresses: StdMutex<Vec<IngressInfo>>,
}

impl Starter {
    pub async fn new(
        workspace: impl Into<PathBuf>,
        session_id: &str,
        host_context_path: Option<PathBuf>,
        bus: Arc<crate::event::EventBus>,
    ) -> Result<Self> {
        let workspace: PathBuf = workspace.into();
        let config_bytes =
            std::fs::read(workspace.join(crate::common::CONFIG_FILE_NAME))?;
        let compose =
            Compose::new(&config_bytes, session_id, workspace, host_context_path, bus).await?;
        Ok(Starter {
            compose,
            state: StdMutex::new(EngineState::Idle),
            task_lock: Mutex::new(()),
            ingresses: StdMutex::new(Vec::new()),
        })
    }

    pub fn compose(&self) -> &Compose {
        &self.compose
    }

    pub fn state(&self) -> EngineState {
        *self.state.lock().unwrap()
    }

    /// Atomically check-and-set the state: the transition happens under the
    /// same lock as the check, so two racing mutations cannot both pass.
    fn begin(&self, from: EngineState, to: EngineState, reject: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if *state != from {
            return Err(Error::WrongState(reject.to_string()));
        }
        *state = to;
        Ok(())
    }

    fn settle(&self, to: EngineState) {
        *self.state.lock().unwrap() = to;
    }

    fn require_ready(&self) -> Result<()> {
        let state = self.state();
        if state != EngineState::Ready {
            return Err(Error::WrongState(format!(
                "engine is {state}, operation needs ready"
            )));
        }
        Ok(())
    }

    /// Full-graph start: volumes, seed workers, then every pod layer.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        self.begin(EngineState::Idle, EngineState::Starting, "compose is started")?;
        self.publish_compose_event(event::COMPOSE_EVENT_BEFORE_START);
        match self.start_inner().await {
            Ok(()) => {
                self.settle(EngineState::Ready);
                self.publish_compose_event(event::COMPOSE_EVENT_START_SUCCESS);
                info!("compose started, session:{}", self.compose.session_id());
                Ok(())
            }
            Err(e) => {
                self.settle(EngineState::Idle);
                self.publish_compose_event(event::COMPOSE_EVENT_START_FAIL);
                Err(e)
            }
        }
    }

    async fn start_inner(&self) -> Result<()> {
        self.compose.create_volumes().await?;
        let workers = Workers::new(self);
        workers.seed_volumes().await?;
        // The first volume group is the default dataset; later groups are
        // selected explicitly through the switch operation.
        if let Some(group) = self.compose.config().volume_groups.first() {
            workers.seed_volume_group(group, AGENT_TYPE_VOLUME).await?;
        }
        self.compose.start_pods().await
    }

    /// Swap the dataset of one volume group and restart exactly the pods
    /// that mount any of its volumes (plus their dependents).
    pub async fn switch_data(self: &Arc<Self>, group_name: &str) -> Result<()> {
        // Resolve before transitioning so an unknown group leaves Ready.
        let group = self.compose.volume_group(group_name)?.clone();
        self.begin(
            EngineState::Ready,
            EngineState::Restarting,
            "engine is not ready",
        )?;
        self.publish_compose_event(event::COMPOSE_EVENT_BEFORE_RESTART);
        let volume_names: Vec<String> =
            group.volumes.iter().map(|v| v.name.clone()).collect();
        let pods = self.compose.find_pods_who_used_volumes(&volume_names);
        let result = self
            .compose
            .restart_pods(&pods, async {
                self.compose.recreate_volumes_with_group(&group).await?;
                Workers::new(self.as_ref())
                    .seed_volume_group(&group, AGENT_TYPE_SWITCH_DATA)
                    .await
            })
            .await;
        self.settle(EngineState::Ready);
        match result {
            Ok(()) => {
                self.publish_compose_event(event::COMPOSE_EVENT_RESTART_SUCCESS);
                Ok(())
            }
            Err(e) => {
                self.publish_compose_event(event::COMPOSE_EVENT_RESTART_FAIL);
                Err(e)
            }
        }
    }

    /// Remove and re-create the named pods and everything depending on them,
    /// preserving volumes.
    pub async fn restart(self: &Arc<Self>, pod_names: &[String]) -> Result<()> {
        for name in pod_names {
            if self.compose.config().pod(name).is_none() {
                return Err(Error::UnknownPod(name.clone()));
            }
        }
        self.begin(
            EngineState::Ready,
            EngineState::Restarting,
            "engine is not ready",
        )?;
        self.publish_compose_event(event::COMPOSE_EVENT_BEFORE_RESTART);
        let result = self.compose.restart_pods(pod_names, async { Ok(()) }).await;
        self.settle(EngineState::Ready);
        match result {
            Ok(()) => {
                self.publish_compose_event(event::COMPOSE_EVENT_RESTART_SUCCESS);
                Ok(())
            }
            Err(e) => {
                self.publish_compose_event(event::COMPOSE_EVENT_RESTART_FAIL);
                Err(e)
            }
        }
    }

    /// Remove every session container except the agent itself, then the
    /// session volumes.
    pub async fn stop(self: &Arc<Self>) -> Result<()> {
        self.begin(
            EngineState::Ready,
            EngineState::Stopping,
            "engine is not ready",
        )?;
        self.publish_compose_event(event::COMPOSE_EVENT_BEFORE_STOP);
        let result = self.stop_inner().await;
        match result {
            Ok(()) => {
                self.settle(EngineState::Stopped);
                self.publish_compose_event(event::COMPOSE_EVENT_AFTER_STOP);
                Ok(())
            }
            Err(e) => {
                self.settle(EngineState::Ready);
                Err(e)
            }
        }
    }

    async fn stop_inner(&self) -> Result<()> {
        let provider = self.compose.provider();
        let session_id = self.compose.session_id();
        let containers = provider.find_containers_by_session(session_id).await?;
        for container in containers {
            let labels = container.labels.unwrap_or_default();
            if labels.get(LABEL_AGENT_TYPE).map(String::as_str) == Some(AGENT_TYPE_SERVER) {
                continue;
            }
            provider
                .remove_container(&container.id.unwrap_or_default())
                .await?;
        }
        for volume in provider.find_volumes_by_session(session_id).await? {
            provider.remove_volume(&volume.name, session_id, true).await?;
        }
        Ok(())
    }

    /// Run a user-triggered task group. Concurrent user triggers are
    /// serialized; each run is a fresh synthetic pod.
    pub async fn run_task_group(self: &Arc<Self>, name: &str) -> Result<()> {
        self.require_ready()?;
        let group = self
            .compose
            .config()
            .task_group(name)
            .ok_or_else(|| Error::Validation(format!("task group:{name} is not exist")))?
            .clone();
        let _serialized = self.task_lock.lock().await;
        self.compose.run_task_group(&group).await?;
        self.publish_compose_event(event::COMPOSE_EVENT_TASK_GROUP_SUCCESS);
        Ok(())
    }

    /// Reconfigure the ingress proxy from `{service: "src:dst"}` mappings.
    pub async fn ingress(self: &Arc<Self>, mappings: &HashMap<String, String>) -> Result<()> {
        self.require_ready()?;
        let parsed = Workers::new(self.as_ref()).prepare_ingress(mappings).await?;
        *self.ingresses.lock().unwrap() = parsed
            .into_iter()
            .map(|(service_name, src, dst)| IngressInfo {
                service_name,
                service_port: src.to_string(),
                host_port: dst.to_string(),
            })
            .collect();
        Ok(())
    }

    /// Schedule a detached cleaner worker; it sweeps everything labelled
    /// with this session, including the agent, but never itself.
    pub fn schedule_cleaner(self: &Arc<Self>) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = Workers::new(this.as_ref()).spawn_cleaner().await {
                error!("failed to spawn cleaner: {e}");
            }
        });
    }

    pub async fn info(&self) -> Result<Info> {
        let provider = self.compose.provider();
        let session_id = self.compose.session_id();

        let mut volume_infos = Vec::new();
        let suffix = format!("_{session_id}");
        for volume in provider.find_volumes_by_session(session_id).await? {
            volume_infos.push(VolumeInfo {
                name: volume
                    .name
                    .strip_suffix(&suffix)
                    .unwrap_or(&volume.name)
                    .to_string(),
                volume_id: volume.name.clone(),
            });
        }

        let mut pods: HashMap<String, Vec<ContainerInfo>> = HashMap::new();
        for container in provider.find_containers_by_session(session_id).await? {
            let labels = container.labels.clone().unwrap_or_default();
            let Some(pod_name) = labels.get(LABEL_POD_NAME) else {
                continue;
            };
            pods.entry(pod_name.clone()).or_default().push(ContainerInfo {
                name: labels
                    .get(LABEL_CONTAINER_NAME)
                    .cloned()
                    .unwrap_or_default(),
                container_id: container.id.unwrap_or_default(),
                state: container.state.unwrap_or_default(),
                image: container.image.unwrap_or_default(),
                created: container.created.unwrap_or_default(),
            });
        }
        let mut pod_infos: Vec<PodInfo> = pods
            .into_iter()
            .map(|(name, container_infos)| PodInfo {
                name,
                container_infos,
            })
            .collect();
        pod_infos.sort_by(|a, b| a.name.cmp(&b.name));

        Ok(Info {
            session_id: session_id.to_string(),
            is_ready: self.state() == EngineState::Ready,
            volume_infos,
            pod_infos,
            ingress_infos: self.ingresses.lock().unwrap().clone(),
        })
    }

    /// Publish a compose lifecycle event and fire every task group
    /// subscribed to it, one synthetic pod per group, in parallel. Task
    /// failures surface on the error topic instead of mutating the engine
    /// state.
    fn publish_compose_event(self: &Arc<Self>, event_type: &str) {
        self.compose.bus().publish(Event::Compose(ComposeEventData {
            r#type: event_type.to_string(),
            event_time: None,
        }));
        for group in self.compose.config().task_groups_for_event(event_type) {
            let group = group.clone();
            let this = Arc::clone(self);
            tokio::spawn(async move {
                if let Err(e) = this.compose.run_task_group(&group).await {
                    this.compose.bus().publish(Event::Error(ErrorData {
                        event_time: None,
                        reason: "TaskGroupFailed".to_string(),
                        message: format!("task group {} failed: {e}", group.name),
                    }));
                }
            });
        }
    }
}

impl ComposeProvider for Starter {
    fn context_path_for_mount(&self) -> &Path {
        self.compose.context_path_for_mount()
    }

    fn docker(&self) -> &Arc<DockerProvider> {
        self.compose.provider()
    }

    fn session_id(&self) -> &str {
        self.compose.session_id()
    }

    fn config(&self) -> &ComposeConfig {
        self.compose.config()
    }

    fn is_ready(&self) -> bool {
        self.state() == EngineState::Ready
    }
}
