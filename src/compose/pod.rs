//! Pod engine: pause-container pods, ordered container start, per-layer
//! concurrent creation and selective restart.

use futures::future::try_join_all;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::common::{CONTAINER_NAME_PREFIX, EXIT_TIMEOUT_SECS};
use crate::compose::depend::{build_layers, impact_closure};
use crate::compose::observe::Observe;
use crate::config::{self, ContainerConfig, PodConfig, TaskGroup};
use crate::docker::wait::{WaitStrategy, DEFAULT_POLL_INTERVAL, DEFAULT_STARTUP_TIMEOUT};
use crate::docker::{
    ContainerHandle, ContainerMount, ContainerRequest, DockerProvider, LABEL_CONTAINER_NAME,
    LABEL_POD_NAME,
};
use crate::error::Result;
use crate::event::{
    self, Event, EventBus, PodEventData, TaskEventData, TaskGroupEventData,
};

pub struct PodCompose {
    session_id: String,
    layers: Vec<Vec<String>>,
    pods: HashMap<String, PodConfig>,
    network: String,
    provider: Arc<DockerProvider>,
    bus: Arc<EventBus>,
    observe: Observe,
    host_context_path: PathBuf,
}

impl PodCompose {
    pub fn new(
        session_id: String,
        pods: Vec<PodConfig>,
        network: String,
        host_context_path: PathBuf,
        provider: Arc<DockerProvider>,
        bus: Arc<EventBus>,
    ) -> Result<Self> {
        let layers = build_layers(&pods)?;
        let pods = pods.into_iter().map(|p| (p.name.clone(), p)).collect();
        Ok(PodCompose {
            session_id,
            layers,
            pods,
            network,
            provider,
            bus,
            observe: Observe::new(),
            host_context_path,
        })
    }

    pub fn layers(&self) -> &[Vec<String>] {
        &self.layers
    }

    pub fn has_pod(&self, name: &str) -> bool {
        self.pods.contains_key(name)
    }

    /// Start the whole graph, one layer at a time. Layer `i+1` begins only
    /// after every pod of layer `i` reported ready.
    pub async fn start(&self) -> Result<()> {
        self.observe
            .start(Arc::clone(&self.provider), Arc::clone(&self.bus));
        for layer in &self.layers {
            self.concurrency_create_pods(layer).await?;
        }
        Ok(())
    }

    /// Create all named pods concurrently. The first failure cancels the
    /// remaining creations and becomes the layer's error.
    async fn concurrency_create_pods(&self, names: &[String]) -> Result<()> {
        try_join_all(names.iter().map(|name| self.create_pod(&self.pods[name]))).await?;
        Ok(())
    }

    /// Create one pod: pause container first, then init containers run to a
    /// successful exit one at a time, then the main containers in declared
    /// order, each waiting out its readiness probe before the next starts.
    async fn create_pod(&self, pod: &PodConfig) -> Result<()> {
        self.bus.publish(Event::Pod(PodEventData {
            name: pod.name.clone(),
            r#type: event::POD_EVENT_START.to_string(),
            event_time: None,
            pod_name: pod.name.clone(),
        }));

        debug!("start pod: {} pause container", pod.name);
        let pause = self
            .provider
            .run_container(
                ContainerRequest {
                    name: format!(
                        "{CONTAINER_NAME_PREFIX}{}_pause_{}",
                        pod.name, self.session_id
                    ),
                    image: config::images().pause,
                    networks: vec![
                        self.provider.default_network().to_string(),
                        self.network.clone(),
                    ],
                    network_aliases: HashMap::from([(
                        self.network.clone(),
                        vec![pod.name.clone()],
                    )]),
                    dns: pod.dns.clone(),
                    labels: pod_labels(&pod.name, "pause"),
                    ..Default::default()
                },
                &self.session_id,
            )
            .await?;

        let mut steady = vec![pause.id.clone()];
        for container in &pod.init_containers {
            debug!("start pod: {} init container: {}", pod.name, container.name);
            let init = self
                .run_container(&pod.name, true, container, &pause.id)
                .await?;
            // Init containers are not part of steady-state membership.
            self.provider.remove_container(&init.id).await?;
        }
        for container in &pod.containers {
            debug!("start pod: {} container: {}", pod.name, container.name);
            let handle = self
                .run_container(&pod.name, false, container, &pause.id)
                .await?;
            steady.push(handle.id);
        }
        for id in &steady {
            self.observe.observe_container_id(id);
        }

        self.bus.publish(Event::Pod(PodEventData {
            name: pod.name.clone(),
            r#type: event::POD_EVENT_READY.to_string(),
            event_time: None,
            pod_name: pod.name.clone(),
        }));
        Ok(())
    }

    /// Probes address the pod's network alias: containers in the pause netns
    /// publish no host ports, but the agent sits on the session network.
    fn create_waiting_for(is_init: bool, c: &ContainerConfig, pod_name: &str) -> Option<WaitStrategy> {
        if is_init {
            return Some(
                WaitStrategy::for_exit()
                    .with_exit_code(0)
                    .with_poll_interval(Duration::from_secs(1))
                    .with_exit_timeout(Duration::from_secs(EXIT_TIMEOUT_SECS))
                    .into(),
            );
        }
        let waiting_for = c.waiting_for.as_ref()?;
        let poll = if waiting_for.period_seconds == 0 {
            DEFAULT_POLL_INTERVAL
        } else {
            Duration::from_secs(waiting_for.period_seconds)
        };
        let timeout = if waiting_for.initial_delay_seconds == 0 {
            DEFAULT_STARTUP_TIMEOUT
        } else {
            Duration::from_secs(waiting_for.initial_delay_seconds)
        };
        let mut strategies = Vec::new();
        if let Some(http) = &waiting_for.http_get {
            strategies.push(
                WaitStrategy::for_http(http.path.clone(), http.port)
                    .with_method(http.method.clone())
                    .with_network_alias(pod_name)
                    .with_poll_interval(poll)
                    .with_startup_timeout(timeout)
                    .into(),
            );
        }
        if let Some(tcp) = &waiting_for.tcp_socket {
            strategies.push(
                WaitStrategy::for_listening_port(tcp.port)
                    .with_network_alias(pod_name)
                    .with_poll_interval(poll)
                    .with_startup_timeout(timeout)
                    .into(),
            );
        }
        match strategies.len() {
            0 => None,
            1 => strategies.pop(),
            _ => Some(WaitStrategy::all(strategies)),
        }
    }

    /// Run one container inside the pod's network namespace.
    async fn run_container(
        &self,
        pod_name: &str,
        is_init: bool,
        c: &ContainerConfig,
        pause_id: &str,
    ) -> Result<ContainerHandle> {
        let mut mounts = Vec::new();
        for vm in &c.volume_mounts {
            mounts.push(ContainerMount::volume(
                format!("{}_{}", vm.name, self.session_id),
                vm.mount_path.clone(),
            ));
        }
        for bm in &c.bind_mounts {
            // Relative host paths are rebased onto the host-visible workspace
            // so they stay valid in the engine's namespace even though this
            // process runs inside a container.
            let host_path = if bm.host_path.starts_with('.') {
                self.host_context_path
                    .join(&bm.host_path)
                    .to_string_lossy()
                    .into_owned()
            } else {
                bm.host_path.clone()
            };
            mounts.push(ContainerMount::bind(host_path, bm.mount_path.clone()));
        }
        let (cap_add, cap_drop) = match &c.cap {
            Some(cap) => (cap.add.clone(), cap.drop.clone()),
            None => (Vec::new(), Vec::new()),
        };
        self.provider
            .run_container(
                ContainerRequest {
                    name: format!(
                        "{CONTAINER_NAME_PREFIX}{}_{}_{}",
                        pod_name, c.name, self.session_id
                    ),
                    image: c.image.clone(),
                    cmd: c.command.clone(),
                    env: c.env.clone(),
                    privileged: c.privileged,
                    always_pull_image: c.always_pull_image,
                    network_mode: Some(format!("container:{pause_id}")),
                    mounts,
                    cap_add,
                    cap_drop,
                    user: c.user.clone(),
                    working_dir: c.working_dir.clone(),
                    waiting_for: Self::create_waiting_for(is_init, c, pod_name),
                    labels: pod_labels(pod_name, &c.name),
                    ..Default::default()
                },
                &self.session_id,
            )
            .await
    }

    /// Restart the impact closure of `names`: remove every container of the
    /// closure, run `before_start` (data swaps recreate volumes there), then
    /// re-create the affected pods walking the original layer order.
    pub async fn restart_pods<F>(&self, names: &[String], before_start: F) -> Result<()>
    where
        F: std::future::Future<Output = Result<()>>,
    {
        let closure = impact_closure(&self.pods, names);
        let containers = self
            .provider
            .find_containers_by_session(&self.session_id)
            .await?;
        for container in containers {
            let labels = container.labels.unwrap_or_default();
            let owner = labels.get(LABEL_POD_NAME).map(String::as_str).unwrap_or("");
            if closure.contains(owner) {
                self.provider
                    .remove_container(&container.id.unwrap_or_default())
                    .await?;
            }
        }
        before_start.await?;
        for layer in &self.layers {
            let targets: Vec<String> = layer
                .iter()
                .filter(|name| closure.contains(*name))
                .cloned()
                .collect();
            if !targets.is_empty() {
                self.concurrency_create_pods(&targets).await?;
            }
        }
        Ok(())
    }

    /// Pods whose containers (init or main) mount any of the given volumes.
    pub fn find_pods_who_used_volumes(&self, volume_names: &[String]) -> Vec<String> {
        pods_using_volumes(&self.pods, volume_names)
    }

    /// Run a task group as a synthetic pod named after the group: a pause
    /// container plus each task waited to a clean exit, then torn down.
    pub async fn run_task_group(&self, group: &TaskGroup) -> Result<()> {
        self.bus.publish(Event::TaskGroup(TaskGroupEventData {
            r#type: event::TASK_GROUP_EVENT_START.to_string(),
            task_group_name: group.name.clone(),
            event_time: None,
        }));

        let pause = self
            .provider
            .run_container(
                ContainerRequest {
                    name: format!(
                        "{CONTAINER_NAME_PREFIX}{}_pause_{}",
                        group.name, self.session_id
                    ),
                    image: config::images().pause,
                    networks: vec![
                        self.provider.default_network().to_string(),
                        self.network.clone(),
                    ],
                    network_aliases: HashMap::from([(
                        self.network.clone(),
                        vec![group.name.clone()],
                    )]),
                    labels: pod_labels(&group.name, "pause"),
                    ..Default::default()
                },
                &self.session_id,
            )
            .await?;

        let mut created = Vec::new();
        let run = async {
            for task in &group.tasks {
                self.bus.publish(Event::Task(TaskEventData {
                    r#type: event::TASK_EVENT_START.to_string(),
                    task_group_name: group.name.clone(),
                    task_name: task.name.clone(),
                    event_time: None,
                }));
                let handle = self
                    .run_container(&group.name, true, task, &pause.id)
                    .await?;
                created.push(handle.id);
                self.bus.publish(Event::Task(TaskEventData {
                    r#type: event::TASK_EVENT_SUCCESS.to_string(),
                    task_group_name: group.name.clone(),
                    task_name: task.name.clone(),
                    event_time: None,
                }));
            }
            Ok(())
        };
        let result: Result<()> = run.await;

        for id in &created {
            let _ = self.provider.remove_container(id).await;
        }
        let _ = self.provider.remove_container(&pause.id).await;

        result?;
        self.bus.publish(Event::TaskGroup(TaskGroupEventData {
            r#type: event::TASK_GROUP_EVENT_SUCCESS.to_string(),
            task_group_name: group.name.clone(),
            event_time: None,
        }));
        Ok(())
    }
}

fn pod_labels(pod_name: &str, container_name: &str) -> HashMap<String, String> {
    HashMap::from([
        (LABEL_POD_NAME.to_string(), pod_name.to_string()),
        (LABEL_CONTAINER_NAME.to_string(), container_name.to_string()),
    ])
}

fn pods_using_volumes(
    pods: &HashMap<String, PodConfig>,
    volume_names: &[String],
) -> Vec<String> {
    let wanted: HashSet<&str> = volume_names.iter().map(String::as_str).collect();
    let mut result = Vec::new();
    for pod in pods.values() {
        let mounts_any = pod
            .containers
            .iter()
            .chain(pod.init_containers.iter())
            .flat_map(|c| c.volume_mounts.iter())
            .any(|vm| wanted.contains(vm.name.as_str()));
        if mounts_any {
            result.push(pod.name.clone());
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PodConfig, VolumeMountConfig};

    fn pod_with_mount(name: &str, volume: &str, init: bool) -> PodConfig {
        let container = ContainerConfig {
            name: "main".into(),
            image: "busybox".into(),
            volume_mounts: vec![VolumeMountConfig {
                name: volume.into(),
                mount_path: "/data".into(),
            }],
            ..Default::default()
        };
        let mut pod = PodConfig {
            name: name.to_string(),
            ..Default::default()
        };
        if init {
            pod.init_containers.push(container);
        } else {
            pod.containers.push(container);
        }
        pod
    }

    #[test]
    fn volume_users_cover_init_and_main_containers() {
        let pods: HashMap<String, PodConfig> = vec![
            pod_with_mount("a", "work_dir", false),
            pod_with_mount("b", "work_dir", true),
            pod_with_mount("c", "other", false),
        ]
        .into_iter()
        .map(|p| (p.name.clone(), p))
        .collect();
        let mut users = pods_using_volumes(&pods, &["work_dir".to_string()]);
        users.sort();
        assert_eq!(users, vec!["a", "b"]);
    }

    #[test]
    fn init_wait_is_exit_zero_with_deadline() {
        let c = ContainerConfig::default();
        match PodCompose::create_waiting_for(true, &c, "db") {
            Some(WaitStrategy::Exit(wait)) => {
                assert_eq!(wait.exit_code, Some(0));
                assert_eq!(wait.exit_timeout, Some(Duration::from_secs(60)));
            }
            other => panic!("expected exit strategy, got {other:?}"),
        }
    }

    #[test]
    fn main_wait_probes_the_pod_alias() {
        use crate::config::{TcpSocketConfig, WaitingForConfig};
        let mut c = ContainerConfig::default();
        assert!(PodCompose::create_waiting_for(false, &c, "web").is_none());

        c.waiting_for = Some(WaitingForConfig {
            tcp_socket: Some(TcpSocketConfig { port: 80 }),
            initial_delay_seconds: 30,
            period_seconds: 2,
            ..Default::default()
        });
        match PodCompose::create_waiting_for(false, &c, "web") {
            Some(WaitStrategy::Tcp(wait)) => {
                assert_eq!(wait.port, 80);
                assert_eq!(wait.network_alias.as_deref(), Some("web"));
                assert_eq!(wait.startup_timeout, Duration::from_secs(30));
                assert_eq!(wait.poll_interval, Duration::from_secs(2));
            }
            other => panic!("expected tcp strategy, got {other:?}"),
        }
    }
}
