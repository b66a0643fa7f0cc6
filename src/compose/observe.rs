//! Container observation loop.
//!
//! A single task inspects every registered container once a second and
//! projects state changes onto the event stream. A state event is published
//! only when the container is new or its status changed since the last
//! report; a container that vanishes from inspect is de-registered; a
//! container that stopped with a non-zero exit code raises an error event.

use crate::docker::{DockerProvider, LABEL_CONTAINER_NAME, LABEL_POD_NAME};
use crate::event::{self, ContainerEventData, ErrorData, Event, EventBus};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;
use tracing::debug;

pub struct Observe {
    ids: Arc<Mutex<HashSet<String>>>,
    started: Once,
}

impl Default for Observe {
    fn default() -> Self {
        Self {
            ids: Arc::new(Mutex::new(HashSet::new())),
            started: Once::new(),
        }
    }
}

struct Seen {
    id: String,
    status: String,
}

impl Observe {
    pub fn new() -> Self {
        Observe::default()
    }

    /// Register a container id for observation.
    pub fn observe_container_id(&self, id: &str) {
        self.ids.lock().unwrap().insert(id.to_string());
    }

    /// Spawn the inspect loop; repeated calls are no-ops.
    pub fn start(&self, provider: Arc<DockerProvider>, bus: Arc<EventBus>) {
        let ids = Arc::clone(&self.ids);
        self.started.call_once(move || {
            tokio::spawn(async move {
                debug!("start observe");
                let mut cache: HashMap<String, Seen> = HashMap::new();
                let mut ticker = tokio::time::interval(Duration::from_secs(1));
                loop {
                    ticker.tick().await;
                    let snapshot: Vec<String> = ids.lock().unwrap().iter().cloned().collect();
                    for id in snapshot {
                        let inspect = match provider.inspect(&id).await {
                            Ok(inspect) => inspect,
                            Err(_) => {
                                ids.lock().unwrap().remove(&id);
                                continue;
                            }
                        };
                        let labels = inspect
                            .config
                            .as_ref()
                            .and_then(|c| c.labels.clone())
                            .unwrap_or_default();
                        let pod_name =
                            labels.get(LABEL_POD_NAME).cloned().unwrap_or_default();
                        let container_name =
                            labels.get(LABEL_CONTAINER_NAME).cloned().unwrap_or_default();
                        let name = inspect.name.clone().unwrap_or_default();
                        let state = inspect.state.clone();
                        let status = state
                            .as_ref()
                            .and_then(|s| s.status)
                            .map(|s| s.to_string())
                            .unwrap_or_default();

                        if status_changed(&mut cache, &name, &id, &status) {
                            bus.publish(Event::Container(ContainerEventData {
                                name: name.clone(),
                                image: inspect.image.clone().unwrap_or_default(),
                                id: id.clone(),
                                r#type: event::CONTAINER_EVENT_STATE.to_string(),
                                event_time: None,
                                state: state.clone(),
                                container_name: container_name.clone(),
                                pod_name: pod_name.clone(),
                            }));
                        }
                        let running = state.as_ref().and_then(|s| s.running).unwrap_or(false);
                        let exit_code = state.as_ref().and_then(|s| s.exit_code).unwrap_or(0);
                        if !running && exit_code != 0 {
                            bus.publish(Event::Error(ErrorData {
                                event_time: None,
                                reason: "ErrorExitCode".to_string(),
                                message: format!(
                                    "Pod [{pod_name}] Container [{container_name}] is dead and exit code is not 0"
                                ),
                            }));
                        }
                    }
                }
            });
        });
    }
}

fn status_changed(
    cache: &mut HashMap<String, Seen>,
    name: &str,
    id: &str,
    status: &str,
) -> bool {
    match cache.get_mut(name) {
        Some(seen) if seen.id == id && seen.status == status => false,
        Some(seen) => {
            seen.id = id.to_string();
            seen.status = status.to_string();
            true
        }
        None => {
            cache.insert(
                name.to_string(),
                Seen {
                    id: id.to_string(),
                    status: status.to_string(),
                },
            );
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_report_and_changes_pass_repeats_are_dropped() {
        let mut cache = HashMap::new();
        assert!(status_changed(&mut cache, "/db_pg", "id1", "running"));
        assert!(!status_changed(&mut cache, "/db_pg", "id1", "running"));
        assert!(!status_changed(&mut cache, "/db_pg", "id1", "running"));
        assert!(status_changed(&mut cache, "/db_pg", "id1", "exited"));
        // A recreated container under the same name reports again.
        assert!(status_changed(&mut cache, "/db_pg", "id2", "exited"));
    }
}
