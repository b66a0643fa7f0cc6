//! Typed event stream.
//!
//! Every lifecycle step publishes a typed payload on one of six topics. The
//! bus fans the JSON envelope out in-process over a broadcast channel; the
//! agent additionally serves the same envelopes as JSON lines to TCP
//! subscribers on the event-bus port.

use bollard::models::ContainerState;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{debug, warn};

pub const TOPIC_COMPOSE: &str = "compose";
pub const TOPIC_POD: &str = "pod";
pub const TOPIC_CONTAINER: &str = "container";
pub const TOPIC_TASK_GROUP: &str = "taskGroup";
pub const TOPIC_TASK: &str = "task";
pub const TOPIC_ERROR: &str = "error";

pub const COMPOSE_EVENT_BEFORE_START: &str = "compose_event_before_start";
pub const COMPOSE_EVENT_START_SUCCESS: &str = "compose_event_start_success";
pub const COMPOSE_EVENT_START_FAIL: &str = "compose_event_start_fail";
pub const COMPOSE_EVENT_BEFORE_RESTART: &str = "compose_event_before_restart";
pub const COMPOSE_EVENT_RESTART_SUCCESS: &str = "compose_event_restart_success";
pub const COMPOSE_EVENT_RESTART_FAIL: &str = "compose_event_restart_fail";
pub const COMPOSE_EVENT_BEFORE_STOP: &str = "compose_event_before_stop";
pub const COMPOSE_EVENT_AFTER_STOP: &str = "compose_event_after_stop";
pub const COMPOSE_EVENT_TASK_GROUP_SUCCESS: &str = "compose_event_task_group_success";

pub const POD_EVENT_START: &str = "start";
pub const POD_EVENT_READY: &str = "ready";

pub const CONTAINER_EVENT_PULL_START: &str = "container_event_pull_start";
pub const CONTAINER_EVENT_PULL_SUCCESS: &str = "container_event_pull_success";
pub const CONTAINER_EVENT_PULL_FAIL: &str = "container_event_pull_fail";
pub const CONTAINER_EVENT_CREATED: &str = "container_event_container_created";
pub const CONTAINER_EVENT_START: &str = "container_event_container_start";
pub const CONTAINER_EVENT_READY: &str = "container_event_container_ready";
pub const CONTAINER_EVENT_REMOVE: &str = "container_event_container_remove";
pub const CONTAINER_EVENT_STATE: &str = "container_event_container_state";

pub const TASK_GROUP_EVENT_START: &str = "task_group_event_start";
pub const TASK_GROUP_EVENT_SUCCESS: &str = "task_group_event_success";

pub const TASK_EVENT_START: &str = "task_event_start";
pub const TASK_EVENT_SUCCESS: &str = "task_event_success";

#[derive(Debug, Clone, Serialize, Default)]
#[serde(rename_all = "PascalCase")]
pub struct ComposeEventData {
    pub r#type: String,
    pub event_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Default)]
#[serde(rename_all = "PascalCase")]
pub struct PodEventData {
    pub name: String,
    pub r#type: String,
    pub event_time: Option<DateTime<Utc>>,
    pub pod_name: String,
}

#[derive(Debug, Clone, Serialize, Default)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerEventData {
    pub name: String,
    pub image: String,
    pub id: String,
    pub r#type: String,
    pub event_time: Option<DateTime<Utc>>,
    pub state: Option<ContainerState>,
    pub container_name: String,
    pub pod_name: String,
}

#[derive(Debug, Clone, Serialize, Default)]
#[serde(rename_all = "PascalCase")]
pub struct TaskGroupEventData {
    pub r#type: String,
    pub task_group_name: String,
    pub event_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Default)]
#[serde(rename_all = "PascalCase")]
pub struct TaskEventData {
    pub r#type: String,
    pub task_group_name: String,
    pub task_name: String,
    pub event_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Default)]
#[serde(rename_all = "PascalCase")]
pub struct ErrorData {
    pub event_time: Option<DateTime<Utc>>,
    pub reason: String,
    pub message: String,
}

#[derive(Debug, Clone)]
pub enum Event {
    Compose(ComposeEventData),
    Pod(PodEventData),
    Container(ContainerEventData),
    TaskGroup(TaskGroupEventData),
    Task(TaskEventData),
    Error(ErrorData),
}

impl Event {
    pub fn topic(&self) -> &'static str {
        match self {
            Event::Compose(_) => TOPIC_COMPOSE,
            Event::Pod(_) => TOPIC_POD,
            Event::Container(_) => TOPIC_CONTAINER,
            Event::TaskGroup(_) => TOPIC_TASK_GROUP,
            Event::Task(_) => TOPIC_TASK,
            Event::Error(_) => TOPIC_ERROR,
        }
    }

    fn stamp(&mut self, now: DateTime<Utc>) {
        match self {
            Event::Compose(d) => d.event_time = Some(now),
            Event::Pod(d) => d.event_time = Some(now),
            Event::Container(d) => d.event_time = Some(now),
            Event::TaskGroup(d) => d.event_time = Some(now),
            Event::Task(d) => d.event_time = Some(now),
            Event::Error(d) => d.event_time = Some(now),
        }
    }
}

/// Wire envelope: the topic plus exactly one typed payload.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct EventMsg {
    pub topic: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compose_event_data: Option<ComposeEventData>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pod_event_data: Option<PodEventData>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_event_data: Option<ContainerEventData>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_group_event_data: Option<TaskGroupEventData>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_event_data: Option<TaskEventData>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_data: Option<ErrorData>,
}

impl EventMsg {
    fn new(event: Event) -> Self {
        let mut msg = EventMsg {
            topic: event.topic().to_string(),
            compose_event_data: None,
            pod_event_data: None,
            container_event_data: None,
            task_group_event_data: None,
            task_event_data: None,
            error_data: None,
        };
        match event {
            Event::Compose(d) => msg.compose_event_data = Some(d),
            Event::Pod(d) => msg.pod_event_data = Some(d),
            Event::Container(d) => msg.container_event_data = Some(d),
            Event::TaskGroup(d) => msg.task_group_event_data = Some(d),
            Event::Task(d) => msg.task_event_data = Some(d),
            Event::Error(d) => msg.error_data = Some(d),
        }
        msg
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

pub struct EventBus {
    tx: broadcast::Sender<EventMsg>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(256);
        EventBus { tx }
    }

    pub fn publish(&self, mut event: Event) {
        event.stamp(Utc::now());
        let msg = EventMsg::new(event);
        debug!(topic = %msg.topic, "event: {}", msg.to_json());
        // No receivers is fine: the stream is publish-only.
        let _ = self.tx.send(msg);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventMsg> {
        self.tx.subscribe()
    }

    /// Serve the stream as JSON lines to every TCP subscriber.
    pub async fn serve(self: &Arc<Self>, port: u16) -> std::io::Result<()> {
        let listener = TcpListener::bind(("0.0.0.0", port)).await?;
        let bus = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let (mut socket, peer) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!("event bus accept failed: {e}");
                        continue;
                    }
                };
                debug!("event bus subscriber connected: {peer}");
                let mut rx = bus.subscribe();
                tokio::spawn(async move {
                    loop {
                        match rx.recv().await {
                            Ok(msg) => {
                                let mut line = msg.to_json();
                                line.push('\n');
                                if socket.write_all(line.as_bytes()).await.is_err() {
                                    break;
                                }
                            }
                            Err(broadcast::error::RecvError::Lagged(_)) => continue,
                            Err(broadcast::error::RecvError::Closed) => break,
                        }
                    }
                });
            }
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_carries_only_its_topic_payload() {
        let msg = EventMsg::new(Event::Pod(PodEventData {
            name: "db".into(),
            r#type: POD_EVENT_READY.into(),
            event_time: None,
            pod_name: "db".into(),
        }));
        let json = msg.to_json();
        assert!(json.contains("\"Topic\":\"pod\""));
        assert!(json.contains("\"Type\":\"ready\""));
        assert!(!json.contains("ContainerEventData"));
        assert!(!json.contains("ErrorData"));
    }

    #[tokio::test]
    async fn publish_stamps_event_time_and_fans_out() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.publish(Event::Error(ErrorData {
            event_time: None,
            reason: "ErrorExitCode".into(),
            message: "boom".into(),
        }));
        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.topic, TOPIC_ERROR);
        assert!(msg.error_data.unwrap().event_time.is_some());
    }
}
