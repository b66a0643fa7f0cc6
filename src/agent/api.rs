//! HTTP control plane of the agent.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::future::IntoFuture;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Notify};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::agent::Starter;
use crate::common::{AGENT_HEALTH_ENDPOINT, AGENT_PORT, EVENT_BUS_PORT, SHUTDOWN_GRACE_SECS};
use crate::error::{Error, Result};

struct AppState {
    starter: Arc<Starter>,
    quit: mpsc::Sender<()>,
}

/// Wire-level error envelope: `{"message": …}` with 4xx for user errors and
/// 5xx for internal failures.
struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = if self.0.is_user_error() {
            StatusCode::BAD_REQUEST
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        };
        (status, Json(json!({ "message": self.0.to_string() }))).into_response()
    }
}

type ApiResult = std::result::Result<Json<Value>, ApiError>;

fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route(AGENT_HEALTH_ENDPOINT, get(health))
        .route("/start", post(start))
        .route("/stop", post(stop))
        .route("/restart", post(restart))
        .route("/switch", post(switch_data))
        .route("/taskGroup", post(task_group))
        .route("/ingress", post(ingress))
        .route("/shutdown", post(shutdown))
        .route("/info", get(info_endpoint))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> Json<Value> {
    Json(json!({ "message": "ok" }))
}

async fn start(State(state): State<Arc<AppState>>) -> ApiResult {
    state.starter.start().await?;
    Ok(Json(json!({ "message": "ok" })))
}

async fn stop(State(state): State<Arc<AppState>>) -> ApiResult {
    state.starter.stop().await?;
    Ok(Json(json!({ "message": "stop success" })))
}

async fn restart(
    State(state): State<Arc<AppState>>,
    Json(pod_names): Json<Vec<String>>,
) -> ApiResult {
    state.starter.restart(&pod_names).await?;
    Ok(Json(json!({ "message": "restart ok" })))
}

#[derive(Deserialize)]
struct SwitchDataBody {
    name: String,
}

async fn switch_data(
    State(state): State<Arc<AppState>>,
    Json(body): Json<SwitchDataBody>,
) -> ApiResult {
    state.starter.switch_data(&body.name).await?;
    Ok(Json(json!({ "message": "switch data ok" })))
}

#[derive(Deserialize)]
struct TaskGroupBody {
    name: String,
}

async fn task_group(
    State(state): State<Arc<AppState>>,
    Json(body): Json<TaskGroupBody>,
) -> ApiResult {
    state.starter.run_task_group(&body.name).await?;
    Ok(Json(json!({ "message": "task group ok" })))
}

async fn ingress(
    State(state): State<Arc<AppState>>,
    Json(body): Json<HashMap<String, String>>,
) -> ApiResult {
    state.starter.ingress(&body).await?;
    Ok(Json(json!({ "message": "set ingress ok" })))
}

async fn shutdown(State(state): State<Arc<AppState>>) -> ApiResult {
    state.starter.schedule_cleaner();
    let _ = state.quit.send(()).await;
    Ok(Json(json!({ "message": "shutdown" })))
}

async fn info_endpoint(State(state): State<Arc<AppState>>) -> ApiResult {
    let info = state.starter.info().await?;
    Ok(Json(serde_json::to_value(info).map_err(|e| Error::Other(e.into()))?))
}

/// Run the agent: event-bus TCP fan-out, optional auto-start, then the HTTP
/// server until `/shutdown`, draining handlers within the grace period.
pub async fn serve(starter: Arc<Starter>, auto_start: bool) -> Result<()> {
    starter.compose().bus().serve(EVENT_BUS_PORT).await?;

    if auto_start {
        info!("auto start mode is enabled, starting compose now");
        let autostarter = Arc::clone(&starter);
        tokio::spawn(async move {
            if let Err(e) = autostarter.start().await {
                error!("compose start failed: {e}");
            }
        });
    }

    let (quit_tx, mut quit_rx) = mpsc::channel::<()>(1);
    let state = Arc::new(AppState {
        starter,
        quit: quit_tx,
    });
    let app = router(state);
    let listener = TcpListener::bind(("0.0.0.0", AGENT_PORT)).await?;
    info!("agent listening on :{AGENT_PORT}, event bus on :{EVENT_BUS_PORT}");

    let draining = Arc::new(Notify::new());
    let drain_signal = Arc::clone(&draining);
    let server = axum::serve(listener, app).with_graceful_shutdown(async move {
        let _ = quit_rx.recv().await;
        drain_signal.notify_one();
    });
    let mut handle = tokio::spawn(server.into_future());

    tokio::select! {
        res = &mut handle => {
            res.map_err(|e| Error::Other(e.into()))??;
        }
        _ = draining.notified() => {
            match tokio::time::timeout(Duration::from_secs(SHUTDOWN_GRACE_SECS), &mut handle).await {
                Ok(res) => {
                    res.map_err(|e| Error::Other(e.into()))??;
                }
                Err(_) => {
                    warn!("timeout of {SHUTDOWN_GRACE_SECS} seconds, closing remaining handlers");
                    handle.abort();
                }
            }
        }
    }
    info!("server exiting");
    Ok(())
}
