//! HTTP server inbound adapter that exposes flow execution via REST and SSE.

use std::{convert::Infallible, future::Future, net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{Context as AnyhowContext, Result};
use axum::response::sse::{Event, KeepAlive};
use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response, Sse},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tokio_stream::{
    StreamExt,
    wrappers::{BroadcastStream, errors::BroadcastStreamRecvError},
};
use tracing::{debug, error, info, warn};

use crate::core::{
    domain::ResultStatus,
    error::Error as CoreError,
    ports::{ExecutionService, RunFlowRequest, RunMode, RunResponse},
};

/// Header carrying the requesting user's id.
pub const USER_HEADER: &str = "x-user-id";

/// Configuration options for the server adapter.
#[derive(Debug, Clone)]
pub struct ServeOptions {
    pub default_limit: usize,
    pub keep_alive: Duration,
}

impl Default for ServeOptions {
    fn default() -> Self {
        Self {
            default_limit: 10,
            keep_alive: Duration::from_secs(15),
        }
    }
}

/// Server adapter that exposes the `ExecutionService` via HTTP.
pub struct ServerAdapter {
    service: Arc<dyn ExecutionService>,
    options: ServeOptions,
}

impl ServerAdapter {
    pub fn new(service: Arc<dyn ExecutionService>, options: ServeOptions) -> Self {
        Self { service, options }
    }

    /// Run the HTTP server on the given address until `shutdown` resolves.
    pub async fn run<F>(self, addr: SocketAddr, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind {addr}"))?;
        self.run_with_listener(listener, shutdown).await
    }

    /// Run the HTTP server with an existing listener (useful for tests).
    pub async fn run_with_listener<F>(self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let state = Arc::new(ServeState::new(self.service, self.options));
        let router = build_router(state);
        if let Ok(addr) = listener.local_addr() {
            info!(%addr, "flowbench serve listening");
        } else {
            info!("flowbench serve listening");
        }
        axum::serve(listener, router.into_make_service())
            .with_graceful_shutdown(shutdown)
            .await
            .context("serve endpoint failed")
    }
}

#[derive(Clone)]
struct ServeState {
    service: Arc<dyn ExecutionService>,
    default_limit: usize,
    keep_alive: Duration,
}

impl ServeState {
    fn new(service: Arc<dyn ExecutionService>, options: ServeOptions) -> Self {
        Self {
            service,
            default_limit: options.default_limit.max(1),
            keep_alive: options.keep_alive.max(Duration::from_secs(1)),
        }
    }
}

pub fn build_router_for(service: Arc<dyn ExecutionService>, options: ServeOptions) -> Router {
    build_router(Arc::new(ServeState::new(service, options)))
}

fn build_router(state: Arc<ServeState>) -> Router {
    Router::new()
        .route("/flows/queue/stats", get(queue_stats_handler))
        .route("/flows/{id}/run", post(run_handler))
        .route("/flows/{id}/status", get(status_handler))
        .route("/flows/{id}/results", get(results_handler))
        .route("/flows/{id}/results/{result_id}", get(result_detail_handler))
        .route("/flows/{id}/events", get(events_handler))
        .route("/screenshots/{file}", get(screenshot_handler))
        .with_state(state)
}

/// Every JSON response is wrapped in `{success, data, message}`.
#[derive(Debug, Serialize)]
struct Envelope<T: Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
}

fn ok<T: Serialize>(data: T) -> Response {
    Json(Envelope {
        success: true,
        data: Some(data),
        message: None,
    })
    .into_response()
}

fn reply<T: Serialize>(success: bool, data: Option<T>, message: impl Into<String>) -> Response {
    Json(Envelope {
        success,
        data,
        message: Some(message.into()),
    })
    .into_response()
}

fn failure(err: CoreError) -> Response {
    let status = match &err {
        CoreError::NotFound(_) => StatusCode::NOT_FOUND,
        CoreError::InvalidState(_)
        | CoreError::UnsupportedCategory(_)
        | CoreError::InvalidRepositoryUrl(_) => StatusCode::BAD_REQUEST,
        _ => {
            error!(kind = err.kind(), error = %err, "request failed");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    let body = Envelope::<()> {
        success: false,
        data: None,
        message: Some(err.to_string()),
    };
    (status, Json(body)).into_response()
}

#[derive(Deserialize)]
struct RunQuery {
    #[serde(default)]
    sync: bool,
}

async fn run_handler(
    Path(flow_id): Path<String>,
    Query(query): Query<RunQuery>,
    headers: HeaderMap,
    State(state): State<Arc<ServeState>>,
) -> Response {
    let user_id = headers
        .get(USER_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(String::from);
    let request = RunFlowRequest {
        flow_id,
        user_id,
        mode: if query.sync {
            RunMode::Immediate
        } else {
            RunMode::Queued
        },
    };

    match state.service.request_run(request).await {
        Ok(RunResponse::Queued { job_id }) => reply(
            true,
            Some(json!({ "jobId": job_id })),
            "Test flow queued for execution",
        ),
        Ok(RunResponse::Completed(result)) => {
            let success = result.status == ResultStatus::Success;
            let message = match (&result.error_message, success) {
                (_, true) => "Test flow executed successfully".to_string(),
                (Some(reason), false) => reason.clone(),
                (None, false) => "Test flow execution failed".to_string(),
            };
            reply(success, Some(json!({ "result": result })), message)
        }
        Ok(RunResponse::AlreadyRunning) => {
            reply::<()>(false, None, "Test flow is already running")
        }
        Err(err) => {
            warn!(kind = err.kind(), error = %err, "run request rejected");
            reply::<()>(false, None, err.to_string())
        }
    }
}

async fn status_handler(
    Path(flow_id): Path<String>,
    State(state): State<Arc<ServeState>>,
) -> Response {
    match state.service.flow_status(&flow_id).await {
        Ok(Some(view)) => ok(view),
        Ok(None) => failure(CoreError::NotFound(format!("Flow {flow_id}"))),
        Err(err) => failure(err),
    }
}

#[derive(Deserialize)]
struct PageQuery {
    page: Option<usize>,
    limit: Option<usize>,
}

async fn results_handler(
    Path(flow_id): Path<String>,
    Query(query): Query<PageQuery>,
    State(state): State<Arc<ServeState>>,
) -> Response {
    let page = query.page.unwrap_or(1);
    let limit = query
        .limit
        .filter(|v| *v > 0)
        .unwrap_or(state.default_limit);
    match state.service.list_results(&flow_id, page, limit).await {
        Ok(listing) => ok(listing),
        Err(err) => failure(err),
    }
}

async fn result_detail_handler(
    Path((flow_id, result_id)): Path<(String, String)>,
    State(state): State<Arc<ServeState>>,
) -> Response {
    match state.service.result_detail(&flow_id, &result_id).await {
        Ok(Some(result)) => ok(result),
        Ok(None) => failure(CoreError::NotFound(format!("Result {result_id}"))),
        Err(err) => failure(err),
    }
}

async fn queue_stats_handler(State(state): State<Arc<ServeState>>) -> Response {
    match state.service.queue_stats().await {
        Ok(stats) => ok(stats),
        Err(err) => failure(err),
    }
}

async fn screenshot_handler(
    Path(file): Path<String>,
    State(state): State<Arc<ServeState>>,
) -> Response {
    match state.service.screenshot(&file).await {
        Ok(Some(png)) => ([(header::CONTENT_TYPE, "image/png")], png).into_response(),
        Ok(None) => StatusCode::NOT_FOUND.into_response(),
        Err(err) => failure(err),
    }
}

/// Joins the flow's topic for as long as the client keeps the stream open.
async fn events_handler(
    Path(flow_id): Path<String>,
    State(state): State<Arc<ServeState>>,
) -> impl IntoResponse {
    let receiver = state.service.subscribe(&flow_id);
    debug!(%flow_id, "observer joined");
    let stream = BroadcastStream::new(receiver).filter_map(move |item| match item {
        Ok(event) => match Event::default().event("flowStatus").json_data(&event) {
            Ok(sse) => Some(Ok::<Event, Infallible>(sse)),
            Err(err) => {
                error!(error = %err, "failed to serialize status event");
                None
            }
        },
        Err(BroadcastStreamRecvError::Lagged(missed)) => {
            debug!(missed, "observer lagged behind");
            None
        }
    });

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(state.keep_alive)
            .text("keep-alive"),
    )
}
