//! Web server entrypoints live here.

use std::{convert::Infallible, future::Future, net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    Json, Router,
    body::Body,
    extract::{Path, Query, State},
    http::{Request, StatusCode},
    response::{
        IntoResponse,
        sse::{Event, KeepAlive, Sse},
    },
    routing::{get, post},
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::{net::TcpListener, sync::watch};
use tokio_stream::{
    Stream, StreamExt,
    wrappers::{BroadcastStream, errors::BroadcastStreamRecvError},
};
use tower_http::{
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};

use marketsnap_app::services::{
    BatchContext, BatchProcessor, BatchStore, BatchStoreError, DedupFilter, StoredEvent,
    UploadLedger, intake_files,
};

const HEALTHZ_PATH: &str = "/v1/healthz";
const BATCHES_PATH: &str = "/v1/batches";
const EVENTS_PATH: &str = "/v1/batches/{id}/events";
const ABANDON_PATH: &str = "/v1/batches/{id}/abandon";
const SKIP_PATH: &str = "/v1/batches/{id}/skip";
const HEALTHZ_STATUS: &str = "ok";
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);
const ERROR_INVALID_PARAMETER: &str = "invalid_parameter";
const ERROR_NOT_FOUND: &str = "not_found";
const REQUEST_ID_HEADER: &str = "x-request-id";

#[derive(Debug, Serialize, Copy, Clone, PartialEq, Eq)]
struct HealthzResponse {
    status: &'static str,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum ShutdownEvent {
    Pending,
    CtrlC,
    SigTerm,
    ListenerFailed,
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("listen address may not be empty")]
    EmptyListenAddr,
    #[error("invalid listen address `{address}`: {source}")]
    InvalidListenAddr {
        address: String,
        #[source]
        source: std::net::AddrParseError,
    },
    #[error("failed to bind to {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to determine local address: {source}")]
    LocalAddr {
        #[source]
        source: std::io::Error,
    },
    #[error("axum server error: {source}")]
    Serve {
        #[source]
        source: std::io::Error,
    },
}

/// Shared wiring behind every route: the batch registry plus the
/// orchestration pieces a submission needs.
#[derive(Clone)]
pub struct AppState {
    store: Arc<BatchStore>,
    processor: Arc<BatchProcessor>,
    dedup: Arc<DedupFilter>,
}

impl AppState {
    pub fn new(
        store: Arc<BatchStore>,
        processor: Arc<BatchProcessor>,
        ledger: Arc<dyn UploadLedger>,
    ) -> Self {
        Self {
            store,
            processor,
            dedup: Arc::new(DedupFilter::new(ledger)),
        }
    }

    pub fn store(&self) -> &Arc<BatchStore> {
        &self.store
    }
}

#[derive(Debug, Clone, Serialize)]
struct ApiErrorBody {
    error: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    field: Option<String>,
}

#[derive(Debug, Clone)]
struct ApiError {
    status: StatusCode,
    body: ApiErrorBody,
}

impl ApiError {
    fn new(status: StatusCode, error: &'static str, message: impl Into<String>) -> Self {
        ApiError {
            status,
            body: ApiErrorBody {
                error,
                message: message.into(),
                field: None,
            },
        }
    }

    fn invalid_param(field: &str, message: impl Into<String>) -> Self {
        debug_assert!(!field.is_empty());
        let mut api = ApiError::new(StatusCode::BAD_REQUEST, ERROR_INVALID_PARAMETER, message);
        api.body.field = Some(field.to_string());
        api
    }

    fn resource_not_found(path: &str) -> Self {
        debug_assert!(path.starts_with('/'));
        ApiError::new(
            StatusCode::NOT_FOUND,
            ERROR_NOT_FOUND,
            format!("resource `{path}` not found"),
        )
    }
}

impl From<BatchStoreError> for ApiError {
    fn from(error: BatchStoreError) -> Self {
        ApiError::new(StatusCode::NOT_FOUND, ERROR_NOT_FOUND, error.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        (self.status, Json(self.body)).into_response()
    }
}

#[derive(Debug, Deserialize)]
struct SubmitRequest {
    files: Vec<std::path::PathBuf>,
    #[serde(default)]
    uploader: Option<String>,
    #[serde(default)]
    partition: Option<String>,
}

#[derive(Debug, Serialize)]
struct SubmitResponse {
    id: String,
    file_count: usize,
    duplicate_count: usize,
}

#[derive(Debug, Deserialize)]
struct EventsQuery {
    #[serde(default)]
    last_index: Option<u64>,
}

pub fn build_api_router(state: AppState) -> Router {
    debug_assert!(HEALTHZ_PATH.starts_with("/v1/"));

    Router::new()
        .route(HEALTHZ_PATH, get(healthz))
        .route(BATCHES_PATH, post(submit_batch))
        .route(EVENTS_PATH, get(batch_events))
        .route(ABANDON_PATH, post(abandon_batch))
        .route(SKIP_PATH, post(skip_batch))
        .fallback(not_found_handler)
        .with_state(state)
}

pub async fn serve(listen_addr: &str, state: AppState) -> Result<(), ServerError> {
    debug_assert!(!listen_addr.contains('\n'));

    let addr = parse_listen_addr(listen_addr)?;
    let listener = bind_listener(addr).await?;
    let local_addr = listener
        .local_addr()
        .map_err(|source| ServerError::LocalAddr { source })?;
    tracing::info!(%local_addr, "marketsnap server listening");

    let (shutdown_tx, shutdown_rx) = watch::channel(ShutdownEvent::Pending);
    let shutdown_future = broadcast_shutdown(shutdown_tx);

    let app = build_app_router(state);
    let mut server_future = Box::pin(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_future)
            .await
    });
    let mut drain_timeout = Box::pin(drain_timeout_future(shutdown_rx.clone()));

    tokio::select! {
        result = server_future.as_mut() => {
            if let Err(source) = result {
                return Err(ServerError::Serve { source });
            }
        }
        _ = drain_timeout.as_mut() => {
            // Timeout elapsed; dropping the server future forces termination.
        }
    }

    let final_event = *shutdown_rx.borrow();
    if final_event == ShutdownEvent::Pending {
        tracing::info!("server stopped without external shutdown signal");
    } else {
        tracing::info!(?final_event, "server shutdown complete");
    }
    Ok(())
}

fn build_app_router(state: AppState) -> Router {
    let trace_layer = TraceLayer::new_for_http();
    let request_id_header = axum::http::HeaderName::from_static(REQUEST_ID_HEADER);
    build_api_router(state)
        .layer(trace_layer)
        .layer(PropagateRequestIdLayer::new(request_id_header.clone()))
        .layer(SetRequestIdLayer::new(
            request_id_header,
            MakeRequestUuid::default(),
        ))
}

/// Intake and register a batch, then run it in the background. Processing
/// outcome is observed through the event stream, not this response.
async fn submit_batch(
    State(state): State<AppState>,
    Json(request): Json<SubmitRequest>,
) -> Result<(StatusCode, Json<SubmitResponse>), ApiError> {
    if request.files.is_empty() {
        return Err(ApiError::invalid_param("files", "must not be empty"));
    }
    let mut files = intake_files(&request.files)
        .await
        .map_err(|err| ApiError::invalid_param("files", err.to_string()))?;
    let duplicate_count = state
        .dedup
        .mark_duplicates(&mut files, Utc::now().date_naive())
        .await
        .map_err(|err| {
            tracing::error!(%err, "duplicate lookup failed");
            ApiError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_server_error",
                "duplicate lookup failed",
            )
        })?;
    let file_count = files.len();

    let handle = state.store.create(
        files,
        BatchContext {
            uploader: request.uploader,
            partition: request.partition,
        },
    );
    let id = handle.id().to_string();
    let processor = Arc::clone(&state.processor);
    tokio::spawn(async move {
        if let Err(error) = processor.run(handle).await {
            tracing::error!(%error, "batch run ended in orchestration failure");
        }
    });

    Ok((
        StatusCode::ACCEPTED,
        Json(SubmitResponse {
            id,
            file_count,
            duplicate_count,
        }),
    ))
}

/// SSE stream for one batch. Settled events strictly after `last_index`
/// are replayed first; live events whose index was already replayed are
/// dropped, so a reconnecting client never sees a duplicate index.
async fn batch_events(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<EventsQuery>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let handle = state.store.get(&id)?;
    let (replay, rx) = handle.events().subscribe_from(query.last_index);
    let mut next_index = replay
        .last()
        .map(|stored| stored.index + 1)
        .unwrap_or_else(|| query.last_index.map_or(0, |seen| seen + 1));

    let replayed = tokio_stream::iter(replay.into_iter().map(sse_event));
    let live = BroadcastStream::new(rx).filter_map(move |item| match item {
        Ok(stored) if stored.index >= next_index => {
            next_index = stored.index + 1;
            Some(sse_event(stored))
        }
        Ok(_) => None,
        Err(BroadcastStreamRecvError::Lagged(missed)) => {
            // The log still holds what the channel dropped; clients resume
            // with `last_index` to recover.
            tracing::warn!(batch = %id, missed, "event subscriber lagged");
            None
        }
    });

    Ok(Sse::new(replayed.chain(live)).keep_alive(KeepAlive::default()))
}

fn sse_event(stored: StoredEvent) -> Result<Event, Infallible> {
    let id = stored.index.to_string();
    let data = serde_json::to_string(&stored).unwrap_or_else(|err| {
        tracing::error!(%err, "event failed to serialize");
        "{}".to_string()
    });
    Ok(Event::default().id(id).data(data))
}

async fn abandon_batch(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.store.abandon(&id)?;
    tracing::info!(batch = %id, "abandon requested");
    Ok(StatusCode::ACCEPTED)
}

async fn skip_batch(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.store.skip(&id)?;
    tracing::info!(batch = %id, "skip requested");
    Ok(StatusCode::ACCEPTED)
}

async fn healthz() -> impl IntoResponse {
    Json(HealthzResponse {
        status: HEALTHZ_STATUS,
    })
}

async fn not_found_handler(request: Request<Body>) -> axum::response::Response {
    debug_assert!(request.uri().path().starts_with('/'));
    ApiError::resource_not_found(request.uri().path()).into_response()
}

async fn wait_for_shutdown() -> ShutdownEvent {
    let ctrl_c = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => ShutdownEvent::CtrlC,
            Err(error) => {
                tracing::warn!(%error, "failed to capture Ctrl+C signal");
                ShutdownEvent::ListenerFailed
            }
        }
    };

    #[cfg(unix)]
    let sigterm = async {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => match term.recv().await {
                Some(_) => ShutdownEvent::SigTerm,
                None => ShutdownEvent::ListenerFailed,
            },
            Err(error) => {
                tracing::warn!(%error, "failed to capture SIGTERM");
                ShutdownEvent::ListenerFailed
            }
        }
    };

    #[cfg(not(unix))]
    let sigterm = std::future::pending();

    tokio::select! {
        event = ctrl_c => event,
        event = sigterm => event,
    }
}

fn parse_listen_addr(addr: &str) -> Result<SocketAddr, ServerError> {
    let trimmed = addr.trim();
    if trimmed.is_empty() {
        return Err(ServerError::EmptyListenAddr);
    }
    trimmed
        .parse()
        .map_err(|source| ServerError::InvalidListenAddr {
            address: trimmed.to_string(),
            source,
        })
}

async fn bind_listener(addr: SocketAddr) -> Result<TcpListener, ServerError> {
    TcpListener::bind(addr)
        .await
        .map_err(|source| ServerError::Bind {
            address: addr.to_string(),
            source,
        })
}

fn broadcast_shutdown(
    sender: watch::Sender<ShutdownEvent>,
) -> impl Future<Output = ()> + Send + 'static {
    async move {
        let event = wait_for_shutdown().await;
        debug_assert!(event != ShutdownEvent::Pending);
        if let Err(error) = sender.send(event) {
            tracing::warn!(?event, %error, "failed to broadcast shutdown event");
        }
    }
}

fn drain_timeout_future(
    mut receiver: watch::Receiver<ShutdownEvent>,
) -> impl Future<Output = ()> + Send + 'static {
    async move {
        if receiver.changed().await.is_ok() {
            let event = *receiver.borrow_and_update();
            tracing::info!(?event, "shutdown signal received; draining connections");
            tokio::time::sleep(DRAIN_TIMEOUT).await;
            tracing::warn!(
                ?event,
                seconds = DRAIN_TIMEOUT.as_secs(),
                "graceful shutdown timed out; continuing shutdown"
            );
        }
    }
}
