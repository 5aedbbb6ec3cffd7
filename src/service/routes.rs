//! Axum routes for the archive service.

use axum::{
    extract::{Json, Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::archive::{ArchiveError, CoverageReport};
use crate::client::{ChannelInfo, ChatClient, InMemoryChatClient};
use crate::hybrid::{NativeTopicListing, StatsView, TopicStats};
use crate::sequencer::{FetchActivity, FetchError, FetchTask, SequencerState};
use crate::store::{InMemoryMessageStore, MessageStore};
use crate::types::{ChannelId, TopicSummary};
use crate::ARCHIVE_KERNEL_SCHEMA_VERSION;

use super::middleware::record_fetch_outcome;
use super::state::{RunOutcome, RunRecord, ServiceState};

/// Type alias for the service state over the in-memory backends.
pub type AppState = ServiceState<InMemoryMessageStore, InMemoryChatClient>;

type ApiError = (StatusCode, Json<ErrorResponse>);

// ============================================================================
// Request/Response Types
// ============================================================================

/// Channels visible to the client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelListResponse {
    pub channels: Vec<ChannelInfo>,
}

/// Coverage and fetch state of one channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub coverage: CoverageReport,
    /// Missing ids across all gaps.
    pub missing_count: u64,
    pub state: SequencerState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub activity: Option<FetchActivity>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_run: Option<RunRecord>,
}

/// Virtual topics ordered by root id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VirtualTopicsResponse {
    pub channel_id: ChannelId,
    pub topics: Vec<TopicSummary>,
    /// Topics whose root is still provisional.
    pub provisional_count: usize,
}

/// Native topics ordered by id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NativeTopicsResponse {
    pub channel_id: ChannelId,
    pub topics: Vec<NativeTopicListing>,
}

/// Query string of the stats endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatsQuery {
    /// `native`, `virtual` or `hybrid` (default).
    #[serde(default)]
    pub view: StatsView,
}

/// Per-topic statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsResponse {
    pub channel_id: ChannelId,
    pub view: StatsView,
    pub topics: Vec<TopicStats>,
    /// Sum of message counts over `topics`.
    pub message_count: usize,
}

/// A fetch accepted for background execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchAcceptedResponse {
    pub channel_id: ChannelId,
    pub run_id: Uuid,
    pub task: FetchTask,
}

/// Result of a stop request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopResponse {
    pub channel_id: ChannelId,
    /// `false` when nothing was running.
    pub stopping: bool,
    pub state: SequencerState,
}

/// Service health response (detailed).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub schema_version: String,
    pub store_available: bool,
    /// Channels with a running fetch.
    pub active_fetches: usize,
}

/// Simple liveness response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LivenessResponse {
    pub status: String,
}

/// Readiness response with dependency status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessResponse {
    pub ready: bool,
    pub store: bool,
    pub details: Option<String>,
}

/// Structured error response with correlation ID for tracing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Human-readable error message.
    pub error: String,
    /// Machine-readable error code.
    pub code: String,
    /// Correlation ID for request tracing.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    /// Additional error details (optional).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ErrorResponse {
    /// Create a new error response with code and message.
    pub fn new(code: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            code: code.into(),
            correlation_id: None,
            details: None,
        }
    }

    /// Add a correlation ID to the error.
    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    /// Add details to the error.
    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

impl IntoResponse for ErrorResponse {
    fn into_response(self) -> axum::response::Response {
        tracing::warn!(
            code = %self.code,
            error = %self.error,
            correlation_id = ?self.correlation_id,
            "Request error"
        );
        (StatusCode::BAD_REQUEST, Json(self)).into_response()
    }
}

fn archive_error(e: ArchiveError) -> ApiError {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(ErrorResponse::new("STORAGE_UNAVAILABLE", e.to_string())),
    )
}

fn fetch_error(e: FetchError) -> ApiError {
    let (status, code) = match &e {
        FetchError::Busy { .. } => (StatusCode::CONFLICT, "CHANNEL_BUSY"),
        FetchError::InvalidRange { .. } => (StatusCode::BAD_REQUEST, "INVALID_RANGE"),
        FetchError::TopicNotFound(_) => (StatusCode::NOT_FOUND, "TOPIC_NOT_FOUND"),
        FetchError::StorageUnavailable(_) => (StatusCode::SERVICE_UNAVAILABLE, "STORAGE_UNAVAILABLE"),
        FetchError::Cancelled { .. } | FetchError::Failed { .. } => {
            (StatusCode::INTERNAL_SERVER_ERROR, "FETCH_FAILED")
        }
    };
    let mut body = ErrorResponse::new(code, e.to_string());
    if let FetchError::Busy { running, .. } = &e {
        body = body.with_details(running.to_string());
    }
    (status, Json(body))
}

// ============================================================================
// Route Handlers
// ============================================================================

/// Channels and supergroups visible to the client.
async fn list_channels_handler<S: MessageStore + 'static, C: ChatClient + 'static>(
    State(state): State<Arc<ServiceState<S, C>>>,
) -> Result<Json<ChannelListResponse>, ApiError> {
    let channels = state.sequencer.client().list_channels().await.map_err(|e| {
        (
            StatusCode::BAD_GATEWAY,
            Json(ErrorResponse::new("CLIENT_ERROR", e.to_string())),
        )
    })?;
    Ok(Json(ChannelListResponse { channels }))
}

/// Coverage, sequencer state and last finished run.
async fn status_handler<S: MessageStore + 'static, C: ChatClient + 'static>(
    State(state): State<Arc<ServiceState<S, C>>>,
    Path(channel): Path<ChannelId>,
) -> Result<Json<StatusResponse>, ApiError> {
    let coverage = state.sequencer.archive().refresh(channel).await.map_err(archive_error)?;
    let last_run = state.runs.read().last_run(channel).cloned();

    Ok(Json(StatusResponse {
        missing_count: coverage.missing_count(),
        coverage,
        state: state.sequencer.state(channel),
        activity: state.sequencer.activity(channel),
        last_run,
    }))
}

async fn virtual_topics_handler<S: MessageStore + 'static, C: ChatClient + 'static>(
    State(state): State<Arc<ServiceState<S, C>>>,
    Path(channel): Path<ChannelId>,
) -> Result<Json<VirtualTopicsResponse>, ApiError> {
    let graph = state.topics.reply_graph(channel).await.map_err(archive_error)?;
    Ok(Json(VirtualTopicsResponse {
        channel_id: channel,
        provisional_count: graph.provisional().count(),
        topics: graph.summaries(),
    }))
}

async fn native_topics_handler<S: MessageStore + 'static, C: ChatClient + 'static>(
    State(state): State<Arc<ServiceState<S, C>>>,
    Path(channel): Path<ChannelId>,
) -> Result<Json<NativeTopicsResponse>, ApiError> {
    let topics = state.topics.list_native_topics(channel).await.map_err(archive_error)?;
    Ok(Json(NativeTopicsResponse { channel_id: channel, topics }))
}

async fn stats_handler<S: MessageStore + 'static, C: ChatClient + 'static>(
    State(state): State<Arc<ServiceState<S, C>>>,
    Path(channel): Path<ChannelId>,
    Query(query): Query<StatsQuery>,
) -> Result<Json<StatsResponse>, ApiError> {
    let topics = state.topics.stats(channel, query.view).await.map_err(archive_error)?;
    Ok(Json(StatsResponse {
        channel_id: channel,
        view: query.view,
        message_count: topics.iter().map(|t| t.message_count).sum(),
        topics,
    }))
}

/// Admit a fetch and run it in the background.
///
/// Returns 202 once the channel is claimed; 409 while another task holds it.
async fn fetch_handler<S: MessageStore + 'static, C: ChatClient + 'static>(
    State(state): State<Arc<ServiceState<S, C>>>,
    Path(channel): Path<ChannelId>,
    Json(task): Json<FetchTask>,
) -> Result<(StatusCode, Json<FetchAcceptedResponse>), ApiError> {
    let lease = state.sequencer.claim(&state.context(channel), task).map_err(fetch_error)?;
    let run_id = lease.run_id();
    let activity = state.sequencer.activity(channel).filter(|a| a.run_id == run_id).ok_or_else(|| {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse::new("LEASE_LOST", format!("Lease {} not registered", run_id))),
        )
    })?;

    let runs = Arc::clone(&state.runs);
    tokio::spawn(async move {
        let result = lease.execute().await;
        let outcome = RunOutcome::from_result(result);
        record_fetch_outcome(channel, &activity.task, &outcome);
        runs.write().record(channel, &activity, outcome);
        drop(lease);
    });

    Ok((
        StatusCode::ACCEPTED,
        Json(FetchAcceptedResponse { channel_id: channel, run_id, task }),
    ))
}

/// Ask the channel's running fetch to stop at the next page boundary.
async fn stop_handler<S: MessageStore + 'static, C: ChatClient + 'static>(
    State(state): State<Arc<ServiceState<S, C>>>,
    Path(channel): Path<ChannelId>,
) -> Json<StopResponse> {
    let stopping = state.sequencer.cancel(channel);
    Json(StopResponse {
        channel_id: channel,
        stopping,
        state: state.sequencer.state(channel),
    })
}

/// Health check endpoint (detailed).
async fn health_handler<S: MessageStore + 'static, C: ChatClient + 'static>(
    State(state): State<Arc<ServiceState<S, C>>>,
) -> Json<HealthResponse> {
    let store_available = state.sequencer.store().list_channels().await.is_ok();

    Json(HealthResponse {
        status: if store_available { "healthy" } else { "degraded" }.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        schema_version: ARCHIVE_KERNEL_SCHEMA_VERSION.to_string(),
        store_available,
        active_fetches: state.sequencer.active_count(),
    })
}

/// Liveness probe endpoint.
///
/// Does NOT check dependencies.
async fn liveness_handler() -> Json<LivenessResponse> {
    Json(LivenessResponse {
        status: "alive".to_string(),
    })
}

/// Readiness probe endpoint.
///
/// Returns 200 if the store answers, 503 otherwise.
async fn readiness_handler<S: MessageStore + 'static, C: ChatClient + 'static>(
    State(state): State<Arc<ServiceState<S, C>>>,
) -> Result<Json<ReadinessResponse>, (StatusCode, Json<ReadinessResponse>)> {
    match state.sequencer.store().list_channels().await {
        Ok(_) => Ok(Json(ReadinessResponse {
            ready: true,
            store: true,
            details: None,
        })),
        Err(e) => Err((
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ReadinessResponse {
                ready: false,
                store: false,
                details: Some(e.to_string()),
            }),
        )),
    }
}

// ============================================================================
// Router Construction
// ============================================================================

/// Create the Axum router for the archive service.
pub fn create_router<S: MessageStore + 'static, C: ChatClient + 'static>(state: ServiceState<S, C>) -> Router {
    let state = Arc::new(state);

    Router::new()
        .route("/api/channels", get(list_channels_handler::<S, C>))
        .route("/api/channels/:channel/status", get(status_handler::<S, C>))
        .route("/api/channels/:channel/virtual_topics", get(virtual_topics_handler::<S, C>))
        .route("/api/channels/:channel/native_topics", get(native_topics_handler::<S, C>))
        .route("/api/channels/:channel/stats", get(stats_handler::<S, C>))
        // Fetch control
        .route("/api/channels/:channel/fetch", post(fetch_handler::<S, C>))
        .route("/api/channels/:channel/stop", post(stop_handler::<S, C>))
        // Health checks
        .route("/health", get(health_handler::<S, C>))
        .route("/health/live", get(liveness_handler))
        .route("/health/ready", get(readiness_handler::<S, C>))
        .with_state(state)
}
