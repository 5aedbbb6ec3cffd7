//! Archive Service Binary
//!
//! Runs the archive kernel as a REST API service:
//! - Structured JSON logging
//! - Request tracing with correlation IDs
//! - Graceful shutdown handling (running fetches are stopped at a page boundary)
//! - Health check endpoints
//!
//! ## Configuration
//!
//! Environment variables (a `.env` file is loaded if present):
//! - `ARCHIVE_*` / `FETCH_*`: see [`archive_kernel::config`]
//! - `DATABASE_URL`: PostgreSQL store (with the `postgres` feature; in-memory otherwise)
//! - `PORT`: Service port (default: 8001)
//! - `HOST`: Service host (default: 0.0.0.0)
//! - `RUST_LOG`: Log level filter (default: archive_kernel=info)
//! - `LOG_FORMAT`: "json" for structured logs, "pretty" for development (default: json)
//!
//! ## Usage
//!
//! ```bash
//! ARCHIVE_REPLAY_FILE=export.jsonl cargo run --bin archive_service --features service
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::Request,
    middleware::{self, Next},
    response::Response,
};
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, info_span, Instrument};
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

use archive_kernel::service::{create_router, metrics_middleware, ServiceState};
use archive_kernel::{ArchiveConfig, ChatClient, InMemoryChatClient, InMemoryMessageStore, MessageStore};

/// Initialize the tracing subscriber with JSON or pretty format
fn init_tracing() {
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "json".to_string());

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "archive_kernel=info,archive_service=info,tower_http=info,sqlx=warn".into());

    if log_format == "pretty" {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_span_events(FmtSpan::CLOSE)
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .json()
                    .with_target(true)
                    .with_current_span(true)
                    .with_span_events(FmtSpan::CLOSE)
                    .flatten_event(true)
            )
            .init();
    }
}

/// Request logging middleware that adds correlation ID and timing
async fn request_logging_middleware(request: Request, next: Next) -> Response {
    let start = Instant::now();

    let trace_id = request
        .headers()
        .get("X-Request-Id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let method = request.method().clone();
    let uri = request.uri().path().to_string();

    let span = info_span!(
        "request",
        trace_id = %trace_id,
        method = %method,
        path = %uri,
        status = tracing::field::Empty,
        latency_ms = tracing::field::Empty,
    );

    let response = next.run(request).instrument(span.clone()).await;

    let latency = start.elapsed();
    let status = response.status().as_u16();

    span.record("status", status);
    span.record("latency_ms", latency.as_millis() as u64);

    info!(
        target: "archive_service::access",
        trace_id = %trace_id,
        method = %method,
        path = %uri,
        status = status,
        latency_ms = latency.as_millis() as u64,
        "request completed"
    );

    response
}

fn load_client(config: &ArchiveConfig) -> Result<InMemoryChatClient, Box<dyn std::error::Error>> {
    let Some(path) = &config.replay_file else {
        info!("ARCHIVE_REPLAY_FILE not set, serving an empty upstream");
        return Ok(InMemoryChatClient::new());
    };
    let Some(channel) = config.channel_id else {
        return Err("ARCHIVE_REPLAY_FILE requires ARCHIVE_CHANNEL_ID".into());
    };
    let client = InMemoryChatClient::from_jsonl(path, channel)?;
    info!(path = %path.display(), channel_id = %channel, "Replay export loaded");
    Ok(client)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, initiating graceful shutdown"),
        _ = terminate => info!("Received SIGTERM, initiating graceful shutdown"),
    }
}

/// Connect to PostgreSQL when `DATABASE_URL` is set.
#[cfg(feature = "postgres")]
async fn connect_postgres() -> Result<Option<archive_kernel::PostgresMessageStore>, Box<dyn std::error::Error>> {
    if !std::env::var("DATABASE_URL").is_ok_and(|url| !url.is_empty()) {
        return Ok(None);
    }

    info!("Connecting to PostgreSQL...");
    let connect_start = Instant::now();
    let store = match tokio::time::timeout(
        std::time::Duration::from_secs(30),
        archive_kernel::PostgresMessageStore::from_env(),
    )
    .await
    {
        Ok(Ok(store)) => store,
        Ok(Err(e)) => {
            tracing::error!(error = %e, "Failed to connect to PostgreSQL");
            return Err(e.into());
        }
        Err(_) => {
            tracing::error!("PostgreSQL connection timeout after 30s");
            return Err("Database connection timeout".into());
        }
    };
    store.ensure_schema().await?;
    info!(
        latency_ms = connect_start.elapsed().as_millis() as u64,
        "PostgreSQL connection established"
    );
    Ok(Some(store))
}

async fn serve<S, C>(state: ServiceState<S, C>, addr: SocketAddr) -> Result<(), Box<dyn std::error::Error>>
where
    S: MessageStore + 'static,
    C: ChatClient + 'static,
{
    let sequencer = state.sequencer.clone();
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = create_router(state)
        .layer(middleware::from_fn(metrics_middleware))
        .layer(middleware::from_fn(request_logging_middleware))
        .layer(TraceLayer::new_for_http())
        .layer(cors);

    let listener = TcpListener::bind(addr).await?;
    info!(address = %addr, version = env!("CARGO_PKG_VERSION"), "Archive Service listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            let stopped = sequencer.cancel_all();
            info!(stopped, "Stopping running fetches");
        })
        .await?;

    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    init_tracing();

    let version = env!("CARGO_PKG_VERSION");
    let build_sha = option_env!("BUILD_SHA").unwrap_or("dev");
    info!(version = version, build_sha = build_sha, "Starting Archive Service");

    let config = ArchiveConfig::from_env()?;
    info!(
        channel_id = ?config.channel_id,
        batch_size = config.batch_size,
        max_attempts = config.max_attempts,
        request_timeout_ms = config.request_timeout.as_millis() as u64,
        "Configuration loaded"
    );

    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(8001);
    let host = std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;

    let client = Arc::new(load_client(&config)?);

    #[cfg(feature = "postgres")]
    let served = match connect_postgres().await? {
        Some(store) => {
            serve(ServiceState::from_shared(Arc::new(store), Arc::clone(&client), config.clone()), addr).await?;
            true
        }
        None => false,
    };
    #[cfg(not(feature = "postgres"))]
    let served = false;

    if !served {
        info!("Using in-memory message store");
        let store = Arc::new(InMemoryMessageStore::new());
        serve(ServiceState::from_shared(store, client, config), addr).await?;
    }

    info!("Archive Service shutdown complete");
    Ok(())
}
