//! Service middleware for metrics and request tracking.
//!
//! ## Metrics Exposed
//!
//! - `request`: path pattern, method, status and latency of every request
//! - `fetch`: outcome, pages and persisted messages of every background fetch

use axum::{
    extract::Request,
    middleware::Next,
    response::Response,
};
use std::sync::OnceLock;
use std::time::Instant;
use tracing::info;

use crate::sequencer::FetchTask;
use crate::types::ChannelId;

use super::state::RunOutcome;

/// Metrics middleware that records request counts and latency.
///
/// Uses tracing for now; events can be aggregated from logs.
pub async fn metrics_middleware(request: Request, next: Next) -> Response {
    let start = Instant::now();
    let method = request.method().clone();
    let path = normalize_path(request.uri().path());

    let response = next.run(request).await;

    let latency = start.elapsed();
    let status = response.status().as_u16();

    info!(
        target: "archive_kernel::metrics",
        metric_type = "request",
        path = %path,
        method = %method,
        status = status,
        latency_ms = latency.as_millis() as u64,
        "request_metric"
    );

    response
}

fn dynamic_segment() -> Option<&'static regex_lite::Regex> {
    static PATTERN: OnceLock<Option<regex_lite::Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| {
            regex_lite::Regex::new(
                r"^(?:-?[0-9]+|vt-[0-9a-f]{16}|[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12})$",
            )
            .ok()
        })
        .as_ref()
}

/// Normalize path for metrics to avoid high cardinality.
///
/// Replaces channel ids, message ids, virtual topic ids and UUIDs with `:id`.
fn normalize_path(path: &str) -> String {
    let Some(pattern) = dynamic_segment() else {
        return path.to_string();
    };
    path.split('/')
        .map(|segment| if pattern.is_match(segment) { ":id" } else { segment })
        .collect::<Vec<_>>()
        .join("/")
}

/// Record the outcome of a background fetch.
pub fn record_fetch_outcome(channel: ChannelId, task: &FetchTask, outcome: &RunOutcome) {
    let (result, pages, persisted) = match outcome {
        RunOutcome::Completed { report } => {
            ("completed", report.progress.pages, report.progress.messages_persisted)
        }
        RunOutcome::Cancelled { progress } => ("cancelled", progress.pages, progress.messages_persisted),
        RunOutcome::Failed { progress, .. } => {
            let progress = progress.unwrap_or_default();
            ("failed", progress.pages, progress.messages_persisted)
        }
    };
    info!(
        target: "archive_kernel::metrics",
        metric_type = "fetch",
        channel_id = %channel,
        task = %task,
        result = result,
        pages = pages,
        persisted = persisted,
        "fetch_metric"
    );
}
