//! Archive REST Service
//!
//! Exposes coverage, topic queries and fetch control over HTTP.
//!
//! ## Endpoints
//!
//! - `GET /api/channels` - Channels visible to the client
//! - `GET /api/channels/:channel/status` - Coverage, gaps and fetch state
//! - `GET /api/channels/:channel/virtual_topics` - Reconstructed topics
//! - `GET /api/channels/:channel/native_topics` - Service-supplied topics
//! - `GET /api/channels/:channel/stats?view=` - Per-topic statistics
//! - `POST /api/channels/:channel/fetch` - Start a fetch task (202, 409 when busy)
//! - `POST /api/channels/:channel/stop` - Stop the running fetch
//! - `GET /health` - Detailed service health check
//! - `GET /health/live` - Liveness probe
//! - `GET /health/ready` - Readiness probe

pub mod middleware;
pub mod routes;
pub mod state;

pub use middleware::{metrics_middleware, record_fetch_outcome};
pub use routes::{create_router, AppState, ErrorResponse};
pub use state::{RunOutcome, RunRecord, RunRegistry, ServiceState};
