//! Status and health check handlers.
//!
//! - `/health` - Simple health check for systemd/load balancers
//! - `/status` - Version, uptime and event processing counters
//!
//! # Example Response
//!
//! ```json
//! {
//!   "version": "0.1.0",
//!   "name": "creditsync",
//!   "uptime_seconds": 3600,
//!   "events": {
//!     "received": 120,
//!     "duplicates": 4,
//!     "processed": 110,
//!     "unattributable": 5,
//!     "failed": 1,
//!     "retries": 3
//!   },
//!   "status": "running",
//!   "timestamp": "2026-01-01T12:00:00+00:00"
//! }
//! ```

use std::sync::Arc;
use std::time::Instant;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::stripe::processor::{ProcessorStats, StatsSnapshot};

/// Server version from Cargo.toml
pub const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Server name from Cargo.toml
pub const SERVER_NAME: &str = env!("CARGO_PKG_NAME");

/// Health check response for simple liveness probes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Health status (always "healthy" if responding)
    pub status: String,
}

impl Default for HealthResponse {
    fn default() -> Self {
        Self {
            status: "healthy".to_string(),
        }
    }
}

/// Detailed server status response.
#[derive(Debug, Clone, Serialize)]
pub struct StatusResponse {
    /// Server version (from Cargo.toml)
    pub version: String,

    /// Server name
    pub name: String,

    /// Server uptime in seconds
    pub uptime_seconds: u64,

    /// Webhook event counters
    pub events: StatsSnapshot,

    /// Server status (always "running" if responding)
    pub status: String,

    /// RFC 3339 timestamp of when status was generated
    pub timestamp: String,
}

/// Shared state for the status endpoints.
#[derive(Debug, Clone)]
pub struct AppState {
    /// Server start time for uptime calculation
    start_time: Instant,

    /// Counters owned by the event processor
    stats: Arc<ProcessorStats>,
}

impl AppState {
    /// Create state reporting on `stats`, starting the uptime clock now.
    pub fn new(stats: Arc<ProcessorStats>) -> Self {
        Self {
            start_time: Instant::now(),
            stats,
        }
    }

    /// Get the server uptime in seconds.
    #[inline]
    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Current event counters.
    pub fn events(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }
}

/// Health check endpoint handler.
///
/// # Route
/// `GET /health`
#[instrument(skip_all)]
pub async fn health_handler() -> impl IntoResponse {
    debug!("Health check requested");
    (StatusCode::OK, Json(HealthResponse::default()))
}

/// Detailed status endpoint handler.
///
/// # Route
/// `GET /status`
///
/// ```bash
/// curl http://localhost:8080/status
/// ```
#[instrument(skip_all)]
pub async fn status_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    debug!("Status check requested");

    let response = StatusResponse {
        version: SERVER_VERSION.to_string(),
        name: SERVER_NAME.to_string(),
        uptime_seconds: state.uptime_seconds(),
        events: state.events(),
        status: "running".to_string(),
        timestamp: chrono::Utc::now().to_rfc3339(),
    };

    (StatusCode::OK, Json(response))
}

/// Create the status router.
///
/// # Routes
/// - `GET /health` - Simple health check
/// - `GET /status` - Detailed status with counters
pub fn status_router(state: Arc<AppState>) -> axum::Router {
    use axum::routing::get;

    axum::Router::new()
        .route("/health", get(health_handler))
        .route("/status", get(status_handler))
        .with_state(state)
}
