//! Status HTTP server
//!
//! JSON status for the price stream and running markets, recent records,
//! a liveness probe and the Prometheus metrics endpoint.

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::adapters::chainlink_rtds::{PriceSample, PriceStream};
use crate::clock::Clock;
use crate::domain::MarketRecord;
use crate::error::{PolywatchError, Result};
use crate::services::Metrics;
use crate::strategy::{ActiveMarketInfo, MarketSupervisor, RecordSink};

/// Ticks included in the status response
const RECENT_TICK_WINDOW: Duration = Duration::from_secs(60);
/// Records served by `/api/sessions`
const SESSION_WINDOW: Duration = Duration::from_secs(24 * 3600);

#[derive(Debug, Clone, Serialize)]
pub struct StatusResponse {
    pub price: Option<f64>,
    pub price_available: bool,
    pub last_price: Option<f64>,
    pub ws_connected: bool,
    pub last_update_age_secs: Option<f64>,
    pub tick_count: usize,
    pub active_market_count: usize,
    pub active_markets: Vec<ActiveMarketInfo>,
    pub uptime_seconds: i64,
    pub timestamp: DateTime<Utc>,
    pub recent_ticks: Vec<PriceSample>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionsResponse {
    pub count: usize,
    pub records: Vec<MarketRecord>,
}

/// Shared state for the status server
pub struct StatusState {
    pub started_at: DateTime<Utc>,
    pub stream: Arc<PriceStream>,
    pub supervisor: Arc<MarketSupervisor>,
    pub sink: Arc<dyn RecordSink>,
    pub metrics: Arc<Metrics>,
    pub clock: Arc<dyn Clock>,
}

impl StatusState {
    pub fn new(
        stream: Arc<PriceStream>,
        supervisor: Arc<MarketSupervisor>,
        sink: Arc<dyn RecordSink>,
        metrics: Arc<Metrics>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            started_at: clock.now(),
            stream,
            supervisor,
            sink,
            metrics,
            clock,
        }
    }

    pub fn status(&self) -> StatusResponse {
        let snapshot = self.stream.snapshot();
        let active_markets = self.supervisor.active();
        let now = self.clock.now();

        StatusResponse {
            price: snapshot.price,
            price_available: snapshot.price_available,
            last_price: snapshot.last_price,
            ws_connected: snapshot.ws_connected,
            last_update_age_secs: snapshot.last_update_age_secs,
            tick_count: snapshot.tick_count,
            active_market_count: active_markets.len(),
            active_markets,
            uptime_seconds: (now - self.started_at).num_seconds(),
            timestamp: now,
            recent_ticks: self.stream.recent_ticks(RECENT_TICK_WINDOW),
        }
    }
}

pub fn router(state: Arc<StatusState>) -> Router {
    Router::new()
        .route("/api/health", get(status_handler))
        .route("/api/sessions", get(sessions_handler))
        .route("/healthz", get(liveness_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

/// Status server
pub struct StatusServer {
    state: Arc<StatusState>,
    port: u16,
}

impl StatusServer {
    pub fn new(state: Arc<StatusState>, port: u16) -> Self {
        Self { state, port }
    }

    pub async fn run(&self) -> Result<()> {
        let app = router(Arc::clone(&self.state));

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!("Status server running on http://{}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, app)
            .await
            .map_err(|e| PolywatchError::Internal(format!("Status server error: {}", e)))?;

        Ok(())
    }
}

async fn status_handler(State(state): State<Arc<StatusState>>) -> impl IntoResponse {
    Json(state.status())
}

async fn sessions_handler(State(state): State<Arc<StatusState>>) -> impl IntoResponse {
    match state.sink.recent_records(SESSION_WINDOW).await {
        Ok(records) => (
            StatusCode::OK,
            Json(SessionsResponse {
                count: records.len(),
                records,
            }),
        )
            .into_response(),
        Err(e) => {
            warn!("Failed to load recent records: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "error": e.to_string() })),
            )
                .into_response()
        }
    }
}

async fn liveness_handler() -> impl IntoResponse {
    StatusCode::OK
}

/// Prometheus metrics endpoint
async fn metrics_handler(State(state): State<Arc<StatusState>>) -> impl IntoResponse {
    let body = state
        .metrics
        .prometheus(state.supervisor.len(), state.stream.is_available());
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
}
