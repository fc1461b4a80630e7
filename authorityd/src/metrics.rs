//! Prometheus metrics and the `/metrics`, `/healthz`, `/readyz` status
//! server, grounded on the teacher's `DaemonMetrics`/`start_status_server`
//! pair: one `prometheus::Registry` built at startup, served read-only
//! alongside a richer JSON health report.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use prometheus::Encoder;
use serde::Serialize;

use authority_bus::EventBus;
use authority_core::resilience::BreakerState;
use authority_engine::AuthorityEngine;

#[derive(Clone)]
pub struct DaemonMetrics {
    registry: prometheus::Registry,
    pub operations_total: prometheus::IntCounterVec,
    pub denials_total: prometheus::IntCounterVec,
    pub ledger_events_total: prometheus::IntCounterVec,
    pub operation_latency_ms: prometheus::HistogramVec,
    store_breaker_state: prometheus::IntGauge,
    cache_breaker_state: prometheus::IntGauge,
    bus_breaker_state: prometheus::IntGauge,
    dlq_depth: prometheus::IntGauge,
}

impl DaemonMetrics {
    pub fn new() -> Self {
        let registry = prometheus::Registry::new();

        let operations_total = prometheus::IntCounterVec::new(
            prometheus::Opts::new("authorityd_operations_total", "Authority operations by kind and outcome"),
            &["operation", "outcome"],
        )
        .unwrap();
        let denials_total = prometheus::IntCounterVec::new(
            prometheus::Opts::new("authorityd_denials_total", "Denied operations by reason"),
            &["reason"],
        )
        .unwrap();
        let ledger_events_total = prometheus::IntCounterVec::new(
            prometheus::Opts::new("authorityd_ledger_events_total", "Ledger events appended by kind"),
            &["kind"],
        )
        .unwrap();
        let operation_latency_ms = prometheus::HistogramVec::new(
            prometheus::HistogramOpts::new(
                "authorityd_operation_latency_ms",
                "Authority operation latency in milliseconds",
            ),
            &["operation"],
        )
        .unwrap();
        let store_breaker_state = prometheus::IntGauge::new(
            "authorityd_store_breaker_state",
            "Mandate store circuit breaker state (0=closed, 1=half_open, 2=open)",
        )
        .unwrap();
        let cache_breaker_state = prometheus::IntGauge::new(
            "authorityd_cache_breaker_state",
            "Mandate cache circuit breaker state (0=closed, 1=half_open, 2=open)",
        )
        .unwrap();
        let bus_breaker_state = prometheus::IntGauge::new(
            "authorityd_bus_breaker_state",
            "Event bus circuit breaker state (0=closed, 1=half_open, 2=open)",
        )
        .unwrap();
        let dlq_depth = prometheus::IntGauge::new(
            "authorityd_dlq_depth",
            "Messages currently on authority.dlq across all partitions",
        )
        .unwrap();

        registry.register(Box::new(operations_total.clone())).expect("register operations_total");
        registry.register(Box::new(denials_total.clone())).expect("register denials_total");
        registry.register(Box::new(ledger_events_total.clone())).expect("register ledger_events_total");
        registry.register(Box::new(operation_latency_ms.clone())).expect("register operation_latency_ms");
        registry.register(Box::new(store_breaker_state.clone())).expect("register store_breaker_state");
        registry.register(Box::new(cache_breaker_state.clone())).expect("register cache_breaker_state");
        registry.register(Box::new(bus_breaker_state.clone())).expect("register bus_breaker_state");
        registry.register(Box::new(dlq_depth.clone())).expect("register dlq_depth");

        Self {
            registry,
            operations_total,
            denials_total,
            ledger_events_total,
            operation_latency_ms,
            store_breaker_state,
            cache_breaker_state,
            bus_breaker_state,
            dlq_depth,
        }
    }

    fn render(&self) -> anyhow::Result<String> {
        let mut buffer = Vec::new();
        let encoder = prometheus::TextEncoder::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }

    fn refresh_gauges(&self, engine: &AuthorityEngine, bus: &EventBus) {
        let health = engine.health();
        self.store_breaker_state.set(breaker_state_code(health.store));
        self.cache_breaker_state.set(breaker_state_code(health.cache));
        self.bus_breaker_state.set(breaker_state_code(health.bus));
        self.dlq_depth.set(bus.dlq_depth() as i64);
    }
}

impl Default for DaemonMetrics {
    fn default() -> Self {
        Self::new()
    }
}

fn breaker_state_code(state: BreakerState) -> i64 {
    match state {
        BreakerState::Closed => 0,
        BreakerState::HalfOpen => 1,
        BreakerState::Open => 2,
    }
}

fn breaker_state_name(state: BreakerState) -> &'static str {
    match state {
        BreakerState::Closed => "ok",
        BreakerState::HalfOpen => "degraded",
        BreakerState::Open => "unhealthy",
    }
}

#[derive(Clone)]
pub struct StatusState {
    pub metrics: DaemonMetrics,
    pub engine: Arc<AuthorityEngine>,
    pub bus: Arc<EventBus>,
}

#[derive(Serialize)]
struct HealthChecks {
    store: &'static str,
    cache: &'static str,
    bus: &'static str,
}

#[derive(Serialize)]
struct HealthReport {
    status: &'static str,
    checks: HealthChecks,
}

pub fn router(state: StatusState) -> Router {
    Router::new()
        .route("/metrics", get(metrics_endpoint))
        .route("/healthz", get(health_endpoint))
        .route("/readyz", get(health_endpoint))
        .route("/health", get(health_endpoint))
        .with_state(Arc::new(state))
}

async fn metrics_endpoint(State(state): State<Arc<StatusState>>) -> impl IntoResponse {
    state.metrics.refresh_gauges(&state.engine, &state.bus);
    match state.metrics.render() {
        Ok(body) => (StatusCode::OK, body).into_response(),
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to encode metrics: {err}"),
        )
            .into_response(),
    }
}

async fn health_endpoint(State(state): State<Arc<StatusState>>) -> impl IntoResponse {
    let health = state.engine.health();
    state.metrics.refresh_gauges(&state.engine, &state.bus);
    let report = HealthReport {
        status: if health.is_healthy() { "ok" } else { "degraded" },
        checks: HealthChecks {
            store: breaker_state_name(health.store),
            cache: breaker_state_name(health.cache),
            bus: breaker_state_name(health.bus),
        },
    };
    let code = if health.is_healthy() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(report))
}
