//! Operational HTTP surface.
//!
//! Routes:
//! - `GET /healthz` - Coordination health (store failover state, waiters)
//! - `GET /metrics` - Prometheus metrics

use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tracing::error;

use crate::coordination::Coordinator;
use crate::metrics::MetricsRegistry;

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub node_id: String,
    pub store: StoreHealth,
    pub registered_waiters: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Ok,
    Unhealthy,
}

#[derive(Debug, Serialize)]
pub struct StoreHealth {
    pub recovering: bool,
    pub failure_generation: u64,
    pub completed_recoveries: u64,
}

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct HealthState {
    pub coordinator: Arc<Coordinator>,
    pub metrics: MetricsRegistry,
}

/// Build the axum [`Router`] for the operational endpoints.
pub fn create_router(state: HealthState) -> Router {
    Router::new()
        .route("/healthz", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

/// Snapshot the coordinator without touching the store, so the check never
/// blocks behind a recovery in progress.
pub fn health_snapshot(coordinator: &Coordinator) -> HealthResponse {
    let guard = &coordinator.guard;
    let recovering = guard.is_recovering();
    HealthResponse {
        status: if recovering {
            HealthStatus::Unhealthy
        } else {
            HealthStatus::Ok
        },
        node_id: coordinator.node_id().to_string(),
        store: StoreHealth {
            recovering,
            failure_generation: guard.generation(),
            completed_recoveries: guard.completed_recoveries(),
        },
        registered_waiters: coordinator.registry.waiter_count(),
    }
}

// ---------------------------------------------------------------------------
// Axum handlers
// ---------------------------------------------------------------------------

/// `GET /healthz` handler.  Returns 200 when connected, 503 while the store
/// is being recovered.
pub async fn health_handler(State(state): State<HealthState>) -> impl IntoResponse {
    let body = health_snapshot(&state.coordinator);
    let http_status = match body.status {
        HealthStatus::Ok => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    (http_status, Json(body))
}

/// `GET /metrics`
pub async fn metrics_handler(State(state): State<HealthState>) -> Response {
    match state.metrics.encode() {
        Ok(buf) => (
            StatusCode::OK,
            [(
                header::CONTENT_TYPE,
                "application/openmetrics-text; version=1.0.0; charset=utf-8",
            )],
            buf,
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "metrics encoding failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, FailoverConfig};
    use crate::coordination::memory::{LocalBus, MemoryStore};
    use std::time::Duration;

    #[tokio::test]
    async fn reports_recovery_as_unhealthy() {
        let store = Arc::new(MemoryStore::new());
        let config = Config {
            failover: FailoverConfig {
                probe_interval_ms: 10,
                poll_interval_ms: 5,
                ..FailoverConfig::default()
            },
            ..Config::default()
        };
        let coordinator = Arc::new(Coordinator::new(
            store.clone(),
            Arc::new(LocalBus::new()),
            &config,
            "node-a".into(),
            MetricsRegistry::new(),
        ));

        let healthy = health_snapshot(&coordinator);
        assert_eq!(healthy.status, HealthStatus::Ok);
        assert_eq!(healthy.node_id, "node-a");

        store.set_offline();
        let call = {
            let coordinator = Arc::clone(&coordinator);
            tokio::spawn(async move { coordinator.guard.get("k").await })
        };
        while !coordinator.guard.is_recovering() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        let degraded = health_snapshot(&coordinator);
        assert_eq!(degraded.status, HealthStatus::Unhealthy);
        assert_eq!(degraded.store.failure_generation, 1);

        store.set_online();
        call.await.unwrap().unwrap();
        assert_eq!(health_snapshot(&coordinator).status, HealthStatus::Ok);
    }
}
