//! Operational HTTP surface: `/healthz` and `/metrics`.
//!
//! - `GET /healthz` - liveness of the coordination store plus the current
//!   rank and offset of this process
//! - `GET /metrics` - Prometheus metrics in OpenMetrics text format

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::coordination::CoordinationStore;
use crate::metrics::MetricsRegistry;
use crate::sync::{Instance, SnapshotHandle};

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub instance: Instance,
    pub checks: HealthChecks,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Ok,
    Unhealthy,
}

#[derive(Debug, Serialize)]
pub struct HealthChecks {
    pub store: CheckResult,
}

#[derive(Debug, Serialize)]
pub struct CheckResult {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl CheckResult {
    fn healthy() -> Self {
        Self {
            ok: true,
            detail: None,
        }
    }

    fn unhealthy(detail: impl Into<String>) -> Self {
        Self {
            ok: false,
            detail: Some(detail.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct HttpState {
    pub store: Arc<dyn CoordinationStore>,
    pub snapshot: SnapshotHandle,
    pub metrics: MetricsRegistry,
}

pub fn create_router(state: HttpState) -> Router {
    Router::new()
        .route("/healthz", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

/// Serve [`create_router`] on `listen` until `cancel` fires.
pub async fn run_http_server(
    listen: &str,
    state: HttpState,
    cancel: CancellationToken,
) -> Result<()> {
    let listen_addr: SocketAddr = listen.parse().context("invalid http listen address")?;

    let listener = tokio::net::TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind HTTP listener on {listen_addr}"))?;

    tracing::info!(%listen_addr, "HTTP server listening");

    axum::serve(listener, create_router(state))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .context("HTTP server error")?;

    Ok(())
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn check_store(store: &dyn CoordinationStore) -> CheckResult {
    match store.ping().await {
        Ok(()) => CheckResult::healthy(),
        Err(e) => CheckResult::unhealthy(format!("PING failed: {e:#}")),
    }
}

/// `GET /healthz`.  Returns 200 when the store answers, 503 otherwise.
pub async fn health_handler(State(state): State<HttpState>) -> impl IntoResponse {
    let store = check_store(state.store.as_ref()).await;
    let status = if store.ok {
        HealthStatus::Ok
    } else {
        HealthStatus::Unhealthy
    };
    let body = HealthResponse {
        status,
        instance: state.snapshot.get(),
        checks: HealthChecks { store },
    };

    let http_status = match status {
        HealthStatus::Ok => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (http_status, Json(body))
}

/// `GET /metrics`
pub async fn metrics_handler(State(state): State<HttpState>) -> Response {
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
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("metrics encoding failed: {e}"),
        )
            .into_response(),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::coordination::MemoryStore;
    use crate::sync::{Coordinator, SyncConfig};

    struct DownStore;

    #[async_trait]
    impl CoordinationStore for DownStore {
        async fn set_with_ttl(&self, _: &str, _: Duration) -> Result<()> {
            anyhow::bail!("connection refused")
        }
        async fn expire(&self, _: &str, _: Duration) -> Result<()> {
            anyhow::bail!("connection refused")
        }
        async fn delete(&self, _: &str) -> Result<()> {
            anyhow::bail!("connection refused")
        }
        async fn keys(&self, _: &str) -> Result<Vec<String>> {
            anyhow::bail!("connection refused")
        }
        async fn list_push_if_absent(&self, _: &str, _: &str) -> Result<usize> {
            anyhow::bail!("connection refused")
        }
        async fn list_index_of(&self, _: &str, _: &str) -> Result<Option<usize>> {
            anyhow::bail!("connection refused")
        }
        async fn try_lock(&self, _: &str, _: &str, _: Duration) -> Result<bool> {
            anyhow::bail!("connection refused")
        }
        async fn unlock(&self, _: &str, _: &str) -> Result<()> {
            anyhow::bail!("connection refused")
        }
        async fn ping(&self) -> Result<()> {
            anyhow::bail!("connection refused")
        }
    }

    fn state(store: Arc<dyn CoordinationStore>) -> HttpState {
        let config = SyncConfig {
            identity: Some("web-1".into()),
            ..SyncConfig::default()
        };
        let coordinator =
            Coordinator::new(Arc::clone(&store), Duration::from_secs(60), config).unwrap();
        HttpState {
            store,
            snapshot: coordinator.snapshot_handle(),
            metrics: MetricsRegistry::new(),
        }
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn healthz_ok_when_store_answers() {
        let response = health_handler(State(state(Arc::new(MemoryStore::new()))))
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_json(response).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["checks"]["store"]["ok"], true);
        assert_eq!(body["instance"]["position"], -1);
    }

    #[tokio::test]
    async fn healthz_unavailable_when_store_down() {
        let response = health_handler(State(state(Arc::new(DownStore))))
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let body = body_json(response).await;
        assert_eq!(body["status"], "unhealthy");
        assert!(body["checks"]["store"]["detail"]
            .as_str()
            .unwrap()
            .contains("connection refused"));
    }

    #[tokio::test]
    async fn metrics_rendered_as_openmetrics() {
        let state = state(Arc::new(MemoryStore::new()));
        state.metrics.metrics.resync_ticks.inc();

        let response = metrics_handler(State(state)).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers()[header::CONTENT_TYPE]
            .to_str()
            .unwrap()
            .starts_with("application/openmetrics-text"));

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("stagger_resync_ticks_total 1"));
    }
}
