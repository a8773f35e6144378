// Status surface: the read-only status document and its optional HTTP router.
//
//   GET  /healthz  → liveness plus current mode
//   GET  /status   → full status document
//   POST /restart  → explicit force-restart hook
//
// Every response carries an `x-request-id` header and is logged on completion.

use std::sync::Arc;
use std::time::Instant;

use axum::{
    body::Body,
    extract::State,
    http::{header::HeaderValue, Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use serde_json::json;
use tether_common::types::{ConnectionState, EpochMs, Incident};
use tracing::{info, warn};
use uuid::Uuid;

use crate::auth_state::AuthInfo;
use crate::bootstrap::Coordinator;
use crate::circuit::ReconnectMode;
use crate::gate::Mode;
use crate::health::HealthSnapshot;
use crate::keepalive::KeepaliveSnapshot;
use crate::lease::LeaseStatus;
use crate::outbox::OutboxStats;
use crate::socket::SessionSocket;
use crate::store::DocumentStore;

const REQUEST_ID_HEADER: &str = "x-request-id";

// ── Status document ─────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GateStatus {
    pub can_start_session: bool,
    pub can_process_outbox: bool,
    pub can_process_inbound: bool,
    pub pairing_required: bool,
    pub sends_open_at: Option<EpochMs>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconnectStatus {
    pub mode: ReconnectMode,
    pub cooldown_until: Option<EpochMs>,
    pub recent_closes: usize,
    pub pending_reconnect: bool,
    pub connecting: bool,
    pub last_connect_attempt_at: Option<EpochMs>,
    pub socket_generation: Option<u64>,
}

/// Point-in-time view of the coordinator. Sections backed by the durable
/// store are `None` when the read failed; the failure is in `errors`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub instance_id: String,
    pub mode: Mode,
    pub lock: Option<LeaseStatus>,
    pub connection: ConnectionState,
    pub gates: GateStatus,
    pub reconnect: ReconnectStatus,
    pub keepalive: KeepaliveSnapshot,
    pub outbox: Option<OutboxStats>,
    pub health: HealthSnapshot,
    pub lag_p95_ms: Option<u64>,
    pub incidents: Option<Vec<Incident>>,
    pub auth: Option<AuthInfo>,
    pub errors: Vec<String>,
    pub generated_at: Option<String>,
}

impl StatusReport {
    pub fn is_degraded(&self) -> bool {
        self.health.degraded_since.is_some()
    }
}

// ── Router ──────────────────────────────────────────────────────────

pub fn router<D: DocumentStore, S: SessionSocket>(coordinator: Arc<Coordinator<D, S>>) -> Router {
    Router::new()
        .route("/healthz", get(healthz::<D, S>))
        .route("/status", get(status::<D, S>))
        .route("/restart", post(restart::<D, S>))
        .with_state(coordinator)
        .layer(middleware::from_fn(request_context_middleware))
}

async fn healthz<D: DocumentStore, S: SessionSocket>(
    State(coordinator): State<Arc<Coordinator<D, S>>>,
) -> impl IntoResponse {
    let gate = coordinator.gate();
    (
        StatusCode::OK,
        Json(json!({
            "status": "ok",
            "instanceId": coordinator.instance_id(),
            "mode": gate.mode(),
            "degraded": coordinator.health().is_degraded(),
        })),
    )
}

async fn status<D: DocumentStore, S: SessionSocket>(
    State(coordinator): State<Arc<Coordinator<D, S>>>,
) -> Json<StatusReport> {
    Json(coordinator.status().await)
}

async fn restart<D: DocumentStore, S: SessionSocket>(
    State(coordinator): State<Arc<Coordinator<D, S>>>,
) -> impl IntoResponse {
    warn!(instance_id = %coordinator.instance_id(), "restart requested over HTTP");
    coordinator.force_restart();
    (StatusCode::ACCEPTED, Json(json!({ "restarting": true, "reason": "force_restart" })))
}

async fn request_context_middleware(request: Request<Body>, next: Next) -> Response {
    let request_id = request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .map(ToOwned::to_owned)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let method = request.method().clone();
    let path = request.uri().path().to_owned();
    let started_at = Instant::now();

    let mut response = next.run(request).await;

    if let Ok(request_id_header) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, request_id_header);
    }

    info!(
        request_id = %request_id,
        method = %method,
        path = %path,
        status = response.status().as_u16(),
        latency_ms = started_at.elapsed().as_millis() as u64,
        "request completed"
    );

    response
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use axum::body::{to_bytes, Body};
    use axum::http::{Method, Request, StatusCode};
    use serde_json::Value;
    use tower::ServiceExt;

    use super::*;
    use crate::auto_heal::ExitReason;
    use crate::clock::TokioClock;
    use crate::config::CoordinatorConfig;
    use crate::store::MemoryStore;
    use crate::test_support::ScriptedSocket;

    fn coordinator(exits: Arc<AtomicUsize>) -> Arc<Coordinator<MemoryStore, ScriptedSocket>> {
        let config = CoordinatorConfig { instance_id: Some("status-test".into()), ..Default::default() };
        let exit = Arc::new(move |_: ExitReason| {
            exits.fetch_add(1, Ordering::SeqCst);
        });
        let (coordinator, _inbound) =
            Coordinator::new(config, MemoryStore::new(), ScriptedSocket::shared(), TokioClock::shared(), exit);
        coordinator
    }

    async fn body_json(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), 1024 * 1024).await.expect("body");
        serde_json::from_slice(&bytes).expect("json body")
    }

    #[tokio::test]
    async fn healthz_reports_mode_and_request_id() {
        let app = router(coordinator(Arc::new(AtomicUsize::new(0))));
        let response = app
            .oneshot(Request::builder().uri("/healthz").body(Body::empty()).expect("request"))
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key("x-request-id"));
        let body = body_json(response).await;
        assert_eq!(body["mode"], "passive");
        assert_eq!(body["instanceId"], "status-test");
    }

    #[tokio::test]
    async fn request_id_is_echoed() {
        let app = router(coordinator(Arc::new(AtomicUsize::new(0))));
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/healthz")
                    .header("x-request-id", "req-42")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.headers()["x-request-id"], "req-42");
    }

    #[tokio::test]
    async fn status_document_lists_gates_and_outbox() {
        let app = router(coordinator(Arc::new(AtomicUsize::new(0))));
        let response = app
            .oneshot(Request::builder().uri("/status").body(Body::empty()).expect("request"))
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["instanceId"], "status-test");
        assert_eq!(body["gates"]["canProcessOutbox"], false);
        assert_eq!(body["outbox"]["pendingCount"], 0);
        assert_eq!(body["reconnect"]["mode"], "NORMAL");
        assert_eq!(body["connection"]["waStatus"], "DISCONNECTED");
        assert!(body["generatedAt"].is_string());
    }

    #[tokio::test]
    async fn restart_invokes_exit_hook() {
        let exits = Arc::new(AtomicUsize::new(0));
        let app = router(coordinator(exits.clone()));
        let response = app
            .oneshot(Request::builder().method(Method::POST).uri("/restart").body(Body::empty()).expect("request"))
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert_eq!(exits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn restart_rejects_get() {
        let app = router(coordinator(Arc::new(AtomicUsize::new(0))));
        let response = app
            .oneshot(Request::builder().uri("/restart").body(Body::empty()).expect("request"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    }
}
