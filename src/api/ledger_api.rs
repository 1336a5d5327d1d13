//! Ledger API Endpoints
//!
//! HTTP surface over the event ledger. Appends are the only write path;
//! everything else reads or re-derives.
//!
//! # Endpoints
//!
//! - `POST /api/instances/:instance_id/events` - Append one event
//! - `GET /api/instances/:instance_id/state` - Current running state
//! - `GET /api/instances/:instance_id/bundle` - Export a proof bundle
//! - `GET /api/instances/:instance_id/lifecycle` - Lifecycle audit trail
//! - `POST /api/instances/:instance_id/lifecycle` - Advance lifecycle
//! - `POST /api/instances/:instance_id/retire` - Manual retirement
//! - `POST /api/instances/:instance_id/notarize` - Notarize latest checkpoint
//! - `POST /api/verify` - Verify a posted bundle
//! - `GET /api/instances` - List instances
//!
//! # Status Codes
//!
//! Append failures map onto HTTP: 400 invalid payload, 429 rate limited
//! (with Retry-After), 503 lock contention, 409 chain break. A failed
//! VERIFICATION is not an HTTP error: `POST /verify` answers 200 with
//! `verified: false` so callers always get the full report.

use axum::{
    extract::{DefaultBodyLimit, Path, Query, State as AxumState},
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::warn;

use crate::ledger::bundle::{BundleError, BundleGenerator, ProofBundle};
use crate::ledger::chain::{AppendRejection, EventLedger, LifecycleUpdateError};
use crate::ledger::lifecycle::{LifecycleError, LifecycleState};
use crate::ledger::notary::NOTARY_REGISTRY;
use crate::ledger::state::RunningState;
use crate::ledger::verify::BundleVerifier;

/// Bundles can be large; verification bodies get their own limit.
const MAX_VERIFY_BODY_BYTES: usize = 16 * 1024 * 1024;

/// Shared state for the ledger API.
pub struct AppState {
    pub ledger: Arc<EventLedger>,
    pub bundles: Arc<BundleGenerator>,
    pub verifier: Arc<BundleVerifier>,
    pub prometheus: PrometheusHandle,
}

// =============================================================================
// RESPONSE HELPERS
// =============================================================================

/// Create an error response with proper status code.
fn error_response(status: StatusCode, message: &str) -> Response {
    let body = serde_json::json!({ "error": message });
    (status, Json(body)).into_response()
}

fn rejection_response(rejection: AppendRejection) -> Response {
    let status = match &rejection {
        AppendRejection::InvalidPayload(_) => StatusCode::BAD_REQUEST,
        AppendRejection::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
        AppendRejection::Busy { .. } => StatusCode::SERVICE_UNAVAILABLE,
        AppendRejection::ChainBreak { .. } => StatusCode::CONFLICT,
        AppendRejection::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };

    let mut body = serde_json::json!({
        "error": rejection.to_string(),
        "reason": rejection.reason(),
    });
    if let AppendRejection::ChainBreak {
        state_seq_no,
        state_hash,
        head_seq_no,
        head_hash,
    } = &rejection
    {
        body["stateSeqNo"] = serde_json::json!(state_seq_no);
        body["stateHash"] = serde_json::json!(state_hash);
        body["headSeqNo"] = serde_json::json!(head_seq_no);
        body["headHash"] = serde_json::json!(head_hash);
    }

    let mut response = (status, Json(body)).into_response();
    if let AppendRejection::RateLimited { retry_after_secs } = &rejection {
        response.headers_mut().insert(
            header::RETRY_AFTER,
            HeaderValue::from_str(&retry_after_secs.to_string())
                .unwrap_or_else(|_| HeaderValue::from_static("60")),
        );
    }
    response
}

fn lifecycle_error_response(error: LifecycleUpdateError) -> Response {
    match error {
        LifecycleUpdateError::UnknownInstance => {
            error_response(StatusCode::NOT_FOUND, "Instance not found")
        }
        LifecycleUpdateError::Lifecycle(e @ LifecycleError::UnknownState { .. }) => {
            error_response(StatusCode::BAD_REQUEST, &e.to_string())
        }
        LifecycleUpdateError::Lifecycle(e) => error_response(StatusCode::CONFLICT, &e.to_string()),
        LifecycleUpdateError::Internal(e) => {
            warn!("Lifecycle update failed: {}", e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, &e)
        }
    }
}

// =============================================================================
// APPEND
// =============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppendEventRequest {
    pub event_type: String,
    pub payload: Value,
    /// Producer-side event time; server receive time when omitted.
    pub timestamp: Option<DateTime<Utc>>,
}

/// POST /api/instances/:instance_id/events - Append one event
pub async fn append_event(
    AxumState(state): AxumState<Arc<AppState>>,
    Path(instance_id): Path<String>,
    Json(request): Json<AppendEventRequest>,
) -> Response {
    let timestamp = request.timestamp.unwrap_or_else(Utc::now);
    match state
        .ledger
        .append(&instance_id, &request.event_type, request.payload, timestamp)
    {
        Ok(event) => (StatusCode::CREATED, Json(event)).into_response(),
        Err(rejection) => rejection_response(rejection),
    }
}

// =============================================================================
// STATE
// =============================================================================

/// GET /api/instances/:instance_id/state - Current running state
pub async fn get_state(
    AxumState(state): AxumState<Arc<AppState>>,
    Path(instance_id): Path<String>,
) -> Response {
    let instance = match state.ledger.store().instance(&instance_id) {
        Ok(Some(row)) => row,
        Ok(None) => return error_response(StatusCode::NOT_FOUND, "Instance not found"),
        Err(e) => {
            warn!("Failed to load instance {}: {}", instance_id, e);
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string());
        }
    };

    let running: RunningState = match state.ledger.running_state(&instance_id) {
        Ok(s) => s,
        Err(e) => {
            warn!("Failed to load running state for {}: {}", instance_id, e);
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string());
        }
    };

    let body = serde_json::json!({
        "instanceId": instance.instance_id,
        "displayName": instance.display_name,
        "lifecycleState": instance.lifecycle_state,
        "state": running,
    });
    Json(body).into_response()
}

/// GET /api/instances - List instances
pub async fn list_instances(AxumState(state): AxumState<Arc<AppState>>) -> Response {
    match state.ledger.store().instances() {
        Ok(rows) => Json(rows).into_response(),
        Err(e) => {
            warn!("Failed to list instances: {}", e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string())
        }
    }
}

// =============================================================================
// PROOF BUNDLES
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct BundleQuery {
    pub from: Option<u64>,
    pub to: Option<u64>,
}

/// GET /api/instances/:instance_id/bundle - Export a proof bundle
pub async fn get_bundle(
    AxumState(state): AxumState<Arc<AppState>>,
    Path(instance_id): Path<String>,
    Query(query): Query<BundleQuery>,
) -> Response {
    match state.bundles.generate(&instance_id, query.from, query.to) {
        Ok(bundle) => Json(bundle).into_response(),
        Err(e @ BundleError::UnknownInstance { .. }) | Err(e @ BundleError::NoEvents { .. }) => {
            error_response(StatusCode::NOT_FOUND, &e.to_string())
        }
        Err(e @ BundleError::InvalidRange { .. }) => {
            error_response(StatusCode::BAD_REQUEST, &e.to_string())
        }
        Err(e @ BundleError::TooLarge { .. }) => {
            error_response(StatusCode::PAYLOAD_TOO_LARGE, &e.to_string())
        }
        Err(BundleError::Storage(e)) => {
            warn!("Bundle generation failed for {}: {}", instance_id, e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, &e)
        }
    }
}

/// POST /api/verify - Verify a posted bundle
///
/// Always 200 when the body parses; the verdict lives in the JSON.
pub async fn verify_bundle(
    AxumState(state): AxumState<Arc<AppState>>,
    Json(bundle): Json<ProofBundle>,
) -> Response {
    let result = state
        .verifier
        .verify_with_notary(&bundle, &NOTARY_REGISTRY)
        .await;
    Json(result).into_response()
}

// =============================================================================
// LIFECYCLE
// =============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LifecycleRequest {
    pub target: String,
    pub reason: Option<String>,
}

/// GET /api/instances/:instance_id/lifecycle - Lifecycle audit trail
pub async fn get_lifecycle(
    AxumState(state): AxumState<Arc<AppState>>,
    Path(instance_id): Path<String>,
) -> Response {
    match state.ledger.store().instance(&instance_id) {
        Ok(Some(_)) => {}
        Ok(None) => return error_response(StatusCode::NOT_FOUND, "Instance not found"),
        Err(e) => return error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
    }
    match state.ledger.store().lifecycle_log(&instance_id) {
        Ok(transitions) => Json(transitions).into_response(),
        Err(e) => {
            warn!("Failed to load lifecycle log for {}: {}", instance_id, e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string())
        }
    }
}

/// POST /api/instances/:instance_id/lifecycle - Advance lifecycle
pub async fn advance_lifecycle(
    AxumState(state): AxumState<Arc<AppState>>,
    Path(instance_id): Path<String>,
    Json(request): Json<LifecycleRequest>,
) -> Response {
    let target = match LifecycleState::from_label(&request.target) {
        Ok(target) => target,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, &e.to_string()),
    };
    let reason = request.reason.as_deref().unwrap_or("unspecified");

    match state.ledger.advance_lifecycle(&instance_id, target, reason) {
        Ok(transition) => Json(transition).into_response(),
        Err(e) => lifecycle_error_response(e),
    }
}

/// POST /api/instances/:instance_id/retire - Manual retirement
pub async fn retire_instance(
    AxumState(state): AxumState<Arc<AppState>>,
    Path(instance_id): Path<String>,
) -> Response {
    match state.ledger.retire(&instance_id) {
        Ok(transition) => Json(transition).into_response(),
        Err(e) => lifecycle_error_response(e),
    }
}

// =============================================================================
// NOTARIZATION
// =============================================================================

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotarizeRequest {
    pub provider: Option<String>,
}

/// POST /api/instances/:instance_id/notarize - Notarize latest checkpoint
pub async fn notarize_checkpoint(
    AxumState(state): AxumState<Arc<AppState>>,
    Path(instance_id): Path<String>,
    request: Option<Json<NotarizeRequest>>,
) -> Response {
    let request = request.map(|Json(r)| r).unwrap_or_default();
    let provider_name = match request.provider {
        Some(name) => name,
        None => match NOTARY_REGISTRY.names().into_iter().next() {
            Some(name) => name,
            None => {
                return error_response(
                    StatusCode::SERVICE_UNAVAILABLE,
                    "No notary provider registered",
                )
            }
        },
    };
    let Some(provider) = NOTARY_REGISTRY.get(&provider_name) else {
        return error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            &format!("Notary provider '{}' not registered", provider_name),
        );
    };

    let checkpoint = match state.ledger.store().latest_checkpoint(&instance_id) {
        Ok(Some(checkpoint)) => checkpoint,
        Ok(None) => return error_response(StatusCode::NOT_FOUND, "No checkpoint to notarize"),
        Err(e) => return error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
    };

    let receipt = match provider.notarize(&checkpoint.hmac).await {
        Ok(receipt) => receipt,
        Err(e) => {
            warn!("Notarization via '{}' failed: {}", provider_name, e);
            return error_response(StatusCode::BAD_GATEWAY, &e.to_string());
        }
    };
    if let Err(e) = state
        .ledger
        .store()
        .store_receipt(&instance_id, checkpoint.seq_no, &receipt)
    {
        warn!("Failed to persist notary receipt: {}", e);
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string());
    }

    let body = serde_json::json!({
        "instanceId": instance_id,
        "seqNo": checkpoint.seq_no,
        "receipt": receipt,
    });
    Json(body).into_response()
}

// =============================================================================
// OPERATIONAL
// =============================================================================

/// GET /health - Liveness plus storage counters
pub async fn health_check(AxumState(state): AxumState<Arc<AppState>>) -> Response {
    match state.ledger.store().stats() {
        Ok(stats) => Json(serde_json::json!({
            "status": "ok",
            "instances": stats.instances,
            "events": stats.events,
            "checkpoints": stats.checkpoints,
        }))
        .into_response(),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
    }
}

/// GET /metrics - Prometheus exposition
pub async fn render_metrics(AxumState(state): AxumState<Arc<AppState>>) -> Response {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.prometheus.render(),
    )
        .into_response()
}

// =============================================================================
// ROUTERS
// =============================================================================

/// Create the ledger API router (nest under /api).
pub fn ledger_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/instances", get(list_instances))
        .route("/instances/:instance_id/events", post(append_event))
        .route("/instances/:instance_id/state", get(get_state))
        .route("/instances/:instance_id/bundle", get(get_bundle))
        .route(
            "/instances/:instance_id/lifecycle",
            get(get_lifecycle).post(advance_lifecycle),
        )
        .route("/instances/:instance_id/retire", post(retire_instance))
        .route("/instances/:instance_id/notarize", post(notarize_checkpoint))
        .route(
            "/verify",
            post(verify_bundle).layer(DefaultBodyLimit::max(MAX_VERIFY_BODY_BYTES)),
        )
}

/// Health and metrics, exposed without the /api prefix.
pub fn public_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(render_metrics))
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::checkpoint::{CheckpointSigner, SecretPair};
    use crate::ledger::rate_limit::{MemoryAdmissionStore, RateLimiter};
    use crate::ledger::store::LedgerStore;
    use axum::body::Body;
    use axum::http::Request;
    use metrics_exporter_prometheus::PrometheusBuilder;
    use tower::ServiceExt;

    fn make_state() -> Arc<AppState> {
        let store = Arc::new(LedgerStore::open_in_memory().unwrap());
        let secrets = SecretPair::new("api-test-secret", None).unwrap();
        let signer = Arc::new(CheckpointSigner::new(secrets.clone()));
        let limiter = RateLimiter::new(Arc::new(MemoryAdmissionStore::new()), 10_000);
        let ledger = Arc::new(EventLedger::new(store.clone(), limiter, signer));
        Arc::new(AppState {
            ledger,
            bundles: Arc::new(BundleGenerator::new(store)),
            verifier: Arc::new(BundleVerifier::new(secrets)),
            prometheus: PrometheusBuilder::new().build_recorder().handle(),
        })
    }

    fn app(state: Arc<AppState>) -> Router {
        Router::new()
            .nest("/api", ledger_router())
            .merge(public_router())
            .with_state(state)
    }

    fn post_json(uri: &str, body: &serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(serde_json::to_vec(body).unwrap()))
            .unwrap()
    }

    fn trade_open_body() -> serde_json::Value {
        serde_json::json!({
            "eventType": "TRADE_OPEN",
            "payload": {
                "ticket": 7, "symbol": "EURUSD", "direction": "BUY",
                "lots": 0.1, "openPrice": 1.0800
            }
        })
    }

    #[tokio::test]
    async fn test_append_then_read_state() {
        let app = app(make_state());

        let response = app
            .clone()
            .oneshot(post_json("/api/instances/inst-1/events", &trade_open_body()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/instances/inst-1/state")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_invalid_payload_rejected_with_400() {
        let app = app(make_state());

        let body = serde_json::json!({
            "eventType": "TRADE_OPEN",
            "payload": { "symbol": "EURUSD" }
        });
        let response = app
            .oneshot(post_json("/api/instances/inst-1/events", &body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_unknown_instance_state_404() {
        let app = app(make_state());

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/instances/nope/state")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_bundle_export_and_verify_roundtrip() {
        let state = make_state();
        let app = app(state.clone());

        app.clone()
            .oneshot(post_json("/api/instances/inst-1/events", &trade_open_body()))
            .await
            .unwrap();

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/api/instances/inst-1/bundle")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        // The HTTP body and the generator output are the same JSON, so
        // feed the generator's bundle back through the verify endpoint.
        let bundle = state.bundles.generate("inst-1", None, None).unwrap();
        let response = app
            .oneshot(post_json(
                "/api/verify",
                &serde_json::to_value(&bundle).unwrap(),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_bundle_for_empty_instance_404() {
        let app = app(make_state());

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/instances/inst-1/bundle")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_retire_then_retire_again_conflicts() {
        let app = app(make_state());

        app.clone()
            .oneshot(post_json("/api/instances/inst-1/events", &trade_open_body()))
            .await
            .unwrap();

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/instances/inst-1/retire")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/instances/inst-1/retire")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_health_reports_counters() {
        let app = app(make_state());

        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_metrics_endpoint_renders() {
        let app = app(make_state());

        let response = app
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
