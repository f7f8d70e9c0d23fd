//! Integration tests for the health/metrics API

use axum::body::Body;
use axum::http::{Request, StatusCode};
use std::sync::Arc;
use topology_agent_lib::conditions::{ConditionType, ConditionUpdate};
use topology_agent_lib::HealthRegistry;
use tower::ServiceExt;

#[path = "../src/api.rs"]
mod api;

async fn get(router: axum::Router, path: &str) -> StatusCode {
    let response = router
        .oneshot(Request::builder().uri(path).body(Body::empty()).unwrap())
        .await
        .unwrap();
    response.status()
}

fn router_with(health: HealthRegistry) -> axum::Router {
    api::create_router(Arc::new(api::AppState::new(health)))
}

#[tokio::test]
async fn test_healthz_is_ok_even_with_failing_conditions() {
    let health = HealthRegistry::new();
    health
        .apply(&ConditionUpdate::failed(
            ConditionType::PodresourcesFetched,
            "kubelet unreachable",
        ))
        .await;

    let status = get(router_with(health), "/healthz").await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_readyz_not_ready_before_initialization() {
    let health = HealthRegistry::new();

    let status = get(router_with(health), "/readyz").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_readyz_tracks_pipeline_conditions() {
    let health = HealthRegistry::new();
    health.set_ready(true).await;
    health
        .apply(&ConditionUpdate::ok(ConditionType::PodresourcesFetched))
        .await;
    health
        .apply(&ConditionUpdate::ok(ConditionType::NodeTopologyUpdated))
        .await;

    let router = router_with(health.clone());
    assert_eq!(get(router.clone(), "/readyz").await, StatusCode::OK);

    health
        .apply(&ConditionUpdate::failed(
            ConditionType::NodeTopologyUpdated,
            "conflict",
        ))
        .await;
    assert_eq!(get(router, "/readyz").await, StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_metrics_endpoint_responds() {
    let health = HealthRegistry::new();
    let status = get(router_with(health), "/metrics").await;
    assert_eq!(status, StatusCode::OK);
}
