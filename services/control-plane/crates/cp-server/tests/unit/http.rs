//! HTTP routes, exercised in-process.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use axum::body::Body;
use axum::http::{Request, StatusCode};
use fleet_common::AgentInfo;
use fleet_cp_server::http::router;
use http_body_util::BodyExt;
use tower::ServiceExt;
use uuid::Uuid;

use crate::mocks::harness;

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

#[tokio::test]
async fn health_returns_ok() {
    let h = harness(false).await;

    let response = router(h.manager).oneshot(get("/health")).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn agents_lists_registered_agents_as_json() {
    let h = harness(true).await;
    let id = Uuid::new_v4();
    h.manager
        .create_agent(&AgentInfo::new(id, "node-1"))
        .await
        .unwrap();

    let response = router(h.manager).oneshot(get("/agents")).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let agents: Vec<AgentInfo> = serde_json::from_slice(&body).unwrap();
    assert_eq!(agents.len(), 1);
    assert_eq!(agents[0].agent_id, id);
    assert_eq!(agents[0].hostname, "node-1");
}

#[tokio::test]
async fn agents_reports_unavailable_when_store_is_down() {
    let h = harness(false).await;
    h.store.set_unavailable(true);

    let response = router(h.manager).oneshot(get("/agents")).await.unwrap();

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}
