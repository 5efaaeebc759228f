//! In-process tests of the HTTP surface against the in-memory broker.

mod common;

use std::time::Duration;

use axum::http::StatusCode;
use serde_json::json;

use common::{fixtures, TestFixture};
use relay_core::testing::wait_until;
use relay_core::{CheckpointSource, CommitPolicy};

const WAIT: Duration = Duration::from_secs(5);

fn checkpoint_body(step: &str, km: f64) -> serde_json::Value {
    json!({
        "type": "checkpoint",
        "step": step,
        "id": step,
        "group_id": "pilot",
        "km_travelled": km,
    })
}

#[tokio::test]
async fn test_health() {
    let fixture = TestFixture::new().await;

    let response = fixture.get("/health").await;

    assert_status!(response, StatusCode::OK);
    assert_eq!(response.body["status"], "ok");
}

#[tokio::test]
async fn test_status_starts_idle() {
    let fixture = TestFixture::new().await;

    let response = fixture.get("/api/status").await;

    assert_status!(response, StatusCode::OK);
    assert_eq!(response.body["status"], "IDLE");
    assert_eq!(response.body["ready_sent"], false);
    assert_eq!(response.body["consuming"], false);
    assert_eq!(response.body["total_km_travelled"], 0.0);
    assert_eq!(response.body["pending_checkpoints"], 0);
}

#[tokio::test]
async fn test_config_is_sanitized() {
    let mut config = fixtures::fast_config();
    config.broker.sasl_username = Some("pilot".to_string());
    config.broker.sasl_password = Some("hunter2".to_string());
    let fixture = TestFixture::with_config(config).await;

    let response = fixture.get("/api/config").await;

    assert_status!(response, StatusCode::OK);
    assert_eq!(response.body["broker"]["credentials_configured"], true);
    assert_eq!(response.body["broker"]["consumer_group"], "pilot");
    assert!(!response.body.to_string().contains("hunter2"));
}

#[tokio::test]
async fn test_start_race_then_instructions_flow() {
    let fixture = TestFixture::new().await;
    fixture.publish(&fixtures::start_then_forward());

    let response = fixture.post_empty("/api/start-race").await;
    assert_status!(response, StatusCode::OK);
    assert_eq!(response.body["success"], true);
    assert_eq!(response.body["message"], "Race started");

    assert!(wait_until(WAIT, || fixture.committed() == Some(2)).await);

    let response = fixture.get("/instructions").await;
    assert_status!(response, StatusCode::OK);
    let ids: Vec<&str> = response
        .body
        .as_array()
        .unwrap()
        .iter()
        .map(|i| i["id"].as_str().unwrap())
        .collect();
    assert_eq!(ids, vec!["1", "2"]);

    let status = fixture.get("/api/status").await;
    assert_eq!(status.body["status"], "DRIVING");
    assert_eq!(status.body["total_km_travelled"], 0.2);
    assert_eq!(status.body["instructions_processed"], 2);

    fixture.post_empty("/api/stop").await;
}

#[tokio::test]
async fn test_next_instruction_walks_the_journal() {
    let mut config = fixtures::fast_config();
    config.relay.commit_policy = CommitPolicy::Immediate;
    let fixture = TestFixture::with_config(config).await;
    fixture.publish(&fixtures::start_then_forward());

    let response = fixture.get("/next-instruction").await;
    assert_status!(response, StatusCode::OK);
    assert!(response.body.is_null());

    fixture.post_empty("/ready").await;
    assert!(wait_until(WAIT, || fixture.service.instructions().len() == 2).await);

    assert_eq!(fixture.get("/next-instruction").await.body["id"], "1");
    assert_eq!(fixture.get("/next-instruction").await.body["id"], "2");
    assert!(fixture.get("/next-instruction").await.body.is_null());

    fixture.post_empty("/api/stop").await;
}

#[tokio::test]
async fn test_ready_twice_conflicts() {
    let fixture = TestFixture::new().await;

    let first = fixture.post_empty("/ready").await;
    assert_status!(first, StatusCode::OK);
    assert_eq!(first.body["success"], true);

    let second = fixture.post_empty("/ready").await;
    assert_status!(second, StatusCode::CONFLICT);
    assert_eq!(second.body["success"], false);
    assert!(second.body["message"]
        .as_str()
        .unwrap()
        .contains("already sent"));

    fixture.post_empty("/api/stop").await;
}

#[tokio::test]
async fn test_start_race_reports_unreachable_broker() {
    let fixture = TestFixture::new().await;
    fixture.broker.set_unreachable(true);

    let response = fixture.post_empty("/api/start-race").await;

    assert_status!(response, StatusCode::OK);
    assert_eq!(response.body["success"], false);
    assert!(response.body["message"]
        .as_str()
        .unwrap()
        .starts_with("Failed to start race"));
    assert_eq!(fixture.get("/api/status").await.body["status"], "IDLE");
}

#[tokio::test]
async fn test_external_checkpoint_releases_commit() {
    let mut config = fixtures::fast_config();
    config.relay.checkpoint_source = CheckpointSource::External;
    let fixture = TestFixture::with_config(config).await;
    fixture.publish(&fixtures::start_then_forward());

    fixture.post_empty("/api/start-race").await;
    assert!(wait_until(WAIT, || fixture.service.pending_checkpoints() == 2).await);

    let response = fixture.post("/checkpoint", checkpoint_body("1", 0.0)).await;
    assert_status!(response, StatusCode::OK);
    assert_eq!(response.body["success"], true);

    assert!(wait_until(WAIT, || fixture.committed() == Some(1)).await);

    let forwarded: Vec<_> = fixture
        .broker
        .produced(&fixture.config.broker.checkpoint_topic)
        .iter()
        .map(|r| r.json())
        .filter(|v| v["type"] == "checkpoint")
        .collect();
    assert_eq!(forwarded.len(), 1);
    assert_eq!(forwarded[0]["step"], "1");

    fixture.post_empty("/api/stop").await;
}

#[tokio::test]
async fn test_checkpoint_with_wrong_type_is_rejected() {
    let fixture = TestFixture::new().await;
    let mut body = checkpoint_body("1", 0.0);
    body["type"] = json!("ready");

    let response = fixture.post("/checkpoint", body).await;

    assert_status!(response, StatusCode::BAD_REQUEST);
    assert_eq!(response.body["success"], false);
}

#[tokio::test]
async fn test_malformed_checkpoint_is_unprocessable() {
    let fixture = TestFixture::new().await;

    let response = fixture
        .post("/checkpoint", json!({ "type": "checkpoint" }))
        .await;
    assert_eq!(response.status, StatusCode::UNPROCESSABLE_ENTITY);

    let response = fixture.post_raw("/checkpoint", "{not json").await;
    assert_eq!(response.status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_stop_and_reset() {
    let fixture = TestFixture::new().await;
    fixture.publish(&fixtures::start_then_forward());

    fixture.post_empty("/api/start-race").await;
    assert!(wait_until(WAIT, || fixture.committed() == Some(2)).await);

    let response = fixture.post_empty("/api/stop").await;
    assert_eq!(response.body["success"], true);
    assert_eq!(response.body["message"], "Service stopped");
    let status = fixture.get("/api/status").await;
    assert_eq!(status.body["status"], "IDLE");
    assert_eq!(status.body["consuming"], false);
    assert_eq!(status.body["ready_sent"], true);

    let response = fixture.post_empty("/api/reset").await;
    assert_eq!(response.body["message"], "Service reset");
    let status = fixture.get("/api/status").await;
    assert_eq!(status.body["ready_sent"], false);
    assert_eq!(status.body["instructions_processed"], 0);
    assert_eq!(fixture.get("/instructions").await.body, json!([]));
}

#[tokio::test]
async fn test_connectivity_report() {
    let fixture = TestFixture::new().await;
    fixture
        .broker
        .create_topic(&fixture.config.broker.instruction_topic);

    let response = fixture.get("/api/test-connectivity").await;
    assert_status!(response, StatusCode::OK);
    assert_eq!(response.body["success"], true);
    assert_eq!(response.body["message"], "Connectivity test passed");
    assert_eq!(response.body["stages"].as_array().unwrap().len(), 3);

    fixture.broker.set_unreachable(true);
    let response = fixture.get("/api/test-connectivity").await;
    assert_eq!(response.body["success"], false);
    assert_eq!(response.body["stages"][0]["stage"], "tcp");
    assert_eq!(response.body["stages"][0]["success"], false);
}

#[tokio::test]
async fn test_metrics_endpoint() {
    let fixture = TestFixture::new().await;
    fixture.get("/health").await;

    let (status, body) = fixture.get_text("/metrics").await;

    assert_eq!(status, StatusCode::OK);
    assert!(body.contains("relay_http_requests_total"));
    assert!(body.contains("relay_status"));
    assert!(body.contains("relay_subscribers"));
}

#[tokio::test]
async fn test_unknown_route_is_not_found() {
    let fixture = TestFixture::new().await;

    let response = fixture.get("/api/unknown").await;

    assert_eq!(response.status, StatusCode::NOT_FOUND);
}
