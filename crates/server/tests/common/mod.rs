//! Common test utilities for in-process API testing.
//!
//! This module provides a test fixture that builds the router around a relay
//! service backed by the in-memory broker, so the whole HTTP surface can be
//! exercised without a running Kafka cluster.

#![allow(dead_code)]

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::Value;
use tower::ServiceExt;

use relay_core::{start_relay_service, Config, MemoryBroker, RelayService};

/// Re-export fixtures for test convenience
pub use relay_core::testing::fixtures;

/// Test fixture with a controllable broker.
///
/// # Example
///
/// ```rust,ignore
/// #[tokio::test]
/// async fn test_status() {
///     let fixture = TestFixture::new().await;
///
///     let response = fixture.get("/api/status").await;
///
///     assert_eq!(response.body["status"], "IDLE");
/// }
/// ```
pub struct TestFixture {
    /// The Axum router for testing
    pub router: Router,
    /// In-memory broker - append instructions, inspect commits
    pub broker: MemoryBroker,
    /// The relay behind the router
    pub service: RelayService,
    pub config: Config,
}

/// Response from a test request
#[derive(Debug)]
pub struct TestResponse {
    pub status: StatusCode,
    pub body: Value,
}

impl TestFixture {
    /// Create a new test fixture with fast timeouts.
    pub async fn new() -> Self {
        Self::with_config(fixtures::fast_config()).await
    }

    /// Create a test fixture with custom configuration.
    pub async fn with_config(config: Config) -> Self {
        let broker = MemoryBroker::new();
        let service = start_relay_service(config.clone(), Arc::new(broker.clone()))
            .expect("Failed to start relay service");

        let state = Arc::new(relay_server::state::AppState::new(
            config.clone(),
            service.clone(),
        ));
        let router = relay_server::api::create_router(state);

        Self {
            router,
            broker,
            service,
            config,
        }
    }

    /// Append instructions to the instruction partition.
    pub fn publish(&self, instructions: &[relay_core::Instruction]) {
        for instruction in instructions {
            self.broker
                .append_json(&self.config.broker.instruction_topic, 0, instruction);
        }
    }

    /// Next committed offset of the instruction partition.
    pub fn committed(&self) -> Option<i64> {
        self.broker.committed_offset(
            &self.config.broker.consumer_group,
            &self.config.broker.instruction_topic,
            0,
        )
    }

    /// Send a GET request to the test server.
    pub async fn get(&self, path: &str) -> TestResponse {
        self.request("GET", path, None).await
    }

    /// Send a POST request with JSON body.
    pub async fn post(&self, path: &str, body: Value) -> TestResponse {
        self.request("POST", path, Some(body)).await
    }

    /// Send a POST request without a body.
    pub async fn post_empty(&self, path: &str) -> TestResponse {
        self.request("POST", path, None).await
    }

    /// Send a POST request with raw string body (for testing malformed JSON).
    pub async fn post_raw(&self, path: &str, body: &str) -> TestResponse {
        let request = Request::builder()
            .method("POST")
            .uri(path)
            .header("Content-Type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        self.send(request).await
    }

    /// Send a GET request and return the raw body text.
    pub async fn get_text(&self, path: &str) -> (StatusCode, String) {
        let request = Request::builder()
            .method("GET")
            .uri(path)
            .body(Body::empty())
            .unwrap();
        let response = self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("Failed to send request");
        let status = response.status();
        let bytes = response
            .into_body()
            .collect()
            .await
            .expect("Failed to collect body")
            .to_bytes();
        (status, String::from_utf8_lossy(&bytes).into_owned())
    }

    async fn request(&self, method: &str, path: &str, body: Option<Value>) -> TestResponse {
        let mut request_builder = Request::builder().method(method).uri(path);

        let body = if let Some(json_body) = body {
            request_builder = request_builder.header("Content-Type", "application/json");
            Body::from(serde_json::to_vec(&json_body).unwrap())
        } else {
            Body::empty()
        };

        self.send(request_builder.body(body).unwrap()).await
    }

    async fn send(&self, request: Request<Body>) -> TestResponse {
        let response = self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("Failed to send request");

        let status = response.status();
        let body_bytes = response
            .into_body()
            .collect()
            .await
            .expect("Failed to collect body")
            .to_bytes();

        let body: Value = if body_bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&body_bytes).unwrap_or(Value::Null)
        };

        TestResponse { status, body }
    }
}

/// Helper to assert a response has expected status.
#[macro_export]
macro_rules! assert_status {
    ($response:expr, $status:expr) => {
        assert_eq!(
            $response.status, $status,
            "Expected status {:?}, got {:?}. Body: {}",
            $status,
            $response.status,
            serde_json::to_string_pretty(&$response.body).unwrap_or_default()
        );
    };
}
