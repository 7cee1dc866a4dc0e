//! Common test utilities for API testing with mocks.
//!
//! This module provides a test fixture that creates an in-process server
//! whose orchestrator runs mock stages in front of a real register stage
//! backed by a mock registrar. Install lifecycles can be driven over HTTP
//! without depot tools, rsync or a remote host.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tempfile::TempDir;
use tower::ServiceExt;

use decklift_core::pipeline::{CleanupController, PipelineConfig, PipelineStateMachine};
use decklift_core::stage::{RegisterStage, RetryConfig, StageKind, StageRunner};
use decklift_core::testing::{MockRegistrar, MockRemoteChannel, MockStage};
use decklift_core::{Config, InstallOrchestrator, ProgressBus};

/// Re-export fixtures for test convenience
pub use decklift_core::testing::fixtures;

/// Test fixture for API testing with mock dependencies.
///
/// # Example
///
/// ```rust,ignore
/// #[tokio::test]
/// async fn test_install_creation() {
///     let fixture = TestFixture::new().await;
///     let response = fixture.post("/api/v1/installs", fixture.install_body("220")).await;
///     assert_eq!(response.status, StatusCode::CREATED);
/// }
/// ```
pub struct TestFixture {
    pub router: Router,
    pub orchestrator: Arc<InstallOrchestrator>,
    pub registrar: MockRegistrar,
    pub temp_dir: TempDir,
}

/// Response from a test request.
#[derive(Debug)]
pub struct TestResponse {
    pub status: StatusCode,
    pub body: Value,
}

impl TestFixture {
    /// Create a fixture whose installs succeed immediately.
    pub async fn new() -> Self {
        Self::with_stages(vec![
            MockStage::new(StageKind::Download),
            MockStage::new(StageKind::Patch),
        ])
        .await
    }

    /// Create a fixture whose download stage hangs until cancelled.
    pub async fn hanging() -> Self {
        Self::with_stages(vec![MockStage::new(StageKind::Download).hanging(30, 100)])
        .await
    }

    /// Create a fixture running the given stages in order, then registering
    /// through [`TestFixture::registrar`].
    pub async fn with_stages(stages: Vec<MockStage>) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let registrar = MockRegistrar::new();

        let stages = stages
            .into_iter()
            .map(|s| Arc::new(s) as Arc<dyn StageRunner>)
            .chain(std::iter::once(Arc::new(RegisterStage::new(
                Arc::new(registrar.clone()),
                RetryConfig::immediate(1),
            )) as Arc<dyn StageRunner>))
            .collect();
        let machine = PipelineStateMachine::new(
            stages,
            CleanupController::new(Arc::new(MockRemoteChannel::new())),
            ProgressBus::new(256),
            PipelineConfig::default()
                .with_poll_interval(10)
                .with_cancel_grace(1),
        );

        let library = fixtures::library(temp_dir.path());
        let orchestrator = Arc::new(InstallOrchestrator::new(
            machine,
            Arc::new(registrar.clone()),
            library.clone(),
            None,
        ));
        orchestrator.start().await;

        let config = Config {
            library,
            ..Config::default()
        };
        let state = Arc::new(decklift_server::state::AppState::new(
            config,
            Arc::clone(&orchestrator),
        ));
        let router = decklift_server::api::create_router(state);

        Self {
            router,
            orchestrator,
            registrar,
            temp_dir,
        }
    }

    /// JSON body for a local install of `app_id` with one depot.
    pub fn install_body(&self, app_id: &str) -> Value {
        let root = self.temp_dir.path();
        json!({
            "app_id": app_id,
            "display_name": format!("Game {}", app_id),
            "topology": "local",
            "depot_items": [{
                "depot_id": format!("{}1", app_id),
                "manifest_id": "7613356809904811",
                "manifest_path": root.join("manifests").join(format!("{}1.manifest", app_id)),
                "decryption_key": format!("{:0>64}", app_id),
                "size_bytes": 1048576
            }]
        })
    }

    /// Poll an install until it reports `phase`.
    pub async fn wait_for_phase(&self, job_id: &str, phase: &str) -> Value {
        let path = format!("/api/v1/installs/{}", job_id);
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let response = self.get(&path).await;
                if response.body["phase"] == phase {
                    return response.body;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("install {} never reached {}", job_id, phase))
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

    /// Send a DELETE request.
    pub async fn delete(&self, path: &str) -> TestResponse {
        self.request("DELETE", path, None).await
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

    /// Send a request to the test server.
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
