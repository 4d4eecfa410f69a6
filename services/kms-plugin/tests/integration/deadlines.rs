//! Slow vaults must not hang callers.

use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use kms_plugin::healthz::{self, HealthChecker};
use kms_plugin::metrics::{ENCRYPT_OPERATION, ERROR_CANCELLED, KMS_REQUEST, STATUS_ERROR};
use kms_plugin::proto::v2::key_management_service_client::KeyManagementServiceClient as V2Client;
use kms_plugin::proto::v2::EncryptRequest;
use tonic::Code;
use tower::ServiceExt;

use crate::support::TestServer;

fn samples(operation: &str, status: &str, error: &str) -> u64 {
    KMS_REQUEST
        .with_label_values(&[operation, status, error])
        .get_sample_count()
}

#[tokio::test]
async fn test_slow_encrypt_hits_rpc_timeout() {
    let server = TestServer::key_vault_with_timeout(Duration::from_millis(100)).await;
    server.vault().set_delay(Duration::from_secs(2));
    let mut v2 = V2Client::new(server.channel().await);

    let before = samples(ENCRYPT_OPERATION, STATUS_ERROR, ERROR_CANCELLED);
    let err = tokio::time::timeout(
        Duration::from_secs(1),
        v2.encrypt(EncryptRequest {
            plaintext: b"secret".to_vec(),
            uid: "uid-1".to_string(),
        }),
    )
    .await
    .expect("rpc timeout did not fire")
    .unwrap_err();

    assert_eq!(err.code(), Code::Cancelled);
    assert!(err.message().contains("Timeout expired"));
    assert!(samples(ENCRYPT_OPERATION, STATUS_ERROR, ERROR_CANCELLED) > before);

    server.vault().set_delay(Duration::ZERO);
    drop(v2);
    server.stop().await;
}

#[tokio::test]
async fn test_slow_health_check_is_unavailable() {
    let server = TestServer::key_vault().await;
    server.vault().set_delay(Duration::from_millis(500));

    let checker = HealthChecker::new(server.endpoint.clone(), Duration::from_millis(100), false);
    let response = healthz::router("/healthz", checker)
        .oneshot(Request::get("/healthz").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = String::from_utf8(body.to_vec()).unwrap();
    assert!(body.contains("timed out"), "unexpected body {body:?}");

    server.stop().await;
}
