//! Health check against a running server.

use std::time::Duration;

use axum::http::StatusCode;
use kms_plugin::healthz::HealthChecker;

use crate::support::TestServer;

#[tokio::test]
async fn test_healthy_server() {
    let server = TestServer::key_vault().await;
    let checker = HealthChecker::new(server.endpoint.clone(), Duration::from_secs(5), true);
    checker.check().await.unwrap();
    server.stop().await;
}

#[tokio::test]
async fn test_status_failure_is_unavailable() {
    let server = TestServer::key_vault().await;
    server.vault().set_fail_encrypt(true);

    let checker = HealthChecker::new(server.endpoint.clone(), Duration::from_secs(5), false);
    let err = checker.check().await.unwrap_err();
    assert_eq!(err.status_code(), StatusCode::SERVICE_UNAVAILABLE);
    server.stop().await;
}

#[tokio::test]
async fn test_wrong_plaintext_is_internal_error() {
    let server = TestServer::key_vault().await;
    server.vault().set_corrupt_decrypt(true);

    let checker = HealthChecker::new(server.endpoint.clone(), Duration::from_secs(5), true);
    let err = checker.check().await.unwrap_err();
    assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    assert!(err.to_string().contains("does not match"));
    server.stop().await;
}

#[tokio::test]
async fn test_local_envelope_without_v1() {
    let server = TestServer::local_envelope().await;
    let checker = HealthChecker::new(server.endpoint.clone(), Duration::from_secs(5), false);
    checker.check().await.unwrap();

    let with_v1 = HealthChecker::new(server.endpoint.clone(), Duration::from_secs(5), true);
    assert_eq!(
        with_v1.check().await.unwrap_err().status_code(),
        StatusCode::SERVICE_UNAVAILABLE
    );
    server.stop().await;
}
