//! Both API versions over a real socket.

use kms_plugin::metrics::{KMS_REQUEST, STATUS_ERROR, STATUS_SUCCESS};
use kms_plugin::proto::v1beta1::key_management_service_client::KeyManagementServiceClient as V1Client;
use kms_plugin::proto::v1beta1::{self, VersionRequest};
use kms_plugin::proto::v2::key_management_service_client::KeyManagementServiceClient as V2Client;
use kms_plugin::proto::v2::{DecryptRequest, EncryptRequest, StatusRequest};
use tonic::Code;

use crate::support::TestServer;

fn samples(operation: &str, status: &str, error: &str) -> u64 {
    KMS_REQUEST
        .with_label_values(&[operation, status, error])
        .get_sample_count()
}

#[tokio::test]
async fn test_v1_and_v2_secret_roundtrip() {
    let server = TestServer::key_vault().await;
    let channel = server.channel().await;

    let mut v1 = V1Client::new(channel.clone());
    let version = v1
        .version(VersionRequest {
            version: "v1beta1".to_string(),
        })
        .await
        .unwrap()
        .into_inner();
    assert_eq!(version.version, "v1beta1");
    assert_eq!(version.runtime_name, "Microsoft AzureKMS");

    let cipher = v1
        .encrypt(v1beta1::EncryptRequest {
            version: "v1beta1".to_string(),
            plain: b"secret".to_vec(),
        })
        .await
        .unwrap()
        .into_inner()
        .cipher;
    let plain = v1
        .decrypt(v1beta1::DecryptRequest {
            version: "v1beta1".to_string(),
            cipher,
        })
        .await
        .unwrap()
        .into_inner()
        .plain;
    assert_eq!(plain, b"secret");

    let before = samples("grpc_encrypt", STATUS_SUCCESS, "");
    let mut v2 = V2Client::new(channel);
    let encrypted = v2
        .encrypt(EncryptRequest {
            plaintext: b"secret".to_vec(),
            uid: "uid-1".to_string(),
        })
        .await
        .unwrap()
        .into_inner();
    assert!(samples("grpc_encrypt", STATUS_SUCCESS, "") > before);

    let status = v2.status(StatusRequest {}).await.unwrap().into_inner();
    assert_eq!(status.key_id, encrypted.key_id);

    let plaintext = v2
        .decrypt(DecryptRequest {
            ciphertext: encrypted.ciphertext,
            uid: "uid-2".to_string(),
            key_id: encrypted.key_id,
            annotations: encrypted.annotations,
        })
        .await
        .unwrap()
        .into_inner()
        .plaintext;
    assert_eq!(plaintext, b"secret");

    drop(v1);
    drop(v2);
    server.stop().await;
}

#[tokio::test]
async fn test_status_reports_vault_failure() {
    let server = TestServer::key_vault().await;
    let mut v2 = V2Client::new(server.channel().await);

    server.vault().set_fail_decrypt(true);
    let before = samples("grpc_status", STATUS_ERROR, "Unavailable");
    let err = v2.status(StatusRequest {}).await.unwrap_err();
    assert_eq!(err.code(), Code::Unavailable);
    assert!(err.message().contains("injected decrypt failure"));
    assert!(samples("grpc_status", STATUS_ERROR, "Unavailable") > before);

    server.vault().set_fail_decrypt(false);
    assert!(v2.status(StatusRequest {}).await.is_ok());

    drop(v2);
    server.stop().await;
}

#[tokio::test]
async fn test_foreign_key_is_refused() {
    let server = TestServer::key_vault().await;
    let mut v2 = V2Client::new(server.channel().await);

    server
        .vault()
        .set_kid_override(Some("https://testkv.vault.azure.net/keys/other/v9".to_string()));
    let err = v2
        .encrypt(EncryptRequest {
            plaintext: b"secret".to_vec(),
            uid: "uid-1".to_string(),
        })
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::FailedPrecondition);
    assert!(err.message().contains("does not match"));

    drop(v2);
    server.stop().await;
}

#[tokio::test]
async fn test_local_envelope_serves_v2_only() {
    let server = TestServer::local_envelope().await;
    let channel = server.channel().await;

    let err = V1Client::new(channel.clone())
        .version(VersionRequest::default())
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::Unimplemented);

    let mut v2 = V2Client::new(channel);
    let encrypted = v2
        .encrypt(EncryptRequest {
            plaintext: b"secret".to_vec(),
            uid: "uid-1".to_string(),
        })
        .await
        .unwrap()
        .into_inner();
    assert_eq!(encrypted.key_id, "1");

    let plaintext = v2
        .decrypt(DecryptRequest {
            ciphertext: encrypted.ciphertext,
            uid: "uid-1".to_string(),
            key_id: encrypted.key_id,
            annotations: encrypted.annotations,
        })
        .await
        .unwrap()
        .into_inner()
        .plaintext;
    assert_eq!(plaintext, b"secret");

    drop(v2);
    server.stop().await;
}
