//! Wire-level tests for the HTTP backends against a mock server.
//!
//! Run with: `cargo test --test http_backends`

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use mockito::{Matcher, Server, ServerGuard};
use serde_json::json;

use k4_sync::backend::{HsmBackend, KeyBackend, TransitBackend};
use k4_sync::storage::memory::InMemorySubscriberStore;
use k4_sync::subscriber::{derive_aad, ALGORITHM_AES256_INTERNAL};
use k4_sync::{
    labels, BackendGateway, CircuitState, HsmConfig, KeyRecord, KeyRotationEngine, KeyType, ProbeStatus,
    RewrapOutcome, SubscriberKeyState, SyncError, TransitConfig, UserDataSyncEngine,
};

const TIMEOUT: Duration = Duration::from_secs(5);

fn gateway(backend: Arc<dyn KeyBackend>) -> BackendGateway {
    BackendGateway::new(backend, Arc::new(CircuitState::new()), TIMEOUT)
}

fn hsm(server: &ServerGuard) -> Arc<HsmBackend> {
    let config = HsmConfig {
        uri: server.url(),
        service_id: "k4-sync".into(),
        password: "s3cret".into(),
        ..Default::default()
    };
    Arc::new(HsmBackend::new(&config, TIMEOUT).unwrap())
}

fn transit(server: &ServerGuard) -> Arc<TransitBackend> {
    let config = TransitConfig {
        addr: server.url(),
        token: Some("root".into()),
        ..Default::default()
    };
    Arc::new(TransitBackend::new(&config, TIMEOUT).unwrap())
}

// =============================================================================
// Key-management service
// =============================================================================

#[tokio::test]
async fn test_hsm_store_key_replaces_value_with_cipher() {
    let mut server = Server::new_async().await;
    let login = server
        .mock("POST", "/login")
        .match_body(Matcher::Json(json!({"service_id": "k4-sync", "password": "s3cret"})))
        .with_status(200)
        .with_body(r#"{"token":"t1"}"#)
        .expect(1)
        .create_async()
        .await;
    let store = server
        .mock("POST", "/store-key")
        .match_header("authorization", "Bearer t1")
        .match_body(Matcher::PartialJson(json!({
            "key_label": "K4_AES",
            "id": 3,
            "key_value": "00112233",
            "key_type": "AES128"
        })))
        .with_status(200)
        .with_body(r#"{"cipher_key":"ENC(00112233)"}"#)
        .create_async()
        .await;

    let gw = gateway(hsm(&server));
    let mut record = KeyRecord::new(3, labels::K4_AES, KeyType::Aes128, "00112233");
    gw.store_key(&mut record).await.unwrap();

    assert_eq!(record.value, "ENC(00112233)");
    login.assert_async().await;
    store.assert_async().await;
}

#[tokio::test]
async fn test_hsm_rejected_token_triggers_one_relogin() {
    let mut server = Server::new_async().await;
    let issued = Arc::new(AtomicUsize::new(0));
    let counter = issued.clone();
    let login = server
        .mock("POST", "/login")
        .with_status(200)
        .with_body_from_request(move |_| {
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            format!(r#"{{"token":"t{n}"}}"#).into_bytes()
        })
        .expect(2)
        .create_async()
        .await;
    let stale = server
        .mock("POST", "/get-data-keys")
        .match_header("authorization", "Bearer t1")
        .with_status(401)
        .expect(1)
        .create_async()
        .await;
    let fresh = server
        .mock("POST", "/get-data-keys")
        .match_header("authorization", "Bearer t2")
        .match_body(Matcher::Json(json!({"key_label": "K4_DES3"})))
        .with_status(200)
        .with_body(r#"{"keys":[{"id":2,"key_type":"DES3"},{"id":1}]}"#)
        .expect(1)
        .create_async()
        .await;

    let gw = gateway(hsm(&server));
    let keys = gw.list_keys(labels::K4_DES3).await.unwrap();

    assert_eq!(keys.len(), 2);
    assert_eq!(keys[0].serial, 2);
    assert_eq!(keys[0].key_type, Some(KeyType::Des3));
    assert_eq!(keys[1].key_type, None);
    assert!(!gw.circuit().is_down());
    login.assert_async().await;
    stale.assert_async().await;
    fresh.assert_async().await;
}

#[tokio::test]
async fn test_hsm_token_rejected_after_relogin_trips_circuit() {
    let mut server = Server::new_async().await;
    let login = server
        .mock("POST", "/login")
        .with_status(200)
        .with_body(r#"{"token":"t1"}"#)
        .expect(2)
        .create_async()
        .await;
    let _delete = server
        .mock("POST", "/delete-key")
        .with_status(403)
        .expect(2)
        .create_async()
        .await;

    let gw = gateway(hsm(&server));
    let err = gw.delete_key(labels::K4_AES, 1).await.unwrap_err();

    assert!(matches!(err, SyncError::Auth(_)));
    assert!(gw.circuit().is_down());
    login.assert_async().await;
}

#[tokio::test]
async fn test_hsm_generates_internal_keys_by_type() {
    let mut server = Server::new_async().await;
    let _login = server
        .mock("POST", "/login")
        .with_status(200)
        .with_body(r#"{"token":"t1"}"#)
        .create_async()
        .await;
    let aes = server
        .mock("POST", "/generate-aes-key")
        .match_body(Matcher::Json(json!({"id": 1, "bits": 256, "key_label": "K4_ENC_AES256"})))
        .with_status(200)
        .with_body("{}")
        .create_async()
        .await;
    let des3 = server
        .mock("POST", "/generate-des3-key")
        .match_body(Matcher::Json(json!({"id": 2, "key_label": "K4_ENC_DES3"})))
        .with_status(200)
        .create_async()
        .await;

    let gw = gateway(hsm(&server));
    let record = gw.create_key(labels::K4_ENC_AES256, 1).await.unwrap();
    assert_eq!(record.key_type, KeyType::Aes256);
    assert!(record.value.is_empty());
    gw.create_key(labels::K4_ENC_DES3, 2).await.unwrap();

    aes.assert_async().await;
    des3.assert_async().await;
}

#[tokio::test]
async fn test_invalid_label_never_reaches_the_wire() {
    let mut server = Server::new_async().await;
    let login = server.mock("POST", "/login").expect(0).create_async().await;
    let store = server.mock("POST", "/store-key").expect(0).create_async().await;

    let gw = gateway(hsm(&server));
    let mut internal = KeyRecord::new(1, labels::K4_ENC_AES256, KeyType::Aes256, "00");
    assert!(matches!(gw.store_key(&mut internal).await, Err(SyncError::Validation(_))));
    assert!(matches!(gw.list_keys("K4_BOGUS").await, Err(SyncError::Validation(_))));
    assert!(matches!(gw.create_key(labels::K4_AES, 1).await, Err(SyncError::UnsupportedLabel(_))));

    login.assert_async().await;
    store.assert_async().await;
}

#[tokio::test]
async fn test_hsm_health_probe() {
    let mut server = Server::new_async().await;
    let ok = server
        .mock("GET", "/health-check")
        .with_status(200)
        .with_body(r#"{"status":"OK"}"#)
        .create_async()
        .await;

    let backend = hsm(&server);
    assert_eq!(backend.health_probe().await, ProbeStatus::Healthy);
    ok.remove_async().await;

    let _degraded = server
        .mock("GET", "/health-check")
        .with_status(200)
        .with_body(r#"{"status":"DEGRADED"}"#)
        .create_async()
        .await;
    assert!(matches!(backend.health_probe().await, ProbeStatus::Unhealthy(_)));
}

#[tokio::test]
async fn test_hsm_user_sweep_leaves_cleartext_as_skipped() {
    let mut server = Server::new_async().await;
    let login = server.mock("POST", "/login").expect(0).create_async().await;

    let gw = gateway(hsm(&server));
    let subscribers = Arc::new(InMemorySubscriberStore::new());
    subscribers.insert("U1", SubscriberKeyState::cleartext("abc123"));
    let rotation = Arc::new(KeyRotationEngine::new(gw.clone(), labels::K4_ENC_AES256));
    let engine = Arc::new(UserDataSyncEngine::new(gw.clone(), subscribers.clone(), rotation, labels::K4_ENC_AES256, 2));

    let report = engine.sync_all_subscribers().await.unwrap();
    assert_eq!(report.skipped, 1);
    assert_eq!(report.failed, 0);
    assert_eq!(subscribers.snapshot("U1").unwrap(), SubscriberKeyState::cleartext("abc123"));
    assert!(!gw.circuit().is_down());
    login.assert_async().await;
}

// =============================================================================
// Secret store (transit)
// =============================================================================

#[tokio::test]
async fn test_transit_encrypt_sends_base64_plaintext_and_context() {
    let mut server = Server::new_async().await;
    let aad = derive_aad("U1", 0, 0);
    let encrypt = server
        .mock("POST", "/v1/transit/encrypt/K4_ENC_AES256")
        .match_header("x-vault-token", "root")
        .match_body(Matcher::Json(json!({
            "plaintext": BASE64.encode(b"abc123"),
            "context": BASE64.encode(&aad),
        })))
        .with_status(200)
        .with_body(r#"{"data":{"ciphertext":"vault:v1:Zm9v"}}"#)
        .create_async()
        .await;

    let gw = gateway(transit(&server));
    let ct = gw.encrypt(labels::K4_ENC_AES256, b"abc123", &aad).await.unwrap();
    assert_eq!(ct, "vault:v1:Zm9v");
    encrypt.assert_async().await;
}

#[tokio::test]
async fn test_transit_rewrap_follows_latest_version() {
    let mut server = Server::new_async().await;
    let _key_info = server
        .mock("GET", "/v1/transit/keys/K4_ENC_AES256")
        .with_status(200)
        .with_body(r#"{"data":{"latest_version":3,"type":"aes256-gcm96"}}"#)
        .create_async()
        .await;
    let aad = derive_aad("U1", 0, 0);
    let rewrap = server
        .mock("POST", "/v1/transit/rewrap/K4_ENC_AES256")
        .match_body(Matcher::Json(json!({
            "ciphertext": "vault:v1:Zm9v",
            "context": BASE64.encode(&aad),
        })))
        .with_status(200)
        .with_body(r#"{"data":{"ciphertext":"vault:v3:YmFy","key_version":3}}"#)
        .expect(1)
        .create_async()
        .await;

    let engine = KeyRotationEngine::new(gateway(transit(&server)), labels::K4_ENC_AES256);
    let mut state = SubscriberKeyState {
        permanent_key_value: "vault:v1:Zm9v".into(),
        encryption_algorithm: ALGORITHM_AES256_INTERNAL,
        key_serial_reference: 1,
        aad: hex::encode(&aad),
        encryption_key_reference: "K4_ENC_AES256-1".into(),
    };

    let outcome = engine.maybe_rewrap("U1", &mut state).await.unwrap();
    assert_eq!(outcome, RewrapOutcome::Rewrapped { from: 1, to: 3 });
    assert_eq!(state.permanent_key_value, "vault:v3:YmFy");
    assert_eq!(state.aad, hex::encode(&aad));
    rewrap.assert_async().await;
}

#[tokio::test]
async fn test_transit_missing_key_is_not_found() {
    let mut server = Server::new_async().await;
    let _missing = server
        .mock("GET", "/v1/transit/keys/K4_ENC_AES128")
        .with_status(404)
        .with_body(r#"{"errors":[]}"#)
        .create_async()
        .await;

    let gw = gateway(transit(&server));
    assert!(matches!(
        gw.latest_key_version(labels::K4_ENC_AES128).await,
        Err(SyncError::NotFound(_))
    ));
    assert!(gw.list_keys(labels::K4_ENC_AES128).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_transit_store_key_writes_kv_and_clears_value() {
    let mut server = Server::new_async().await;
    let write = server
        .mock("POST", "/v1/secret/data/k4/K4_AES-7")
        .match_body(Matcher::Json(json!({"data": {"key_value": "00ff", "key_type": "AES256"}})))
        .with_status(200)
        .with_body(r#"{"data":{"version":1}}"#)
        .create_async()
        .await;

    let gw = gateway(transit(&server));
    let mut record = KeyRecord::new(7, labels::K4_AES, KeyType::Aes256, "00ff");
    gw.store_key(&mut record).await.unwrap();

    assert!(record.value.is_empty());
    write.assert_async().await;
}

#[tokio::test]
async fn test_transit_approle_login_and_namespace() {
    let mut server = Server::new_async().await;
    let login = server
        .mock("POST", "/v1/auth/approle/login")
        .match_header("x-vault-namespace", "team-a")
        .match_body(Matcher::Json(json!({"role_id": "role", "secret_id": "secret"})))
        .with_status(200)
        .with_body(r#"{"auth":{"client_token":"s.approle"}}"#)
        .expect(1)
        .create_async()
        .await;
    let rotate = server
        .mock("POST", "/v1/transit/keys/K4_ENC_AES256/rotate")
        .match_header("x-vault-token", "s.approle")
        .match_header("x-vault-namespace", "team-a")
        .with_status(204)
        .create_async()
        .await;

    let config = TransitConfig {
        addr: server.url(),
        role_id: Some("role".into()),
        secret_id: Some("secret".into()),
        namespace: Some("team-a".into()),
        ..Default::default()
    };
    let backend = Arc::new(TransitBackend::new(&config, TIMEOUT).unwrap());
    let engine = KeyRotationEngine::new(gateway(backend), labels::K4_ENC_AES256);
    engine.rotate_key(labels::K4_ENC_AES256).await.unwrap();

    login.assert_async().await;
    rotate.assert_async().await;
}

#[tokio::test]
async fn test_transit_sealed_store_is_unhealthy() {
    let mut server = Server::new_async().await;
    let health = server
        .mock("GET", "/v1/sys/health")
        .with_status(503)
        .with_body(r#"{"sealed":true}"#)
        .create_async()
        .await;

    let backend = transit(&server);
    assert_eq!(backend.health_probe().await, ProbeStatus::Unhealthy("sealed".into()));
    health.remove_async().await;

    let _unsealed = server.mock("GET", "/v1/sys/health").with_status(200).create_async().await;
    // No session yet
    assert_eq!(backend.health_probe().await, ProbeStatus::AuthExpired);

    let lookup = server
        .mock("GET", "/v1/auth/token/lookup-self")
        .match_header("x-vault-token", "root")
        .with_status(200)
        .with_body(r#"{"data":{"ttl":3600}}"#)
        .create_async()
        .await;
    backend.login().await.unwrap();
    assert_eq!(backend.health_probe().await, ProbeStatus::Healthy);
    lookup.assert_async().await;
}
