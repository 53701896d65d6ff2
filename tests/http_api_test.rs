//! HTTP API Tests
//!
//! Drives the full REST surface through the router: registration, challenge
//! login, key directory, and relay, plus the oracle-resistance property of
//! the generic 401 body.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use ed25519_dalek::{Signer, SigningKey};
use http_body_util::BodyExt;
use rand_core::OsRng;
use serde_json::{json, Value};
use tower::ServiceExt;

use courier_relay::auth::AuthEngine;
use courier_relay::file_store::LocalFileStore;
use courier_relay::http::{create_router, AppState, RateLimiters};
use courier_relay::key_directory::KeyDirectory;
use courier_relay::metrics::RelayMetrics;
use courier_relay::relay::RelayEngine;
use courier_relay::session_registry::SessionRegistry;
use courier_relay::store::Store;
use courier_relay::token::TokenSigner;

fn test_app() -> axum::Router {
    let store = Arc::new(Store::in_memory().unwrap());
    let registry = Arc::new(SessionRegistry::new());
    let dir: &'static tempfile::TempDir = Box::leak(Box::new(tempfile::tempdir().unwrap()));

    create_router(AppState {
        auth: Arc::new(AuthEngine::new(
            store.clone(),
            TokenSigner::new("api-test-secret"),
            Duration::from_secs(3600),
            20,
        )),
        directory: Arc::new(KeyDirectory::new(store.clone())),
        relay: Arc::new(RelayEngine::new(store.clone(), registry)),
        store,
        files: Arc::new(LocalFileStore::open(dir.path()).unwrap()),
        metrics: RelayMetrics::new(),
        limiters: Arc::new(RateLimiters::default()),
        metrics_token: None,
        started_at: Instant::now(),
    })
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn authed(mut request: Request<Body>, token: &str) -> Request<Body> {
    request.headers_mut().insert(
        header::AUTHORIZATION,
        format!("Bearer {token}").parse().unwrap(),
    );
    request
}

async fn json_of(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

/// Registers a user over the API and returns their signing key and id.
async fn register(app: &axum::Router, username: &str) -> (SigningKey, String) {
    let signing = SigningKey::generate(&mut OsRng);
    let response = app
        .clone()
        .oneshot(post_json(
            "/api/users/register",
            json!({
                "username": username,
                "identity_public_key": STANDARD.encode(signing.verifying_key().to_bytes()),
                "registration_id": 7,
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let body = json_of(response).await;
    (signing, body["data"]["id"].as_str().unwrap().to_string())
}

/// Runs challenge + verify over the API and returns the bearer token.
async fn login(app: &axum::Router, username: &str, signing: &SigningKey, device: &str) -> String {
    let response = app
        .clone()
        .oneshot(post_json(
            "/api/auth/challenge",
            json!({ "username": username, "device_id": device }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let nonce = json_of(response).await["data"]["nonce"]
        .as_str()
        .unwrap()
        .to_string();

    let signature = STANDARD.encode(signing.sign(nonce.as_bytes()).to_bytes());
    let response = app
        .clone()
        .oneshot(post_json(
            "/api/auth/verify",
            json!({
                "username": username,
                "signature": signature,
                "device_id": device,
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_of(response).await;
    assert_eq!(body["success"], true);
    body["data"]["token"].as_str().unwrap().to_string()
}

/// Full path: register, log in, publish keys, fetch a consuming bundle,
/// relay a message, drain it.
#[tokio::test]
async fn test_end_to_end_messaging_flow() {
    let app = test_app();

    let (alice_key, _alice_id) = register(&app, "alice").await;
    let (bob_key, bob_id) = register(&app, "bob").await;

    let alice_token = login(&app, "alice", &alice_key, "alice-phone").await;
    let bob_token = login(&app, "bob", &bob_key, "bob-phone").await;

    // Bob publishes his handshake keys.
    let response = app
        .clone()
        .oneshot(authed(
            post_json(
                "/api/keys/signed-pre-key",
                json!({
                    "key_id": 1,
                    "public_key": STANDARD.encode([9u8; 32]),
                    "signature": STANDARD.encode([8u8; 64]),
                }),
            ),
            &bob_token,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .clone()
        .oneshot(authed(
            post_json(
                "/api/keys/one-time-pre-keys",
                json!({ "keys": [
                    { "key_id": 10, "public_key": STANDARD.encode([1u8; 32]) },
                    { "key_id": 11, "public_key": STANDARD.encode([2u8; 32]) },
                ]}),
            ),
            &bob_token,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // Alice fetches Bob's bundle; a one-time key is consumed.
    let response = app
        .clone()
        .oneshot(authed(
            Request::builder()
                .uri(format!("/api/keys/bundle/{bob_id}"))
                .body(Body::empty())
                .unwrap(),
            &alice_token,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bundle = json_of(response).await;
    assert_eq!(bundle["data"]["username"], "bob");
    assert_eq!(bundle["data"]["signed_pre_key"]["key_id"], 1);
    assert!(bundle["data"]["one_time_pre_key"]["key_id"].is_number());

    let response = app
        .clone()
        .oneshot(authed(
            Request::builder()
                .uri(format!("/api/keys/one-time-pre-keys/count/{bob_id}"))
                .body(Body::empty())
                .unwrap(),
            &alice_token,
        ))
        .await
        .unwrap();
    assert_eq!(json_of(response).await["data"]["count"], 1);

    // Alice relays a message; Bob is not connected, so it queues.
    let response = app
        .clone()
        .oneshot(authed(
            post_json(
                "/api/messages/send",
                json!({
                    "recipient_id": bob_id,
                    "ciphertext": "aGVsbG8=",
                    "type": "signal_message",
                }),
            ),
            &alice_token,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let send = json_of(response).await;
    assert_eq!(send["data"]["delivered"], false);
    let message_id = send["data"]["message_id"].as_str().unwrap().to_string();

    // Bob drains his queue.
    let response = app
        .clone()
        .oneshot(authed(
            Request::builder()
                .uri("/api/messages/offline?limit=10")
                .body(Body::empty())
                .unwrap(),
            &bob_token,
        ))
        .await
        .unwrap();
    let drained = json_of(response).await;
    let messages = drained["data"]["messages"].as_array().unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0]["id"], message_id.as_str());
    assert_eq!(messages[0]["ciphertext"], "aGVsbG8=");

    // The queue is now empty.
    let response = app
        .clone()
        .oneshot(authed(
            Request::builder()
                .uri("/api/messages/offline")
                .body(Body::empty())
                .unwrap(),
            &bob_token,
        ))
        .await
        .unwrap();
    let drained = json_of(response).await;
    assert!(drained["data"]["messages"].as_array().unwrap().is_empty());
}

/// Session takeover over the API: the first device's token turns into a
/// generic 401 once a second device logs in.
#[tokio::test]
async fn test_api_session_takeover() {
    let app = test_app();
    let (alice_key, _) = register(&app, "alice").await;

    let token_x = login(&app, "alice", &alice_key, "device-x").await;
    let token_y = login(&app, "alice", &alice_key, "device-y").await;

    let offline = |token: &str| {
        authed(
            Request::builder()
                .uri("/api/messages/offline")
                .body(Body::empty())
                .unwrap(),
            token,
        )
    };

    let response = app.clone().oneshot(offline(&token_x)).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body = json_of(response).await;
    assert_eq!(body["error"], "Authentication failed");

    let response = app.clone().oneshot(offline(&token_y)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

/// Verify failures render byte-identical bodies whatever the cause.
#[tokio::test]
async fn test_generic_401_bodies_are_identical() {
    let app = test_app();
    let (carol_key, _) = register(&app, "carol").await;

    // Cause 1: unknown user.
    let unknown = post_json(
        "/api/auth/verify",
        json!({
            "username": "ghost",
            "signature": STANDARD.encode([0u8; 64]),
            "device_id": "d",
        }),
    );

    // Cause 2: known user, no challenge outstanding.
    let no_challenge = post_json(
        "/api/auth/verify",
        json!({
            "username": "carol",
            "signature": STANDARD.encode([0u8; 64]),
            "device_id": "d",
        }),
    );

    // Cause 3: known user, live challenge, wrong signature.
    let response = app
        .clone()
        .oneshot(post_json(
            "/api/auth/challenge",
            json!({ "username": "carol", "device_id": "d" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let wrong_sig = STANDARD.encode(carol_key.sign(b"wrong payload").to_bytes());
    let bad_signature = post_json(
        "/api/auth/verify",
        json!({
            "username": "carol",
            "signature": wrong_sig,
            "device_id": "d",
        }),
    );

    let mut bodies = Vec::new();
    for request in [unknown, no_challenge, bad_signature] {
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        bodies.push(response.into_body().collect().await.unwrap().to_bytes());
    }
    assert!(bodies.windows(2).all(|w| w[0] == w[1]));
}

/// The identity rotation endpoint swaps the key used by future logins.
#[tokio::test]
async fn test_identity_rotation() {
    let app = test_app();
    let (_old_key, alice_id) = register(&app, "alice").await;

    let new_key = SigningKey::generate(&mut OsRng);
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("PUT")
                .uri(format!("/api/users/{alice_id}/identity"))
                .header("content-type", "application/json")
                .body(Body::from(
                    json!({
                        "identity_public_key":
                            STANDARD.encode(new_key.verifying_key().to_bytes()),
                    })
                    .to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // Logging in with the new key works end to end.
    let token = login(&app, "alice", &new_key, "device-a").await;
    assert!(!token.is_empty());
}

/// File collaborator roundtrip behind the bearer check.
#[tokio::test]
async fn test_file_upload_fetch_delete() {
    let app = test_app();
    let (key, _) = register(&app, "alice").await;
    let token = login(&app, "alice", &key, "device-a").await;

    let response = app
        .clone()
        .oneshot(authed(
            post_json("/api/files/upload", json!({ "data": "ZmlsZWJsb2I=" })),
            &token,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let file_id = json_of(response).await["data"]["file_id"]
        .as_str()
        .unwrap()
        .to_string();

    let response = app
        .clone()
        .oneshot(authed(
            Request::builder()
                .uri(format!("/api/files/{file_id}"))
                .body(Body::empty())
                .unwrap(),
            &token,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_of(response).await["data"]["data"], "ZmlsZWJsb2I=");

    let response = app
        .clone()
        .oneshot(authed(
            Request::builder()
                .method("DELETE")
                .uri(format!("/api/files/{file_id}"))
                .body(Body::empty())
                .unwrap(),
            &token,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .clone()
        .oneshot(authed(
            Request::builder()
                .uri(format!("/api/files/{file_id}"))
                .body(Body::empty())
                .unwrap(),
            &token,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
