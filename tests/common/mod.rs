//! Common test utilities for relay integration tests.

use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use ed25519_dalek::{Signer, SigningKey};
use rand_core::OsRng;

use courier_relay::auth::{AuthEngine, AuthSession};
use courier_relay::key_directory::KeyDirectory;
use courier_relay::relay::RelayEngine;
use courier_relay::session_registry::SessionRegistry;
use courier_relay::store::{Store, UserRecord};
use courier_relay::token::TokenSigner;

/// Every engine wired over one in-memory store.
#[allow(dead_code)]
pub struct TestHarness {
    pub store: Arc<Store>,
    pub auth: Arc<AuthEngine>,
    pub directory: Arc<KeyDirectory>,
    pub relay: Arc<RelayEngine>,
    pub registry: Arc<SessionRegistry>,
}

#[allow(dead_code)]
pub fn harness() -> TestHarness {
    let store = Arc::new(Store::in_memory().expect("in-memory store"));
    let registry = Arc::new(SessionRegistry::new());
    TestHarness {
        auth: Arc::new(AuthEngine::new(
            store.clone(),
            TokenSigner::new("integration-test-secret"),
            Duration::from_secs(3600),
            20,
        )),
        directory: Arc::new(KeyDirectory::new(store.clone())),
        relay: Arc::new(RelayEngine::new(store.clone(), registry.clone())),
        registry,
        store,
    }
}

/// A registered user together with the private half of their identity key.
pub struct TestUser {
    pub signing: SigningKey,
    pub user: UserRecord,
}

#[allow(dead_code)]
pub fn register_user(store: &Store, username: &str) -> TestUser {
    let signing = SigningKey::generate(&mut OsRng);
    let public_b64 = STANDARD.encode(signing.verifying_key().to_bytes());
    let user = store
        .create_user(username, &public_b64, 42)
        .expect("create user");
    TestUser { signing, user }
}

/// Runs the full challenge/verify flow for a device.
#[allow(dead_code)]
pub fn login(auth: &AuthEngine, user: &TestUser, device_id: &str) -> AuthSession {
    let nonce = auth
        .issue_challenge(&user.user.username, device_id)
        .expect("challenge");
    let signature = STANDARD.encode(user.signing.sign(nonce.as_bytes()).to_bytes());
    auth.verify_challenge(&user.user.username, &signature, device_id, None)
        .expect("verify")
}

/// Signs an arbitrary payload with the user's identity key.
#[allow(dead_code)]
pub fn sign_payload(user: &TestUser, payload: &str) -> String {
    STANDARD.encode(user.signing.sign(payload.as_bytes()).to_bytes())
}
