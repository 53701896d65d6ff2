// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Authentication Engine
//!
//! Challenge-response login against the user's Ed25519 identity key, session
//! token minting, logout, and bearer verification.
//!
//! Two properties shape every path here:
//!
//! - **Single attempt per nonce**: the challenge row is consumed before the
//!   signature verdict, so a wrong signature burns the nonce.
//! - **Single session per user**: a successful login replaces all prior
//!   device rows in one transaction, and bearer verification re-checks that
//!   the device row still exists. Logging in elsewhere therefore remotely
//!   logs out the old session without any revocation list.
//!
//! Every failure is reported as the same opaque `AuthError::Failed` so the
//! API cannot be used as a user-existence or nonce-state oracle.

use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::warn;

use crate::identity;
use crate::store::{DeviceRecord, NewDevice, Store, StoreError, UserRecord};
use crate::token::{TokenClaims, TokenSigner};

/// How long an issued challenge nonce stays valid.
pub const CHALLENGE_TTL: Duration = Duration::from_secs(120);

/// Client-generated device ids are opaque but bounded.
pub const MAX_DEVICE_ID_LEN: usize = 255;

const MAX_FCM_TOKEN_LEN: usize = 512;

#[derive(Debug)]
pub enum AuthError {
    /// Generic authentication failure. Deliberately carries no detail.
    Failed,
    /// Malformed input, rejected before any authentication work.
    BadRequest(&'static str),
    /// Storage failure.
    Store(StoreError),
}

impl Display for AuthError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Failed => write!(f, "authentication failed"),
            Self::BadRequest(msg) => write!(f, "bad request: {msg}"),
            Self::Store(e) => write!(f, "storage failure: {e}"),
        }
    }
}

impl Error for AuthError {}

impl From<StoreError> for AuthError {
    fn from(e: StoreError) -> Self {
        AuthError::Store(e)
    }
}

/// The result of a successful login.
#[derive(Debug, Clone)]
pub struct AuthSession {
    pub token: String,
    pub user: UserRecord,
    pub device: DeviceRecord,
    pub remaining_one_time_key_count: u32,
    /// Hint for the client to replenish one-time pre-keys soon.
    pub low_key_warn: bool,
}

fn now_unix_s() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn valid_fcm_token(token: &str) -> bool {
    !token.is_empty()
        && token.len() <= MAX_FCM_TOKEN_LEN
        && token
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | ':' | '.'))
}

pub struct AuthEngine {
    store: Arc<Store>,
    signer: TokenSigner,
    token_ttl: Duration,
    low_key_threshold: u32,
}

impl AuthEngine {
    pub fn new(
        store: Arc<Store>,
        signer: TokenSigner,
        token_ttl: Duration,
        low_key_threshold: u32,
    ) -> Self {
        AuthEngine {
            store,
            signer,
            token_ttl,
            low_key_threshold,
        }
    }

    /// Issues a fresh login challenge for the user, replacing any prior one.
    pub fn issue_challenge(&self, username: &str, device_id: &str) -> Result<String, AuthError> {
        if device_id.is_empty() || device_id.len() > MAX_DEVICE_ID_LEN {
            return Err(AuthError::BadRequest("invalid device id"));
        }

        // Unknown user gets the same generic failure as a bad signature.
        let user = self
            .store
            .user_by_username(username)?
            .ok_or(AuthError::Failed)?;

        let nonce = identity::generate_nonce();
        self.store
            .replace_challenge(&user.id, &nonce, CHALLENGE_TTL)?;
        Ok(nonce)
    }

    /// Verifies a signed challenge and establishes the user's single session.
    pub fn verify_challenge(
        &self,
        username: &str,
        signature_b64: &str,
        device_id: &str,
        fcm_token: Option<&str>,
    ) -> Result<AuthSession, AuthError> {
        if device_id.is_empty() || device_id.len() > MAX_DEVICE_ID_LEN {
            return Err(AuthError::BadRequest("invalid device id"));
        }
        if let Some(token) = fcm_token {
            if !valid_fcm_token(token) {
                return Err(AuthError::BadRequest("invalid fcm token"));
            }
        }
        let signature =
            identity::decode_signature(signature_b64).ok_or(AuthError::BadRequest("invalid signature encoding"))?;

        let user = self
            .store
            .user_by_username(username)?
            .ok_or(AuthError::Failed)?;

        // The challenge row is gone after this call no matter how the
        // signature check goes: one nonce, one attempt.
        let challenge = self
            .store
            .take_challenge(&user.id, now_unix_s())?
            .ok_or(AuthError::Failed)?;

        if !identity::verify_identity_signature(&user.identity_public_key, &challenge.nonce, &signature)
        {
            warn!("login signature verification failed");
            return Err(AuthError::Failed);
        }

        let device = self.store.replace_device(
            &user.id,
            NewDevice {
                device_id: device_id.to_string(),
                identity_public_key: user.identity_public_key.clone(),
                registration_id: user.registration_id,
                device_name: None,
                fcm_token: fcm_token.map(str::to_string),
            },
        )?;

        let token = self.signer.mint(&user.id, &device.device_id, self.token_ttl);
        let remaining = self.store.count_one_time_pre_keys(&user.id)?;

        Ok(AuthSession {
            token,
            low_key_warn: remaining < self.low_key_threshold,
            remaining_one_time_key_count: remaining,
            user,
            device,
        })
    }

    /// Removes the device row for the session. Idempotent.
    pub fn logout(&self, user_id: &str, device_id: &str) -> Result<(), AuthError> {
        self.store.delete_device(user_id, device_id)?;
        Ok(())
    }

    /// Verifies a bearer token: MAC, expiry, and that the device row still
    /// exists (a login elsewhere deletes it, which invalidates this token).
    pub fn verify_bearer(&self, token: &str) -> Result<TokenClaims, AuthError> {
        let claims = self.signer.verify(token).ok_or(AuthError::Failed)?;

        if !self
            .store
            .device_exists(&claims.user_id, &claims.device_id)?
        {
            return Err(AuthError::Failed);
        }

        // last_seen is advisory; keep it off the request path when a runtime
        // is available.
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let store = self.store.clone();
            let user_id = claims.user_id.clone();
            let device_id = claims.device_id.clone();
            handle.spawn(async move {
                let _ = store.touch_device(&user_id, &device_id);
            });
        } else {
            let _ = self.store.touch_device(&claims.user_id, &claims.device_id);
        }

        Ok(claims)
    }
}
