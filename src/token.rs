// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Session Tokens
//!
//! Compact bearer credential binding a login to one `(user_id, device_id)`
//! pair: `base64url(claims-json) . base64url(hmac-sha256-tag)`, signed with
//! the server's symmetric secret. The token carries no revocation state;
//! remote logout is enforced by the device-row check in the auth engine.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use ring::hmac;
use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Claims carried inside a session token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenClaims {
    pub user_id: String,
    pub device_id: String,
    /// Expiry as unix seconds.
    pub expires_at: u64,
}

/// Signs and verifies session tokens with a symmetric secret.
#[derive(Clone)]
pub struct TokenSigner {
    key: hmac::Key,
}

fn now_unix_s() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

impl TokenSigner {
    pub fn new(secret: &str) -> Self {
        TokenSigner {
            key: hmac::Key::new(hmac::HMAC_SHA256, secret.as_bytes()),
        }
    }

    /// Mints a token for a device session expiring after `ttl`.
    pub fn mint(&self, user_id: &str, device_id: &str, ttl: Duration) -> String {
        let claims = TokenClaims {
            user_id: user_id.to_string(),
            device_id: device_id.to_string(),
            expires_at: now_unix_s().saturating_add(ttl.as_secs()),
        };
        // Claims are produced locally; serialization cannot fail on them.
        let payload = serde_json::to_vec(&claims).unwrap_or_default();
        let payload_b64 = URL_SAFE_NO_PAD.encode(&payload);
        let tag = hmac::sign(&self.key, payload_b64.as_bytes());
        let tag_b64 = URL_SAFE_NO_PAD.encode(tag.as_ref());
        format!("{payload_b64}.{tag_b64}")
    }

    /// Verifies a token and returns its claims.
    ///
    /// Extraction, MAC check, and expiry check all happen here; the only
    /// outputs are valid claims or `None`. Callers never learn which step
    /// rejected the token.
    pub fn verify(&self, token: &str) -> Option<TokenClaims> {
        let (payload_b64, tag_b64) = token.split_once('.')?;
        let tag = URL_SAFE_NO_PAD.decode(tag_b64).ok()?;
        hmac::verify(&self.key, payload_b64.as_bytes(), &tag).ok()?;
        let payload = URL_SAFE_NO_PAD.decode(payload_b64).ok()?;
        let claims: TokenClaims = serde_json::from_slice(&payload).ok()?;
        if claims.expires_at <= now_unix_s() {
            return None;
        }
        Some(claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mint_and_verify_roundtrip() {
        let signer = TokenSigner::new("test-secret");
        let token = signer.mint("user-1", "device-a", Duration::from_secs(3600));

        let claims = signer.verify(&token).expect("token should verify");
        assert_eq!(claims.user_id, "user-1");
        assert_eq!(claims.device_id, "device-a");
        assert!(claims.expires_at > now_unix_s());
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let signer = TokenSigner::new("secret-a");
        let other = TokenSigner::new("secret-b");
        let token = signer.mint("user-1", "device-a", Duration::from_secs(3600));

        assert!(other.verify(&token).is_none());
    }

    #[test]
    fn test_expired_token_rejected() {
        let signer = TokenSigner::new("test-secret");
        let token = signer.mint("user-1", "device-a", Duration::ZERO);

        assert!(signer.verify(&token).is_none());
    }

    #[test]
    fn test_tampered_payload_rejected() {
        let signer = TokenSigner::new("test-secret");
        let token = signer.mint("user-1", "device-a", Duration::from_secs(3600));

        let (payload, tag) = token.split_once('.').unwrap();
        let forged_claims = TokenClaims {
            user_id: "user-2".to_string(),
            device_id: "device-a".to_string(),
            expires_at: now_unix_s() + 3600,
        };
        let forged_payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&forged_claims).unwrap());
        assert_ne!(payload, forged_payload);

        let forged = format!("{forged_payload}.{tag}");
        assert!(signer.verify(&forged).is_none());
    }

    #[test]
    fn test_garbage_rejected() {
        let signer = TokenSigner::new("test-secret");
        assert!(signer.verify("").is_none());
        assert!(signer.verify("no-separator").is_none());
        assert!(signer.verify("a.b.c").is_none());
        assert!(signer.verify("!!!.???").is_none());
    }
}
