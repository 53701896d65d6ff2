// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Identity Signatures and Nonces
//!
//! Ed25519 signature verification over UTF-8 payloads, and CSPRNG-backed
//! nonce generation for the login challenge. The relay only ever verifies;
//! signing happens on clients.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use rand_core::{OsRng, RngCore};

/// Length of a login nonce in hex characters (32 random bytes).
pub const NONCE_HEX_LEN: usize = 64;

/// Generates a fresh login nonce: 32 CSPRNG bytes, hex-encoded.
pub fn generate_nonce() -> String {
    let mut buf = [0u8; 32];
    OsRng.fill_bytes(&mut buf);
    hex::encode(buf)
}

/// Verifies an Ed25519 signature over a UTF-8 message.
///
/// `public_key_b64` is the base64 encoding of a 32-byte Ed25519 public key,
/// `signature` the detached 64-byte signature. Malformed keys or signatures
/// verify as false rather than erroring; callers must not learn which part
/// was wrong.
pub fn verify_identity_signature(public_key_b64: &str, message: &str, signature: &[u8]) -> bool {
    let Ok(key_bytes) = STANDARD.decode(public_key_b64) else {
        return false;
    };
    let Ok(key_bytes) = <[u8; 32]>::try_from(key_bytes.as_slice()) else {
        return false;
    };
    let Ok(verifying_key) = VerifyingKey::from_bytes(&key_bytes) else {
        return false;
    };
    let Ok(sig) = Signature::from_slice(signature) else {
        return false;
    };
    verifying_key.verify(message.as_bytes(), &sig).is_ok()
}

/// Decodes a base64 signature and checks it is exactly 64 bytes.
pub fn decode_signature(signature_b64: &str) -> Option<Vec<u8>> {
    let raw = STANDARD.decode(signature_b64).ok()?;
    if raw.len() != 64 {
        return None;
    }
    Some(raw)
}

/// Checks that a base64 string decodes to a 32-byte public key.
pub fn is_valid_public_key(public_key_b64: &str) -> bool {
    STANDARD
        .decode(public_key_b64)
        .map(|b| b.len() == 32)
        .unwrap_or(false)
}
