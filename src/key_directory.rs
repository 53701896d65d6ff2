// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Key Directory
//!
//! Serves the pre-key bundles senders need to run the X3DH handshake against
//! an offline recipient. The bundle always carries the latest signed pre-key;
//! a one-time pre-key is attached when one is available and is consumed by
//! the same fetch, so no two senders ever receive the same one.

use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::store::{Store, StoreError};

/// Signed pre-keys retained per user; older uploads are reaped.
pub const RETAINED_SIGNED_PRE_KEYS: usize = 5;

#[derive(Debug)]
pub enum DirectoryError {
    /// User unknown, or no usable bundle (never uploaded a signed pre-key).
    NotFound,
    Store(StoreError),
}

impl Display for DirectoryError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound => write!(f, "no bundle available"),
            Self::Store(e) => write!(f, "storage failure: {e}"),
        }
    }
}

impl Error for DirectoryError {}

impl From<StoreError> for DirectoryError {
    fn from(e: StoreError) -> Self {
        DirectoryError::Store(e)
    }
}

/// A one-time pre-key as uploaded by a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OneTimePreKeyUpload {
    pub key_id: u32,
    pub public_key: String,
}

/// The signed pre-key component of a bundle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundleSignedPreKey {
    pub key_id: u32,
    pub public_key: String,
    pub signature: String,
}

/// The one-time pre-key component of a bundle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundleOneTimePreKey {
    pub key_id: u32,
    pub public_key: String,
}

/// Everything a sender needs to bootstrap an X3DH session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreKeyBundle {
    pub user_id: String,
    pub username: String,
    pub registration_id: u32,
    pub identity_public_key: String,
    pub signed_pre_key: BundleSignedPreKey,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub one_time_pre_key: Option<BundleOneTimePreKey>,
}

pub struct KeyDirectory {
    store: Arc<Store>,
}

impl KeyDirectory {
    pub fn new(store: Arc<Store>) -> Self {
        KeyDirectory { store }
    }

    /// Upserts the signed pre-key and reaps older ones down to the retained
    /// window.
    pub fn upload_signed_pre_key(
        &self,
        user_id: &str,
        key_id: u32,
        public_key: &str,
        signature: &str,
    ) -> Result<(), DirectoryError> {
        self.store
            .upsert_signed_pre_key(user_id, key_id, public_key, signature)?;
        self.store
            .reap_signed_pre_keys(user_id, RETAINED_SIGNED_PRE_KEYS)?;
        Ok(())
    }

    /// Batch-uploads one-time pre-keys. Returns the number accepted.
    pub fn upload_one_time_pre_keys(
        &self,
        user_id: &str,
        keys: &[OneTimePreKeyUpload],
    ) -> Result<usize, DirectoryError> {
        let pairs: Vec<(u32, String)> = keys
            .iter()
            .map(|k| (k.key_id, k.public_key.clone()))
            .collect();
        Ok(self.store.add_one_time_pre_keys(user_id, &pairs)?)
    }

    /// Assembles the recipient's bundle, consuming one one-time pre-key when
    /// available. Concurrent fetches for the same user receive distinct
    /// one-time keys because the take is transactional.
    pub fn bundle(&self, user_id: &str) -> Result<PreKeyBundle, DirectoryError> {
        let user = self
            .store
            .user_by_id(user_id)?
            .ok_or(DirectoryError::NotFound)?;

        let signed = self
            .store
            .latest_signed_pre_key(user_id)?
            .ok_or(DirectoryError::NotFound)?;

        let one_time = self.store.take_one_time_pre_key(user_id)?;

        Ok(PreKeyBundle {
            user_id: user.id,
            username: user.username,
            registration_id: user.registration_id,
            identity_public_key: user.identity_public_key,
            signed_pre_key: BundleSignedPreKey {
                key_id: signed.key_id,
                public_key: signed.public_key,
                signature: signed.signature,
            },
            one_time_pre_key: one_time.map(|k| BundleOneTimePreKey {
                key_id: k.key_id,
                public_key: k.public_key,
            }),
        })
    }

    pub fn one_time_key_count(&self, user_id: &str) -> Result<u32, DirectoryError> {
        Ok(self.store.count_one_time_pre_keys(user_id)?)
    }
}
