// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Relay Store
//!
//! SQLite-backed persistence for users, devices, pre-keys, login challenges,
//! and the offline message queue. Use `Store::in_memory()` for testing.
//!
//! Every multi-step operation (device replacement, challenge consumption,
//! one-time-key take, queue drain) runs inside a single transaction on the
//! serialized connection, so concurrent callers observe either the old state
//! or the new one, never a mix.

use std::error::Error;
use std::fmt::{Display, Formatter};
use std::path::Path;
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};

/// Storage failure surfaced to the engines.
#[derive(Debug)]
pub enum StoreError {
    /// Username already taken.
    DuplicateUsername,
    /// Underlying SQLite failure.
    Sqlite(rusqlite::Error),
}

impl Display for StoreError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DuplicateUsername => write!(f, "username already taken"),
            Self::Sqlite(e) => write!(f, "sqlite failure: {e}"),
        }
    }
}

impl Error for StoreError {}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Sqlite(e)
    }
}

fn now_unix_s() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

// ============================================================================
// Records
// ============================================================================

/// A registered user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRecord {
    pub id: String,
    pub username: String,
    /// Base64-encoded Ed25519 public key.
    pub identity_public_key: String,
    pub registration_id: u32,
    pub created_at_secs: u64,
    pub updated_at_secs: u64,
}

/// The single active device of a user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceRecord {
    pub id: String,
    pub user_id: String,
    pub device_id: String,
    pub identity_public_key: String,
    pub registration_id: u32,
    pub device_name: Option<String>,
    pub fcm_token: Option<String>,
    pub last_seen_secs: u64,
    pub created_at_secs: u64,
}

/// Fields supplied when a login replaces the active device.
#[derive(Debug, Clone)]
pub struct NewDevice {
    pub device_id: String,
    pub identity_public_key: String,
    pub registration_id: u32,
    pub device_name: Option<String>,
    pub fcm_token: Option<String>,
}

/// A medium-lived signed pre-key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedPreKeyRecord {
    pub id: String,
    pub user_id: String,
    pub key_id: u32,
    pub public_key: String,
    pub signature: String,
    pub created_at_secs: u64,
}

/// A single-use pre-key, deleted when handed out in a bundle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OneTimePreKeyRecord {
    pub id: String,
    pub user_id: String,
    pub key_id: u32,
    pub public_key: String,
    pub created_at_secs: u64,
}

/// An outstanding login challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChallengeRecord {
    pub id: String,
    pub user_id: String,
    pub nonce: String,
    pub expires_at_secs: u64,
    pub created_at_secs: u64,
}

/// Relay payload kind, opaque ciphertext either way.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    #[default]
    SignalMessage,
    PreKeySignalMessage,
    KeyExchange,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SignalMessage => "signal_message",
            Self::PreKeySignalMessage => "pre_key_signal_message",
            Self::KeyExchange => "key_exchange",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "signal_message" => Some(Self::SignalMessage),
            "pre_key_signal_message" => Some(Self::PreKeySignalMessage),
            "key_exchange" => Some(Self::KeyExchange),
            _ => None,
        }
    }
}

/// A message held for an offline recipient.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedMessage {
    pub id: String,
    pub recipient_id: String,
    pub sender_id: String,
    /// Raw ciphertext bytes (base64-decoded before storage).
    pub encrypted_payload: Vec<u8>,
    pub message_type: MessageType,
    /// Reserved for a planned file-attachment message type; the send path
    /// never populates it.
    pub file_reference: Option<String>,
    pub created_at_secs: u64,
    pub expires_at_secs: u64,
}

impl QueuedMessage {
    /// Creates a queued message expiring after `ttl`.
    pub fn new(
        recipient_id: String,
        sender_id: String,
        encrypted_payload: Vec<u8>,
        message_type: MessageType,
        ttl: Duration,
    ) -> Self {
        let now = now_unix_s();
        QueuedMessage {
            id: uuid::Uuid::new_v4().to_string(),
            recipient_id,
            sender_id,
            encrypted_payload,
            message_type,
            file_reference: None,
            created_at_secs: now,
            expires_at_secs: now.saturating_add(ttl.as_secs()),
        }
    }
}

// ============================================================================
// Store
// ============================================================================

/// SQLite-backed relay store.
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Opens or creates the database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;

        // WAL lets readers proceed while the writer holds the lock.
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;
             PRAGMA foreign_keys=ON;
             PRAGMA cache_size=10000;",
        )?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                username TEXT NOT NULL UNIQUE,
                identity_public_key TEXT NOT NULL,
                registration_id INTEGER NOT NULL,
                created_at_secs INTEGER NOT NULL,
                updated_at_secs INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS devices (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                device_id TEXT NOT NULL,
                identity_public_key TEXT NOT NULL,
                registration_id INTEGER NOT NULL,
                device_name TEXT,
                fcm_token TEXT,
                last_seen_secs INTEGER NOT NULL,
                created_at_secs INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_devices_user ON devices(user_id);
            CREATE TABLE IF NOT EXISTS signed_pre_keys (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                key_id INTEGER NOT NULL,
                public_key TEXT NOT NULL,
                signature TEXT NOT NULL,
                created_at_secs INTEGER NOT NULL,
                UNIQUE(user_id, key_id)
            );
            CREATE TABLE IF NOT EXISTS one_time_pre_keys (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                key_id INTEGER NOT NULL,
                public_key TEXT NOT NULL,
                created_at_secs INTEGER NOT NULL,
                UNIQUE(user_id, key_id)
            );
            CREATE TABLE IF NOT EXISTS auth_challenges (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                nonce TEXT NOT NULL,
                expires_at_secs INTEGER NOT NULL,
                created_at_secs INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_challenges_user ON auth_challenges(user_id);
            CREATE TABLE IF NOT EXISTS queued_messages (
                id TEXT PRIMARY KEY,
                recipient_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                sender_id TEXT NOT NULL,
                encrypted_payload BLOB NOT NULL,
                message_type TEXT NOT NULL,
                file_reference TEXT,
                created_at_secs INTEGER NOT NULL,
                expires_at_secs INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_queue_recipient
                ON queued_messages(recipient_id, created_at_secs);
            CREATE INDEX IF NOT EXISTS idx_queue_expiry
                ON queued_messages(expires_at_secs);",
        )?;

        Ok(Store {
            conn: Mutex::new(conn),
        })
    }

    /// Creates an in-memory database (for testing).
    pub fn in_memory() -> Result<Self, StoreError> {
        Self::open(":memory:")
    }

    // ========================================================================
    // Users
    // ========================================================================

    pub fn create_user(
        &self,
        username: &str,
        identity_public_key: &str,
        registration_id: u32,
    ) -> Result<UserRecord, StoreError> {
        let conn = self.conn.lock().unwrap();
        let now = now_unix_s();
        let record = UserRecord {
            id: uuid::Uuid::new_v4().to_string(),
            username: username.to_string(),
            identity_public_key: identity_public_key.to_string(),
            registration_id,
            created_at_secs: now,
            updated_at_secs: now,
        };

        let result = conn.execute(
            "INSERT INTO users (id, username, identity_public_key, registration_id,
                                created_at_secs, updated_at_secs)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                record.id,
                record.username,
                record.identity_public_key,
                record.registration_id as i64,
                record.created_at_secs as i64,
                record.updated_at_secs as i64,
            ],
        );

        match result {
            Ok(_) => Ok(record),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(StoreError::DuplicateUsername)
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn user_by_username(&self, username: &str) -> Result<Option<UserRecord>, StoreError> {
        let conn = self.conn.lock().unwrap();
        Self::query_user(
            &conn,
            "SELECT id, username, identity_public_key, registration_id,
                    created_at_secs, updated_at_secs
             FROM users WHERE username = ?1",
            username,
        )
    }

    pub fn user_by_id(&self, user_id: &str) -> Result<Option<UserRecord>, StoreError> {
        let conn = self.conn.lock().unwrap();
        Self::query_user(
            &conn,
            "SELECT id, username, identity_public_key, registration_id,
                    created_at_secs, updated_at_secs
             FROM users WHERE id = ?1",
            user_id,
        )
    }

    fn query_user(
        conn: &Connection,
        sql: &str,
        param: &str,
    ) -> Result<Option<UserRecord>, StoreError> {
        let mut stmt = conn.prepare(sql)?;
        let mut rows = stmt.query_map(params![param], |row| {
            Ok(UserRecord {
                id: row.get(0)?,
                username: row.get(1)?,
                identity_public_key: row.get(2)?,
                registration_id: row.get::<_, i64>(3)? as u32,
                created_at_secs: row.get::<_, i64>(4)? as u64,
                updated_at_secs: row.get::<_, i64>(5)? as u64,
            })
        })?;
        rows.next().transpose().map_err(Into::into)
    }

    /// Replaces a user's identity key. Returns false when the user is unknown.
    pub fn rotate_identity_key(
        &self,
        user_id: &str,
        identity_public_key: &str,
    ) -> Result<bool, StoreError> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE users SET identity_public_key = ?2, updated_at_secs = ?3 WHERE id = ?1",
            params![user_id, identity_public_key, now_unix_s() as i64],
        )?;
        Ok(changed > 0)
    }

    /// Deletes a user and everything the user owns: devices, pre-keys, and
    /// challenges cascade via foreign keys; queue rows where the user is the
    /// sender are removed explicitly.
    pub fn delete_user(&self, user_id: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM queued_messages WHERE sender_id = ?1",
            params![user_id],
        )?;
        let changed = tx.execute("DELETE FROM users WHERE id = ?1", params![user_id])?;
        tx.commit()?;
        Ok(changed > 0)
    }

    // ========================================================================
    // Devices (at most one per user)
    // ========================================================================

    /// Atomically replaces all of a user's device rows with the new device.
    pub fn replace_device(
        &self,
        user_id: &str,
        device: NewDevice,
    ) -> Result<DeviceRecord, StoreError> {
        let mut conn = self.conn.lock().unwrap();
        let now = now_unix_s();
        let record = DeviceRecord {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            device_id: device.device_id,
            identity_public_key: device.identity_public_key,
            registration_id: device.registration_id,
            device_name: device.device_name,
            fcm_token: device.fcm_token,
            last_seen_secs: now,
            created_at_secs: now,
        };

        let tx = conn.transaction()?;
        tx.execute("DELETE FROM devices WHERE user_id = ?1", params![user_id])?;
        tx.execute(
            "INSERT INTO devices (id, user_id, device_id, identity_public_key,
                                  registration_id, device_name, fcm_token,
                                  last_seen_secs, created_at_secs)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                record.id,
                record.user_id,
                record.device_id,
                record.identity_public_key,
                record.registration_id as i64,
                record.device_name,
                record.fcm_token,
                record.last_seen_secs as i64,
                record.created_at_secs as i64,
            ],
        )?;
        tx.commit()?;
        Ok(record)
    }

    pub fn device_exists(&self, user_id: &str, device_id: &str) -> Result<bool, StoreError> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM devices WHERE user_id = ?1 AND device_id = ?2",
            params![user_id, device_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Returns true when the user has any active device.
    pub fn has_device(&self, user_id: &str) -> Result<bool, StoreError> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM devices WHERE user_id = ?1",
            params![user_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Removes the device row. Idempotent; returns whether a row existed.
    pub fn delete_device(&self, user_id: &str, device_id: &str) -> Result<bool, StoreError> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "DELETE FROM devices WHERE user_id = ?1 AND device_id = ?2",
            params![user_id, device_id],
        )?;
        Ok(changed > 0)
    }

    pub fn touch_device(&self, user_id: &str, device_id: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE devices SET last_seen_secs = ?3 WHERE user_id = ?1 AND device_id = ?2",
            params![user_id, device_id, now_unix_s() as i64],
        )?;
        Ok(())
    }

    #[cfg(test)]
    fn device_count(&self, user_id: &str) -> usize {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT COUNT(*) FROM devices WHERE user_id = ?1",
            params![user_id],
            |row| row.get::<_, i64>(0),
        )
        .unwrap_or(0) as usize
    }

    // ========================================================================
    // Signed pre-keys
    // ========================================================================

    pub fn upsert_signed_pre_key(
        &self,
        user_id: &str,
        key_id: u32,
        public_key: &str,
        signature: &str,
    ) -> Result<SignedPreKeyRecord, StoreError> {
        let conn = self.conn.lock().unwrap();
        let now = now_unix_s();
        let id = uuid::Uuid::new_v4().to_string();
        // OR REPLACE re-inserts the row, so a re-uploaded key_id also becomes
        // the most recent one.
        conn.execute(
            "INSERT OR REPLACE INTO signed_pre_keys (id, user_id, key_id, public_key,
                                                     signature, created_at_secs)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![id, user_id, key_id as i64, public_key, signature, now as i64],
        )?;

        let mut stmt = conn.prepare(
            "SELECT id, user_id, key_id, public_key, signature, created_at_secs
             FROM signed_pre_keys WHERE user_id = ?1 AND key_id = ?2",
        )?;
        let record = stmt.query_row(params![user_id, key_id as i64], Self::signed_pre_key_row)?;
        Ok(record)
    }

    pub fn latest_signed_pre_key(
        &self,
        user_id: &str,
    ) -> Result<Option<SignedPreKeyRecord>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, user_id, key_id, public_key, signature, created_at_secs
             FROM signed_pre_keys WHERE user_id = ?1
             ORDER BY created_at_secs DESC, rowid DESC LIMIT 1",
        )?;
        let mut rows = stmt.query_map(params![user_id], Self::signed_pre_key_row)?;
        rows.next().transpose().map_err(Into::into)
    }

    /// Keeps the `keep` most recent signed pre-keys; reaps the rest.
    pub fn reap_signed_pre_keys(&self, user_id: &str, keep: usize) -> Result<usize, StoreError> {
        let conn = self.conn.lock().unwrap();
        let removed = conn.execute(
            "DELETE FROM signed_pre_keys
             WHERE user_id = ?1 AND id NOT IN (
                 SELECT id FROM signed_pre_keys WHERE user_id = ?1
                 ORDER BY created_at_secs DESC, rowid DESC LIMIT ?2
             )",
            params![user_id, keep as i64],
        )?;
        Ok(removed)
    }

    fn signed_pre_key_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SignedPreKeyRecord> {
        Ok(SignedPreKeyRecord {
            id: row.get(0)?,
            user_id: row.get(1)?,
            key_id: row.get::<_, i64>(2)? as u32,
            public_key: row.get(3)?,
            signature: row.get(4)?,
            created_at_secs: row.get::<_, i64>(5)? as u64,
        })
    }

    // ========================================================================
    // One-time pre-keys
    // ========================================================================

    /// Batch-inserts one-time pre-keys; re-uploading an existing key_id
    /// replaces its public key.
    pub fn add_one_time_pre_keys(
        &self,
        user_id: &str,
        keys: &[(u32, String)],
    ) -> Result<usize, StoreError> {
        let mut conn = self.conn.lock().unwrap();
        let now = now_unix_s();
        let tx = conn.transaction()?;
        for (key_id, public_key) in keys {
            tx.execute(
                "INSERT OR REPLACE INTO one_time_pre_keys (id, user_id, key_id, public_key,
                                                           created_at_secs)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    uuid::Uuid::new_v4().to_string(),
                    user_id,
                    *key_id as i64,
                    public_key,
                    now as i64
                ],
            )?;
        }
        tx.commit()?;
        Ok(keys.len())
    }

    /// Consumes the oldest one-time pre-key: the select and the delete happen
    /// in one transaction, so no two callers ever receive the same key.
    pub fn take_one_time_pre_key(
        &self,
        user_id: &str,
    ) -> Result<Option<OneTimePreKeyRecord>, StoreError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        let record = {
            let mut stmt = tx.prepare(
                "SELECT id, user_id, key_id, public_key, created_at_secs
                 FROM one_time_pre_keys WHERE user_id = ?1
                 ORDER BY created_at_secs ASC, rowid ASC LIMIT 1",
            )?;
            let mut rows = stmt.query_map(params![user_id], |row| {
                Ok(OneTimePreKeyRecord {
                    id: row.get(0)?,
                    user_id: row.get(1)?,
                    key_id: row.get::<_, i64>(2)? as u32,
                    public_key: row.get(3)?,
                    created_at_secs: row.get::<_, i64>(4)? as u64,
                })
            })?;
            rows.next().transpose()?
        };

        if let Some(ref record) = record {
            tx.execute(
                "DELETE FROM one_time_pre_keys WHERE id = ?1",
                params![record.id],
            )?;
        }
        tx.commit()?;
        Ok(record)
    }

    pub fn count_one_time_pre_keys(&self, user_id: &str) -> Result<u32, StoreError> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM one_time_pre_keys WHERE user_id = ?1",
            params![user_id],
            |row| row.get(0),
        )?;
        Ok(count as u32)
    }

    // ========================================================================
    // Login challenges (at most one active per user)
    // ========================================================================

    /// Deletes any prior challenges for the user and inserts a fresh one,
    /// in one transaction.
    pub fn replace_challenge(
        &self,
        user_id: &str,
        nonce: &str,
        ttl: Duration,
    ) -> Result<ChallengeRecord, StoreError> {
        let mut conn = self.conn.lock().unwrap();
        let now = now_unix_s();
        let record = ChallengeRecord {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            nonce: nonce.to_string(),
            expires_at_secs: now.saturating_add(ttl.as_secs()),
            created_at_secs: now,
        };

        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM auth_challenges WHERE user_id = ?1",
            params![user_id],
        )?;
        tx.execute(
            "INSERT INTO auth_challenges (id, user_id, nonce, expires_at_secs, created_at_secs)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                record.id,
                record.user_id,
                record.nonce,
                record.expires_at_secs as i64,
                record.created_at_secs as i64,
            ],
        )?;
        tx.commit()?;
        Ok(record)
    }

    /// Consumes the user's challenge: returns the most recent unexpired row
    /// and deletes every challenge row for the user in the same transaction.
    /// The row is gone whatever the caller decides about the signature, which
    /// is what makes a nonce single-attempt.
    pub fn take_challenge(
        &self,
        user_id: &str,
        now_secs: u64,
    ) -> Result<Option<ChallengeRecord>, StoreError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        let record = {
            let mut stmt = tx.prepare(
                "SELECT id, user_id, nonce, expires_at_secs, created_at_secs
                 FROM auth_challenges
                 WHERE user_id = ?1 AND expires_at_secs > ?2
                 ORDER BY created_at_secs DESC, rowid DESC LIMIT 1",
            )?;
            let mut rows = stmt.query_map(params![user_id, now_secs as i64], |row| {
                Ok(ChallengeRecord {
                    id: row.get(0)?,
                    user_id: row.get(1)?,
                    nonce: row.get(2)?,
                    expires_at_secs: row.get::<_, i64>(3)? as u64,
                    created_at_secs: row.get::<_, i64>(4)? as u64,
                })
            })?;
            rows.next().transpose()?
        };

        tx.execute(
            "DELETE FROM auth_challenges WHERE user_id = ?1",
            params![user_id],
        )?;
        tx.commit()?;
        Ok(record)
    }

    /// Removes expired challenge rows. Returns the number removed.
    pub fn purge_expired_challenges(&self, now_secs: u64) -> Result<usize, StoreError> {
        let conn = self.conn.lock().unwrap();
        let removed = conn.execute(
            "DELETE FROM auth_challenges WHERE expires_at_secs < ?1",
            params![now_secs as i64],
        )?;
        Ok(removed)
    }

    // ========================================================================
    // Offline message queue
    // ========================================================================

    pub fn enqueue_message(&self, message: &QueuedMessage) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO queued_messages (id, recipient_id, sender_id, encrypted_payload,
                                          message_type, file_reference, created_at_secs,
                                          expires_at_secs)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                message.id,
                message.recipient_id,
                message.sender_id,
                message.encrypted_payload,
                message.message_type.as_str(),
                message.file_reference,
                message.created_at_secs as i64,
                message.expires_at_secs as i64,
            ],
        )?;
        Ok(())
    }

    /// Drains up to `limit` of the recipient's oldest messages: selected,
    /// deleted, and returned (oldest first) in one transaction, so two
    /// concurrent drains return disjoint sets.
    pub fn drain_queue(
        &self,
        recipient_id: &str,
        limit: usize,
    ) -> Result<Vec<QueuedMessage>, StoreError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        let messages = {
            let mut stmt = tx.prepare(
                "SELECT id, recipient_id, sender_id, encrypted_payload, message_type,
                        file_reference, created_at_secs, expires_at_secs
                 FROM queued_messages WHERE recipient_id = ?1
                 ORDER BY created_at_secs ASC, rowid ASC LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![recipient_id, limit as i64], Self::queued_row)?;
            rows.collect::<Result<Vec<_>, _>>()?
        };

        for message in &messages {
            tx.execute(
                "DELETE FROM queued_messages WHERE id = ?1",
                params![message.id],
            )?;
        }
        tx.commit()?;
        Ok(messages)
    }

    /// Deletes the given messages, but only rows owned by `recipient_id`;
    /// a caller cannot erase someone else's queue.
    pub fn delete_messages(
        &self,
        recipient_id: &str,
        message_ids: &[String],
    ) -> Result<usize, StoreError> {
        if message_ids.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let mut removed = 0;
        for id in message_ids {
            removed += tx.execute(
                "DELETE FROM queued_messages WHERE id = ?1 AND recipient_id = ?2",
                params![id, recipient_id],
            )?;
        }
        tx.commit()?;
        Ok(removed)
    }

    /// Removes messages past their expiry. Returns the number removed.
    pub fn purge_expired_messages(&self, now_secs: u64) -> Result<usize, StoreError> {
        let conn = self.conn.lock().unwrap();
        let removed = conn.execute(
            "DELETE FROM queued_messages WHERE expires_at_secs < ?1",
            params![now_secs as i64],
        )?;
        Ok(removed)
    }

    /// Removes messages created before the cutoff regardless of expiry.
    pub fn purge_messages_older_than(&self, cutoff_secs: u64) -> Result<usize, StoreError> {
        let conn = self.conn.lock().unwrap();
        let removed = conn.execute(
            "DELETE FROM queued_messages WHERE created_at_secs < ?1",
            params![cutoff_secs as i64],
        )?;
        Ok(removed)
    }

    pub fn queue_depth(&self, recipient_id: &str) -> Result<u64, StoreError> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM queued_messages WHERE recipient_id = ?1",
            params![recipient_id],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    fn queued_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<QueuedMessage> {
        let type_str: String = row.get(4)?;
        Ok(QueuedMessage {
            id: row.get(0)?,
            recipient_id: row.get(1)?,
            sender_id: row.get(2)?,
            encrypted_payload: row.get(3)?,
            message_type: MessageType::parse(&type_str).unwrap_or_default(),
            file_reference: row.get(5)?,
            created_at_secs: row.get::<_, i64>(6)? as u64,
            expires_at_secs: row.get::<_, i64>(7)? as u64,
        })
    }
}

// ============================================================================
// Store Factory
// ============================================================================

/// Storage backend type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StorageBackend {
    /// SQLite in-memory storage (lost on restart, for testing/dev).
    Memory,
    /// SQLite persistent storage.
    #[default]
    Sqlite,
}

/// Opens the relay store for the configured backend.
pub fn create_store(
    backend: StorageBackend,
    data_dir: Option<&Path>,
) -> Result<Store, StoreError> {
    match backend {
        StorageBackend::Memory => Store::in_memory(),
        StorageBackend::Sqlite => {
            let path = data_dir
                .map(|d| d.join("relay.db"))
                .unwrap_or_else(|| std::path::PathBuf::from("relay.db"));
            if let Some(parent) = path.parent() {
                let _ = std::fs::create_dir_all(parent);
            }
            Store::open(&path)
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
