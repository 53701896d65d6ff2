// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Relay Engine
//!
//! Decides between live push and store-and-forward for each message, drains
//! the offline queue, and applies client acknowledgements.
//!
//! A registry entry whose socket task has gone away is treated the same as
//! an offline recipient: the push fails, the message is queued, and the
//! recipient picks it up on the next fetch. The queue write commits before
//! `send` returns, so nothing is lost in that race.

use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{TimeZone, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::session_registry::{PushMessage, SessionRegistry};
use crate::store::{MessageType, QueuedMessage, Store, StoreError};
use crate::ws::protocol;

/// Upper bound on the base64 ciphertext length accepted by `send`.
pub const MAX_CIPHERTEXT_LEN: usize = 65_536;

/// How long queued messages are retained before the reaper removes them.
pub const QUEUE_TTL: Duration = Duration::from_secs(30 * 24 * 3600);

/// Largest number of messages a single offline fetch may drain.
pub const MAX_FETCH_LIMIT: usize = 100;

#[derive(Debug)]
pub enum RelayError {
    BadRequest(&'static str),
    /// Recipient has no registered device.
    RecipientUnknown,
    Store(StoreError),
}

impl Display for RelayError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BadRequest(msg) => write!(f, "bad request: {msg}"),
            Self::RecipientUnknown => write!(f, "recipient unknown"),
            Self::Store(e) => write!(f, "storage failure: {e}"),
        }
    }
}

impl Error for RelayError {}

impl From<StoreError> for RelayError {
    fn from(e: StoreError) -> Self {
        RelayError::Store(e)
    }
}

/// Result of a `send`: pushed live, or queued under `message_id`.
#[derive(Debug, Clone, Serialize)]
pub struct SendOutcome {
    pub delivered: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
}

/// A drained offline message, payload re-encoded for transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OfflineMessage {
    pub id: String,
    pub sender_id: String,
    pub ciphertext: String,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_reference: Option<String>,
    pub created_at: String,
}

/// Checks the canonical base64 alphabet with at most two trailing pads.
fn is_canonical_base64(s: &str) -> bool {
    let trimmed = s.trim_end_matches('=');
    if s.len() - trimmed.len() > 2 {
        return false;
    }
    trimmed
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '+' || c == '/')
}

fn iso_timestamp(secs: u64) -> String {
    Utc.timestamp_opt(secs as i64, 0)
        .single()
        .unwrap_or_default()
        .to_rfc3339()
}

pub struct RelayEngine {
    store: Arc<Store>,
    registry: Arc<SessionRegistry>,
}

impl RelayEngine {
    pub fn new(store: Arc<Store>, registry: Arc<SessionRegistry>) -> Self {
        RelayEngine { store, registry }
    }

    /// Relays a message: live push when the recipient's socket is up,
    /// otherwise a queue write.
    pub fn send(
        &self,
        sender_id: &str,
        recipient_id: &str,
        ciphertext: &str,
        message_type: MessageType,
    ) -> Result<SendOutcome, RelayError> {
        if recipient_id == sender_id {
            return Err(RelayError::BadRequest("cannot send to self"));
        }
        if ciphertext.len() > MAX_CIPHERTEXT_LEN {
            return Err(RelayError::BadRequest("ciphertext too large"));
        }
        if !is_canonical_base64(ciphertext) {
            return Err(RelayError::BadRequest("ciphertext is not base64"));
        }
        let payload = STANDARD
            .decode(ciphertext)
            .map_err(|_| RelayError::BadRequest("ciphertext is not base64"))?;

        if !self.store.has_device(recipient_id)? {
            return Err(RelayError::RecipientUnknown);
        }

        // Live path: the recipient's singleton session, if its socket task
        // is still accepting frames.
        if let Some(session) = self.registry.any_online_device_of(recipient_id) {
            let frame = protocol::new_message_frame(
                sender_id,
                ciphertext,
                message_type,
                &Utc::now().to_rfc3339(),
            );
            if let Ok(data) = frame {
                if self
                    .registry
                    .try_push(&session.user_id, &session.device_id, PushMessage { data })
                {
                    debug!("pushed message to online recipient");
                    return Ok(SendOutcome {
                        delivered: true,
                        message_id: None,
                    });
                }
            }
            debug!("registry entry stale, falling back to queue");
        }

        let message = QueuedMessage::new(
            recipient_id.to_string(),
            sender_id.to_string(),
            payload,
            message_type,
            QUEUE_TTL,
        );
        self.store.enqueue_message(&message)?;
        Ok(SendOutcome {
            delivered: false,
            message_id: Some(message.id),
        })
    }

    /// Drains up to `limit` queued messages for the recipient, oldest first.
    /// Drained rows are gone; an immediate second fetch returns nothing.
    pub fn fetch_offline(
        &self,
        recipient_id: &str,
        limit: usize,
    ) -> Result<Vec<OfflineMessage>, RelayError> {
        let limit = limit.clamp(1, MAX_FETCH_LIMIT);
        let drained = self.store.drain_queue(recipient_id, limit)?;
        Ok(drained
            .into_iter()
            .map(|m| OfflineMessage {
                id: m.id,
                sender_id: m.sender_id,
                ciphertext: STANDARD.encode(&m.encrypted_payload),
                message_type: m.message_type,
                file_reference: m.file_reference,
                created_at: iso_timestamp(m.created_at_secs),
            })
            .collect())
    }

    /// Deletes acknowledged messages; only rows owned by the caller are
    /// touched. Returns the number removed.
    pub fn ack_delete(
        &self,
        recipient_id: &str,
        message_ids: &[String],
    ) -> Result<usize, RelayError> {
        if message_ids.is_empty() {
            return Err(RelayError::BadRequest("no message ids"));
        }
        Ok(self.store.delete_messages(recipient_id, message_ids)?)
    }
}
