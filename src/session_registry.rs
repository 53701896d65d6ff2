// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Session Registry
//!
//! Tracks connected clients so the relay can push ciphertext to a recipient
//! that is currently online. One user owns at most one device, so the
//! registry holds at most one entry per user at any instant.
//!
//! Registering a key that is already present replaces the old entry and
//! drops its sender, which closes the old socket task's channel; that is
//! how a new login kicks the previous connection. Removal is guarded by the
//! socket id so a late disconnect event from a replaced socket cannot evict
//! the session that superseded it.

use std::collections::HashMap;
use std::sync::RwLock;

use tokio::sync::mpsc;

/// A frame queued for delivery to a connected client.
#[derive(Debug, Clone)]
pub struct PushMessage {
    /// The encoded binary frame to send over the socket.
    pub data: Vec<u8>,
}

/// One connected device session.
struct SessionEntry {
    user_id: String,
    device_id: String,
    socket_id: String,
    sender: mpsc::Sender<PushMessage>,
}

/// Identity of a connected session, as seen by lookups.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub user_id: String,
    pub device_id: String,
    pub socket_id: String,
}

fn session_key(user_id: &str, device_id: &str) -> String {
    format!("{user_id}:{device_id}")
}

/// Thread-safe registry of connected device sessions.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, SessionEntry>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        SessionRegistry {
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Registers a session and returns the receiving end of its push channel.
    ///
    /// Any existing entry under the same key is replaced; its sender is
    /// dropped, so the superseded socket task sees its channel close.
    pub fn register(
        &self,
        user_id: &str,
        device_id: &str,
        socket_id: &str,
    ) -> mpsc::Receiver<PushMessage> {
        let (tx, rx) = mpsc::channel(64);
        let entry = SessionEntry {
            user_id: user_id.to_string(),
            device_id: device_id.to_string(),
            socket_id: socket_id.to_string(),
            sender: tx,
        };
        let mut sessions = self.sessions.write().unwrap();
        sessions.insert(session_key(user_id, device_id), entry);
        rx
    }

    /// Removes the session only when `socket_id` still identifies it.
    /// Returns whether an entry was removed.
    pub fn unregister(&self, user_id: &str, device_id: &str, socket_id: &str) -> bool {
        let key = session_key(user_id, device_id);
        let mut sessions = self.sessions.write().unwrap();
        match sessions.get(&key) {
            Some(entry) if entry.socket_id == socket_id => {
                sessions.remove(&key);
                true
            }
            _ => false,
        }
    }

    /// Queues a frame for a connected session. Returns false when the session
    /// is absent or its socket task is gone (closed or backed-up channel).
    pub fn try_push(&self, user_id: &str, device_id: &str, msg: PushMessage) -> bool {
        let sessions = self.sessions.read().unwrap();
        match sessions.get(&session_key(user_id, device_id)) {
            Some(entry) => entry.sender.try_send(msg).is_ok(),
            None => false,
        }
    }

    pub fn is_online(&self, user_id: &str, device_id: &str) -> bool {
        let sessions = self.sessions.read().unwrap();
        sessions.contains_key(&session_key(user_id, device_id))
    }

    /// Returns the socket id bound to a session, if connected.
    pub fn socket_of(&self, user_id: &str, device_id: &str) -> Option<String> {
        let sessions = self.sessions.read().unwrap();
        sessions
            .get(&session_key(user_id, device_id))
            .map(|e| e.socket_id.clone())
    }

    /// Returns the user's connected session, if any. With one device per
    /// user this is a singleton at most.
    pub fn any_online_device_of(&self, user_id: &str) -> Option<SessionInfo> {
        let sessions = self.sessions.read().unwrap();
        sessions
            .values()
            .find(|e| e.user_id == user_id)
            .map(|e| SessionInfo {
                user_id: e.user_id.clone(),
                device_id: e.device_id.clone(),
                socket_id: e.socket_id.clone(),
            })
    }

    pub fn connected_count(&self) -> usize {
        let sessions = self.sessions.read().unwrap();
        sessions.len()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
