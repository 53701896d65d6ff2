// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! WebSocket Connection Handler
//!
//! Handles individual client connections. The first frame must be a
//! `Handshake` carrying the session token under `auth.token`; the token is
//! verified through the auth engine, which also re-checks that the device
//! row still exists. A connection that authenticates registers itself in
//! the session registry (kicking any previous socket for the same session)
//! and then mostly listens: ciphertext is pushed to it as `new_message`
//! frames, while inbound traffic is limited to pings and close.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, warn};

use crate::auth::AuthEngine;
use crate::session_registry::SessionRegistry;

/// Wire protocol message types.
pub mod protocol {
    use serde::{Deserialize, Serialize};

    use crate::store::MessageType;

    pub const PROTOCOL_VERSION: u8 = 1;
    pub const FRAME_HEADER_SIZE: usize = 4;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct MessageEnvelope {
        pub version: u8,
        pub message_id: String,
        pub timestamp: u64,
        pub payload: MessagePayload,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    #[serde(tag = "type", rename_all = "snake_case")]
    pub enum MessagePayload {
        Handshake(Handshake),
        // The event itself carries a "type" field, so it nests under
        // "message" instead of flattening into the tagged envelope.
        NewMessage { message: NewMessageEvent },
        #[serde(other)]
        Unknown,
    }

    /// First frame of every connection.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct Handshake {
        pub auth: HandshakeAuth,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct HandshakeAuth {
        pub token: String,
    }

    /// Server-to-client delivery of relayed ciphertext.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct NewMessageEvent {
        pub sender_id: String,
        pub ciphertext: String,
        #[serde(rename = "type")]
        pub message_type: MessageType,
        /// ISO-8601 send time.
        pub timestamp: String,
    }

    /// Decodes a message from binary data (with length prefix).
    pub fn decode_message(data: &[u8]) -> Result<MessageEnvelope, String> {
        if data.len() < FRAME_HEADER_SIZE {
            return Err("Frame too short".to_string());
        }

        let json = &data[FRAME_HEADER_SIZE..];
        serde_json::from_slice(json).map_err(|e| e.to_string())
    }

    /// Encodes a message to binary data (with length prefix).
    pub fn encode_message(envelope: &MessageEnvelope) -> Result<Vec<u8>, String> {
        let json = serde_json::to_vec(envelope).map_err(|e| e.to_string())?;
        let len = json.len() as u32;

        let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + json.len());
        frame.extend_from_slice(&len.to_be_bytes());
        frame.extend_from_slice(&json);

        Ok(frame)
    }

    fn now_unix_s() -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs()
    }

    /// Builds an encoded `new_message` delivery frame.
    pub fn new_message_frame(
        sender_id: &str,
        ciphertext: &str,
        message_type: MessageType,
        timestamp: &str,
    ) -> Result<Vec<u8>, String> {
        encode_message(&MessageEnvelope {
            version: PROTOCOL_VERSION,
            message_id: uuid::Uuid::new_v4().to_string(),
            timestamp: now_unix_s(),
            payload: MessagePayload::NewMessage {
                message: NewMessageEvent {
                    sender_id: sender_id.to_string(),
                    ciphertext: ciphertext.to_string(),
                    message_type,
                    timestamp: timestamp.to_string(),
                },
            },
        })
    }
}

/// Everything a connection task needs.
pub struct ConnectionDeps {
    pub auth: Arc<AuthEngine>,
    pub registry: Arc<SessionRegistry>,
    pub max_message_size: usize,
    pub idle_timeout: Duration,
}

/// Handles a WebSocket connection end to end.
pub async fn handle_connection(ws_stream: WebSocketStream<TcpStream>, deps: ConnectionDeps) {
    let (mut write, mut read) = ws_stream.split();

    // Wait for the authenticating handshake (with timeout).
    let token = match timeout(deps.idle_timeout, read.next()).await {
        Ok(Some(Ok(Message::Binary(data)))) => match protocol::decode_message(&data) {
            Ok(envelope) => {
                if let protocol::MessagePayload::Handshake(hs) = envelope.payload {
                    hs.auth.token
                } else {
                    warn!("Expected Handshake as first frame");
                    return;
                }
            }
            Err(e) => {
                warn!("Failed to decode handshake: {}", e);
                return;
            }
        },
        Ok(Some(Ok(_))) => {
            warn!("Expected binary message for handshake");
            return;
        }
        Ok(Some(Err(e))) => {
            warn!("Error reading handshake: {}", e);
            return;
        }
        Ok(None) => {
            debug!("Connection closed before handshake");
            return;
        }
        Err(_) => {
            warn!("Handshake timeout (slowloris protection)");
            return;
        }
    };

    // Token verification includes the device-row re-check, so a session
    // revoked by a newer login cannot open a socket.
    let claims = match deps.auth.verify_bearer(&token) {
        Ok(claims) => claims,
        Err(_) => {
            warn!("Socket handshake authentication failed");
            return;
        }
    };

    let socket_id = uuid::Uuid::new_v4().to_string();
    let mut pushes = deps
        .registry
        .register(&claims.user_id, &claims.device_id, &socket_id);

    debug!("Socket registered for user {}", claims.user_id);

    loop {
        tokio::select! {
            push = pushes.recv() => {
                match push {
                    Some(msg) => {
                        if write.send(Message::Binary(msg.data)).await.is_err() {
                            debug!("Socket write failed, closing");
                            break;
                        }
                    }
                    // Channel closed: a newer login took over this session.
                    None => {
                        debug!("Session superseded, closing old socket");
                        let _ = write.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
            incoming = timeout(deps.idle_timeout, read.next()) => {
                let msg = match incoming {
                    Ok(Some(msg)) => msg,
                    Ok(None) => {
                        debug!("Client disconnected");
                        break;
                    }
                    Err(_) => {
                        warn!("Idle timeout (slowloris protection)");
                        break;
                    }
                };

                match msg {
                    Ok(Message::Binary(data)) => {
                        if data.len() > deps.max_message_size {
                            warn!("Frame too large: {} bytes", data.len());
                            continue;
                        }
                        // Clients send ciphertext over the HTTP API; inbound
                        // frames beyond a duplicate handshake are ignored.
                        if let Ok(envelope) = protocol::decode_message(&data) {
                            debug!("Ignoring inbound frame: {:?}", envelope.payload);
                        }
                    }
                    Ok(Message::Ping(data)) => {
                        let _ = write.send(Message::Pong(data)).await;
                    }
                    Ok(Message::Close(_)) => {
                        debug!("Client sent close");
                        break;
                    }
                    Ok(_) => {
                        // Ignore text, pong, etc.
                    }
                    Err(e) => {
                        warn!("Socket error: {}", e);
                        break;
                    }
                }
            }
        }
    }

    // Only the socket that owns the entry may remove it; a replaced socket's
    // late exit leaves the newer session untouched.
    deps.registry
        .unregister(&claims.user_id, &claims.device_id, &socket_id);
}

#[cfg(test)]
mod tests {
    use super::protocol::*;
    use crate::store::MessageType;

    #[test]
    fn test_frame_roundtrip() {
        let envelope = MessageEnvelope {
            version: PROTOCOL_VERSION,
            message_id: "msg-1".to_string(),
            timestamp: 12345,
            payload: MessagePayload::Handshake(Handshake {
                auth: HandshakeAuth {
                    token: "tok".to_string(),
                },
            }),
        };

        let frame = encode_message(&envelope).unwrap();
        let decoded = decode_message(&frame).unwrap();
        assert_eq!(decoded.message_id, "msg-1");
        match decoded.payload {
            MessagePayload::Handshake(hs) => assert_eq!(hs.auth.token, "tok"),
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn test_handshake_carries_token_under_auth() {
        // The wire shape is {"type":"handshake","auth":{"token":...}}.
        let json = serde_json::json!({
            "version": 1,
            "message_id": "m",
            "timestamp": 0,
            "payload": {"type": "handshake", "auth": {"token": "secret-token"}}
        });
        let mut frame = Vec::new();
        let body = serde_json::to_vec(&json).unwrap();
        frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
        frame.extend_from_slice(&body);

        let decoded = decode_message(&frame).unwrap();
        match decoded.payload {
            MessagePayload::Handshake(hs) => assert_eq!(hs.auth.token, "secret-token"),
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn test_new_message_frame_shape() {
        let frame =
            new_message_frame("sender-1", "aGVsbG8=", MessageType::KeyExchange, "2026-01-01T00:00:00Z")
                .unwrap();
        let decoded = decode_message(&frame).unwrap();
        match decoded.payload {
            MessagePayload::NewMessage { message: event } => {
                assert_eq!(event.sender_id, "sender-1");
                assert_eq!(event.ciphertext, "aGVsbG8=");
                assert_eq!(event.message_type, MessageType::KeyExchange);
                assert_eq!(event.timestamp, "2026-01-01T00:00:00Z");
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn test_short_frame_rejected() {
        assert!(decode_message(&[0, 0]).is_err());
    }

    #[test]
    fn test_unknown_payload_tolerated() {
        let json = serde_json::json!({
            "version": 1,
            "message_id": "m",
            "timestamp": 0,
            "payload": {"type": "SomethingNew"}
        });
        let body = serde_json::to_vec(&json).unwrap();
        let mut frame = Vec::new();
        frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
        frame.extend_from_slice(&body);

        let decoded = decode_message(&frame).unwrap();
        assert!(matches!(decoded.payload, MessagePayload::Unknown));
    }
}
