//! Relay Server Configuration
//!
//! Configuration loaded from environment variables. `validate()` is the
//! startup gate: a production deployment running on the default token
//! secret, or a malformed token TTL, refuses to boot.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::store::StorageBackend;

/// The out-of-the-box token secret. Fine for local development, fatal in
/// production.
pub const DEFAULT_JWT_SECRET: &str = "dev-secret-change-me";

const DEFAULT_TOKEN_TTL: &str = "7d";

/// Relay server configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address the HTTP API listens on.
    pub api_addr: SocketAddr,
    /// Address the WebSocket listener binds.
    pub ws_addr: SocketAddr,
    /// Data directory for persistent storage.
    pub data_dir: PathBuf,
    /// Storage backend (memory or sqlite).
    pub storage_backend: StorageBackend,
    /// Maximum concurrent WebSocket connections.
    pub max_connections: usize,
    /// Maximum WebSocket frame size in bytes.
    pub max_message_size: usize,
    /// Idle timeout in seconds (for slowloris protection).
    pub idle_timeout_secs: u64,
    /// Symmetric secret for session-token signing (`JWT_SECRET`).
    pub jwt_secret: String,
    /// Session-token lifetime spec (`JWT_EXPIRES_IN`, `\d+[smhd]`).
    pub token_ttl_spec: String,
    /// Below this many one-time pre-keys, logins carry a replenish hint.
    pub low_key_threshold: u32,
    /// Production mode: tightens the startup checks.
    pub production: bool,
    /// Optional bearer token protecting the metrics endpoint.
    pub metrics_token: Option<String>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        RelayConfig {
            api_addr: "0.0.0.0:8080".parse().unwrap(),
            ws_addr: "0.0.0.0:8081".parse().unwrap(),
            data_dir: PathBuf::from("./data"),
            storage_backend: StorageBackend::Sqlite,
            max_connections: 1000,
            max_message_size: 1_048_576, // 1 MB
            idle_timeout_secs: 300,      // 5 minutes (slowloris protection)
            jwt_secret: DEFAULT_JWT_SECRET.to_string(),
            token_ttl_spec: DEFAULT_TOKEN_TTL.to_string(),
            low_key_threshold: 20,
            production: false,
            metrics_token: None,
        }
    }
}

impl RelayConfig {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("COURIER_API_ADDR") {
            if let Ok(parsed) = addr.parse() {
                config.api_addr = parsed;
            }
        }

        if let Ok(addr) = std::env::var("COURIER_WS_ADDR") {
            if let Ok(parsed) = addr.parse() {
                config.ws_addr = parsed;
            }
        }

        if let Ok(val) = std::env::var("COURIER_DATA_DIR") {
            config.data_dir = PathBuf::from(val);
        }

        if let Ok(val) = std::env::var("COURIER_STORAGE_BACKEND") {
            config.storage_backend = match val.to_lowercase().as_str() {
                "memory" => StorageBackend::Memory,
                _ => StorageBackend::Sqlite,
            };
        }

        if let Ok(val) = std::env::var("COURIER_MAX_CONNECTIONS") {
            if let Ok(parsed) = val.parse() {
                config.max_connections = parsed;
            }
        }

        if let Ok(val) = std::env::var("COURIER_MAX_MESSAGE_SIZE") {
            if let Ok(parsed) = val.parse() {
                config.max_message_size = parsed;
            }
        }

        if let Ok(val) = std::env::var("COURIER_IDLE_TIMEOUT") {
            if let Ok(parsed) = val.parse() {
                config.idle_timeout_secs = parsed;
            }
        }

        if let Ok(val) = std::env::var("JWT_SECRET") {
            if !val.is_empty() {
                config.jwt_secret = val;
            }
        }

        if let Ok(val) = std::env::var("JWT_EXPIRES_IN") {
            if !val.is_empty() {
                config.token_ttl_spec = val;
            }
        }

        if let Ok(val) = std::env::var("COURIER_LOW_KEY_THRESHOLD") {
            if let Ok(parsed) = val.parse() {
                config.low_key_threshold = parsed;
            }
        }

        if let Ok(val) = std::env::var("COURIER_PRODUCTION") {
            config.production = val == "true" || val == "1";
        }

        config.metrics_token = std::env::var("COURIER_METRICS_TOKEN").ok();

        config
    }

    /// Checks the fatal misconfigurations. Startup must not proceed on Err.
    pub fn validate(&self) -> Result<(), String> {
        if self.production && self.jwt_secret == DEFAULT_JWT_SECRET {
            return Err(
                "JWT_SECRET is still the development default; set a real secret in production"
                    .to_string(),
            );
        }
        if parse_duration_spec(&self.token_ttl_spec).is_none() {
            return Err(format!(
                "JWT_EXPIRES_IN is malformed: {:?} (expected e.g. 30m, 12h, 7d)",
                self.token_ttl_spec
            ));
        }
        Ok(())
    }

    /// Returns the parsed session-token lifetime.
    ///
    /// Falls back to the default spec; `validate()` has already rejected a
    /// malformed override before this is called.
    pub fn token_ttl(&self) -> Duration {
        parse_duration_spec(&self.token_ttl_spec)
            .or_else(|| parse_duration_spec(DEFAULT_TOKEN_TTL))
            .unwrap_or(Duration::from_secs(7 * 24 * 3600))
    }

    /// Returns the idle timeout as a Duration.
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

/// Parses a `\d+[smhd]` duration spec like `120s`, `30m`, `12h`, or `7d`.
pub fn parse_duration_spec(spec: &str) -> Option<Duration> {
    if spec.len() < 2 {
        return None;
    }
    let (count, unit) = spec.split_at(spec.len() - 1);
    if count.is_empty() || !count.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let count: u64 = count.parse().ok()?;
    let seconds = match unit {
        "s" => count,
        "m" => count.checked_mul(60)?,
        "h" => count.checked_mul(3600)?,
        "d" => count.checked_mul(24 * 3600)?,
        _ => return None,
    };
    Some(Duration::from_secs(seconds))
}
