// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Courier Relay Server
//!
//! Relay and key directory for an end-to-end encrypted messaging service.
//! Provides:
//! - Challenge-response login with single-session enforcement
//! - Pre-key bundle directory with one-time-key consumption
//! - Online push + store-and-forward message relay
//! - Scheduled maintenance of challenges and the offline queue

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use tokio::net::TcpListener;
use tokio_tungstenite::accept_async;
use tracing::{error, info};

use courier_relay::auth::AuthEngine;
use courier_relay::config::RelayConfig;
use courier_relay::connection_limit::ConnectionLimiter;
use courier_relay::file_store::{FileStore, LocalFileStore};
use courier_relay::http::{create_router, AppState, RateLimiters};
use courier_relay::key_directory::KeyDirectory;
use courier_relay::metrics::RelayMetrics;
use courier_relay::relay::RelayEngine;
use courier_relay::scheduler::Scheduler;
use courier_relay::session_registry::SessionRegistry;
use courier_relay::store::create_store;
use courier_relay::token::TokenSigner;
use courier_relay::ws;

#[tokio::main]
async fn main() {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("courier_relay=info".parse().unwrap()),
        )
        .init();

    // Load configuration; refuse to start on fatal misconfiguration.
    let config = RelayConfig::from_env();
    if let Err(msg) = config.validate() {
        error!("Configuration error: {}", msg);
        std::process::exit(1);
    }

    info!(
        "Starting Courier Relay Server v{}",
        env!("CARGO_PKG_VERSION")
    );
    info!("HTTP API: {}", config.api_addr);
    info!("WebSocket: {}", config.ws_addr);
    info!("Storage backend: {:?}", config.storage_backend);
    info!("Session token TTL: {}", config.token_ttl_spec);

    let store = match create_store(config.storage_backend, Some(&config.data_dir)) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!("Failed to open relay store: {}", e);
            std::process::exit(1);
        }
    };

    let files: Arc<dyn FileStore> = match LocalFileStore::open(&config.data_dir) {
        Ok(files) => Arc::new(files),
        Err(e) => {
            error!("Failed to open file store: {}", e);
            std::process::exit(1);
        }
    };

    let signer = TokenSigner::new(&config.jwt_secret);
    let auth = Arc::new(AuthEngine::new(
        store.clone(),
        signer,
        config.token_ttl(),
        config.low_key_threshold,
    ));
    let directory = Arc::new(KeyDirectory::new(store.clone()));
    let registry = Arc::new(SessionRegistry::new());
    let relay = Arc::new(RelayEngine::new(store.clone(), registry.clone()));
    let metrics = RelayMetrics::new();
    let limiters = Arc::new(RateLimiters::default());
    let connection_limiter = ConnectionLimiter::new(config.max_connections);

    // Maintenance jobs: challenge expiry and queue retention.
    let scheduler = Scheduler::new(store.clone());
    scheduler.start();

    // Periodically drop idle rate-limiter buckets.
    let cleanup_limiters = limiters.clone();
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(std::time::Duration::from_secs(600)).await;
            let removed = cleanup_limiters
                .challenge
                .cleanup_inactive(std::time::Duration::from_secs(1800))
                + cleanup_limiters
                    .verify
                    .cleanup_inactive(std::time::Duration::from_secs(1800))
                + cleanup_limiters
                    .logout
                    .cleanup_inactive(std::time::Duration::from_secs(1800))
                + cleanup_limiters
                    .api
                    .cleanup_inactive(std::time::Duration::from_secs(1800))
                + cleanup_limiters
                    .files
                    .cleanup_inactive(std::time::Duration::from_secs(1800));
            if removed > 0 {
                info!("Cleaned up {} stale rate limiter entries", removed);
            }
        }
    });

    // HTTP API server.
    let state = AppState {
        auth: auth.clone(),
        directory,
        relay,
        store,
        files,
        metrics: metrics.clone(),
        limiters,
        metrics_token: config.metrics_token.clone(),
        started_at: Instant::now(),
    };
    let router = create_router(state);
    let api_addr = config.api_addr;

    let api_listener = match TcpListener::bind(&api_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind HTTP listener on {}: {}", api_addr, e);
            std::process::exit(1);
        }
    };

    tokio::spawn(async move {
        info!("HTTP API listening on {}", api_addr);
        if let Err(e) = axum::serve(
            api_listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        {
            error!("HTTP server failed: {}", e);
        }
    });

    // WebSocket listener.
    let ws_listener = match TcpListener::bind(&config.ws_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind WebSocket listener on {}: {}", config.ws_addr, e);
            std::process::exit(1);
        }
    };

    info!("WebSocket server listening on {}", config.ws_addr);

    let idle_timeout = config.idle_timeout();
    let max_message_size = config.max_message_size;

    while let Ok((stream, _addr)) = ws_listener.accept().await {
        // Enforce connection limit
        let connection_guard = match connection_limiter.try_acquire() {
            Some(guard) => guard,
            None => {
                tracing::warn!(
                    "Connection rejected: at max capacity ({}/{})",
                    connection_limiter.active_count(),
                    config.max_connections
                );
                metrics.connection_errors.inc();
                drop(stream);
                continue;
            }
        };

        let auth = auth.clone();
        let registry = registry.clone();
        let metrics = metrics.clone();

        tokio::spawn(async move {
            // Keep the guard alive for the duration of the connection
            let _guard = connection_guard;

            // Bound the upgrade itself so half-open sockets cannot pile up.
            match tokio::time::timeout(idle_timeout, accept_async(stream)).await {
                Ok(Ok(ws_stream)) => {
                    metrics.connections_total.inc();
                    metrics.connections_active.inc();

                    ws::handle_connection(
                        ws_stream,
                        ws::ConnectionDeps {
                            auth,
                            registry,
                            max_message_size,
                            idle_timeout,
                        },
                    )
                    .await;

                    metrics.connections_active.dec();
                    info!("WebSocket connection closed");
                }
                Ok(Err(e)) => {
                    error!("WebSocket handshake failed: {}", e);
                    metrics.connection_errors.inc();
                }
                Err(_) => {
                    tracing::warn!("WebSocket handshake timeout (slowloris protection)");
                    metrics.connection_errors.inc();
                }
            }
            // _guard dropped here, releasing the connection slot
        });
    }
}
