//! Prometheus Metrics
//!
//! Provides observability metrics for monitoring the relay server.

use prometheus::{IntCounter, IntGauge, Opts, Registry};
use std::sync::Arc;

/// Relay server metrics.
#[derive(Clone)]
pub struct RelayMetrics {
    /// Registry for all metrics.
    pub registry: Arc<Registry>,

    // Connection metrics
    /// Total WebSocket connections accepted.
    pub connections_total: IntCounter,
    /// Current active WebSocket connections.
    pub connections_active: IntGauge,
    /// Connection errors (handshake failures, etc.).
    pub connection_errors: IntCounter,

    // Authentication metrics
    /// Login challenges issued.
    pub challenges_issued: IntCounter,
    /// Successful challenge verifications.
    pub logins_ok: IntCounter,
    /// Failed authentication attempts (any cause, deliberately unsplit).
    pub auth_failures: IntCounter,

    // Relay metrics
    /// Messages pushed to a live socket.
    pub messages_delivered_online: IntCounter,
    /// Messages written to the offline queue.
    pub messages_queued: IntCounter,
    /// Messages handed out by offline fetches.
    pub messages_drained: IntCounter,
    /// Messages removed by client acknowledgements.
    pub messages_acked: IntCounter,

    // Key directory metrics
    /// Pre-key bundles served.
    pub bundles_served: IntCounter,
    /// One-time pre-keys consumed by bundle fetches.
    pub one_time_keys_consumed: IntCounter,

    // Rate limiting
    /// Requests rate limited.
    pub rate_limited: IntCounter,
}

impl RelayMetrics {
    /// Creates a new metrics instance with all counters registered.
    pub fn new() -> Self {
        let registry = Registry::new();

        let connections_total = IntCounter::with_opts(Opts::new(
            "relay_connections_total",
            "Total WebSocket connections accepted",
        ))
        .unwrap();

        let connections_active = IntGauge::with_opts(Opts::new(
            "relay_connections_active",
            "Current active WebSocket connections",
        ))
        .unwrap();

        let connection_errors = IntCounter::with_opts(Opts::new(
            "relay_connection_errors_total",
            "Total connection errors",
        ))
        .unwrap();

        let challenges_issued = IntCounter::with_opts(Opts::new(
            "relay_auth_challenges_issued_total",
            "Login challenges issued",
        ))
        .unwrap();

        let logins_ok = IntCounter::with_opts(Opts::new(
            "relay_auth_logins_total",
            "Successful challenge verifications",
        ))
        .unwrap();

        let auth_failures = IntCounter::with_opts(Opts::new(
            "relay_auth_failures_total",
            "Failed authentication attempts",
        ))
        .unwrap();

        let messages_delivered_online = IntCounter::with_opts(Opts::new(
            "relay_messages_delivered_online_total",
            "Messages pushed to a live socket",
        ))
        .unwrap();

        let messages_queued = IntCounter::with_opts(Opts::new(
            "relay_messages_queued_total",
            "Messages written to the offline queue",
        ))
        .unwrap();

        let messages_drained = IntCounter::with_opts(Opts::new(
            "relay_messages_drained_total",
            "Messages handed out by offline fetches",
        ))
        .unwrap();

        let messages_acked = IntCounter::with_opts(Opts::new(
            "relay_messages_acked_total",
            "Messages removed by client acknowledgements",
        ))
        .unwrap();

        let bundles_served = IntCounter::with_opts(Opts::new(
            "relay_bundles_served_total",
            "Pre-key bundles served",
        ))
        .unwrap();

        let one_time_keys_consumed = IntCounter::with_opts(Opts::new(
            "relay_one_time_keys_consumed_total",
            "One-time pre-keys consumed by bundle fetches",
        ))
        .unwrap();

        let rate_limited = IntCounter::with_opts(Opts::new(
            "relay_rate_limited_total",
            "Total requests rate limited",
        ))
        .unwrap();

        registry
            .register(Box::new(connections_total.clone()))
            .unwrap();
        registry
            .register(Box::new(connections_active.clone()))
            .unwrap();
        registry
            .register(Box::new(connection_errors.clone()))
            .unwrap();
        registry
            .register(Box::new(challenges_issued.clone()))
            .unwrap();
        registry.register(Box::new(logins_ok.clone())).unwrap();
        registry.register(Box::new(auth_failures.clone())).unwrap();
        registry
            .register(Box::new(messages_delivered_online.clone()))
            .unwrap();
        registry
            .register(Box::new(messages_queued.clone()))
            .unwrap();
        registry
            .register(Box::new(messages_drained.clone()))
            .unwrap();
        registry
            .register(Box::new(messages_acked.clone()))
            .unwrap();
        registry
            .register(Box::new(bundles_served.clone()))
            .unwrap();
        registry
            .register(Box::new(one_time_keys_consumed.clone()))
            .unwrap();
        registry.register(Box::new(rate_limited.clone())).unwrap();

        RelayMetrics {
            registry: Arc::new(registry),
            connections_total,
            connections_active,
            connection_errors,
            challenges_issued,
            logins_ok,
            auth_failures,
            messages_delivered_online,
            messages_queued,
            messages_drained,
            messages_acked,
            bundles_served,
            one_time_keys_consumed,
            rate_limited,
        }
    }

    /// Encodes all metrics in Prometheus text format.
    pub fn encode(&self) -> String {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer).unwrap_or(());
        String::from_utf8(buffer).unwrap_or_default()
    }
}

impl Default for RelayMetrics {
    fn default() -> Self {
        Self::new()
    }
}
