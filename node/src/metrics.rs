//! Prometheus metrics for the validator.
//!
//! [`NodeMetrics`] owns a dedicated [`Registry`]; [`NodeMetrics::encode`]
//! renders it in the Prometheus text exposition format for whatever surface
//! exports it.

use prometheus::{
    register_int_counter_with_registry, register_int_gauge_with_registry, Encoder, IntCounter,
    IntGauge, Opts, Registry, TextEncoder,
};

pub struct NodeMetrics {
    pub registry: Registry,

    // ── Counters ────────────────────────────────────────────────────────
    /// Blocks finalized through our own witness.
    pub blocks_committed: IntCounter,
    /// Blocks appended on the catch-up path.
    pub blocks_added: IntCounter,
    /// Revolts this node started.
    pub revolts: IntCounter,
    pub messages_received: IntCounter,
    /// Messages dropped because handling them failed.
    pub messages_dropped: IntCounter,
    /// Block database jobs that failed.
    pub db_failures: IntCounter,

    // ── Gauges ──────────────────────────────────────────────────────────
    pub height: IntGauge,
    pub round: IntGauge,
}

impl NodeMetrics {
    /// Create a fresh set of metrics under a new [`Registry`].
    ///
    /// # Panics
    ///
    /// Registration only fails on duplicate names, which would be a bug here.
    pub fn new() -> Self {
        let registry = Registry::new();

        let blocks_committed = register_int_counter_with_registry!(
            Opts::new(
                "strata_blocks_committed_total",
                "Blocks committed with a locally collected witness"
            ),
            registry
        )
        .expect("failed to register blocks_committed counter");

        let blocks_added = register_int_counter_with_registry!(
            Opts::new(
                "strata_blocks_added_total",
                "Finalized blocks fetched from peers and appended"
            ),
            registry
        )
        .expect("failed to register blocks_added counter");

        let revolts = register_int_counter_with_registry!(
            Opts::new("strata_revolts_total", "Revolts started by this node"),
            registry
        )
        .expect("failed to register revolts counter");

        let messages_received = register_int_counter_with_registry!(
            Opts::new(
                "strata_messages_received_total",
                "Peer messages received"
            ),
            registry
        )
        .expect("failed to register messages_received counter");

        let messages_dropped = register_int_counter_with_registry!(
            Opts::new(
                "strata_messages_dropped_total",
                "Peer messages dropped during handling"
            ),
            registry
        )
        .expect("failed to register messages_dropped counter");

        let db_failures = register_int_counter_with_registry!(
            Opts::new(
                "strata_db_failures_total",
                "Failed block database operations"
            ),
            registry
        )
        .expect("failed to register db_failures counter");

        let height = register_int_gauge_with_registry!(
            Opts::new("strata_height", "Height currently being worked on"),
            registry
        )
        .expect("failed to register height gauge");

        let round = register_int_gauge_with_registry!(
            Opts::new("strata_round", "Current round within the height"),
            registry
        )
        .expect("failed to register round gauge");

        Self {
            registry,
            blocks_committed,
            blocks_added,
            revolts,
            messages_received,
            messages_dropped,
            db_failures,
            height,
            round,
        }
    }

    /// Render every metric in the Prometheus text format.
    pub fn encode(&self) -> String {
        let mut buf = Vec::new();
        if let Err(e) = TextEncoder::new().encode(&self.registry.gather(), &mut buf) {
            tracing::warn!(error = %e, "failed to encode metrics");
        }
        String::from_utf8_lossy(&buf).into_owned()
    }
}

impl Default for NodeMetrics {
    fn default() -> Self {
        Self::new()
    }
}
